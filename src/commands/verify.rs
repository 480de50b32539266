// `tsuku verify [tool]`: run the three verification layers against one
// installed tool (or all of them) and print a per-layer report. Standalone
// verification is read-only and non-fatal unless --strict is given, in
// which case any failure surfaces as a Verify error for the exit code.

use colored::Colorize;

use crate::commands::{Runtime, find_recipe};
use crate::error::{Result, TsukuError};
use crate::libs::state_management::StateStore;
use crate::libs::verifier::{self, FileIntegrity, LayerOutcome, VerifyReport};
use crate::log_info;

pub fn run(runtime: &Runtime, tool: Option<&str>, strict: bool) -> Result<()> {
    let store = StateStore::new(&runtime.settings);
    let state = store.load_readonly()?;

    let targets: Vec<String> = match tool {
        Some(name) => {
            if !state.tools.contains_key(name) {
                return Err(TsukuError::State(format!("'{name}' is not installed")));
            }
            vec![name.to_string()]
        }
        None => state.tools.keys().cloned().collect(),
    };
    if targets.is_empty() {
        log_info!("[Verify] Nothing installed");
        return Ok(());
    }

    let mut all_passed = true;
    for name in &targets {
        let tool_state = state.tools.get(name).expect("listed from state");
        // The recipe supplies the verify command; verification still runs
        // without one (path + integrity layers only).
        let verify_spec = find_recipe(runtime, name).ok().and_then(|r| r.verify);

        let report = verifier::verify_tool(
            name,
            tool_state,
            verify_spec.as_ref(),
            &runtime.settings,
            &runtime.cancel,
        )?;
        print_report(&report);
        all_passed &= report.passed();
    }

    if strict && !all_passed {
        return Err(TsukuError::Verify("one or more verification layers failed".to_string()));
    }
    Ok(())
}

fn print_report(report: &VerifyReport) {
    eprintln!();
    eprintln!("{} {} {}", "==".bright_blue(), report.tool.bold(), report.version);
    print_layer("Version", &report.version_check);
    print_layer("Path", &report.path_check);

    if report.integrity_skipped {
        eprintln!("  Integrity: {}", "SKIPPED (no recorded checksums)".yellow());
        return;
    }
    for (path, verdict) in &report.integrity {
        match verdict {
            FileIntegrity::Ok => {
                eprintln!("  Integrity: {} {}", "OK".green(), path);
            }
            FileIntegrity::Modified { expected, actual } => {
                eprintln!(
                    "  Integrity: {} {}\n    expected {}\n    actual   {}",
                    "MODIFIED".red().bold(),
                    path,
                    expected,
                    actual
                );
            }
            FileIntegrity::Error(reason) => {
                eprintln!("  Integrity: {} {} ({})", "ERROR".red(), path, reason);
            }
        }
    }
}

fn print_layer(label: &str, outcome: &LayerOutcome) {
    match outcome {
        LayerOutcome::Ok(detail) => {
            eprintln!("  {label}: {} ({detail})", "OK".green());
        }
        LayerOutcome::Failed(reason) => {
            eprintln!("  {label}: {} ({reason})", "FAILED".red().bold());
        }
        LayerOutcome::Skipped(reason) => {
            eprintln!("  {label}: {} ({reason})", "SKIPPED".yellow());
        }
    }
}
