// `tsuku install <tool>`: the eval -> exec pipeline end to end, or replay
// of a previously exported plan with `--plan <file|->`. Exported plans and
// fresh evals execute through the same code path, so for deterministic
// plans the two routes produce identical trees.

use std::io::Read;
use std::path::Path;

use colored::Colorize;

use crate::commands::{Runtime, dependency_loader, find_recipe};
use crate::error::{Result, TsukuError};
use crate::libs::plan_executor::PlanExecutor;
use crate::libs::plan_generator::PlanGenerator;
use crate::libs::state_management::StateStore;
use crate::schemas::plan::InstallationPlan;
use crate::version::VersionRequest;
use crate::{log_info, log_warn};

pub fn run(
    runtime: &Runtime,
    tool_or_plan: &str,
    version: Option<&str>,
    plan_source: Option<&str>,
) -> Result<()> {
    let store = StateStore::new(&runtime.settings);
    let executor = PlanExecutor::new(&runtime.settings, &runtime.platform, &runtime.cancel);

    let (plan, verify, requested) = match plan_source {
        // Replay mode: the plan is the contract; no recipe is consulted.
        Some(source) => {
            let plan = read_plan(source)?;
            log_info!("[Install] Replaying plan for {} {}", plan.tool, plan.version);
            if plan.has_ecosystem_steps() {
                log_warn!(
                    "[Install] Plan contains ecosystem steps; replay is lockfile-reproducible, \
                     not bit-exact"
                );
            }
            (plan, None, "plan".to_string())
        }
        None => {
            let recipe = find_recipe(runtime, tool_or_plan)?;
            let request = VersionRequest::parse(version);
            let generator =
                PlanGenerator::new(&runtime.settings, &runtime.platform, &runtime.cancel);
            let loader = dependency_loader(&runtime.settings);
            let plan = generator.generate(&recipe, &request, &loader)?;
            let requested = version.unwrap_or("latest").to_string();
            (plan, recipe.verify.clone(), requested)
        }
    };

    let outcome = executor.install(&plan, &requested, verify.as_ref(), &store)?;

    log_info!(
        "[Install] {} {} installed; binaries: {}",
        outcome.tool.bold(),
        outcome.version,
        outcome.binaries.join(", ").cyan()
    );
    if !outcome.instructions.is_empty() {
        eprintln!();
        log_info!("[Install] Finish setup with the following manual steps:");
        for instruction in &outcome.instructions {
            eprintln!("    {}", instruction.yellow());
        }
    }
    Ok(())
}

/// Reads a plan from a file path, or stdin when the source is `-`.
fn read_plan(source: &str) -> Result<InstallationPlan> {
    let text = if source == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        std::fs::read_to_string(Path::new(source))?
    };
    serde_json::from_str(&text).map_err(|e| {
        TsukuError::Validation(vec![crate::error::ValidationIssue::new(
            "plan",
            format!("unreadable plan document: {e}"),
        )])
    })
}
