// `tsuku eval <tool>`: evaluate a recipe into an installation plan and
// print it as JSON (stdout, or a file with --output). The printed plan is
// exactly what `install --plan` replays.

use std::io::Write;
use std::path::PathBuf;

use crate::commands::{Runtime, dependency_loader, find_recipe};
use crate::error::{Result, TsukuError};
use crate::libs::plan_generator::PlanGenerator;
use crate::log_info;
use crate::version::VersionRequest;

pub fn run(runtime: &Runtime, tool: &str, version: Option<&str>, output: Option<PathBuf>) -> Result<()> {
    let recipe = find_recipe(runtime, tool)?;
    let request = VersionRequest::parse(version);

    let generator = PlanGenerator::new(&runtime.settings, &runtime.platform, &runtime.cancel);
    let loader = dependency_loader(&runtime.settings);
    let plan = generator.generate(&recipe, &request, &loader)?;

    let json = serde_json::to_string_pretty(&plan)
        .map_err(|e| TsukuError::State(format!("cannot serialize plan: {e}")))?;

    match output {
        Some(path) => {
            std::fs::write(&path, &json)?;
            log_info!("[Eval] Plan written to {}", path.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{json}")?;
        }
    }
    Ok(())
}
