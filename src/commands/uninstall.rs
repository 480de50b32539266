// `tsuku uninstall <tool> [--version <v>]`: remove one version (default
// the active one); the last version removed drops the tool entirely.

use crate::commands::Runtime;
use crate::error::{Result, TsukuError};
use crate::libs::plan_executor::PlanExecutor;
use crate::libs::state_management::StateStore;
use crate::log_info;

pub fn run(runtime: &Runtime, tool: &str, version: Option<&str>) -> Result<()> {
    let store = StateStore::new(&runtime.settings);

    let target_version = match version {
        Some(v) => v.to_string(),
        None => store
            .load_readonly()?
            .active_version_of(tool)
            .map(str::to_string)
            .ok_or_else(|| TsukuError::State(format!("'{tool}' is not installed")))?,
    };

    let executor = PlanExecutor::new(&runtime.settings, &runtime.platform, &runtime.cancel);
    executor.uninstall(tool, &target_version, &store)?;
    log_info!("[Uninstall] Removed {} {}", tool, target_version);
    Ok(())
}
