// `tsuku list`: installed tools, their versions, and which one is active.

use colored::Colorize;

use crate::commands::Runtime;
use crate::error::Result;
use crate::libs::state_management::StateStore;
use crate::log_info;

pub fn run(runtime: &Runtime) -> Result<()> {
    let store = StateStore::new(&runtime.settings);
    let state = store.load_readonly()?;

    if state.tools.is_empty() {
        log_info!("[List] Nothing installed under {}", runtime.settings.home.display());
        return Ok(());
    }

    eprintln!();
    for (name, tool_state) in &state.tools {
        eprintln!("{}", name.bold());
        for (version, version_state) in &tool_state.versions {
            let marker = if version == &tool_state.active_version {
                "*".bright_green().to_string()
            } else {
                " ".to_string()
            };
            eprintln!(
                "  {} {}  installed {}  [{}]",
                marker,
                version,
                version_state.installed_at,
                version_state.binaries.join(", ").cyan()
            );
        }
    }
    Ok(())
}
