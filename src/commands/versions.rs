// `tsuku versions <tool>`: list the versions the recipe's upstream source
// knows about, newest first, marking anything installed locally.

use colored::Colorize;

use crate::commands::{Runtime, find_recipe};
use crate::error::{Result, TsukuError};
use crate::libs::state_management::StateStore;
use crate::version::compare_versions;

pub fn run(runtime: &Runtime, tool: &str) -> Result<()> {
    let recipe = find_recipe(runtime, tool)?;
    let source = recipe.version.as_ref().ok_or_else(|| TsukuError::VersionResolution {
        recipe: recipe.metadata.name.clone(),
        reason: "recipe has no [version] section to query".to_string(),
    })?;
    let provider = crate::version::lookup(&source.source).ok_or_else(|| {
        TsukuError::VersionResolution {
            recipe: recipe.metadata.name.clone(),
            reason: format!("unknown version source '{}'", source.source),
        }
    })?;

    let mut versions = provider.list_versions(&recipe)?;
    versions.sort_by(|a, b| compare_versions(b, a));
    versions.dedup();

    let state = StateStore::new(&runtime.settings).load_readonly()?;
    let installed = state.tools.get(&recipe.metadata.name);

    eprintln!();
    for version in &versions {
        let marker = match installed {
            Some(tool_state) if tool_state.active_version == *version => {
                "* installed, active".bright_green().to_string()
            }
            Some(tool_state) if tool_state.versions.contains_key(version) => {
                "  installed".green().to_string()
            }
            _ => String::new(),
        };
        eprintln!("{version}  {marker}");
    }
    Ok(())
}
