// `tsuku info <tool>`: recipe metadata plus installed state for one tool.

use colored::Colorize;

use crate::commands::{Runtime, find_recipe};
use crate::error::Result;
use crate::libs::state_management::StateStore;

pub fn run(runtime: &Runtime, tool: &str) -> Result<()> {
    eprintln!();
    match find_recipe(runtime, tool) {
        Ok(recipe) => {
            let metadata = &recipe.metadata;
            eprintln!("{}  {}", metadata.name.bold(), metadata.description);
            if let Some(homepage) = &metadata.homepage {
                eprintln!("  homepage: {}", homepage.cyan());
            }
            if let Some(version) = &recipe.version {
                eprintln!("  version source: {}", version.source);
            }
            eprintln!("  steps: {}", recipe.steps.len());
            if !metadata.dependencies.is_empty() {
                eprintln!("  dependencies: {}", metadata.dependencies.join(", "));
            }
            if !metadata.runtime_dependencies.is_empty() {
                eprintln!("  runtime deps: {}", metadata.runtime_dependencies.join(", "));
            }
            if !metadata.build_dependencies.is_empty() {
                eprintln!("  build deps: {}", metadata.build_dependencies.join(", "));
            }
        }
        Err(_) => {
            eprintln!("{}  (no local recipe)", tool.bold());
        }
    }

    let store = StateStore::new(&runtime.settings);
    let state = store.load_readonly()?;
    match state.tools.get(tool) {
        Some(tool_state) => {
            eprintln!("  installed: {}", "yes".green());
            eprintln!("  active version: {}", tool_state.active_version.bold());
            let versions: Vec<&str> =
                tool_state.versions.keys().map(String::as_str).collect();
            eprintln!("  versions: {}", versions.join(", "));
        }
        None => {
            eprintln!("  installed: {}", "no".yellow());
        }
    }
    Ok(())
}
