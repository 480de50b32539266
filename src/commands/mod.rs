// Subcommand entry points. Each module exposes a `run` function taking the
// shared `Runtime` (settings, platform, cancellation) plus its own
// arguments, and returns the crate Result; main maps errors to exit codes.

use std::path::{Path, PathBuf};

use crate::error::{Result, TsukuError};
use crate::libs::cancel::CancelToken;
use crate::libs::config::Settings;
use crate::libs::recipe_loading::load_recipe_file;
use crate::libs::utilities::platform::Platform;
use crate::schemas::recipe::Recipe;

pub mod eval;
pub mod info;
pub mod install;
pub mod list;
pub mod uninstall;
pub mod verify;
pub mod versions;
pub mod which;

/// Everything a subcommand needs about the invocation environment.
pub struct Runtime {
    pub settings: Settings,
    pub platform: Platform,
    pub cancel: CancelToken,
}

impl Runtime {
    pub fn from_env() -> Self {
        Self {
            settings: Settings::from_env(),
            platform: Platform::detect(),
            cancel: CancelToken::new(),
        }
    }
}

/// Finds a recipe by name: an explicit path wins, then the user's local
/// overrides under `$TSUKU_HOME/recipes/`.
pub fn find_recipe(runtime: &Runtime, reference: &str) -> Result<Recipe> {
    let as_path = Path::new(reference);
    if as_path.extension().is_some() && as_path.exists() {
        return load_recipe_file(as_path);
    }
    let local = recipe_path(&runtime.settings, reference);
    if local.exists() {
        return load_recipe_file(&local);
    }
    Err(TsukuError::Validation(vec![crate::error::ValidationIssue::new(
        "recipe",
        format!(
            "no recipe for '{reference}'; looked for {}",
            local.display()
        ),
    )]))
}

pub fn recipe_path(settings: &Settings, name: &str) -> PathBuf {
    settings.recipes_dir().join(format!("{name}.toml"))
}

/// Dependency loader closure shared by eval and install.
pub fn dependency_loader(settings: &Settings) -> impl Fn(&str) -> Result<Recipe> + '_ {
    move |name: &str| {
        let path = recipe_path(settings, name);
        if !path.exists() {
            return Err(TsukuError::MissingBuildDependency {
                name: name.to_string(),
                reason: format!("no recipe at {}", path.display()),
            });
        }
        load_recipe_file(&path)
    }
}
