// The action registry: the catalog of everything a recipe step can do.
//
// Actions come in two kinds. *Primitives* are atomic and executable; they
// are the only thing that ever appears in an installation plan. *Composites*
// are authoring sugar: during evaluation each composite decomposes into
// further steps until only primitives remain.
//
// Every action implements the same trait. Parameter extraction is one
// function per action (its `Params::from_table`), shared between preflight
// and execute, so validation and execution cannot drift apart.
//
// The registry itself is built once behind a OnceLock and never mutated
// afterwards; lookups hand out shared references.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use crate::error::{Result, TsukuError, ValidationIssue};
use crate::libs::cancel::CancelToken;
use crate::libs::config::Settings;
use crate::libs::utilities::platform::Platform;
use crate::libs::utilities::templates::TemplateVars;
use crate::schemas::recipe::Step;

pub mod build;
pub mod download;
pub mod ecosystem;
pub mod extract;
pub mod files;
pub mod patch;
pub mod relocate;
pub mod system;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Primitive,
    Composite,
}

/// Everything decomposition can see: the resolved version, the platform,
/// and the expansion variables derived from them.
pub struct EvalContext<'a> {
    pub tool_name: &'a str,
    pub version: &'a str,
    pub vars: &'a TemplateVars,
    pub settings: &'a Settings,
    pub cancel: &'a CancelToken,
}

/// Everything a primitive can touch while executing. Single-threaded per
/// install, so collected results live in RefCells rather than locks.
pub struct ExecutionContext<'a> {
    /// Scratch directory; downloads land and archives unpack here.
    pub workspace: &'a Path,
    /// The staged tool directory. Becomes `tools/<name>-<version>` only
    /// when the whole install commits.
    pub tool_dir: &'a Path,
    pub settings: &'a Settings,
    pub platform: &'a Platform,
    pub cancel: &'a CancelToken,
    pub tool_name: &'a str,
    pub version: &'a str,
    /// Install dirs of runtime dependencies, keyed by dep name.
    pub dependency_dirs: BTreeMap<String, PathBuf>,
    /// Binary names recorded by `install_binaries`, in order.
    pub binaries: RefCell<Vec<String>>,
    /// User-facing instruction text collected from instruction actions.
    pub instructions: RefCell<Vec<String>>,
    /// Environment overrides accumulated by `setup_build_env` and applied
    /// to every subsequent subprocess.
    pub build_env: RefCell<BTreeMap<String, String>>,
    /// Extra PATH entries (dependency bin dirs) for subprocesses.
    pub exec_paths: Vec<PathBuf>,
}

impl ExecutionContext<'_> {
    /// The environment subprocesses inherit: accumulated overrides plus a
    /// PATH with dependency bin dirs prepended.
    pub fn subprocess_env(&self) -> BTreeMap<String, String> {
        let mut env = self.build_env.borrow().clone();
        if !self.exec_paths.is_empty() {
            let mut parts: Vec<String> =
                self.exec_paths.iter().map(|p| p.display().to_string()).collect();
            if let Ok(existing) = std::env::var("PATH") {
                parts.push(existing);
            }
            env.insert("PATH".to_string(), parts.join(":"));
        }
        env
    }

    pub fn record_binary(&self, name: &str) {
        self.binaries.borrow_mut().push(name.to_string());
    }

    pub fn record_instruction(&self, text: String) {
        self.instructions.borrow_mut().push(text);
    }
}

/// One named operation. Implementations are stateless; all inputs arrive
/// through the parameter table and the context.
pub trait Action: Send + Sync {
    fn name(&self) -> &'static str;
    fn kind(&self) -> ActionKind;

    /// Parameter-only validation: extract and check, no I/O, no side
    /// effects. Shares its extraction path with `execute`/`decompose`.
    fn preflight(&self, params: &toml::Table) -> Result<()>;

    /// Performs the operation. Only called on primitives, with fully
    /// resolved parameters out of a plan.
    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()>;

    /// Expands a composite into its constituent steps. Primitives are
    /// never asked.
    fn decompose(&self, _ctx: &EvalContext, _params: &toml::Table) -> Result<Vec<Step>> {
        Err(TsukuError::Execution {
            command: self.name().to_string(),
            reason: "primitive actions do not decompose".to_string(),
        })
    }

    /// Eval-phase hook for ecosystem primitives: resolve the dependency
    /// set and return the lockfile contents to pin into the plan.
    fn capture_locks(
        &self,
        _ctx: &EvalContext,
        _params: &toml::Table,
    ) -> Result<Option<BTreeMap<String, String>>> {
        Ok(None)
    }

    /// User-facing text for instruction actions (`apt_install` and kin).
    fn describe(&self, _params: &toml::Table) -> Option<String> {
        None
    }

    /// Whether this action pins its own version (so a recipe using it may
    /// omit the `[version]` table).
    fn infers_version(&self) -> bool {
        false
    }
}

/// Ecosystem primitives: executable, but non-deterministic because they
/// invoke an external toolchain. A plan containing any of these is marked
/// `deterministic = false`.
pub const ECOSYSTEM_PRIMITIVES: &[&str] = &[
    "go_build",
    "cargo_build",
    "npm_exec",
    "pip_install",
    "pip_exec",
    "gem_exec",
    "cpan_install",
    "nix_realize",
];

pub fn is_ecosystem_primitive(name: &str) -> bool {
    ECOSYSTEM_PRIMITIVES.contains(&name)
}

type Registry = BTreeMap<&'static str, Arc<dyn Action>>;

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn build_registry() -> Registry {
    let mut map: Registry = BTreeMap::new();
    let mut add = |action: Arc<dyn Action>| {
        let previous = map.insert(action.name(), action);
        debug_assert!(previous.is_none(), "duplicate action registration");
    };

    download::register(&mut add);
    extract::register(&mut add);
    files::register(&mut add);
    patch::register(&mut add);
    relocate::register(&mut add);
    system::register(&mut add);
    ecosystem::register(&mut add);
    build::register(&mut add);

    map
}

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(build_registry)
}

/// Looks up an action by name.
pub fn lookup(name: &str) -> Option<Arc<dyn Action>> {
    registry().get(name).cloned()
}

pub fn is_primitive(name: &str) -> bool {
    registry().get(name).map(|a| a.kind() == ActionKind::Primitive).unwrap_or(false)
}

/// Whether any registered action that infers versions matches this name.
pub fn action_infers_version(name: &str) -> bool {
    registry().get(name).map(|a| a.infers_version()).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Parameter extraction helpers shared by the action modules.
// ---------------------------------------------------------------------------

/// Builds the single-issue Validation error preflight reports.
pub(crate) fn param_error(field: &str, message: impl Into<String>) -> TsukuError {
    TsukuError::Validation(vec![ValidationIssue::new(field, message)])
}

pub(crate) fn require_str(params: &toml::Table, key: &str) -> Result<String> {
    match params.get(key) {
        Some(toml::Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(toml::Value::String(_)) => Err(param_error(key, "must not be empty")),
        Some(_) => Err(param_error(key, "must be a string")),
        None => Err(param_error(key, "is required")),
    }
}

pub(crate) fn optional_str(params: &toml::Table, key: &str) -> Result<Option<String>> {
    match params.get(key) {
        None => Ok(None),
        Some(toml::Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(param_error(key, "must be a string")),
    }
}

pub(crate) fn require_str_list(params: &toml::Table, key: &str) -> Result<Vec<String>> {
    let list = optional_str_list(params, key)?;
    match list {
        Some(items) if !items.is_empty() => Ok(items),
        Some(_) => Err(param_error(key, "must not be empty")),
        None => Err(param_error(key, "is required")),
    }
}

pub(crate) fn optional_str_list(params: &toml::Table, key: &str) -> Result<Option<Vec<String>>> {
    match params.get(key) {
        None => Ok(None),
        Some(toml::Value::Array(items)) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item.as_str() {
                    Some(s) => out.push(s.to_string()),
                    None => return Err(param_error(key, "must be a list of strings")),
                }
            }
            Ok(Some(out))
        }
        Some(_) => Err(param_error(key, "must be a list of strings")),
    }
}

pub(crate) fn optional_u32(params: &toml::Table, key: &str) -> Result<Option<u32>> {
    match params.get(key) {
        None => Ok(None),
        Some(toml::Value::Integer(i)) if *i >= 0 && *i <= u32::MAX as i64 => Ok(Some(*i as u32)),
        Some(_) => Err(param_error(key, "must be a non-negative integer")),
    }
}

pub(crate) fn optional_bool(params: &toml::Table, key: &str) -> Result<Option<bool>> {
    match params.get(key) {
        None => Ok(None),
        Some(toml::Value::Boolean(b)) => Ok(Some(*b)),
        Some(_) => Err(param_error(key, "must be a boolean")),
    }
}

/// Checks a relative-path parameter for traversal at lexical time.
pub(crate) fn require_safe_rel_path(params: &toml::Table, key: &str) -> Result<String> {
    let value = require_str(params, key)?;
    if Path::new(&value).is_absolute() {
        return Err(param_error(key, "must be a relative path"));
    }
    if value.split('/').any(|part| part == "..") {
        return Err(param_error(key, "must not contain '..'"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_the_core_primitives() {
        for name in [
            "download_file",
            "extract",
            "chmod",
            "install_binaries",
            "install_libraries",
            "link_dependencies",
            "set_env",
            "set_rpath",
            "apply_patch_file",
            "text_replace",
            "homebrew_relocate",
            "require_command",
            "require_system",
            "setup_build_env",
            "run_build",
            "manual",
        ] {
            assert!(is_primitive(name), "{name} should be a primitive");
        }
    }

    #[test]
    fn registry_knows_the_composites() {
        for name in [
            "download",
            "download_archive",
            "github_archive",
            "github_file",
            "hashicorp_release",
            "fossil_archive",
            "apply_patch",
            "homebrew",
            "go_install",
            "cargo_install",
            "npm_install",
            "pipx_install",
            "gem_install",
            "cpan_module",
            "nix_install",
            "configure_make",
            "cmake_build",
            "meson_build",
        ] {
            let action = lookup(name).unwrap_or_else(|| panic!("{name} not registered"));
            assert_eq!(action.kind(), ActionKind::Composite, "{name} should be a composite");
        }
    }

    #[test]
    fn ecosystem_primitives_are_primitives_and_flagged() {
        for name in ECOSYSTEM_PRIMITIVES {
            assert!(is_primitive(name), "{name} should be registered as a primitive");
            assert!(is_ecosystem_primitive(name));
        }
        assert!(!is_ecosystem_primitive("download_file"));
    }

    #[test]
    fn instruction_actions_are_registered() {
        for name in [
            "apt_install",
            "brew_install",
            "brew_cask",
            "dnf_install",
            "pacman_install",
            "zypper_install",
            "apk_install",
            "apt_repo",
            "apt_ppa",
            "dnf_repo",
            "group_add",
            "service_enable",
            "service_start",
        ] {
            assert!(is_primitive(name), "{name} should be a primitive");
        }
    }

    #[test]
    fn unknown_actions_are_unknown() {
        assert!(lookup("teleport_binary").is_none());
        assert!(!is_primitive("teleport_binary"));
    }

    #[test]
    fn ecosystem_composites_infer_versions() {
        for name in ["go_install", "cargo_install", "npm_install", "pipx_install"] {
            assert!(action_infers_version(name), "{name} should infer versions");
        }
        assert!(!action_infers_version("download_archive"));
    }
}
