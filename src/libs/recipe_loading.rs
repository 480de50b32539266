// Recipe loading and validation. Loading parses TOML bytes into a
// `Recipe`, folds nested step params, and stamps the document hash.
// Validation runs two passes, structural (shape, names, lexical path
// safety) and semantic (registry lookups and per-action preflight), and
// reports every finding at once. A recipe is either fully valid or the
// caller sees the complete error list; nothing partially valid escapes.

use std::path::Path;

use crate::actions;
use crate::error::{Result, TsukuError, ValidationIssue};
use crate::libs::utilities::checksum::sha256_bytes;
use crate::schemas::recipe::{Recipe, Step, ToolType, VerifyMode, valid_name, parse_dependency};
use crate::{log_debug, log_warn};

/// The outcome of validation: all errors, plus non-fatal warnings.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationIssue::new(field, message));
    }
}

/// Loads and fully validates a recipe from TOML text. Warnings are logged;
/// errors abort with the aggregated `Validation` error.
pub fn load_recipe_str(text: &str) -> Result<Recipe> {
    let mut recipe: Recipe = toml::from_str(text).map_err(|e| {
        TsukuError::Validation(vec![ValidationIssue::new("recipe", format!("TOML parse error: {e}"))])
    })?;
    for step in &mut recipe.steps {
        step.normalize();
    }
    recipe.hash = sha256_bytes(text.as_bytes());

    let result = validate(&recipe);
    for warning in &result.warnings {
        log_warn!("[Recipe] {}: {warning}", recipe.metadata.name);
    }
    if !result.valid() {
        return Err(TsukuError::Validation(result.errors));
    }
    log_debug!(
        "[Recipe] Loaded '{}' ({} steps, hash {})",
        recipe.metadata.name,
        recipe.steps.len(),
        &recipe.hash[..12]
    );
    Ok(recipe)
}

/// Loads a recipe from a file path.
pub fn load_recipe_file(path: &Path) -> Result<Recipe> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        TsukuError::Validation(vec![ValidationIssue::new(
            "recipe",
            format!("cannot read {}: {e}", path.display()),
        )])
    })?;
    load_recipe_str(&text)
}

/// Runs both validation passes without failing; used by `load_recipe_str`
/// and exposed for `tsuku lint`-style callers that want the full report.
pub fn validate(recipe: &Recipe) -> ValidationResult {
    let mut result = ValidationResult::default();
    validate_structure(recipe, &mut result);
    validate_semantics(recipe, &mut result);
    result
}

// ---------------------------------------------------------------------------
// Pass 1: structure
// ---------------------------------------------------------------------------

const KNOWN_OSES: &[&str] = &["linux", "darwin"];
const KNOWN_ARCHES: &[&str] = &["amd64", "arm64"];

/// Parameters that name files and must stay inside the workspace. Checked
/// lexically here; the execution-time guard re-checks the resolved path.
const PATH_PARAMS: &[&str] = &["dest", "archive", "file", "patch", "target", "source_dir"];

fn validate_structure(recipe: &Recipe, result: &mut ValidationResult) {
    let metadata = &recipe.metadata;

    if !valid_name(&metadata.name) {
        result.error("metadata.name", "must match ^[a-z0-9][a-z0-9-]*$");
    }
    if metadata.description.trim().is_empty() {
        result.error("metadata.description", "must not be empty");
    }

    if let Some(platforms) = &metadata.platforms {
        for (index, tuple) in platforms.iter().enumerate() {
            if !valid_platform_tuple(tuple) {
                result.error(
                    format!("metadata.platforms[{index}]"),
                    format!("'{tuple}' is not a valid os/arch tuple"),
                );
            }
        }
    }

    for (list_name, entries) in [
        ("metadata.dependencies", &metadata.dependencies),
        ("metadata.runtime_dependencies", &metadata.runtime_dependencies),
        ("metadata.build_dependencies", &metadata.build_dependencies),
    ] {
        for (index, entry) in entries.iter().enumerate() {
            let (name, _) = parse_dependency(entry);
            if !valid_name(name) {
                result.error(
                    format!("{list_name}[{index}]"),
                    format!("'{entry}' is not a valid dependency name"),
                );
            }
        }
    }

    if recipe.steps.is_empty() {
        result.error("steps", "at least one step is required");
    }

    match (&recipe.verify, metadata.tool_type) {
        (None, ToolType::Tool) => {
            result.error("verify", "tools must declare a verify command");
        }
        (Some(verify), _) => {
            if verify.command.trim().is_empty() {
                result.error("verify.command", "must not be empty");
            }
            if verify.mode == VerifyMode::Version {
                match &verify.pattern {
                    Some(pattern) if !pattern.contains("{version}") => {
                        result.warnings.push(
                            "verify.pattern has no {version} placeholder; \
                             the resolved version will be matched verbatim"
                                .to_string(),
                        );
                    }
                    None => {
                        result.warnings.push(
                            "verify mode is 'version' but no pattern is set".to_string(),
                        );
                    }
                    _ => {}
                }
            }
        }
        (None, ToolType::Library) => {}
    }

    for (index, step) in recipe.steps.iter().enumerate() {
        validate_step_structure(index, step, result);
    }
}

fn validate_step_structure(index: usize, step: &Step, result: &mut ValidationResult) {
    let prefix = format!("steps[{index}]");

    if step.action.trim().is_empty() {
        result.error(format!("{prefix}.action"), "must not be empty");
    }

    if let Some(when) = &step.when {
        if when.platform.is_some() && when.os.is_some() {
            result.error(
                format!("{prefix}.when"),
                "'platform' and 'os' are mutually exclusive",
            );
        }
        if let Some(tuples) = &when.platform {
            for (tuple_index, tuple) in tuples.iter().enumerate() {
                if !valid_platform_tuple(tuple) {
                    result.error(
                        format!("{prefix}.when.platform[{tuple_index}]"),
                        format!("'{tuple}' is not a valid os/arch tuple"),
                    );
                }
            }
        }
        if let Some(oses) = &when.os {
            for (os_index, os) in oses.iter().enumerate() {
                if !KNOWN_OSES.contains(&os.as_str()) {
                    result.error(
                        format!("{prefix}.when.os[{os_index}]"),
                        format!("unknown os '{os}'"),
                    );
                }
            }
        }
        // `distro` implies Linux: an os list that excludes linux can never
        // match together with a distro predicate.
        if when.distro.is_some() {
            if let Some(oses) = &when.os {
                if !oses.iter().any(|os| os == "linux") {
                    result.error(
                        format!("{prefix}.when"),
                        "'distro' implies linux, but 'os' excludes it",
                    );
                }
            }
            if let Some(tuples) = &when.platform {
                if !tuples.iter().any(|t| t.starts_with("linux/")) {
                    result.error(
                        format!("{prefix}.when"),
                        "'distro' implies linux, but 'platform' excludes it",
                    );
                }
            }
        }
        if when.is_empty() {
            result.warnings.push(format!("{prefix}.when is present but empty"));
        }
    }

    // Lexical checks on well-known parameter names. Literal URLs must be
    // https; filename parameters must not traverse.
    if let Some(url) = step.param_str("url") {
        if !url.contains('{') {
            if let Err(err) = url::Url::parse(url) {
                result.error(format!("{prefix}.params.url"), format!("unparseable URL: {err}"));
            } else if !url.starts_with("https://") {
                result.error(format!("{prefix}.params.url"), "must use https");
            }
        } else if !url.starts_with("https://") {
            result.error(format!("{prefix}.params.url"), "must use https");
        }
    }
    for key in PATH_PARAMS {
        if let Some(value) = step.param_str(key) {
            if Path::new(value).is_absolute() {
                result.error(
                    format!("{prefix}.params.{key}"),
                    "must be a relative path",
                );
            } else if value.split('/').any(|part| part == "..") {
                result.error(
                    format!("{prefix}.params.{key}"),
                    "must not contain '..'",
                );
            }
        }
    }
}

fn valid_platform_tuple(tuple: &str) -> bool {
    match tuple.split_once('/') {
        Some((os, arch)) => KNOWN_OSES.contains(&os) && KNOWN_ARCHES.contains(&arch),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// Pass 2: semantics (registry queries + per-action preflight)
// ---------------------------------------------------------------------------

fn validate_semantics(recipe: &Recipe, result: &mut ValidationResult) {
    for (index, step) in recipe.steps.iter().enumerate() {
        let prefix = format!("steps[{index}]");
        let Some(action) = actions::lookup(&step.action) else {
            if !step.action.trim().is_empty() {
                result.error(
                    format!("{prefix}.action"),
                    format!("unknown action '{}'", step.action),
                );
            }
            continue;
        };

        // Preflight shares the action's parameter extraction; re-anchor its
        // field paths under this step.
        if let Err(err) = action.preflight(&step.params) {
            match err {
                TsukuError::Validation(issues) => {
                    for issue in issues {
                        result.error(
                            format!("{prefix}.params.{}", issue.field),
                            issue.message,
                        );
                    }
                }
                other => {
                    result.error(format!("{prefix}.params"), other.to_string());
                }
            }
        }
    }

    match &recipe.version {
        Some(source) => {
            if crate::version::lookup(&source.source).is_none() {
                result.error(
                    "version.source",
                    format!(
                        "unknown source '{}'; known sources: {}",
                        source.source,
                        crate::version::known_sources().join(", ")
                    ),
                );
            }
        }
        None => {
            let inferrable =
                recipe.steps.iter().any(|s| actions::action_infers_version(&s.action));
            if !inferrable {
                result.error(
                    "version",
                    "no [version] section and no step that can infer one \
                     (ecosystem installs pin their own versions)",
                );
            }
        }
    }
}
