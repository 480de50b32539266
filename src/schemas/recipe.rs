// Recipe Schema
// Defines the structure of a recipe: a declarative TOML document describing
// how one tool is installed. A recipe carries metadata, an optional version
// source, an ordered list of steps, and an optional verify block.
//
// Parsing is deliberately permissive at this layer: step parameters are kept
// as raw TOML tables so each action can extract and check its own parameters
// (the loader runs those preflight checks during semantic validation).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::libs::utilities::platform::Platform;

/// A fully parsed recipe. `hash` is the SHA-256 of the raw TOML bytes,
/// computed once at load time and carried along for plan provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub metadata: Metadata,
    /// Where versions come from. May be omitted when a step can infer it
    /// (e.g. ecosystem installs pin their own module version).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<VersionSource>,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifySpec>,
    /// SHA-256 of the recipe document, hex. Not part of the TOML surface.
    #[serde(skip)]
    pub hash: String,
}

/// The `[metadata]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Tool name; must match `^[a-z0-9][a-z0-9-]*$`.
    pub name: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    /// Whether this recipe installs a user-facing tool or a shared library.
    #[serde(rename = "type", default)]
    pub tool_type: ToolType,
    /// Must be installed before this tool's steps run.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Must remain installed while the tool is used.
    #[serde(default)]
    pub runtime_dependencies: Vec<String>,
    /// Installed before build steps; not recorded as runtime deps.
    #[serde(default)]
    pub build_dependencies: Vec<String>,
    /// Supported `"{os}/{arch}"` tuples. Absent means cross-platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platforms: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolType {
    #[default]
    Tool,
    Library,
}

/// The `[version]` table: a provider name plus provider-specific fields
/// (`repo` for GitHub, `formula` for Homebrew, `package` for PyPI, ...).
/// The extra fields stay untyped here; each provider extracts what it needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSource {
    pub source: String,
    #[serde(flatten)]
    pub extra: toml::Table,
}

impl VersionSource {
    /// Convenience accessor for a string-valued provider field.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }
}

/// One `[[steps]]` entry. Parameters may be written inline next to `action`
/// or nested under `[steps.params]`; `normalize` folds the latter into the
/// former so the rest of the pipeline sees a single flat table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<WhenClause>,
    #[serde(flatten)]
    pub params: toml::Table,
}

impl Step {
    /// Folds a nested `params` table into the step's flat parameter table.
    /// Inline keys win over nested ones on conflict.
    pub fn normalize(&mut self) {
        if let Some(toml::Value::Table(nested)) = self.params.remove("params") {
            for (key, value) in nested {
                self.params.entry(key).or_insert(value);
            }
        }
    }

    /// Builds a step programmatically; used by composite decomposition.
    pub fn new(action: &str, params: toml::Table) -> Self {
        Self { action: action.to_string(), when: None, params }
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }
}

/// A step predicate. All present fields must match (AND); each list is
/// OR-matched against the platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WhenClause {
    /// `"{os}/{arch}"` tuples, e.g. `"linux/amd64"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<Vec<String>>,
    /// Distro IDs as reported by /etc/os-release. Implies Linux.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distro: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linux_family: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
}

impl WhenClause {
    /// Evaluates this predicate against the detected platform.
    pub fn matches(&self, platform: &Platform) -> bool {
        if let Some(tuples) = &self.platform {
            if !tuples.iter().any(|t| t == &platform.tuple()) {
                return false;
            }
        }
        if let Some(oses) = &self.os {
            if !oses.iter().any(|o| o == &platform.os) {
                return false;
            }
        }
        if let Some(distros) = &self.distro {
            if platform.os != "linux" {
                return false;
            }
            if !distros.iter().any(|d| d == &platform.distro_id) {
                return false;
            }
        }
        if let Some(families) = &self.linux_family {
            if platform.os != "linux" {
                return false;
            }
            match &platform.linux_family {
                Some(family) => {
                    if !families.iter().any(|f| f == family) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        if let Some(manager) = &self.package_manager {
            if !platform.has_package_manager(manager) {
                return false;
            }
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.platform.is_none()
            && self.os.is_none()
            && self.distro.is_none()
            && self.linux_family.is_none()
            && self.package_manager.is_none()
    }
}

/// The `[verify]` table: how to prove the installed tool actually works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifySpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Expected output pattern; `{version}` expands to the installed version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub mode: VerifyMode,
    #[serde(default)]
    pub version_format: VersionFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyMode {
    /// Run the command, expect the (transformed) version in its output.
    #[default]
    Version,
    /// Run the command, expect exit code zero.
    Functional,
    /// Run the command, expect a literal substring in its output.
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionFormat {
    /// `major.minor.patch`, dropping any pre-release/build suffix.
    #[default]
    Semver,
    /// The full semver string including suffixes.
    SemverFull,
    /// The resolved version with any leading `v` removed.
    StripV,
    /// The resolved version, untouched.
    Raw,
}

impl VersionFormat {
    /// Applies this transform to a resolved version string.
    pub fn apply(&self, version: &str) -> String {
        match self {
            VersionFormat::Raw => version.to_string(),
            VersionFormat::StripV => version.trim_start_matches('v').to_string(),
            VersionFormat::SemverFull => version.trim_start_matches('v').to_string(),
            VersionFormat::Semver => {
                let stripped = version.trim_start_matches('v');
                // Keep only major.minor.patch; suffixes like -rc1 or +build go.
                let core: String = stripped
                    .chars()
                    .take_while(|c| c.is_ascii_digit() || *c == '.')
                    .collect();
                if core.is_empty() { stripped.to_string() } else { core }
            }
        }
    }
}

/// Checks a tool/dependency name against `^[a-z0-9][a-z0-9-]*$`.
pub fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Splits a dependency entry into `(name, is_system)`, honoring the
/// `system:` prefix.
pub fn parse_dependency(entry: &str) -> (&str, bool) {
    match entry.strip_prefix("system:") {
        Some(name) => (name, true),
        None => (entry, false),
    }
}

/// Canonical hash of a step's parameters, used for decomposition cycle
/// detection. BTreeMap ordering makes the digest independent of authoring
/// order.
pub fn params_digest(action: &str, params: &toml::Table) -> String {
    use sha2::{Digest, Sha256};
    let ordered: BTreeMap<&String, &toml::Value> = params.iter().collect();
    let mut hasher = Sha256::new();
    hasher.update(action.as_bytes());
    for (key, value) in ordered {
        hasher.update(key.as_bytes());
        hasher.update(value.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linux_amd64() -> Platform {
        Platform::for_tests("linux", "amd64", Some("debian"), "ubuntu")
    }

    #[test]
    fn parses_a_minimal_recipe() {
        let text = r#"
            [metadata]
            name = "rg"
            description = "ripgrep"

            [[steps]]
            action = "github_archive"
            repo = "BurntSushi/ripgrep"
            binaries = ["rg"]

            [verify]
            command = "rg"
            args = ["--version"]
            pattern = "ripgrep {version}"
        "#;
        let recipe: Recipe = toml::from_str(text).unwrap();
        assert_eq!(recipe.metadata.name, "rg");
        assert_eq!(recipe.metadata.tool_type, ToolType::Tool);
        assert_eq!(recipe.steps.len(), 1);
        assert_eq!(recipe.steps[0].param_str("repo"), Some("BurntSushi/ripgrep"));
        assert_eq!(recipe.verify.unwrap().mode, VerifyMode::Version);
    }

    #[test]
    fn nested_params_fold_into_the_step() {
        let text = r#"
            [metadata]
            name = "jq"
            description = "json tool"

            [[steps]]
            action = "download"
            [steps.params]
            url = "https://example.com/jq"
        "#;
        let mut recipe: Recipe = toml::from_str(text).unwrap();
        recipe.steps[0].normalize();
        assert_eq!(recipe.steps[0].param_str("url"), Some("https://example.com/jq"));
        assert!(!recipe.steps[0].params.contains_key("params"));
    }

    #[test]
    fn when_clause_requires_all_predicates() {
        let platform = linux_amd64();
        let when = WhenClause {
            os: Some(vec!["linux".into()]),
            linux_family: Some(vec!["debian".into()]),
            ..Default::default()
        };
        assert!(when.matches(&platform));

        let when = WhenClause {
            os: Some(vec!["linux".into()]),
            linux_family: Some(vec!["rhel".into()]),
            ..Default::default()
        };
        assert!(!when.matches(&platform));
    }

    #[test]
    fn when_platform_tuples_are_or_matched() {
        let platform = linux_amd64();
        let when = WhenClause {
            platform: Some(vec!["darwin/arm64".into(), "linux/amd64".into()]),
            ..Default::default()
        };
        assert!(when.matches(&platform));

        let when = WhenClause {
            platform: Some(vec!["darwin/arm64".into()]),
            ..Default::default()
        };
        assert!(!when.matches(&platform));
    }

    #[test]
    fn distro_predicate_implies_linux() {
        let mac = Platform::for_tests("darwin", "arm64", None, "");
        let when = WhenClause { distro: Some(vec!["ubuntu".into()]), ..Default::default() };
        assert!(!when.matches(&mac));
    }

    #[test]
    fn name_pattern_is_enforced() {
        assert!(valid_name("rg"));
        assert!(valid_name("lazygit"));
        assert!(valid_name("gcc-13"));
        assert!(valid_name("7zip"));
        assert!(!valid_name("Rg"));
        assert!(!valid_name("-leading-dash"));
        assert!(!valid_name(""));
        assert!(!valid_name("under_score"));
    }

    #[test]
    fn system_prefix_is_recognized() {
        assert_eq!(parse_dependency("system:git"), ("git", true));
        assert_eq!(parse_dependency("cmake"), ("cmake", false));
    }

    #[test]
    fn version_format_transforms() {
        assert_eq!(VersionFormat::Semver.apply("1.7.1-rc2"), "1.7.1");
        assert_eq!(VersionFormat::SemverFull.apply("v1.7.1-rc2"), "1.7.1-rc2");
        assert_eq!(VersionFormat::StripV.apply("v14.1.0"), "14.1.0");
        assert_eq!(VersionFormat::Raw.apply("v14.1.0"), "v14.1.0");
    }

    #[test]
    fn params_digest_ignores_key_order() {
        let mut a = toml::Table::new();
        a.insert("url".into(), toml::Value::String("https://a".into()));
        a.insert("dest".into(), toml::Value::String("x".into()));
        let mut b = toml::Table::new();
        b.insert("dest".into(), toml::Value::String("x".into()));
        b.insert("url".into(), toml::Value::String("https://a".into()));
        assert_eq!(params_digest("download", &a), params_digest("download", &b));
        assert_ne!(params_digest("download", &a), params_digest("extract", &a));
    }
}
