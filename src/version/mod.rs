// Version resolution: pluggable providers keyed by the recipe's
// `version.source`. Each provider answers two questions (what is the
// latest version, and what versions exist) against its
// upstream API. Resolution returns both the normalized version (no leading
// `v`) and the raw upstream tag, which URL templates may need verbatim.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::error::{Result, TsukuError};
use crate::log_debug;
use crate::schemas::recipe::Recipe;

pub mod distribution;
pub mod github;
pub mod registries;

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionRequest {
    Latest,
    /// Exact or prefix spec: "14.1.0" or "14.1".
    Spec(String),
}

impl VersionRequest {
    pub fn parse(raw: Option<&str>) -> Self {
        match raw {
            None => Self::Latest,
            Some(spec) if spec.trim().is_empty() || spec.trim() == "latest" => Self::Latest,
            Some(spec) => Self::Spec(spec.trim().trim_start_matches('v').to_string()),
        }
    }

    /// Whether a normalized version satisfies this request. A spec matches
    /// exactly or as a dotted prefix ("1.2" matches "1.2.9", not "1.20").
    pub fn matches(&self, version: &str) -> bool {
        match self {
            Self::Latest => true,
            Self::Spec(spec) => {
                version == spec || version.starts_with(&format!("{spec}."))
            }
        }
    }
}

/// A resolved version: normalized plus the raw upstream tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub version: String,
    pub tag: String,
}

impl Resolution {
    /// Builds a resolution from an upstream tag, normalizing the version.
    pub fn from_tag(tag: &str) -> Self {
        Self { version: normalize_version(tag), tag: tag.to_string() }
    }
}

/// Strips the conventional `v` prefix from upstream tags.
pub fn normalize_version(tag: &str) -> String {
    let trimmed = tag.trim();
    match trimmed.strip_prefix('v') {
        // Only strip when a digit follows; "vault" stays "vault".
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest.to_string(),
        _ => trimmed.to_string(),
    }
}

/// One version source.
pub trait VersionProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resolves the request to one version. The default implementation
    /// lists versions and picks; providers with a cheaper "latest" API
    /// override it.
    fn resolve(&self, recipe: &Recipe, request: &VersionRequest) -> Result<Resolution> {
        let tags = self.list_tags(recipe)?;
        pick_best(self.name(), recipe, &tags, request)
    }

    /// Every known upstream tag, newest preference not required.
    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>>;

    /// Normalized versions, for `tsuku list --remote` style output.
    fn list_versions(&self, recipe: &Recipe) -> Result<Vec<String>> {
        Ok(self.list_tags(recipe)?.iter().map(|t| normalize_version(t)).collect())
    }
}

/// Picks the highest matching tag from a list.
pub fn pick_best(
    source: &str,
    recipe: &Recipe,
    tags: &[String],
    request: &VersionRequest,
) -> Result<Resolution> {
    tags.iter()
        .map(|tag| Resolution::from_tag(tag))
        .filter(|r| request.matches(&r.version))
        .max_by(|a, b| compare_versions(&a.version, &b.version))
        .ok_or_else(|| TsukuError::VersionResolution {
            recipe: recipe.metadata.name.clone(),
            reason: match request {
                VersionRequest::Latest => format!("{source} returned no versions"),
                VersionRequest::Spec(spec) => {
                    format!("{source} has no version matching '{spec}'")
                }
            },
        })
}

/// Dotted-numeric comparison with a lexicographic fallback for suffixes.
/// Good enough to order release versions without requiring strict semver.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split(['.', '-', '+']);
    let mut right = b.split(['.', '-', '+']);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            // A bare "1.2" sorts above "1.2-rc1" but below "1.2.1".
            (None, Some(part)) => {
                return if part.chars().all(|c| c.is_ascii_digit()) {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
            }
            (Some(part), None) => {
                return if part.chars().all(|c| c.is_ascii_digit()) {
                    Ordering::Greater
                } else {
                    Ordering::Less
                };
            }
            (Some(l), Some(r)) => {
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(ln), Ok(rn)) => ln.cmp(&rn),
                    _ => l.cmp(r),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

type ProviderMap = BTreeMap<&'static str, Arc<dyn VersionProvider>>;

static PROVIDERS: OnceLock<ProviderMap> = OnceLock::new();

fn providers() -> &'static ProviderMap {
    PROVIDERS.get_or_init(|| {
        let mut map: ProviderMap = BTreeMap::new();
        let mut add = |provider: Arc<dyn VersionProvider>| {
            map.insert(provider.name(), provider);
        };
        github::register(&mut add);
        registries::register(&mut add);
        distribution::register(&mut add);
        map
    })
}

pub fn lookup(source: &str) -> Option<Arc<dyn VersionProvider>> {
    providers().get(source).cloned()
}

pub fn known_sources() -> Vec<&'static str> {
    providers().keys().copied().collect()
}

/// Resolves a recipe's version through its declared source.
pub fn resolve(recipe: &Recipe, request: &VersionRequest) -> Result<Resolution> {
    let source = recipe.version.as_ref().ok_or_else(|| TsukuError::VersionResolution {
        recipe: recipe.metadata.name.clone(),
        reason: "recipe has no [version] section".to_string(),
    })?;
    let provider = lookup(&source.source).ok_or_else(|| TsukuError::VersionResolution {
        recipe: recipe.metadata.name.clone(),
        reason: format!("unknown version source '{}'", source.source),
    })?;
    let resolution = provider.resolve(recipe, request)?;
    log_debug!(
        "[Version] {} resolved {} -> {} (tag {})",
        provider.name(),
        recipe.metadata.name,
        resolution.version,
        resolution.tag
    );
    Ok(resolution)
}

// ---------------------------------------------------------------------------
// Shared HTTP plumbing for providers
// ---------------------------------------------------------------------------

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// GET a JSON document from a provider API.
pub(crate) fn get_json(url: &str) -> Result<serde_json::Value> {
    let agent = ureq::AgentBuilder::new()
        .timeout(PROVIDER_TIMEOUT)
        .try_proxy_from_env(true)
        .build();
    let response = agent
        .get(url)
        .set("User-Agent", concat!("tsuku/", env!("CARGO_PKG_VERSION")))
        .set("Accept", "application/json")
        .call()
        .map_err(|e| TsukuError::Network { url: url.to_string(), reason: e.to_string() })?;
    response
        .into_json()
        .map_err(|e| TsukuError::Network { url: url.to_string(), reason: format!("bad JSON: {e}") })
}

/// GET a plain-text document from a provider API.
pub(crate) fn get_text(url: &str) -> Result<String> {
    let agent = ureq::AgentBuilder::new()
        .timeout(PROVIDER_TIMEOUT)
        .try_proxy_from_env(true)
        .build();
    let response = agent
        .get(url)
        .set("User-Agent", concat!("tsuku/", env!("CARGO_PKG_VERSION")))
        .call()
        .map_err(|e| TsukuError::Network { url: url.to_string(), reason: e.to_string() })?;
    response
        .into_string()
        .map_err(|e| TsukuError::Network { url: url.to_string(), reason: e.to_string() })
}

/// Pulls a required provider field off the recipe's `[version]` table.
pub(crate) fn source_field(recipe: &Recipe, key: &str) -> Result<String> {
    recipe
        .version
        .as_ref()
        .and_then(|v| v.field(key))
        .map(str::to_string)
        .ok_or_else(|| TsukuError::VersionResolution {
            recipe: recipe.metadata.name.clone(),
            reason: format!("[version] is missing the '{key}' field"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::recipe::Recipe;

    fn recipe(name: &str) -> Recipe {
        toml::from_str(&format!(
            "[metadata]\nname = \"{name}\"\ndescription = \"d\"\n\n[[steps]]\naction = \"manual\"\ntext = \"x\"\n"
        ))
        .unwrap()
    }

    #[test]
    fn request_parsing() {
        assert_eq!(VersionRequest::parse(None), VersionRequest::Latest);
        assert_eq!(VersionRequest::parse(Some("latest")), VersionRequest::Latest);
        assert_eq!(VersionRequest::parse(Some("v1.2")), VersionRequest::Spec("1.2".into()));
    }

    #[test]
    fn prefix_specs_match_dotted_extensions_only() {
        let request = VersionRequest::Spec("1.2".into());
        assert!(request.matches("1.2"));
        assert!(request.matches("1.2.9"));
        assert!(!request.matches("1.20"));
        assert!(!request.matches("11.2"));
    }

    #[test]
    fn normalization_strips_v_only_before_digits() {
        assert_eq!(normalize_version("v14.1.0"), "14.1.0");
        assert_eq!(normalize_version("14.1.0"), "14.1.0");
        assert_eq!(normalize_version("vault"), "vault");
        assert_eq!(normalize_version("jq-1.7.1"), "jq-1.7.1");
    }

    #[test]
    fn version_ordering() {
        assert_eq!(compare_versions("1.2.3", "1.2.3"), Ordering::Equal);
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.1"), Ordering::Less);
        assert_eq!(compare_versions("1.2", "1.2-rc1"), Ordering::Greater);
    }

    #[test]
    fn pick_best_honors_the_spec() {
        let tags: Vec<String> =
            ["v1.1.0", "v1.2.0", "v1.2.5", "v2.0.0"].iter().map(|s| s.to_string()).collect();
        let r = recipe("t");

        let latest = pick_best("test", &r, &tags, &VersionRequest::Latest).unwrap();
        assert_eq!(latest.version, "2.0.0");
        assert_eq!(latest.tag, "v2.0.0");

        let pinned =
            pick_best("test", &r, &tags, &VersionRequest::Spec("1.2".into())).unwrap();
        assert_eq!(pinned.version, "1.2.5");

        let err = pick_best("test", &r, &tags, &VersionRequest::Spec("3".into())).unwrap_err();
        assert_eq!(err.kind(), "version-resolution");
    }

    #[test]
    fn registry_covers_the_documented_sources() {
        for source in [
            "github",
            "github_tags",
            "homebrew",
            "pypi",
            "npm",
            "crates",
            "rubygems",
            "goproxy",
            "metacpan",
            "nixpkgs",
            "hashicorp",
            "fossil",
            "node",
            "manual",
        ] {
            assert!(lookup(source).is_some(), "missing provider '{source}'");
        }
        assert!(lookup("sourceforge").is_none());
    }
}
