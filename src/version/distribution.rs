// Distribution-index version sources: the Go module proxy, HashiCorp's
// release API, the Node.js dist index, Fossil project download listings,
// nixpkgs (via the local nix toolchain), and the fixed `manual` source.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;

use crate::error::{Result, TsukuError};
use crate::libs::cancel::CancelToken;
use crate::libs::utilities::process::run_checked;
use crate::schemas::recipe::Recipe;
use crate::version::{
    Resolution, VersionProvider, VersionRequest, get_json, get_text, source_field,
};

pub fn register(add: &mut impl FnMut(Arc<dyn VersionProvider>)) {
    add(Arc::new(GoProxy));
    add(Arc::new(Hashicorp));
    add(Arc::new(NodeDist));
    add(Arc::new(Fossil));
    add(Arc::new(Nixpkgs));
    add(Arc::new(Manual));
}

/// proxy.golang.org. `module` field; paths are case-encoded per the proxy
/// protocol (uppercase letters become `!` + lowercase).
pub struct GoProxy;

fn encode_go_module(module: &str) -> String {
    let mut encoded = String::with_capacity(module.len());
    for c in module.chars() {
        if c.is_ascii_uppercase() {
            encoded.push('!');
            encoded.push(c.to_ascii_lowercase());
        } else {
            encoded.push(c);
        }
    }
    encoded
}

impl VersionProvider for GoProxy {
    fn name(&self) -> &'static str {
        "goproxy"
    }

    fn resolve(&self, recipe: &Recipe, request: &VersionRequest) -> Result<Resolution> {
        let module = encode_go_module(&source_field(recipe, "module")?);
        if matches!(request, VersionRequest::Latest) {
            let url = format!("https://proxy.golang.org/{module}/@latest");
            let doc = get_json(&url)?;
            let tag = doc.get("Version").and_then(|v| v.as_str()).ok_or_else(|| {
                TsukuError::VersionResolution {
                    recipe: recipe.metadata.name.clone(),
                    reason: "@latest returned no Version".to_string(),
                }
            })?;
            return Ok(Resolution::from_tag(tag));
        }
        let tags = self.list_tags(recipe)?;
        crate::version::pick_best(self.name(), recipe, &tags, request)
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        let module = encode_go_module(&source_field(recipe, "module")?);
        let url = format!("https://proxy.golang.org/{module}/@v/list");
        let body = get_text(&url)?;
        Ok(body.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect())
    }
}

/// api.releases.hashicorp.com. `product` field.
pub struct Hashicorp;

impl VersionProvider for Hashicorp {
    fn name(&self) -> &'static str {
        "hashicorp"
    }

    fn resolve(&self, recipe: &Recipe, request: &VersionRequest) -> Result<Resolution> {
        let product = source_field(recipe, "product")?;
        if matches!(request, VersionRequest::Latest) {
            let url =
                format!("https://api.releases.hashicorp.com/v1/releases/{product}/latest");
            let doc = get_json(&url)?;
            let version = doc.get("version").and_then(|v| v.as_str()).ok_or_else(|| {
                TsukuError::VersionResolution {
                    recipe: recipe.metadata.name.clone(),
                    reason: format!("no latest release for '{product}'"),
                }
            })?;
            return Ok(Resolution::from_tag(version));
        }
        let tags = self.list_tags(recipe)?;
        crate::version::pick_best(self.name(), recipe, &tags, request)
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        let product = source_field(recipe, "product")?;
        let url = format!(
            "https://api.releases.hashicorp.com/v1/releases/{product}?limit=20"
        );
        let doc = get_json(&url)?;
        Ok(doc
            .as_array()
            .map(|releases| {
                releases
                    .iter()
                    .filter_map(|r| r.get("version").and_then(|v| v.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// nodejs.org/dist/index.json. Optional `channel = "lts"` field narrows to
/// LTS lines.
pub struct NodeDist;

impl VersionProvider for NodeDist {
    fn name(&self) -> &'static str {
        "node"
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        let lts_only = recipe
            .version
            .as_ref()
            .and_then(|v| v.field("channel"))
            .map(|c| c == "lts")
            .unwrap_or(false);
        let doc = get_json("https://nodejs.org/dist/index.json")?;
        Ok(doc
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| {
                        // `lts` is false for current releases, a name string
                        // for LTS lines.
                        !lts_only || e.get("lts").map(|v| v.is_string()).unwrap_or(false)
                    })
                    .filter_map(|e| e.get("version").and_then(|v| v.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Fossil project download listings: a JSON index of download files, with
/// versions extracted from the filenames. `url` field points at the
/// project's juvlist endpoint.
pub struct Fossil;

impl VersionProvider for Fossil {
    fn name(&self) -> &'static str {
        "fossil"
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        let url = source_field(recipe, "url")?;
        let doc = get_json(&url)?;
        let pattern = Regex::new(r"(\d+\.\d+(?:\.\d+)?)").expect("static regex");

        let mut versions: Vec<String> = doc
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|e| e.get("name").and_then(|v| v.as_str()))
                    .filter_map(|name| {
                        pattern.captures(name).map(|c| c[1].to_string())
                    })
                    .collect()
            })
            .unwrap_or_default();
        versions.sort();
        versions.dedup();
        Ok(versions)
    }
}

/// nixpkgs attribute versions, read from the local nix toolchain rather
/// than a web API: `nix eval nixpkgs#<attribute>.version`.
pub struct Nixpkgs;

impl VersionProvider for Nixpkgs {
    fn name(&self) -> &'static str {
        "nixpkgs"
    }

    fn resolve(&self, recipe: &Recipe, _request: &VersionRequest) -> Result<Resolution> {
        let attribute = source_field(recipe, "attribute")?;
        let output = run_checked(
            "nix",
            &[
                "--extra-experimental-features".into(),
                "nix-command flakes".into(),
                "eval".into(),
                "--raw".into(),
                format!("nixpkgs#{attribute}.version"),
            ],
            None,
            &BTreeMap::new(),
            Duration::from_secs(60),
            &CancelToken::new(),
        )
        .map_err(|e| TsukuError::VersionResolution {
            recipe: recipe.metadata.name.clone(),
            reason: format!("nix eval failed: {e}"),
        })?;
        let version = output.stdout.trim();
        if version.is_empty() {
            return Err(TsukuError::VersionResolution {
                recipe: recipe.metadata.name.clone(),
                reason: format!("nixpkgs#{attribute} has no version attribute"),
            });
        }
        Ok(Resolution::from_tag(version))
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        self.resolve(recipe, &VersionRequest::Latest).map(|r| vec![r.tag])
    }
}

/// Fixed version pinned in the recipe itself: `version = "1.2.3"`.
pub struct Manual;

impl VersionProvider for Manual {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn resolve(&self, recipe: &Recipe, request: &VersionRequest) -> Result<Resolution> {
        let pinned = source_field(recipe, "version")?;
        let resolution = Resolution::from_tag(&pinned);
        if !request.matches(&resolution.version) {
            return Err(TsukuError::VersionResolution {
                recipe: recipe.metadata.name.clone(),
                reason: format!(
                    "recipe pins version {} which does not satisfy the requested spec",
                    resolution.version
                ),
            });
        }
        Ok(resolution)
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        Ok(vec![source_field(recipe, "version")?])
    }
}
