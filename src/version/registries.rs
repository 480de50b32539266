// Package-registry version sources: Homebrew, PyPI, npm, crates.io,
// RubyGems and MetaCPAN. All are thin JSON clients over the registries'
// public APIs; each needs one naming field off the [version] table.

use std::sync::Arc;

use crate::error::{Result, TsukuError};
use crate::schemas::recipe::Recipe;
use crate::version::{
    Resolution, VersionProvider, VersionRequest, get_json, pick_best, source_field,
};

pub fn register(add: &mut impl FnMut(Arc<dyn VersionProvider>)) {
    add(Arc::new(Homebrew));
    add(Arc::new(Pypi));
    add(Arc::new(Npm));
    add(Arc::new(CratesIo));
    add(Arc::new(RubyGems));
    add(Arc::new(MetaCpan));
}

/// formulae.brew.sh formula API. `formula` field.
pub struct Homebrew;

impl VersionProvider for Homebrew {
    fn name(&self) -> &'static str {
        "homebrew"
    }

    fn resolve(&self, recipe: &Recipe, _request: &VersionRequest) -> Result<Resolution> {
        let formula = source_field(recipe, "formula")?;
        let url = format!("https://formulae.brew.sh/api/formula/{formula}.json");
        let doc = get_json(&url)?;
        let stable = doc
            .pointer("/versions/stable")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TsukuError::VersionResolution {
                recipe: recipe.metadata.name.clone(),
                reason: format!("formula '{formula}' has no stable version"),
            })?;
        Ok(Resolution::from_tag(stable))
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        // The formula API only exposes the current stable version.
        self.resolve(recipe, &VersionRequest::Latest).map(|r| vec![r.tag])
    }
}

/// pypi.org JSON API. `package` field.
pub struct Pypi;

impl VersionProvider for Pypi {
    fn name(&self) -> &'static str {
        "pypi"
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        let package = source_field(recipe, "package")?;
        let url = format!("https://pypi.org/pypi/{package}/json");
        let doc = get_json(&url)?;
        let releases = doc.get("releases").and_then(|v| v.as_object()).ok_or_else(|| {
            TsukuError::VersionResolution {
                recipe: recipe.metadata.name.clone(),
                reason: format!("no release index for '{package}'"),
            }
        })?;
        // Skip yanked-only releases; a release with no files is dead.
        Ok(releases
            .iter()
            .filter(|(_, files)| files.as_array().map(|a| !a.is_empty()).unwrap_or(false))
            .map(|(version, _)| version.clone())
            .collect())
    }
}

/// registry.npmjs.org. `package` field.
pub struct Npm;

impl VersionProvider for Npm {
    fn name(&self) -> &'static str {
        "npm"
    }

    fn resolve(&self, recipe: &Recipe, request: &VersionRequest) -> Result<Resolution> {
        let package = source_field(recipe, "package")?;
        let url = format!("https://registry.npmjs.org/{package}");
        let doc = get_json(&url)?;

        if matches!(request, VersionRequest::Latest) {
            if let Some(latest) = doc.pointer("/dist-tags/latest").and_then(|v| v.as_str()) {
                return Ok(Resolution::from_tag(latest));
            }
        }
        let tags: Vec<String> = doc
            .get("versions")
            .and_then(|v| v.as_object())
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default();
        pick_best(self.name(), recipe, &tags, request)
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        let package = source_field(recipe, "package")?;
        let url = format!("https://registry.npmjs.org/{package}");
        let doc = get_json(&url)?;
        Ok(doc
            .get("versions")
            .and_then(|v| v.as_object())
            .map(|versions| versions.keys().cloned().collect())
            .unwrap_or_default())
    }
}

/// crates.io API. `crate` field.
pub struct CratesIo;

impl VersionProvider for CratesIo {
    fn name(&self) -> &'static str {
        "crates"
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        let crate_name = source_field(recipe, "crate")?;
        let url = format!("https://crates.io/api/v1/crates/{crate_name}");
        let doc = get_json(&url)?;
        Ok(doc
            .get("versions")
            .and_then(|v| v.as_array())
            .map(|versions| {
                versions
                    .iter()
                    .filter(|v| !v.get("yanked").and_then(|y| y.as_bool()).unwrap_or(false))
                    .filter_map(|v| v.get("num").and_then(|n| n.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// rubygems.org API. `gem` field.
pub struct RubyGems;

impl VersionProvider for RubyGems {
    fn name(&self) -> &'static str {
        "rubygems"
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        let gem = source_field(recipe, "gem")?;
        let url = format!("https://rubygems.org/api/v1/versions/{gem}.json");
        let doc = get_json(&url)?;
        Ok(doc
            .as_array()
            .map(|versions| {
                versions
                    .iter()
                    .filter(|v| {
                        !v.get("prerelease").and_then(|p| p.as_bool()).unwrap_or(false)
                    })
                    .filter_map(|v| v.get("number").and_then(|n| n.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// fastapi.metacpan.org release API. `distribution` field.
pub struct MetaCpan;

impl VersionProvider for MetaCpan {
    fn name(&self) -> &'static str {
        "metacpan"
    }

    fn resolve(&self, recipe: &Recipe, _request: &VersionRequest) -> Result<Resolution> {
        let distribution = source_field(recipe, "distribution")?;
        let url = format!("https://fastapi.metacpan.org/v1/release/{distribution}");
        let doc = get_json(&url)?;
        let version = doc
            .get("version")
            .and_then(|v| v.as_str())
            .ok_or_else(|| TsukuError::VersionResolution {
                recipe: recipe.metadata.name.clone(),
                reason: format!("no release found for distribution '{distribution}'"),
            })?;
        Ok(Resolution::from_tag(version))
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        self.resolve(recipe, &VersionRequest::Latest).map(|r| vec![r.tag])
    }
}
