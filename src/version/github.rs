// GitHub version sources: release listings and raw tags. Both need the
// `repo` field ("owner/name") on the recipe's [version] table.

use std::sync::Arc;

use crate::error::{Result, TsukuError};
use crate::schemas::recipe::Recipe;
use crate::version::{
    Resolution, VersionProvider, VersionRequest, get_json, pick_best, source_field,
};

pub fn register(add: &mut impl FnMut(Arc<dyn VersionProvider>)) {
    add(Arc::new(GithubReleases));
    add(Arc::new(GithubTags));
}

/// Releases API: respects prerelease/draft flags, so `latest` means the
/// newest stable release.
pub struct GithubReleases;

impl VersionProvider for GithubReleases {
    fn name(&self) -> &'static str {
        "github"
    }

    fn resolve(&self, recipe: &Recipe, request: &VersionRequest) -> Result<Resolution> {
        let repo = source_field(recipe, "repo")?;
        let url = format!("https://api.github.com/repos/{repo}/releases?per_page=100");
        let releases = get_json(&url)?;

        let tags: Vec<String> = releases
            .as_array()
            .ok_or_else(|| TsukuError::VersionResolution {
                recipe: recipe.metadata.name.clone(),
                reason: format!("unexpected releases payload from {repo}"),
            })?
            .iter()
            .filter(|release| {
                !release.get("prerelease").and_then(|v| v.as_bool()).unwrap_or(false)
                    && !release.get("draft").and_then(|v| v.as_bool()).unwrap_or(false)
            })
            .filter_map(|release| {
                release.get("tag_name").and_then(|v| v.as_str()).map(str::to_string)
            })
            .collect();

        pick_best(self.name(), recipe, &tags, request)
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        let repo = source_field(recipe, "repo")?;
        let url = format!("https://api.github.com/repos/{repo}/releases?per_page=100");
        let releases = get_json(&url)?;
        Ok(releases
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|r| r.get("tag_name").and_then(|v| v.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Tags API: for repos that tag without cutting releases.
pub struct GithubTags;

impl VersionProvider for GithubTags {
    fn name(&self) -> &'static str {
        "github_tags"
    }

    fn list_tags(&self, recipe: &Recipe) -> Result<Vec<String>> {
        let repo = source_field(recipe, "repo")?;
        let url = format!("https://api.github.com/repos/{repo}/tags?per_page=100");
        let tags = get_json(&url)?;
        Ok(tags
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|t| t.get("name").and_then(|v| v.as_str()).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default())
    }
}
