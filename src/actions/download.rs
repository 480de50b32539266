// Fetch actions: the `download_file` primitive plus the composites that
// exist to construct URLs (`download`, `download_archive`, `github_archive`,
// `github_file`, `hashicorp_release`, `fossil_archive`).
//
// `download_file` is the only step that touches the network at execution
// time, and it only ever runs with a checksum already bound by eval: a
// payload that does not hash to the plan's digest never reaches the
// workspace.

use std::sync::Arc;

use crate::actions::{
    Action, ActionKind, EvalContext, ExecutionContext, optional_str, optional_u32, param_error,
    require_safe_rel_path, require_str, require_str_list,
};
use crate::error::{Result, TsukuError};
use crate::libs::predownload::Predownloader;
use crate::libs::utilities::checksum::is_sha256_hex;
use crate::libs::utilities::compression::ArchiveFormat;
use crate::libs::utilities::file_operations::{copy_preserving_mode, workspace_path};
use crate::log_debug;
use crate::schemas::recipe::Step;

pub fn register(add: &mut impl FnMut(Arc<dyn Action>)) {
    add(Arc::new(DownloadFile));
    add(Arc::new(DownloadComposite));
    add(Arc::new(DownloadArchive));
    add(Arc::new(GithubArchive));
    add(Arc::new(GithubFile));
    add(Arc::new(HashicorpRelease));
    add(Arc::new(FossilArchive));
}

/// Derives a workspace filename from the last URL path segment.
fn dest_from_url(url: &str) -> String {
    url.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("download").to_string()
}

/// Lexical checks on a URL parameter: https scheme, parseable once any
/// template tokens are accounted for. Host resolution and the SSRF guard
/// run in the pre-downloader, on the network path only; a cache hit must
/// not require DNS.
fn check_url_param(key: &str, url: &str) -> Result<()> {
    if !url.starts_with("https://") {
        return Err(param_error(key, "must be an https:// URL"));
    }
    if !url.contains('{') && url::Url::parse(url).is_err() {
        return Err(param_error(key, "is not a parseable URL"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// download_file (primitive)
// ---------------------------------------------------------------------------

struct DownloadFileParams {
    url: String,
    dest: String,
    /// Bound by eval; optional while the step is still being authored.
    checksum: Option<String>,
}

impl DownloadFileParams {
    fn from_table(params: &toml::Table) -> Result<Self> {
        let url = require_str(params, "url")?;
        check_url_param("url", &url)?;
        let dest = require_safe_rel_path(params, "dest")?;
        let checksum = optional_str(params, "checksum")?;
        if let Some(sum) = &checksum {
            if !is_sha256_hex(sum) {
                return Err(param_error("checksum", "must be a lowercase hex sha256"));
            }
        }
        Ok(Self { url, dest, checksum })
    }
}

pub struct DownloadFile;

impl Action for DownloadFile {
    fn name(&self) -> &'static str {
        "download_file"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        DownloadFileParams::from_table(params).map(|_| ())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let parsed = DownloadFileParams::from_table(params)?;
        let checksum = parsed.checksum.ok_or_else(|| {
            TsukuError::Integrity(format!(
                "download_file for {} reached execution without a checksum",
                parsed.url
            ))
        })?;

        let fetcher = Predownloader::new(ctx.settings, ctx.cancel.clone());
        let download = fetcher.fetch(&parsed.url, Some(&checksum))?;

        let dest = workspace_path(ctx.workspace, &parsed.dest)?;
        copy_preserving_mode(&download.path, &dest)?;
        log_debug!(
            "[Exec] download_file {} -> {} ({})",
            parsed.url,
            parsed.dest,
            if download.from_cache { "cache" } else { "network" }
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// download (composite): download_file with an auto-computed dest
// ---------------------------------------------------------------------------

pub struct DownloadComposite;

impl Action for DownloadComposite {
    fn name(&self) -> &'static str {
        "download"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Composite
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        let url = require_str(params, "url")?;
        check_url_param("url", &url)?;
        if params.contains_key("dest") {
            require_safe_rel_path(params, "dest")?;
        }
        Ok(())
    }

    fn execute(&self, _ctx: &ExecutionContext, _params: &toml::Table) -> Result<()> {
        unreachable!("composite actions never execute")
    }

    fn decompose(&self, ctx: &EvalContext, params: &toml::Table) -> Result<Vec<Step>> {
        let url = require_str(params, "url")?;
        let dest = match optional_str(params, "dest")? {
            Some(dest) => dest,
            // URLs ending in a slash or query leave no usable basename;
            // fall back to the tool's own name.
            None => match url.rsplit('/').next().filter(|s| !s.is_empty() && !s.contains('?')) {
                Some(name) => name.to_string(),
                None => ctx.tool_name.to_string(),
            },
        };
        let mut table = toml::Table::new();
        table.insert("url".into(), toml::Value::String(url));
        table.insert("dest".into(), toml::Value::String(dest));
        if let Some(checksum) = optional_str(params, "checksum")? {
            table.insert("checksum".into(), toml::Value::String(checksum));
        }
        Ok(vec![Step::new("download_file", table)])
    }
}

// ---------------------------------------------------------------------------
// download_archive (composite): fetch + extract + chmod + install_binaries
// ---------------------------------------------------------------------------

struct ArchiveParams {
    url: String,
    binaries: Vec<String>,
    strip_dirs: u32,
    format: Option<ArchiveFormat>,
    /// Author-pinned payload checksum, passed through to download_file.
    checksum: Option<String>,
}

impl ArchiveParams {
    fn from_table(params: &toml::Table, default_strip: u32) -> Result<Self> {
        let url = require_str(params, "url")?;
        check_url_param("url", &url)?;
        let binaries = require_str_list(params, "binaries")?;
        let strip_dirs = optional_u32(params, "strip_dirs")?.unwrap_or(default_strip);
        let format = match optional_str(params, "format")? {
            Some(value) => Some(
                ArchiveFormat::parse(&value)
                    .ok_or_else(|| param_error("format", format!("unsupported format '{value}'")))?,
            ),
            None => None,
        };
        let checksum = optional_str(params, "checksum")?;
        if let Some(sum) = &checksum {
            if !is_sha256_hex(sum) {
                return Err(param_error("checksum", "must be a lowercase hex sha256"));
            }
        }
        Ok(Self { url, binaries, strip_dirs, format, checksum })
    }

    /// Emits the canonical four-step expansion shared by every archive
    /// composite.
    fn into_steps(self) -> Result<Vec<Step>> {
        let dest = dest_from_url(&self.url);
        let format = match self.format {
            Some(format) => format,
            None => ArchiveFormat::from_filename(&dest).ok_or_else(|| {
                param_error("url", format!("cannot infer archive format from '{dest}'"))
            })?,
        };

        let mut download = toml::Table::new();
        download.insert("url".into(), toml::Value::String(self.url));
        download.insert("dest".into(), toml::Value::String(dest.clone()));
        if let Some(checksum) = self.checksum {
            download.insert("checksum".into(), toml::Value::String(checksum));
        }

        let mut extract = toml::Table::new();
        extract.insert("archive".into(), toml::Value::String(dest));
        extract.insert("format".into(), toml::Value::String(format.as_str().to_string()));
        extract.insert("strip_dirs".into(), toml::Value::Integer(self.strip_dirs as i64));

        let files =
            toml::Value::Array(self.binaries.iter().cloned().map(toml::Value::String).collect());
        let mut chmod = toml::Table::new();
        chmod.insert("files".into(), files.clone());

        let mut install = toml::Table::new();
        install.insert("binaries".into(), files);

        Ok(vec![
            Step::new("download_file", download),
            Step::new("extract", extract),
            Step::new("chmod", chmod),
            Step::new("install_binaries", install),
        ])
    }
}

pub struct DownloadArchive;

impl Action for DownloadArchive {
    fn name(&self) -> &'static str {
        "download_archive"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Composite
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        ArchiveParams::from_table(params, 0).map(|_| ())
    }

    fn execute(&self, _ctx: &ExecutionContext, _params: &toml::Table) -> Result<()> {
        unreachable!("composite actions never execute")
    }

    fn decompose(&self, _ctx: &EvalContext, params: &toml::Table) -> Result<Vec<Step>> {
        ArchiveParams::from_table(params, 0)?.into_steps()
    }
}

// ---------------------------------------------------------------------------
// github_archive (composite)
// ---------------------------------------------------------------------------

struct GithubArchiveParams {
    repo: String,
    asset: String,
    binaries: Vec<String>,
    strip_dirs: u32,
    format: Option<ArchiveFormat>,
}

impl GithubArchiveParams {
    fn from_table(params: &toml::Table) -> Result<Self> {
        let repo = require_str(params, "repo")?;
        if repo.split('/').count() != 2 {
            return Err(param_error("repo", "must be 'owner/name'"));
        }
        let binaries = require_str_list(params, "binaries")?;
        let asset = match optional_str(params, "asset")? {
            Some(asset) => asset,
            None => {
                // Default to the most common release-asset layout.
                let name = repo.rsplit('/').next().unwrap_or_default().to_string();
                format!("{name}-{{version}}-{{os}}-{{arch}}.tar.gz")
            }
        };
        let strip_dirs = optional_u32(params, "strip_dirs")?.unwrap_or(1);
        let format = match optional_str(params, "format")? {
            Some(value) => Some(
                ArchiveFormat::parse(&value)
                    .ok_or_else(|| param_error("format", format!("unsupported format '{value}'")))?,
            ),
            None => None,
        };
        Ok(Self { repo, asset, binaries, strip_dirs, format })
    }
}

pub struct GithubArchive;

impl Action for GithubArchive {
    fn name(&self) -> &'static str {
        "github_archive"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Composite
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        GithubArchiveParams::from_table(params).map(|_| ())
    }

    fn execute(&self, _ctx: &ExecutionContext, _params: &toml::Table) -> Result<()> {
        unreachable!("composite actions never execute")
    }

    fn decompose(&self, _ctx: &EvalContext, params: &toml::Table) -> Result<Vec<Step>> {
        let parsed = GithubArchiveParams::from_table(params)?;
        // {raw_version} preserves upstream tags like `v14.1.0` in the path
        // while the asset name usually wants the bare version.
        let url = format!(
            "https://github.com/{}/releases/download/{{raw_version}}/{}",
            parsed.repo, parsed.asset
        );
        ArchiveParams {
            url,
            binaries: parsed.binaries,
            strip_dirs: parsed.strip_dirs,
            format: parsed.format,
            checksum: optional_str(params, "checksum")?,
        }
        .into_steps()
    }
}

// ---------------------------------------------------------------------------
// github_file (composite): a single release asset installed as a binary
// ---------------------------------------------------------------------------

pub struct GithubFile;

impl Action for GithubFile {
    fn name(&self) -> &'static str {
        "github_file"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Composite
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        let repo = require_str(params, "repo")?;
        if repo.split('/').count() != 2 {
            return Err(param_error("repo", "must be 'owner/name'"));
        }
        require_str(params, "asset")?;
        require_str(params, "binary")?;
        Ok(())
    }

    fn execute(&self, _ctx: &ExecutionContext, _params: &toml::Table) -> Result<()> {
        unreachable!("composite actions never execute")
    }

    fn decompose(&self, _ctx: &EvalContext, params: &toml::Table) -> Result<Vec<Step>> {
        let repo = require_str(params, "repo")?;
        let asset = require_str(params, "asset")?;
        let binary = require_str(params, "binary")?;

        let url =
            format!("https://github.com/{repo}/releases/download/{{raw_version}}/{asset}");

        let mut download = toml::Table::new();
        download.insert("url".into(), toml::Value::String(url));
        download.insert("dest".into(), toml::Value::String(binary.clone()));

        let files = toml::Value::Array(vec![toml::Value::String(binary)]);
        let mut chmod = toml::Table::new();
        chmod.insert("files".into(), files.clone());
        let mut install = toml::Table::new();
        install.insert("binaries".into(), files);

        Ok(vec![
            Step::new("download_file", download),
            Step::new("chmod", chmod),
            Step::new("install_binaries", install),
        ])
    }
}

// ---------------------------------------------------------------------------
// hashicorp_release (composite): releases.hashicorp.com zip layout
// ---------------------------------------------------------------------------

pub struct HashicorpRelease;

impl Action for HashicorpRelease {
    fn name(&self) -> &'static str {
        "hashicorp_release"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Composite
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        require_str(params, "product")?;
        if params.contains_key("binaries") {
            require_str_list(params, "binaries")?;
        }
        Ok(())
    }

    fn execute(&self, _ctx: &ExecutionContext, _params: &toml::Table) -> Result<()> {
        unreachable!("composite actions never execute")
    }

    fn decompose(&self, _ctx: &EvalContext, params: &toml::Table) -> Result<Vec<Step>> {
        let product = require_str(params, "product")?;
        let binaries = optional_str_list_or(params, "binaries", &product)?;

        // HashiCorp zips contain the bare binary at the archive root.
        let url = format!(
            "https://releases.hashicorp.com/{product}/{{version}}/{product}_{{version}}_{{os}}_{{arch}}.zip"
        );
        ArchiveParams {
            url,
            binaries,
            strip_dirs: 0,
            format: Some(ArchiveFormat::Zip),
            checksum: optional_str(params, "checksum")?,
        }
        .into_steps()
    }
}

fn optional_str_list_or(
    params: &toml::Table,
    key: &str,
    fallback: &str,
) -> Result<Vec<String>> {
    match crate::actions::optional_str_list(params, key)? {
        Some(list) if !list.is_empty() => Ok(list),
        _ => Ok(vec![fallback.to_string()]),
    }
}

// ---------------------------------------------------------------------------
// fossil_archive (composite): fossil-scm.org download layout
// ---------------------------------------------------------------------------

pub struct FossilArchive;

impl Action for FossilArchive {
    fn name(&self) -> &'static str {
        "fossil_archive"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Composite
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        let url = require_str(params, "url")?;
        check_url_param("url", &url)?;
        require_str_list(params, "binaries")?;
        Ok(())
    }

    fn execute(&self, _ctx: &ExecutionContext, _params: &toml::Table) -> Result<()> {
        unreachable!("composite actions never execute")
    }

    fn decompose(&self, _ctx: &EvalContext, params: &toml::Table) -> Result<Vec<Step>> {
        ArchiveParams::from_table(params, 0)?.into_steps()
    }
}
