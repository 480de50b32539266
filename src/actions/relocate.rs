// Relocation primitives: `set_rpath` rewrites native binaries to find
// their libraries relative to their own location, and `homebrew_relocate`
// rewrites the placeholder prefixes Homebrew bottles ship with. The
// `homebrew` composite fetches a bottle and expands into both.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::actions::{
    Action, ActionKind, EvalContext, ExecutionContext, optional_str, optional_str_list,
    optional_u32, param_error, require_str, require_str_list,
};
use crate::error::{Result, TsukuError};
use crate::libs::utilities::binary::is_native_binary;
use crate::libs::utilities::compression::ArchiveFormat;
use crate::libs::utilities::file_operations::workspace_path;
use crate::libs::utilities::process::run_checked;
use crate::{log_debug, log_warn};
use crate::schemas::recipe::Step;

pub fn register(add: &mut impl FnMut(Arc<dyn Action>)) {
    add(Arc::new(SetRpath));
    add(Arc::new(HomebrewRelocate));
    add(Arc::new(Homebrew));
}

const RELOCATE_TIMEOUT: Duration = Duration::from_secs(60);

/// The placeholder prefixes Homebrew bakes into bottle payloads.
const HOMEBREW_PREFIX_PLACEHOLDER: &str = "@@HOMEBREW_PREFIX@@";
const HOMEBREW_CELLAR_PLACEHOLDER: &str = "@@HOMEBREW_CELLAR@@";

// ---------------------------------------------------------------------------
// set_rpath (primitive)
// ---------------------------------------------------------------------------

pub struct SetRpath;

impl Action for SetRpath {
    fn name(&self) -> &'static str {
        "set_rpath"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        require_str_list(params, "files")?;
        optional_str(params, "rpath")?;
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let files = require_str_list(params, "files")?;
        // Default: libraries live next to the binary in ../lib.
        let rpath = optional_str(params, "rpath")?.unwrap_or_else(|| {
            if ctx.platform.os == "darwin" {
                "@loader_path/../lib".to_string()
            } else {
                "$ORIGIN/../lib".to_string()
            }
        });

        for file in &files {
            let path = workspace_path(ctx.workspace, file)?;
            if !is_native_binary(&path) {
                log_warn!("[Exec] set_rpath: '{file}' is not a native binary; skipping");
                continue;
            }
            if ctx.platform.os == "darwin" {
                run_checked(
                    "install_name_tool",
                    &["-add_rpath".to_string(), rpath.clone(), path.display().to_string()],
                    None,
                    &ctx.subprocess_env(),
                    RELOCATE_TIMEOUT,
                    ctx.cancel,
                )?;
            } else {
                run_checked(
                    "patchelf",
                    &["--set-rpath".to_string(), rpath.clone(), path.display().to_string()],
                    None,
                    &ctx.subprocess_env(),
                    RELOCATE_TIMEOUT,
                    ctx.cancel,
                )?;
            }
            log_debug!("[Exec] set_rpath {} -> {}", file, rpath);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// homebrew_relocate (primitive)
// ---------------------------------------------------------------------------

pub struct HomebrewRelocate;

impl Action for HomebrewRelocate {
    fn name(&self) -> &'static str {
        "homebrew_relocate"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        if params.contains_key("files") {
            require_str_list(params, "files")?;
        }
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let prefix = ctx.tool_dir.display().to_string();
        let cellar = format!("{prefix}/Cellar");

        let files: Vec<std::path::PathBuf> = match optional_str_list(params, "files")? {
            Some(names) => {
                let mut out = Vec::with_capacity(names.len());
                for name in &names {
                    out.push(workspace_path(ctx.workspace, name)?);
                }
                out
            }
            // No explicit list: sweep everything extracted so far.
            None => walkdir::WalkDir::new(ctx.workspace)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .collect(),
        };

        let mut rewritten = 0usize;
        for path in &files {
            if relocate_file(path, &prefix, &cellar)? {
                rewritten += 1;
            }
        }
        log_debug!("[Exec] homebrew_relocate rewrote {} file(s)", rewritten);
        Ok(())
    }
}

/// Replaces Homebrew placeholders in one file. Text payloads get a plain
/// substitution; native binaries get a byte-level splice that must not
/// grow the string table, so the replacement is NUL-padded to length.
fn relocate_file(path: &Path, prefix: &str, cellar: &str) -> Result<bool> {
    let bytes = fs::read(path)?;
    let has_prefix = find_sub(&bytes, HOMEBREW_PREFIX_PLACEHOLDER.as_bytes());
    let has_cellar = find_sub(&bytes, HOMEBREW_CELLAR_PLACEHOLDER.as_bytes());
    if !has_prefix && !has_cellar {
        return Ok(false);
    }

    if is_native_binary(path) {
        let mut patched = bytes;
        splice_padded(&mut patched, HOMEBREW_CELLAR_PLACEHOLDER.as_bytes(), cellar.as_bytes())?;
        splice_padded(&mut patched, HOMEBREW_PREFIX_PLACEHOLDER.as_bytes(), prefix.as_bytes())?;
        fs::write(path, patched)?;
    } else {
        let text = String::from_utf8_lossy(&bytes)
            .replace(HOMEBREW_CELLAR_PLACEHOLDER, cellar)
            .replace(HOMEBREW_PREFIX_PLACEHOLDER, prefix);
        fs::write(path, text)?;
    }
    Ok(true)
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// In-place replacement that preserves the byte length: the replacement is
/// written over the placeholder and the remainder NUL-padded. A replacement
/// longer than the placeholder cannot be spliced into a binary.
fn splice_padded(bytes: &mut [u8], needle: &[u8], replacement: &[u8]) -> Result<()> {
    if replacement.len() > needle.len() {
        return Err(TsukuError::Execution {
            command: "homebrew_relocate".to_string(),
            reason: format!(
                "install prefix ({} bytes) is longer than the placeholder ({} bytes); \
                 cannot relocate a native binary in place",
                replacement.len(),
                needle.len()
            ),
        });
    }
    let mut index = 0;
    while index + needle.len() <= bytes.len() {
        if &bytes[index..index + needle.len()] == needle {
            bytes[index..index + replacement.len()].copy_from_slice(replacement);
            for b in &mut bytes[index + replacement.len()..index + needle.len()] {
                *b = 0;
            }
            index += needle.len();
        } else {
            index += 1;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// homebrew (composite): fetch a bottle, unpack it, relocate it
// ---------------------------------------------------------------------------

pub struct Homebrew;

impl Action for Homebrew {
    fn name(&self) -> &'static str {
        "homebrew"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Composite
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        require_str(params, "formula")?;
        if let Some(url) = optional_str(params, "url")? {
            if !url.starts_with("https://") {
                return Err(param_error("url", "must be an https:// URL"));
            }
        }
        optional_u32(params, "strip_dirs")?;
        Ok(())
    }

    fn execute(&self, _ctx: &ExecutionContext, _params: &toml::Table) -> Result<()> {
        unreachable!("composite actions never execute")
    }

    fn decompose(&self, ctx: &EvalContext, params: &toml::Table) -> Result<Vec<Step>> {
        let formula = require_str(params, "formula")?;
        // ghcr.io serves bottles by tag; the generic tarball redirect keeps
        // this independent of per-digest bottle addressing.
        let url = match optional_str(params, "url")? {
            Some(url) => url,
            None => format!(
                "https://ghcr.io/v2/homebrew/core/{}/blobs/{{version}}",
                formula.replace('@', "/")
            ),
        };
        // Bottle layout: <formula>/<version>/{bin,lib,...}
        let strip_dirs = optional_u32(params, "strip_dirs")?.unwrap_or(2);
        let dest = format!("{formula}-bottle.tar.gz");
        let _ = ctx;

        let mut download = toml::Table::new();
        download.insert("url".into(), toml::Value::String(url));
        download.insert("dest".into(), toml::Value::String(dest.clone()));

        let mut extract = toml::Table::new();
        extract.insert("archive".into(), toml::Value::String(dest));
        extract.insert(
            "format".into(),
            toml::Value::String(ArchiveFormat::TarGz.as_str().to_string()),
        );
        extract.insert("strip_dirs".into(), toml::Value::Integer(strip_dirs as i64));

        let relocate = toml::Table::new();

        Ok(vec![
            Step::new("download_file", download),
            Step::new("extract", extract),
            Step::new("homebrew_relocate", relocate),
        ])
    }
}
