// Archive extraction for the `extract` primitive. Supports gzip, xz, bzip2
// and zstd compressed tarballs plus zip archives.
//
// Extraction is the main spot where untrusted bytes touch the filesystem, so
// entries are unpacked one at a time instead of through the archive crates'
// bulk helpers: every path is normalized and checked against the workspace
// root, symlink targets are checked the same way, and cumulative size and
// entry-count limits cut off decompression bombs mid-stream.

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use xz2::read::XzDecoder;
use zip::ZipArchive;

use crate::error::{Result, TsukuError};
use crate::log_debug;

/// Bomb guards. Both limits are cumulative across the whole archive.
#[derive(Debug, Clone, Copy)]
pub struct ExtractLimits {
    pub max_entries: u64,
    pub max_total_bytes: u64,
}

impl Default for ExtractLimits {
    fn default() -> Self {
        // Generous enough for toolchain tarballs, far below disk-filling.
        Self { max_entries: 100_000, max_total_bytes: 8 * 1024 * 1024 * 1024 }
    }
}

/// The archive formats the `extract` primitive accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    TarXz,
    TarBz2,
    TarZst,
    Zip,
}

impl ArchiveFormat {
    /// Parses the recipe-facing format string.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "tar.gz" | "tgz" => Some(Self::TarGz),
            "tar.xz" | "txz" => Some(Self::TarXz),
            "tar.bz2" | "tbz2" => Some(Self::TarBz2),
            "tar.zst" | "tzst" => Some(Self::TarZst),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }

    /// Infers the format from a filename, longest suffix first.
    pub fn from_filename(name: &str) -> Option<Self> {
        let lower = name.to_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar.xz") || lower.ends_with(".txz") {
            Some(Self::TarXz)
        } else if lower.ends_with(".tar.bz2") || lower.ends_with(".tbz2") {
            Some(Self::TarBz2)
        } else if lower.ends_with(".tar.zst") || lower.ends_with(".tzst") {
            Some(Self::TarZst)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TarGz => "tar.gz",
            Self::TarXz => "tar.xz",
            Self::TarBz2 => "tar.bz2",
            Self::TarZst => "tar.zst",
            Self::Zip => "zip",
        }
    }
}

/// Extracts `archive` into `dest`, stripping `strip_dirs` leading path
/// components from every entry. `dest` must already exist.
pub fn extract_archive(
    archive: &Path,
    dest: &Path,
    format: ArchiveFormat,
    strip_dirs: u32,
    limits: &ExtractLimits,
) -> Result<()> {
    log_debug!(
        "[Extract] Unpacking {} ({}) into {}",
        archive.display(),
        format.as_str(),
        dest.display()
    );
    let file = File::open(archive)?;
    match format {
        ArchiveFormat::TarGz => extract_tar(GzDecoder::new(file), dest, strip_dirs, limits),
        ArchiveFormat::TarXz => extract_tar(XzDecoder::new(file), dest, strip_dirs, limits),
        ArchiveFormat::TarBz2 => extract_tar(BzDecoder::new(file), dest, strip_dirs, limits),
        ArchiveFormat::TarZst => {
            let decoder = zstd::stream::read::Decoder::new(file)
                .map_err(|e| TsukuError::Integrity(format!("zstd stream error: {e}")))?;
            extract_tar(decoder, dest, strip_dirs, limits)
        }
        ArchiveFormat::Zip => extract_zip(file, dest, strip_dirs, limits),
    }
}

fn extract_tar<R: Read>(
    reader: R,
    dest: &Path,
    strip_dirs: u32,
    limits: &ExtractLimits,
) -> Result<()> {
    let mut archive = Archive::new(reader);
    // Permissions are preserved from entry headers; mtimes are not needed.
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(false);

    let mut entries_seen: u64 = 0;
    let mut bytes_seen: u64 = 0;

    for entry in archive
        .entries()
        .map_err(|e| TsukuError::Integrity(format!("unreadable tar stream: {e}")))?
    {
        let mut entry =
            entry.map_err(|e| TsukuError::Integrity(format!("corrupt tar entry: {e}")))?;

        entries_seen += 1;
        if entries_seen > limits.max_entries {
            return Err(TsukuError::Integrity(format!(
                "archive exceeds entry limit of {}",
                limits.max_entries
            )));
        }

        let raw_path = entry
            .path()
            .map_err(|e| TsukuError::Integrity(format!("undecodable entry path: {e}")))?
            .into_owned();

        let Some(relative) = strip_components(&raw_path, strip_dirs)? else {
            // Entry consumed entirely by strip_dirs (e.g. the top directory).
            continue;
        };
        let target = safe_join(dest, &relative, &raw_path)?;

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
            }
            EntryType::Regular | EntryType::Continuous => {
                bytes_seen = bytes_seen.saturating_add(entry.size());
                if bytes_seen > limits.max_total_bytes {
                    return Err(TsukuError::Integrity(format!(
                        "archive exceeds uncompressed size limit of {} bytes",
                        limits.max_total_bytes
                    )));
                }
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = File::create(&target)?;
                // io::copy with a take() guard: the header size can lie.
                let copied =
                    io::copy(&mut (&mut entry).take(limits.max_total_bytes), &mut out)?;
                if copied > entry.size() {
                    return Err(TsukuError::Integrity(
                        "tar entry larger than its declared size".to_string(),
                    ));
                }
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(mode) = entry.header().mode() {
                        let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode));
                    }
                }
            }
            EntryType::Symlink => {
                let link = entry
                    .link_name()
                    .map_err(|e| TsukuError::Integrity(format!("bad symlink entry: {e}")))?
                    .ok_or_else(|| {
                        TsukuError::Integrity("symlink entry without target".to_string())
                    })?;
                check_link_target(dest, &relative, &link)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                #[cfg(unix)]
                {
                    let _ = fs::remove_file(&target);
                    std::os::unix::fs::symlink(&link, &target)?;
                }
            }
            EntryType::Link => {
                // Hard links must point inside the archive's own tree.
                let link = entry
                    .link_name()
                    .map_err(|e| TsukuError::Integrity(format!("bad hardlink entry: {e}")))?
                    .ok_or_else(|| {
                        TsukuError::Integrity("hardlink entry without target".to_string())
                    })?;
                let Some(link_rel) = strip_components(&link, strip_dirs)? else {
                    continue;
                };
                let link_target = safe_join(dest, &link_rel, &link)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::hard_link(&link_target, &target)?;
            }
            other => {
                log_debug!("[Extract] Skipping unsupported entry type {:?}: {}", other, raw_path.display());
            }
        }
    }
    Ok(())
}

fn extract_zip(file: File, dest: &Path, strip_dirs: u32, limits: &ExtractLimits) -> Result<()> {
    let mut archive = ZipArchive::new(file)
        .map_err(|e| TsukuError::Integrity(format!("unreadable zip archive: {e}")))?;

    if archive.len() as u64 > limits.max_entries {
        return Err(TsukuError::Integrity(format!(
            "archive exceeds entry limit of {}",
            limits.max_entries
        )));
    }

    let mut bytes_seen: u64 = 0;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| TsukuError::Integrity(format!("corrupt zip entry: {e}")))?;

        // enclosed_name already rejects absolute paths and `..`; re-checked
        // below anyway so both container formats share one guard.
        let raw_path = match entry.enclosed_name() {
            Some(p) => p.to_path_buf(),
            None => {
                return Err(TsukuError::Integrity(format!(
                    "zip entry escapes the extraction root: {}",
                    entry.name()
                )));
            }
        };

        let Some(relative) = strip_components(&raw_path, strip_dirs)? else {
            continue;
        };
        let target = safe_join(dest, &relative, &raw_path)?;

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }

        bytes_seen = bytes_seen.saturating_add(entry.size());
        if bytes_seen > limits.max_total_bytes {
            return Err(TsukuError::Integrity(format!(
                "archive exceeds uncompressed size limit of {} bytes",
                limits.max_total_bytes
            )));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                let _ = fs::set_permissions(&target, fs::Permissions::from_mode(mode));
            }
        }
    }
    Ok(())
}

/// Drops `strip` leading normal components. Returns None when the entry has
/// nothing left (it was one of the stripped directories themselves).
/// Absolute paths and `..` components are rejected outright.
fn strip_components(path: &Path, strip: u32) -> Result<Option<PathBuf>> {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => components.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(TsukuError::Integrity(format!(
                    "archive entry contains '..': {}",
                    path.display()
                )));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(TsukuError::Integrity(format!(
                    "archive entry has an absolute path: {}",
                    path.display()
                )));
            }
        }
    }
    if components.len() <= strip as usize {
        return Ok(None);
    }
    Ok(Some(components[strip as usize..].iter().collect()))
}

/// Joins a pre-normalized relative path onto the root and double-checks the
/// result stays a proper descendant.
fn safe_join(root: &Path, relative: &Path, original: &Path) -> Result<PathBuf> {
    let joined = root.join(relative);
    if !joined.starts_with(root) {
        return Err(TsukuError::Integrity(format!(
            "archive entry escapes the extraction root: {}",
            original.display()
        )));
    }
    Ok(joined)
}

/// Validates a symlink target: it must stay within the extraction root when
/// resolved relative to the link's own directory.
fn check_link_target(root: &Path, link_location: &Path, target: &Path) -> Result<()> {
    if target.is_absolute() {
        return Err(TsukuError::Integrity(format!(
            "symlink to absolute path: {}",
            target.display()
        )));
    }
    // Resolve lexically: start at the link's parent, walk the target.
    let mut depth: i64 = link_location.parent().map(|p| p.components().count() as i64).unwrap_or(0);
    for component in target.components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return Err(TsukuError::Integrity(format!(
                        "symlink escapes the extraction root: {} -> {}",
                        link_location.display(),
                        target.display()
                    )));
                }
            }
            Component::CurDir => {}
            Component::RootDir | Component::Prefix(_) => {
                return Err(TsukuError::Integrity(format!(
                    "symlink to absolute path: {}",
                    target.display()
                )));
            }
        }
    }
    let _ = root;
    Ok(())
}
