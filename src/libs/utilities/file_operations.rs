// Filesystem helpers shared by the executor's primitives: atomic symlink
// swaps, permission changes, and checked copies between the workspace and
// the tool directory.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, TsukuError};
use crate::log_debug;

/// Replaces `link` so it points at `target`, atomically: the new symlink is
/// created under a temporary name next to the final one and renamed over it.
/// Readers observe either the old target or the new one, never a missing
/// link.
pub fn atomic_symlink(target: &Path, link: &Path) -> Result<()> {
    let parent = link.parent().ok_or_else(|| {
        TsukuError::State(format!("symlink {} has no parent directory", link.display()))
    })?;
    fs::create_dir_all(parent)?;

    let staging = parent.join(format!(
        ".{}.tmp",
        link.file_name().and_then(|n| n.to_str()).unwrap_or("link")
    ));
    let _ = fs::remove_file(&staging);

    #[cfg(unix)]
    std::os::unix::fs::symlink(target, &staging)?;
    #[cfg(not(unix))]
    return Err(TsukuError::State("symlinks unsupported on this platform".into()));

    fs::rename(&staging, link)?;
    log_debug!("[Fs] {} -> {}", link.display(), target.display());
    Ok(())
}

/// Sets the permission bits on a file (no-op off Unix).
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = (path, mode);
    Ok(())
}

/// Copies `src` to `dest`, creating parent directories and preserving the
/// source's permission bits.
pub fn copy_preserving_mode(src: &Path, dest: &Path) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let copied = fs::copy(src, dest)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(src)?.permissions().mode();
        fs::set_permissions(dest, fs::Permissions::from_mode(mode))?;
    }
    Ok(copied)
}

/// Removes a directory tree if present; absent is fine.
pub fn remove_tree_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Resolves a workspace-relative path and refuses anything that would land
/// outside the workspace. All primitives funnel their path parameters
/// through this.
pub fn workspace_path(workspace: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    if candidate.is_absolute() {
        return Err(TsukuError::Integrity(format!(
            "absolute path not allowed: {relative}"
        )));
    }
    let mut resolved = workspace.to_path_buf();
    for component in candidate.components() {
        match component {
            std::path::Component::Normal(part) => resolved.push(part),
            std::path::Component::CurDir => {}
            _ => {
                return Err(TsukuError::Integrity(format!(
                    "path escapes the workspace: {relative}"
                )));
            }
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symlink_swap_is_observable_and_replaceable() {
        let tmp = tempfile::tempdir().unwrap();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        fs::write(&a, "a").unwrap();
        fs::write(&b, "b").unwrap();
        let link = tmp.path().join("bin").join("tool");

        atomic_symlink(&a, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), a);

        atomic_symlink(&b, &link).unwrap();
        assert_eq!(fs::read_link(&link).unwrap(), b);
        assert_eq!(fs::read_to_string(&link).unwrap(), "b");
    }

    #[test]
    fn workspace_path_rejects_escapes() {
        let ws = Path::new("/ws");
        assert!(workspace_path(ws, "bin/rg").is_ok());
        assert!(workspace_path(ws, "./bin/rg").is_ok());
        assert!(workspace_path(ws, "../outside").is_err());
        assert!(workspace_path(ws, "/etc/passwd").is_err());
        assert!(workspace_path(ws, "a/../../b").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn copy_preserves_executable_bit() {
        use std::os::unix::fs::PermissionsExt;
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("tool");
        fs::write(&src, "#!/bin/true").unwrap();
        fs::set_permissions(&src, fs::Permissions::from_mode(0o755)).unwrap();

        let dest = tmp.path().join("out/tool");
        copy_preserving_mode(&src, &dest).unwrap();
        let mode = fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
