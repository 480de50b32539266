// Post-install verification, in three layers:
//   1. Version output: run the recipe's verify command and look for the
//      (format-transformed) version in its output.
//   2. Path: `bin/<name>` must resolve to a file under the active
//      version's tool directory.
//   3. Integrity: recompute the recorded binary checksums and report
//      OK / MODIFIED / ERROR per file, or SKIPPED when no checksums were
//      recorded (older state files).
//
// Verification never writes: state, tool trees and symlinks are read-only
// to everything in this module.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::error::{Result, TsukuError};
use crate::libs::cancel::CancelToken;
use crate::libs::config::Settings;
use crate::libs::utilities::checksum::sha256_file;
use crate::libs::utilities::process::run_command;
use crate::log_debug;
use crate::schemas::recipe::{VerifyMode, VerifySpec};
use crate::schemas::state_file::{ToolState, VersionState};

/// One layer's outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerOutcome {
    Ok(String),
    Failed(String),
    Skipped(String),
}

impl LayerOutcome {
    pub fn passed(&self) -> bool {
        !matches!(self, LayerOutcome::Failed(_))
    }
}

/// Per-file integrity verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileIntegrity {
    Ok,
    Modified { expected: String, actual: String },
    Error(String),
}

/// The full three-layer report for one tool.
#[derive(Debug)]
pub struct VerifyReport {
    pub tool: String,
    pub version: String,
    pub version_check: LayerOutcome,
    pub path_check: LayerOutcome,
    /// `(relative path, verdict)` per recorded binary; empty plus
    /// `integrity_skipped` when the state predates checksum recording.
    pub integrity: Vec<(String, FileIntegrity)>,
    pub integrity_skipped: bool,
}

impl VerifyReport {
    pub fn passed(&self) -> bool {
        self.version_check.passed()
            && self.path_check.passed()
            && self.integrity.iter().all(|(_, v)| matches!(v, FileIntegrity::Ok))
    }
}

/// Runs all three layers for an installed tool.
pub fn verify_tool(
    tool: &str,
    tool_state: &ToolState,
    verify: Option<&VerifySpec>,
    settings: &Settings,
    cancel: &CancelToken,
) -> Result<VerifyReport> {
    let version = tool_state.active_version.clone();
    let version_state = tool_state.versions.get(&version).ok_or_else(|| {
        TsukuError::State(format!("'{tool}' has no state for active version {version}"))
    })?;

    let version_check = match verify {
        Some(spec) => run_version_check(spec, None, &version, settings, cancel),
        None => LayerOutcome::Skipped("recipe declares no verify command".to_string()),
    };
    let path_check = run_path_check(tool, &version, version_state, settings);
    let (integrity, integrity_skipped) = run_integrity_check(tool, &version, version_state, settings);

    Ok(VerifyReport { tool: tool.to_string(), version, version_check, path_check, integrity, integrity_skipped })
}

/// Install-time verify against a staged bin directory. Only the version
/// layer applies (the tree is not committed yet); failure is fatal to the
/// install.
pub fn verify_staged(
    spec: &VerifySpec,
    staged_bin: &Path,
    version: &str,
    settings: &Settings,
    cancel: &CancelToken,
) -> Result<()> {
    match run_version_check(spec, Some(staged_bin), version, settings, cancel) {
        LayerOutcome::Failed(reason) => Err(TsukuError::Verify(reason)),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Layer 1: version output
// ---------------------------------------------------------------------------

fn run_version_check(
    spec: &VerifySpec,
    bin_override: Option<&Path>,
    version: &str,
    settings: &Settings,
    cancel: &CancelToken,
) -> LayerOutcome {
    // Prefer the staged/installed binary over whatever PATH finds.
    let command_path = match bin_override {
        Some(dir) => dir.join(&spec.command),
        None => settings.bin_dir().join(&spec.command),
    };
    let program = if command_path.exists() {
        command_path.display().to_string()
    } else {
        spec.command.clone()
    };

    let output = match run_command(
        &program,
        &spec.args,
        None,
        &BTreeMap::new(),
        settings.timeouts.verify,
        cancel,
    ) {
        Ok(output) => output,
        Err(err) => return LayerOutcome::Failed(format!("verify command failed to run: {err}")),
    };

    match spec.mode {
        VerifyMode::Functional => {
            if output.success() {
                LayerOutcome::Ok("command exited successfully".to_string())
            } else {
                LayerOutcome::Failed(format!(
                    "verify command exited with {:?}",
                    output.status_code
                ))
            }
        }
        VerifyMode::Output => {
            let needle = spec.pattern.clone().unwrap_or_default();
            let combined = format!("{}{}", output.stdout, output.stderr);
            if combined.contains(&needle) {
                LayerOutcome::Ok(format!("output contains '{needle}'"))
            } else {
                LayerOutcome::Failed(format!("output does not contain '{needle}'"))
            }
        }
        VerifyMode::Version => {
            let transformed = spec.version_format.apply(version);
            let expected = match &spec.pattern {
                Some(pattern) => pattern.replace("{version}", &transformed),
                None => transformed.clone(),
            };
            let combined = format!("{}{}", output.stdout, output.stderr);
            if combined.contains(&expected) {
                LayerOutcome::Ok(format!("reported {transformed}"))
            } else {
                LayerOutcome::Failed(format!(
                    "expected '{expected}' in output, got: {}",
                    combined.lines().next().unwrap_or("<empty>")
                ))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Layer 2: path
// ---------------------------------------------------------------------------

fn run_path_check(
    tool: &str,
    version: &str,
    version_state: &VersionState,
    settings: &Settings,
) -> LayerOutcome {
    let tool_dir = settings.tool_dir(tool, version);
    let canonical_tool_dir = match fs::canonicalize(&tool_dir) {
        Ok(dir) => dir,
        Err(err) => {
            return LayerOutcome::Failed(format!(
                "tool directory {} is missing: {err}",
                tool_dir.display()
            ));
        }
    };

    // Every recorded binary's symlink must resolve into the active tree.
    for binary in &version_state.binaries {
        let link = settings.bin_dir().join(binary);
        let resolved = match fs::canonicalize(&link) {
            Ok(path) => path,
            Err(err) => {
                return LayerOutcome::Failed(format!(
                    "bin/{binary} does not resolve: {err}"
                ));
            }
        };
        if !resolved.starts_with(&canonical_tool_dir) {
            return LayerOutcome::Failed(format!(
                "bin/{binary} resolves to {}, outside {}",
                resolved.display(),
                tool_dir.display()
            ));
        }
        if !resolved.is_file() {
            return LayerOutcome::Failed(format!("bin/{binary} is not a regular file"));
        }
    }
    LayerOutcome::Ok(format!("{} symlink(s) resolve into {}", version_state.binaries.len(), tool_dir.display()))
}

// ---------------------------------------------------------------------------
// Layer 3: integrity
// ---------------------------------------------------------------------------

fn run_integrity_check(
    tool: &str,
    version: &str,
    version_state: &VersionState,
    settings: &Settings,
) -> (Vec<(String, FileIntegrity)>, bool) {
    let Some(checksums) = &version_state.binary_checksums else {
        log_debug!("[Verify] {tool}: no recorded checksums; integrity SKIPPED");
        return (Vec::new(), true);
    };

    let tool_dir = settings.tool_dir(tool, version);
    let mut outcomes = Vec::with_capacity(checksums.len());
    for (rel_path, expected) in checksums {
        let path = tool_dir.join(rel_path);
        let verdict = match sha256_file(&path) {
            Ok(actual) if &actual == expected => FileIntegrity::Ok,
            Ok(actual) => {
                FileIntegrity::Modified { expected: expected.clone(), actual }
            }
            Err(err) => FileIntegrity::Error(err.to_string()),
        };
        outcomes.push((rel_path.clone(), verdict));
    }
    (outcomes, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::utilities::checksum::sha256_bytes;
    use crate::libs::utilities::file_operations::atomic_symlink;
    use crate::schemas::recipe::VersionFormat;

    fn settings_in(dir: &Path) -> Settings {
        Settings::with_home(dir.to_path_buf())
    }

    fn installed_tool(settings: &Settings, tool: &str, version: &str, payload: &[u8]) -> ToolState {
        let tool_dir = settings.tool_dir(tool, version);
        fs::create_dir_all(tool_dir.join("bin")).unwrap();
        fs::write(tool_dir.join("bin").join(tool), payload).unwrap();
        atomic_symlink(&tool_dir.join("bin").join(tool), &settings.bin_dir().join(tool)).unwrap();

        let mut checksums = BTreeMap::new();
        checksums.insert(format!("bin/{tool}"), sha256_bytes(payload));

        let mut versions = BTreeMap::new();
        versions.insert(
            version.to_string(),
            VersionState {
                requested: "latest".into(),
                binaries: vec![tool.to_string()],
                binary_checksums: Some(checksums),
                installed_at: "2026-01-01T00:00:00Z".into(),
                plan: None,
            },
        );
        ToolState {
            active_version: version.to_string(),
            versions,
            install_dependencies: vec![],
            runtime_dependencies: vec![],
        }
    }

    #[test]
    fn intact_install_passes_path_and_integrity() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings_in(tmp.path());
        let tool_state = installed_tool(&settings, "jq", "1.7", b"jq binary bytes");

        let report =
            verify_tool("jq", &tool_state, None, &settings, &CancelToken::new()).unwrap();
        assert!(report.path_check.passed(), "{:?}", report.path_check);
        assert!(!report.integrity_skipped);
        assert_eq!(report.integrity.len(), 1);
        assert!(matches!(report.integrity[0].1, FileIntegrity::Ok));
        // No verify spec: version layer skipped, report still passes.
        assert!(report.passed());
    }

    #[test]
    fn tampering_is_reported_as_modified_with_both_hashes() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings_in(tmp.path());
        let tool_state = installed_tool(&settings, "jq", "1.7", b"jq binary bytes");

        // Flip one byte of the installed binary.
        let target = settings.tool_dir("jq", "1.7").join("bin/jq");
        let mut bytes = fs::read(&target).unwrap();
        bytes[0] ^= 0xff;
        fs::write(&target, &bytes).unwrap();

        let report =
            verify_tool("jq", &tool_state, None, &settings, &CancelToken::new()).unwrap();
        assert!(report.path_check.passed());
        match &report.integrity[0] {
            (path, FileIntegrity::Modified { expected, actual }) => {
                assert_eq!(path, "bin/jq");
                assert_ne!(expected, actual);
                assert_eq!(expected.len(), 64);
                assert_eq!(actual.len(), 64);
            }
            other => panic!("expected Modified, got {other:?}"),
        }
        assert!(!report.passed());
    }

    #[test]
    fn missing_binary_is_an_integrity_error() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings_in(tmp.path());
        let tool_state = installed_tool(&settings, "jq", "1.7", b"bytes");
        fs::remove_file(settings.tool_dir("jq", "1.7").join("bin/jq")).unwrap();

        let report =
            verify_tool("jq", &tool_state, None, &settings, &CancelToken::new()).unwrap();
        assert!(matches!(report.integrity[0].1, FileIntegrity::Error(_)));
        // The dangling symlink also fails the path layer.
        assert!(!report.path_check.passed());
    }

    #[test]
    fn absent_checksums_skip_integrity() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings_in(tmp.path());
        let mut tool_state = installed_tool(&settings, "jq", "1.7", b"bytes");
        tool_state.versions.get_mut("1.7").unwrap().binary_checksums = None;

        let report =
            verify_tool("jq", &tool_state, None, &settings, &CancelToken::new()).unwrap();
        assert!(report.integrity_skipped);
        assert!(report.integrity.is_empty());
        assert!(report.passed());
    }

    #[test]
    fn version_mode_matches_transformed_version_in_output() {
        let tmp = tempfile::tempdir().unwrap();
        let settings = settings_in(tmp.path());
        // An "installed" shell script that reports its version.
        let payload = b"#!/bin/sh\necho \"toolx 2.1.0\"\n";
        let tool_state = installed_tool(&settings, "toolx", "2.1.0", payload);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let p = settings.tool_dir("toolx", "2.1.0").join("bin/toolx");
            fs::set_permissions(&p, fs::Permissions::from_mode(0o755)).unwrap();
        }

        let spec = VerifySpec {
            command: "toolx".into(),
            args: vec![],
            pattern: Some("toolx {version}".into()),
            mode: VerifyMode::Version,
            version_format: VersionFormat::Semver,
            reason: None,
        };
        let report =
            verify_tool("toolx", &tool_state, Some(&spec), &settings, &CancelToken::new())
                .unwrap();
        assert!(report.version_check.passed(), "{:?}", report.version_check);

        // A wrong pattern fails the layer.
        let bad = VerifySpec { pattern: Some("toolx 9.{version}".into()), ..spec };
        let report =
            verify_tool("toolx", &tool_state, Some(&bad), &settings, &CancelToken::new())
                .unwrap();
        assert!(!report.version_check.passed());
    }
}
