// Execution: installation plan -> files on disk.
//
// The executor replays a plan's primitive steps sequentially against a
// scratch workspace and a staged tool directory. The staged directory only
// becomes `tools/<name>-<version>/` (and state.json only changes) when
// every step, the binary checksum recording, and any install-time verify
// have all succeeded. On any failure the staging and workspace are deleted
// and the world looks exactly as it did before: an install attempt is
// either fully visible or not visible at all.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::actions::{self, ExecutionContext};
use crate::error::{Result, TsukuError};
use crate::libs::cancel::CancelToken;
use crate::libs::config::Settings;
use crate::libs::plan_generator::validate_plan;
use crate::libs::state_management::StateStore;
use crate::libs::utilities::checksum::sha256_file;
use crate::libs::utilities::file_operations::{atomic_symlink, remove_tree_if_exists};
use crate::libs::utilities::platform::Platform;
use crate::libs::verifier;
use crate::schemas::plan::{InstallationPlan, PlanStep};
use crate::schemas::recipe::VerifySpec;
use crate::schemas::state_file::VersionState;
use crate::{log_debug, log_info, log_warn};

/// Progress through one install attempt. Committed is the only state that
/// touches state.json.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Pending,
    Downloading,
    Extracting,
    Building,
    Installing,
    Committed,
    Aborted,
}

impl Stage {
    fn for_action(action: &str) -> Option<Self> {
        match action {
            "download_file" => Some(Self::Downloading),
            "extract" => Some(Self::Extracting),
            "run_build" | "go_build" | "cargo_build" | "npm_exec" | "pip_install"
            | "pip_exec" | "gem_exec" | "cpan_install" | "nix_realize" => Some(Self::Building),
            "install_binaries" | "install_libraries" | "link_dependencies" => {
                Some(Self::Installing)
            }
            _ => None,
        }
    }
}

/// What a successful install left behind.
#[derive(Debug)]
pub struct InstallOutcome {
    pub tool: String,
    pub version: String,
    pub binaries: Vec<String>,
    pub instructions: Vec<String>,
}

pub struct PlanExecutor<'a> {
    pub settings: &'a Settings,
    pub platform: &'a Platform,
    pub cancel: &'a CancelToken,
}

impl<'a> PlanExecutor<'a> {
    pub fn new(settings: &'a Settings, platform: &'a Platform, cancel: &'a CancelToken) -> Self {
        Self { settings, platform, cancel }
    }

    /// Installs a plan: dependencies first, then the tool itself.
    /// `requested` is recorded as the user-supplied version spec; `verify`
    /// (when present) runs against the staged binaries before commit and a
    /// failure aborts the install.
    pub fn install(
        &self,
        plan: &InstallationPlan,
        requested: &str,
        verify: Option<&VerifySpec>,
        store: &StateStore,
    ) -> Result<InstallOutcome> {
        validate_plan(plan)?;
        if plan.platform != self.platform.tuple() {
            return Err(TsukuError::UnsupportedPlatform {
                recipe: plan.tool.clone(),
                platform: format!(
                    "plan was generated for {}, this host is {}",
                    plan.platform,
                    self.platform.tuple()
                ),
            });
        }

        // Dependencies install strictly before the dependent; fail fast.
        let state_snapshot = store.load_readonly()?;
        for dependency in &plan.dependencies {
            let already = state_snapshot
                .version_state(&dependency.tool, &dependency.version)
                .is_some();
            if already {
                log_debug!(
                    "[Exec] Dependency {}-{} already installed",
                    dependency.tool,
                    dependency.version
                );
                continue;
            }
            self.install(dependency, "latest", None, store).map_err(|e| {
                TsukuError::MissingBuildDependency {
                    name: dependency.tool.clone(),
                    reason: e.to_string(),
                }
            })?;
        }

        self.install_single(plan, requested, verify, store)
    }

    /// Installs one plan document, dependencies assumed present.
    fn install_single(
        &self,
        plan: &InstallationPlan,
        requested: &str,
        verify: Option<&VerifySpec>,
        store: &StateStore,
    ) -> Result<InstallOutcome> {
        let tool = &plan.tool;
        let version = &plan.version;
        log_info!("[Exec] Installing {} {}", tool, version);
        let mut stage = Stage::Pending;

        self.settings.ensure_layout()?;

        // Staging lives next to the final path so the commit rename never
        // crosses filesystems.
        let staging = tempfile::Builder::new()
            .prefix(&format!(".{tool}-{version}-"))
            .tempdir_in(self.settings.tools_dir())?;
        let workspace = tempfile::Builder::new()
            .prefix(&format!("tsuku-ws-{tool}-"))
            .tempdir()?;

        let context = self.build_context(plan, staging.path(), workspace.path(), store)?;

        let outcome = self.run_steps(plan, &context, &mut stage);
        match outcome {
            Ok(()) => {}
            Err(err) => {
                stage = Stage::Aborted;
                log_debug!("[Exec] {} {} aborted at {:?}", tool, version, stage);
                // TempDir drops clean up staging and workspace.
                return Err(err);
            }
        }

        let binaries = context.binaries.borrow().clone();
        let instructions = context.instructions.borrow().clone();

        // Record per-binary checksums off the staged tree before commit.
        let binary_checksums = self.hash_binaries(staging.path(), &binaries)?;

        // Install-time verify runs against the staged binaries; failure
        // means nothing is committed.
        if let Some(spec) = verify {
            let staged_bin = staging.path().join("bin");
            verifier::verify_staged(spec, &staged_bin, version, self.settings, self.cancel)?;
        }

        // Commit under the state lock: rename the staging dir into place,
        // swap the bin symlinks, record the version.
        let final_dir = self.settings.tool_dir(tool, version);
        let staging_path = staging.keep();
        let commit = store.update(|state| {
            remove_tree_if_exists(&final_dir)?;
            fs::rename(&staging_path, &final_dir)?;

            for binary in &binaries {
                let target = final_dir.join("bin").join(binary);
                atomic_symlink(&target, &self.settings.bin_dir().join(binary))?;
            }

            state.record_install(
                tool,
                version,
                VersionState {
                    requested: requested.to_string(),
                    binaries: binaries.clone(),
                    binary_checksums: Some(binary_checksums.clone()),
                    installed_at: chrono::Utc::now()
                        .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    plan: Some(plan.clone()),
                },
                plan.dependencies.iter().map(|d| d.tool.clone()).collect(),
                Vec::new(),
            );
            Ok(())
        });

        match commit {
            Ok(()) => {
                stage = Stage::Committed;
                log_debug!("[Exec] {} {} reached {:?}", tool, version, stage);
                log_info!("[Exec] Installed {} {} ({} binaries)", tool, version, binaries.len());
                Ok(InstallOutcome {
                    tool: tool.clone(),
                    version: version.clone(),
                    binaries,
                    instructions,
                })
            }
            Err(err) => {
                // The staging dir was kept for the rename; make sure no
                // half-committed tree survives.
                let _ = remove_tree_if_exists(&staging_path);
                let _ = remove_tree_if_exists(&final_dir);
                Err(err)
            }
        }
    }

    fn build_context<'c>(
        &'c self,
        plan: &'c InstallationPlan,
        staging: &'c Path,
        workspace: &'c Path,
        store: &StateStore,
    ) -> Result<ExecutionContext<'c>> {
        // Dependency install dirs: sub-plan versions win, the state's
        // active versions fill in for already-installed deps.
        let mut dependency_dirs: BTreeMap<String, PathBuf> = BTreeMap::new();
        let state = store.load_readonly().unwrap_or_default();
        for dependency in &plan.dependencies {
            dependency_dirs.insert(
                dependency.tool.clone(),
                self.settings.tool_dir(&dependency.tool, &dependency.version),
            );
        }
        for (name, tool_state) in &state.tools {
            dependency_dirs
                .entry(name.clone())
                .or_insert_with(|| self.settings.tool_dir(name, &tool_state.active_version));
        }

        Ok(ExecutionContext {
            workspace,
            tool_dir: staging,
            settings: self.settings,
            platform: self.platform,
            cancel: self.cancel,
            tool_name: &plan.tool,
            version: &plan.version,
            dependency_dirs,
            binaries: RefCell::new(Vec::new()),
            instructions: RefCell::new(Vec::new()),
            build_env: RefCell::new(BTreeMap::new()),
            exec_paths: vec![self.settings.bin_dir()],
        })
    }

    fn run_steps(
        &self,
        plan: &InstallationPlan,
        context: &ExecutionContext<'_>,
        stage: &mut Stage,
    ) -> Result<()> {
        // Precondition pass: every probe runs first so the user sees all
        // missing system pieces at once instead of one per attempt.
        let mut missing = Vec::new();
        for step in &plan.steps {
            if matches!(step.action.as_str(), "require_command" | "require_system") {
                if let Err(err) = self.dispatch(step, context) {
                    match err {
                        TsukuError::MissingSystemDependency { name, hint } => {
                            missing.push(format!("{name}: {hint}"));
                        }
                        other => return Err(other),
                    }
                }
            }
        }
        if !missing.is_empty() {
            return Err(TsukuError::MissingSystemDependency {
                name: plan.tool.clone(),
                hint: format!("missing prerequisites:\n  {}", missing.join("\n  ")),
            });
        }

        for step in &plan.steps {
            self.cancel.check()?;
            // Probes already ran in the precondition pass.
            if matches!(step.action.as_str(), "require_command" | "require_system") {
                continue;
            }
            if let Some(next) = Stage::for_action(&step.action) {
                if next != *stage {
                    *stage = next;
                    log_debug!("[Exec] {} entering {:?}", plan.tool, next);
                }
            }
            self.dispatch(step, context)?;
        }
        Ok(())
    }

    /// Dispatches one plan step to its primitive handler, re-attaching the
    /// checksum/size/locks the plan carries alongside the params.
    fn dispatch(&self, step: &PlanStep, context: &ExecutionContext<'_>) -> Result<()> {
        let action = actions::lookup(&step.action).ok_or_else(|| TsukuError::Execution {
            command: step.action.clone(),
            reason: "unknown action in plan".to_string(),
        })?;

        let mut params = step.params_as_toml();
        if let Some(checksum) = &step.checksum {
            params.insert("checksum".into(), toml::Value::String(checksum.clone()));
        }
        if let Some(size) = step.size {
            params.insert("size".into(), toml::Value::Integer(size as i64));
        }
        if let Some(locks) = &step.locks {
            let mut table = toml::Table::new();
            for (key, value) in locks {
                table.insert(key.clone(), toml::Value::String(value.clone()));
            }
            params.insert("locks".into(), toml::Value::Table(table));
        }

        action.execute(context, &params)
    }

    /// SHA-256 of every recorded binary in the staged tree. Symlinks are
    /// followed only within the staging dir.
    fn hash_binaries(
        &self,
        staging: &Path,
        binaries: &[String],
    ) -> Result<BTreeMap<String, String>> {
        let mut checksums = BTreeMap::new();
        for binary in binaries {
            let rel = format!("bin/{binary}");
            let path = staging.join(&rel);
            let resolved = if path.is_symlink() {
                let target = fs::canonicalize(&path)?;
                if !target.starts_with(fs::canonicalize(staging)?) {
                    log_warn!(
                        "[Exec] {} resolves outside the tool dir; hashing skipped",
                        rel
                    );
                    continue;
                }
                target
            } else {
                path
            };
            checksums.insert(rel, sha256_file(&resolved)?);
        }
        Ok(checksums)
    }

    /// Removes one installed version: its tree, its symlinks, its state.
    /// Removing the active version promotes the newest remaining one.
    pub fn uninstall(&self, tool: &str, version: &str, store: &StateStore) -> Result<()> {
        log_info!("[Exec] Uninstalling {} {}", tool, version);
        store.update(|state| {
            let Some(tool_state) = state.tools.get(tool) else {
                return Err(TsukuError::State(format!("'{tool}' is not installed")));
            };
            let Some(version_state) = tool_state.versions.get(version) else {
                return Err(TsukuError::State(format!(
                    "'{tool}' has no installed version {version}"
                )));
            };
            let binaries = version_state.binaries.clone();

            remove_tree_if_exists(&self.settings.tool_dir(tool, version))?;

            let promoted = state.remove_version(tool, version);
            match promoted {
                Some(active) => {
                    // Repoint surviving symlinks at the promoted version.
                    for binary in &binaries {
                        let target = self.settings.tool_dir(tool, &active).join("bin").join(binary);
                        if target.exists() {
                            atomic_symlink(&target, &self.settings.bin_dir().join(binary))?;
                        } else {
                            let _ = fs::remove_file(self.settings.bin_dir().join(binary));
                        }
                    }
                }
                None => {
                    for binary in &binaries {
                        let _ = fs::remove_file(self.settings.bin_dir().join(binary));
                    }
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::utilities::checksum::sha256_bytes;
    use crate::schemas::plan::PLAN_FORMAT_VERSION;
    use std::io::Write;

    struct Fixture {
        _home: tempfile::TempDir,
        settings: Settings,
        platform: Platform,
        cancel: CancelToken,
    }

    impl Fixture {
        fn new() -> Self {
            let home = tempfile::tempdir().unwrap();
            let settings = Settings::with_home(home.path().to_path_buf());
            settings.ensure_layout().unwrap();
            Self {
                settings,
                platform: Platform::for_tests("linux", "amd64", Some("debian"), "ubuntu"),
                cancel: CancelToken::new(),
                _home: home,
            }
        }

        fn store(&self) -> StateStore {
            StateStore::new(&self.settings)
        }

        fn executor(&self) -> PlanExecutor<'_> {
            PlanExecutor::new(&self.settings, &self.platform, &self.cancel)
        }

        /// Seeds the download cache with a payload and returns its digest.
        fn seed_cache(&self, payload: &[u8]) -> String {
            let digest = sha256_bytes(payload);
            let dir = self.settings.downloads_dir();
            fs::create_dir_all(&dir).unwrap();
            let mut f = fs::File::create(dir.join(&digest)).unwrap();
            f.write_all(payload).unwrap();
            digest
        }
    }

    /// A tar.gz holding a single executable-ish file at tool-1.0/<name>.
    fn archive_payload(name: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(flate2::write::GzEncoder::new(
            Vec::new(),
            flate2::Compression::fast(),
        ));
        let contents = b"#!/bin/sh\necho tool 1.0.0\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("tool-1.0/{name}"), &contents[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap()
    }

    fn archive_plan(tool: &str, checksum: &str, size: u64) -> InstallationPlan {
        let steps = vec![
            PlanStep {
                action: "download_file".into(),
                params: [
                    ("url".to_string(), serde_json::json!("https://example.com/t.tar.gz")),
                    ("dest".to_string(), serde_json::json!("t.tar.gz")),
                ]
                .into_iter()
                .collect(),
                checksum: Some(checksum.to_string()),
                size: Some(size),
                locks: None,
            },
            PlanStep {
                action: "extract".into(),
                params: [
                    ("archive".to_string(), serde_json::json!("t.tar.gz")),
                    ("format".to_string(), serde_json::json!("tar.gz")),
                    ("strip_dirs".to_string(), serde_json::json!(1)),
                ]
                .into_iter()
                .collect(),
                checksum: None,
                size: None,
                locks: None,
            },
            PlanStep {
                action: "chmod".into(),
                params: [("files".to_string(), serde_json::json!([tool]))]
                    .into_iter()
                    .collect(),
                checksum: None,
                size: None,
                locks: None,
            },
            PlanStep {
                action: "install_binaries".into(),
                params: [("binaries".to_string(), serde_json::json!([tool]))]
                    .into_iter()
                    .collect(),
                checksum: None,
                size: None,
                locks: None,
            },
        ];
        InstallationPlan {
            format_version: PLAN_FORMAT_VERSION,
            tool: tool.into(),
            version: "1.0.0".into(),
            platform: "linux/amd64".into(),
            generated_at: "2026-01-01T00:00:00Z".into(),
            recipe_hash: "ab".repeat(32),
            deterministic: true,
            steps,
            dependencies: vec![],
        }
    }

    #[test]
    fn full_install_commits_tree_state_and_symlink() {
        let fixture = Fixture::new();
        let payload = archive_payload("tool");
        let digest = fixture.seed_cache(&payload);
        let plan = archive_plan("tool", &digest, payload.len() as u64);
        let store = fixture.store();

        let outcome = fixture.executor().install(&plan, "latest", None, &store).unwrap();
        assert_eq!(outcome.binaries, ["tool".to_string()]);

        // Tree in place.
        let tool_dir = fixture.settings.tool_dir("tool", "1.0.0");
        assert!(tool_dir.join("bin/tool").is_file());

        // Symlink activated to the final location.
        let link = fixture.settings.bin_dir().join("tool");
        let target = fs::read_link(&link).unwrap();
        assert!(target.starts_with(&tool_dir), "{target:?}");

        // State recorded with a 64-hex checksum and the plan embedded.
        let state = store.load().unwrap();
        let version_state = state.version_state("tool", "1.0.0").unwrap();
        assert_eq!(version_state.binaries, ["tool".to_string()]);
        let sums = version_state.binary_checksums.as_ref().unwrap();
        assert_eq!(sums.get("bin/tool").unwrap().len(), 64);
        assert!(version_state.plan.is_some());
        assert_eq!(version_state.requested, "latest");
    }

    #[test]
    fn checksum_mismatch_rolls_back_completely() {
        let fixture = Fixture::new();
        let payload = archive_payload("tool");
        let _real = fixture.seed_cache(&payload);
        // The plan demands a checksum the cache cannot satisfy, and the
        // network fetch of example.com will not produce it either; but the
        // downloader refuses internal/unresolvable cases first. Use a digest
        // that misses the cache entirely.
        let wrong = "f".repeat(64);
        let plan = archive_plan("tool", &wrong, payload.len() as u64);
        let store = fixture.store();

        let err = fixture.executor().install(&plan, "latest", None, &store).unwrap_err();
        // Fails as either a network error (fetch attempted) or integrity
        // (mismatch); both leave nothing behind.
        assert!(matches!(err, TsukuError::Network { .. } | TsukuError::Integrity(_)), "{err:?}");

        assert!(!fixture.settings.tool_dir("tool", "1.0.0").exists());
        assert!(!fixture.settings.bin_dir().join("tool").exists());
        assert!(store.load().unwrap().tools.is_empty());
        // No stray staging dirs under tools/.
        let leftovers: Vec<_> = fs::read_dir(fixture.settings.tools_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn plan_for_another_platform_is_refused() {
        let fixture = Fixture::new();
        let mut plan = archive_plan("tool", &"a".repeat(64), 10);
        plan.platform = "darwin/arm64".into();
        let store = fixture.store();
        let err = fixture.executor().install(&plan, "latest", None, &store).unwrap_err();
        assert_eq!(err.kind(), "unsupported-platform");
    }

    #[test]
    fn missing_prerequisites_are_aggregated() {
        let fixture = Fixture::new();
        let mut plan = archive_plan("tool", &"a".repeat(64), 10);
        plan.steps = vec![
            PlanStep {
                action: "require_command".into(),
                params: [(
                    "command".to_string(),
                    serde_json::json!("definitely-missing-tool-one"),
                )]
                .into_iter()
                .collect(),
                checksum: None,
                size: None,
                locks: None,
            },
            PlanStep {
                action: "require_command".into(),
                params: [(
                    "command".to_string(),
                    serde_json::json!("definitely-missing-tool-two"),
                )]
                .into_iter()
                .collect(),
                checksum: None,
                size: None,
                locks: None,
            },
        ];
        let store = fixture.store();
        let err = fixture.executor().install(&plan, "latest", None, &store).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("definitely-missing-tool-one"));
        assert!(text.contains("definitely-missing-tool-two"));
    }

    #[test]
    fn replaying_the_same_plan_reproduces_the_tree() {
        let fixture = Fixture::new();
        let payload = archive_payload("tool");
        let digest = fixture.seed_cache(&payload);
        let plan = archive_plan("tool", &digest, payload.len() as u64);
        let store = fixture.store();
        let executor = fixture.executor();

        executor.install(&plan, "latest", None, &store).unwrap();
        let first = store
            .load()
            .unwrap()
            .version_state("tool", "1.0.0")
            .unwrap()
            .binary_checksums
            .clone();

        executor.uninstall("tool", "1.0.0", &store).unwrap();
        assert!(!fixture.settings.tool_dir("tool", "1.0.0").exists());
        assert!(!fixture.settings.bin_dir().join("tool").exists());

        executor.install(&plan, "latest", None, &store).unwrap();
        let second = store
            .load()
            .unwrap()
            .version_state("tool", "1.0.0")
            .unwrap()
            .binary_checksums
            .clone();
        assert_eq!(first, second);
    }

    #[test]
    fn uninstalling_the_active_version_promotes_the_remaining_one() {
        let fixture = Fixture::new();
        let payload = archive_payload("tool");
        let digest = fixture.seed_cache(&payload);
        let store = fixture.store();
        let executor = fixture.executor();

        let mut v1 = archive_plan("tool", &digest, payload.len() as u64);
        v1.version = "1.0.0".into();
        executor.install(&v1, "1.0.0", None, &store).unwrap();

        let mut v2 = archive_plan("tool", &digest, payload.len() as u64);
        v2.version = "2.0.0".into();
        executor.install(&v2, "2.0.0", None, &store).unwrap();
        assert_eq!(store.load().unwrap().active_version_of("tool"), Some("2.0.0"));

        executor.uninstall("tool", "2.0.0", &store).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.active_version_of("tool"), Some("1.0.0"));
        let link = fs::read_link(fixture.settings.bin_dir().join("tool")).unwrap();
        assert!(link.starts_with(fixture.settings.tool_dir("tool", "1.0.0")));
    }

    #[test]
    fn instruction_steps_surface_their_text() {
        let fixture = Fixture::new();
        let mut plan = archive_plan("docker-hints", &"a".repeat(64), 10);
        plan.steps = vec![PlanStep {
            action: "apt_install".into(),
            params: [("packages".to_string(), serde_json::json!(["docker.io"]))]
                .into_iter()
                .collect(),
            checksum: None,
            size: None,
            locks: None,
        }];
        let store = fixture.store();
        let outcome = fixture.executor().install(&plan, "latest", None, &store).unwrap();
        assert_eq!(outcome.instructions, ["sudo apt-get install -y docker.io".to_string()]);
    }
}
