// Ecosystem installs: `go_install`, `cargo_install`, `npm_install`,
// `pipx_install`, `gem_install`, `cpan_module` and `nix_install` composites,
// each decomposing to a toolchain probe plus one ecosystem primitive.
//
// Ecosystem primitives are the non-deterministic corner of the plan format:
// they invoke an external toolchain at execution time. Eval pins what it
// can: the package version, the toolchain version, and the dependency
// lockfile captured by `capture_locks`. The plan is marked
// `deterministic = false`. Lockfile-level reproducibility is the contract;
// bit-exact compiler output is not.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::actions::{
    Action, ActionKind, EvalContext, ExecutionContext, optional_str, param_error, require_str,
};
use crate::error::{Result, TsukuError};
use crate::libs::utilities::process::{run_checked, run_command};
use crate::schemas::recipe::Step;
use crate::{log_info, log_warn};

pub fn register(add: &mut impl FnMut(Arc<dyn Action>)) {
    for spec in ECOSYSTEMS {
        add(Arc::new(EcosystemComposite { spec }));
        add(Arc::new(EcosystemPrimitive { spec }));
    }
}

const BUILD_TIMEOUT: Duration = Duration::from_secs(900);
const LOCK_TIMEOUT: Duration = Duration::from_secs(300);

/// Static description of one ecosystem: its composite and primitive names,
/// the toolchain command both need, and the package-parameter key.
pub struct EcosystemSpec {
    composite: &'static str,
    primitive: &'static str,
    toolchain: &'static str,
    /// Recipe-facing parameter naming the package ("module", "crate", ...).
    package_key: &'static str,
}

const ECOSYSTEMS: &[EcosystemSpec] = &[
    EcosystemSpec {
        composite: "go_install",
        primitive: "go_build",
        toolchain: "go",
        package_key: "module",
    },
    EcosystemSpec {
        composite: "cargo_install",
        primitive: "cargo_build",
        toolchain: "cargo",
        package_key: "crate",
    },
    EcosystemSpec {
        composite: "npm_install",
        primitive: "npm_exec",
        toolchain: "npm",
        package_key: "package",
    },
    EcosystemSpec {
        composite: "pipx_install",
        primitive: "pip_install",
        toolchain: "python3",
        package_key: "package",
    },
    EcosystemSpec {
        composite: "gem_install",
        primitive: "gem_exec",
        toolchain: "gem",
        package_key: "gem",
    },
    EcosystemSpec {
        composite: "cpan_module",
        primitive: "cpan_install",
        toolchain: "cpanm",
        package_key: "module",
    },
    EcosystemSpec {
        composite: "nix_install",
        primitive: "nix_realize",
        toolchain: "nix",
        package_key: "attribute",
    },
];

/// Splits an optional `name@version` suffix off a package reference.
fn split_package_version(reference: &str) -> (String, Option<String>) {
    // Leading '@' belongs to scoped npm packages, not a version separator.
    match reference.rfind('@') {
        Some(0) | None => (reference.to_string(), None),
        Some(index) => {
            let (name, version) = reference.split_at(index);
            (name.to_string(), Some(version[1..].trim_start_matches('v').to_string()))
        }
    }
}

// ---------------------------------------------------------------------------
// The composites
// ---------------------------------------------------------------------------

pub struct EcosystemComposite {
    spec: &'static EcosystemSpec,
}

impl EcosystemComposite {
    fn package(&self, params: &toml::Table) -> Result<String> {
        require_str(params, self.spec.package_key)
    }
}

impl Action for EcosystemComposite {
    fn name(&self) -> &'static str {
        self.spec.composite
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Composite
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        let package = self.package(params)?;
        if package.contains(char::is_whitespace) {
            return Err(param_error(self.spec.package_key, "must not contain whitespace"));
        }
        optional_str(params, "binary")?;
        Ok(())
    }

    fn execute(&self, _ctx: &ExecutionContext, _params: &toml::Table) -> Result<()> {
        unreachable!("composite actions never execute")
    }

    fn decompose(&self, ctx: &EvalContext, params: &toml::Table) -> Result<Vec<Step>> {
        let reference = self.package(params)?;
        let (package, pinned) = split_package_version(&reference);
        let version = pinned.unwrap_or_else(|| ctx.version.to_string());

        let mut probe = toml::Table::new();
        probe.insert("command".into(), toml::Value::String(self.spec.toolchain.to_string()));

        let mut primitive = toml::Table::new();
        primitive.insert(self.spec.package_key.to_string(), toml::Value::String(package));
        primitive.insert("version".into(), toml::Value::String(version));
        if let Some(binary) = optional_str(params, "binary")? {
            primitive.insert("binary".into(), toml::Value::String(binary));
        }
        // A recipe that pins its lockfiles carries them straight through;
        // eval then skips the live capture.
        if let Some(locks @ toml::Value::Table(_)) = params.get("locks") {
            primitive.insert("locks".into(), locks.clone());
        }

        Ok(vec![Step::new("require_command", probe), Step::new(self.spec.primitive, primitive)])
    }

    /// Ecosystem references pin their own versions (`module@v1.2.3`), so a
    /// recipe built on one may omit the `[version]` table.
    fn infers_version(&self) -> bool {
        true
    }
}

/// Extracts the pinned version from a composite's package reference, used
/// by the loader/resolver when the recipe has no `[version]` table.
pub fn pinned_version(action: &str, params: &toml::Table) -> Option<String> {
    pinned_reference(action, params).map(|(version, _)| version)
}

/// Like `pinned_version`, but also returns the raw pinned tag (with any
/// `v` prefix intact) for URL templating.
pub fn pinned_reference(action: &str, params: &toml::Table) -> Option<(String, String)> {
    let spec = ECOSYSTEMS.iter().find(|s| s.composite == action)?;
    let reference = params.get(spec.package_key)?.as_str()?;
    let raw = match reference.rfind('@') {
        Some(0) | None => return None,
        Some(index) => reference[index + 1..].to_string(),
    };
    split_package_version(reference).1.map(|version| (version, raw))
}

// ---------------------------------------------------------------------------
// The primitives
// ---------------------------------------------------------------------------

struct PrimitiveParams {
    package: String,
    version: String,
    binary: Option<String>,
}

impl PrimitiveParams {
    fn from_table(spec: &EcosystemSpec, params: &toml::Table) -> Result<Self> {
        Ok(Self {
            package: require_str(params, spec.package_key)?,
            version: require_str(params, "version")?,
            binary: optional_str(params, "binary")?,
        })
    }
}

pub struct EcosystemPrimitive {
    spec: &'static EcosystemSpec,
}

impl Action for EcosystemPrimitive {
    fn name(&self) -> &'static str {
        self.spec.primitive
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        PrimitiveParams::from_table(self.spec, params).map(|_| ())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let parsed = PrimitiveParams::from_table(self.spec, params)?;
        let bin_dir = ctx.tool_dir.join("bin");
        fs::create_dir_all(&bin_dir)?;

        let before = list_binaries(&bin_dir);
        let locks = extract_locks(params);
        log_info!(
            "[Exec] {} {}@{} into {}",
            self.spec.primitive,
            parsed.package,
            parsed.version,
            bin_dir.display()
        );

        match self.spec.primitive {
            "go_build" => self.run_go(ctx, &parsed, &bin_dir)?,
            "cargo_build" => self.run_cargo(ctx, &parsed, &bin_dir, &locks)?,
            "npm_exec" => self.run_npm(ctx, &parsed, &locks)?,
            "pip_install" | "pip_exec" => self.run_pip(ctx, &parsed, &locks)?,
            "gem_exec" => self.run_gem(ctx, &parsed)?,
            "cpan_install" => self.run_cpan(ctx, &parsed)?,
            "nix_realize" => self.run_nix(ctx, &parsed)?,
            other => {
                return Err(TsukuError::Execution {
                    command: other.to_string(),
                    reason: "unknown ecosystem primitive".to_string(),
                });
            }
        }

        // Record whatever new executables the toolchain produced.
        let after = list_binaries(&bin_dir);
        let mut recorded = false;
        for name in &after {
            if !before.contains(name) {
                ctx.record_binary(name);
                recorded = true;
            }
        }
        if !recorded {
            // Toolchains that install elsewhere (npm prefix layouts) still
            // usually name the entry point after the tool.
            let fallback =
                parsed.binary.clone().unwrap_or_else(|| ctx.tool_name.to_string());
            log_warn!(
                "[Exec] {} {} produced no new binaries in {}; recording '{}'",
                ctx.tool_name,
                ctx.version,
                bin_dir.display(),
                fallback
            );
            ctx.record_binary(&fallback);
        }
        Ok(())
    }

    fn capture_locks(
        &self,
        ctx: &EvalContext,
        params: &toml::Table,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let parsed = PrimitiveParams::from_table(self.spec, params)?;
        let scratch = tempfile::tempdir()?;
        let mut locks = BTreeMap::new();

        // Record the locked toolchain version alongside the lockfile.
        if let Ok(output) = run_command(
            self.spec.toolchain,
            &["--version".to_string()],
            None,
            &BTreeMap::new(),
            ctx.settings.timeouts.probe,
            ctx.cancel,
        ) {
            let line = output.stdout.lines().next().unwrap_or_default().trim().to_string();
            if !line.is_empty() {
                locks.insert("toolchain".to_string(), line);
            }
        }

        match self.spec.primitive {
            "go_build" => {
                let env = BTreeMap::new();
                run_checked(
                    "go",
                    &["mod".into(), "init".into(), "tsuku.invalid/lock".into()],
                    Some(scratch.path()),
                    &env,
                    LOCK_TIMEOUT,
                    ctx.cancel,
                )?;
                run_checked(
                    "go",
                    &["get".into(), format!("{}@v{}", parsed.package, parsed.version)],
                    Some(scratch.path()),
                    &env,
                    LOCK_TIMEOUT,
                    ctx.cancel,
                )?;
                locks.insert("go_sum".into(), fs::read_to_string(scratch.path().join("go.sum"))?);
                locks.insert("go_mod".into(), fs::read_to_string(scratch.path().join("go.mod"))?);
            }
            "cargo_build" => {
                let manifest = format!(
                    "[package]\nname = \"tsuku-lock\"\nversion = \"0.0.0\"\nedition = \"2021\"\n\n\
                     [dependencies]\n{} = \"={}\"\n",
                    parsed.package, parsed.version
                );
                fs::write(scratch.path().join("Cargo.toml"), manifest)?;
                fs::create_dir_all(scratch.path().join("src"))?;
                fs::write(scratch.path().join("src/lib.rs"), "")?;
                run_checked(
                    "cargo",
                    &["generate-lockfile".into()],
                    Some(scratch.path()),
                    &BTreeMap::new(),
                    LOCK_TIMEOUT,
                    ctx.cancel,
                )?;
                locks.insert(
                    "cargo_lock".into(),
                    fs::read_to_string(scratch.path().join("Cargo.lock"))?,
                );
            }
            "npm_exec" => {
                run_checked(
                    "npm",
                    &[
                        "install".into(),
                        "--package-lock-only".into(),
                        "--no-audit".into(),
                        format!("{}@{}", parsed.package, parsed.version),
                    ],
                    Some(scratch.path()),
                    &BTreeMap::new(),
                    LOCK_TIMEOUT,
                    ctx.cancel,
                )?;
                locks.insert(
                    "package_lock".into(),
                    fs::read_to_string(scratch.path().join("package-lock.json"))?,
                );
            }
            "pip_install" | "pip_exec" => {
                let report = scratch.path().join("report.json");
                run_checked(
                    "python3",
                    &[
                        "-m".into(),
                        "pip".into(),
                        "install".into(),
                        "--dry-run".into(),
                        "--quiet".into(),
                        "--report".into(),
                        report.display().to_string(),
                        format!("{}=={}", parsed.package, parsed.version),
                    ],
                    Some(scratch.path()),
                    &BTreeMap::new(),
                    LOCK_TIMEOUT,
                    ctx.cancel,
                )?;
                let report_json = fs::read_to_string(&report)?;
                locks.insert("pip_requirements".into(), pip_report_to_requirements(&report_json)?);
            }
            "gem_exec" => {
                let gemfile = format!(
                    "source 'https://rubygems.org'\ngem '{}', '{}'\n",
                    parsed.package, parsed.version
                );
                fs::write(scratch.path().join("Gemfile"), gemfile)?;
                run_checked(
                    "bundle",
                    &["lock".into()],
                    Some(scratch.path()),
                    &BTreeMap::new(),
                    LOCK_TIMEOUT,
                    ctx.cancel,
                )?;
                locks.insert(
                    "gemfile_lock".into(),
                    fs::read_to_string(scratch.path().join("Gemfile.lock"))?,
                );
            }
            "cpan_install" => {
                let output = run_checked(
                    "cpanm",
                    &["--showdeps".into(), "--quiet".into(), parsed.package.clone()],
                    Some(scratch.path()),
                    &BTreeMap::new(),
                    LOCK_TIMEOUT,
                    ctx.cancel,
                )?;
                locks.insert("cpan_deps".into(), output.stdout);
            }
            "nix_realize" => {
                let output = run_checked(
                    "nix",
                    &[
                        "--extra-experimental-features".into(),
                        "nix-command flakes".into(),
                        "flake".into(),
                        "metadata".into(),
                        "--json".into(),
                        "nixpkgs".into(),
                    ],
                    Some(scratch.path()),
                    &BTreeMap::new(),
                    LOCK_TIMEOUT,
                    ctx.cancel,
                )?;
                locks.insert("nixpkgs_pin".into(), output.stdout);
            }
            other => {
                return Err(TsukuError::Execution {
                    command: other.to_string(),
                    reason: "unknown ecosystem primitive".to_string(),
                });
            }
        }

        Ok(Some(locks))
    }
}

impl EcosystemPrimitive {
    fn run_go(
        &self,
        ctx: &ExecutionContext,
        params: &PrimitiveParams,
        bin_dir: &std::path::Path,
    ) -> Result<()> {
        let mut env = ctx.subprocess_env();
        env.insert("GOBIN".into(), bin_dir.display().to_string());
        run_checked(
            "go",
            &["install".into(), format!("{}@v{}", params.package, params.version)],
            Some(ctx.workspace),
            &env,
            BUILD_TIMEOUT,
            ctx.cancel,
        )
        .map(|_| ())
    }

    fn run_cargo(
        &self,
        ctx: &ExecutionContext,
        params: &PrimitiveParams,
        _bin_dir: &std::path::Path,
        locks: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut args = vec![
            "install".to_string(),
            "--root".to_string(),
            ctx.tool_dir.display().to_string(),
            "--version".to_string(),
            params.version.clone(),
        ];
        // Replaying the captured lockfile keeps the dependency set fixed.
        if let Some(lock) = locks.get("cargo_lock") {
            let lock_path = ctx.workspace.join("Cargo.lock");
            fs::write(&lock_path, lock)?;
            args.push("--locked".to_string());
        }
        args.push(params.package.clone());
        run_checked("cargo", &args, Some(ctx.workspace), &ctx.subprocess_env(), BUILD_TIMEOUT, ctx.cancel)
            .map(|_| ())
    }

    fn run_npm(
        &self,
        ctx: &ExecutionContext,
        params: &PrimitiveParams,
        locks: &BTreeMap<String, String>,
    ) -> Result<()> {
        let prefix = ctx.tool_dir.display().to_string();
        if let Some(lock) = locks.get("package_lock") {
            fs::write(ctx.workspace.join("package-lock.json"), lock)?;
        }
        run_checked(
            "npm",
            &[
                "install".into(),
                "--global".into(),
                "--prefix".into(),
                prefix,
                "--no-audit".into(),
                format!("{}@{}", params.package, params.version),
            ],
            Some(ctx.workspace),
            &ctx.subprocess_env(),
            BUILD_TIMEOUT,
            ctx.cancel,
        )
        .map(|_| ())
    }

    fn run_pip(
        &self,
        ctx: &ExecutionContext,
        params: &PrimitiveParams,
        locks: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut args = vec![
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "--prefix".to_string(),
            ctx.tool_dir.display().to_string(),
        ];
        match locks.get("pip_requirements") {
            Some(requirements) if requirements.contains("--hash=") => {
                let req_path = ctx.workspace.join("requirements.txt");
                fs::write(&req_path, requirements)?;
                args.push("--require-hashes".to_string());
                args.push("-r".to_string());
                args.push(req_path.display().to_string());
            }
            _ if ctx.settings.pip_require_hashes => {
                return Err(TsukuError::Integrity(format!(
                    "no hash-pinned requirements captured for {}; \
                     refusing to install (pip hash policy is strict)",
                    params.package
                )));
            }
            _ => {
                log_warn!("[Exec] pip install without pinned hashes for {}", params.package);
                args.push(format!("{}=={}", params.package, params.version));
            }
        }
        run_checked("python3", &args, Some(ctx.workspace), &ctx.subprocess_env(), BUILD_TIMEOUT, ctx.cancel)
            .map(|_| ())
    }

    fn run_gem(&self, ctx: &ExecutionContext, params: &PrimitiveParams) -> Result<()> {
        run_checked(
            "gem",
            &[
                "install".into(),
                params.package.clone(),
                "--version".into(),
                params.version.clone(),
                "--install-dir".into(),
                ctx.tool_dir.join("gems").display().to_string(),
                "--bindir".into(),
                ctx.tool_dir.join("bin").display().to_string(),
                "--no-document".into(),
            ],
            Some(ctx.workspace),
            &ctx.subprocess_env(),
            BUILD_TIMEOUT,
            ctx.cancel,
        )
        .map(|_| ())
    }

    fn run_cpan(&self, ctx: &ExecutionContext, params: &PrimitiveParams) -> Result<()> {
        run_checked(
            "cpanm",
            &[
                "--local-lib".into(),
                ctx.tool_dir.display().to_string(),
                "--notest".into(),
                format!("{}@{}", params.package, params.version),
            ],
            Some(ctx.workspace),
            &ctx.subprocess_env(),
            BUILD_TIMEOUT,
            ctx.cancel,
        )
        .map(|_| ())
    }

    fn run_nix(&self, ctx: &ExecutionContext, params: &PrimitiveParams) -> Result<()> {
        let out_link = ctx.tool_dir.join("nix-result");
        run_checked(
            "nix",
            &[
                "--extra-experimental-features".into(),
                "nix-command flakes".into(),
                "build".into(),
                format!("nixpkgs#{}", params.package),
                "--out-link".into(),
                out_link.display().to_string(),
            ],
            Some(ctx.workspace),
            &ctx.subprocess_env(),
            BUILD_TIMEOUT,
            ctx.cancel,
        )?;
        // Surface the store path's bin entries through the tool dir.
        let store_bin = out_link.join("bin");
        if store_bin.is_dir() {
            let bin_dir = ctx.tool_dir.join("bin");
            fs::create_dir_all(&bin_dir)?;
            for entry in fs::read_dir(&store_bin)? {
                let entry = entry?;
                let name = entry.file_name();
                crate::libs::utilities::file_operations::atomic_symlink(
                    &entry.path(),
                    &bin_dir.join(&name),
                )?;
            }
        }
        Ok(())
    }
}

/// Pulls the `locks` table (injected by the executor from the plan step)
/// out of the parameter table.
fn extract_locks(params: &toml::Table) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(toml::Value::Table(table)) = params.get("locks") {
        for (key, value) in table {
            if let Some(text) = value.as_str() {
                out.insert(key.clone(), text.to_string());
            }
        }
    }
    out
}

fn list_binaries(bin_dir: &std::path::Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(bin_dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .collect()
}

/// Converts pip's `--report` JSON into a hash-pinned requirements file.
fn pip_report_to_requirements(report_json: &str) -> Result<String> {
    let report: serde_json::Value = serde_json::from_str(report_json)
        .map_err(|e| TsukuError::Execution {
            command: "pip".to_string(),
            reason: format!("unreadable install report: {e}"),
        })?;
    let mut lines = Vec::new();
    if let Some(installs) = report.get("install").and_then(|v| v.as_array()) {
        for item in installs {
            let name = item
                .pointer("/metadata/name")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let version = item
                .pointer("/metadata/version")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let hash = item
                .pointer("/download_info/archive_info/hash")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if name.is_empty() || version.is_empty() {
                continue;
            }
            if hash.is_empty() {
                lines.push(format!("{name}=={version}"));
            } else {
                // pip reports "sha256=<hex>"; requirements wants sha256:<hex>.
                lines.push(format!("{name}=={version} --hash={}", hash.replacen('=', ":", 1)));
            }
        }
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::lookup;
    use crate::libs::cancel::CancelToken;
    use crate::libs::config::Settings;
    use crate::libs::utilities::platform::Platform;
    use crate::libs::utilities::templates::TemplateVars;

    #[test]
    fn package_version_splitting() {
        assert_eq!(
            split_package_version("github.com/jesseduffield/lazygit@v0.40.2"),
            ("github.com/jesseduffield/lazygit".to_string(), Some("0.40.2".to_string()))
        );
        assert_eq!(split_package_version("ripgrep"), ("ripgrep".to_string(), None));
        // A scoped npm package with no version keeps its leading @.
        assert_eq!(split_package_version("@biomejs/biome"), ("@biomejs/biome".to_string(), None));
    }

    #[test]
    fn go_install_decomposes_to_probe_plus_build() {
        let platform = Platform::for_tests("linux", "amd64", None, "");
        let vars = TemplateVars::new("0.40.2", "v0.40.2", &platform);
        let settings = Settings::with_home("/tmp/t".into());
        let cancel = CancelToken::new();
        let ctx = EvalContext {
            tool_name: "lazygit",
            version: "0.40.2",
            vars: &vars,
            settings: &settings,
            cancel: &cancel,
        };

        let mut params = toml::Table::new();
        params.insert(
            "module".into(),
            toml::Value::String("github.com/jesseduffield/lazygit@v0.40.2".into()),
        );
        let steps = lookup("go_install").unwrap().decompose(&ctx, &params).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].action, "require_command");
        assert_eq!(steps[0].param_str("command"), Some("go"));
        assert_eq!(steps[1].action, "go_build");
        assert_eq!(steps[1].param_str("module"), Some("github.com/jesseduffield/lazygit"));
        assert_eq!(steps[1].param_str("version"), Some("0.40.2"));
    }

    #[test]
    fn unpinned_reference_takes_the_resolved_version() {
        let platform = Platform::for_tests("linux", "amd64", None, "");
        let vars = TemplateVars::new("14.0.0", "14.0.0", &platform);
        let settings = Settings::with_home("/tmp/t".into());
        let cancel = CancelToken::new();
        let ctx = EvalContext {
            tool_name: "rg",
            version: "14.0.0",
            vars: &vars,
            settings: &settings,
            cancel: &cancel,
        };
        let mut params = toml::Table::new();
        params.insert("crate".into(), toml::Value::String("ripgrep".into()));
        let steps = lookup("cargo_install").unwrap().decompose(&ctx, &params).unwrap();
        assert_eq!(steps[1].param_str("version"), Some("14.0.0"));
    }

    #[test]
    fn pinned_version_lookup_for_version_inference() {
        let mut params = toml::Table::new();
        params.insert(
            "module".into(),
            toml::Value::String("github.com/x/y@v1.2.3".into()),
        );
        assert_eq!(pinned_version("go_install", &params), Some("1.2.3".to_string()));
        assert_eq!(pinned_version("download_archive", &params), None);

        let mut unpinned = toml::Table::new();
        unpinned.insert("module".into(), toml::Value::String("github.com/x/y".into()));
        assert_eq!(pinned_version("go_install", &unpinned), None);
    }

    #[test]
    fn pip_report_conversion_pins_hashes() {
        let report = r#"{
            "install": [
                {
                    "metadata": {"name": "httpie", "version": "3.2.2"},
                    "download_info": {"archive_info": {"hash": "sha256=abc123"}}
                },
                {
                    "metadata": {"name": "requests", "version": "2.31.0"},
                    "download_info": {"archive_info": {}}
                }
            ]
        }"#;
        let requirements = pip_report_to_requirements(report).unwrap();
        assert!(requirements.contains("httpie==3.2.2 --hash=sha256:abc123"));
        assert!(requirements.contains("requests==2.31.0"));
    }

    #[test]
    fn locks_are_extracted_from_injected_params() {
        let mut locks = toml::Table::new();
        locks.insert("go_sum".into(), toml::Value::String("module v1 h1:...".into()));
        let mut params = toml::Table::new();
        params.insert("locks".into(), toml::Value::Table(locks));
        let extracted = extract_locks(&params);
        assert_eq!(extracted.get("go_sum").map(String::as_str), Some("module v1 h1:..."));
    }
}
