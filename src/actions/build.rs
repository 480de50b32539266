// Source builds: the `setup_build_env` and `run_build` primitives and the
// `configure_make` / `cmake_build` / `meson_build` composites that wrap
// fetch + extract + build + install into one recipe step.
//
// Builds install into a staging prefix inside the workspace, and
// `install_binaries` moves the results into the tool directory; the staged
// tool dir stays the only thing that survives an install.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::actions::{
    Action, ActionKind, EvalContext, ExecutionContext, optional_str, optional_str_list,
    optional_u32, param_error, require_safe_rel_path, require_str, require_str_list,
};
use crate::error::{Result, TsukuError};
use crate::libs::utilities::compression::ArchiveFormat;
use crate::libs::utilities::file_operations::workspace_path;
use crate::libs::utilities::process::run_checked;
use crate::log_debug;
use crate::schemas::recipe::Step;

pub fn register(add: &mut impl FnMut(Arc<dyn Action>)) {
    add(Arc::new(SetupBuildEnv));
    add(Arc::new(RunBuild));
    add(Arc::new(BuildComposite { spec: &CONFIGURE_MAKE }));
    add(Arc::new(BuildComposite { spec: &CMAKE_BUILD }));
    add(Arc::new(BuildComposite { spec: &MESON_BUILD }));
}

const BUILD_TIMEOUT: Duration = Duration::from_secs(1800);

/// Staging prefix inside the workspace where `make install` and friends
/// place their output.
const STAGE_PREFIX: &str = "build-install";

// ---------------------------------------------------------------------------
// setup_build_env (primitive)
// ---------------------------------------------------------------------------

/// Validates dependency install dirs and wires their include/lib/pkgconfig
/// paths into the environment every later subprocess inherits.
pub struct SetupBuildEnv;

impl Action for SetupBuildEnv {
    fn name(&self) -> &'static str {
        "setup_build_env"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        if params.contains_key("dependencies") {
            require_str_list(params, "dependencies")?;
        }
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let requested = optional_str_list(params, "dependencies")?;
        let names: Vec<String> = match requested {
            Some(names) => names,
            None => ctx.dependency_dirs.keys().cloned().collect(),
        };

        let mut include_flags = Vec::new();
        let mut lib_flags = Vec::new();
        let mut pkgconfig_paths = Vec::new();

        for name in &names {
            let dir = ctx.dependency_dirs.get(name).ok_or_else(|| {
                TsukuError::MissingBuildDependency {
                    name: name.clone(),
                    reason: "not present among this tool's resolved dependencies".to_string(),
                }
            })?;
            if !dir.is_dir() {
                return Err(TsukuError::MissingBuildDependency {
                    name: name.clone(),
                    reason: format!("install dir {} is missing", dir.display()),
                });
            }
            let include = dir.join("include");
            if include.is_dir() {
                include_flags.push(format!("-I{}", include.display()));
            }
            let lib = dir.join("lib");
            if lib.is_dir() {
                lib_flags.push(format!("-L{}", lib.display()));
                let pkgconfig = lib.join("pkgconfig");
                if pkgconfig.is_dir() {
                    pkgconfig_paths.push(pkgconfig.display().to_string());
                }
            }
        }

        let mut env = ctx.build_env.borrow_mut();
        if !include_flags.is_empty() {
            env.insert("CFLAGS".into(), include_flags.join(" "));
            env.insert("CXXFLAGS".into(), include_flags.join(" "));
        }
        if !lib_flags.is_empty() {
            env.insert("LDFLAGS".into(), lib_flags.join(" "));
        }
        if !pkgconfig_paths.is_empty() {
            env.insert("PKG_CONFIG_PATH".into(), pkgconfig_paths.join(":"));
        }
        log_debug!("[Exec] setup_build_env wired {} dependency dir(s)", names.len());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// run_build (primitive)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildSystem {
    Make,
    Cmake,
    Meson,
}

impl BuildSystem {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "make" => Some(Self::Make),
            "cmake" => Some(Self::Cmake),
            "meson" => Some(Self::Meson),
            _ => None,
        }
    }
}

struct RunBuildParams {
    system: BuildSystem,
    source_dir: String,
    configure_args: Vec<String>,
}

impl RunBuildParams {
    fn from_table(params: &toml::Table) -> Result<Self> {
        let system_raw = require_str(params, "system")?;
        let system = BuildSystem::parse(&system_raw)
            .ok_or_else(|| param_error("system", format!("unknown build system '{system_raw}'")))?;
        let source_dir = match optional_str(params, "source_dir")? {
            Some(_) => require_safe_rel_path(params, "source_dir")?,
            None => ".".to_string(),
        };
        let configure_args = optional_str_list(params, "configure_args")?.unwrap_or_default();
        Ok(Self { system, source_dir, configure_args })
    }
}

pub struct RunBuild;

impl Action for RunBuild {
    fn name(&self) -> &'static str {
        "run_build"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        RunBuildParams::from_table(params).map(|_| ())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let parsed = RunBuildParams::from_table(params)?;
        let source = workspace_path(ctx.workspace, &parsed.source_dir)?;
        let prefix = ctx.workspace.join(STAGE_PREFIX);
        fs::create_dir_all(&prefix)?;
        let env = ctx.subprocess_env();

        match parsed.system {
            BuildSystem::Make => {
                let mut configure = vec![format!("--prefix={}", prefix.display())];
                configure.extend(parsed.configure_args.iter().cloned());
                run_checked("./configure", &configure, Some(&source), &env, BUILD_TIMEOUT, ctx.cancel)?;
                run_checked("make", &[], Some(&source), &env, BUILD_TIMEOUT, ctx.cancel)?;
                run_checked(
                    "make",
                    &["install".to_string()],
                    Some(&source),
                    &env,
                    BUILD_TIMEOUT,
                    ctx.cancel,
                )?;
            }
            BuildSystem::Cmake => {
                let build_dir = ctx.workspace.join("cmake-build");
                let mut configure = vec![
                    "-S".to_string(),
                    source.display().to_string(),
                    "-B".to_string(),
                    build_dir.display().to_string(),
                    format!("-DCMAKE_INSTALL_PREFIX={}", prefix.display()),
                    "-DCMAKE_BUILD_TYPE=Release".to_string(),
                ];
                configure.extend(parsed.configure_args.iter().cloned());
                run_checked("cmake", &configure, Some(ctx.workspace), &env, BUILD_TIMEOUT, ctx.cancel)?;
                run_checked(
                    "cmake",
                    &["--build".to_string(), build_dir.display().to_string()],
                    Some(ctx.workspace),
                    &env,
                    BUILD_TIMEOUT,
                    ctx.cancel,
                )?;
                run_checked(
                    "cmake",
                    &["--install".to_string(), build_dir.display().to_string()],
                    Some(ctx.workspace),
                    &env,
                    BUILD_TIMEOUT,
                    ctx.cancel,
                )?;
            }
            BuildSystem::Meson => {
                let build_dir = ctx.workspace.join("meson-build");
                let mut setup = vec![
                    "setup".to_string(),
                    build_dir.display().to_string(),
                    source.display().to_string(),
                    format!("--prefix={}", prefix.display()),
                ];
                setup.extend(parsed.configure_args.iter().cloned());
                run_checked("meson", &setup, Some(ctx.workspace), &env, BUILD_TIMEOUT, ctx.cancel)?;
                run_checked(
                    "meson",
                    &["compile".to_string(), "-C".to_string(), build_dir.display().to_string()],
                    Some(ctx.workspace),
                    &env,
                    BUILD_TIMEOUT,
                    ctx.cancel,
                )?;
                run_checked(
                    "meson",
                    &["install".to_string(), "-C".to_string(), build_dir.display().to_string()],
                    Some(ctx.workspace),
                    &env,
                    BUILD_TIMEOUT,
                    ctx.cancel,
                )?;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// The build composites
// ---------------------------------------------------------------------------

struct BuildSpec {
    composite: &'static str,
    system: &'static str,
    toolchain: &'static str,
}

const CONFIGURE_MAKE: BuildSpec =
    BuildSpec { composite: "configure_make", system: "make", toolchain: "make" };
const CMAKE_BUILD: BuildSpec =
    BuildSpec { composite: "cmake_build", system: "cmake", toolchain: "cmake" };
const MESON_BUILD: BuildSpec =
    BuildSpec { composite: "meson_build", system: "meson", toolchain: "meson" };

pub struct BuildComposite {
    spec: &'static BuildSpec,
}

impl Action for BuildComposite {
    fn name(&self) -> &'static str {
        self.spec.composite
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Composite
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        if let Some(url) = optional_str(params, "url")? {
            if !url.starts_with("https://") {
                return Err(param_error("url", "must be an https:// URL"));
            }
        }
        require_str_list(params, "binaries")?;
        optional_str_list(params, "configure_args")?;
        optional_u32(params, "strip_dirs")?;
        Ok(())
    }

    fn execute(&self, _ctx: &ExecutionContext, _params: &toml::Table) -> Result<()> {
        unreachable!("composite actions never execute")
    }

    fn decompose(&self, _ctx: &EvalContext, params: &toml::Table) -> Result<Vec<Step>> {
        let binaries = require_str_list(params, "binaries")?;
        let mut steps = Vec::new();

        // Optional source fetch; a recipe may also fetch in earlier steps.
        if let Some(url) = optional_str(params, "url")? {
            let dest =
                url.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("source.tar.gz").to_string();
            let format = ArchiveFormat::from_filename(&dest).ok_or_else(|| {
                param_error("url", format!("cannot infer archive format from '{dest}'"))
            })?;
            let strip_dirs = optional_u32(params, "strip_dirs")?.unwrap_or(1);

            let mut download = toml::Table::new();
            download.insert("url".into(), toml::Value::String(url));
            download.insert("dest".into(), toml::Value::String(dest.clone()));
            steps.push(Step::new("download_file", download));

            let mut extract = toml::Table::new();
            extract.insert("archive".into(), toml::Value::String(dest));
            extract.insert("format".into(), toml::Value::String(format.as_str().to_string()));
            extract.insert("strip_dirs".into(), toml::Value::Integer(strip_dirs as i64));
            steps.push(Step::new("extract", extract));
        }

        let mut probe = toml::Table::new();
        probe.insert("command".into(), toml::Value::String(self.spec.toolchain.to_string()));
        steps.push(Step::new("require_command", probe));

        steps.push(Step::new("setup_build_env", toml::Table::new()));

        let mut build = toml::Table::new();
        build.insert("system".into(), toml::Value::String(self.spec.system.to_string()));
        if let Some(source_dir) = optional_str(params, "source_dir")? {
            build.insert("source_dir".into(), toml::Value::String(source_dir));
        }
        if let Some(args) = optional_str_list(params, "configure_args")? {
            build.insert(
                "configure_args".into(),
                toml::Value::Array(args.into_iter().map(toml::Value::String).collect()),
            );
        }
        steps.push(Step::new("run_build", build));

        let staged: Vec<toml::Value> = binaries
            .iter()
            .map(|b| toml::Value::String(format!("{STAGE_PREFIX}/bin/{b}")))
            .collect();
        let mut install = toml::Table::new();
        install.insert("binaries".into(), toml::Value::Array(staged));
        steps.push(Step::new("install_binaries", install));

        Ok(steps)
    }
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
    fn configure_make_decomposes_fetch_probe_build_install() {
        let platform = Platform::for_tests("linux", "amd64", None, "");
        let vars = TemplateVars::new("1.7.1", "jq-1.7.1", &platform);
        let settings = Settings::with_home("/tmp/t".into());
        let cancel = CancelToken::new();
        let ctx = EvalContext {
            tool_name: "jq",
            version: "1.7.1",
            vars: &vars,
            settings: &settings,
            cancel: &cancel,
        };

        let mut params = toml::Table::new();
        params.insert(
            "url".into(),
            toml::Value::String("https://example.com/jq-{version}.tar.gz".into()),
        );
        params.insert(
            "binaries".into(),
            toml::Value::Array(vec![toml::Value::String("jq".into())]),
        );
        params.insert(
            "configure_args".into(),
            toml::Value::Array(vec![toml::Value::String("--with-oniguruma=builtin".into())]),
        );

        let steps = lookup("configure_make").unwrap().decompose(&ctx, &params).unwrap();
        let actions: Vec<&str> = steps.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(
            actions,
            ["download_file", "extract", "require_command", "setup_build_env", "run_build", "install_binaries"]
        );
        assert_eq!(steps[4].param_str("system"), Some("make"));
        let binaries = steps[5].params.get("binaries").unwrap().as_array().unwrap();
        assert_eq!(binaries[0].as_str(), Some("build-install/bin/jq"));
    }

    #[test]
    fn sourceless_build_skips_fetch_steps() {
        let platform = Platform::for_tests("linux", "amd64", None, "");
        let vars = TemplateVars::new("1", "1", &platform);
        let settings = Settings::with_home("/tmp/t".into());
        let cancel = CancelToken::new();
        let ctx = EvalContext {
            tool_name: "t",
            version: "1",
            vars: &vars,
            settings: &settings,
            cancel: &cancel,
        };
        let mut params = toml::Table::new();
        params.insert(
            "binaries".into(),
            toml::Value::Array(vec![toml::Value::String("tool".into())]),
        );
        let steps = lookup("cmake_build").unwrap().decompose(&ctx, &params).unwrap();
        assert_eq!(steps[0].action, "require_command");
        assert_eq!(steps[0].param_str("command"), Some("cmake"));
    }

    #[test]
    fn run_build_rejects_unknown_systems() {
        let mut params = toml::Table::new();
        params.insert("system".into(), toml::Value::String("bazel".into()));
        assert!(RunBuildParams::from_table(&params).is_err());
    }
}
