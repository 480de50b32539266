// File placement primitives: `chmod`, `install_binaries`,
// `install_libraries` and `link_dependencies`. These are the steps that
// move payloads out of the scratch workspace into the staged tool
// directory; nothing here touches the final prefix until the executor
// commits.

use std::fs;
use std::sync::Arc;

use crate::actions::{
    Action, ActionKind, ExecutionContext, optional_str, optional_str_list, param_error,
    require_str_list,
};
use crate::error::{Result, TsukuError};
use crate::libs::utilities::binary::is_executable_payload;
use crate::libs::utilities::file_operations::{
    atomic_symlink, copy_preserving_mode, set_mode, workspace_path,
};
use crate::{log_debug, log_warn};

pub fn register(add: &mut impl FnMut(Arc<dyn Action>)) {
    add(Arc::new(Chmod));
    add(Arc::new(InstallBinaries));
    add(Arc::new(InstallLibraries));
    add(Arc::new(LinkDependencies));
}

/// Parses a mode parameter written either as an integer or an octal
/// string ("0755"). Defaults to 0755.
fn parse_mode(params: &toml::Table) -> Result<u32> {
    match params.get("mode") {
        None => Ok(0o755),
        Some(toml::Value::Integer(i)) if *i >= 0 => Ok(*i as u32),
        Some(toml::Value::String(s)) => u32::from_str_radix(s.trim_start_matches("0o"), 8)
            .map_err(|_| param_error("mode", format!("'{s}' is not an octal mode"))),
        Some(_) => Err(param_error("mode", "must be an octal string or integer")),
    }
}

// ---------------------------------------------------------------------------
// chmod
// ---------------------------------------------------------------------------

pub struct Chmod;

impl Action for Chmod {
    fn name(&self) -> &'static str {
        "chmod"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        require_str_list(params, "files")?;
        parse_mode(params)?;
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let files = require_str_list(params, "files")?;
        let mode = parse_mode(params)?;
        for file in &files {
            let path = workspace_path(ctx.workspace, file)?;
            if !path.exists() {
                return Err(TsukuError::Execution {
                    command: "chmod".to_string(),
                    reason: format!("'{file}' does not exist in the workspace"),
                });
            }
            set_mode(&path, mode)?;
            log_debug!("[Exec] chmod {:o} {}", mode, file);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// install_binaries
// ---------------------------------------------------------------------------

pub struct InstallBinaries;

impl Action for InstallBinaries {
    fn name(&self) -> &'static str {
        "install_binaries"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        require_str_list(params, "binaries")?;
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let binaries = require_str_list(params, "binaries")?;
        let bin_dir = ctx.tool_dir.join("bin");
        fs::create_dir_all(&bin_dir)?;

        for entry in &binaries {
            let source = workspace_path(ctx.workspace, entry)?;
            if !source.is_file() {
                return Err(TsukuError::Execution {
                    command: "install_binaries".to_string(),
                    reason: format!("'{entry}' does not exist in the workspace"),
                });
            }
            let name = source
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| param_error("binaries", format!("'{entry}' has no file name")))?
                .to_string();

            if !is_executable_payload(&source) {
                log_warn!(
                    "[Exec] '{entry}' does not look like an executable; installing it anyway"
                );
            }

            let dest = bin_dir.join(&name);
            copy_preserving_mode(&source, &dest)?;
            set_mode(&dest, 0o755)?;
            ctx.record_binary(&name);
            log_debug!("[Exec] install_binaries {} -> bin/{}", entry, name);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// install_libraries
// ---------------------------------------------------------------------------

pub struct InstallLibraries;

impl Action for InstallLibraries {
    fn name(&self) -> &'static str {
        "install_libraries"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        require_str_list(params, "libraries")?;
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let libraries = require_str_list(params, "libraries")?;
        let lib_dir = ctx.tool_dir.join("lib");
        fs::create_dir_all(&lib_dir)?;

        for entry in &libraries {
            let source = workspace_path(ctx.workspace, entry)?;
            if !source.is_file() {
                return Err(TsukuError::Execution {
                    command: "install_libraries".to_string(),
                    reason: format!("'{entry}' does not exist in the workspace"),
                });
            }
            let name = source
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| param_error("libraries", format!("'{entry}' has no file name")))?;
            copy_preserving_mode(&source, &lib_dir.join(name))?;
            log_debug!("[Exec] install_libraries {} -> lib/{}", entry, name);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// link_dependencies
// ---------------------------------------------------------------------------

pub struct LinkDependencies;

impl Action for LinkDependencies {
    fn name(&self) -> &'static str {
        "link_dependencies"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        if params.contains_key("dependencies") {
            require_str_list(params, "dependencies")?;
        }
        optional_str(params, "dir")?;
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let requested = optional_str_list(params, "dependencies")?;
        let link_dir_name = optional_str(params, "dir")?.unwrap_or_else(|| "deps".to_string());
        let link_dir = ctx.tool_dir.join(link_dir_name);
        fs::create_dir_all(&link_dir)?;

        let names: Vec<String> = match requested {
            Some(names) => names,
            None => ctx.dependency_dirs.keys().cloned().collect(),
        };

        for name in &names {
            let target = ctx.dependency_dirs.get(name).ok_or_else(|| {
                TsukuError::MissingBuildDependency {
                    name: name.clone(),
                    reason: "not present among this tool's resolved dependencies".to_string(),
                }
            })?;
            atomic_symlink(target, &link_dir.join(name))?;
            log_debug!("[Exec] link_dependencies {} -> {}", name, target.display());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::cancel::CancelToken;
    use crate::libs::config::Settings;
    use crate::libs::utilities::platform::Platform;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::path::Path;

    struct Fixture {
        _tmp: tempfile::TempDir,
        workspace: std::path::PathBuf,
        tool_dir: std::path::PathBuf,
        settings: Settings,
        platform: Platform,
        cancel: CancelToken,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let workspace = tmp.path().join("ws");
            let tool_dir = tmp.path().join("stage");
            fs::create_dir_all(&workspace).unwrap();
            fs::create_dir_all(&tool_dir).unwrap();
            Self {
                settings: Settings::with_home(tmp.path().join("home")),
                workspace,
                tool_dir,
                platform: Platform::for_tests("linux", "amd64", None, ""),
                cancel: CancelToken::new(),
                _tmp: tmp,
            }
        }

        fn ctx(&self) -> ExecutionContext<'_> {
            ExecutionContext {
                workspace: &self.workspace,
                tool_dir: &self.tool_dir,
                settings: &self.settings,
                platform: &self.platform,
                cancel: &self.cancel,
                tool_name: "rg",
                version: "14.1.0",
                dependency_dirs: BTreeMap::new(),
                binaries: RefCell::new(Vec::new()),
                instructions: RefCell::new(Vec::new()),
                build_env: RefCell::new(BTreeMap::new()),
                exec_paths: Vec::new(),
            }
        }
    }

    fn str_list(items: &[&str]) -> toml::Value {
        toml::Value::Array(items.iter().map(|s| toml::Value::String((*s).to_string())).collect())
    }

    #[cfg(unix)]
    #[test]
    fn chmod_sets_the_requested_mode() {
        use std::os::unix::fs::PermissionsExt;
        let fixture = Fixture::new();
        fs::write(fixture.workspace.join("rg"), "bin").unwrap();

        let mut params = toml::Table::new();
        params.insert("files".into(), str_list(&["rg"]));
        Chmod.execute(&fixture.ctx(), &params).unwrap();
        let mode = fs::metadata(fixture.workspace.join("rg")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);

        params.insert("mode".into(), toml::Value::String("0644".into()));
        Chmod.execute(&fixture.ctx(), &params).unwrap();
        let mode = fs::metadata(fixture.workspace.join("rg")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn chmod_fails_on_missing_file() {
        let fixture = Fixture::new();
        let mut params = toml::Table::new();
        params.insert("files".into(), str_list(&["ghost"]));
        let err = Chmod.execute(&fixture.ctx(), &params).unwrap_err();
        assert_eq!(err.kind(), "execution");
    }

    #[test]
    fn install_binaries_copies_and_records() {
        let fixture = Fixture::new();
        fs::write(fixture.workspace.join("rg"), "#!/bin/sh\n").unwrap();

        let ctx = fixture.ctx();
        let mut params = toml::Table::new();
        params.insert("binaries".into(), str_list(&["rg"]));
        InstallBinaries.execute(&ctx, &params).unwrap();

        assert!(fixture.tool_dir.join("bin/rg").is_file());
        assert_eq!(ctx.binaries.borrow().as_slice(), ["rg".to_string()]);
    }

    #[test]
    fn install_binaries_uses_the_basename_for_nested_paths() {
        let fixture = Fixture::new();
        fs::create_dir_all(fixture.workspace.join("out/bin")).unwrap();
        fs::write(fixture.workspace.join("out/bin/tool"), "#!/bin/sh\n").unwrap();

        let ctx = fixture.ctx();
        let mut params = toml::Table::new();
        params.insert("binaries".into(), str_list(&["out/bin/tool"]));
        InstallBinaries.execute(&ctx, &params).unwrap();
        assert!(fixture.tool_dir.join("bin/tool").is_file());
    }

    #[test]
    fn link_dependencies_requires_resolved_deps() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        ctx.dependency_dirs.insert("zlib".into(), Path::new("/opt/zlib").to_path_buf());

        let mut params = toml::Table::new();
        params.insert("dependencies".into(), str_list(&["zlib"]));
        LinkDependencies.execute(&ctx, &params).unwrap();
        assert_eq!(
            fs::read_link(fixture.tool_dir.join("deps/zlib")).unwrap(),
            Path::new("/opt/zlib")
        );

        params.insert("dependencies".into(), str_list(&["missing"]));
        let err = LinkDependencies.execute(&ctx, &params).unwrap_err();
        assert_eq!(err.kind(), "missing-build-dependency");
    }
}
