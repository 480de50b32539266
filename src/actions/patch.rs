// Source patching: the `apply_patch_file` and `text_replace` primitives
// plus the `apply_patch` composite (fetch a patch, then apply it).

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::actions::{
    Action, ActionKind, EvalContext, ExecutionContext, optional_str, optional_u32, param_error,
    require_safe_rel_path, require_str,
};
use crate::error::{Result, TsukuError};
use crate::libs::utilities::file_operations::workspace_path;
use crate::libs::utilities::process::run_checked;
use crate::log_debug;
use crate::schemas::recipe::Step;

pub fn register(add: &mut impl FnMut(Arc<dyn Action>)) {
    add(Arc::new(ApplyPatchFile));
    add(Arc::new(TextReplace));
    add(Arc::new(ApplyPatch));
}

const PATCH_TIMEOUT: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// apply_patch_file (primitive)
// ---------------------------------------------------------------------------

struct ApplyPatchParams {
    patch: String,
    strip: u32,
    /// Directory the patch applies in, workspace-relative.
    target: Option<String>,
}

impl ApplyPatchParams {
    fn from_table(params: &toml::Table) -> Result<Self> {
        let patch = require_safe_rel_path(params, "patch")?;
        let strip = optional_u32(params, "strip")?.unwrap_or(1);
        let target = match optional_str(params, "target")? {
            Some(_) => Some(require_safe_rel_path(params, "target")?),
            None => None,
        };
        Ok(Self { patch, strip, target })
    }
}

pub struct ApplyPatchFile;

impl Action for ApplyPatchFile {
    fn name(&self) -> &'static str {
        "apply_patch_file"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        ApplyPatchParams::from_table(params).map(|_| ())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let parsed = ApplyPatchParams::from_table(params)?;
        let patch_path = workspace_path(ctx.workspace, &parsed.patch)?;
        let cwd = match &parsed.target {
            Some(target) => workspace_path(ctx.workspace, target)?,
            None => ctx.workspace.to_path_buf(),
        };

        let args = vec![
            format!("-p{}", parsed.strip),
            "--batch".to_string(),
            "-i".to_string(),
            patch_path.display().to_string(),
        ];
        log_debug!("[Exec] patch -p{} -i {}", parsed.strip, parsed.patch);
        run_checked("patch", &args, Some(&cwd), &ctx.subprocess_env(), PATCH_TIMEOUT, ctx.cancel)
            .map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// text_replace (primitive)
// ---------------------------------------------------------------------------

struct TextReplaceParams {
    file: String,
    find: String,
    replace: String,
    /// When present, the file must contain exactly this many occurrences.
    count: Option<u32>,
}

impl TextReplaceParams {
    fn from_table(params: &toml::Table) -> Result<Self> {
        let file = require_safe_rel_path(params, "file")?;
        let find = require_str(params, "find")?;
        let replace = match params.get("replace") {
            Some(toml::Value::String(s)) => s.clone(),
            Some(_) => return Err(param_error("replace", "must be a string")),
            None => return Err(param_error("replace", "is required")),
        };
        let count = optional_u32(params, "count")?;
        Ok(Self { file, find, replace, count })
    }
}

pub struct TextReplace;

impl Action for TextReplace {
    fn name(&self) -> &'static str {
        "text_replace"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        TextReplaceParams::from_table(params).map(|_| ())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let parsed = TextReplaceParams::from_table(params)?;
        let path = workspace_path(ctx.workspace, &parsed.file)?;
        let contents = fs::read_to_string(&path).map_err(|e| TsukuError::Execution {
            command: "text_replace".to_string(),
            reason: format!("cannot read '{}': {e}", parsed.file),
        })?;

        // Literal substitution only; no pattern syntax.
        let occurrences = contents.matches(&parsed.find).count() as u32;
        if let Some(expected) = parsed.count {
            if occurrences != expected {
                return Err(TsukuError::Execution {
                    command: "text_replace".to_string(),
                    reason: format!(
                        "expected {expected} occurrence(s) of '{}' in '{}', found {occurrences}",
                        parsed.find, parsed.file
                    ),
                });
            }
        } else if occurrences == 0 {
            return Err(TsukuError::Execution {
                command: "text_replace".to_string(),
                reason: format!("'{}' does not contain '{}'", parsed.file, parsed.find),
            });
        }

        let updated = contents.replace(&parsed.find, &parsed.replace);
        fs::write(&path, updated)?;
        log_debug!("[Exec] text_replace {} ({} occurrence(s))", parsed.file, occurrences);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// apply_patch (composite): download_file + apply_patch_file
// ---------------------------------------------------------------------------

pub struct ApplyPatch;

impl Action for ApplyPatch {
    fn name(&self) -> &'static str {
        "apply_patch"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Composite
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        let url = require_str(params, "url")?;
        if !url.starts_with("https://") {
            return Err(param_error("url", "must be an https:// URL"));
        }
        optional_u32(params, "strip")?;
        Ok(())
    }

    fn execute(&self, _ctx: &ExecutionContext, _params: &toml::Table) -> Result<()> {
        unreachable!("composite actions never execute")
    }

    fn decompose(&self, _ctx: &EvalContext, params: &toml::Table) -> Result<Vec<Step>> {
        let url = require_str(params, "url")?;
        let strip = optional_u32(params, "strip")?.unwrap_or(1);
        let dest = url.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("fix.patch");

        let mut download = toml::Table::new();
        download.insert("url".into(), toml::Value::String(url.clone()));
        download.insert("dest".into(), toml::Value::String(dest.to_string()));

        let mut apply = toml::Table::new();
        apply.insert("patch".into(), toml::Value::String(dest.to_string()));
        apply.insert("strip".into(), toml::Value::Integer(strip as i64));
        if let Some(target) = optional_str(params, "target")? {
            apply.insert("target".into(), toml::Value::String(target));
        }

        Ok(vec![Step::new("download_file", download), Step::new("apply_patch_file", apply)])
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

    fn exec_fixture() -> (tempfile::TempDir, Settings, Platform, CancelToken) {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("ws")).unwrap();
        fs::create_dir_all(tmp.path().join("stage")).unwrap();
        (
            tmp,
            Settings::with_home(std::env::temp_dir().join("tsuku-test-home")),
            Platform::for_tests("linux", "amd64", None, ""),
            CancelToken::new(),
        )
    }

    fn ctx<'a>(
        tmp: &'a tempfile::TempDir,
        settings: &'a Settings,
        platform: &'a Platform,
        cancel: &'a CancelToken,
        workspace: &'a std::path::Path,
        tool_dir: &'a std::path::Path,
    ) -> ExecutionContext<'a> {
        let _ = tmp;
        ExecutionContext {
            workspace,
            tool_dir,
            settings,
            platform,
            cancel,
            tool_name: "t",
            version: "1",
            dependency_dirs: BTreeMap::new(),
            binaries: RefCell::new(Vec::new()),
            instructions: RefCell::new(Vec::new()),
            build_env: RefCell::new(BTreeMap::new()),
            exec_paths: Vec::new(),
        }
    }

    #[test]
    fn text_replace_substitutes_literally() {
        let (tmp, settings, platform, cancel) = exec_fixture();
        let workspace = tmp.path().join("ws");
        let tool_dir = tmp.path().join("stage");
        fs::write(workspace.join("conf"), "prefix=/usr/local\npath=/usr/local/bin\n").unwrap();

        let context = ctx(&tmp, &settings, &platform, &cancel, &workspace, &tool_dir);
        let mut params = toml::Table::new();
        params.insert("file".into(), toml::Value::String("conf".into()));
        params.insert("find".into(), toml::Value::String("/usr/local".into()));
        params.insert("replace".into(), toml::Value::String("/home/u/.tsuku".into()));
        params.insert("count".into(), toml::Value::Integer(2));

        TextReplace.execute(&context, &params).unwrap();
        let contents = fs::read_to_string(workspace.join("conf")).unwrap();
        assert_eq!(contents, "prefix=/home/u/.tsuku\npath=/home/u/.tsuku/bin\n");
    }

    #[test]
    fn text_replace_enforces_the_expected_count() {
        let (tmp, settings, platform, cancel) = exec_fixture();
        let workspace = tmp.path().join("ws");
        let tool_dir = tmp.path().join("stage");
        fs::write(workspace.join("conf"), "one occurrence\n").unwrap();

        let context = ctx(&tmp, &settings, &platform, &cancel, &workspace, &tool_dir);
        let mut params = toml::Table::new();
        params.insert("file".into(), toml::Value::String("conf".into()));
        params.insert("find".into(), toml::Value::String("occurrence".into()));
        params.insert("replace".into(), toml::Value::String("hit".into()));
        params.insert("count".into(), toml::Value::Integer(3));

        let err = TextReplace.execute(&context, &params).unwrap_err();
        assert!(err.to_string().contains("expected 3"));
    }

    #[test]
    fn text_replace_refuses_a_missing_needle() {
        let (tmp, settings, platform, cancel) = exec_fixture();
        let workspace = tmp.path().join("ws");
        let tool_dir = tmp.path().join("stage");
        fs::write(workspace.join("conf"), "nothing to see\n").unwrap();

        let context = ctx(&tmp, &settings, &platform, &cancel, &workspace, &tool_dir);
        let mut params = toml::Table::new();
        params.insert("file".into(), toml::Value::String("conf".into()));
        params.insert("find".into(), toml::Value::String("absent".into()));
        params.insert("replace".into(), toml::Value::String("x".into()));
        assert!(TextReplace.execute(&context, &params).is_err());
    }

    #[test]
    fn apply_patch_decomposes_to_fetch_then_apply() {
        let platform = Platform::for_tests("linux", "amd64", None, "");
        let vars = crate::libs::utilities::templates::TemplateVars::new("1", "1", &platform);
        let settings = Settings::with_home("/tmp/t".into());
        let cancel = CancelToken::new();
        let eval = EvalContext {
            tool_name: "t",
            version: "1",
            vars: &vars,
            settings: &settings,
            cancel: &cancel,
        };

        let mut params = toml::Table::new();
        params.insert("url".into(), toml::Value::String("https://example.com/fix-build.patch".into()));
        params.insert("strip".into(), toml::Value::Integer(0));
        let steps = ApplyPatch.decompose(&eval, &params).unwrap();
        assert_eq!(steps[0].action, "download_file");
        assert_eq!(steps[1].action, "apply_patch_file");
        assert_eq!(steps[1].param_str("patch"), Some("fix-build.patch"));
        assert_eq!(steps[1].params.get("strip").and_then(|v| v.as_integer()), Some(0));
    }
}
