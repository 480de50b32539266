// The `extract` primitive: unpack an archive from the workspace into the
// workspace, under the bomb and path-escape guards in
// `libs::utilities::compression`.

use std::sync::Arc;

use crate::actions::{
    Action, ActionKind, ExecutionContext, optional_str, optional_u32, param_error,
    require_safe_rel_path,
};
use crate::error::Result;
use crate::libs::utilities::compression::{ArchiveFormat, ExtractLimits, extract_archive};
use crate::libs::utilities::file_operations::workspace_path;
use crate::log_debug;

pub fn register(add: &mut impl FnMut(Arc<dyn Action>)) {
    add(Arc::new(Extract));
}

struct ExtractParams {
    archive: String,
    format: ArchiveFormat,
    strip_dirs: u32,
}

impl ExtractParams {
    fn from_table(params: &toml::Table) -> Result<Self> {
        let archive = require_safe_rel_path(params, "archive")?;
        let format = match optional_str(params, "format")? {
            Some(value) => ArchiveFormat::parse(&value)
                .ok_or_else(|| param_error("format", format!("unsupported format '{value}'")))?,
            None => ArchiveFormat::from_filename(&archive).ok_or_else(|| {
                param_error("archive", format!("cannot infer archive format from '{archive}'"))
            })?,
        };
        let strip_dirs = optional_u32(params, "strip_dirs")?.unwrap_or(0);
        Ok(Self { archive, format, strip_dirs })
    }
}

pub struct Extract;

impl Action for Extract {
    fn name(&self) -> &'static str {
        "extract"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        ExtractParams::from_table(params).map(|_| ())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let parsed = ExtractParams::from_table(params)?;
        ctx.cancel.check()?;
        let archive = workspace_path(ctx.workspace, &parsed.archive)?;
        log_debug!("[Exec] extract {} (strip_dirs={})", parsed.archive, parsed.strip_dirs);
        extract_archive(
            &archive,
            ctx.workspace,
            parsed.format,
            parsed.strip_dirs,
            &ExtractLimits::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_inference_and_override() {
        let mut params = toml::Table::new();
        params.insert("archive".into(), toml::Value::String("x.tar.gz".into()));
        let parsed = ExtractParams::from_table(&params).unwrap();
        assert_eq!(parsed.format, ArchiveFormat::TarGz);
        assert_eq!(parsed.strip_dirs, 0);

        params.insert("format".into(), toml::Value::String("zip".into()));
        params.insert("strip_dirs".into(), toml::Value::Integer(2));
        let parsed = ExtractParams::from_table(&params).unwrap();
        assert_eq!(parsed.format, ArchiveFormat::Zip);
        assert_eq!(parsed.strip_dirs, 2);
    }

    #[test]
    fn unknown_extension_requires_explicit_format() {
        let mut params = toml::Table::new();
        params.insert("archive".into(), toml::Value::String("payload.bin".into()));
        assert!(ExtractParams::from_table(&params).is_err());
    }
}
