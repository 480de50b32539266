// `tsuku which <tool>`: print the path the active symlink resolves to.
// Output goes to stdout so it composes in shell pipelines.

use crate::commands::Runtime;
use crate::error::{Result, TsukuError};

pub fn run(runtime: &Runtime, tool: &str) -> Result<()> {
    let link = runtime.settings.bin_dir().join(tool);
    let resolved = std::fs::canonicalize(&link).map_err(|_| {
        TsukuError::State(format!("'{tool}' is not installed (no {})", link.display()))
    })?;
    println!("{}", resolved.display());
    Ok(())
}
