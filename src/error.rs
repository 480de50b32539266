// Crate-wide error taxonomy. Every fallible operation in the eval/exec
// pipeline surfaces one of these kinds; the CLI maps them to exit codes.
//
// Validation is the one aggregating variant: the recipe loader collects every
// structural and semantic problem before failing, so users see all errors in
// one pass instead of fixing them one at a time.

use std::fmt;
use thiserror::Error;

/// A single validation finding, citing the field path it applies to
/// (e.g. `steps[2].params.url`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub field: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self { field: field.into(), message: message.into() }
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// The error kinds of the install pipeline. Stable: the CLI and tests match
/// on these variants, not on message text.
#[derive(Debug, Error)]
pub enum TsukuError {
    /// Recipe malformed, structurally or semantically. Carries every finding.
    #[error("recipe validation failed:\n{}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// No step survived `when` filtering for the current platform.
    #[error("recipe '{recipe}' has no steps applicable to {platform}")]
    UnsupportedPlatform { recipe: String, platform: String },

    /// An upstream version provider failed or returned nothing usable.
    #[error("version resolution failed for '{recipe}': {reason}")]
    VersionResolution { recipe: String, reason: String },

    /// Transport failure, timeout, HTTPS downgrade or SSRF guard trip.
    #[error("network error for {url}: {reason}")]
    Network { url: String, reason: String },

    /// Checksum or size mismatch, archive bomb, or path-traversal entry.
    #[error("integrity violation: {0}")]
    Integrity(String),

    /// A `require_*` precondition failed; `hint` carries install guidance.
    #[error("missing system dependency '{name}': {hint}")]
    MissingSystemDependency { name: String, hint: String },

    /// A declared build or install dependency could not be installed.
    #[error("dependency '{name}' could not be installed: {reason}")]
    MissingBuildDependency { name: String, reason: String },

    /// A subprocess (extractor, build system, patch tool) exited non-zero.
    #[error("command '{command}' failed: {reason}")]
    Execution { command: String, reason: String },

    /// State file locked beyond the timeout, unreadable, or unwritable.
    #[error("state error: {0}")]
    State(String),

    /// The operation was interrupted.
    #[error("operation cancelled")]
    Cancelled,

    /// A post-install verify check did not pass.
    #[error("verification failed: {0}")]
    Verify(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| format!("  - {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl TsukuError {
    /// Short stable class name, used for exit reporting and tests.
    pub fn kind(&self) -> &'static str {
        match self {
            TsukuError::Validation(_) => "validation",
            TsukuError::UnsupportedPlatform { .. } => "unsupported-platform",
            TsukuError::VersionResolution { .. } => "version-resolution",
            TsukuError::Network { .. } => "network",
            TsukuError::Integrity(_) => "integrity",
            TsukuError::MissingSystemDependency { .. } => "missing-system-dependency",
            TsukuError::MissingBuildDependency { .. } => "missing-build-dependency",
            TsukuError::Execution { .. } => "execution",
            TsukuError::State(_) => "state",
            TsukuError::Cancelled => "cancelled",
            TsukuError::Verify(_) => "verify",
            TsukuError::Io(_) => "io",
        }
    }
}

pub type Result<T> = std::result::Result<T, TsukuError>;
