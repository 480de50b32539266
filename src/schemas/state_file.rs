// State File Schema (`state.json`)
// The single JSON database of installed tools. One `ToolState` per tool,
// one `VersionState` per installed version. The file is managed by the
// state store (`libs::state_management`) and should not be edited by hand.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::schemas::plan::InstallationPlan;

pub const STATE_FORMAT_VERSION: u32 = 1;

/// The complete `state.json` document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TsukuState {
    pub version: u32,
    /// Installed tools, keyed by tool name.
    #[serde(default)]
    pub tools: BTreeMap<String, ToolState>,
}

impl Default for TsukuState {
    fn default() -> Self {
        Self { version: STATE_FORMAT_VERSION, tools: BTreeMap::new() }
    }
}

/// Per-tool record: which versions are present and which one is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolState {
    /// The version `bin/<name>` currently points at.
    pub active_version: String,
    /// Installed versions, keyed by normalized version string.
    #[serde(default)]
    pub versions: BTreeMap<String, VersionState>,
    /// Tools that were installed to satisfy this tool's install deps.
    #[serde(default)]
    pub install_dependencies: Vec<String>,
    /// Tools that must remain installed while this tool is used.
    #[serde(default)]
    pub runtime_dependencies: Vec<String>,
}

/// Per-version record, created atomically when an install commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionState {
    /// The version spec the user asked for (`latest`, `1.2`, exact).
    pub requested: String,
    /// Binary names linked into `$TSUKU_HOME/bin`.
    #[serde(default)]
    pub binaries: Vec<String>,
    /// SHA-256 per installed binary, keyed by path relative to the tool
    /// directory. Absent on states written before checksum recording; the
    /// verifier reports SKIPPED in that case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_checksums: Option<BTreeMap<String, String>>,
    pub installed_at: String,
    /// The plan this version was installed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<InstallationPlan>,
}

impl TsukuState {
    /// Records a committed install, replacing any previous record for the
    /// same version and activating it.
    pub fn record_install(
        &mut self,
        tool: &str,
        version: &str,
        entry: VersionState,
        install_deps: Vec<String>,
        runtime_deps: Vec<String>,
    ) {
        let tool_state = self.tools.entry(tool.to_string()).or_insert_with(|| ToolState {
            active_version: version.to_string(),
            versions: BTreeMap::new(),
            install_dependencies: Vec::new(),
            runtime_dependencies: Vec::new(),
        });
        tool_state.versions.insert(version.to_string(), entry);
        tool_state.active_version = version.to_string();
        tool_state.install_dependencies = install_deps;
        tool_state.runtime_dependencies = runtime_deps;
    }

    /// Removes one version. When it was the last version the whole tool
    /// entry goes; when it was the active one, the newest remaining version
    /// is promoted. Returns the new active version, if any remains.
    pub fn remove_version(&mut self, tool: &str, version: &str) -> Option<String> {
        let Some(tool_state) = self.tools.get_mut(tool) else {
            return None;
        };
        tool_state.versions.remove(version);
        if tool_state.versions.is_empty() {
            self.tools.remove(tool);
            return None;
        }
        if tool_state.active_version == version {
            // BTreeMap keeps versions sorted; the last key is the newest
            // by lexicographic order, which matches zero-padded semver well
            // enough for promotion. Users can re-activate explicitly.
            if let Some(newest) = tool_state.versions.keys().next_back().cloned() {
                tool_state.active_version = newest;
            }
        }
        Some(tool_state.active_version.clone())
    }

    pub fn active_version_of(&self, tool: &str) -> Option<&str> {
        self.tools.get(tool).map(|t| t.active_version.as_str())
    }

    pub fn version_state(&self, tool: &str, version: &str) -> Option<&VersionState> {
        self.tools.get(tool).and_then(|t| t.versions.get(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version_entry(requested: &str) -> VersionState {
        VersionState {
            requested: requested.to_string(),
            binaries: vec!["rg".into()],
            binary_checksums: None,
            installed_at: "2026-01-01T00:00:00Z".into(),
            plan: None,
        }
    }

    #[test]
    fn record_and_activate() {
        let mut state = TsukuState::default();
        state.record_install("rg", "14.1.0", version_entry("latest"), vec![], vec![]);
        assert_eq!(state.active_version_of("rg"), Some("14.1.0"));
        assert!(state.version_state("rg", "14.1.0").is_some());
    }

    #[test]
    fn removing_last_version_drops_the_tool() {
        let mut state = TsukuState::default();
        state.record_install("rg", "14.1.0", version_entry("latest"), vec![], vec![]);
        assert_eq!(state.remove_version("rg", "14.1.0"), None);
        assert!(!state.tools.contains_key("rg"));
    }

    #[test]
    fn removing_active_version_promotes_newest_remaining() {
        let mut state = TsukuState::default();
        state.record_install("rg", "13.0.0", version_entry("13.0.0"), vec![], vec![]);
        state.record_install("rg", "14.1.0", version_entry("latest"), vec![], vec![]);
        let active = state.remove_version("rg", "14.1.0");
        assert_eq!(active.as_deref(), Some("13.0.0"));
        assert_eq!(state.active_version_of("rg"), Some("13.0.0"));
    }

    #[test]
    fn older_state_without_checksums_still_parses() {
        let json = r#"{
            "version": 1,
            "tools": {
                "jq": {
                    "active_version": "1.7",
                    "versions": {
                        "1.7": {
                            "requested": "1.7",
                            "binaries": ["jq"],
                            "installed_at": "2026-01-01T00:00:00Z"
                        }
                    }
                }
            }
        }"#;
        let state: TsukuState = serde_json::from_str(json).unwrap();
        let entry = state.version_state("jq", "1.7").unwrap();
        assert!(entry.binary_checksums.is_none());
        assert!(entry.plan.is_none());
    }
}
