// Installation Plan Schema
// The plan is the persistable output of evaluation: an ordered list of
// primitive steps with every URL, checksum, size and parameter resolved.
// Replaying a plan must not require the recipe, the resolver, or (for
// deterministic plans) anything beyond the recorded URLs and hashes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Current plan format. Readers accept 2 and 3; writers emit 3.
pub const PLAN_FORMAT_VERSION: u32 = 3;
pub const MIN_PLAN_FORMAT_VERSION: u32 = 2;

/// A fully resolved installation plan for one tool at one version on one
/// platform. Serialized as JSON under `plans/<name>-<version>.json` and
/// embedded into the state file on commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallationPlan {
    pub format_version: u32,
    pub tool: String,
    pub version: String,
    /// `"{os}/{arch}"` tuple the plan was generated for.
    pub platform: String,
    pub generated_at: String,
    /// SHA-256 of the recipe TOML this plan was derived from.
    pub recipe_hash: String,
    /// True iff the plan contains no ecosystem primitive.
    pub deterministic: bool,
    pub steps: Vec<PlanStep>,
    /// Sub-plans for explicit dependencies, in declaration order.
    #[serde(default)]
    pub dependencies: Vec<InstallationPlan>,
}

/// One resolved primitive step. `params` uses a BTreeMap so serialization
/// is byte-stable across evals of the same inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub action: String,
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,
    /// Lowercase hex SHA-256 of the payload; required for `download_file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Captured lockfile contents for ecosystem primitives, keyed by
    /// lockfile kind (`go_sum`, `cargo_lock`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locks: Option<BTreeMap<String, String>>,
}

impl PlanStep {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            params: BTreeMap::new(),
            checksum: None,
            size: None,
            locks: None,
        }
    }

    /// Converts a resolved TOML parameter table into the plan's JSON form.
    pub fn from_params(action: &str, params: &toml::Table) -> Self {
        let mut step = Self::new(action);
        for (key, value) in params {
            step.params.insert(key.clone(), toml_to_json(value));
        }
        step
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_strings(&self, key: &str) -> Vec<String> {
        self.params
            .get(key)
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Re-extracts the parameter table in TOML form for action dispatch,
    /// so preflight/execute share one extraction path with eval.
    pub fn params_as_toml(&self) -> toml::Table {
        let mut table = toml::Table::new();
        for (key, value) in &self.params {
            if let Some(toml_value) = json_to_toml(value) {
                table.insert(key.clone(), toml_value);
            }
        }
        table
    }
}

/// Lossless-enough TOML → JSON conversion for plan parameters. Datetime
/// values render as strings; recipes have no use for them in params anyway.
pub fn toml_to_json(value: &toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s.clone()),
        toml::Value::Integer(i) => serde_json::Value::from(*i),
        toml::Value::Float(f) => {
            serde_json::Number::from_f64(*f).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null)
        }
        toml::Value::Boolean(b) => serde_json::Value::Bool(*b),
        toml::Value::Datetime(d) => serde_json::Value::String(d.to_string()),
        toml::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => serde_json::Value::Object(
            table.iter().map(|(k, v)| (k.clone(), toml_to_json(v))).collect(),
        ),
    }
}

fn json_to_toml(value: &serde_json::Value) -> Option<toml::Value> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some(toml::Value::Boolean(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(toml::Value::Integer(i))
            } else {
                n.as_f64().map(toml::Value::Float)
            }
        }
        serde_json::Value::String(s) => Some(toml::Value::String(s.clone())),
        serde_json::Value::Array(items) => Some(toml::Value::Array(
            items.iter().filter_map(json_to_toml).collect(),
        )),
        serde_json::Value::Object(map) => {
            let mut table = toml::Table::new();
            for (k, v) in map {
                if let Some(tv) = json_to_toml(v) {
                    table.insert(k.clone(), tv);
                }
            }
            Some(toml::Value::Table(table))
        }
    }
}

impl InstallationPlan {
    /// Whether any step (own or dependency) is an ecosystem primitive.
    pub fn has_ecosystem_steps(&self) -> bool {
        self.steps.iter().any(|s| crate::actions::is_ecosystem_primitive(&s.action))
            || self.dependencies.iter().any(|d| d.has_ecosystem_steps())
    }
}
