// Template variable expansion for step parameters. During eval, string
// parameters may reference the resolved version and platform facts with
// `{version}`-style tokens; everything is expanded before a step lands in
// the plan, so execution never sees a template.

use std::collections::BTreeMap;

use crate::libs::utilities::platform::Platform;

/// The token values available to one eval run.
#[derive(Debug, Clone)]
pub struct TemplateVars {
    vars: BTreeMap<&'static str, String>,
}

impl TemplateVars {
    /// Builds the standard token set: `{version}`, `{raw_version}`, `{os}`,
    /// `{arch}`, `{linux_family}`.
    pub fn new(version: &str, raw_version: &str, platform: &Platform) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("version", version.to_string());
        vars.insert("raw_version", raw_version.to_string());
        vars.insert("os", platform.os.clone());
        vars.insert("arch", platform.arch.clone());
        vars.insert("linux_family", platform.linux_family.clone().unwrap_or_default());
        Self { vars }
    }

    /// Expands every known token in a string. Unknown `{...}` sequences are
    /// left untouched so verify patterns like `{semver}` survive to their
    /// own expansion site.
    pub fn expand(&self, input: &str) -> String {
        let mut output = input.to_string();
        for (token, value) in &self.vars {
            let needle = format!("{{{token}}}");
            if output.contains(&needle) {
                output = output.replace(&needle, value);
            }
        }
        output
    }

    /// Expands tokens through a parameter table: strings in place, arrays
    /// and nested tables recursively. Non-string values pass through.
    pub fn expand_table(&self, params: &toml::Table) -> toml::Table {
        let mut out = toml::Table::new();
        for (key, value) in params {
            out.insert(key.clone(), self.expand_value(value));
        }
        out
    }

    fn expand_value(&self, value: &toml::Value) -> toml::Value {
        match value {
            toml::Value::String(s) => toml::Value::String(self.expand(s)),
            toml::Value::Array(items) => {
                toml::Value::Array(items.iter().map(|v| self.expand_value(v)).collect())
            }
            toml::Value::Table(table) => toml::Value::Table(self.expand_table(table)),
            other => other.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars() -> TemplateVars {
        let platform = Platform::for_tests("linux", "amd64", Some("debian"), "ubuntu");
        TemplateVars::new("14.1.0", "v14.1.0", &platform)
    }

    #[test]
    fn expands_all_standard_tokens() {
        let v = vars();
        assert_eq!(
            v.expand("https://x/{raw_version}/rg-{version}-{os}-{arch}.tar.gz"),
            "https://x/v14.1.0/rg-14.1.0-linux-amd64.tar.gz"
        );
        assert_eq!(v.expand("{linux_family}"), "debian");
    }

    #[test]
    fn unknown_tokens_pass_through() {
        assert_eq!(vars().expand("lit {unknown} {version}"), "lit {unknown} 14.1.0");
    }

    #[test]
    fn tables_expand_recursively() {
        let v = vars();
        let mut inner = toml::Table::new();
        inner.insert("url".into(), toml::Value::String("https://x/{version}".into()));
        let mut table = toml::Table::new();
        table.insert("nested".into(), toml::Value::Table(inner));
        table.insert(
            "files".into(),
            toml::Value::Array(vec![toml::Value::String("rg-{arch}".into())]),
        );
        table.insert("count".into(), toml::Value::Integer(3));

        let out = v.expand_table(&table);
        let nested = out.get("nested").and_then(|v| v.as_table()).unwrap();
        assert_eq!(nested.get("url").and_then(|v| v.as_str()), Some("https://x/14.1.0"));
        let files = out.get("files").and_then(|v| v.as_array()).unwrap();
        assert_eq!(files[0].as_str(), Some("rg-amd64"));
        assert_eq!(out.get("count").and_then(|v| v.as_integer()), Some(3));
    }
}
