// Host-facing actions. Two probes (`require_command`, `require_system`)
// assert preconditions; `set_env` appends to the user's tsuku env file;
// everything else in this module is instruction-only: package-manager and
// service actions never run privileged commands, they render the command
// the user should run and surface it.

use std::fs;
use std::io::Write as _;
use std::sync::Arc;

use regex::Regex;
use semver::Version;

use crate::actions::{
    Action, ActionKind, ExecutionContext, optional_str, param_error, require_str,
    require_str_list,
};
use crate::error::{Result, TsukuError};
use crate::libs::utilities::platform::resolve_command;
use crate::libs::utilities::process::run_command;
use crate::{log_debug, log_info};

pub fn register(add: &mut impl FnMut(Arc<dyn Action>)) {
    add(Arc::new(RequireCommand));
    add(Arc::new(RequireSystem));
    add(Arc::new(SetEnv));
    add(Arc::new(Manual));
    add(Arc::new(GroupAdd));
    add(Arc::new(ServiceInstruction { action_name: "service_enable", verb: "enable" }));
    add(Arc::new(ServiceInstruction { action_name: "service_start", verb: "start" }));
    add(Arc::new(RepoInstruction {
        action_name: "apt_repo",
        template: "sudo add-apt-repository '{value}' && sudo apt-get update",
        key: "repo",
    }));
    add(Arc::new(RepoInstruction {
        action_name: "apt_ppa",
        template: "sudo add-apt-repository ppa:{value} && sudo apt-get update",
        key: "ppa",
    }));
    add(Arc::new(RepoInstruction {
        action_name: "dnf_repo",
        template: "sudo dnf config-manager --add-repo {value}",
        key: "url",
    }));
    for spec in PACKAGE_ACTIONS {
        add(Arc::new(PackageInstruction { spec }));
    }
}

// ---------------------------------------------------------------------------
// require_command (primitive)
// ---------------------------------------------------------------------------

struct RequireCommandParams {
    command: String,
    version_args: Vec<String>,
    version_pattern: Option<String>,
    min_version: Option<Version>,
    hint: Option<String>,
}

impl RequireCommandParams {
    fn from_table(params: &toml::Table) -> Result<Self> {
        let command = require_str(params, "command")?;
        let version_args = crate::actions::optional_str_list(params, "version_args")?
            .unwrap_or_else(|| vec!["--version".to_string()]);
        let version_pattern = optional_str(params, "version_pattern")?;
        if let Some(pattern) = &version_pattern {
            Regex::new(pattern)
                .map_err(|e| param_error("version_pattern", format!("invalid regex: {e}")))?;
        }
        let min_version = match optional_str(params, "min_version")? {
            Some(raw) => Some(parse_lenient_version(&raw).ok_or_else(|| {
                param_error("min_version", format!("'{raw}' is not a version"))
            })?),
            None => None,
        };
        let hint = optional_str(params, "hint")?;
        Ok(Self { command, version_args, version_pattern, min_version, hint })
    }
}

/// Parses "1.2" or "1.2.3" into a semver Version, padding missing parts.
fn parse_lenient_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    if let Ok(version) = Version::parse(trimmed) {
        return Some(version);
    }
    let mut parts = trimmed.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    Some(Version::new(major, minor, patch))
}

/// Pulls the first version-looking token out of command output.
fn extract_version(output: &str, pattern: Option<&str>) -> Option<Version> {
    let regex = match pattern {
        Some(p) => Regex::new(p).ok()?,
        None => Regex::new(r"(\d+\.\d+(?:\.\d+)?)").ok()?,
    };
    let captures = regex.captures(output)?;
    let matched = captures.get(1).or_else(|| captures.get(0))?.as_str();
    parse_lenient_version(matched)
}

pub struct RequireCommand;

impl Action for RequireCommand {
    fn name(&self) -> &'static str {
        "require_command"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        RequireCommandParams::from_table(params).map(|_| ())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let parsed = RequireCommandParams::from_table(params)?;
        let hint = parsed
            .hint
            .clone()
            .unwrap_or_else(|| format!("install '{}' with your system package manager", parsed.command));

        let Some(resolved) = resolve_command(&parsed.command) else {
            return Err(TsukuError::MissingSystemDependency { name: parsed.command, hint });
        };
        log_debug!("[Exec] require_command: {} at {}", parsed.command, resolved.display());

        if let Some(min) = &parsed.min_version {
            let output = run_command(
                &parsed.command,
                &parsed.version_args,
                None,
                &ctx.subprocess_env(),
                ctx.settings.timeouts.probe,
                ctx.cancel,
            )?;
            let combined = format!("{}{}", output.stdout, output.stderr);
            let found =
                extract_version(&combined, parsed.version_pattern.as_deref()).ok_or_else(|| {
                    TsukuError::MissingSystemDependency {
                        name: parsed.command.clone(),
                        hint: format!("could not determine its version from `{} {}`",
                            parsed.command, parsed.version_args.join(" ")),
                    }
                })?;
            if found < *min {
                return Err(TsukuError::MissingSystemDependency {
                    name: parsed.command,
                    hint: format!("version {found} found, but at least {min} is required; {hint}"),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// require_system (legacy probe with per-platform hints)
// ---------------------------------------------------------------------------

pub struct RequireSystem;

impl Action for RequireSystem {
    fn name(&self) -> &'static str {
        "require_system"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        require_str(params, "command")?;
        if let Some(value) = params.get("hints") {
            if !value.is_table() {
                return Err(param_error("hints", "must be a table of family -> hint"));
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let command = require_str(params, "command")?;
        if resolve_command(&command).is_some() {
            return Ok(());
        }

        // Pick the hint matching the host's family, falling back to every
        // hint we have so the user sees something actionable.
        let hints = params.get("hints").and_then(|v| v.as_table());
        let hint = match (hints, &ctx.platform.linux_family) {
            (Some(table), Some(family)) => table
                .get(family)
                .or_else(|| table.get(&ctx.platform.os))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            (Some(table), None) => {
                table.get(&ctx.platform.os).and_then(|v| v.as_str()).map(str::to_string)
            }
            _ => None,
        }
        .unwrap_or_else(|| format!("install '{command}' with your system package manager"));

        Err(TsukuError::MissingSystemDependency { name: command, hint })
    }
}

// ---------------------------------------------------------------------------
// set_env (primitive): declarative env entries in $TSUKU_HOME/env.sh
// ---------------------------------------------------------------------------

pub struct SetEnv;

impl Action for SetEnv {
    fn name(&self) -> &'static str {
        "set_env"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        let name = require_str(params, "name")?;
        if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            || name.starts_with(|c: char| c.is_ascii_digit())
        {
            return Err(param_error("name", "must be a valid environment variable name"));
        }
        require_str(params, "value")?;
        Ok(())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let name = require_str(params, "name")?;
        let value = require_str(params, "value")?;

        let env_file = ctx.settings.home.join("env.sh");
        let line = format!("export {name}=\"{value}\"");

        // Idempotent append: an identical entry is left alone.
        let existing = fs::read_to_string(&env_file).unwrap_or_default();
        if existing.lines().any(|l| l.trim() == line) {
            log_debug!("[Exec] set_env: {name} already present");
            return Ok(());
        }

        fs::create_dir_all(&ctx.settings.home)?;
        let mut file = fs::OpenOptions::new().create(true).append(true).open(&env_file)?;
        writeln!(file, "{line}")?;
        log_info!("[Exec] Added {name} to {}; source it from your shell rc", env_file.display());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Instruction actions
// ---------------------------------------------------------------------------

/// Static description of one package-manager instruction action.
pub struct PackageSpec {
    pub action_name: &'static str,
    pub command: &'static str,
}

/// `apt_install` and friends: render the command the user should run.
const PACKAGE_ACTIONS: &[PackageSpec] = &[
    PackageSpec { action_name: "apt_install", command: "sudo apt-get install -y" },
    PackageSpec { action_name: "brew_install", command: "brew install" },
    PackageSpec { action_name: "brew_cask", command: "brew install --cask" },
    PackageSpec { action_name: "dnf_install", command: "sudo dnf install -y" },
    PackageSpec { action_name: "pacman_install", command: "sudo pacman -S --noconfirm" },
    PackageSpec { action_name: "zypper_install", command: "sudo zypper install -y" },
    PackageSpec { action_name: "apk_install", command: "sudo apk add" },
];

pub struct PackageInstruction {
    spec: &'static PackageSpec,
}

impl PackageInstruction {
    fn render(&self, params: &toml::Table) -> Result<String> {
        let packages = require_str_list(params, "packages")?;
        Ok(format!("{} {}", self.spec.command, packages.join(" ")))
    }
}

impl Action for PackageInstruction {
    fn name(&self) -> &'static str {
        self.spec.action_name
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        self.render(params).map(|_| ())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let text = self.render(params)?;
        ctx.record_instruction(text.clone());
        log_info!("[System] Run: {text}");
        Ok(())
    }

    fn describe(&self, params: &toml::Table) -> Option<String> {
        self.render(params).ok()
    }
}

/// Repo-style single-value instructions (`apt_repo`, `apt_ppa`, `dnf_repo`).
pub struct RepoInstruction {
    action_name: &'static str,
    template: &'static str,
    key: &'static str,
}

impl RepoInstruction {
    fn render(&self, params: &toml::Table) -> Result<String> {
        let value = require_str(params, self.key)?;
        Ok(self.template.replace("{value}", &value))
    }
}

impl Action for RepoInstruction {
    fn name(&self) -> &'static str {
        self.action_name
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        self.render(params).map(|_| ())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let text = self.render(params)?;
        ctx.record_instruction(text.clone());
        log_info!("[System] Run: {text}");
        Ok(())
    }

    fn describe(&self, params: &toml::Table) -> Option<String> {
        self.render(params).ok()
    }
}

/// `service_enable` / `service_start`.
pub struct ServiceInstruction {
    action_name: &'static str,
    verb: &'static str,
}

impl Action for ServiceInstruction {
    fn name(&self) -> &'static str {
        self.action_name
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        require_str(params, "service").map(|_| ())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let service = require_str(params, "service")?;
        let text = format!("sudo systemctl {} {service}", self.verb);
        ctx.record_instruction(text.clone());
        log_info!("[System] Run: {text}");
        Ok(())
    }

    fn describe(&self, params: &toml::Table) -> Option<String> {
        let service = require_str(params, "service").ok()?;
        Some(format!("sudo systemctl {} {service}", self.verb))
    }
}

/// `group_add`: membership instructions.
pub struct GroupAdd;

impl Action for GroupAdd {
    fn name(&self) -> &'static str {
        "group_add"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        require_str(params, "group").map(|_| ())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let group = require_str(params, "group")?;
        let text = format!("sudo usermod -aG {group} $USER  # then log out and back in");
        ctx.record_instruction(text.clone());
        log_info!("[System] Run: {text}");
        Ok(())
    }

    fn describe(&self, params: &toml::Table) -> Option<String> {
        let group = require_str(params, "group").ok()?;
        Some(format!("sudo usermod -aG {group} $USER"))
    }
}

/// `manual`: free-text instructions.
pub struct Manual;

impl Action for Manual {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn kind(&self) -> ActionKind {
        ActionKind::Primitive
    }

    fn preflight(&self, params: &toml::Table) -> Result<()> {
        require_str(params, "text").map(|_| ())
    }

    fn execute(&self, ctx: &ExecutionContext, params: &toml::Table) -> Result<()> {
        let text = require_str(params, "text")?;
        ctx.record_instruction(text.clone());
        log_info!("[System] {text}");
        Ok(())
    }

    fn describe(&self, params: &toml::Table) -> Option<String> {
        require_str(params, "text").ok()
    }
}
