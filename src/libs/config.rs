// Runtime configuration: the $TSUKU_HOME prefix layout, timeout defaults,
// and the few policy switches the pipeline honors. Everything here is
// resolved once at startup and passed by reference.

use std::path::PathBuf;
use std::time::Duration;

use crate::log_debug;

/// Every timeout the pipeline uses, in one place.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// TCP connect for any HTTP request.
    pub connect: Duration,
    /// Whole-transfer budget for one pre-download.
    pub download_total: Duration,
    /// Verify command execution.
    pub verify: Duration,
    /// Short probes (pkg-config, --version checks).
    pub probe: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(30),
            download_total: Duration::from_secs(120),
            verify: Duration::from_secs(30),
            probe: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    /// Transfer budget for a download of known size: the default total or
    /// 10x the declared size at a floor of 1 MiB/s, whichever is higher.
    pub fn download_budget(&self, declared_size: Option<u64>) -> Duration {
        match declared_size {
            Some(size) => {
                let scaled = Duration::from_secs((size / (1024 * 1024)).max(1) * 10);
                self.download_total.max(scaled)
            }
            None => self.download_total,
        }
    }
}

/// Resolved settings for one process invocation.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root prefix; `$TSUKU_HOME` or `~/.tsuku`.
    pub home: PathBuf,
    pub timeouts: Timeouts,
    /// Hard cap on any single download, bytes.
    pub download_size_cap: u64,
    /// Whether pip installs without pinned hashes are rejected.
    pub pip_require_hashes: bool,
}

impl Settings {
    /// Resolves settings from the environment. `TSUKU_HOME` wins; otherwise
    /// the prefix is `~/.tsuku`.
    pub fn from_env() -> Self {
        let home = match std::env::var("TSUKU_HOME") {
            Ok(value) if !value.trim().is_empty() => {
                PathBuf::from(shellexpand::tilde(value.trim()).to_string())
            }
            _ => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".tsuku"),
        };
        log_debug!("[Config] TSUKU_HOME resolved to {}", home.display());
        Self::with_home(home)
    }

    /// Builds settings over an explicit prefix (tests, --home overrides).
    pub fn with_home(home: PathBuf) -> Self {
        Self {
            home,
            timeouts: Timeouts::default(),
            download_size_cap: 4 * 1024 * 1024 * 1024,
            pip_require_hashes: true,
        }
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.home.join("bin")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.home.join("tools")
    }

    /// Per-version install root: `tools/<name>-<version>`.
    pub fn tool_dir(&self, name: &str, version: &str) -> PathBuf {
        self.tools_dir().join(format!("{name}-{version}"))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.home.join("cache")
    }

    /// Content-addressed download cache.
    pub fn downloads_dir(&self) -> PathBuf {
        self.cache_dir().join("downloads")
    }

    /// User-local recipe overrides, consulted before built-in lookup.
    pub fn recipes_dir(&self) -> PathBuf {
        self.home.join("recipes")
    }

    pub fn plans_dir(&self) -> PathBuf {
        self.home.join("plans")
    }

    pub fn state_path(&self) -> PathBuf {
        self.home.join("state.json")
    }

    pub fn state_lock_path(&self) -> PathBuf {
        self.home.join("state.json.lock")
    }

    pub fn state_backup_path(&self) -> PathBuf {
        self.home.join("state.json.bak")
    }

    /// Creates the directory skeleton the executor expects.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.home.clone(),
            self.bin_dir(),
            self.tools_dir(),
            self.downloads_dir(),
            self.plans_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
