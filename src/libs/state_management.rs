// The state store: tsuku's persistent memory of what is installed.
//
// One JSON document at $TSUKU_HOME/state.json. Every mutation is a
// read-modify-write under an exclusive advisory lock on state.json.lock,
// so concurrent tsuku processes serialize on commits. Writes are atomic:
// serialize to state.json.tmp, fsync, rename; the previous good document
// is kept as state.json.bak and read-only callers may fall back to it.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crate::error::{Result, TsukuError};
use crate::libs::config::Settings;
use crate::schemas::state_file::TsukuState;
use crate::{log_debug, log_warn};

/// How long a writer waits for the lock before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(200);

pub struct StateStore {
    state_path: PathBuf,
    lock_path: PathBuf,
    backup_path: PathBuf,
}

/// An acquired exclusive lock. Held for the duration of a read-modify-write;
/// released on drop.
pub struct StateLock {
    file: File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

impl StateStore {
    pub fn new(settings: &Settings) -> Self {
        Self {
            state_path: settings.state_path(),
            lock_path: settings.state_lock_path(),
            backup_path: settings.state_backup_path(),
        }
    }

    /// Acquires the exclusive advisory lock, retrying until the timeout.
    pub fn lock(&self) -> Result<StateLock> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .map_err(|e| TsukuError::State(format!("cannot open lock file: {e}")))?;

        let deadline = Instant::now() + LOCK_TIMEOUT;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => {
                    log_debug!("[State] Acquired lock on {}", self.lock_path.display());
                    return Ok(StateLock { file });
                }
                Err(_) if Instant::now() < deadline => {
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(err) => {
                    return Err(TsukuError::State(format!(
                        "state file is locked by another tsuku process ({err})"
                    )));
                }
            }
        }
    }

    /// Reads the current state. A missing file yields the empty default.
    /// A parse failure is a hard `State` error for writers; read-only
    /// callers can use `load_readonly` which falls back to the backup.
    pub fn load(&self) -> Result<TsukuState> {
        match fs::read_to_string(&self.state_path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                TsukuError::State(format!(
                    "state.json is unreadable ({e}); refusing to modify it. \
                     Restore from {} or repair it by hand",
                    self.backup_path.display()
                ))
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log_debug!("[State] No state file yet; starting empty");
                Ok(TsukuState::default())
            }
            Err(err) => Err(TsukuError::State(format!("cannot read state file: {err}"))),
        }
    }

    /// Read for display-only commands: a corrupt primary falls back to the
    /// last good backup instead of failing.
    pub fn load_readonly(&self) -> Result<TsukuState> {
        match self.load() {
            Ok(state) => Ok(state),
            Err(primary_err) => match fs::read_to_string(&self.backup_path) {
                Ok(contents) => {
                    log_warn!(
                        "[State] Primary state unreadable; using backup {}",
                        self.backup_path.display()
                    );
                    serde_json::from_str(&contents).map_err(|_| primary_err)
                }
                Err(_) => Err(primary_err),
            },
        }
    }

    /// Runs a mutation under the lock: load, apply, atomically persist.
    /// Nothing is written when `mutate` errors.
    pub fn update<T>(
        &self,
        mutate: impl FnOnce(&mut TsukuState) -> Result<T>,
    ) -> Result<T> {
        let _lock = self.lock()?;
        let mut state = self.load()?;
        let outcome = mutate(&mut state)?;
        self.persist(&state)?;
        Ok(outcome)
    }

    /// Atomic write: tmp + fsync + rename, preserving the previous good
    /// document as the backup.
    fn persist(&self, state: &TsukuState) -> Result<()> {
        let serialized = serde_json::to_string_pretty(state)
            .map_err(|e| TsukuError::State(format!("cannot serialize state: {e}")))?;

        if self.state_path.exists() {
            fs::copy(&self.state_path, &self.backup_path)
                .map_err(|e| TsukuError::State(format!("cannot write state backup: {e}")))?;
        }

        let tmp_path = self.state_path.with_extension("json.tmp");
        {
            let mut tmp = File::create(&tmp_path)
                .map_err(|e| TsukuError::State(format!("cannot create {}: {e}", tmp_path.display())))?;
            tmp.write_all(serialized.as_bytes())
                .and_then(|_| tmp.sync_all())
                .map_err(|e| TsukuError::State(format!("cannot write state: {e}")))?;
        }
        fs::rename(&tmp_path, &self.state_path)
            .map_err(|e| TsukuError::State(format!("cannot commit state: {e}")))?;

        log_debug!("[State] Persisted {} tool entries", state.tools.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::state_file::VersionState;

    fn store_in(dir: &std::path::Path) -> StateStore {
        let settings = Settings::with_home(dir.to_path_buf());
        StateStore::new(&settings)
    }

    fn sample_version() -> VersionState {
        VersionState {
            requested: "latest".into(),
            binaries: vec!["rg".into()],
            binary_checksums: None,
            installed_at: "2026-01-01T00:00:00Z".into(),
            plan: None,
        }
    }

    #[test]
    fn missing_state_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let state = store.load().unwrap();
        assert!(state.tools.is_empty());
    }

    #[test]
    fn update_round_trips_and_keeps_a_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());

        store
            .update(|state| {
                state.record_install("rg", "14.1.0", sample_version(), vec![], vec![]);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.load().unwrap().active_version_of("rg"), Some("14.1.0"));

        // Second write snapshots the first as the backup.
        store
            .update(|state| {
                state.record_install("jq", "1.7", sample_version(), vec![], vec![]);
                Ok(())
            })
            .unwrap();
        let backup = fs::read_to_string(tmp.path().join("state.json.bak")).unwrap();
        let backup_state: TsukuState = serde_json::from_str(&backup).unwrap();
        assert!(backup_state.tools.contains_key("rg"));
        assert!(!backup_state.tools.contains_key("jq"));
    }

    #[test]
    fn corrupt_state_refuses_writes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        fs::write(tmp.path().join("state.json"), "{ not json").unwrap();

        let err = store.update(|_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), "state");
        // The corrupt file is untouched.
        assert_eq!(fs::read_to_string(tmp.path().join("state.json")).unwrap(), "{ not json");
    }

    #[test]
    fn readonly_load_falls_back_to_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        store
            .update(|state| {
                state.record_install("rg", "14.1.0", sample_version(), vec![], vec![]);
                Ok(())
            })
            .unwrap();
        store
            .update(|state| {
                state.record_install("jq", "1.7", sample_version(), vec![], vec![]);
                Ok(())
            })
            .unwrap();

        fs::write(tmp.path().join("state.json"), "garbage").unwrap();
        let state = store.load_readonly().unwrap();
        assert!(state.tools.contains_key("rg"));
    }

    #[test]
    fn failed_mutation_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store_in(tmp.path());
        let err = store
            .update(|state| -> Result<()> {
                state.record_install("rg", "14.1.0", sample_version(), vec![], vec![]);
                Err(TsukuError::Cancelled)
            })
            .unwrap_err();
        assert_eq!(err.kind(), "cancelled");
        assert!(store.load().unwrap().tools.is_empty());
    }
}
