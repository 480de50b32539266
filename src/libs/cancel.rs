// Cooperative cancellation. A single token is created per invocation,
// hooked to SIGINT, and threaded through the downloader and subprocess
// spawners. Checks are cheap atomic loads; long operations poll between
// chunks or while waiting on children.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Result, TsukuError};

#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Errors with `Cancelled` once the token has been tripped.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() { Err(TsukuError::Cancelled) } else { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_once_and_stays_tripped() {
        let token = CancelToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(TsukuError::Cancelled)));

        let clone = token.clone();
        assert!(clone.is_cancelled());
    }
}
