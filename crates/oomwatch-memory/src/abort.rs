use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::duration_millis;

/// Why a forced abort was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AbortReason {
    /// Distress persisted for `elapsed`, longer than the configured grace time.
    GraceExpired { elapsed: Duration },
}

#[derive(Debug, Error)]
pub enum AbortError {
    #[error("failed to trigger host abort: {0}")]
    Io(#[from] io::Error),
    #[error("host abort is not supported: {0}")]
    Unsupported(&'static str),
}

/// The host's "halt or reboot immediately" primitive.
///
/// Invoked from the notification path: implementations must not block, take
/// locks or allocate. A successful call normally does not return. Returning an
/// error makes the watchdog retry on the next notification.
pub trait HostAbort: Send + Sync {
    fn request_abort(&self, reason: AbortReason) -> Result<(), AbortError>;
}

/// Abort that only counts requests. Used for dry runs and tests.
#[derive(Debug, Default)]
pub struct RecordingAbort {
    requests: AtomicU64,
    last_elapsed_ms: AtomicU64,
}

impl RecordingAbort {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// Grace elapsed time carried by the most recent request.
    pub fn last_elapsed(&self) -> Option<Duration> {
        (self.requests() > 0)
            .then(|| Duration::from_millis(self.last_elapsed_ms.load(Ordering::SeqCst)))
    }
}

impl HostAbort for RecordingAbort {
    fn request_abort(&self, reason: AbortReason) -> Result<(), AbortError> {
        let AbortReason::GraceExpired { elapsed } = reason;
        self.last_elapsed_ms
            .store(duration_millis(elapsed), Ordering::SeqCst);
        self.requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
