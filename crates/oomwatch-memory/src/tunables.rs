use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::clock::duration_millis;

/// Default location of the persistent marker.
pub const DEFAULT_MARKER_PATH: &str = "/oomflag";

/// Watchdog parameters as supplied by the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogSettings {
    /// Continuous distress tolerated before a forced abort. Zero disables the abort.
    pub grace_time: Duration,
    /// Quiet time required before a distress episode is considered over.
    pub reset_time: Duration,
    /// Size of the emergency reserve in MiB. Zero disables the reserve.
    pub reserve_size_mb: u64,
    /// Write the persistent marker at distress and only abort once it exists.
    pub crash_flag: bool,
    pub marker_path: PathBuf,
    /// Pin the reserve in RAM with `mlock`.
    pub lock_reserve: bool,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            grace_time: Duration::ZERO,
            reset_time: Duration::from_secs(300),
            reserve_size_mb: 32,
            crash_flag: true,
            marker_path: PathBuf::from(DEFAULT_MARKER_PATH),
            lock_reserve: false,
        }
    }
}

/// Live, concurrently tunable watchdog parameters.
///
/// Scalar values are atomics so the notification path can read them without
/// taking a lock. Only the worker reads `marker_path`.
#[derive(Debug)]
pub struct Tunables {
    grace_time_ms: AtomicU64,
    reset_time_ms: AtomicU64,
    reserve_size_mb: AtomicU64,
    crash_flag: AtomicBool,
    lock_reserve: AtomicBool,
    marker_path: RwLock<PathBuf>,
}

impl Tunables {
    pub fn new(settings: &WatchdogSettings) -> Self {
        Self {
            grace_time_ms: AtomicU64::new(duration_millis(settings.grace_time)),
            reset_time_ms: AtomicU64::new(duration_millis(settings.reset_time)),
            reserve_size_mb: AtomicU64::new(settings.reserve_size_mb),
            crash_flag: AtomicBool::new(settings.crash_flag),
            lock_reserve: AtomicBool::new(settings.lock_reserve),
            marker_path: RwLock::new(settings.marker_path.clone()),
        }
    }

    /// Replace every parameter. Takes effect at the next tick or notification.
    pub fn apply(&self, settings: &WatchdogSettings) {
        self.set_grace_time(settings.grace_time);
        self.set_reset_time(settings.reset_time);
        self.set_reserve_size_mb(settings.reserve_size_mb);
        self.set_crash_flag(settings.crash_flag);
        self.lock_reserve
            .store(settings.lock_reserve, Ordering::SeqCst);
        *self.marker_path.write() = settings.marker_path.clone();
    }

    pub fn grace_time(&self) -> Duration {
        Duration::from_millis(self.grace_time_ms.load(Ordering::SeqCst))
    }

    pub fn set_grace_time(&self, grace: Duration) {
        self.grace_time_ms
            .store(duration_millis(grace), Ordering::SeqCst);
    }

    pub fn reset_time(&self) -> Duration {
        Duration::from_millis(self.reset_time_ms.load(Ordering::SeqCst))
    }

    pub fn set_reset_time(&self, reset: Duration) {
        self.reset_time_ms
            .store(duration_millis(reset), Ordering::SeqCst);
    }

    pub fn reserve_size_mb(&self) -> u64 {
        self.reserve_size_mb.load(Ordering::SeqCst)
    }

    pub fn set_reserve_size_mb(&self, size_mb: u64) {
        self.reserve_size_mb.store(size_mb, Ordering::SeqCst);
    }

    /// Replaces the reserve size with `to` only if it still reads `from`, so a
    /// revert never clobbers a newer value from the control surface.
    pub fn revert_reserve_size_mb(&self, from: u64, to: u64) -> bool {
        self.reserve_size_mb
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn crash_flag(&self) -> bool {
        self.crash_flag.load(Ordering::SeqCst)
    }

    pub fn set_crash_flag(&self, enabled: bool) {
        self.crash_flag.store(enabled, Ordering::SeqCst);
    }

    pub fn marker_path(&self) -> PathBuf {
        self.marker_path.read().clone()
    }

    pub fn set_marker_path(&self, path: impl Into<PathBuf>) {
        *self.marker_path.write() = path.into();
    }

    /// Copy of the current values, taken once at the start of a worker tick.
    pub fn snapshot(&self) -> WatchdogSettings {
        WatchdogSettings {
            grace_time: self.grace_time(),
            reset_time: self.reset_time(),
            reserve_size_mb: self.reserve_size_mb(),
            crash_flag: self.crash_flag(),
            marker_path: self.marker_path(),
            lock_reserve: self.lock_reserve.load(Ordering::SeqCst),
        }
    }
}

impl Default for Tunables {
    fn default() -> Self {
        Self::new(&WatchdogSettings::default())
    }
}
