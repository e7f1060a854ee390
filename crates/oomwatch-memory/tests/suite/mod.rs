use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use oomwatch_memory::{
    DistressMonitor, DistressNotifier, ManualClock, RecordingAbort, ReserveAllocator,
    ReserveBlock, ReserveError, TickOutcome, Tunables, WatchdogSettings,
};

mod concurrency;
mod episodes;
mod reserve;

/// Allocator that refuses anything above `limit_mb` and counts attempts.
pub struct LimitedAllocator {
    limit_mb: u64,
    attempts: AtomicU64,
}

impl LimitedAllocator {
    pub fn new(limit_mb: u64) -> Self {
        Self {
            limit_mb,
            attempts: AtomicU64::new(0),
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl ReserveAllocator for LimitedAllocator {
    fn allocate(&self, size_mb: u64) -> Result<ReserveBlock, ReserveError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if size_mb > self.limit_mb {
            return Err(ReserveError::Allocation { size_mb });
        }
        ReserveBlock::zeroed(size_mb)
    }
}

/// Allocator that reports distress in the middle of an allocation.
#[derive(Default)]
pub struct InterruptingAllocator {
    pub notifier: OnceLock<DistressNotifier>,
}

impl ReserveAllocator for InterruptingAllocator {
    fn allocate(&self, size_mb: u64) -> Result<ReserveBlock, ReserveError> {
        let block = ReserveBlock::zeroed(size_mb)?;
        if let Some(notifier) = self.notifier.get() {
            notifier.notify();
        }
        Ok(block)
    }
}

/// A monitor on a manual clock with a recording abort and a marker inside a
/// temporary directory.
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub abort: Arc<RecordingAbort>,
    pub allocator: Arc<LimitedAllocator>,
    pub tunables: Arc<Tunables>,
    pub monitor: DistressMonitor,
    pub notifier: DistressNotifier,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(configure: impl FnOnce(&mut WatchdogSettings)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut settings = WatchdogSettings {
            reserve_size_mb: 2,
            marker_path: dir.path().join("oomflag"),
            ..WatchdogSettings::default()
        };
        configure(&mut settings);

        let clock = Arc::new(ManualClock::new());
        let abort = Arc::new(RecordingAbort::new());
        let allocator = Arc::new(LimitedAllocator::new(64));
        let tunables = Arc::new(Tunables::new(&settings));
        let monitor = DistressMonitor::builder(tunables.clone(), abort.clone())
            .clock(clock.clone())
            .allocator(allocator.clone())
            .build();
        let notifier = monitor.notifier();

        Self {
            clock,
            abort,
            allocator,
            tunables,
            monitor,
            notifier,
            dir,
        }
    }

    pub fn marker_path(&self) -> PathBuf {
        self.tunables.marker_path()
    }

    pub fn notify_at(&self, secs: u64) {
        self.clock.set(Duration::from_secs(secs));
        self.notifier.notify();
    }

    pub fn tick_at(&self, secs: u64) -> TickOutcome {
        self.clock.set(Duration::from_secs(secs));
        self.monitor.tick()
    }
}

pub fn secs(secs: u64) -> Option<oomwatch_memory::Timestamp> {
    Some(oomwatch_memory::Timestamp::from_millis(secs * 1_000))
}
