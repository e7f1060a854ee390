use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::abort::HostAbort;
use crate::clock::{Clock, MonotonicClock};
use crate::handler::DistressNotifier;
use crate::reserve::{EmergencyReserve, HeapAllocator, ReserveAllocator, ReserveError};
use crate::state::{DistressSnapshot, DistressState};
use crate::tunables::Tunables;

/// Bookkeeping touched only by the worker, under [`Inner::worker`].
#[derive(Debug, Default)]
pub(crate) struct WorkerState {
    /// Size of the last successful reserve allocation.
    pub(crate) last_good_mb: u64,
    /// The worker installed a reserve and has not yet seen it dropped.
    pub(crate) expects_reserve: bool,
    /// An episode start has been logged and not yet cleared.
    pub(crate) episode_logged: bool,
    pub(crate) abort_logged: bool,
}

pub(crate) struct Inner {
    pub(crate) state: DistressState,
    pub(crate) reserve: EmergencyReserve,
    pub(crate) tunables: Arc<Tunables>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) abort: Arc<dyn HostAbort>,
    pub(crate) worker: Mutex<WorkerState>,
    pub(crate) ticks: AtomicU64,
}

/// Snapshot of the watchdog, intended for status output and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogStatus {
    pub distress: DistressSnapshot,
    pub reserve_present: bool,
    pub reserve_size_mb: Option<u64>,
    pub configured_reserve_mb: u64,
    pub ticks: u64,
}

/// The distress state machine together with the resources it drives.
///
/// Cheap to clone; every clone refers to the same state.
#[derive(Clone)]
pub struct DistressMonitor {
    pub(crate) inner: Arc<Inner>,
}

pub struct DistressMonitorBuilder {
    tunables: Arc<Tunables>,
    abort: Arc<dyn HostAbort>,
    clock: Option<Arc<dyn Clock>>,
    allocator: Option<Arc<dyn ReserveAllocator>>,
    memory_limit: Option<u64>,
}

impl DistressMonitorBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn ReserveAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Extra bound for the default heap allocator, such as the cgroup's
    /// `memory.max`. Ignored when an allocator is supplied.
    pub fn memory_limit(mut self, bytes: Option<u64>) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn build(self) -> DistressMonitor {
        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let memory_limit = self.memory_limit;
        let allocator = self.allocator.unwrap_or_else(|| {
            Arc::new(HeapAllocator::new().with_memory_limit(memory_limit))
        });

        DistressMonitor {
            inner: Arc::new(Inner {
                state: DistressState::new(),
                reserve: EmergencyReserve::new(allocator),
                tunables: self.tunables,
                clock,
                abort: self.abort,
                worker: Mutex::new(WorkerState::default()),
                ticks: AtomicU64::new(0),
            }),
        }
    }
}

impl DistressMonitor {
    pub fn builder(tunables: Arc<Tunables>, abort: Arc<dyn HostAbort>) -> DistressMonitorBuilder {
        DistressMonitorBuilder {
            tunables,
            abort,
            clock: None,
            allocator: None,
            memory_limit: None,
        }
    }

    pub fn new(tunables: Arc<Tunables>, abort: Arc<dyn HostAbort>) -> Self {
        Self::builder(tunables, abort).build()
    }

    pub fn tunables(&self) -> &Arc<Tunables> {
        &self.inner.tunables
    }

    /// Handle given to distress notification sources.
    pub fn notifier(&self) -> DistressNotifier {
        DistressNotifier::new(Arc::clone(&self.inner))
    }

    /// Initial reserve allocation, performed once at start-up.
    ///
    /// A failure disables the reserve: the configured size drops to zero and
    /// is not retried until the control surface sets a new size.
    pub fn populate(&self) -> Result<(), ReserveError> {
        let inner = &self.inner;
        let mut worker = inner.worker.lock();
        let size_mb = inner.tunables.reserve_size_mb();
        if size_mb == 0 {
            tracing::info!(target = "oomwatch.memory", "emergency reserve disabled");
            return Ok(());
        }

        tracing::info!(
            target = "oomwatch.memory",
            size_mb,
            "populating emergency reserve"
        );
        match inner.reserve.ensure(size_mb, inner.tunables.snapshot().lock_reserve) {
            Ok(()) => {
                worker.last_good_mb = size_mb;
                worker.expects_reserve = true;
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    target = "oomwatch.memory",
                    size_mb,
                    error = %err,
                    "emergency reserve allocation failed on start-up; not retrying"
                );
                inner.tunables.revert_reserve_size_mb(size_mb, 0);
                worker.last_good_mb = 0;
                Err(err)
            }
        }
    }

    /// Frees the reserve unconditionally. Used at shutdown.
    pub fn release_reserve(&self) -> bool {
        let released = self.inner.reserve.release();
        self.inner.worker.lock().expects_reserve = false;
        released
    }

    pub fn distress(&self) -> DistressSnapshot {
        self.inner.state.snapshot()
    }

    pub fn status(&self) -> WatchdogStatus {
        let inner = &self.inner;
        let reserve_size_mb = inner.reserve.held_size_mb();
        WatchdogStatus {
            distress: inner.state.snapshot(),
            reserve_present: reserve_size_mb.is_some(),
            reserve_size_mb,
            configured_reserve_mb: inner.tunables.reserve_size_mb(),
            ticks: inner.ticks.load(Ordering::SeqCst),
        }
    }
}

impl fmt::Debug for DistressMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistressMonitor")
            .field("distress", &self.inner.state.snapshot())
            .field("reserve", &self.inner.reserve)
            .finish_non_exhaustive()
    }
}
