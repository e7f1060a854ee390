//! Out-of-memory distress watchdog core.
//!
//! The watchdog holds an emergency memory reserve, hands it back to the host
//! when distress is signalled, tracks how long the distress lasts and, past a
//! grace period, requests a forced abort of the host. A persistent marker is
//! written during distress so recovery tooling can detect the reboot.
//!
//! Work is split between two contexts:
//! - [`DistressNotifier::notify`] is called by the host's notification source.
//!   It is lock-free and never blocks.
//! - [`PeriodicWorker`] advances the state machine ([`DistressMonitor::tick`])
//!   on a fixed cadence and does all blocking work: allocation, marker I/O and
//!   logging.

mod abort;
mod clock;
mod handler;
mod machine;
mod marker;
mod monitor;
mod reserve;
mod state;
mod tunables;
mod watchdog;
mod worker;

pub use abort::{AbortError, AbortReason, HostAbort, RecordingAbort};
pub use clock::{Clock, ManualClock, MonotonicClock, Timestamp};
pub use handler::DistressNotifier;
pub use machine::{MarkerOutcome, ReserveOutcome, TickOutcome};
pub use marker::{marker_exists, write_marker, MarkerError};
pub use monitor::{DistressMonitor, DistressMonitorBuilder, WatchdogStatus};
pub use reserve::{
    EmergencyReserve, HeapAllocator, ReserveAllocator, ReserveBlock, ReserveError, MB,
};
pub use state::DistressSnapshot;
pub use tunables::{Tunables, WatchdogSettings, DEFAULT_MARKER_PATH};
pub use watchdog::Watchdog;
pub use worker::{CancellationToken, PeriodicWorker, DEFAULT_TICK_INTERVAL};
