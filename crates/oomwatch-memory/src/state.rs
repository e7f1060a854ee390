use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

const UNSET: u64 = u64::MAX;

/// An optional [`Timestamp`] stored in a single atomic word.
#[derive(Debug)]
pub(crate) struct AtomicTimestamp(AtomicU64);

impl AtomicTimestamp {
    pub(crate) const fn unset() -> Self {
        Self(AtomicU64::new(UNSET))
    }

    pub(crate) fn load(&self) -> Option<Timestamp> {
        decode(self.0.load(Ordering::SeqCst))
    }

    pub(crate) fn store(&self, at: Timestamp) {
        self.0.store(encode(at), Ordering::SeqCst);
    }

    pub(crate) fn clear(&self) {
        self.0.store(UNSET, Ordering::SeqCst);
    }

    /// Stores `at` only if no timestamp is present. Returns the timestamp that
    /// is in effect afterwards and whether this call set it.
    pub(crate) fn set_if_unset(&self, at: Timestamp) -> (Timestamp, bool) {
        match self
            .0
            .compare_exchange(UNSET, encode(at), Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => (at, true),
            Err(current) => (decode(current).unwrap_or(at), false),
        }
    }

    /// Clears the timestamp only if it still holds `expected`.
    pub(crate) fn clear_if(&self, expected: Timestamp) -> bool {
        self.0
            .compare_exchange(encode(expected), UNSET, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

fn encode(at: Timestamp) -> u64 {
    // `UNSET` is reserved; a clock this far out is clamped one below it.
    at.as_millis().min(UNSET - 1)
}

fn decode(raw: u64) -> Option<Timestamp> {
    (raw != UNSET).then(|| Timestamp::from_millis(raw))
}

/// Distress bookkeeping shared by the notification handler and the worker.
///
/// Every field is a single atomic word so the notification path never needs a
/// lock.
#[derive(Debug)]
pub(crate) struct DistressState {
    /// Single-slot mailbox: set by the handler, taken by the worker.
    pub(crate) distress_signaled: AtomicBool,
    pub(crate) grace_start: AtomicTimestamp,
    pub(crate) reset_wait_start: AtomicTimestamp,
    pub(crate) marker_written: AtomicBool,
    /// A forced abort was requested during the current episode.
    pub(crate) abort_requested: AtomicBool,
}

impl DistressState {
    pub(crate) const fn new() -> Self {
        Self {
            distress_signaled: AtomicBool::new(false),
            grace_start: AtomicTimestamp::unset(),
            reset_wait_start: AtomicTimestamp::unset(),
            marker_written: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
        }
    }

    /// Atomically takes the pending distress signal, if any.
    pub(crate) fn take_signal(&self) -> bool {
        self.distress_signaled.swap(false, Ordering::SeqCst)
    }

    pub(crate) fn snapshot(&self) -> DistressSnapshot {
        DistressSnapshot {
            distress_signaled: self.distress_signaled.load(Ordering::SeqCst),
            grace_start: self.grace_start.load(),
            reset_wait_start: self.reset_wait_start.load(),
            marker_written: self.marker_written.load(Ordering::SeqCst),
            abort_requested: self.abort_requested.load(Ordering::SeqCst),
        }
    }
}

/// Point-in-time copy of the distress state, for status reporting and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistressSnapshot {
    pub distress_signaled: bool,
    pub grace_start: Option<Timestamp>,
    pub reset_wait_start: Option<Timestamp>,
    pub marker_written: bool,
    pub abort_requested: bool,
}

impl DistressSnapshot {
    /// True while a distress episode is unresolved.
    pub fn in_episode(&self) -> bool {
        self.grace_start.is_some()
    }
}
