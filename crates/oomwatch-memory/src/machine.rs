//! The distress state machine, advanced once per worker tick.
//!
//! Each tick takes exactly one of three transitions, in priority order:
//!
//! 1. a pending distress signal is observed (and the marker written),
//! 2. an episode cools down and, after `reset_time` of quiet, is cleared,
//! 3. while idle, the reserve is reconciled with the configured size.

use std::sync::atomic::Ordering;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::marker;
use crate::monitor::{DistressMonitor, Inner, WorkerState};
use crate::tunables::WatchdogSettings;

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "transition")]
pub enum TickOutcome {
    /// A distress notification was taken from the mailbox.
    Observed { marker: MarkerOutcome },
    /// Still inside the reset period.
    CoolingDown { quiet_for: Duration },
    /// The reset period elapsed and the episode was cleared.
    EpisodeCleared { reserve: ReserveOutcome },
    /// Idle tick that changed the reserve.
    Reconciled { reserve: ReserveOutcome },
    /// Idle tick with nothing to do.
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerOutcome {
    Disabled,
    Written,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum ReserveOutcome {
    /// Nothing needed doing.
    Unchanged,
    /// The reserve is configured off; any held block was freed.
    Disabled,
    Allocated { size_mb: u64 },
    /// Allocated, but distress arrived meanwhile and the block was dropped again.
    Preempted { size_mb: u64 },
    /// Allocation failed; the configured size fell back to `reverted_to_mb`.
    Failed { requested_mb: u64, reverted_to_mb: u64 },
}

impl DistressMonitor {
    /// Runs one state machine transition. Blocking: may allocate the reserve
    /// and write the marker. Only the periodic worker should call this.
    pub fn tick(&self) -> TickOutcome {
        self.inner.tick()
    }
}

impl Inner {
    pub(crate) fn tick(&self) -> TickOutcome {
        let mut worker = self.worker.lock();
        let settings = self.tunables.snapshot();
        let now = self.clock.now();
        self.ticks.fetch_add(1, Ordering::SeqCst);

        let outcome = if self.state.take_signal() {
            self.observe(&mut worker, now, &settings)
        } else if let Some(wait_start) = self.state.reset_wait_start.load() {
            self.cool_down(&mut worker, now, wait_start, &settings)
        } else {
            self.reconcile(&mut worker, &settings)
        };

        if self.state.abort_requested.load(Ordering::SeqCst) && !worker.abort_logged {
            worker.abort_logged = true;
            tracing::error!(
                target = "oomwatch.memory",
                at_ms = now.as_millis(),
                "forced abort was requested but the host is still running"
            );
        }

        outcome
    }

    fn observe(
        &self,
        worker: &mut WorkerState,
        now: Timestamp,
        settings: &WatchdogSettings,
    ) -> TickOutcome {
        self.state.reset_wait_start.store(now);
        // A notification racing with the previous episode reset can leave the
        // wait timer set without an episode start; re-open the episode here.
        let (grace_start, _) = self.state.grace_start.set_if_unset(now);

        if worker.episode_logged {
            tracing::info!(
                target = "oomwatch.memory",
                at_ms = now.as_millis(),
                "memory distress reported"
            );
        } else {
            worker.episode_logged = true;
            tracing::warn!(
                target = "oomwatch.memory",
                at_ms = now.as_millis(),
                episode_start_ms = grace_start.as_millis(),
                "memory distress episode started"
            );
        }

        if worker.expects_reserve && !self.reserve.is_present() {
            worker.expects_reserve = false;
            tracing::warn!(
                target = "oomwatch.memory",
                size_mb = worker.last_good_mb,
                "emergency reserve released to the host"
            );
        }

        let marker = self.write_marker(settings);
        TickOutcome::Observed { marker }
    }

    /// With the crash flag on, the marker is rewritten on every observation so
    /// that a marker removed or moved mid-episode is back on disk before the
    /// handler is allowed to abort.
    fn write_marker(&self, settings: &WatchdogSettings) -> MarkerOutcome {
        if !settings.crash_flag {
            return MarkerOutcome::Disabled;
        }

        match marker::write_marker(&settings.marker_path) {
            Ok(()) => {
                let first = !self.state.marker_written.swap(true, Ordering::SeqCst);
                if first {
                    tracing::warn!(
                        target = "oomwatch.memory",
                        path = %settings.marker_path.display(),
                        "distress marker written"
                    );
                } else {
                    tracing::debug!(
                        target = "oomwatch.memory",
                        path = %settings.marker_path.display(),
                        "distress marker rewritten"
                    );
                }
                MarkerOutcome::Written
            }
            Err(err) => {
                tracing::error!(
                    target = "oomwatch.memory",
                    error = %err,
                    "failed to write distress marker"
                );
                MarkerOutcome::Failed
            }
        }
    }

    fn cool_down(
        &self,
        worker: &mut WorkerState,
        now: Timestamp,
        wait_start: Timestamp,
        settings: &WatchdogSettings,
    ) -> TickOutcome {
        let quiet_for = now.saturating_since(wait_start);
        if quiet_for.as_secs() <= settings.reset_time.as_secs() {
            return TickOutcome::CoolingDown { quiet_for };
        }

        // A notification that landed after the signal check moved the wait
        // timer; leave the episode open for the next tick to observe.
        if !self.state.reset_wait_start.clear_if(wait_start) {
            return TickOutcome::CoolingDown {
                quiet_for: Duration::ZERO,
            };
        }
        self.state.grace_start.clear();
        self.state.marker_written.store(false, Ordering::SeqCst);
        self.state.abort_requested.store(false, Ordering::SeqCst);
        worker.episode_logged = false;
        worker.abort_logged = false;

        tracing::warn!(
            target = "oomwatch.memory",
            at_ms = now.as_millis(),
            quiet_ms = quiet_for.as_millis() as u64,
            "memory distress cleared; episode timers reset"
        );

        let reserve = if self.reserve.is_present() {
            ReserveOutcome::Unchanged
        } else if settings.reserve_size_mb == 0 {
            ReserveOutcome::Disabled
        } else {
            tracing::info!(
                target = "oomwatch.memory",
                size_mb = settings.reserve_size_mb,
                "re-populating emergency reserve"
            );
            self.install_reserve(worker, settings)
        };
        TickOutcome::EpisodeCleared { reserve }
    }

    fn reconcile(&self, worker: &mut WorkerState, settings: &WatchdogSettings) -> TickOutcome {
        let configured = settings.reserve_size_mb;
        let held = self.reserve.held_size_mb();

        if configured == 0 {
            worker.last_good_mb = 0;
            if self.reserve.release() {
                worker.expects_reserve = false;
                tracing::info!(
                    target = "oomwatch.memory",
                    "emergency reserve disabled; released"
                );
                return TickOutcome::Reconciled {
                    reserve: ReserveOutcome::Disabled,
                };
            }
            return TickOutcome::Idle;
        }
        if held == Some(configured) {
            return TickOutcome::Idle;
        }

        tracing::info!(
            target = "oomwatch.memory",
            held_mb = held,
            size_mb = configured,
            "emergency reserve resized; re-populating"
        );
        if self.reserve.release() {
            worker.expects_reserve = false;
        }
        TickOutcome::Reconciled {
            reserve: self.install_reserve(worker, settings),
        }
    }

    fn install_reserve(&self, worker: &mut WorkerState, settings: &WatchdogSettings) -> ReserveOutcome {
        let requested_mb = settings.reserve_size_mb;
        match self.reserve.ensure(requested_mb, settings.lock_reserve) {
            Ok(()) => {
                worker.last_good_mb = requested_mb;
                // The handler may have fired while we were allocating; it
                // could not drop a block that was not yet installed.
                if self.state.distress_signaled.load(Ordering::SeqCst) {
                    self.reserve.release();
                    worker.expects_reserve = false;
                    tracing::info!(
                        target = "oomwatch.memory",
                        size_mb = requested_mb,
                        "distress reported during reserve allocation; dropping it"
                    );
                    return ReserveOutcome::Preempted {
                        size_mb: requested_mb,
                    };
                }
                worker.expects_reserve = true;
                tracing::info!(
                    target = "oomwatch.memory",
                    size_mb = requested_mb,
                    "emergency reserve populated"
                );
                ReserveOutcome::Allocated {
                    size_mb: requested_mb,
                }
            }
            Err(err) => {
                let reverted_to_mb = worker.last_good_mb;
                self.tunables
                    .revert_reserve_size_mb(requested_mb, reverted_to_mb);
                tracing::warn!(
                    target = "oomwatch.memory",
                    requested_mb,
                    reverted_to_mb,
                    error = %err,
                    "emergency reserve allocation failed; will retry at the last good size"
                );
                ReserveOutcome::Failed {
                    requested_mb,
                    reverted_to_mb,
                }
            }
        }
    }
}
