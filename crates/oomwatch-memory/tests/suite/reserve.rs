use std::sync::Arc;

use oomwatch_memory::{
    DistressMonitor, ManualClock, RecordingAbort, ReserveError, ReserveOutcome, TickOutcome,
    Tunables, WatchdogSettings,
};

use super::{Harness, InterruptingAllocator};

#[test]
fn populate_allocates_the_configured_size() {
    let h = Harness::new(|s| s.reserve_size_mb = 32);

    h.monitor.populate().unwrap();

    let status = h.monitor.status();
    assert!(status.reserve_present);
    assert_eq!(status.reserve_size_mb, Some(32));
    assert_eq!(status.configured_reserve_mb, 32);
    assert_eq!(h.tick_at(1), TickOutcome::Idle);
}

#[test]
fn failed_populate_disables_the_reserve() {
    let h = Harness::new(|s| s.reserve_size_mb = 128);

    let err = h.monitor.populate().unwrap_err();
    assert_eq!(err, ReserveError::Allocation { size_mb: 128 });
    assert_eq!(h.tunables.reserve_size_mb(), 0);
    assert!(!h.monitor.status().reserve_present);

    // Not retried by later ticks.
    assert_eq!(h.tick_at(1), TickOutcome::Idle);
    assert_eq!(h.tick_at(2), TickOutcome::Idle);
    assert_eq!(h.allocator.attempts(), 1);
}

#[test]
fn zero_size_populate_allocates_nothing() {
    let h = Harness::new(|s| s.reserve_size_mb = 0);

    h.monitor.populate().unwrap();

    assert_eq!(h.allocator.attempts(), 0);
    assert_eq!(h.tick_at(1), TickOutcome::Idle);
}

#[test]
fn distress_releases_the_reserve_immediately() {
    let h = Harness::new(|s| s.reserve_size_mb = 4);
    h.monitor.populate().unwrap();

    h.notify_at(0);

    assert!(!h.monitor.status().reserve_present);
    // Still absent after the worker has seen the episode.
    h.tick_at(1);
    assert!(!h.monitor.status().reserve_present);
}

#[test]
fn disabling_and_re_enabling_the_reserve() {
    let h = Harness::new(|s| s.reserve_size_mb = 4);
    h.monitor.populate().unwrap();

    h.tunables.set_reserve_size_mb(0);
    assert_eq!(
        h.tick_at(1),
        TickOutcome::Reconciled {
            reserve: ReserveOutcome::Disabled
        }
    );
    assert!(!h.monitor.status().reserve_present);
    assert_eq!(h.tick_at(2), TickOutcome::Idle);

    h.tunables.set_reserve_size_mb(8);
    assert_eq!(
        h.tick_at(3),
        TickOutcome::Reconciled {
            reserve: ReserveOutcome::Allocated { size_mb: 8 }
        }
    );
    assert_eq!(h.monitor.status().reserve_size_mb, Some(8));
}

#[test]
fn oversized_request_reverts_to_the_last_good_size() {
    let h = Harness::new(|s| s.reserve_size_mb = 32);
    h.monitor.populate().unwrap();

    h.tunables.set_reserve_size_mb(9_999_999);
    assert_eq!(
        h.tick_at(1),
        TickOutcome::Reconciled {
            reserve: ReserveOutcome::Failed {
                requested_mb: 9_999_999,
                reverted_to_mb: 32,
            }
        }
    );
    assert_eq!(h.tunables.reserve_size_mb(), 32);
    assert!(!h.monitor.status().reserve_present);

    assert_eq!(
        h.tick_at(2),
        TickOutcome::Reconciled {
            reserve: ReserveOutcome::Allocated { size_mb: 32 }
        }
    );
    assert_eq!(h.tick_at(3), TickOutcome::Idle);
}

#[test]
fn a_newer_size_is_not_overwritten_by_the_revert() {
    let h = Harness::new(|s| s.reserve_size_mb = 32);
    h.monitor.populate().unwrap();

    h.tunables.set_reserve_size_mb(9_999_999);
    h.tunables.set_reserve_size_mb(16);
    assert!(!h.tunables.revert_reserve_size_mb(9_999_999, 32));
    assert_eq!(h.tunables.reserve_size_mb(), 16);
}

#[test]
fn resize_is_deferred_until_the_episode_clears() {
    let h = Harness::new(|s| s.reserve_size_mb = 4);
    h.monitor.populate().unwrap();

    h.notify_at(0);
    h.tick_at(0);
    h.tunables.set_reserve_size_mb(8);
    assert!(matches!(h.tick_at(10), TickOutcome::CoolingDown { .. }));
    assert!(!h.monitor.status().reserve_present);

    assert_eq!(
        h.tick_at(301),
        TickOutcome::EpisodeCleared {
            reserve: ReserveOutcome::Allocated { size_mb: 8 }
        }
    );
}

#[test]
fn episode_clear_with_reserve_disabled_allocates_nothing() {
    let h = Harness::new(|s| s.reserve_size_mb = 0);

    h.notify_at(0);
    h.tick_at(0);
    assert_eq!(
        h.tick_at(301),
        TickOutcome::EpisodeCleared {
            reserve: ReserveOutcome::Disabled
        }
    );
    assert_eq!(h.allocator.attempts(), 0);
}

#[test]
fn distress_during_allocation_drops_the_new_block() {
    let dir = tempfile::tempdir().unwrap();
    let settings = WatchdogSettings {
        reserve_size_mb: 1,
        marker_path: dir.path().join("oomflag"),
        ..WatchdogSettings::default()
    };
    let clock = Arc::new(ManualClock::new());
    let allocator = Arc::new(InterruptingAllocator::default());
    let monitor = DistressMonitor::builder(
        Arc::new(Tunables::new(&settings)),
        Arc::new(RecordingAbort::new()),
    )
    .clock(clock.clone())
    .allocator(allocator.clone())
    .build();
    allocator.notifier.set(monitor.notifier()).unwrap();

    assert_eq!(
        monitor.tick(),
        TickOutcome::Reconciled {
            reserve: ReserveOutcome::Preempted { size_mb: 1 }
        }
    );
    assert!(!monitor.status().reserve_present);
    assert!(monitor.distress().distress_signaled);
    assert!(matches!(monitor.tick(), TickOutcome::Observed { .. }));
}

#[test]
fn memory_limit_caps_the_default_allocator() {
    let dir = tempfile::tempdir().unwrap();
    let settings = WatchdogSettings {
        reserve_size_mb: 4,
        marker_path: dir.path().join("oomflag"),
        ..WatchdogSettings::default()
    };
    let tunables = Arc::new(Tunables::new(&settings));
    let monitor = DistressMonitor::builder(tunables.clone(), Arc::new(RecordingAbort::new()))
        .memory_limit(Some(2 * oomwatch_memory::MB))
        .build();

    let err = monitor.populate().unwrap_err();
    assert_eq!(
        err,
        ReserveError::ExceedsMemoryLimit {
            size_mb: 4,
            limit_bytes: 2 * oomwatch_memory::MB,
        }
    );
    assert_eq!(tunables.reserve_size_mb(), 0);
    assert!(!monitor.status().reserve_present);

    tunables.set_reserve_size_mb(1);
    assert!(matches!(
        monitor.tick(),
        TickOutcome::Reconciled {
            reserve: ReserveOutcome::Allocated { size_mb: 1 }
        }
    ));
}
