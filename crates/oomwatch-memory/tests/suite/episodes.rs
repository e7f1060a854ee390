use std::time::Duration;

use oomwatch_memory::{MarkerOutcome, ReserveOutcome, TickOutcome};

use super::{secs, Harness};

#[test]
fn abort_fires_once_after_the_grace_period() {
    let h = Harness::new(|s| {
        s.grace_time = Duration::from_secs(10);
        s.reserve_size_mb = 32;
    });
    h.monitor.populate().unwrap();

    h.notify_at(0);
    assert_eq!(h.monitor.distress().grace_start, secs(0));
    assert!(!h.monitor.status().reserve_present);

    assert_eq!(
        h.tick_at(1),
        TickOutcome::Observed {
            marker: MarkerOutcome::Written
        }
    );
    assert!(h.marker_path().exists());

    for t in (2..=10).step_by(2) {
        h.notify_at(t);
        assert_eq!(h.abort.requests(), 0, "aborted early at t={t}");
    }

    h.notify_at(11);
    assert_eq!(h.abort.requests(), 1);
    assert_eq!(h.abort.last_elapsed(), Some(Duration::from_secs(11)));

    h.notify_at(12);
    h.tick_at(12);
    h.notify_at(13);
    assert_eq!(h.abort.requests(), 1);
    assert!(h.monitor.distress().abort_requested);
}

#[test]
fn abort_waits_for_the_marker_when_the_crash_flag_is_set() {
    let h = Harness::new(|s| s.grace_time = Duration::from_secs(10));
    let writable = h.marker_path();
    h.tunables
        .set_marker_path(h.dir.path().join("missing").join("oomflag"));

    h.notify_at(0);
    assert_eq!(
        h.tick_at(1),
        TickOutcome::Observed {
            marker: MarkerOutcome::Failed
        }
    );

    h.notify_at(11);
    assert_eq!(h.abort.requests(), 0);

    h.tunables.set_marker_path(writable.clone());
    assert_eq!(
        h.tick_at(12),
        TickOutcome::Observed {
            marker: MarkerOutcome::Written
        }
    );
    assert!(writable.exists());

    h.notify_at(13);
    assert_eq!(h.abort.requests(), 1);
}

#[test]
fn abort_is_immediate_without_the_crash_flag() {
    let h = Harness::new(|s| {
        s.grace_time = Duration::from_secs(10);
        s.crash_flag = false;
    });

    h.notify_at(0);
    h.notify_at(10);
    assert_eq!(h.abort.requests(), 0);
    h.notify_at(11);
    assert_eq!(h.abort.requests(), 1);

    assert_eq!(
        h.tick_at(11),
        TickOutcome::Observed {
            marker: MarkerOutcome::Disabled
        }
    );
    assert!(!h.marker_path().exists());
}

#[test]
fn zero_grace_time_never_aborts() {
    let h = Harness::new(|_| {});

    for t in (0..2_000).step_by(5) {
        h.notify_at(t);
        h.tick_at(t + 1);
    }

    assert_eq!(h.abort.requests(), 0);
    assert!(h.monitor.distress().in_episode());
}

#[test]
fn episode_clears_after_the_reset_period() {
    let h = Harness::new(|s| s.reserve_size_mb = 32);
    h.monitor.populate().unwrap();

    h.notify_at(0);
    assert_eq!(
        h.tick_at(0),
        TickOutcome::Observed {
            marker: MarkerOutcome::Written
        }
    );
    assert_eq!(
        h.tick_at(300),
        TickOutcome::CoolingDown {
            quiet_for: Duration::from_secs(300)
        }
    );
    assert_eq!(
        h.tick_at(301),
        TickOutcome::EpisodeCleared {
            reserve: ReserveOutcome::Allocated { size_mb: 32 }
        }
    );

    let status = h.monitor.status();
    assert_eq!(status.distress.grace_start, None);
    assert_eq!(status.distress.reset_wait_start, None);
    assert!(!status.distress.marker_written);
    assert!(!status.distress.abort_requested);
    assert_eq!(status.reserve_size_mb, Some(32));

    assert_eq!(h.tick_at(302), TickOutcome::Idle);
}

#[test]
fn grace_and_reset_count_whole_seconds() {
    let h = Harness::new(|s| s.grace_time = Duration::from_secs(10));

    h.notify_at(0);
    h.tick_at(0);

    h.clock.set(Duration::from_millis(10_999));
    h.notifier.notify();
    assert_eq!(h.abort.requests(), 0);
    h.tick_at(11);

    h.clock.set(Duration::from_millis(311_900));
    assert!(matches!(h.monitor.tick(), TickOutcome::CoolingDown { .. }));
    assert!(matches!(h.tick_at(312), TickOutcome::EpisodeCleared { .. }));
    assert_eq!(h.abort.requests(), 0);
}

#[test]
fn reset_period_is_measured_from_the_observing_tick() {
    let h = Harness::new(|_| {});

    h.notify_at(0);
    h.tick_at(1);
    assert_eq!(h.monitor.distress().reset_wait_start, secs(1));

    assert!(matches!(h.tick_at(301), TickOutcome::CoolingDown { .. }));
    assert!(matches!(h.tick_at(302), TickOutcome::EpisodeCleared { .. }));
}

#[test]
fn notifications_between_ticks_coalesce() {
    let h = Harness::new(|_| {});

    for t in 0..5 {
        h.notify_at(t);
    }
    assert_eq!(h.monitor.distress().grace_start, secs(0));
    assert_eq!(h.monitor.distress().reset_wait_start, secs(4));

    assert!(matches!(h.tick_at(5), TickOutcome::Observed { .. }));
    assert!(matches!(h.tick_at(6), TickOutcome::CoolingDown { .. }));
    assert!(!h.monitor.distress().distress_signaled);
}

#[test]
fn fresh_distress_cancels_the_cooldown() {
    let h = Harness::new(|_| {});

    h.notify_at(0);
    h.tick_at(0);
    assert!(matches!(h.tick_at(200), TickOutcome::CoolingDown { .. }));

    h.notify_at(250);
    assert_eq!(
        h.tick_at(301),
        TickOutcome::Observed {
            marker: MarkerOutcome::Written
        }
    );
    // Same episode: its start is kept.
    assert_eq!(h.monitor.distress().grace_start, secs(0));

    assert!(matches!(h.tick_at(601), TickOutcome::CoolingDown { .. }));
    assert!(matches!(h.tick_at(602), TickOutcome::EpisodeCleared { .. }));
    assert_eq!(h.monitor.distress().grace_start, None);
}

#[test]
fn grace_start_is_kept_across_the_whole_episode() {
    let h = Harness::new(|_| {});

    h.notify_at(7);
    h.tick_at(8);
    h.notify_at(100);
    h.tick_at(101);

    let distress = h.monitor.distress();
    assert_eq!(distress.grace_start, secs(7));
    assert_eq!(distress.reset_wait_start, secs(101));
}

#[test]
fn marker_is_rewritten_on_every_observation_and_never_deleted() {
    let h = Harness::new(|_| {});
    let marker = h.marker_path();

    h.notify_at(0);
    h.tick_at(0);
    std::fs::remove_file(&marker).unwrap();

    h.notify_at(5);
    assert_eq!(
        h.tick_at(5),
        TickOutcome::Observed {
            marker: MarkerOutcome::Written
        }
    );
    assert!(marker.exists());

    assert!(matches!(h.tick_at(400), TickOutcome::EpisodeCleared { .. }));
    assert!(marker.exists(), "marker removal belongs to recovery tooling");
}

#[test]
fn marker_removed_mid_episode_is_back_before_the_abort() {
    let h = Harness::new(|s| s.grace_time = Duration::from_secs(10));
    let marker = h.marker_path();

    h.notify_at(0);
    h.tick_at(1);
    std::fs::remove_file(&marker).unwrap();

    h.notify_at(5);
    assert_eq!(
        h.tick_at(6),
        TickOutcome::Observed {
            marker: MarkerOutcome::Written
        }
    );

    h.notify_at(11);
    assert_eq!(h.abort.requests(), 1);
    assert!(marker.exists());
}

#[test]
fn marker_follows_a_live_path_change() {
    let h = Harness::new(|_| {});
    let moved = h.dir.path().join("moved-oomflag");

    h.notify_at(0);
    h.tick_at(0);
    h.tunables.set_marker_path(moved.clone());

    h.notify_at(5);
    assert_eq!(
        h.tick_at(5),
        TickOutcome::Observed {
            marker: MarkerOutcome::Written
        }
    );
    assert!(moved.exists());
}

#[test]
fn a_new_episode_can_abort_again() {
    let h = Harness::new(|s| {
        s.grace_time = Duration::from_secs(10);
        s.crash_flag = false;
    });

    h.notify_at(0);
    h.notify_at(11);
    h.tick_at(11);
    assert_eq!(h.abort.requests(), 1);

    assert!(matches!(h.tick_at(400), TickOutcome::EpisodeCleared { .. }));

    h.notify_at(1_000);
    h.notify_at(1_011);
    assert_eq!(h.abort.requests(), 2);
}

#[test]
fn live_tunables_are_read_on_every_notification() {
    let h = Harness::new(|s| s.crash_flag = false);

    h.notify_at(0);
    h.notify_at(100);
    assert_eq!(h.abort.requests(), 0);

    h.tunables.set_grace_time(Duration::from_secs(60));
    h.notify_at(101);
    assert_eq!(h.abort.requests(), 1);
}
