use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use oomwatch_memory::{
    CancellationToken, DistressMonitor, HeapAllocator, PeriodicWorker, RecordingAbort,
    TickOutcome, Tunables, Watchdog, WatchdogSettings, WatchdogStatus,
};

use super::Harness;

#[test]
fn concurrent_notifications_abort_at_most_once() {
    let h = Harness::new(|s| {
        s.grace_time = Duration::from_secs(1);
        s.crash_flag = false;
    });
    h.notify_at(0);
    h.clock.set(Duration::from_secs(5));

    thread::scope(|scope| {
        for _ in 0..8 {
            let notifier = h.notifier.clone();
            scope.spawn(move || {
                for _ in 0..1_000 {
                    notifier.notify();
                }
            });
        }
    });

    assert_eq!(h.abort.requests(), 1);
}

#[test]
fn ticks_racing_notifications_keep_the_episode_consistent() {
    let h = Harness::new(|s| s.reserve_size_mb = 1);
    h.monitor.populate().unwrap();
    let stop = AtomicBool::new(false);

    thread::scope(|scope| {
        for _ in 0..4 {
            let notifier = h.notifier.clone();
            let stop = &stop;
            scope.spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    notifier.notify();
                    thread::yield_now();
                }
            });
        }

        for step in 0..500u64 {
            h.clock.advance(Duration::from_millis(10));
            let outcome = h.monitor.tick();
            assert!(
                !matches!(outcome, TickOutcome::EpisodeCleared { .. }),
                "episode cleared during continuous distress at step {step}"
            );
        }
        stop.store(true, Ordering::Relaxed);
    });

    let distress = h.monitor.distress();
    assert!(distress.in_episode());
    assert!(distress.grace_start.is_some());
    assert!(!h.monitor.status().reserve_present);
}

#[test]
fn notification_racing_the_reset_is_never_lost() {
    for _ in 0..200 {
        let h = Harness::new(|s| s.reset_time = Duration::ZERO);
        h.notify_at(0);
        h.tick_at(0);
        h.clock.set(Duration::from_secs(1));

        thread::scope(|scope| {
            let notifier = h.notifier.clone();
            scope.spawn(move || notifier.notify());
            h.monitor.tick();
        });

        // Whatever the interleaving, the notification leaves either a pending
        // signal or an open episode behind.
        let distress = h.monitor.distress();
        assert!(
            distress.distress_signaled || distress.reset_wait_start.is_some(),
            "{distress:?}"
        );
        if distress.reset_wait_start.is_some() {
            h.tick_at(1);
            assert!(h.monitor.distress().grace_start.is_some());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watchdog_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("oomflag");
    let settings = WatchdogSettings {
        reserve_size_mb: 1,
        marker_path: marker.clone(),
        ..WatchdogSettings::default()
    };
    let monitor = DistressMonitor::builder(
        Arc::new(Tunables::new(&settings)),
        Arc::new(RecordingAbort::new()),
    )
    .allocator(Arc::new(HeapAllocator::unbounded()))
    .build();

    let watchdog = Watchdog::start(monitor, Duration::from_millis(5));
    assert!(watchdog.status().reserve_present);

    watchdog.notifier().notify();
    wait_for(&watchdog, |status| status.distress.marker_written).await;
    assert!(marker.exists());
    assert!(!watchdog.status().reserve_present);

    let monitor = watchdog.monitor().clone();
    watchdog.shutdown().await;
    assert!(!monitor.status().reserve_present);
    assert!(monitor.status().distress.in_episode());
}

#[tokio::test]
async fn worker_token_can_be_shared_with_sources() {
    let h = Harness::new(|_| {});
    let token = CancellationToken::new();
    let worker = PeriodicWorker::spawn(h.monitor.clone(), Duration::from_secs(3600), token.clone());

    token.cancel();
    worker.shutdown().await;

    assert_eq!(h.monitor.status().ticks, 1);
}

async fn wait_for(watchdog: &Watchdog, condition: impl Fn(&WatchdogStatus) -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if condition(&watchdog.status()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("watchdog did not reach the expected state");
}
