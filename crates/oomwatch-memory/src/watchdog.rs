use std::future::Future;
use std::time::Duration;

use crate::handler::DistressNotifier;
use crate::monitor::{DistressMonitor, WatchdogStatus};
use crate::worker::{CancellationToken, PeriodicWorker};

/// A running watchdog: a populated reserve plus its periodic worker.
pub struct Watchdog {
    monitor: DistressMonitor,
    worker: PeriodicWorker,
}

impl Watchdog {
    /// Populates the reserve on the calling thread, then schedules the worker
    /// on the current Tokio runtime.
    ///
    /// A failed initial allocation is logged and leaves the reserve disabled;
    /// the watchdog still starts.
    pub fn start(monitor: DistressMonitor, tick_interval: Duration) -> Self {
        if let Err(err) = monitor.populate() {
            tracing::debug!(
                target = "oomwatch.memory",
                error = %err,
                "starting without an emergency reserve"
            );
        }
        let worker = PeriodicWorker::spawn(monitor.clone(), tick_interval, CancellationToken::new());
        tracing::info!(
            target = "oomwatch.memory",
            tick_interval_ms = tick_interval.as_millis() as u64,
            "oomwatch enabled"
        );
        Self { monitor, worker }
    }

    pub fn monitor(&self) -> &DistressMonitor {
        &self.monitor
    }

    pub fn notifier(&self) -> DistressNotifier {
        self.monitor.notifier()
    }

    pub fn status(&self) -> WatchdogStatus {
        self.monitor.status()
    }

    /// Stops the worker after its final pass, then frees the reserve.
    pub async fn shutdown(self) {
        self.shutdown_with(async {}).await;
    }

    /// Shuts down in order: the worker's final pass, then
    /// `deregister_sources`, then the reserve release. No notification can
    /// arrive once the reserve is gone.
    pub async fn shutdown_with<F>(self, deregister_sources: F)
    where
        F: Future<Output = ()>,
    {
        self.worker.shutdown().await;
        deregister_sources.await;
        self.monitor.release_reserve();
        tracing::info!(target = "oomwatch.memory", "oomwatch disabled");
    }
}
