use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

pub use tokio_util::sync::CancellationToken;

use crate::monitor::DistressMonitor;

/// Default cadence of the periodic worker.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Handle to the background task that drives [`DistressMonitor::tick`].
///
/// Ticks never overlap: each one runs to completion on the blocking pool
/// before the next is scheduled. Cancelling the token stops the schedule after
/// one final tick; an in-flight tick is never interrupted.
pub struct PeriodicWorker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl PeriodicWorker {
    /// Spawns the worker on the current Tokio runtime.
    ///
    /// The first tick runs one `interval` after spawning.
    pub fn spawn(monitor: DistressMonitor, interval: Duration, token: CancellationToken) -> Self {
        let handle = tokio::spawn(run(monitor, interval, token.clone()));
        Self { token, handle }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Requests the final tick and waits for the worker to exit.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.handle.await {
            tracing::error!(
                target = "oomwatch.memory",
                error = %err,
                "periodic worker terminated abnormally"
            );
        }
    }
}

async fn run(monitor: DistressMonitor, interval: Duration, token: CancellationToken) {
    let interval = interval.max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => run_tick(&monitor).await,
        }
    }

    run_tick(&monitor).await;
    tracing::debug!(target = "oomwatch.memory", "periodic worker stopped");
}

async fn run_tick(monitor: &DistressMonitor) {
    let monitor = monitor.clone();
    match tokio::task::spawn_blocking(move || monitor.tick()).await {
        Ok(outcome) => {
            tracing::trace!(target = "oomwatch.memory", ?outcome, "worker tick");
        }
        Err(err) => {
            // A failed tick is retried on the next one; the schedule survives.
            tracing::error!(
                target = "oomwatch.memory",
                error = %err,
                "worker tick failed"
            );
        }
    }
}
