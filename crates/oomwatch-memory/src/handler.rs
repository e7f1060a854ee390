use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::abort::AbortReason;
use crate::monitor::Inner;

/// Entry point for host distress notifications.
///
/// [`DistressNotifier::notify`] may run concurrently with itself and with the
/// worker. It only performs atomic stores, one lock-free swap of the reserve
/// slot and, once the grace time has run out, the host abort request. It never
/// logs, blocks or takes a lock; everything else is left to the next worker
/// tick.
#[derive(Clone)]
pub struct DistressNotifier {
    inner: Arc<Inner>,
}

impl DistressNotifier {
    pub(crate) fn new(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    pub fn notify(&self) {
        self.inner.on_distress();
    }
}

impl fmt::Debug for DistressNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistressNotifier").finish_non_exhaustive()
    }
}

impl Inner {
    pub(crate) fn on_distress(&self) {
        let state = &self.state;

        // The host's own recovery path may need this memory.
        self.reserve.release();

        let now = self.clock.now();
        let (grace_start, _) = state.grace_start.set_if_unset(now);
        state.reset_wait_start.store(now);

        let grace = self.tunables.grace_time();
        if !grace.is_zero() {
            let elapsed = now.saturating_since(grace_start);
            // Whole seconds: a 10s grace first aborts at the 11th second.
            if elapsed.as_secs() > grace.as_secs() {
                // With the crash flag on, the marker must exist before the host
                // goes down; the worker writes it on its next tick.
                let marker_ready =
                    !self.tunables.crash_flag() || state.marker_written.load(Ordering::SeqCst);
                if marker_ready && !state.abort_requested.swap(true, Ordering::SeqCst) {
                    let reason = AbortReason::GraceExpired { elapsed };
                    if self.abort.request_abort(reason).is_err() {
                        state.abort_requested.store(false, Ordering::SeqCst);
                    }
                }
            }
        }

        state.distress_signaled.store(true, Ordering::SeqCst);
    }
}
