//! PSI (pressure stall information) trigger source.
//!
//! Writing `some|full <threshold_us> <window_us>` to a memory pressure file
//! arms a kernel trigger; the file descriptor then reports `POLLPRI` whenever
//! tasks stalled on memory for at least `threshold` within a `window`. Each
//! event is forwarded to [`DistressNotifier::notify`].

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use oomwatch_memory::{CancellationToken, DistressNotifier};
use serde::{Deserialize, Serialize};

use crate::cgroup;
use crate::pressure::PROC_PRESSURE_MEMORY;

/// Kernel bounds on the trigger window.
pub const MIN_WINDOW: Duration = Duration::from_millis(500);
pub const MAX_WINDOW: Duration = Duration::from_secs(10);

/// How long the poll thread waits before re-checking cancellation.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum PsiError {
    #[error("PSI window {window:?} is outside 500ms..=10s")]
    WindowOutOfRange { window: Duration },
    #[error("PSI threshold {threshold:?} exceeds window {window:?}")]
    ThresholdExceedsWindow {
        threshold: Duration,
        window: Duration,
    },
    #[error("PSI threshold must be non-zero")]
    ZeroThreshold,
    #[error("no cgroup v2 memory.pressure file for this process")]
    NoCgroupPressure,
    #[error("failed to arm PSI trigger on {path}: {source}")]
    Arm {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn PSI poll thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Which stall class arms the trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StallKind {
    /// At least one task stalled.
    #[default]
    Some,
    /// All non-idle tasks stalled at once.
    Full,
}

impl StallKind {
    fn as_str(self) -> &'static str {
        match self {
            StallKind::Some => "some",
            StallKind::Full => "full",
        }
    }
}

/// Which pressure file to watch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PsiScope {
    /// `/proc/pressure/memory`.
    #[default]
    System,
    /// The `memory.pressure` file of this process's cgroup v2 group.
    Cgroup,
}

impl PsiScope {
    pub fn pressure_path(self) -> Result<PathBuf, PsiError> {
        match self {
            PsiScope::System => Ok(PathBuf::from(PROC_PRESSURE_MEMORY)),
            PsiScope::Cgroup => cgroup::own_memory_pressure_path().ok_or(PsiError::NoCgroupPressure),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsiTrigger {
    pub kind: StallKind,
    pub threshold: Duration,
    pub window: Duration,
}

impl Default for PsiTrigger {
    fn default() -> Self {
        Self {
            kind: StallKind::Some,
            threshold: Duration::from_millis(150),
            window: Duration::from_secs(1),
        }
    }
}

impl PsiTrigger {
    pub fn validate(&self) -> Result<(), PsiError> {
        if self.window < MIN_WINDOW || self.window > MAX_WINDOW {
            return Err(PsiError::WindowOutOfRange {
                window: self.window,
            });
        }
        if self.threshold.is_zero() {
            return Err(PsiError::ZeroThreshold);
        }
        if self.threshold > self.window {
            return Err(PsiError::ThresholdExceedsWindow {
                threshold: self.threshold,
                window: self.window,
            });
        }
        Ok(())
    }

    /// The line written to the pressure file, NUL-terminated as the kernel
    /// expects.
    pub fn trigger_line(&self) -> String {
        format!(
            "{} {} {}\0",
            self.kind.as_str(),
            self.threshold.as_micros(),
            self.window.as_micros()
        )
    }
}

impl fmt::Display for PsiTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}us/{}us",
            self.kind.as_str(),
            self.threshold.as_micros(),
            self.window.as_micros()
        )
    }
}

/// An armed trigger whose events have not been consumed yet.
#[derive(Debug)]
pub struct PsiSource {
    file: File,
    path: PathBuf,
    poll_timeout: Duration,
}

impl PsiSource {
    /// Validates `trigger` and arms it on `path`.
    pub fn arm(path: &Path, trigger: PsiTrigger) -> Result<Self, PsiError> {
        trigger.validate()?;
        let arm_err = |source| PsiError::Arm {
            path: path.to_path_buf(),
            source,
        };
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(arm_err)?;
        file.write_all(trigger.trigger_line().as_bytes())
            .map_err(arm_err)?;

        tracing::info!(
            target = "oomwatch.host",
            path = %path.display(),
            trigger = %trigger,
            "PSI trigger armed"
        );
        Ok(Self::from_file(file, path.to_path_buf()))
    }

    /// Wraps an already-armed descriptor.
    pub fn from_file(file: File, path: PathBuf) -> Self {
        Self {
            file,
            path,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts forwarding events to `notifier` on a dedicated thread until
    /// `token` is cancelled or the descriptor reports an error.
    pub fn spawn(
        self,
        notifier: DistressNotifier,
        token: CancellationToken,
    ) -> Result<PsiMonitor, PsiError> {
        let thread_token = token.clone();
        let handle = thread::Builder::new()
            .name("oomwatch-psi".into())
            .spawn(move || self.run(notifier, thread_token))
            .map_err(PsiError::Spawn)?;
        Ok(PsiMonitor {
            token,
            handle: Some(handle),
        })
    }

    fn run(self, notifier: DistressNotifier, token: CancellationToken) -> u64 {
        let timeout_ms = self.poll_timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let mut events = 0u64;

        while !token.is_cancelled() {
            let mut fds = libc::pollfd {
                fd: self.file.as_raw_fd(),
                events: libc::POLLPRI,
                revents: 0,
            };
            // SAFETY: `fds` is a single valid pollfd and the descriptor is
            // owned by `self.file` for the duration of the call.
            let ready = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                tracing::error!(
                    target = "oomwatch.host",
                    path = %self.path.display(),
                    error = %err,
                    "PSI poll failed; source stopped"
                );
                break;
            }
            if ready == 0 {
                continue;
            }
            if fds.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                tracing::error!(
                    target = "oomwatch.host",
                    path = %self.path.display(),
                    revents = fds.revents,
                    "PSI trigger reported an error; source stopped"
                );
                break;
            }
            if fds.revents & libc::POLLPRI != 0 {
                events += 1;
                notifier.notify();
            }
        }

        tracing::debug!(
            target = "oomwatch.host",
            path = %self.path.display(),
            events,
            "PSI source finished"
        );
        events
    }
}

/// Handle to a running PSI poll thread.
#[derive(Debug)]
pub struct PsiMonitor {
    token: CancellationToken,
    handle: Option<thread::JoinHandle<u64>>,
}

impl PsiMonitor {
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }

    /// Cancels the thread and waits for it. Returns the number of events
    /// forwarded.
    pub fn stop(mut self) -> u64 {
        self.token.cancel();
        self.join()
    }

    fn join(&mut self) -> u64 {
        match self.handle.take().map(|handle| handle.join()) {
            Some(Ok(events)) => events,
            Some(Err(_)) => {
                tracing::error!(target = "oomwatch.host", "PSI poll thread panicked");
                0
            }
            None => 0,
        }
    }
}

impl Drop for PsiMonitor {
    fn drop(&mut self) {
        self.token.cancel();
        self.join();
    }
}
