use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use oomwatch_memory::{AbortError, AbortReason, HostAbort, RecordingAbort};
use serde::{Deserialize, Serialize};

pub const SYSRQ_TRIGGER: &str = "/proc/sysrq-trigger";

/// What the watchdog does once the grace time runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortAction {
    /// Crash the kernel (sysrq `c`) so kdump or panic-reboot takes over.
    #[default]
    Panic,
    /// Reboot immediately (sysrq `b`) without syncing or unmounting.
    Reboot,
    /// Abort this process only.
    Exit,
    /// Log that an abort would have happened and keep running.
    DryRun,
}

impl AbortAction {
    fn sysrq_key(self) -> Option<u8> {
        match self {
            AbortAction::Panic => Some(b'c'),
            AbortAction::Reboot => Some(b'b'),
            AbortAction::Exit | AbortAction::DryRun => None,
        }
    }
}

/// Writes a single sysrq command to a trigger file opened at start-up, so the
/// abort path never has to open files under memory pressure.
#[derive(Debug)]
pub struct SysrqAbort {
    trigger: File,
    key: u8,
}

impl SysrqAbort {
    pub fn open(action: AbortAction) -> Result<Self, AbortError> {
        Self::open_at(Path::new(SYSRQ_TRIGGER), action)
    }

    pub fn open_at(path: &Path, action: AbortAction) -> Result<Self, AbortError> {
        let key = action
            .sysrq_key()
            .ok_or(AbortError::Unsupported("action has no sysrq command"))?;
        let trigger = OpenOptions::new().write(true).open(path)?;
        Ok(Self { trigger, key })
    }
}

impl HostAbort for SysrqAbort {
    fn request_abort(&self, _reason: AbortReason) -> Result<(), AbortError> {
        (&self.trigger).write_all(&[self.key])?;
        Ok(())
    }
}

/// Aborts the watchdog process itself, for unprivileged deployments where the
/// supervisor restarts the workload.
#[derive(Debug, Default)]
pub struct ProcessAbort;

impl HostAbort for ProcessAbort {
    fn request_abort(&self, _reason: AbortReason) -> Result<(), AbortError> {
        std::process::abort()
    }
}

/// Builds the abort primitive for `action`.
pub fn host_abort(action: AbortAction) -> Result<Arc<dyn HostAbort>, AbortError> {
    let abort: Arc<dyn HostAbort> = match action {
        AbortAction::Panic | AbortAction::Reboot => Arc::new(SysrqAbort::open(action)?),
        AbortAction::Exit => Arc::new(ProcessAbort),
        AbortAction::DryRun => Arc::new(RecordingAbort::new()),
    };
    tracing::info!(target = "oomwatch.host", action = ?action, "abort action ready");
    Ok(abort)
}
