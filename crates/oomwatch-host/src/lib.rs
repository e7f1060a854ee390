//! Linux host integration for the oomwatch core.
//!
//! - [`psi`]: memory PSI triggers as the distress notification source.
//! - [`pressure`] and [`cgroup`]: pure parsers plus best-effort readers for
//!   `/proc/pressure/memory` and `/proc/self/cgroup`.
//! - [`abort`]: the forced abort primitives (sysrq crash, sysrq reboot,
//!   process abort).

pub mod abort;
pub mod cgroup;
pub mod pressure;
pub mod psi;

pub use abort::{host_abort, AbortAction, ProcessAbort, SysrqAbort};
pub use pressure::{
    parse_pressure, read_pressure, PressureLevel, PressureLine, PressureSnapshot,
    PressureThresholds, PROC_PRESSURE_MEMORY,
};
pub use psi::{PsiError, PsiMonitor, PsiScope, PsiSource, PsiTrigger, StallKind};
