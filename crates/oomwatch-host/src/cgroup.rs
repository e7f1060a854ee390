#[cfg(target_os = "linux")]
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Mount point of the cgroup v2 unified hierarchy.
pub const CGROUP2_MOUNT: &str = "/sys/fs/cgroup";

/// Parsed cgroup paths from `/proc/self/cgroup`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcSelfCgroup {
    /// cgroup v2 unified hierarchy entry (e.g. `0::/some/path`).
    pub v2_path: Option<String>,
    /// cgroup v1 memory controller entry (e.g. `5:memory:/some/path`).
    pub v1_memory_path: Option<String>,
}

/// Parse `/proc/self/cgroup` contents and extract relevant cgroup paths.
///
/// Pure; does not touch the filesystem.
pub fn parse_proc_self_cgroup(contents: &str) -> ProcSelfCgroup {
    let mut v2_path = None;
    let mut v1_memory_path = None;

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(3, ':');
        let (Some(hierarchy_id), Some(controllers), Some(path)) =
            (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let path = path.trim();

        if v2_path.is_none() && hierarchy_id == "0" && controllers.is_empty() && !path.is_empty() {
            v2_path = Some(path.to_string());
        }

        if v1_memory_path.is_none()
            && controllers
                .split(',')
                .any(|controller| controller.trim() == "memory")
        {
            v1_memory_path = Some(path.to_string());
        }
    }

    ProcSelfCgroup {
        v2_path,
        v1_memory_path,
    }
}

const UNLIMITED_THRESHOLD_BYTES: u64 = 1 << 60;

/// Parse a cgroup v2 `memory.max` value. `max` and absurdly large values mean
/// "no limit" and yield `None`.
pub fn parse_memory_max(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "max" {
        return None;
    }

    match raw.parse::<u64>() {
        Ok(value) if value < UNLIMITED_THRESHOLD_BYTES => Some(value),
        Ok(_) => None,
        Err(err) => {
            static REPORTED_LIMIT_PARSE_ERROR: OnceLock<()> = OnceLock::new();
            if REPORTED_LIMIT_PARSE_ERROR.set(()).is_ok() {
                tracing::debug!(
                    target = "oomwatch.host",
                    raw,
                    error = %err,
                    "failed to parse cgroup memory.max"
                );
            }
            None
        }
    }
}

/// Directory of a cgroup v2 group under `mount`.
pub fn cgroup_dir(mount: &Path, cgroup_path: &str) -> PathBuf {
    mount.join(cgroup_path.trim_start_matches('/'))
}

/// The `memory.pressure` file of the cgroup v2 group this process belongs to.
///
/// Returns `None` on cgroup v1 hosts, when `/proc` is unavailable, or when the
/// group exposes no pressure file (PSI disabled).
pub fn own_memory_pressure_path() -> Option<PathBuf> {
    own_memory_pressure_path_impl()
}

#[cfg(target_os = "linux")]
fn own_memory_pressure_path_impl() -> Option<PathBuf> {
    let parsed = read_proc_self_cgroup()?;
    let path = cgroup_dir(Path::new(CGROUP2_MOUNT), parsed.v2_path.as_deref()?)
        .join("memory.pressure");
    path.exists().then_some(path)
}

#[cfg(not(target_os = "linux"))]
fn own_memory_pressure_path_impl() -> Option<PathBuf> {
    None
}

/// Smallest `memory.max` along this process's cgroup v2 ancestry.
pub fn own_memory_limit_bytes() -> Option<u64> {
    own_memory_limit_bytes_impl()
}

#[cfg(target_os = "linux")]
fn own_memory_limit_bytes_impl() -> Option<u64> {
    let parsed = read_proc_self_cgroup()?;
    effective_limit_from_ancestors(Path::new(CGROUP2_MOUNT), parsed.v2_path.as_deref()?)
}

#[cfg(not(target_os = "linux"))]
fn own_memory_limit_bytes_impl() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn effective_limit_from_ancestors(mount: &Path, cgroup_path: &str) -> Option<u64> {
    let mut dir = PathBuf::from(cgroup_path.trim_start_matches('/'));
    let mut best: Option<u64> = None;

    loop {
        if let Some(limit) = read_trimmed(&mount.join(&dir).join("memory.max"))
            .as_deref()
            .and_then(parse_memory_max)
        {
            best = Some(best.map_or(limit, |best| best.min(limit)));
        }
        if !dir.pop() {
            break;
        }
    }

    best
}

#[cfg(target_os = "linux")]
fn read_proc_self_cgroup() -> Option<ProcSelfCgroup> {
    match std::fs::read_to_string("/proc/self/cgroup") {
        Ok(contents) => Some(parse_proc_self_cgroup(&contents)),
        Err(err) => {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::debug!(
                    target = "oomwatch.host",
                    error = %err,
                    "failed to read /proc/self/cgroup"
                );
            }
            None
        }
    }
}

#[cfg(target_os = "linux")]
fn read_trimmed(path: &Path) -> Option<String> {
    match std::fs::read_to_string(path) {
        Ok(text) => Some(text.trim().to_string()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => {
            // Containers often restrict cgroup files; report the first failure only.
            static REPORTED_CGROUP_READ_ERROR: OnceLock<()> = OnceLock::new();
            if REPORTED_CGROUP_READ_ERROR.set(()).is_ok() {
                tracing::debug!(
                    target = "oomwatch.host",
                    path = %path.display(),
                    error = %err,
                    "failed to read cgroup file"
                );
            }
            None
        }
    }
}
