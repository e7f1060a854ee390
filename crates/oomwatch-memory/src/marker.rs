//! Persistent distress marker.
//!
//! The marker is written eagerly when distress is observed and is never removed
//! by the watchdog. Its job is to survive a forced abort so that recovery
//! tooling can detect the reboot and delete the file once handled.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to write distress marker {path}: {source}")]
pub struct MarkerError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Creates (or truncates) the marker at `path` and flushes it to stable storage.
pub fn write_marker(path: &Path) -> Result<(), MarkerError> {
    write_marker_inner(path).map_err(|source| MarkerError {
        path: path.to_path_buf(),
        source,
    })
}

fn write_marker_inner(path: &Path) -> io::Result<()> {
    let written_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    let contents = format!(
        "oomwatch distress marker\npid={}\nwritten_at_unix={written_at}\n",
        std::process::id()
    );

    let mut file = open_synchronous(path)?;
    file.write_all(contents.as_bytes())?;
    file.sync_all()?;
    sync_parent_dir(path)
}

/// Flushes the directory entry so a freshly created marker survives a reboot
/// that skips the filesystem sync.
fn sync_parent_dir(path: &Path) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()
}

fn open_synchronous(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;

        // `O_SYNC` rather than `O_DIRECT`: the latter is refused by tmpfs and
        // several other filesystems when creating a file.
        options.custom_flags(libc::O_SYNC).mode(0o644);
    }
    options.open(path)
}

/// Whether a marker is currently present at `path`.
pub fn marker_exists(path: &Path) -> bool {
    path.try_exists().unwrap_or(false)
}
