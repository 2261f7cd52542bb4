//! Per-gear advisory lock.
//!
//! The lifecycle engine does no internal locking; callers serialize work on a
//! gear by holding this lock. It is an exclusive, non-blocking `flock` on
//! `<run_dir>/<gear>.lock`, released when the guard drops (or the process exits).

use crate::config::types::{GearError, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Owner information written into a held lock file
#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    gear_id: String,
    version: String,
}

/// RAII guard for a held gear lock
#[derive(Debug)]
pub struct GearLockGuard {
    gear_id: String,
    path: PathBuf,
    file: File,
}

impl GearLockGuard {
    pub fn gear_id(&self) -> &str {
        &self.gear_id
    }
}

impl Drop for GearLockGuard {
    fn drop(&mut self) {
        // Truncate instead of unlinking so a waiter never locks a different inode
        let _ = self.file.set_len(0);
        debug!("Released gear lock {}", self.path.display());
    }
}

/// Acquire the exclusive lock for a gear without blocking
pub fn acquire_gear_lock(run_dir: &Path, gear_id: &str) -> Result<GearLockGuard> {
    std::fs::create_dir_all(run_dir).map_err(|e| {
        GearError::Lock(format!(
            "Failed to create lock directory {}: {}",
            run_dir.display(),
            e
        ))
    })?;

    let path = run_dir.join(format!("{}.lock", gear_id));

    // Open without truncating: never destroy data before holding flock
    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .map_err(|e| GearError::Lock(format!("Failed to open {}: {}", path.display(), e)))?;

    // SAFETY: the fd is owned by `file`, which outlives this call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::EWOULDBLOCK) => Err(GearError::LockBusy),
            _ => Err(GearError::Lock(format!("flock failed: {}", err))),
        };
    }

    let info = LockInfo {
        pid: std::process::id(),
        gear_id: gear_id.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let json = serde_json::to_string(&info)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", json)?;
    let pos = file.stream_position()?;
    file.set_len(pos)?;

    info!("Acquired gear lock for {}", gear_id);
    Ok(GearLockGuard {
        gear_id: gear_id.to_string(),
        path,
        file,
    })
}
