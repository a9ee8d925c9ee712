//! Per-process liveness lock files.
//!
//! A producer advertises that it is alive by creating
//! `.statshm_lock.<proc>.<pid>` in the segment directory and holding an
//! exclusive `flock` on it for its whole lifetime. The kernel drops the
//! lock the instant the process dies, however it dies, so a monitor can
//! decide liveness from `/proc/locks` alone: a pid is alive iff a lock file
//! names it *and* the kernel still records a lock held by it. Neither side
//! ever blocks on the lock.

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, Result};
use crate::layout::lock_file_name;

/// An advisory lock held for the lifetime of the producer process.
pub struct ProcessLock {
    /// Keeps the fd open; closing it is what releases the lock.
    _file: std::fs::File,
    path: PathBuf,
    held: bool,
}

impl ProcessLock {
    /// Creates the lock file and takes the exclusive lock, non-blocking.
    ///
    /// A lock already held elsewhere (`EWOULDBLOCK`) is tolerated with a
    /// warning: the file still marks the pid, only the kernel half of the
    /// liveness signal is missing.
    pub fn acquire(root: &Path, proc_name: &str, pid: u32) -> Result<Self> {
        let path = root.join(lock_file_name(proc_name, pid));
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        let held = if rc == 0 {
            true
        } else {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                warn!(path = %path.display(), "lock file already locked");
                false
            } else {
                return Err(Error::Io(err));
            }
        };
        Ok(Self { _file: file, path, held })
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the exclusive lock was actually obtained.
    pub fn is_held(&self) -> bool {
        self.held
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        // Removing the name first keeps the window where a monitor could
        // still find the file, locked but ownerless, as short as possible.
        // Closing the descriptor afterwards is what releases the flock.
        let _ = std::fs::remove_file(&self.path);
    }
}
