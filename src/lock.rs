//! Advisory process lock.
//!
//! Serializes tracer processes that share one data directory. The lock is an
//! exclusive `flock` on a well-known file; it is released on
//! [`ProcessLock::release`] or when the guard is dropped, and by the OS if the
//! process dies.
//!
//! The lock file is never removed. Unlinking it would let a process that
//! opened the old file and one that created a new file both hold "the" lock.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::TracerError;
use crate::paths;

/// Held exclusive lock on a lock file.
#[derive(Debug)]
pub struct ProcessLock {
    file: Option<File>,
    path: PathBuf,
}

impl ProcessLock {
    /// Lock the default file, `<tmp>/emqutiti-tracer.lock`.
    pub fn acquire_default() -> Result<Self, TracerError> {
        Self::acquire(&paths::lock_file())
    }

    /// Take the lock without blocking.
    ///
    /// # Errors
    ///
    /// An `Io` error of kind `WouldBlock` when another process holds the
    /// lock; any other `Io` error when the file cannot be opened.
    pub fn acquire(path: &Path) -> Result<Self, TracerError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        if let Err(e) = file.try_lock_exclusive() {
            let kind = if e.kind() == fs2::lock_contended_error().kind() {
                io::ErrorKind::WouldBlock
            } else {
                e.kind()
            };
            return Err(TracerError::Io(io::Error::new(
                kind,
                format!("lock {} is held: {}", path.display(), e),
            )));
        }
        debug!(path = %path.display(), "process lock acquired");
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unlock; the file stays in place for the next holder.
    pub fn release(mut self) -> Result<(), TracerError> {
        self.unlock()
    }

    fn unlock(&mut self) -> Result<(), TracerError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        file.unlock()?;
        debug!(path = %self.path.display(), "process lock released");
        Ok(())
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = self.unlock() {
            warn!(path = %self.path.display(), error = %e, "failed to release process lock");
        }
    }
}
