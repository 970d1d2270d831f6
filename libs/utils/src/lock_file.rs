//! The catalog lock file.
//!
//! An advisory exclusive lock on a file under the catalog root guards the
//! whole catalog: exactly one invocation may hold it. The three outcomes of
//! an acquisition attempt (acquired, held by somebody else, I/O failure)
//! map to different process exit codes, so they are kept distinct here.

use std::fs::{File, OpenOptions};
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;

/// Result of a lock acquisition attempt.
pub enum LockAcquisition {
    /// We hold the lock; dropping the guard releases it.
    Acquired(LockFileGuard),
    /// Another process holds the lock.
    Contended,
}

/// Holds the open lock file for as long as the lock is held. The advisory
/// lock is tied to the file description, so dropping the guard releases it
/// even if the process is killed between.
pub struct LockFileGuard {
    file: File,
    path: Utf8PathBuf,
}

impl LockFileGuard {
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for LockFileGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            tracing::warn!("failed to unlock {}: {}", self.path, e);
        }
    }
}

/// Try to take the exclusive lock at `path`, creating the file if needed.
///
/// Returns `Contended` if another process holds it; any other failure is a
/// real I/O error and is propagated.
pub fn try_lock(path: &Utf8Path) -> io::Result<LockAcquisition> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(LockAcquisition::Acquired(LockFileGuard {
            file,
            path: path.to_owned(),
        })),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(LockAcquisition::Contended),
        Err(e) => Err(e),
    }
}
