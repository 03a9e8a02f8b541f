//! Single-instance advisory locking.
//!
//! `run_with_lock` takes a non-blocking `flock(2)` on a per-operation file
//! under the temporary directory. When another process (or another open of
//! the same file) holds it, the operation is skipped with a warning.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{Error, Result};
use crate::paths;

/// Ownership of an exclusive advisory lock. Released on drop.
pub struct LockHandle {
    _lock: Flock<File>,
    path: PathBuf,
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl LockHandle {
    /// Try once to lock `path`. `Ok(None)` means someone else holds it.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| {
                Error::internal_io(e.to_string(), Some(format!("open lock {}", path.display())))
            })?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => {
                tracing::debug!(path = %path.display(), "lock acquired");
                Ok(Some(Self {
                    _lock: lock,
                    path: path.to_path_buf(),
                }))
            }
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(Error::internal_io(
                errno.desc().to_string(),
                Some(format!("lock {}", path.display())),
            )),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        // The flock itself is released when `_lock` drops.
        tracing::debug!(path = %self.path.display(), "lock released");
    }
}

/// Run `op` unless another instance of the operation `name` is running.
///
/// Returns `Ok(None)` when the lock is busy; `op` is not called in that case.
pub fn run_with_lock<T>(name: &str, op: impl FnOnce() -> Result<T>) -> Result<Option<T>> {
    run_with_lock_at(&paths::lock_file(name), name, op)
}

pub fn run_with_lock_at<T>(
    path: &Path,
    name: &str,
    op: impl FnOnce() -> Result<T>,
) -> Result<Option<T>> {
    let Some(_handle) = LockHandle::try_acquire(path)? else {
        tracing::warn!(operation = name, "Unable to obtain lock, skipping \"{}\"", name);
        log_status!("lock", "Another \"{}\" is running, skipping", name);
        return Ok(None);
    };

    op().map(Some)
}
