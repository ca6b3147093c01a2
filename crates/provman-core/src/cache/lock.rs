//! Per-key advisory lock for shared cache installs.
//!
//! Each cache key (`<version>/<os>_<arch>`) has its own lock file next to the
//! package directory, `<version>/<os>_<arch>.lock`. Holding it serializes
//! installs of that key across processes; installs of other keys are not
//! affected. Lock files are left in place after release.
//!
//! The lock is taken with `flock(LOCK_EX | LOCK_NB)` in a polling loop so the
//! wait is bounded, and released when the guard is dropped, including when
//! the owning future is cancelled.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::trace;

use crate::error::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Held exclusive lock on one cache key.
#[derive(Debug)]
pub struct CacheLock {
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Try to acquire the lock without waiting.
    ///
    /// Returns:
    /// - `Ok(Some(lock))` if the lock was acquired
    /// - `Ok(None)` if another holder has it
    /// - `Err` on I/O errors
    pub fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                trace!(path = %path.display(), "acquired cache lock");
                Ok(Some(Self {
                    file,
                    path: path.to_path_buf(),
                }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Acquire the lock, polling until `wait` has elapsed.
    ///
    /// # Errors
    ///
    /// Returns an [`Error::Io`] with kind `TimedOut` if the lock is still held
    /// elsewhere after `wait`.
    pub async fn acquire(path: &Path, wait: Duration) -> Result<Self> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lock) = Self::try_acquire(path)? {
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "timed out after {}s waiting for cache lock {}",
                        wait.as_secs(),
                        path.display()
                    ),
                )));
            }
            trace!(path = %path.display(), "cache lock busy, waiting");
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        trace!(path = %self.path.display(), "released cache lock");
    }
}
