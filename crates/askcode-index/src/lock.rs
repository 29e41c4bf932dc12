//! Cross-process writer lock for a project's store (`.chat/store.lock`).
//!
//! The lock is an OS advisory lock on the file, not the file's existence, so
//! a crashed holder releases it with its last descriptor. The file stays on
//! disk and records the holder's PID for diagnostics only.

use std::fs::{File, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{IndexError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Held for the duration of an indexing pass. Dropping it releases the lock.
#[derive(Debug)]
pub struct StoreLock {
    path: PathBuf,
    file: File,
}

impl StoreLock {
    /// Wait up to `timeout` for an exclusive lock at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if another holder keeps the lock past
    /// `timeout`, or `Io` if the lock file cannot be opened.
    pub async fn acquire(path: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(&path)? {
                tracing::debug!(path = %path.display(), "store lock acquired");
                return Ok(lock);
            }
            if Instant::now() >= deadline {
                return Err(IndexError::StoreUnavailable(format!(
                    "{} is held by {}",
                    path.display(),
                    describe_holder(&path)
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Single non-blocking attempt. `Ok(None)` means someone else holds it,
    /// including another handle in this process.
    ///
    /// # Errors
    ///
    /// Returns `Io` for filesystem failures other than contention.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let mut opts = std::fs::OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(false);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(path)?;
        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        Ok(Some(Self {
            path: path.to_path_buf(),
            file,
        }))
    }

    /// Wait until no writer holds the lock at `path`.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the lock is still held after `timeout`.
    pub async fn wait_released(path: &Path, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while is_held(path)? {
            if Instant::now() >= deadline {
                return Err(IndexError::StoreUnavailable(format!(
                    "timed out waiting for indexing to finish ({} is held by {})",
                    path.display(),
                    describe_holder(path)
                )));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}

/// Probe with a shared lock so concurrent readers do not block each other.
fn is_held(path: &Path) -> Result<bool> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    match file.try_lock_shared() {
        Ok(()) => Ok(false),
        Err(TryLockError::WouldBlock) => Ok(true),
        Err(TryLockError::Error(e)) => Err(e.into()),
    }
}

fn describe_holder(path: &Path) -> String {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .map_or_else(|| "another askcode process".to_owned(), |pid| format!("pid {pid}"))
}
