//! Advisory per-project write lock (`store.lock`).
//!
//! Held for one mutation at a time, so a second process pointed at the same
//! project waits for a bounded time and then gets `Busy` instead of
//! interleaving document writes. The file keeps the pid of the last holder
//! for diagnosis.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Result, StoreError};

const POLL: Duration = Duration::from_millis(10);

/// Exclusive lock on a project; released on drop.
#[derive(Debug)]
pub struct ProjectLock {
    file: File,
    path: PathBuf,
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

impl ProjectLock {
    /// Take the lock at `path`, retrying until `timeout` runs out.
    ///
    /// # Errors
    ///
    /// `Busy` when someone else still holds it at the deadline;
    /// `StorageUnavailable` when the lock file cannot be opened or locked.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let storage = |e| StoreError::storage("acquire project lock", e);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(storage)?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(err) if is_contended(&err) => {}
                Err(err) => return Err(storage(err)),
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(StoreError::Busy {
                    path: path.to_path_buf(),
                    waited,
                });
            }
            thread::sleep(POLL.min(timeout - waited));
        }

        let mut lock = Self {
            file,
            path: path.to_path_buf(),
        };
        if let Err(err) = lock.stamp() {
            tracing::debug!(path = %path.display(), error = %err, "could not record lock holder");
        }
        Ok(lock)
    }

    fn stamp(&mut self) -> io::Result<()> {
        self.file.set_len(0)?;
        self.file.rewind()?;
        writeln!(self.file, "{}", process::id())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
