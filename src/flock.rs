//! The exclusive hold: a short whole-file advisory lock on the lockfile.
//!
//! Being first in the spot line is necessary but not sufficient: a stale
//! first-in-line record of a crashed holder may not have expired yet, and on
//! some filesystems the spot-file protocol is weaker than kernel file locks.
//! Ownership is therefore confirmed by taking an advisory exclusive lock on
//! the lockfile itself, with a short bounded wait. The kernel drops the lock
//! automatically when the holder dies, which is exactly the crash behavior
//! the spot line cannot provide on its own.

use crate::error::{Result, TurnstileError};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Backoff between try-lock attempts inside the bounded wait.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// An open lockfile and the advisory exclusive lock taken on it.
///
/// Dropping the hold releases the lock; the lockfile itself is left in place
/// for the next caller.
#[derive(Debug)]
pub struct ExclusiveHold {
    path: PathBuf,
    file: File,
    held: bool,
}

impl ExclusiveHold {
    /// Open `path` for locking, creating it empty if absent.
    ///
    /// A freshly created lockfile is made world-writable best-effort; if the
    /// chmod fails a peer likely created the file first and owns it, and the
    /// open handle is all we need.
    pub fn open(path: &Path) -> Result<Self> {
        let existed = path.exists();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| {
                if source.kind() == io::ErrorKind::NotFound {
                    TurnstileError::LockDir {
                        path: path.to_path_buf(),
                        source,
                    }
                } else {
                    TurnstileError::Runtime(format!(
                        "failed to open lockfile '{}': {}",
                        path.display(),
                        source
                    ))
                }
            })?;

        if !existed {
            crate::spot::set_permissive_mode(path);
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            held: false,
        })
    }

    /// Whether the advisory lock is currently held.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Try to take the advisory exclusive lock, polling for up to `wait`.
    pub fn try_hold(&mut self, wait: Duration) -> bool {
        if self.held {
            return true;
        }

        let deadline = Instant::now() + wait;

        loop {
            match self.file.try_lock_exclusive() {
                Ok(()) => {
                    self.held = true;
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    tracing::debug!(
                        lockfile = %self.path.display(),
                        error = %e,
                        "advisory lock attempt failed"
                    );
                }
            }

            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Drop the advisory lock. Safe to call repeatedly.
    pub fn release(&mut self) {
        if self.held {
            if let Err(e) = FileExt::unlock(&self.file) {
                tracing::warn!(
                    lockfile = %self.path.display(),
                    error = %e,
                    "failed to release advisory lock"
                );
            }
            self.held = false;
        }
    }
}

impl Drop for ExclusiveHold {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::lock_dir;

    #[test]
    fn open_creates_a_missing_lockfile() {
        let (_tmp, lockfile) = lock_dir("test.lock");
        assert!(!lockfile.exists());

        let hold = ExclusiveHold::open(&lockfile).unwrap();
        assert!(lockfile.exists());
        assert!(!hold.is_held());
    }

    #[test]
    fn open_fails_when_directory_is_gone() {
        let result = ExclusiveHold::open(Path::new("/definitely/not/here/test.lock"));
        assert!(matches!(result, Err(TurnstileError::LockDir { .. })));
    }

    #[test]
    fn hold_succeeds_when_uncontested() {
        let (_tmp, lockfile) = lock_dir("test.lock");
        let mut hold = ExclusiveHold::open(&lockfile).unwrap();

        assert!(hold.try_hold(Duration::from_millis(50)));
        assert!(hold.is_held());

        // Re-entrant on the same handle.
        assert!(hold.try_hold(Duration::from_millis(50)));
    }

    #[test]
    fn contested_hold_times_out() {
        let (_tmp, lockfile) = lock_dir("test.lock");

        let mut holder = ExclusiveHold::open(&lockfile).unwrap();
        assert!(holder.try_hold(Duration::from_millis(50)));

        // A second open file description contends, even in-process.
        let mut waiter = ExclusiveHold::open(&lockfile).unwrap();
        assert!(!waiter.try_hold(Duration::from_millis(50)));

        holder.release();
        assert!(waiter.try_hold(Duration::from_millis(500)));
    }

    #[test]
    fn drop_releases_the_lock() {
        let (_tmp, lockfile) = lock_dir("test.lock");

        {
            let mut holder = ExclusiveHold::open(&lockfile).unwrap();
            assert!(holder.try_hold(Duration::from_millis(50)));
        }

        let mut next = ExclusiveHold::open(&lockfile).unwrap();
        assert!(next.try_hold(Duration::from_millis(500)));
    }

    #[test]
    fn release_is_idempotent() {
        let (_tmp, lockfile) = lock_dir("test.lock");
        let mut hold = ExclusiveHold::open(&lockfile).unwrap();

        assert!(hold.try_hold(Duration::from_millis(50)));
        hold.release();
        hold.release();
        assert!(!hold.is_held());
    }
}
