//! Per-lockfile reservations: owning exactly one live spot in the line.
//!
//! A [`Reservation`] writes, refreshes and finally removes a single spot
//! record for one lockfile. Taking a spot is a race: "max seen index plus
//! one" is not atomic across processes, so the record is created with
//! exclusive-create semantics and read back afterwards. Any surprise, like
//! somebody claiming the index first or foreign bytes on disk, sends the
//! loop around again with a higher index.

use crate::cancel::CancelFlag;
use crate::config::Tuning;
use crate::error::{Result, TurnstileError};
use crate::spot::{self, SpotRecord, SpotScanner};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Pause between retries when the filesystem misbehaves transiently.
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// The in-process owner of one spot record on one lockfile.
#[derive(Debug)]
pub struct Reservation {
    scanner: SpotScanner,
    token: Uuid,
    index: u64,
    current_spot: Option<PathBuf>,
    needs_reacquire: bool,
}

impl Reservation {
    /// Take a spot in line for `lockfile`, blocking until one is secured or
    /// `cancel` trips. Transient filesystem errors are retried indefinitely.
    pub fn new(lockfile: &Path, tuning: &Tuning, cancel: &CancelFlag) -> Result<Self> {
        let scanner = SpotScanner::new(lockfile)?;

        let mut reservation = Self {
            scanner,
            token: Uuid::new_v4(),
            index: 0,
            current_spot: None,
            needs_reacquire: false,
        };

        reservation.reacquire(tuning, cancel)?;
        Ok(reservation)
    }

    /// The canonicalized lockfile this reservation queues on.
    pub fn lockfile(&self) -> &Path {
        self.scanner.lockfile()
    }

    /// The token binding this reservation to its on-disk record.
    pub fn token(&self) -> Uuid {
        self.token
    }

    /// The currently held spot index.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Whether this reservation has detected the loss of its record and
    /// needs to re-queue.
    pub fn needs_reacquire(&self) -> bool {
        self.needs_reacquire
    }

    /// Flag this reservation for re-queueing on the next coordinator tick.
    pub fn mark_lost(&mut self) {
        self.needs_reacquire = true;
    }

    /// Give up the current spot (if any) and take a fresh one at the back of
    /// the line.
    pub fn reacquire(&mut self, tuning: &Tuning, cancel: &CancelFlag) -> Result<()> {
        if let Some(old) = self.current_spot.take() {
            let _ = fs::remove_file(&old);
        }
        self.needs_reacquire = false;

        loop {
            if cancel.is_cancelled() {
                return Err(TurnstileError::Cancelled);
            }

            let spots = match self.scanner.scan(tuning.spot_lifetime_secs) {
                Ok(spots) => spots,
                Err(fatal @ TurnstileError::LockDir { .. }) => return Err(fatal),
                Err(e) => {
                    tracing::debug!(
                        lockfile = %self.lockfile().display(),
                        error = %e,
                        "spot scan failed, retrying"
                    );
                    std::thread::sleep(RETRY_DELAY);
                    continue;
                }
            };

            let index = spots
                .values()
                .map(|view| view.index)
                .max()
                .map_or(0, |max| max + 1);

            let record = SpotRecord::new(self.token);
            let path = self.scanner.spot_path(index);

            match spot::write_record_exclusive(&path, &record) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    // Someone claimed this index between our scan and our
                    // create; pick again.
                    continue;
                }
                Err(e) => {
                    tracing::debug!(
                        spot = %path.display(),
                        error = %e,
                        "spot write failed, retrying"
                    );
                    std::thread::sleep(RETRY_DELAY);
                    continue;
                }
            }

            // Read back and verify the bytes on disk are ours.
            match SpotRecord::read(&path) {
                Ok(read_back)
                    if read_back.token == record.token
                        && read_back.timestamp == record.timestamp =>
                {
                    self.index = index;
                    self.current_spot = Some(path);
                    return Ok(());
                }
                _ => {
                    // Overwritten or truncated under us; the file is not ours
                    // to clean up. Queue again.
                    continue;
                }
            }
        }
    }

    /// Re-stamp the current record with the present time, extending its
    /// validity.
    ///
    /// Failure means the record is gone or unwritable: the position is lost
    /// and the caller should trigger [`Reservation::reacquire`].
    pub fn refresh(&mut self) -> Result<()> {
        let Some(path) = self.current_spot.as_ref() else {
            return Err(TurnstileError::Logic(
                "refresh called on a reservation without a spot".to_string(),
            ));
        };

        let record = SpotRecord::new(self.token);

        spot::rewrite_record(path, &record).map_err(|e| {
            TurnstileError::Runtime(format!(
                "failed to refresh spot '{}': {}",
                path.display(),
                e
            ))
        })?;

        Ok(())
    }

    /// Whether the lowest-indexed live spot on this lockfile is ours.
    ///
    /// An empty line means our own record was reaped too, which is a loss of
    /// position, not a win; the reservation flags itself for re-queueing.
    /// Transient scan trouble reads as "not first" and is retried next tick.
    pub fn is_first(&mut self, lifetime_secs: i64) -> Result<bool> {
        let spots = match self.scanner.scan(lifetime_secs) {
            Ok(spots) => spots,
            Err(fatal @ TurnstileError::LockDir { .. }) => return Err(fatal),
            Err(e) => {
                tracing::debug!(
                    lockfile = %self.lockfile().display(),
                    error = %e,
                    "spot scan failed during first-in-line check"
                );
                return Ok(false);
            }
        };

        let ours_present = self
            .current_spot
            .as_ref()
            .and_then(|path| spots.get(path))
            .is_some_and(|view| view.token == self.token);

        if !ours_present {
            self.mark_lost();
            return Ok(false);
        }

        let first = spots
            .values()
            .min_by_key(|view| view.index)
            .map(|view| view.token);

        Ok(first == Some(self.token))
    }

    /// Remove the on-disk record. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(path) = self.current_spot.take()
            && let Err(e) = fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(
                spot = %path.display(),
                error = %e,
                "failed to remove spot record on release"
            );
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.release();
    }
}
