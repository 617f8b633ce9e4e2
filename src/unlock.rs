//! Unlockfile wait mode.
//!
//! With `--unlockfile` the caller holds the locks not for a child command
//! but until a set of marker files shows up, a barrier that another process
//! releases by touching them. The markers are consumed (deleted) on success
//! so the barrier is single-use.

use crate::cancel::CancelFlag;
use crate::config::Tuning;
use crate::error::Result;
use crate::exit_codes;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

/// Wait until every file in `unlockfiles` exists.
///
/// Returns the process exit code: success once all files appeared (they are
/// deleted best-effort), failure on timeout or cancellation.
pub fn wait_for_unlockfiles(
    unlockfiles: &[PathBuf],
    timeout: Option<Duration>,
    cancel: &CancelFlag,
    tuning: &Tuning,
) -> Result<i32> {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        if cancel.is_cancelled() {
            tracing::debug!("cancelled while waiting for unlock files");
            return Ok(exit_codes::RUNTIME_FAILURE);
        }

        if unlockfiles.iter().all(|file| file.exists()) {
            for file in unlockfiles {
                if let Err(e) = fs::remove_file(file) {
                    tracing::warn!(
                        file = %file.display(),
                        error = %e,
                        "failed to consume unlock file"
                    );
                }
            }
            return Ok(exit_codes::SUCCESS);
        }

        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            tracing::debug!("timed out waiting for unlock files");
            return Ok(exit_codes::RUNTIME_FAILURE);
        }

        thread::sleep(tuning.unlock_poll());
    }
}
