//! Top-level program flow.
//!
//! Wires the collaborators together: cancellation sources first (signals,
//! watchdog), then the lock-set acquisition, then whichever foreground the
//! invocation asked for (child command or unlockfile wait), then release.
//! The coordinator never sees any of this; it only consumes the shared
//! cancellation flag.

use crate::cancel::{self, CancelFlag};
use crate::cli::Cli;
use crate::config::Tuning;
use crate::coordinator;
use crate::detach;
use crate::error::{Result, TurnstileError};
use crate::runner;
use crate::unlock;
use crate::watchdog;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Create or truncate a success-marker file.
fn touch_marker(path: &Path) -> Result<()> {
    fs::write(path, b"").map_err(|e| {
        TurnstileError::Runtime(format!(
            "failed to write success marker '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Run one turnstile invocation to completion and return the exit code.
pub fn run(cli: Cli) -> Result<i32> {
    cli.validate()?;

    if cli.detach {
        return detach::relaunch_detached();
    }

    let tuning = Tuning::default();

    // Stale markers from a previous run must not signal success early.
    for marker in &cli.lock_success_markers {
        if marker.exists() {
            fs::remove_file(marker).map_err(|e| {
                TurnstileError::Runtime(format!(
                    "failed to remove stale success marker '{}': {}",
                    marker.display(),
                    e
                ))
            })?;
        }
    }

    let cancel = CancelFlag::new();
    cancel::install_signal_handlers(&cancel)?;

    let _watchdog = if cli.watch_parent_process.is_empty() {
        None
    } else {
        let pid = watchdog::resolve_watched_parent(
            &cli.watch_parent_process,
            cli.search_nearest_parent_process,
        )?;
        tracing::debug!(pid, "watching parent process");
        Some(watchdog::spawn_watch(
            pid,
            cancel.clone(),
            tuning.watchdog_poll(),
        )?)
    };

    let mut held = coordinator::acquire(&cli.lockfiles, tuning.clone(), cancel.clone())?;

    for marker in &cli.lock_success_markers {
        touch_marker(marker)?;
    }

    let code = if cli.run_command_mode() {
        runner::run_command(&cli.command, &cancel)?
    } else {
        let timeout = (!cli.no_timeout).then(|| Duration::from_secs(cli.timeout));
        unlock::wait_for_unlockfiles(&cli.unlockfiles, timeout, &cancel, &tuning)?
    };

    held.release();
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit_codes;
    use crate::test_support::{lock_dir, spot_indices};
    use clap::Parser;
    use serial_test::serial;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("turnstile").chain(args.iter().copied())).unwrap()
    }

    #[test]
    #[serial]
    fn runs_a_command_under_the_lock() {
        let (_tmp, lockfile) = lock_dir("test.lock");

        let code = run(cli(&[
            "--lockfile",
            lockfile.to_str().unwrap(),
            "--",
            "exit",
            "5",
        ]))
        .unwrap();

        assert_eq!(code, 5);
        assert!(lockfile.exists());
        assert!(spot_indices(&lockfile).is_empty());
    }

    #[test]
    #[serial]
    fn writes_success_markers_once_locked() {
        let (tmp, lockfile) = lock_dir("test.lock");
        let marker = tmp.path().join("locked.marker");

        // Pre-existing marker must be cleared, then re-created on success.
        fs::write(&marker, b"stale").unwrap();

        let code = run(cli(&[
            "--lockfile",
            lockfile.to_str().unwrap(),
            "--lock-success-marker",
            marker.to_str().unwrap(),
            "--",
            "true",
        ]))
        .unwrap();

        assert_eq!(code, exit_codes::SUCCESS);
        assert!(marker.exists());
        assert_eq!(fs::read(&marker).unwrap(), b"");
    }

    #[test]
    #[serial]
    fn unlockfile_mode_times_out() {
        let (tmp, lockfile) = lock_dir("test.lock");
        let signal = tmp.path().join("never.signal");

        let code = run(cli(&[
            "--lockfile",
            lockfile.to_str().unwrap(),
            "--unlockfile",
            signal.to_str().unwrap(),
            "--timeout",
            "1",
        ]))
        .unwrap();

        assert_eq!(code, exit_codes::RUNTIME_FAILURE);
        assert!(spot_indices(&lockfile).is_empty());
    }

    #[test]
    #[serial]
    fn unlockfile_mode_consumes_the_signal() {
        let (tmp, lockfile) = lock_dir("test.lock");
        let signal = tmp.path().join("go.signal");

        let writer = {
            let signal = signal.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(300));
                fs::write(&signal, b"").unwrap();
            })
        };

        let code = run(cli(&[
            "--lockfile",
            lockfile.to_str().unwrap(),
            "--unlockfile",
            signal.to_str().unwrap(),
        ]))
        .unwrap();
        writer.join().unwrap();

        assert_eq!(code, exit_codes::SUCCESS);
        assert!(!signal.exists());
    }

    #[test]
    fn missing_command_is_a_usage_error() {
        let result = run(cli(&["--lockfile", "a.lock"]));
        assert!(matches!(result, Err(TurnstileError::Usage(_))));
    }

    #[cfg(unix)]
    #[test]
    fn unknown_watched_parent_is_fatal() {
        let (_tmp, lockfile) = lock_dir("test.lock");

        let result = run(cli(&[
            "--lockfile",
            lockfile.to_str().unwrap(),
            "--watch-parent-process",
            "turnstile-test-no-such-process",
            "--",
            "true",
        ]));

        assert!(matches!(result, Err(TurnstileError::Runtime(_))));
        // Failing before acquisition leaves no spots behind.
        assert!(spot_indices(&lockfile).is_empty());
    }
}
