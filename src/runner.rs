//! Running the guarded command.
//!
//! The trailing `-- <command...>` is handed to the platform shell with all
//! three standard streams inherited, so the child behaves as if the caller
//! had run it directly. The wait loop polls the cancellation flag; on
//! cancellation the child is terminated and its (nonzero) exit code is
//! forwarded like any other.

use crate::cancel::CancelFlag;
use crate::error::{Result, TurnstileError};
use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

/// Poll interval while waiting on the child.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Fallback exit code when the child was killed by a signal and has none.
const KILLED_EXIT_CODE: i32 = 1;

/// Build the shell invocation for `command`.
fn shell_command(command: &[String]) -> Command {
    let joined = command.join(" ");

    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/c");
        cmd
    };

    #[cfg(not(windows))]
    let mut cmd = {
        let mut cmd = Command::new("bash");
        cmd.arg("-c");
        cmd
    };

    cmd.arg(joined);
    cmd
}

/// Ask the child to terminate, then reap it.
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        // SIGTERM first so the child gets a chance to clean up.
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }

        for _ in 0..20 {
            if let Ok(Some(_)) = child.try_wait() {
                return;
            }
            thread::sleep(WAIT_POLL);
        }
    }

    let _ = child.kill();
    let _ = child.wait();
}

/// Run `command` to completion and return its exit code.
///
/// Must only be called while the locks are held. Cancellation terminates the
/// child; the exit code still comes from the child so callers observe the
/// same outcome as an externally delivered signal.
pub fn run_command(command: &[String], cancel: &CancelFlag) -> Result<i32> {
    if command.is_empty() {
        return Err(TurnstileError::Usage(
            "no command to run was provided".to_string(),
        ));
    }

    let mut child = shell_command(command).spawn().map_err(|e| {
        TurnstileError::Runtime(format!("failed to run '{}': {}", command.join(" "), e))
    })?;

    loop {
        if cancel.is_cancelled() {
            tracing::debug!("cancellation requested, terminating child");
            terminate(&mut child);
        }

        match child.try_wait() {
            Ok(Some(status)) => return Ok(status.code().unwrap_or(KILLED_EXIT_CODE)),
            Ok(None) => thread::sleep(WAIT_POLL),
            Err(e) => {
                return Err(TurnstileError::Runtime(format!(
                    "failed to check child status: {}",
                    e
                )));
            }
        }
    }
}
