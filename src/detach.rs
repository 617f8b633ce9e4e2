//! Detached launch.
//!
//! `--detach` turns "block until locked, then run" into "return once a
//! background copy is locked". The foreground process re-launches itself
//! with the same arguments, swapping `--detach` for a private
//! `--lock-success-marker`, and waits for either the marker (the child holds
//! every lock: report success and leave it running) or the child's early
//! exit (forward its code).

use crate::error::{Result, TurnstileError};
use crate::exit_codes;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

/// Poll interval while waiting for the marker or the child.
const HANDSHAKE_POLL: Duration = Duration::from_millis(100);

/// A marker path no other invocation will collide with.
fn fresh_marker_path() -> PathBuf {
    std::env::temp_dir().join(format!("turnstile-{}.marker", Uuid::new_v4().simple()))
}

/// The child's argument vector: ours with `--detach` swapped for the marker
/// handshake.
fn detached_args<I>(args: I, marker: &Path) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut out = Vec::new();
    for arg in args {
        if arg == "--detach" {
            out.push("--lock-success-marker".to_string());
            out.push(marker.display().to_string());
        } else {
            out.push(arg);
        }
    }
    out
}

/// Re-launch this invocation in the background and wait for the handshake.
pub fn relaunch_detached() -> Result<i32> {
    let exe = std::env::current_exe()
        .map_err(|e| TurnstileError::Runtime(format!("failed to locate own executable: {}", e)))?;

    let marker = fresh_marker_path();
    let _ = fs::remove_file(&marker);

    let args = detached_args(std::env::args().skip(1), &marker);

    let mut child = Command::new(exe)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| TurnstileError::Runtime(format!("failed to spawn detached copy: {}", e)))?;

    loop {
        let marker_appeared = marker.exists();

        let child_status = child.try_wait().map_err(|e| {
            TurnstileError::Runtime(format!("failed to check detached copy: {}", e))
        })?;

        match (marker_appeared, child_status) {
            (true, None) => {
                // Locked and still running: hand the locks over to the
                // background copy.
                let _ = fs::remove_file(&marker);
                return Ok(exit_codes::SUCCESS);
            }
            (_, Some(status)) => {
                let _ = fs::remove_file(&marker);
                return Ok(status.code().unwrap_or(exit_codes::RUNTIME_FAILURE));
            }
            (false, None) => thread::sleep(HANDSHAKE_POLL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_flag_is_replaced_by_marker_handshake() {
        let marker = PathBuf::from("/tmp/handoff.marker");
        let args = vec![
            "--lockfile".to_string(),
            "a.lock".to_string(),
            "--detach".to_string(),
            "--".to_string(),
            "true".to_string(),
        ];

        let rewritten = detached_args(args, &marker);
        assert_eq!(
            rewritten,
            vec![
                "--lockfile",
                "a.lock",
                "--lock-success-marker",
                "/tmp/handoff.marker",
                "--",
                "true",
            ]
        );
    }

    #[test]
    fn other_arguments_pass_through_untouched() {
        let marker = PathBuf::from("/tmp/handoff.marker");
        let args = vec!["--detach".to_string()];

        let rewritten = detached_args(args, &marker);
        assert!(!rewritten.contains(&"--detach".to_string()));
        assert_eq!(rewritten.len(), 2);
    }

    #[test]
    fn marker_paths_are_unique() {
        assert_ne!(fresh_marker_path(), fresh_marker_path());
    }
}
