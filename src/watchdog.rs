//! Parent-process watchdog.
//!
//! `--watch-parent-process <NAME>` ties the lock lifetime to an ancestor
//! process: when that process dies, the watchdog trips the shared
//! cancellation flag and the locks are released. The target is found by
//! walking the ancestor chain upward from our parent and comparing process
//! names; by default the furthest match wins so wrappers like `make` spawning
//! `sh` spawning us resolve to the outermost tool.
//!
//! Known limitation: process names on unix come from `/proc/<pid>/comm`,
//! which the kernel truncates to 15 bytes. Requested names are truncated the
//! same way before comparison, so two tools whose names share their first 15
//! bytes are indistinguishable.

use crate::cancel::CancelFlag;
use crate::error::{Result, TurnstileError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Kernel limit on `comm` process names.
const COMM_NAME_MAX: usize = 15;

/// Truncate `name` the way the kernel truncates `comm`.
fn comm_truncated(name: &str) -> &str {
    let mut end = name.len().min(COMM_NAME_MAX);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

/// The process name of `pid`, if it is alive and inspectable.
#[cfg(unix)]
fn process_name(pid: i32) -> Option<String> {
    let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid)).ok()?;
    Some(comm.trim_end().to_string())
}

/// The parent pid of `pid`, parsed from `/proc/<pid>/stat`.
///
/// The comm field in stat is parenthesized and may itself contain spaces and
/// parentheses, so fields are taken from after the last closing paren.
#[cfg(unix)]
fn parent_of(pid: i32) -> Option<i32> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let after_comm = &stat[stat.rfind(')')? + 1..];
    after_comm.split_whitespace().nth(1)?.parse().ok()
}

/// Whether `pid` still exists.
#[cfg(unix)]
pub fn is_process_running(pid: i32) -> bool {
    unsafe { libc::getpgid(pid) >= 0 }
}

/// Walk the ancestor chain and find the pid to watch.
///
/// `names` are matched against each ancestor's process name (both sides
/// truncated to the kernel comm limit). `nearest` selects the first match
/// walking upward; otherwise the last one. No match is fatal, since watching
/// nothing would mean never releasing.
#[cfg(unix)]
pub fn resolve_watched_parent(names: &[String], nearest: bool) -> Result<i32> {
    let wanted: Vec<&str> = names.iter().map(|n| comm_truncated(n)).collect();

    let mut matched = None;
    let mut pid = unsafe { libc::getppid() };

    while pid > 1 {
        if let Some(name) = process_name(pid)
            && wanted.contains(&comm_truncated(&name))
        {
            matched = Some(pid);
            if nearest {
                break;
            }
        }

        match parent_of(pid) {
            Some(parent) if parent != pid => pid = parent,
            _ => break,
        }
    }

    matched.ok_or_else(|| {
        TurnstileError::Runtime(format!(
            "no parent process with any of the following names was found: {}",
            names.join(", ")
        ))
    })
}

#[cfg(not(unix))]
pub fn resolve_watched_parent(_names: &[String], _nearest: bool) -> Result<i32> {
    Err(TurnstileError::Runtime(
        "--watch-parent-process is not supported on this platform".to_string(),
    ))
}

#[cfg(not(unix))]
pub fn is_process_running(_pid: i32) -> bool {
    true
}

/// Poll `pid` for liveness, tripping `cancel` when it disappears.
pub fn spawn_watch(pid: i32, cancel: CancelFlag, poll: Duration) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("turnstile-watchdog".to_string())
        .spawn(move || {
            loop {
                if cancel.is_cancelled() {
                    return;
                }

                if !is_process_running(pid) {
                    tracing::debug!(pid, "watched parent process is gone, cancelling");
                    cancel.cancel();
                    return;
                }

                thread::sleep(poll);
            }
        })
        .map_err(|e| TurnstileError::Runtime(format!("failed to spawn watchdog thread: {}", e)))
}
