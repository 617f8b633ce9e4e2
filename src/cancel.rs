//! Cooperative cancellation.
//!
//! A [`CancelFlag`] is a cloneable boolean polled by the acquisition loop,
//! the refresher, the command runner and the unlockfile wait. Anything may
//! trip it: a signal, the parent-process watchdog, or a lost lock. The flag
//! only ever goes from clear to set.

use crate::error::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Irreversible.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
static SIGNAL_TARGET: std::sync::OnceLock<CancelFlag> = std::sync::OnceLock::new();

/// Route SIGINT and SIGTERM into `flag`.
///
/// The handler does nothing but an atomic store, which keeps it
/// async-signal-safe. Only the first installation in a process takes effect.
#[cfg(unix)]
pub fn install_signal_handlers(flag: &CancelFlag) -> Result<()> {
    use crate::error::TurnstileError;

    let _ = SIGNAL_TARGET.set(flag.clone());

    extern "C" fn handle_signal(_signal: libc::c_int) {
        if let Some(flag) = SIGNAL_TARGET.get() {
            flag.0.store(true, Ordering::SeqCst);
        }
    }

    // No unsafe-free way to register a handler; keep the unsafe surface to
    // the two sigaction calls.
    let handler: extern "C" fn(libc::c_int) = handle_signal;
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_RESTART;

    for signal in [libc::SIGINT, libc::SIGTERM] {
        let rc = unsafe { libc::sigaction(signal, &action, std::ptr::null_mut()) };
        if rc != 0 {
            return Err(TurnstileError::Runtime(format!(
                "failed to install handler for signal {}: {}",
                signal,
                std::io::Error::last_os_error()
            )));
        }
    }

    Ok(())
}

/// Signals are not wired up on non-unix platforms; the flag still works for
/// every other cancellation source.
#[cfg(not(unix))]
pub fn install_signal_handlers(_flag: &CancelFlag) -> Result<()> {
    Ok(())
}
