//! Error types for the turnstile CLI.
//!
//! Uses thiserror for derive macros. Transient filesystem trouble never shows
//! up here; the acquisition loop absorbs it internally and retries. What does
//! surface is a usage problem, an unrecoverable runtime failure, external
//! cancellation, or an internal invariant violation.

use crate::exit_codes;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// User provided invalid arguments or argument combinations.
    #[error("{0}")]
    Usage(String),

    /// Unrecoverable runtime failure (spawn failure, marker write failure, ...).
    #[error("{0}")]
    Runtime(String),

    /// The directory holding a lockfile disappeared mid-run. There is no line
    /// to wait in any more, so this is fatal rather than retried.
    #[error("lock directory for '{path}' is gone: {source}")]
    LockDir {
        /// The lockfile whose parent directory vanished.
        path: PathBuf,
        /// The underlying filesystem error.
        source: std::io::Error,
    },

    /// Cancellation was requested (signal, watched parent died) before the
    /// operation completed. Not a bug; the caller asked us to stop.
    #[error("cancelled before completion")]
    Cancelled,

    /// An internal invariant was violated. These must not occur in tested
    /// code; they signal an implementation bug.
    #[error("internal invariant violated: {0}")]
    Logic(String),
}

impl TurnstileError {
    /// Returns the appropriate exit code for this error type.
    pub fn exit_code(&self) -> i32 {
        match self {
            TurnstileError::Usage(_) => exit_codes::USAGE_ERROR,
            TurnstileError::Runtime(_) => exit_codes::RUNTIME_FAILURE,
            TurnstileError::LockDir { .. } => exit_codes::LOCK_FATAL,
            TurnstileError::Cancelled => exit_codes::RUNTIME_FAILURE,
            TurnstileError::Logic(_) => exit_codes::LOGIC_VIOLATION,
        }
    }
}

/// Result type alias for turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
