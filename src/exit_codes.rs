//! Exit code constants for the turnstile CLI.
//!
//! - 0: Success (or the forwarded exit code of the child command)
//! - 1: Runtime failure (cancelled, unlock-wait timeout, lost lock)
//! - 2: Usage error (bad arguments or argument combinations)
//! - 3: Lock protocol fatal (e.g. the lockfile directory disappeared)
//! - 4: Internal invariant violation
//!
//! In command mode the child's exit code takes precedence over these once the
//! locks are held; the constants below only cover turnstile's own outcomes.

/// Successful execution.
pub const SUCCESS: i32 = 0;

/// Runtime failure: cancellation, unlock-wait timeout, or lost lock.
pub const RUNTIME_FAILURE: i32 = 1;

/// Usage error: bad arguments or invalid argument combinations.
pub const USAGE_ERROR: i32 = 2;

/// Lock protocol fatal: unrecoverable filesystem state (directory gone).
pub const LOCK_FATAL: i32 = 3;

/// Internal invariant violation; signals a bug, not an environment problem.
pub const LOGIC_VIOLATION: i32 = 4;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            SUCCESS,
            RUNTIME_FAILURE,
            USAGE_ERROR,
            LOCK_FATAL,
            LOGIC_VIOLATION,
        ];
        for (i, &a) in codes.iter().enumerate() {
            for (j, &b) in codes.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b, "Exit codes must be distinct");
                }
            }
        }
    }

    #[test]
    fn success_is_zero() {
        assert_eq!(SUCCESS, 0);
    }
}
