//! CLI argument parsing for turnstile.
//!
//! Uses clap derive macros for declarative argument definitions. The binary
//! has a single mode of invocation:
//!
//! ```text
//! turnstile --lockfile a.lock [--lockfile b.lock ...] -- <command...>
//! turnstile --lockfile a.lock --unlockfile go.signal [--timeout 60]
//! ```

use crate::error::{Result, TurnstileError};
use clap::Parser;
use std::path::PathBuf;

/// Turnstile: file-based locking and process barrier.
///
/// Blocks until every named lockfile is exclusively held, then either runs
/// the trailing command (standard streams and exit code pass through) or
/// waits for the named unlock files to appear. Everything is released on
/// exit, signal, or watched-parent death.
#[derive(Parser, Debug)]
#[command(name = "turnstile")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Lockfile(s) to acquire; repeat for multiple.
    #[arg(short = 'l', long = "lockfile", value_name = "PATH", required = true)]
    pub lockfiles: Vec<PathBuf>,

    /// Instead of running a command, wait for all of these files to exist
    /// (they are deleted on success).
    #[arg(long = "unlockfile", value_name = "PATH")]
    pub unlockfiles: Vec<PathBuf>,

    /// Timeout for the --unlockfile wait, in seconds.
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub timeout: u64,

    /// Never time out the --unlockfile wait.
    #[arg(long)]
    pub no_timeout: bool,

    /// Launch a detached copy with the same parameters and return once it
    /// has acquired every lock.
    #[arg(long)]
    pub detach: bool,

    /// Marker file(s) touched once all locks are acquired; repeat for
    /// multiple. Pre-existing markers are removed at startup.
    #[arg(long = "lock-success-marker", value_name = "PATH")]
    pub lock_success_markers: Vec<PathBuf>,

    /// Release and exit when the named ancestor process dies; repeat to
    /// accept several names.
    #[arg(long = "watch-parent-process", value_name = "NAME")]
    pub watch_parent_process: Vec<String>,

    /// Match the nearest ancestor instead of the furthest one.
    #[arg(long)]
    pub search_nearest_parent_process: bool,

    /// Verbose diagnostic output.
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to run once every lockfile is held (after `--`).
    #[arg(last = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Whether this invocation runs a command (vs. waiting for unlock files).
    pub fn run_command_mode(&self) -> bool {
        self.unlockfiles.is_empty()
    }

    /// Cross-argument validation that clap cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.run_command_mode() && self.command.is_empty() {
            return Err(TurnstileError::Usage(
                "supply a '-- <command>' to run or --unlockfile <path> arguments".to_string(),
            ));
        }

        Ok(())
    }
}
