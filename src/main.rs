//! Turnstile: file-based locking and process barrier.
//!
//! This is the main entry point for the `turnstile` CLI. It parses
//! arguments, sets up diagnostics, hands control to the application flow,
//! and maps errors to exit codes.

mod app;
mod cancel;
mod cli;
mod config;
mod coordinator;
mod detach;
mod error;
mod exit_codes;
mod flock;
mod reservation;
mod runner;
mod spot;
mod unlock;
mod watchdog;

#[cfg(test)]
mod test_support;

use cli::Cli;
use std::process::ExitCode;

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse_args();
    init_tracing(cli.verbose);

    match app::run(cli) {
        Ok(code) => ExitCode::from(code as u8),
        Err(err) => {
            // Print user-actionable error message to stderr
            eprintln!("Error: {}", err);

            ExitCode::from(err.exit_code() as u8)
        }
    }
}
