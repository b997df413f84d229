//! Entry point for the `schedd` scheduler daemon.
//!
//! Runs [`schedd::run_scheduler`] with the built-in logging cycle runner and
//! maps the outcome onto the process exit status.

use std::io::{self, Write};
use std::process::ExitCode;

use schedd::{LoggingCycleRunner, run_scheduler};

fn main() -> ExitCode {
    match run_scheduler(LoggingCycleRunner::new()) {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => {
            drop(writeln!(io::stderr().lock(), "schedd: {error}"));
            ExitCode::FAILURE
        }
    }
}
