//! Process supervision: singleton guard, crash restart, and launch.

pub(crate) mod crash;
mod errors;
mod guard;
pub(crate) mod launch;

pub use crash::{CRASH_WINDOW, CrashGuardError, should_restart};
pub use errors::LaunchError;
pub use launch::run_scheduler;

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");
