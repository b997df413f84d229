//! Self-restart after a fatal memory fault.
//!
//! On `SIGSEGV` or `SIGBUS` the scheduler forks: the child aborts to leave a
//! core dump and the parent waits for it, then re-executes itself with the
//! original arguments. A fault within five minutes of start aborts instead,
//! so a scheduler that crashes straight away does not loop.
//!
//! The handler runs in signal context. It only touches atomics and memory
//! prepared before installation, and only calls async-signal-safe functions.

use std::env;
use std::ffi::{CString, NulError};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use once_cell::sync::OnceCell;
use thiserror::Error;
use tracing::info;

use super::PROCESS_TARGET;

/// Faults this soon after start abort rather than restart.
pub const CRASH_WINDOW: Duration = Duration::from_secs(300);
const RESTART_DELAY_SECS: libc::c_uint = 10;
const RESTART_FAILED_STATUS: libc::c_int = 3;

static PROCESS_START: AtomicU64 = AtomicU64::new(0);
static LAST_CYCLE_START: AtomicU64 = AtomicU64::new(0);
static HANDLING_FAULT: AtomicBool = AtomicBool::new(false);
static EXEC_IMAGE: OnceCell<ExecImage> = OnceCell::new();

const ABORT_MESSAGE: &[u8] = b"schedd: fatal fault within five minutes of start: aborting\n";
const RESTART_MESSAGE: &[u8] = b"schedd: fatal fault: restarting\n";

/// Errors raised while arming the crash guard.
#[derive(Debug, Error)]
pub enum CrashGuardError {
    /// The running executable could not be located.
    #[error("failed to locate the scheduler executable: {source}")]
    Executable {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// An argument contained an interior NUL byte.
    #[error("argument cannot be passed to exec: {source}")]
    Argument {
        /// Underlying conversion error.
        #[source]
        source: NulError,
    },
    /// Installing the fault handler failed.
    #[error("failed to install handler for {signal}: {source}")]
    Install {
        /// Signal being handled.
        signal: Signal,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
}

/// Program path and argument vector prepared for `execv`.
struct ExecImage {
    program: CString,
    _args: Vec<CString>,
    argv: Vec<*const libc::c_char>,
}

// SAFETY: the pointers in `argv` point into `_args`, which is never mutated
// or dropped once the image is stored in its static cell.
unsafe impl Send for ExecImage {}
// SAFETY: as above; the image is read-only after construction.
unsafe impl Sync for ExecImage {}

impl ExecImage {
    fn current() -> Result<Self, CrashGuardError> {
        let exe = env::current_exe().map_err(|source| CrashGuardError::Executable { source })?;
        let program = CString::new(exe.as_os_str().as_bytes())
            .map_err(|source| CrashGuardError::Argument { source })?;
        let args = env::args_os()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| CrashGuardError::Argument { source })?;
        let mut argv: Vec<*const libc::c_char> = args.iter().map(|arg| arg.as_ptr()).collect();
        argv.push(std::ptr::null());
        Ok(Self {
            program,
            _args: args,
            argv,
        })
    }
}

/// Whether a fault should restart the scheduler, given the process start
/// time and the start time of the last cycle, both in Unix seconds.
#[must_use]
pub const fn should_restart(process_start: u64, last_cycle_start: u64) -> bool {
    last_cycle_start.saturating_sub(process_start) >= CRASH_WINDOW.as_secs()
}

/// Records the process start time. Called once at launch.
pub(crate) fn record_process_start() {
    PROCESS_START.store(unix_now(), Ordering::SeqCst);
}

/// Records that a cycle is starting now.
pub(crate) fn record_cycle_start() {
    LAST_CYCLE_START.store(unix_now(), Ordering::SeqCst);
}

/// Arms the fault handler for `SIGSEGV` and `SIGBUS`.
pub(crate) fn install() -> Result<(), CrashGuardError> {
    let image = ExecImage::current()?;
    if EXEC_IMAGE.set(image).is_err() {
        return Ok(());
    }
    let action = SigAction::new(
        SigHandler::Handler(on_fatal_fault),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGSEGV, Signal::SIGBUS] {
        // SAFETY: the handler only uses async-signal-safe operations.
        unsafe { sigaction(signal, &action) }
            .map_err(|source| CrashGuardError::Install { signal, source })?;
    }
    info!(
        target: PROCESS_TARGET,
        window_secs = CRASH_WINDOW.as_secs(),
        "crash restart guard armed"
    );
    Ok(())
}

extern "C" fn on_fatal_fault(_signal: libc::c_int) {
    if HANDLING_FAULT.swap(true, Ordering::SeqCst) {
        // Another thread is already handling a fault; park until it aborts.
        loop {
            // SAFETY: pause is async-signal-safe.
            unsafe { libc::pause() };
        }
    }
    let start = PROCESS_START.load(Ordering::SeqCst);
    let last = LAST_CYCLE_START.load(Ordering::SeqCst);
    if !should_restart(start, last) {
        write_stderr(ABORT_MESSAGE);
        // SAFETY: abort is async-signal-safe.
        unsafe { libc::abort() };
    }
    write_stderr(RESTART_MESSAGE);
    // SAFETY: fork is async-signal-safe; the child only calls abort.
    let pid = unsafe { libc::fork() };
    if pid > 0 {
        // SAFETY: sleep and execv are async-signal-safe and the image was
        // built before the handler was installed.
        unsafe {
            libc::sleep(RESTART_DELAY_SECS);
            if let Some(image) = EXEC_IMAGE.get() {
                libc::execv(image.program.as_ptr(), image.argv.as_ptr());
            }
            libc::_exit(RESTART_FAILED_STATUS);
        }
    }
    // SAFETY: abort is async-signal-safe.
    unsafe { libc::abort() };
}

fn write_stderr(message: &[u8]) {
    // SAFETY: write is async-signal-safe and the buffer is static.
    unsafe {
        libc::write(libc::STDERR_FILENO, message.as_ptr().cast(), message.len());
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::never_cycled(1_000, 0, false)]
    #[case::fault_straight_away(1_000, 1_010, false)]
    #[case::just_inside_window(1_000, 1_299, false)]
    #[case::window_elapsed(1_000, 1_300, true)]
    #[case::long_running(1_000, 90_000, true)]
    fn restart_respects_crash_window(
        #[case] start: u64,
        #[case] last_cycle: u64,
        #[case] expected: bool,
    ) {
        assert_eq!(should_restart(start, last_cycle), expected);
    }

    #[test]
    fn exec_image_is_null_terminated() {
        let image = ExecImage::current().expect("image");
        assert_eq!(image.argv.last().copied(), Some(std::ptr::null()));
        assert_eq!(image.argv.len(), env::args_os().count() + 1);
    }

    #[test]
    fn cycle_start_is_recorded() {
        record_cycle_start();
        assert!(LAST_CYCLE_START.load(Ordering::SeqCst) > 0);
    }
}
