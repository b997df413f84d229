//! Operator signal integration.
//!
//! Handlers only flip atomic flags. The main loop keeps the handled signals
//! blocked and opens them up while it is parked in the multiplexer wait,
//! sleeping between connection attempts, or checking for signals between
//! cycles, then inspects the flags.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{SigSet, SigmaskHow, Signal, pthread_sigmask};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use thiserror::Error;
use tracing::warn;

const SIGNAL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::signals");

/// Errors raised while wiring up signal handling.
#[derive(Debug, Error)]
pub enum SignalError {
    /// Registering a handler failed.
    #[error("failed to install handler for signal {signal}: {source}")]
    Install {
        /// Signal number.
        signal: i32,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Changing the thread signal mask failed.
    #[error("failed to change signal mask: {source}")]
    Mask {
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
}

/// Flags raised by the operator signals.
#[derive(Debug, Clone, Default)]
pub struct SignalFlags {
    terminate: Arc<AtomicBool>,
    reconfigure: Arc<AtomicBool>,
    diagnostics: Arc<AtomicBool>,
}

impl SignalFlags {
    /// Creates cleared flags with no handlers attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `SIGINT`/`SIGTERM`, `SIGHUP` and `SIGUSR1` onto the flags.
    pub fn install(&self) -> Result<(), SignalError> {
        let routes = [
            (SIGINT, &self.terminate),
            (SIGTERM, &self.terminate),
            (SIGHUP, &self.reconfigure),
            (SIGUSR1, &self.diagnostics),
        ];
        for (signal, flag) in routes {
            signal_hook::flag::register(signal, Arc::clone(flag))
                .map_err(|source| SignalError::Install { signal, source })?;
        }
        Ok(())
    }

    /// Whether shutdown has been requested. The flag stays raised.
    #[must_use]
    pub fn terminate_requested(&self) -> bool {
        self.terminate.load(Ordering::SeqCst)
    }

    /// Consumes a pending reconfiguration request.
    #[must_use]
    pub fn take_reconfigure(&self) -> bool {
        self.reconfigure.swap(false, Ordering::SeqCst)
    }

    /// Consumes a pending diagnostics toggle.
    #[must_use]
    pub fn take_diagnostics_toggle(&self) -> bool {
        self.diagnostics.swap(false, Ordering::SeqCst)
    }

    /// Raises the shutdown flag as `SIGTERM` would.
    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::SeqCst);
    }

    /// Raises the reconfiguration flag as `SIGHUP` would.
    pub fn request_reconfigure(&self) {
        self.reconfigure.store(true, Ordering::SeqCst);
    }

    /// Raises the diagnostics flag as `SIGUSR1` would.
    pub fn request_diagnostics_toggle(&self) {
        self.diagnostics.store(true, Ordering::SeqCst);
    }
}

/// Signals whose handlers must never run during a cycle.
#[must_use]
pub fn handled_signals() -> SigSet {
    let mut set = SigSet::empty();
    for signal in [
        Signal::SIGHUP,
        Signal::SIGINT,
        Signal::SIGTERM,
        Signal::SIGUSR1,
    ] {
        set.add(signal);
    }
    set
}

/// Keeps the handled signals blocked on the current thread until dropped.
#[derive(Debug)]
pub struct BlockedSignals {
    previous: SigSet,
}

impl BlockedSignals {
    /// Blocks the handled signals, remembering the previous mask.
    pub fn block() -> Result<Self, SignalError> {
        let mut previous = SigSet::empty();
        pthread_sigmask(
            SigmaskHow::SIG_BLOCK,
            Some(&handled_signals()),
            Some(&mut previous),
        )
        .map_err(|source| SignalError::Mask { source })?;
        Ok(Self { previous })
    }
}

impl Drop for BlockedSignals {
    fn drop(&mut self) {
        if let Err(error) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None) {
            warn!(
                target: SIGNAL_TARGET,
                error = %error,
                "failed to restore signal mask"
            );
        }
    }
}

/// Sleeps with the handled signals deliverable, restoring the mask after.
pub(crate) fn sleep_with_signals_open(duration: Duration) {
    with_signals_open(|| thread::sleep(duration));
}

/// Lets any handled signal that arrived while blocked run its handler now.
///
/// Unblocking a pending signal delivers it before `pthread_sigmask` returns,
/// so the flags are current once this returns.
pub(crate) fn deliver_pending_signals() {
    with_signals_open(|| {});
}

fn with_signals_open(action: impl FnOnce()) {
    let mut previous = SigSet::empty();
    let opened = pthread_sigmask(
        SigmaskHow::SIG_UNBLOCK,
        Some(&handled_signals()),
        Some(&mut previous),
    );
    action();
    if opened.is_ok()
        && let Err(error) = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None)
    {
        warn!(
            target: SIGNAL_TARGET,
            error = %error,
            "failed to restore signal mask"
        );
    }
}
