//! Defines the unified error surface for scheduler launch and supervision.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTimeError;

use nix::errno::Errno;
use thiserror::Error;

use ortho_config::OrthoError;

use schedd_config::RuntimePathsError;

use crate::bootstrap::BootstrapError;
use crate::controller::ControllerError;
use crate::registry::RegistryError;
use crate::signals::SignalError;

use super::crash::CrashGuardError;

/// Errors surfaced while launching or supervising the scheduler process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Config {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Runtime file locations could not be prepared.
    #[error("failed to prepare runtime paths: {source}")]
    RuntimePaths {
        /// Underlying path error.
        #[source]
        source: RuntimePathsError,
    },
    /// Lock file creation failed.
    #[error("failed to create lock file '{path}': {source}")]
    LockCreate {
        /// Lock file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A running scheduler already holds the lock.
    #[error("scheduler already running with pid {pid}")]
    AlreadyRunning {
        /// PID recorded in the existing PID file.
        pid: u32,
    },
    /// Removing a stale runtime artefact failed.
    #[error("failed to remove stale file '{path}': {source}")]
    Cleanup {
        /// Path of the artefact that could not be removed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Writing the PID file failed.
    #[error("failed to write pid file '{path}': {source}")]
    PidWrite {
        /// PID file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Writing the health snapshot failed.
    #[error("failed to write health snapshot '{path}': {source}")]
    HealthWrite {
        /// Health file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Serialising the health snapshot failed.
    #[error("failed to serialise health snapshot: {source}")]
    HealthSerialise {
        /// Underlying serialisation error.
        #[from]
        source: serde_json::Error,
    },
    /// Obtaining the current timestamp failed.
    #[error("failed to read system time: {source}")]
    Clock {
        /// Underlying system time error.
        #[source]
        source: SystemTimeError,
    },
    /// Attempting to probe an existing PID failed.
    #[error("failed to check existing process {pid}: {source}")]
    CheckProcess {
        /// PID that failed to probe.
        pid: u32,
        /// Underlying OS error.
        source: Errno,
    },
    /// Health updates were attempted before writing the PID file.
    #[error("pid must be written before updating health state")]
    MissingPid,
    /// Bootstrapping the scheduler failed.
    #[error("scheduler bootstrap failed: {source}")]
    Bootstrap {
        /// Underlying bootstrap error.
        #[source]
        source: BootstrapError,
    },
    /// Operator signal handling could not be installed.
    #[error("failed to install signal handling: {source}")]
    Signals {
        /// Underlying signal error.
        #[source]
        source: SignalError,
    },
    /// The crash restart guard could not be armed.
    #[error("failed to arm crash restart guard: {source}")]
    CrashGuard {
        /// Underlying crash guard error.
        #[source]
        source: CrashGuardError,
    },
    /// The server registry could not be created.
    #[error("failed to create server registry: {source}")]
    Registry {
        /// Underlying registry error.
        #[source]
        source: RegistryError,
    },
    /// The main loop failed.
    #[error("scheduler main loop failed: {source}")]
    Controller {
        /// Underlying controller error.
        #[source]
        source: ControllerError,
    },
}

impl From<Arc<OrthoError>> for LaunchError {
    fn from(source: Arc<OrthoError>) -> Self {
        Self::Config { source }
    }
}

impl From<RuntimePathsError> for LaunchError {
    fn from(source: RuntimePathsError) -> Self {
        Self::RuntimePaths { source }
    }
}

impl From<BootstrapError> for LaunchError {
    fn from(source: BootstrapError) -> Self {
        match source {
            BootstrapError::Configuration { source } => Self::Config { source },
            other => Self::Bootstrap { source: other },
        }
    }
}

impl From<SignalError> for LaunchError {
    fn from(source: SignalError) -> Self {
        Self::Signals { source }
    }
}

impl From<CrashGuardError> for LaunchError {
    fn from(source: CrashGuardError) -> Self {
        Self::CrashGuard { source }
    }
}

impl From<RegistryError> for LaunchError {
    fn from(source: RegistryError) -> Self {
        Self::Registry { source }
    }
}

impl From<ControllerError> for LaunchError {
    fn from(source: ControllerError) -> Self {
        Self::Controller { source }
    }
}
