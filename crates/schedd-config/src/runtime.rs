//! Derives the runtime artefact paths written by the daemon supervisor.
//!
//! The runtime directory holds the lock, pid and health files. Their names
//! carry the scheduler name so several named schedulers can share a host.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Config;

#[cfg(unix)]
use dirs::runtime_dir;
#[cfg(unix)]
use libc::geteuid;

/// Canonical paths for runtime artefacts written by the daemon.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    runtime_dir: PathBuf,
    lock_path: PathBuf,
    pid_path: PathBuf,
    health_path: PathBuf,
}

impl RuntimePaths {
    /// Derives runtime paths from the configuration, creating the directory.
    pub fn from_config(config: &Config) -> Result<Self, RuntimePathsError> {
        let name = config.scheduler_name();
        if name.is_empty() || name.contains(['/', '\0']) {
            return Err(RuntimePathsError::InvalidSchedulerName {
                name: name.to_owned(),
            });
        }
        let runtime_dir = match config.runtime_dir() {
            Some(dir) => dir.as_std_path().to_path_buf(),
            None => default_runtime_directory(),
        };
        fs::create_dir_all(&runtime_dir).map_err(|source| RuntimePathsError::RuntimeDirectory {
            path: runtime_dir.clone(),
            source,
        })?;
        Ok(Self {
            lock_path: runtime_dir.join(format!("{name}.lock")),
            pid_path: runtime_dir.join(format!("{name}.pid")),
            health_path: runtime_dir.join(format!("{name}.health")),
            runtime_dir,
        })
    }

    /// Directory holding runtime artefacts.
    #[must_use]
    pub fn runtime_dir(&self) -> &Path {
        self.runtime_dir.as_path()
    }

    /// Path to the lock file guarding singleton startup.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        self.lock_path.as_path()
    }

    /// Path to the PID file.
    #[must_use]
    pub fn pid_path(&self) -> &Path {
        self.pid_path.as_path()
    }

    /// Path to the health snapshot.
    #[must_use]
    pub fn health_path(&self) -> &Path {
        self.health_path.as_path()
    }
}

fn default_runtime_directory() -> PathBuf {
    #[cfg(unix)]
    {
        if let Some(mut dir) = runtime_dir() {
            dir.push("schedd");
            return dir;
        }
        let mut dir = env::temp_dir();
        dir.push("schedd");
        // SAFETY: geteuid cannot fail and touches no memory.
        let uid = unsafe { geteuid() };
        dir.push(format!("uid-{uid}"));
        dir
    }

    #[cfg(not(unix))]
    {
        let mut dir = env::temp_dir();
        dir.push("schedd");
        dir
    }
}

/// Errors raised while deriving daemon runtime paths.
#[derive(Debug, Error)]
pub enum RuntimePathsError {
    /// The scheduler name cannot be used as a file name.
    #[error("scheduler name '{name}' cannot name runtime files")]
    InvalidSchedulerName {
        /// Offending name.
        name: String,
    },
    /// Creating the runtime directory failed.
    #[error("failed to prepare runtime directory '{path}': {source}")]
    RuntimeDirectory {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },
}
