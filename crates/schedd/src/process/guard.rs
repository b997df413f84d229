//! Singleton lock plus the pid and health files of a running scheduler.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::Serialize;
use tracing::{info, warn};

use schedd_config::RuntimePaths;

use super::PROCESS_TARGET;
use super::errors::LaunchError;

const RUNTIME_FILE_MODE: u32 = 0o600;

#[derive(Debug)]
pub(super) struct ProcessGuard {
    paths: RuntimePaths,
    _lock: File,
    pid: Option<u32>,
}

impl ProcessGuard {
    pub(super) fn acquire(paths: RuntimePaths) -> Result<Self, LaunchError> {
        let lock = acquire_lock(&paths)?;
        Ok(Self {
            paths,
            _lock: lock,
            pid: None,
        })
    }

    pub(super) fn write_pid(&mut self, pid: u32) -> Result<(), LaunchError> {
        let path = self.paths.pid_path();
        let write_error = |source| LaunchError::PidWrite {
            path: path.to_path_buf(),
            source,
        };
        let mut file = private_file(path).map_err(write_error)?;
        writeln!(file, "{pid}").map_err(write_error)?;
        file.sync_all().map_err(write_error)?;
        self.pid = Some(pid);
        info!(
            target: PROCESS_TARGET,
            pid,
            file = %path.display(),
            "pid file written"
        );
        Ok(())
    }

    pub(super) fn write_health(&self, status: HealthState) -> Result<(), LaunchError> {
        let pid = self.pid.ok_or(LaunchError::MissingPid)?;
        let path = self.paths.health_path();
        let write_error = |source| LaunchError::HealthWrite {
            path: path.to_path_buf(),
            source,
        };
        let snapshot = HealthSnapshot::new(status, pid)?;
        let mut file = private_file(path).map_err(write_error)?;
        serde_json::to_writer(&mut file, &snapshot)?;
        file.write_all(b"\n").map_err(write_error)?;
        file.sync_all().map_err(write_error)?;
        info!(
            target: PROCESS_TARGET,
            status = snapshot.status,
            file = %path.display(),
            "health snapshot updated"
        );
        Ok(())
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        for (path, what) in [
            (self.paths.lock_path(), "lock"),
            (self.paths.pid_path(), "pid"),
            (self.paths.health_path(), "health"),
        ] {
            match fs::remove_file(path) {
                Err(error) if error.kind() != io::ErrorKind::NotFound => {
                    warn!(
                        target: PROCESS_TARGET,
                        file = %path.display(),
                        kind = what,
                        error = %error,
                        "failed to remove runtime file"
                    );
                }
                _ => {}
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) enum HealthState {
    Starting,
    Ready,
    Stopping,
}

impl HealthState {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthSnapshot<'a> {
    status: &'a str,
    pid: u32,
    timestamp: u64,
}

impl HealthSnapshot<'_> {
    fn new(state: HealthState, pid: u32) -> Result<Self, LaunchError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|source| LaunchError::Clock { source })?
            .as_secs();
        Ok(Self {
            status: state.as_str(),
            pid,
            timestamp,
        })
    }
}

fn private_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(RUNTIME_FILE_MODE)
        .open(path)
}

fn acquire_lock(paths: &RuntimePaths) -> Result<File, LaunchError> {
    let opened = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(RUNTIME_FILE_MODE)
        .open(paths.lock_path());
    match opened {
        Ok(file) => {
            info!(
                target: PROCESS_TARGET,
                file = %paths.lock_path().display(),
                "acquired scheduler lock"
            );
            Ok(file)
        }
        Err(error) if error.kind() == io::ErrorKind::AlreadyExists => handle_existing_lock(paths),
        Err(source) => Err(LaunchError::LockCreate {
            path: paths.lock_path().to_path_buf(),
            source,
        }),
    }
}

fn handle_existing_lock(paths: &RuntimePaths) -> Result<File, LaunchError> {
    if let Some(pid) = read_pid(paths.pid_path())
        && pid != 0
    {
        if check_process(pid)? {
            info!(
                target: PROCESS_TARGET,
                pid,
                "refusing to start: existing scheduler alive"
            );
            return Err(LaunchError::AlreadyRunning { pid });
        }
        warn!(
            target: PROCESS_TARGET,
            pid,
            "existing scheduler not detected; cleaning stale files"
        );
    }
    remove_file(paths.lock_path())?;
    remove_file(paths.pid_path())?;
    acquire_lock(paths)
}

fn read_pid(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).ok()?;
    content.trim().parse::<u32>().ok()
}

fn remove_file(path: &Path) -> Result<(), LaunchError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LaunchError::Cleanup {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn check_process(pid: u32) -> Result<bool, LaunchError> {
    let Ok(raw) = i32::try_from(pid) else {
        return Ok(false);
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) | Err(Errno::EPERM) => Ok(true),
        Err(Errno::ESRCH | Errno::ECHILD) => Ok(false),
        Err(errno) => Err(LaunchError::CheckProcess { pid, source: errno }),
    }
}
