//! Shared configuration for the scheduler daemon.
//!
//! [`Config`] is layered by `ortho_config`: built-in defaults, then an optional
//! configuration file, then `SCHEDD_*` environment variables, then command
//! line flags. The daemon consumes it once at startup and again whenever an
//! operator asks for a reconfiguration with `SIGHUP`.

mod clients;
mod defaults;
mod logging;
mod runtime;
mod server;

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};

pub use clients::{ClientAllowList, ClientListError};
pub use defaults::{
    DEFAULT_CONNECT_RETRY_MS, DEFAULT_LOG_FILTER, DEFAULT_SCHEDULER_NAME, DEFAULT_SERVER_PORT,
    DEFAULT_WAIT_ERROR_BACKOFF_MS, default_log_filter, default_log_filter_string,
    default_log_format, default_scheduler_name, default_servers,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use runtime::{RuntimePaths, RuntimePathsError};
pub use server::{ServerAddress, ServerAddressError};

/// Resolved scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "SCHEDD")]
pub struct Config {
    /// Batch servers the scheduler registers with, as `host[:port]`.
    #[ortho_config(default = defaults::default_servers())]
    pub servers: Vec<ServerAddress>,
    /// Name announced to every server during registration.
    #[ortho_config(default = defaults::default_scheduler_name())]
    pub scheduler_name: String,
    /// Optional `$clienthost` allow-list file.
    pub clients_file: Option<Utf8PathBuf>,
    /// Directory for the lock, pid and health files.
    pub runtime_dir: Option<Utf8PathBuf>,
    /// `tracing` filter expression.
    #[ortho_config(default = defaults::default_log_filter_string())]
    pub log_filter: String,
    /// Log output format.
    #[ortho_config(default = defaults::default_log_format())]
    pub log_format: LogFormat,
    /// Delay between connection attempts to an unreachable server.
    #[ortho_config(default = defaults::DEFAULT_CONNECT_RETRY_MS)]
    pub connect_retry_ms: u64,
    /// Delay after a failed multiplexer wait before trying again.
    #[ortho_config(default = defaults::DEFAULT_WAIT_ERROR_BACKOFF_MS)]
    pub wait_error_backoff_ms: u64,
    /// Disables the crash self-restart.
    #[ortho_config(default = false)]
    pub no_restart: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: defaults::default_servers(),
            scheduler_name: defaults::default_scheduler_name(),
            clients_file: None,
            runtime_dir: None,
            log_filter: defaults::default_log_filter_string(),
            log_format: defaults::default_log_format(),
            connect_retry_ms: defaults::DEFAULT_CONNECT_RETRY_MS,
            wait_error_backoff_ms: defaults::DEFAULT_WAIT_ERROR_BACKOFF_MS,
            no_restart: false,
        }
    }
}

impl Config {
    /// Loads the layered configuration using the process arguments.
    pub fn load() -> Result<Self, Arc<OrthoError>> {
        Self::load_from_iter(std::env::args_os())
    }

    /// Loads the layered configuration from an explicit argument list.
    ///
    /// The first item is the program name, as with [`std::env::args_os`].
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, Arc<OrthoError>>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as OrthoConfig>::load_from_iter(args)
    }

    /// Servers to connect to at startup.
    #[must_use]
    pub fn servers(&self) -> &[ServerAddress] {
        &self.servers
    }

    /// Scheduler name used for registration.
    #[must_use]
    pub fn scheduler_name(&self) -> &str {
        &self.scheduler_name
    }

    /// Allow-list file, when configured.
    #[must_use]
    pub fn clients_file(&self) -> Option<&Utf8Path> {
        self.clients_file.as_deref()
    }

    /// Explicit runtime directory, when configured.
    #[must_use]
    pub fn runtime_dir(&self) -> Option<&Utf8Path> {
        self.runtime_dir.as_deref()
    }

    /// Filter expression for the tracing subscriber.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Output format for the tracing subscriber.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Backoff between connection attempts.
    #[must_use]
    pub const fn connect_retry(&self) -> Duration {
        Duration::from_millis(self.connect_retry_ms)
    }

    /// Backoff after a multiplexer error.
    #[must_use]
    pub const fn wait_error_backoff(&self) -> Duration {
        Duration::from_millis(self.wait_error_backoff_ms)
    }

    /// Whether the crash self-restart is enabled.
    #[must_use]
    pub const fn restart_on_crash(&self) -> bool {
        !self.no_restart
    }
}
