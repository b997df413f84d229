use crate::logging::LogFormat;
use crate::server::ServerAddress;

/// Port batch servers listen on when an address omits one.
pub const DEFAULT_SERVER_PORT: u16 = 15001;

/// Scheduler name used when none is configured.
pub const DEFAULT_SCHEDULER_NAME: &str = "default";

/// Default log filter expression used by the daemon.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Fixed backoff between connection attempts, in milliseconds.
pub const DEFAULT_CONNECT_RETRY_MS: u64 = 2_000;

/// Backoff after a failed multiplexer wait, in milliseconds.
pub const DEFAULT_WAIT_ERROR_BACKOFF_MS: u64 = 1_000;

/// Default log filter expression used by the daemon.
#[must_use]
pub const fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the daemon.
#[must_use]
pub const fn default_log_format() -> LogFormat {
    LogFormat::Json
}

/// Owned scheduler name default.
#[must_use]
pub fn default_scheduler_name() -> String {
    DEFAULT_SCHEDULER_NAME.to_owned()
}

/// Server list used when none is configured: the local batch server.
#[must_use]
pub fn default_servers() -> Vec<ServerAddress> {
    vec![ServerAddress::new("localhost", DEFAULT_SERVER_PORT)]
}
