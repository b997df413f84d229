//! Structured health reporting for scheduler lifecycle events.

use std::sync::Arc;

use schedd_config::{Config, ServerAddress};

use crate::bootstrap::BootstrapError;
use crate::command::ConnectionId;
use crate::registry::ConnectError;

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked before configuration loading begins.
    fn bootstrap_starting(&self);

    /// Invoked after bootstrap completes successfully.
    fn bootstrap_succeeded(&self, config: &Config);

    /// Invoked when bootstrap fails.
    fn bootstrap_failed(&self, error: &BootstrapError);

    /// Invoked once both sockets of a server are registered.
    fn server_connected(&self, address: &ServerAddress, id: ConnectionId);

    /// Invoked after a server connection has been torn down.
    fn server_disconnected(&self, address: &ServerAddress, id: ConnectionId);

    /// Invoked when a server refuses the registration.
    fn server_rejected(&self, error: &ConnectError);

    /// Invoked once every connection is closed and the queue drained.
    fn servers_closed(&self, dropped_commands: usize);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter,
{
    fn bootstrap_starting(&self) {
        (**self).bootstrap_starting();
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        (**self).bootstrap_succeeded(config);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        (**self).bootstrap_failed(error);
    }

    fn server_connected(&self, address: &ServerAddress, id: ConnectionId) {
        (**self).server_connected(address, id);
    }

    fn server_disconnected(&self, address: &ServerAddress, id: ConnectionId) {
        (**self).server_disconnected(address, id);
    }

    fn server_rejected(&self, error: &ConnectError) {
        (**self).server_rejected(error);
    }

    fn servers_closed(&self, dropped_commands: usize) {
        (**self).servers_closed(dropped_commands);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_starting",
            "starting scheduler bootstrap"
        );
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_succeeded",
            scheduler = %config.scheduler_name(),
            servers = config.servers().len(),
            log_filter = %config.log_filter(),
            log_format = ?config.log_format(),
            "scheduler bootstrap completed"
        );
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "bootstrap_failed",
            error = %error,
            "scheduler bootstrap failed"
        );
    }

    fn server_connected(&self, address: &ServerAddress, id: ConnectionId) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "server_connected",
            server = %address,
            connection = %id,
            "connected to server"
        );
    }

    fn server_disconnected(&self, address: &ServerAddress, id: ConnectionId) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "server_disconnected",
            server = %address,
            connection = %id,
            "disconnected from server"
        );
    }

    fn server_rejected(&self, error: &ConnectError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "server_rejected",
            error = %error,
            "server rejected registration"
        );
    }

    fn servers_closed(&self, dropped_commands: usize) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "servers_closed",
            dropped_commands,
            "all server connections closed"
        );
    }
}
