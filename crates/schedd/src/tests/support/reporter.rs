//! Test double for [`HealthReporter`] that records lifecycle events.

use std::sync::Mutex;

use schedd_config::{Config, ServerAddress};

use crate::bootstrap::BootstrapError;
use crate::command::ConnectionId;
use crate::health::HealthReporter;
use crate::registry::ConnectError;

/// Lifecycle events tracked during scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    /// Bootstrap started.
    BootstrapStarting,
    /// Bootstrap completed successfully.
    BootstrapSucceeded,
    /// Bootstrap failed with an error description.
    BootstrapFailed(String),
    /// A server connection came up.
    ServerConnected {
        server: String,
        connection: ConnectionId,
    },
    /// A server connection was torn down.
    ServerDisconnected {
        server: String,
        connection: ConnectionId,
    },
    /// A server refused the registration.
    ServerRejected(String),
    /// Every connection was closed.
    ServersClosed { dropped_commands: usize },
}

/// Records health events for assertions.
#[derive(Debug, Default)]
pub struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    /// Captures a copy of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    /// Number of `ServersClosed` events seen.
    #[must_use]
    pub fn close_all_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, HealthEvent::ServersClosed { .. }))
            .count()
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn bootstrap_starting(&self) {
        self.record(HealthEvent::BootstrapStarting);
    }

    fn bootstrap_succeeded(&self, _config: &Config) {
        self.record(HealthEvent::BootstrapSucceeded);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        self.record(HealthEvent::BootstrapFailed(error.to_string()));
    }

    fn server_connected(&self, address: &ServerAddress, id: ConnectionId) {
        self.record(HealthEvent::ServerConnected {
            server: address.to_string(),
            connection: id,
        });
    }

    fn server_disconnected(&self, address: &ServerAddress, id: ConnectionId) {
        self.record(HealthEvent::ServerDisconnected {
            server: address.to_string(),
            connection: id,
        });
    }

    fn server_rejected(&self, error: &ConnectError) {
        self.record(HealthEvent::ServerRejected(error.to_string()));
    }

    fn servers_closed(&self, dropped_commands: usize) {
        self.record(HealthEvent::ServersClosed { dropped_commands });
    }
}
