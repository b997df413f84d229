//! Builders wiring real registries to the fake batch server.

use std::sync::Arc;
use std::time::Duration;

use schedd_config::ClientAllowList;

use crate::health::HealthReporter;
use crate::registry::{RegistrySettings, ServerRegistry, TcpConnector};
use crate::signals::SignalFlags;

/// Scheduler name used in every test registration.
pub const TEST_SCHEDULER: &str = "test-sched";

const TEST_RETRY: Duration = Duration::from_millis(50);
const TEST_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Connector registering as [`TEST_SCHEDULER`] and admitting any peer.
#[must_use]
fn test_connector() -> TcpConnector {
    TcpConnector::new(TEST_SCHEDULER, ClientAllowList::new()).with_timeout(TEST_CONNECT_TIMEOUT)
}

/// Registry with fast retries, sized for `capacity` ready events per wait.
#[must_use]
pub fn test_registry(
    signals: SignalFlags,
    reporter: Arc<dyn HealthReporter>,
    capacity: usize,
) -> ServerRegistry<TcpConnector> {
    let settings = RegistrySettings {
        retry: TEST_RETRY,
        capacity,
    };
    ServerRegistry::new(test_connector(), settings, signals, reporter).expect("registry")
}
