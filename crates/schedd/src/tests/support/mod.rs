//! Shared doubles for the scheduler test suites.

mod config_loader;
mod fake_server;
mod harness;
mod reporter;
mod runner;

pub use config_loader::{FailingConfigLoader, TestConfigLoader};
pub use fake_server::{FakeBatchServer, ServerSession};
pub use harness::{TEST_SCHEDULER, test_registry};
pub use reporter::{HealthEvent, RecordingHealthReporter};
pub use runner::RecordingCycleRunner;
