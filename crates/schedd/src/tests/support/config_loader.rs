//! Test configuration loaders for scenarios covering success and failure paths.

use std::ffi::OsString;
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use ortho_config::OrthoError;
use tempfile::TempDir;

use schedd_config::{Config, ServerAddress};

use crate::bootstrap::ConfigLoader;

use super::harness::TEST_SCHEDULER;

/// Loader serving a mutable configuration rooted in a temporary directory.
#[derive(Clone)]
pub struct TestConfigLoader {
    config: Arc<Mutex<Config>>,
    loads: Arc<Mutex<usize>>,
    _runtime: Arc<TempDir>,
}

impl TestConfigLoader {
    /// Builds a loader pointing at `servers` with fast retry timings.
    #[must_use]
    pub fn new(servers: Vec<ServerAddress>) -> Self {
        let runtime = TempDir::new().expect("failed to create runtime directory");
        let runtime_dir = Utf8PathBuf::from_path_buf(runtime.path().to_path_buf())
            .expect("temporary runtime path was not valid UTF-8");
        let config = Config {
            servers,
            scheduler_name: TEST_SCHEDULER.to_owned(),
            runtime_dir: Some(runtime_dir),
            connect_retry_ms: 50,
            wait_error_backoff_ms: 10,
            no_restart: true,
            ..Config::default()
        };
        Self {
            config: Arc::new(Mutex::new(config)),
            loads: Arc::new(Mutex::new(0)),
            _runtime: Arc::new(runtime),
        }
    }

    /// Changes the configuration later loads return.
    pub fn update(&self, change: impl FnOnce(&mut Config)) {
        change(&mut self.config.lock().expect("config mutex poisoned"));
    }

    /// The configuration later loads return.
    #[must_use]
    pub fn current(&self) -> Config {
        self.config.lock().expect("config mutex poisoned").clone()
    }

    /// Number of loads served so far.
    #[must_use]
    pub fn loads(&self) -> usize {
        *self.loads.lock().expect("load counter mutex poisoned")
    }
}

impl ConfigLoader for TestConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        if let Ok(mut loads) = self.loads.lock() {
            *loads += 1;
        }
        Ok(self.current())
    }
}

/// Loader that intentionally fails by passing an invalid server address.
pub struct FailingConfigLoader;

impl ConfigLoader for FailingConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        let args = vec![
            OsString::from("schedd"),
            OsString::from("--connect-retry-ms"),
            OsString::from("soon"),
        ];
        Config::load_from_iter(args)
    }
}
