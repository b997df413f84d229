//! Scheduler bootstrap: configuration, telemetry, and the client allow-list.

use std::sync::Arc;

use nix::unistd::gethostname;
use ortho_config::OrthoError;
use thiserror::Error;
use tracing::warn;

use schedd_config::{ClientAllowList, ClientListError, Config};

use crate::health::HealthReporter;
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

const BOOTSTRAP_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::bootstrap");
const LOCALHOST: &str = "localhost";

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the scheduler configuration.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

impl<T> ConfigLoader for Arc<T>
where
    T: ConfigLoader + ?Sized,
{
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        (**self).load()
    }
}

/// Loader that delegates to [`Config::load`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader that hands out a configuration resolved earlier.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps an already resolved configuration.
    #[must_use]
    pub const fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// The client allow-list file could not be used.
    #[error("failed to load client allow-list: {source}")]
    ClientList {
        /// Underlying parse or resolution error.
        #[source]
        source: ClientListError,
    },
}

/// Result of a successful bootstrap.
#[derive(Debug)]
pub struct Bootstrapped {
    config: Config,
    allow_list: ClientAllowList,
    telemetry: TelemetryHandle,
}

impl Bootstrapped {
    /// The resolved configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Peers allowed to act as batch servers.
    #[must_use]
    pub const fn allow_list(&self) -> &ClientAllowList {
        &self.allow_list
    }

    /// Telemetry handle, mainly useful to tests.
    #[must_use]
    pub const fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// Splits the result into the configuration and the allow-list.
    #[must_use]
    pub fn into_parts(self) -> (Config, ClientAllowList) {
        (self.config, self.allow_list)
    }
}

/// Loads configuration, starts telemetry and builds the allow-list.
pub fn bootstrap_with(
    loader: &dyn ConfigLoader,
    reporter: &dyn HealthReporter,
) -> Result<Bootstrapped, BootstrapError> {
    reporter.bootstrap_starting();

    let config = match loader.load() {
        Ok(config) => config,
        Err(source) => return Err(fail(reporter, BootstrapError::Configuration { source })),
    };

    let telemetry = match telemetry::initialise(&config) {
        Ok(handle) => handle,
        Err(source) => return Err(fail(reporter, BootstrapError::Telemetry { source })),
    };

    let allow_list = match build_allow_list(&config) {
        Ok(list) => list,
        Err(error) => return Err(fail(reporter, error)),
    };

    reporter.bootstrap_succeeded(&config);
    Ok(Bootstrapped {
        config,
        allow_list,
        telemetry,
    })
}

/// Builds the set of peers permitted to act as batch servers.
///
/// The loopback host, this host and every configured server are always
/// admitted; the optional clients file adds more. Problems with the clients
/// file are errors, while a built-in host that fails to resolve is only
/// logged.
pub fn build_allow_list(config: &Config) -> Result<ClientAllowList, BootstrapError> {
    let mut list = ClientAllowList::new();
    admit_builtin(&mut list, LOCALHOST);
    match gethostname() {
        Ok(name) => admit_builtin(&mut list, &name.to_string_lossy()),
        Err(error) => warn!(
            target: BOOTSTRAP_TARGET,
            error = %error,
            "failed to read local host name"
        ),
    }
    for server in config.servers() {
        admit_builtin(&mut list, server.host());
    }

    if let Some(path) = config.clients_file() {
        let listed =
            ClientAllowList::load(path).map_err(|source| BootstrapError::ClientList { source })?;
        for directive in listed.ignored_directives() {
            warn!(
                target: BOOTSTRAP_TARGET,
                file = %path,
                directive = %directive,
                "ignoring unknown client list directive"
            );
        }
        list.merge(listed);
    }
    Ok(list)
}

fn admit_builtin(list: &mut ClientAllowList, host: &str) {
    if let Err(error) = list.add_host(host) {
        warn!(
            target: BOOTSTRAP_TARGET,
            host,
            error = %error,
            "failed to admit host to client allow-list"
        );
    }
}

fn fail(reporter: &dyn HealthReporter, error: BootstrapError) -> BootstrapError {
    reporter.bootstrap_failed(&error);
    error
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::net::{IpAddr, Ipv4Addr};

    use camino::Utf8PathBuf;
    use schedd_config::ServerAddress;

    use super::*;
    use crate::tests::support::{FailingConfigLoader, HealthEvent, RecordingHealthReporter};

    fn config_with_clients(contents: &str) -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("clients");
        fs::write(&path, contents).expect("write clients file");
        let config = Config {
            servers: vec![ServerAddress::new("127.0.0.1", 15001)],
            clients_file: Some(Utf8PathBuf::from_path_buf(path).expect("utf8 path")),
            ..Config::default()
        };
        (dir, config)
    }

    #[test]
    fn allow_list_always_admits_loopback_and_servers() {
        let config = Config {
            servers: vec![ServerAddress::new("127.0.0.2", 15001)],
            ..Config::default()
        };
        let list = build_allow_list(&config).expect("allow-list");
        assert!(list.permits(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(list.permits(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2))));
    }

    #[test]
    fn allow_list_merges_clients_file() {
        let (_dir, config) = config_with_clients("# servers\n$clienthost 10.1.2.3\n$logevent 0x1ff\n");
        let list = build_allow_list(&config).expect("allow-list");
        assert!(list.permits(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3))));
    }

    #[test]
    fn malformed_clients_file_is_an_error() {
        let (_dir, config) = config_with_clients("clienthost 10.1.2.3\n");
        let error = build_allow_list(&config).expect_err("line without $ should fail");
        assert!(matches!(
            error,
            BootstrapError::ClientList {
                source: ClientListError::InvalidLine { line: 1, .. }
            }
        ));
    }

    #[test]
    fn configuration_failure_is_reported() {
        let reporter = RecordingHealthReporter::default();
        let error = bootstrap_with(&FailingConfigLoader, &reporter).expect_err("bootstrap fails");
        assert!(matches!(error, BootstrapError::Configuration { .. }));
        let events = reporter.events();
        assert_eq!(events.first(), Some(&HealthEvent::BootstrapStarting));
        assert!(matches!(events.last(), Some(HealthEvent::BootstrapFailed(_))));
    }
}
