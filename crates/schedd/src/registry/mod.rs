//! Connections to the batch servers the scheduler serves.
//!
//! Each server contributes a primary socket for synchronous requests and a
//! secondary socket the server pushes commands on. A connection is either in
//! the registry with both sockets registered and the secondary watched by
//! the multiplexer, or absent altogether.

mod connector;

use std::net::TcpStream;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::sys::signal::SigSet;
use thiserror::Error;
use tracing::{info, warn};

use schedd_config::ServerAddress;

use crate::command::ConnectionId;
use crate::health::HealthReporter;
use crate::multiplexer::{Interest, MultiplexError, Multiplexer, Readiness};
use crate::queue::CommandQueue;
use crate::signals::{SignalFlags, sleep_with_signals_open};

pub use connector::{Channel, ConnectError, Connector, TcpConnector};

pub(crate) const REGISTRY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::registry");
const RETRY_SLICE: Duration = Duration::from_millis(100);

/// Tunables for the registry.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    /// Pause between attempts to reach an unavailable server.
    pub retry: Duration,
    /// Most readiness events collected per wait.
    pub capacity: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            retry: Duration::from_millis(schedd_config::DEFAULT_CONNECT_RETRY_MS),
            capacity: 1,
        }
    }
}

/// Errors the registry cannot recover from by retrying.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Creating the multiplexer failed.
    #[error("failed to create command multiplexer: {source}")]
    Multiplexer {
        /// Underlying multiplexer error.
        #[source]
        source: MultiplexError,
    },
    /// The secondary socket could not be watched.
    #[error("failed to watch command socket of {address}: {source}")]
    Watch {
        /// Server address.
        address: String,
        /// Underlying multiplexer error.
        #[source]
        source: MultiplexError,
    },
    /// A server refused the registration.
    #[error("registration rejected: {source}")]
    Rejected {
        /// Rejection reported by the connector.
        #[source]
        source: ConnectError,
    },
    /// Shutdown was requested while waiting to reach a server.
    #[error("connection to {address} abandoned: shutdown requested")]
    Cancelled {
        /// Server address.
        address: String,
    },
    /// The registry has already been closed.
    #[error("server registry is closed")]
    Closed,
}

impl RegistryError {
    /// Whether the error only reflects a shutdown request.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// A fully registered batch server.
#[derive(Debug)]
pub struct ServerConnection {
    id: ConnectionId,
    address: ServerAddress,
    primary: TcpStream,
    secondary: TcpStream,
}

impl ServerConnection {
    pub(crate) const fn new(
        id: ConnectionId,
        address: ServerAddress,
        primary: TcpStream,
        secondary: TcpStream,
    ) -> Self {
        Self {
            id,
            address,
            primary,
            secondary,
        }
    }

    /// Handle of this incarnation of the connection.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Server identity.
    #[must_use]
    pub const fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Socket for synchronous requests made during a cycle.
    pub const fn primary_mut(&mut self) -> &mut TcpStream {
        &mut self.primary
    }

    /// Socket commands arrive on and cycle markers are written to.
    pub const fn secondary_mut(&mut self) -> &mut TcpStream {
        &mut self.secondary
    }

    /// Descriptor of the secondary socket.
    #[must_use]
    pub fn secondary_fd(&self) -> RawFd {
        self.secondary.as_raw_fd()
    }
}

/// Owner of every server connection and of the multiplexer watching them.
pub struct ServerRegistry<C> {
    connector: C,
    settings: RegistrySettings,
    signals: SignalFlags,
    reporter: Arc<dyn HealthReporter>,
    multiplexer: Option<Multiplexer>,
    connections: Vec<ServerConnection>,
    next_id: u64,
}

impl<C> ServerRegistry<C>
where
    C: Connector,
{
    /// Creates an empty registry.
    pub fn new(
        connector: C,
        settings: RegistrySettings,
        signals: SignalFlags,
        reporter: Arc<dyn HealthReporter>,
    ) -> Result<Self, RegistryError> {
        let multiplexer = Multiplexer::create(settings.capacity)
            .map_err(|source| RegistryError::Multiplexer { source })?;
        Ok(Self {
            connector,
            settings,
            signals,
            reporter,
            multiplexer: Some(multiplexer),
            connections: Vec::new(),
            next_id: 0,
        })
    }

    /// Connects and registers both sockets of the server at `address`.
    ///
    /// Unreachable servers are retried after the configured pause until
    /// they answer or shutdown is requested. A refused registration is
    /// returned at once.
    pub fn connect_server(&mut self, address: &ServerAddress) -> Result<ConnectionId, RegistryError> {
        if self.multiplexer.is_none() {
            return Err(RegistryError::Closed);
        }
        let mut primary = None;
        let (primary_stream, secondary_stream) = loop {
            if self.signals.terminate_requested() {
                return Err(RegistryError::Cancelled {
                    address: address.to_string(),
                });
            }
            let stream = match primary.take() {
                Some(stream) => stream,
                None => match self.attempt(address, Channel::Primary)? {
                    Some(stream) => stream,
                    None => {
                        self.pause(address)?;
                        continue;
                    }
                },
            };
            if let Some(secondary) = self.attempt(address, Channel::Secondary)? {
                break (stream, secondary);
            }
            primary = Some(stream);
            self.pause(address)?;
        };

        let multiplexer = self.multiplexer.as_mut().ok_or(RegistryError::Closed)?;
        multiplexer
            .add(secondary_stream.as_fd(), Interest::COMMANDS)
            .map_err(|source| RegistryError::Watch {
                address: address.to_string(),
                source,
            })?;

        self.next_id += 1;
        let id = ConnectionId::new(self.next_id);
        let connection =
            ServerConnection::new(id, address.clone(), primary_stream, secondary_stream);
        info!(
            target: REGISTRY_TARGET,
            server = %address,
            connection = %id,
            fd = connection.secondary_fd(),
            "connected to server"
        );
        self.connections.push(connection);
        self.reporter.server_connected(address, id);
        Ok(id)
    }

    /// Connects every address in turn.
    pub fn connect_all(&mut self, addresses: &[ServerAddress]) -> Result<(), RegistryError> {
        for address in addresses {
            self.connect_server(address)?;
        }
        Ok(())
    }

    /// Tears down a connection. Returns `false` if it was already gone.
    pub fn close_server(&mut self, id: ConnectionId) -> bool {
        let Some(index) = self.connections.iter().position(|conn| conn.id == id) else {
            return false;
        };
        let connection = self.connections.remove(index);
        if let Some(multiplexer) = self.multiplexer.as_mut()
            && let Err(error) = multiplexer.remove(connection.secondary.as_fd())
        {
            warn!(
                target: REGISTRY_TARGET,
                server = %connection.address,
                error = %error,
                "failed to unwatch command socket"
            );
        }
        let ServerConnection {
            address,
            primary,
            secondary,
            ..
        } = connection;
        drop(primary);
        drop(secondary);
        info!(
            target: REGISTRY_TARGET,
            server = %address,
            connection = %id,
            "disconnected from server"
        );
        self.reporter.server_disconnected(&address, id);
        true
    }

    /// Replaces a connection with a fresh one to the same address.
    ///
    /// Returns `Ok(None)` if the connection was already gone.
    pub fn reconnect_server(
        &mut self,
        id: ConnectionId,
    ) -> Result<Option<ConnectionId>, RegistryError> {
        let Some(address) = self.get(id).map(|conn| conn.address.clone()) else {
            return Ok(None);
        };
        warn!(
            target: REGISTRY_TARGET,
            server = %address,
            connection = %id,
            "reconnecting to server"
        );
        self.close_server(id);
        self.connect_server(&address).map(Some)
    }

    /// Closes every connection, the multiplexer, and drains `queue`.
    ///
    /// Returns the number of commands discarded from the queue. Calling it
    /// again is harmless.
    pub fn close_all(&mut self, queue: &mut CommandQueue) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|conn| conn.id).collect();
        for id in ids {
            self.close_server(id);
        }
        if let Some(multiplexer) = self.multiplexer.take() {
            multiplexer.destroy();
        }
        let dropped = queue.drain();
        self.reporter.servers_closed(dropped);
        dropped
    }

    /// Finds the connection whose secondary socket is `fd`.
    #[must_use]
    pub fn find_by_descriptor(&self, fd: RawFd) -> Option<ConnectionId> {
        self.connections
            .iter()
            .find(|conn| conn.secondary_fd() == fd)
            .map(|conn| conn.id)
    }

    /// Looks up a live connection.
    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&ServerConnection> {
        self.connections.iter().find(|conn| conn.id == id)
    }

    /// Looks up a live connection mutably.
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut ServerConnection> {
        self.connections.iter_mut().find(|conn| conn.id == id)
    }

    /// Live connection ids in connection order.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|conn| conn.id).collect()
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connection is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Whether [`Self::close_all`] has run.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.multiplexer.is_none()
    }

    /// Waits for secondary sockets to become ready.
    pub fn wait(
        &mut self,
        timeout: Option<Duration>,
        mask: &SigSet,
    ) -> Result<Vec<Readiness>, MultiplexError> {
        match self.multiplexer.as_mut() {
            Some(multiplexer) => multiplexer.wait(timeout, mask),
            None => Err(MultiplexError::Wait {
                source: nix::errno::Errno::EBADF,
            }),
        }
    }

    /// Mutable access to the connector, e.g. to apply a reloaded allow-list.
    pub const fn connector_mut(&mut self) -> &mut C {
        &mut self.connector
    }

    #[cfg(test)]
    pub(crate) fn multiplexer(&self) -> Option<&Multiplexer> {
        self.multiplexer.as_ref()
    }

    /// One connection attempt; `Ok(None)` means try again later.
    fn attempt(
        &self,
        address: &ServerAddress,
        channel: Channel,
    ) -> Result<Option<TcpStream>, RegistryError> {
        match self.connector.connect(address, channel) {
            Ok(stream) => Ok(Some(stream)),
            Err(error) if error.is_fatal() => {
                self.reporter.server_rejected(&error);
                Err(RegistryError::Rejected { source: error })
            }
            Err(error) => {
                warn!(
                    target: REGISTRY_TARGET,
                    server = %address,
                    channel = %channel,
                    error = %error,
                    retry_ms = self.settings.retry.as_millis(),
                    "server connection attempt failed"
                );
                Ok(None)
            }
        }
    }

    /// Sleeps out the retry pause in slices, giving up on shutdown.
    fn pause(&self, address: &ServerAddress) -> Result<(), RegistryError> {
        let deadline = Instant::now() + self.settings.retry;
        loop {
            if self.signals.terminate_requested() {
                return Err(RegistryError::Cancelled {
                    address: address.to_string(),
                });
            }
            match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => {
                    sleep_with_signals_open(remaining.min(RETRY_SLICE));
                }
                _ => return Ok(()),
            }
        }
    }
}
