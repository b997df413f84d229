//! Opens and registers individual server sockets.

use std::env;
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use nix::unistd::{User, getuid};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use thiserror::Error;

use schedd_config::{ClientAllowList, ServerAddress};

use crate::codec::{HandshakeError, read_registration_reply, write_registration_request};

pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Which of the two sockets of a server connection is being opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Synchronous request/reply socket.
    Primary,
    /// Socket the server pushes commands on.
    Secondary,
}

impl fmt::Display for Channel {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        })
    }
}

/// Errors raised by a single connection attempt.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The address did not resolve.
    #[error("failed to resolve {address}: {source}")]
    Resolve {
        /// Server address.
        address: String,
        /// Underlying resolver error.
        #[source]
        source: io::Error,
    },
    /// The TCP connection could not be established.
    #[error("failed to connect to {address}: {source}")]
    Transport {
        /// Server address.
        address: String,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The peer is not on the client allow-list.
    #[error("peer {peer} for {address} is not a permitted server")]
    NotPermitted {
        /// Server address.
        address: String,
        /// Resolved peer address.
        peer: SocketAddr,
    },
    /// The registration exchange failed in transit.
    #[error("registration with {address} failed: {source}")]
    Handshake {
        /// Server address.
        address: String,
        /// Underlying handshake error.
        #[source]
        source: HandshakeError,
    },
    /// The server refused the registration.
    #[error("server {address} rejected registration with code {code}: {message}")]
    Rejected {
        /// Server address.
        address: String,
        /// Status code from the reply.
        code: i32,
        /// Error text from the reply.
        message: String,
    },
}

impl ConnectError {
    /// Whether retrying cannot help.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Opens one registered socket to a server.
pub trait Connector {
    /// Connects `channel` of the server at `address` and registers on it.
    fn connect(&self, address: &ServerAddress, channel: Channel)
    -> Result<TcpStream, ConnectError>;

    /// Installs a reloaded client allow-list. The default ignores it.
    fn update_allow_list(&mut self, allow_list: ClientAllowList) {
        drop(allow_list);
    }
}

/// Connector speaking the registration protocol over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    scheduler_name: String,
    user: String,
    allow_list: ClientAllowList,
    timeout: Duration,
}

impl TcpConnector {
    /// Builds a connector registering as `scheduler_name`.
    ///
    /// An empty allow-list admits every peer.
    #[must_use]
    pub fn new(scheduler_name: impl Into<String>, allow_list: ClientAllowList) -> Self {
        Self {
            scheduler_name: scheduler_name.into(),
            user: current_user(),
            allow_list,
            timeout: CONNECT_TIMEOUT,
        }
    }

    /// Overrides the TCP connect timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// User name sent in registration requests.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    fn open(&self, address: &ServerAddress) -> Result<TcpStream, ConnectError> {
        let display = address.to_string();
        let resolved = (address.host(), address.port())
            .to_socket_addrs()
            .map_err(|source| ConnectError::Resolve {
                address: display.clone(),
                source,
            })?;
        let mut last_error =
            io::Error::new(io::ErrorKind::AddrNotAvailable, "no resolved addresses");
        for peer in resolved {
            if !self.allow_list.is_empty() && !self.allow_list.permits(peer.ip()) {
                return Err(ConnectError::NotPermitted {
                    address: display,
                    peer,
                });
            }
            match self.open_socket(peer) {
                Ok(stream) => return Ok(stream),
                Err(error) => last_error = error,
            }
        }
        Err(ConnectError::Transport {
            address: display,
            source: last_error,
        })
    }

    fn open_socket(&self, peer: SocketAddr) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(peer), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nodelay(true)?;
        socket.set_keepalive(true)?;
        socket.connect_timeout(&SockAddr::from(peer), self.timeout)?;
        Ok(socket.into())
    }
}

impl Connector for TcpConnector {
    fn connect(
        &self,
        address: &ServerAddress,
        channel: Channel,
    ) -> Result<TcpStream, ConnectError> {
        let mut stream = self.open(address)?;
        let transport = |source| ConnectError::Transport {
            address: address.to_string(),
            source,
        };
        let handshake = |source| ConnectError::Handshake {
            address: address.to_string(),
            source,
        };
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(transport)?;
        write_registration_request(&mut stream, &self.user, &self.scheduler_name)
            .map_err(handshake)?;
        let reply = read_registration_reply(&mut stream).map_err(handshake)?;
        stream.set_read_timeout(None).map_err(transport)?;
        if !reply.is_accepted() {
            return Err(ConnectError::Rejected {
                address: address.to_string(),
                code: reply.status,
                message: reply.message,
            });
        }
        tracing::debug!(
            target: super::REGISTRY_TARGET,
            server = %address,
            channel = %channel,
            aux = reply.aux,
            "registration accepted"
        );
        Ok(stream)
    }

    fn update_allow_list(&mut self, allow_list: ClientAllowList) {
        self.allow_list = allow_list;
    }
}

/// Name of the user the scheduler runs as.
fn current_user() -> String {
    match User::from_uid(getuid()) {
        Ok(Some(user)) => user.name,
        _ => env::var("USER").unwrap_or_else(|_| getuid().to_string()),
    }
}
