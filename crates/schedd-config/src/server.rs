use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::defaults::DEFAULT_SERVER_PORT;

/// Address of a batch server in `host[:port]` form.
///
/// The canonical `host:port` rendering is the identity of a server
/// connection: reconnecting to a server always reuses it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct ServerAddress {
    host: String,
    port: u16,
}

impl ServerAddress {
    /// Builds an address from its parts.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Host name or literal IP address.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(formatter, "[{}]:{}", self.host, self.port)
        } else {
            write!(formatter, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ServerAddress {
    type Err = ServerAddressError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ServerAddressError::Empty);
        }

        if let Some(rest) = trimmed.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| ServerAddressError::UnclosedBracket(input.to_owned()))?;
            let port = match tail {
                "" => DEFAULT_SERVER_PORT,
                other => match other.strip_prefix(':') {
                    Some(port) => parse_port(input, port)?,
                    None => return Err(ServerAddressError::TrailingText(input.to_owned())),
                },
            };
            return build(input, host, port);
        }

        // More than one colon without brackets is a bare IPv6 literal.
        if trimmed.matches(':').count() > 1 {
            return build(input, trimmed, DEFAULT_SERVER_PORT);
        }

        match trimmed.split_once(':') {
            Some((host, port)) => build(input, host, parse_port(input, port)?),
            None => build(input, trimmed, DEFAULT_SERVER_PORT),
        }
    }
}

impl TryFrom<String> for ServerAddress {
    type Error = ServerAddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ServerAddress> for String {
    fn from(value: ServerAddress) -> Self {
        value.to_string()
    }
}

fn build(input: &str, host: &str, port: u16) -> Result<ServerAddress, ServerAddressError> {
    if host.is_empty() {
        return Err(ServerAddressError::MissingHost(input.to_owned()));
    }
    Ok(ServerAddress::new(host, port))
}

fn parse_port(input: &str, port: &str) -> Result<u16, ServerAddressError> {
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(ServerAddressError::InvalidPort {
            address: input.to_owned(),
            port: port.to_owned(),
        }),
        Ok(value) => Ok(value),
    }
}

/// Errors encountered while parsing a [`ServerAddress`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServerAddressError {
    /// The address was blank.
    #[error("server address is empty")]
    Empty,
    /// The host part was missing.
    #[error("missing host in server address '{0}'")]
    MissingHost(String),
    /// The port was not a number in `1..=65535`.
    #[error("invalid port '{port}' in server address '{address}'")]
    InvalidPort {
        /// Address as written.
        address: String,
        /// Offending port text.
        port: String,
    },
    /// An IPv6 literal opened a bracket without closing it.
    #[error("unclosed '[' in server address '{0}'")]
    UnclosedBracket(String),
    /// Text followed the closing bracket of an IPv6 literal.
    #[error("unexpected text after ']' in server address '{0}'")]
    TrailingText(String),
}
