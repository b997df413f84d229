//! Client allow-list file parsing.
//!
//! The file is line oriented. Blank lines and `#` comments are skipped,
//! `$clienthost <host>` admits every address the host resolves to, and other
//! `$` directives are recorded as ignored so the caller can warn about them.
//! Anything else is rejected.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::net::{IpAddr, ToSocketAddrs};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

const CLIENT_HOST_DIRECTIVE: &str = "clienthost";

/// Set of peer addresses permitted to act as batch servers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientAllowList {
    addresses: BTreeSet<IpAddr>,
    ignored: Vec<String>,
}

impl ClientAllowList {
    /// Builds an empty allow-list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads and parses an allow-list file.
    pub fn load(path: &Utf8Path) -> Result<Self, ClientListError> {
        let text = fs::read_to_string(path).map_err(|source| ClientListError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut list = Self::new();
        list.extend_from_text(path, &text)?;
        Ok(list)
    }

    /// Parses allow-list text, attributing errors to `origin`.
    pub fn extend_from_text(&mut self, origin: &Utf8Path, text: &str) -> Result<(), ClientListError> {
        for (index, raw) in text.lines().enumerate() {
            let line_number = index + 1;
            let line = raw.trim_end();
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let Some(directive_line) = line.strip_prefix('$') else {
                return Err(ClientListError::InvalidLine {
                    path: origin.to_path_buf(),
                    line: line_number,
                });
            };
            let mut tokens = directive_line.split_whitespace();
            let directive = tokens.next().unwrap_or_default();
            if directive != CLIENT_HOST_DIRECTIVE {
                self.ignored.push(directive.to_owned());
                continue;
            }
            let host = tokens.next().ok_or_else(|| ClientListError::MissingHost {
                path: origin.to_path_buf(),
                line: line_number,
            })?;
            self.add_host(host)?;
        }
        Ok(())
    }

    /// Admits every address `host` resolves to.
    pub fn add_host(&mut self, host: &str) -> Result<(), ClientListError> {
        let resolved = (host, 0)
            .to_socket_addrs()
            .map_err(|source| ClientListError::Resolve {
                host: host.to_owned(),
                source,
            })?;
        let addresses: Vec<IpAddr> = resolved.map(|addr| addr.ip()).collect();
        if addresses.is_empty() {
            return Err(ClientListError::Unresolved {
                host: host.to_owned(),
            });
        }
        self.addresses.extend(addresses);
        Ok(())
    }

    /// Admits a literal address.
    pub fn add_address(&mut self, address: IpAddr) {
        self.addresses.insert(address);
    }

    /// Folds another list into this one, keeping both sets of ignored
    /// directives.
    pub fn merge(&mut self, other: Self) {
        self.addresses.extend(other.addresses);
        self.ignored.extend(other.ignored);
    }

    /// Whether `address` may act as a batch server.
    #[must_use]
    pub fn permits(&self, address: IpAddr) -> bool {
        self.addresses.contains(&address) || self.addresses.contains(&address.to_canonical())
    }

    /// Number of admitted addresses.
    #[must_use]
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether no address has been admitted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Directives that were present in the file but not understood.
    #[must_use]
    pub fn ignored_directives(&self) -> &[String] {
        &self.ignored
    }
}

/// Errors raised while loading the client allow-list.
#[derive(Debug, Error)]
pub enum ClientListError {
    /// The file could not be read.
    #[error("failed to read client list '{path}': {source}")]
    Read {
        /// File path.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// A line was neither a comment nor a directive.
    #[error("invalid line {line} in client list '{path}'")]
    InvalidLine {
        /// File path.
        path: Utf8PathBuf,
        /// One-based line number.
        line: usize,
    },
    /// `$clienthost` appeared without a host.
    #[error("missing host after $clienthost on line {line} of '{path}'")]
    MissingHost {
        /// File path.
        path: Utf8PathBuf,
        /// One-based line number.
        line: usize,
    },
    /// Host name lookup failed.
    #[error("host {host} not found: {source}")]
    Resolve {
        /// Host that failed to resolve.
        host: String,
        /// Underlying resolver error.
        #[source]
        source: io::Error,
    },
    /// Host name lookup returned no addresses.
    #[error("host {host} resolved to no addresses")]
    Unresolved {
        /// Host that resolved to nothing.
        host: String,
    },
}
