//! Endpoint Addresses
//!
//! Addresses take the form `scheme://host:port` (TCP) or `scheme://path`
//! (IPC). They are validated up front so that a typo fails at bind/connect
//! time with a clear error instead of deep inside the bus.
//!
//! # Wildcard Host
//!
//! `tcp://*:8123` means "every interface" when binding. When the same
//! address is used to connect, the wildcard resolves to loopback.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::TransportError;

/// Default port for the object proxy service
pub const DEFAULT_PROXY_PORT: u16 = 8123;

/// Default port for the broadcast channel
pub const DEFAULT_BROADCAST_PORT: u16 = 8765;

const WILDCARD_HOST: &str = "*";
const ANY_IPV4: &str = "0.0.0.0";
const LOOPBACK_IPV4: &str = "127.0.0.1";

/// A validated bus endpoint
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    /// TCP endpoint
    Tcp {
        /// Host name, IP literal, or `*`
        host: String,
        /// Port (0 asks the OS for an ephemeral port when binding)
        port: u16,
    },
    /// Local IPC endpoint (Unix domain socket path)
    Ipc {
        /// Filesystem path of the socket
        path: PathBuf,
    },
}

impl Address {
    /// TCP address for `host:port`
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// Loopback TCP address on the given port
    #[must_use]
    pub fn localhost(port: u16) -> Self {
        Self::tcp(LOOPBACK_IPV4, port)
    }

    /// Default proxy endpoint (`tcp://127.0.0.1:8123`)
    #[must_use]
    pub fn default_proxy() -> Self {
        Self::localhost(DEFAULT_PROXY_PORT)
    }

    /// Default broadcast endpoint (`tcp://127.0.0.1:8765`)
    #[must_use]
    pub fn default_broadcast() -> Self {
        Self::localhost(DEFAULT_BROADCAST_PORT)
    }

    /// Port of a TCP address
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => Some(*port),
            Self::Ipc { .. } => None,
        }
    }

    /// Endpoint string to hand to the bus when binding
    #[must_use]
    pub fn bind_endpoint(&self) -> String {
        match self {
            Self::Tcp { host, port } if host == WILDCARD_HOST => {
                format!("tcp://{ANY_IPV4}:{port}")
            }
            _ => self.to_string(),
        }
    }

    /// Endpoint string to hand to the bus when connecting
    #[must_use]
    pub fn connect_endpoint(&self) -> String {
        match self {
            Self::Tcp { host, port } if host == WILDCARD_HOST || host == ANY_IPV4 => {
                format!("tcp://{LOOPBACK_IPV4}:{port}")
            }
            _ => self.to_string(),
        }
    }

    /// Parse and validate an address string
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] when the scheme is missing
    /// or unsupported, the host is empty, or the port is not a valid `u16`.
    pub fn parse(input: &str) -> Result<Self, TransportError> {
        let trimmed = input.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| TransportError::invalid_address(input, "missing scheme (expected scheme://...)"))?;

        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => Self::parse_tcp(input, rest),
            "ipc" => {
                if rest.is_empty() {
                    return Err(TransportError::invalid_address(input, "empty ipc path"));
                }
                Ok(Self::Ipc {
                    path: PathBuf::from(rest),
                })
            }
            other => Err(TransportError::invalid_address(
                input,
                format!("unsupported scheme '{other}'"),
            )),
        }
    }

    fn parse_tcp(input: &str, rest: &str) -> Result<Self, TransportError> {
        // Bracketed IPv6 literal: [::1]:8123
        let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
            let (host, after) = stripped
                .split_once(']')
                .ok_or_else(|| TransportError::invalid_address(input, "unterminated IPv6 literal"))?;
            let port = after
                .strip_prefix(':')
                .ok_or_else(|| TransportError::invalid_address(input, "missing port"))?;
            (host, port)
        } else {
            rest.rsplit_once(':')
                .ok_or_else(|| TransportError::invalid_address(input, "missing port"))?
        };

        if host.is_empty() {
            return Err(TransportError::invalid_address(input, "empty host"));
        }

        let port = port
            .parse::<u16>()
            .map_err(|_| TransportError::invalid_address(input, format!("invalid port '{port}'")))?;

        Ok(Self::Tcp {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } if host.contains(':') => write!(f, "tcp://[{host}]:{port}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Ipc { path } => write!(f, "ipc://{}", path.display()),
        }
    }
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}
