//! Transport Configuration
//!
//! Endpoints and socket-level timings shared by every component. Loaded
//! from file and environment by [`crate::config`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::Address;

/// Transport configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Endpoint of the object proxy service
    ///
    /// The server binds it; clients connect to it.
    pub proxy_address: Address,

    /// Endpoint of the broadcast channel
    ///
    /// The publisher binds it; subscribers connect to it.
    pub broadcast_address: Address,

    /// Connection timeout in milliseconds
    ///
    /// How long to wait for the bus handshake when connecting.
    pub connect_timeout_ms: u64,

    /// Server poll interval in milliseconds
    ///
    /// Upper bound on how long a server loop waits for a request before
    /// re-checking whether it has been asked to stop.
    pub poll_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            proxy_address: Address::default_proxy(),
            broadcast_address: Address::default_broadcast(),
            connect_timeout_ms: 1000,
            poll_interval_ms: 500,
        }
    }
}

impl TransportConfig {
    /// Connection timeout as a [`Duration`]
    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Server poll interval as a [`Duration`]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
