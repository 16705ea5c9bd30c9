//! Transport Layer
//!
//! Thin layer over the message bus used by every other component:
//! - [`Address`]: validated `scheme://host:port` endpoints
//! - [`BusSocket`]: request/reply and publish/subscribe sockets with
//!   bind, connect, send and bounded polling
//! - [`frame`]: checksummed, length-prefixed JSON frames
//!
//! # Failure Policy
//!
//! Malformed addresses and busy ports fail at bind/connect time and are
//! returned to the caller. Errors while polling are returned too, but the
//! long-running loops built on top log them and keep going.

pub mod address;
pub mod config;
pub mod error;
pub mod frame;
pub mod socket;

// Re-exports for convenience
pub use address::{Address, DEFAULT_BROADCAST_PORT, DEFAULT_PROXY_PORT};
pub use config::TransportConfig;
pub use error::TransportError;
pub use socket::{poll_any, BusSocket, SocketPattern};
