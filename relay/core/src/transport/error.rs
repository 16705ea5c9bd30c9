//! Transport Errors
//!
//! Every socket-level failure in the crate surfaces as a [`TransportError`].
//! Higher layers wrap it (`RequestError`, `ProxyError`) rather than
//! flattening it to strings, so callers can still match on the cause.

use thiserror::Error;

/// Errors raised by the transport layer
#[derive(Debug, Error)]
pub enum TransportError {
    /// The address string could not be parsed
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress {
        /// The address as given
        address: String,
        /// Why it was rejected
        reason: String,
    },

    /// Binding a socket to a local endpoint failed
    #[error("Failed to bind {endpoint}: {reason}")]
    BindFailed {
        /// Endpoint we tried to bind
        endpoint: String,
        /// Underlying bus error
        reason: String,
    },

    /// Connecting to a remote endpoint failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connecting did not complete within the allowed time
    #[error("Timed out connecting to {endpoint} after {timeout_ms} ms")]
    ConnectTimeout {
        /// Endpoint we tried to reach
        endpoint: String,
        /// How long we waited
        timeout_ms: u64,
    },

    /// Writing a message to the bus failed
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Reading a message from the bus failed
    #[error("Receive failed: {0}")]
    RecvFailed(String),

    /// A payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Frame payload does not match its checksum
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Checksum carried in the frame header
        expected: u32,
        /// Checksum computed over the received payload
        actual: u32,
    },

    /// Envelope was produced by an incompatible protocol version
    #[error("Unsupported wire version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the envelope
        found: u16,
        /// Version this build speaks
        expected: u16,
    },

    /// Operation is not valid for the socket's pattern or state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The socket has been closed
    #[error("Socket closed")]
    Closed,
}

impl TransportError {
    /// Build an [`TransportError::InvalidAddress`]
    pub(crate) fn invalid_address(address: &str, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error means the message itself was bad, as opposed to
    /// the connection misbehaving
    #[must_use]
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::SerializationError(_)
                | Self::ChecksumMismatch { .. }
                | Self::UnsupportedVersion { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_classification() {
        assert!(TransportError::SerializationError("bad".into()).is_protocol_error());
        assert!(TransportError::ChecksumMismatch {
            expected: 1,
            actual: 2
        }
        .is_protocol_error());
        assert!(TransportError::UnsupportedVersion {
            found: 9,
            expected: 1
        }
        .is_protocol_error());
        assert!(!TransportError::Closed.is_protocol_error());
        assert!(!TransportError::ConnectionFailed("refused".into()).is_protocol_error());
    }

    #[test]
    fn test_display_names_endpoint() {
        let err = TransportError::ConnectTimeout {
            endpoint: "tcp://127.0.0.1:8123".into(),
            timeout_ms: 250,
        };
        let text = err.to_string();
        assert!(text.contains("tcp://127.0.0.1:8123"));
        assert!(text.contains("250"));
    }
}
