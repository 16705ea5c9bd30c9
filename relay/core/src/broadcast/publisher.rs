//! Broadcast Publisher
//!
//! Binds a publish socket and fans every message out to whoever is
//! subscribed at that moment. Delivery is at-most-once: with nobody
//! connected the message is simply gone.

use serde::Serialize;
use tracing::{debug, info};

use crate::messages::BroadcastMessage;
use crate::transport::{frame, Address, BusSocket, SocketPattern, TransportError};

/// Producer side of the broadcast channel
#[derive(Debug)]
pub struct Publisher {
    address: Address,
    socket: Option<BusSocket>,
    sent: u64,
}

impl Publisher {
    /// Bind a publish socket at `address`
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if the endpoint cannot be bound.
    pub async fn bind(address: &Address) -> Result<Self, TransportError> {
        let socket = BusSocket::bind(SocketPattern::Publish, address).await?;
        let address = socket.address().clone();
        info!(endpoint = %address, "Broadcast publisher ready");

        Ok(Self {
            address,
            socket: Some(socket),
            sent: 0,
        })
    }

    /// Address the publisher is bound to
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Number of messages handed to the bus so far
    #[must_use]
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Whether [`Publisher::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.socket.is_none()
    }

    /// Publish `payload` under `header`
    ///
    /// Never waits for subscribers and does not fail because none are
    /// connected.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Closed`] after [`Publisher::close`]
    /// - [`TransportError::SerializationError`] if `payload` cannot be
    ///   represented as JSON
    /// - [`TransportError::SendFailed`] if the bus rejects the message
    pub async fn send<T: Serialize + ?Sized>(
        &mut self,
        header: &str,
        payload: &T,
    ) -> Result<(), TransportError> {
        let socket = self.socket.as_mut().ok_or(TransportError::Closed)?;

        let payload = serde_json::to_value(payload)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        let bytes = frame::encode(&BroadcastMessage::new(header, payload))?;

        socket.send(bytes).await?;
        self.sent += 1;
        debug!(header, seq = self.sent, "Broadcast sent");
        Ok(())
    }

    /// Release the socket; later sends fail with [`TransportError::Closed`]
    pub fn close(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
            info!(endpoint = %self.address, sent = self.sent, "Broadcast publisher closed");
        }
    }
}
