//! Bus Sockets
//!
//! [`BusSocket`] wraps the four socket patterns this crate uses behind one
//! type with a uniform bind/connect/send/poll surface:
//!
//! | Pattern     | Side      | Sends | Receives |
//! |-------------|-----------|-------|----------|
//! | `Request`   | client    | yes   | yes      |
//! | `Reply`     | server    | yes   | yes      |
//! | `Publish`   | producer  | yes   | no       |
//! | `Subscribe` | consumer  | no    | yes      |
//!
//! Request/reply sockets are strictly lock-step: one request, then one
//! reply. The bus enforces this; callers that lose track (for example after
//! a timeout) must drop the socket and connect a fresh one.
//!
//! # Polling
//!
//! [`BusSocket::poll`] waits for one message with an optional bound and
//! returns `Ok(None)` when the bound elapses. [`poll_any`] does the same
//! across several sockets and reports which one became readable.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};
use zeromq::{
    PubSocket, RepSocket, ReqSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqError,
    ZmqMessage,
};

use super::{Address, TransportError};

/// Messaging pattern of a socket
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SocketPattern {
    /// Client side of request/reply
    Request,
    /// Server side of request/reply
    Reply,
    /// Producer side of publish/subscribe
    Publish,
    /// Consumer side of publish/subscribe
    Subscribe,
}

impl SocketPattern {
    /// Whether sockets of this pattern can send
    #[must_use]
    pub fn can_send(self) -> bool {
        !matches!(self, Self::Subscribe)
    }

    /// Whether sockets of this pattern can receive
    #[must_use]
    pub fn can_recv(self) -> bool {
        !matches!(self, Self::Publish)
    }
}

impl fmt::Display for SocketPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Request => "REQ",
            Self::Reply => "REP",
            Self::Publish => "PUB",
            Self::Subscribe => "SUB",
        };
        f.write_str(name)
    }
}

enum Inner {
    Request(ReqSocket),
    Reply(RepSocket),
    Publish(PubSocket),
    Subscribe(SubSocket),
}

impl Inner {
    fn new(pattern: SocketPattern) -> Self {
        match pattern {
            SocketPattern::Request => Self::Request(ReqSocket::new()),
            SocketPattern::Reply => Self::Reply(RepSocket::new()),
            SocketPattern::Publish => Self::Publish(PubSocket::new()),
            SocketPattern::Subscribe => Self::Subscribe(SubSocket::new()),
        }
    }

    async fn bind(&mut self, endpoint: &str) -> Result<zeromq::Endpoint, ZmqError> {
        match self {
            Self::Request(s) => s.bind(endpoint).await,
            Self::Reply(s) => s.bind(endpoint).await,
            Self::Publish(s) => s.bind(endpoint).await,
            Self::Subscribe(s) => s.bind(endpoint).await,
        }
    }

    async fn connect(&mut self, endpoint: &str) -> Result<(), ZmqError> {
        match self {
            Self::Request(s) => s.connect(endpoint).await,
            Self::Reply(s) => s.connect(endpoint).await,
            Self::Publish(s) => s.connect(endpoint).await,
            Self::Subscribe(s) => {
                s.connect(endpoint).await?;
                // No topic filtering: every message is delivered
                s.subscribe("").await
            }
        }
    }
}

/// A connected or bound bus socket
pub struct BusSocket {
    pattern: SocketPattern,
    address: Address,
    inner: Inner,
}

impl fmt::Debug for BusSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BusSocket")
            .field("pattern", &self.pattern)
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl BusSocket {
    /// Bind a socket of the given pattern to a local address
    ///
    /// The returned socket reports the address actually bound, which
    /// differs from the requested one when port 0 was asked for.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::BindFailed`] if the bus refuses the
    /// endpoint (port in use, unsupported transport, ...).
    pub async fn bind(pattern: SocketPattern, address: &Address) -> Result<Self, TransportError> {
        let mut inner = Inner::new(pattern);
        let endpoint = address.bind_endpoint();

        let bound = inner
            .bind(&endpoint)
            .await
            .map_err(|e| TransportError::BindFailed {
                endpoint: address.to_string(),
                reason: e.to_string(),
            })?;

        let address = Address::parse(&bound.to_string()).unwrap_or_else(|_| address.clone());
        info!(pattern = %pattern, endpoint = %address, "Socket bound");

        Ok(Self {
            pattern,
            address,
            inner,
        })
    }

    /// Connect a socket of the given pattern to a remote address
    ///
    /// Subscribe sockets are subscribed to every topic once connected.
    ///
    /// # Errors
    ///
    /// - [`TransportError::ConnectTimeout`] if the peer did not accept the
    ///   connection within `connect_timeout`
    /// - [`TransportError::ConnectionFailed`] for any other bus error
    pub async fn connect(
        pattern: SocketPattern,
        address: &Address,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let mut inner = Inner::new(pattern);
        let endpoint = address.connect_endpoint();

        match tokio::time::timeout(connect_timeout, inner.connect(&endpoint)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(TransportError::ConnectionFailed(format!("{endpoint}: {e}")));
            }
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    endpoint,
                    timeout_ms: u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }

        debug!(pattern = %pattern, endpoint = %endpoint, "Socket connected");

        Ok(Self {
            pattern,
            address: address.clone(),
            inner,
        })
    }

    /// Pattern of this socket
    #[must_use]
    pub fn pattern(&self) -> SocketPattern {
        self.pattern
    }

    /// Address this socket is bound or connected to
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Send one frame as a single bus message
    ///
    /// # Errors
    ///
    /// - [`TransportError::InvalidState`] on a subscribe socket
    /// - [`TransportError::SendFailed`] if the bus rejects the message
    ///   (no connected peer, request already outstanding, ...)
    pub async fn send(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        let message = ZmqMessage::from(frame);
        let result = match &mut self.inner {
            Inner::Request(s) => s.send(message).await,
            Inner::Reply(s) => s.send(message).await,
            Inner::Publish(s) => s.send(message).await,
            Inner::Subscribe(_) => {
                return Err(TransportError::InvalidState(format!(
                    "{} socket cannot send",
                    self.pattern
                )));
            }
        };
        result.map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    /// Wait for the next message and return its single frame
    ///
    /// # Errors
    ///
    /// - [`TransportError::InvalidState`] on a publish socket
    /// - [`TransportError::RecvFailed`] if the bus reports an error
    /// - [`TransportError::SerializationError`] if the message is empty or
    ///   has more than one frame
    pub async fn recv(&mut self) -> Result<Vec<u8>, TransportError> {
        let result = match &mut self.inner {
            Inner::Request(s) => s.recv().await,
            Inner::Reply(s) => s.recv().await,
            Inner::Subscribe(s) => s.recv().await,
            Inner::Publish(_) => {
                return Err(TransportError::InvalidState(format!(
                    "{} socket cannot receive",
                    self.pattern
                )));
            }
        };

        let message = result.map_err(|e| TransportError::RecvFailed(e.to_string()))?;
        single_frame(&message)
    }

    /// Wait for a message for at most `timeout`
    ///
    /// `None` waits without bound. Returns `Ok(None)` when the timeout
    /// elapses with nothing received.
    ///
    /// # Errors
    ///
    /// Same as [`BusSocket::recv`].
    pub async fn poll(&mut self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>, TransportError> {
        match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.recv()).await {
                Ok(frame) => frame.map(Some),
                Err(_) => Ok(None),
            },
            None => self.recv().await.map(Some),
        }
    }

    /// Wait for a message until `deadline`
    ///
    /// # Errors
    ///
    /// Same as [`BusSocket::recv`].
    pub async fn poll_until(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>, TransportError> {
        match tokio::time::timeout_at(deadline, self.recv()).await {
            Ok(frame) => frame.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Release the socket
    ///
    /// Dropping has the same effect; this exists so teardown reads
    /// explicitly at call sites and is logged.
    pub fn close(self) {
        debug!(pattern = %self.pattern, endpoint = %self.address, "Socket closed");
    }
}

fn single_frame(message: &ZmqMessage) -> Result<Vec<u8>, TransportError> {
    let first = message
        .get(0)
        .ok_or_else(|| TransportError::SerializationError("empty message".to_string()))?;

    if message.get(1).is_some() {
        return Err(TransportError::SerializationError(
            "expected a single-frame message".to_string(),
        ));
    }

    Ok(first.to_vec())
}

/// Wait until any of `sockets` has a message
///
/// Returns the index of the readable socket together with its frame, or
/// `Ok(None)` if `timeout` elapses first. `None` waits without bound.
///
/// # Errors
///
/// - [`TransportError::InvalidState`] when `sockets` is empty
/// - whatever the first socket to complete reports
pub async fn poll_any(
    sockets: &mut [BusSocket],
    timeout: Option<Duration>,
) -> Result<Option<(usize, Vec<u8>)>, TransportError> {
    if sockets.is_empty() {
        return Err(TransportError::InvalidState(
            "poll_any needs at least one socket".to_string(),
        ));
    }

    let receives = futures::future::select_all(sockets.iter_mut().map(|s| Box::pin(s.recv())));

    let (result, index, _pending) = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, receives).await {
            Ok(ready) => ready,
            Err(_) => return Ok(None),
        },
        None => receives.await,
    };

    result.map(|frame| Some((index, frame)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral() -> Address {
        Address::localhost(0)
    }

    #[test]
    fn test_pattern_capabilities() {
        assert!(SocketPattern::Request.can_send());
        assert!(SocketPattern::Request.can_recv());
        assert!(SocketPattern::Publish.can_send());
        assert!(!SocketPattern::Publish.can_recv());
        assert!(!SocketPattern::Subscribe.can_send());
        assert!(SocketPattern::Subscribe.can_recv());
        assert_eq!(SocketPattern::Reply.to_string(), "REP");
    }

    #[tokio::test]
    async fn test_bind_reports_ephemeral_port() {
        let socket = BusSocket::bind(SocketPattern::Reply, &ephemeral())
            .await
            .unwrap();

        let port = socket.address().port().unwrap();
        assert_ne!(port, 0);
        assert_eq!(socket.pattern(), SocketPattern::Reply);
    }

    #[tokio::test]
    async fn test_bind_port_in_use_fails() {
        let first = BusSocket::bind(SocketPattern::Reply, &ephemeral())
            .await
            .unwrap();

        let result = BusSocket::bind(SocketPattern::Reply, first.address()).await;
        assert!(matches!(result, Err(TransportError::BindFailed { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_request_reply_exchange() {
        let mut server = BusSocket::bind(SocketPattern::Reply, &ephemeral())
            .await
            .unwrap();
        let address = server.address().clone();

        let mut client =
            BusSocket::connect(SocketPattern::Request, &address, Duration::from_secs(2))
                .await
                .unwrap();

        client.send(b"ping".to_vec()).await.unwrap();

        let request = server
            .poll(Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request, b"ping");

        server.send(b"pong".to_vec()).await.unwrap();

        let reply = client
            .poll(Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, b"pong");
    }

    #[tokio::test]
    async fn test_poll_times_out_empty() {
        let mut server = BusSocket::bind(SocketPattern::Reply, &ephemeral())
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let result = server.poll(Some(Duration::from_millis(50))).await.unwrap();

        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(45));
    }

    #[tokio::test]
    async fn test_wrong_direction_is_invalid_state() {
        let mut publisher = BusSocket::bind(SocketPattern::Publish, &ephemeral())
            .await
            .unwrap();

        let result = publisher.recv().await;
        assert!(matches!(result, Err(TransportError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_connect_times_out_without_peer() {
        // Reserve a port, then free it so nothing is listening there
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let result = BusSocket::connect(
            SocketPattern::Request,
            &Address::localhost(port),
            Duration::from_millis(100),
        )
        .await;

        assert!(matches!(
            result,
            Err(TransportError::ConnectTimeout { .. }) | Err(TransportError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_poll_any_rejects_empty_set() {
        let result = poll_any(&mut [], Some(Duration::from_millis(10))).await;
        assert!(matches!(result, Err(TransportError::InvalidState(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_poll_any_reports_ready_socket() {
        let quiet = BusSocket::bind(SocketPattern::Reply, &ephemeral())
            .await
            .unwrap();
        let busy = BusSocket::bind(SocketPattern::Reply, &ephemeral())
            .await
            .unwrap();
        let busy_address = busy.address().clone();

        let mut client =
            BusSocket::connect(SocketPattern::Request, &busy_address, Duration::from_secs(2))
                .await
                .unwrap();
        client.send(b"hello".to_vec()).await.unwrap();

        let mut sockets = [quiet, busy];
        let ready = poll_any(&mut sockets, Some(Duration::from_secs(2)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(ready, (1, b"hello".to_vec()));
    }
}
