//! Reliable Request Client
//!
//! Request/reply with bounded retries ("Lazy Pirate"). A request/reply
//! socket is strictly lock-step, so once a reply goes missing the socket can
//! never be used again. On timeout the client therefore drops it, connects a
//! fresh one to the same endpoint and resends, up to `max_retries` attempts
//! in total. Then it gives up and reports the endpoint offline.
//!
//! # State Machine
//!
//! ```text
//!            send                  reply accepted
//!   Idle ──────────► AwaitingReply ───────────────► Idle
//!                      │     ▲
//!              timeout │     │ reconnect + resend (attempts left)
//!                      └─────┘
//!                      │
//!                      │ attempts exhausted
//!                      ▼
//!                    Failed
//! ```
//!
//! The retry budget belongs to one logical request; the next call starts
//! with the full budget again, including after a failure.

use std::fmt;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::transport::{frame, Address, BusSocket, SocketPattern, TransportError};

/// Errors from a reliable request
#[derive(Debug, Error)]
pub enum RequestError {
    /// Every attempt timed out
    #[error("Endpoint {endpoint} is offline: no reply after {attempts} attempts")]
    Offline {
        /// Endpoint that never answered
        endpoint: String,
        /// Attempts made before giving up
        attempts: u32,
    },

    /// The request could not be set up (bad address, unencodable payload)
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Retry settings are unusable
    #[error("Invalid retry policy: {0}")]
    InvalidPolicy(String),
}

/// Per-request retry settings
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long one attempt waits for its reply
    pub timeout: Duration,
    /// Total attempts before the endpoint is declared offline
    pub max_retries: u32,
    /// How long construction waits for the initial connection
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2500),
            max_retries: 3,
            connect_timeout: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the number of attempts
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the initial connection timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Upper bound on how long one logical request can take
    #[must_use]
    pub fn budget(&self) -> Duration {
        self.timeout.saturating_mul(self.max_retries)
    }

    /// Check the policy is usable
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::InvalidPolicy`] for zero retries or a zero
    /// timeout.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.max_retries == 0 {
            return Err(RequestError::InvalidPolicy(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(RequestError::InvalidPolicy(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if self.connect_timeout.is_zero() {
            return Err(RequestError::InvalidPolicy(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the client is in the request cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientState {
    /// No request outstanding
    Idle,
    /// A request was sent and its reply is pending
    AwaitingReply,
    /// The last request exhausted its retries
    Failed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::AwaitingReply => "awaiting_reply",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Diagnostic counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestStats {
    /// Logical requests started
    pub requests: u64,
    /// Replies accepted
    pub replies: u64,
    /// Attempts that ended without an accepted reply
    pub timeouts: u64,
    /// Sockets recycled after a timeout or a malformed reply
    pub reconnects: u64,
    /// Replies rejected by validation
    pub malformed: u64,
}

/// Request/reply client that survives an unresponsive peer
pub struct ReliableClient {
    endpoint: Address,
    policy: RetryPolicy,
    socket: Option<BusSocket>,
    state: ClientState,
    stats: RequestStats,
}

impl fmt::Debug for ReliableClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReliableClient")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state)
            .field("connected", &self.socket.is_some())
            .finish_non_exhaustive()
    }
}

impl ReliableClient {
    /// Create a client for `endpoint`
    ///
    /// Tries to connect within `policy.connect_timeout`. A peer that is not
    /// up yet is fine: the first request connects as part of its attempt.
    ///
    /// # Errors
    ///
    /// - [`RequestError::InvalidPolicy`] if the policy fails validation
    /// - [`RequestError::Transport`] if `endpoint` cannot be connected to
    ///   at all (port 0)
    pub async fn connect(endpoint: Address, policy: RetryPolicy) -> Result<Self, RequestError> {
        policy.validate()?;
        if endpoint.port() == Some(0) {
            return Err(TransportError::invalid_address(
                &endpoint.to_string(),
                "cannot connect to port 0",
            )
            .into());
        }

        let socket =
            match BusSocket::connect(SocketPattern::Request, &endpoint, policy.connect_timeout)
                .await
            {
                Ok(socket) => Some(socket),
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "Peer not reachable yet, deferring connect");
                    None
                }
            };

        Ok(Self {
            endpoint,
            policy,
            socket,
            state: ClientState::Idle,
            stats: RequestStats::default(),
        })
    }

    /// Endpoint requests are sent to
    #[must_use]
    pub fn endpoint(&self) -> &Address {
        &self.endpoint
    }

    /// Retry settings in use
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Counters since construction
    #[must_use]
    pub fn stats(&self) -> RequestStats {
        self.stats
    }

    /// Send `payload` and return the first reply `accept` takes
    ///
    /// `accept` sees every reply frame; returning `Err` marks the reply
    /// malformed. It is logged and the request is resent on a fresh socket
    /// within the same attempt.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError::Offline`] once every attempt has timed out.
    pub async fn send_with<T, F>(&mut self, payload: &[u8], mut accept: F) -> Result<T, RequestError>
    where
        F: FnMut(&[u8]) -> Result<T, TransportError>,
    {
        let max = self.policy.max_retries;
        self.stats.requests += 1;
        self.state = ClientState::AwaitingReply;

        for attempt in 1..=max {
            let deadline = Instant::now() + self.policy.timeout;

            if let Some(value) = self.attempt(payload, deadline, &mut accept).await {
                self.stats.replies += 1;
                self.state = ClientState::Idle;
                return Ok(value);
            }

            self.stats.timeouts += 1;
            warn!(
                endpoint = %self.endpoint,
                attempt,
                max_retries = max,
                "No reply within timeout"
            );

            // The lock-step exchange is broken; this socket is unusable now
            if let Some(socket) = self.socket.take() {
                socket.close();
            }
            if attempt < max {
                self.stats.reconnects += 1;
                info!(endpoint = %self.endpoint, "Reconnecting and resending");
            }
        }

        self.state = ClientState::Failed;
        error!(endpoint = %self.endpoint, attempts = max, "Endpoint offline, abandoning request");
        Err(RequestError::Offline {
            endpoint: self.endpoint.to_string(),
            attempts: max,
        })
    }

    /// Send a JSON-encoded request and decode the reply
    ///
    /// # Errors
    ///
    /// Same as [`ReliableClient::send_with`], plus
    /// [`RequestError::Transport`] if `request` cannot be encoded.
    pub async fn request<Req, Rep>(&mut self, request: &Req) -> Result<Rep, RequestError>
    where
        Req: Serialize,
        Rep: DeserializeOwned,
    {
        self.request_matching(request, |_: &Rep| true).await
    }

    /// Like [`ReliableClient::request`], but only replies for which
    /// `matches` holds are accepted
    ///
    /// # Errors
    ///
    /// Same as [`ReliableClient::request`].
    pub async fn request_matching<Req, Rep, M>(
        &mut self,
        request: &Req,
        matches: M,
    ) -> Result<Rep, RequestError>
    where
        Req: Serialize,
        Rep: DeserializeOwned,
        M: Fn(&Rep) -> bool,
    {
        let payload = frame::encode(request)?;
        self.send_with(&payload, |bytes| {
            let reply: Rep = frame::decode(bytes)?;
            if matches(&reply) {
                Ok(reply)
            } else {
                Err(TransportError::SerializationError(
                    "reply does not belong to this request".to_string(),
                ))
            }
        })
        .await
    }

    /// Release the connection
    pub fn close(mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
    }

    /// One attempt: (re)connect if needed, send, wait for an accepted reply
    ///
    /// Returns `None` when the deadline passes without one. Never returns
    /// before the deadline unless a reply was accepted.
    async fn attempt<T, F>(&mut self, payload: &[u8], deadline: Instant, accept: &mut F) -> Option<T>
    where
        F: FnMut(&[u8]) -> Result<T, TransportError>,
    {
        loop {
            if self.socket.is_none() {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match BusSocket::connect(SocketPattern::Request, &self.endpoint, remaining).await {
                    Ok(socket) => self.socket = Some(socket),
                    Err(e) => {
                        debug!(endpoint = %self.endpoint, error = %e, "Connect attempt failed");
                        tokio::time::sleep_until(deadline).await;
                        return None;
                    }
                }
            }
            let socket = self.socket.as_mut()?;

            match tokio::time::timeout_at(deadline, socket.send(payload.to_vec())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(endpoint = %self.endpoint, error = %e, "Send failed");
                    tokio::time::sleep_until(deadline).await;
                    return None;
                }
                Err(_) => return None,
            }

            match socket.poll_until(deadline).await {
                Ok(Some(bytes)) => match accept(&bytes) {
                    Ok(value) => return Some(value),
                    Err(e) => {
                        self.stats.malformed += 1;
                        warn!(endpoint = %self.endpoint, error = %e, "Ignoring malformed reply");

                        // The socket has spent its one reply. Resend on a
                        // fresh one within the same attempt, without
                        // touching the retry budget.
                        if let Some(socket) = self.socket.take() {
                            socket.close();
                        }
                        self.stats.reconnects += 1;
                    }
                },
                Ok(None) => return None,
                Err(e) => {
                    warn!(endpoint = %self.endpoint, error = %e, "Receive failed");
                    tokio::time::sleep_until(deadline).await;
                    return None;
                }
            }
        }
    }
}
