//! Object Proxy Server
//!
//! Binds a reply socket and serves invocations against registered targets
//! from one worker task. Every decoded request gets exactly one reply, sent
//! on the socket that delivered it. Requests that cannot be decoded get
//! none; the caller's retry logic deals with the silence.
//!
//! # Design
//!
//! The worker polls with a bounded interval and also watches a
//! [`CancellationToken`], so [`ProxyServer::close`] takes effect promptly.
//! `close` joins the worker before returning; the worker owns the socket
//! and drops it on exit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatch::{dispatch, TargetRegistry};
use super::target::RemoteObject;
use super::ProxyError;
use crate::messages::{check_version, InvocationReply, InvocationRequest, RemoteError};
use crate::transport::{frame, Address, BusSocket, SocketPattern, TransportError};

/// Default bound on one poll of the reply socket
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Counters kept by the server worker
#[derive(Debug, Default)]
pub struct ServerStats {
    requests: AtomicU64,
    errors: AtomicU64,
    malformed: AtomicU64,
}

impl ServerStats {
    /// Requests decoded and answered
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Answered requests whose outcome was an error
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Messages discarded without a reply
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// Serves registered targets to remote callers
pub struct ProxyServer {
    endpoint: Address,
    registry: Arc<Mutex<TargetRegistry>>,
    stats: Arc<ServerStats>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("endpoint", &self.endpoint)
            .field("targets", &self.targets())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl ProxyServer {
    /// Bind `address` and start serving
    ///
    /// Targets can be added before or after requests start arriving;
    /// requests for a target that is not registered yet get an
    /// `UnknownTarget` error reply.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Transport`] if the address cannot be bound.
    pub async fn bind(address: &Address, poll_interval: Duration) -> Result<Self, ProxyError> {
        let socket = BusSocket::bind(SocketPattern::Reply, address).await?;
        let endpoint = socket.address().clone();

        let registry = Arc::new(Mutex::new(TargetRegistry::new()));
        let stats = Arc::new(ServerStats::default());
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(serve_loop(
            socket,
            poll_interval,
            Arc::clone(&registry),
            Arc::clone(&stats),
            cancel.clone(),
        ));

        info!(endpoint = %endpoint, "Proxy server listening");

        Ok(Self {
            endpoint,
            registry,
            stats,
            cancel,
            worker: Some(worker),
        })
    }

    /// Register `target` under `id`
    ///
    /// The first registered target also serves requests that name no
    /// target. Registering an existing id replaces that target.
    pub fn add(&self, id: impl Into<String>, target: impl RemoteObject) {
        let id = id.into();
        let replaced = self.registry.lock().insert(id.clone(), Box::new(target));
        if replaced {
            info!(target_id = %id, "Replaced proxy target");
        } else {
            info!(target_id = %id, "Registered proxy target");
        }
    }

    /// Unregister `id`; returns whether it was registered
    pub fn remove(&self, id: &str) -> bool {
        self.registry.lock().remove(id)
    }

    /// Registered target ids, default first
    #[must_use]
    pub fn targets(&self) -> Vec<String> {
        self.registry.lock().ids()
    }

    /// Address actually bound
    #[must_use]
    pub fn endpoint(&self) -> &Address {
        &self.endpoint
    }

    /// Worker counters
    #[must_use]
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Whether the worker is still serving
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Stop serving and wait for the worker to exit
    ///
    /// The socket is released by the time this returns. Calling it again
    /// does nothing.
    pub async fn close(&mut self) {
        self.cancel.cancel();

        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                error!(error = %e, "Proxy server worker did not exit cleanly");
            }
            info!(
                endpoint = %self.endpoint,
                requests = self.stats.requests(),
                "Proxy server closed"
            );
        }
    }
}

impl Drop for ProxyServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve_loop(
    mut socket: BusSocket,
    poll_interval: Duration,
    registry: Arc<Mutex<TargetRegistry>>,
    stats: Arc<ServerStats>,
    cancel: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            polled = socket.poll(Some(poll_interval)) => polled,
        };

        let bytes = match polled {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(e) if e.is_protocol_error() => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Discarding malformed message");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Poll failed");
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(ERROR_BACKOFF) => continue,
                }
            }
        };

        let request = match decode_request(&bytes) {
            Ok(request) => request,
            Err(e) => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Discarding undecodable request");
                continue;
            }
        };

        debug!(
            id = %request.id,
            kind = %request.kind,
            command = %request.command,
            "Request received"
        );

        let reply = {
            let mut registry = registry.lock();
            dispatch(&mut registry, &request)
        };

        stats.requests.fetch_add(1, Ordering::Relaxed);
        if !reply.is_ok() {
            stats.errors.fetch_add(1, Ordering::Relaxed);
        }

        if let Err(e) = socket.send(encode_reply(&reply)).await {
            error!(id = %request.id, error = %e, "Failed to send reply");
        }
    }

    socket.close();
    debug!("Proxy server worker exited");
}

fn decode_request(bytes: &[u8]) -> Result<InvocationRequest, TransportError> {
    let request: InvocationRequest = frame::decode(bytes)?;
    check_version(request.version)?;
    Ok(request)
}

/// Encode `reply`, falling back to an error reply if the value is not
/// encodable, so the caller always gets an answer
fn encode_reply(reply: &InvocationReply) -> Vec<u8> {
    match frame::encode(reply) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(id = %reply.id, error = %e, "Reply not encodable, sending error instead");
            let fallback = InvocationReply::err(
                reply.id,
                RemoteError {
                    kind: "SerializationError".to_string(),
                    message: e.to_string(),
                    trace: String::new(),
                },
            );
            frame::encode(&fallback).unwrap_or_default()
        }
    }
}
