//! Broadcast Subscriber
//!
//! A background worker owns the subscribe socket and feeds decoded
//! [`BroadcastMessage`]s into an unbounded queue. Consumers read the queue
//! at their own pace; an empty queue is the normal idle state, not an error.
//!
//! # Lifecycle
//!
//! ```text
//! start() ──► worker: connect ─► subscribe("") ─► recv loop ──► queue
//!                                                    ▲
//! stop()  ──► cancel token ──► worker exits, drops socket ──► join
//! ```
//!
//! `stop()` returns only after the worker task has finished, so the socket
//! is never torn down under a loop that is still using it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::messages::{check_version, BroadcastMessage};
use crate::transport::{frame, Address, BusSocket, SocketPattern, TransportError};

/// Pause after a failed connect or receive before trying again
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Counters kept by the subscriber worker
#[derive(Debug, Default)]
pub struct SubscriberStats {
    received: AtomicU64,
    malformed: AtomicU64,
}

impl SubscriberStats {
    /// Messages decoded and queued
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Frames that could not be decoded and were skipped
    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}

/// Consumer side of the broadcast channel
pub struct Subscriber {
    address: Address,
    queue: mpsc::UnboundedReceiver<BroadcastMessage>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    stats: Arc<SubscriberStats>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("address", &self.address)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    /// Connect to the publisher at `address` and start receiving
    ///
    /// Waits up to `connect_timeout` for the connection. If the publisher is
    /// not up yet this still returns `Ok`; the worker keeps retrying until
    /// [`Subscriber::stop`] is called.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidAddress`] if `address` cannot be
    /// used for connecting.
    pub async fn start(address: &Address, connect_timeout: Duration) -> Result<Self, TransportError> {
        if address.port() == Some(0) {
            return Err(TransportError::invalid_address(
                &address.to_string(),
                "cannot connect to port 0",
            ));
        }

        let (tx, queue) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let stats = Arc::new(SubscriberStats::default());

        let worker = tokio::spawn(receive_loop(
            address.clone(),
            connect_timeout,
            tx,
            ready_tx,
            cancel.clone(),
            Arc::clone(&stats),
        ));

        match tokio::time::timeout(connect_timeout, ready_rx).await {
            Ok(Ok(())) => info!(endpoint = %address, "Subscriber connected"),
            _ => warn!(
                endpoint = %address,
                timeout_ms = u64::try_from(connect_timeout.as_millis()).unwrap_or(u64::MAX),
                "Publisher not reachable yet, subscriber will keep trying"
            ),
        }

        Ok(Self {
            address: address.clone(),
            queue,
            cancel,
            worker: Some(worker),
            stats,
        })
    }

    /// Publisher address this subscriber connects to
    #[must_use]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Worker counters
    #[must_use]
    pub fn stats(&self) -> &SubscriberStats {
        &self.stats
    }

    /// Whether the receive loop is still active
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    /// Wait for the next message
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] once the subscriber is stopped and
    /// the queue has been drained.
    pub async fn recv(&mut self) -> Result<BroadcastMessage, TransportError> {
        self.queue.recv().await.ok_or(TransportError::Closed)
    }

    /// Wait at most `timeout` for the next message
    ///
    /// Returns `Ok(None)` if nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Same as [`Subscriber::recv`].
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<BroadcastMessage>, TransportError> {
        match tokio::time::timeout(timeout, self.queue.recv()).await {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => Err(TransportError::Closed),
            Err(_) => Ok(None),
        }
    }

    /// Take the next queued message without waiting
    ///
    /// # Errors
    ///
    /// Same as [`Subscriber::recv`].
    pub fn try_recv(&mut self) -> Result<Option<BroadcastMessage>, TransportError> {
        match self.queue.try_recv() {
            Ok(msg) => Ok(Some(msg)),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }

    /// Stop the worker and wait for it to exit
    ///
    /// Messages already queued can still be read afterwards. Calling this
    /// more than once is a no-op.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Subscriber worker did not exit cleanly");
            }
            info!(
                endpoint = %self.address,
                received = self.stats.received(),
                "Subscriber stopped"
            );
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn receive_loop(
    address: Address,
    connect_timeout: Duration,
    queue: mpsc::UnboundedSender<BroadcastMessage>,
    ready: oneshot::Sender<()>,
    cancel: CancellationToken,
    stats: Arc<SubscriberStats>,
) {
    let Some(mut socket) = connect_until_cancelled(&address, connect_timeout, &cancel).await else {
        debug!(endpoint = %address, "Subscriber cancelled before connecting");
        return;
    };
    let _ = ready.send(());

    loop {
        let received = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            received = socket.recv() => received,
        };

        match received.and_then(|bytes| decode_broadcast(&bytes)) {
            Ok(msg) => {
                stats.received.fetch_add(1, Ordering::Relaxed);
                if queue.send(msg).is_err() {
                    debug!("Subscriber queue dropped, stopping worker");
                    break;
                }
            }
            Err(e) if e.is_protocol_error() => {
                stats.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Skipping undecodable broadcast");
            }
            Err(e) => {
                warn!(error = %e, "Broadcast receive failed");
                if sleep_or_cancel(ERROR_BACKOFF, &cancel).await {
                    break;
                }
            }
        }
    }

    socket.close();
}

async fn connect_until_cancelled(
    address: &Address,
    connect_timeout: Duration,
    cancel: &CancellationToken,
) -> Option<BusSocket> {
    loop {
        let attempt = tokio::select! {
            biased;
            () = cancel.cancelled() => return None,
            attempt = BusSocket::connect(SocketPattern::Subscribe, address, connect_timeout) => attempt,
        };

        match attempt {
            Ok(socket) => return Some(socket),
            Err(e) => {
                debug!(endpoint = %address, error = %e, "Subscriber connect attempt failed");
                if sleep_or_cancel(ERROR_BACKOFF, cancel).await {
                    return None;
                }
            }
        }
    }
}

/// Sleep for `duration`; returns `true` if cancelled meanwhile
async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(duration) => false,
    }
}

fn decode_broadcast(bytes: &[u8]) -> Result<BroadcastMessage, TransportError> {
    let msg: BroadcastMessage = frame::decode(bytes)?;
    check_version(msg.version)?;
    Ok(msg)
}
