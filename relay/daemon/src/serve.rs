//! Serve Command
//!
//! Runs the proxy server with an [`ExperimentLog`] registered as its
//! default target and, unless disabled, a broadcast publisher that
//! announces every logged entry:
//!
//! ```text
//!   ProxyClient ──REQ/REP──► ProxyServer ──► ExperimentLog
//!                                                  │ mpsc
//!                                                  ▼
//!   Subscriber ◄──PUB/SUB── Publisher ◄──── forwarder task
//! ```

use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use relay_core::{Address, ProxyServer, Publisher, RelayConfig};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::experiment::{ExperimentLog, LogEntry};

/// Target id the experiment log is served under
pub const LOG_TARGET: &str = "log";

/// Header of the broadcast sent for every logged entry
pub const ENTRY_HEADER: &str = "log_entry";

/// How long shutdown waits for queued broadcasts to drain
const FORWARDER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Options for [`DaemonServer::start`]
#[derive(Clone, Debug)]
pub struct ServeOptions {
    /// Endpoint the proxy server binds
    pub proxy_address: Address,
    /// Endpoint the publisher binds, `None` to skip broadcasting
    pub broadcast_address: Option<Address>,
    /// Upper bound on one server poll
    pub poll_interval: Duration,
    /// Directory experiment sessions are named under
    pub session_root: PathBuf,
}

impl ServeOptions {
    /// Options taken from a loaded configuration
    pub fn from_config(config: &RelayConfig, broadcast: bool) -> Self {
        Self {
            proxy_address: config.transport.proxy_address.clone(),
            broadcast_address: broadcast.then(|| config.transport.broadcast_address.clone()),
            poll_interval: config.transport.poll_interval(),
            session_root: default_session_root(),
        }
    }
}

/// Default place experiment sessions are named under
pub fn default_session_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("relay")
        .join("sessions")
}

/// A running daemon: proxy server plus optional broadcast forwarder
pub struct DaemonServer {
    server: ProxyServer,
    forwarder: Option<JoinHandle<u64>>,
    broadcast_address: Option<Address>,
}

impl DaemonServer {
    /// Bind the endpoints and start serving
    ///
    /// # Errors
    ///
    /// Fails if either endpoint cannot be bound.
    pub async fn start(options: ServeOptions) -> Result<Self> {
        let mut log = ExperimentLog::new(&options.session_root);

        let (forwarder, broadcast_address) = match &options.broadcast_address {
            Some(address) => {
                let publisher = Publisher::bind(address)
                    .await
                    .with_context(|| format!("Failed to bind broadcast endpoint {address}"))?;
                let bound = publisher.address().clone();

                let (tx, rx) = mpsc::unbounded_channel();
                log = log.with_notifier(tx);
                (Some(tokio::spawn(forward_entries(publisher, rx))), Some(bound))
            }
            None => {
                info!("Broadcasting disabled");
                (None, None)
            }
        };

        let server = ProxyServer::bind(&options.proxy_address, options.poll_interval)
            .await
            .with_context(|| format!("Failed to bind proxy endpoint {}", options.proxy_address))?;
        server.add(LOG_TARGET, log);

        info!(
            proxy = %server.endpoint(),
            broadcast = ?broadcast_address.as_ref().map(ToString::to_string),
            "Daemon serving"
        );

        Ok(Self {
            server,
            forwarder,
            broadcast_address,
        })
    }

    /// Endpoint the proxy server is bound to
    pub fn endpoint(&self) -> &Address {
        self.server.endpoint()
    }

    /// Endpoint the publisher is bound to, if broadcasting
    pub fn broadcast_address(&self) -> Option<&Address> {
        self.broadcast_address.as_ref()
    }

    /// Serve until `shutdown` resolves, then stop everything
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        shutdown.await;
        self.shutdown().await;
    }

    /// Stop the server, then let the forwarder drain
    pub async fn shutdown(mut self) {
        info!("Initiating graceful shutdown");
        self.server.close().await;

        let stats = self.server.stats();
        info!(
            requests = stats.requests(),
            errors = stats.errors(),
            malformed = stats.malformed(),
            "Proxy server stopped"
        );

        // Dropping the server drops the log and with it the last sender
        drop(self.server);

        if let Some(forwarder) = self.forwarder.take() {
            match tokio::time::timeout(FORWARDER_DRAIN_TIMEOUT, forwarder).await {
                Ok(Ok(sent)) => info!(sent, "Broadcast forwarder stopped"),
                Ok(Err(e)) => warn!(error = %e, "Broadcast forwarder panicked"),
                Err(_) => warn!("Broadcast forwarder did not drain in time"),
            }
        }
    }
}

/// Publish every entry received on `entries` until the channel closes
async fn forward_entries(
    mut publisher: Publisher,
    mut entries: mpsc::UnboundedReceiver<LogEntry>,
) -> u64 {
    while let Some(entry) = entries.recv().await {
        if let Err(e) = publisher.send(ENTRY_HEADER, &entry).await {
            warn!(error = %e, key = %entry.key, "Failed to broadcast entry");
            continue;
        }
        debug!(run = entry.run, key = %entry.key, "Entry broadcast");
    }

    publisher.close();
    publisher.sent()
}
