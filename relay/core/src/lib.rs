//! Relay Core - Remote Objects and Broadcasts over a Message Bus
//!
//! This crate exposes process-local objects to other processes and pushes
//! notifications to whoever is listening. It is transport plumbing only:
//! what the objects compute and what the notifications mean is up to the
//! code that uses it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   InvocationRequest    ┌──────────────────────┐
//! │     ProxyClient      │ ─────────────────────► │     ProxyServer      │
//! │  (ReliableClient:    │      REQ ──► REP       │  TargetRegistry      │
//! │   retry, reconnect)  │ ◄───────────────────── │  └─► RemoteObject    │
//! └──────────────────────┘    InvocationReply     └──────────────────────┘
//!
//! ┌──────────────────────┐   BroadcastMessage     ┌──────────────────────┐
//! │      Publisher       │ ─────────────────────► │  Subscriber (worker) │
//! │                      │      PUB ──► SUB       │  └─► queue           │
//! └──────────────────────┘                        └──────────────────────┘
//! ```
//!
//! Both pairs sit on [`transport`], which wraps the bus sockets and the
//! checksummed JSON frame format.
//!
//! # Key Types
//!
//! - [`ProxyServer`] / [`ProxyClient`]: serve and call remote objects
//! - [`RemoteObject`] and [`Interface`]: what a served object declares
//! - [`ReliableClient`]: request/reply with bounded retry and reconnect
//! - [`Publisher`] / [`Subscriber`]: fire-and-forget fan-out
//! - [`RelayConfig`]: endpoints and timings from file, env and CLI
//!
//! # Quick Start
//!
//! ```ignore
//! use relay_core::proxy::DEFAULT_POLL_INTERVAL;
//! use relay_core::{Address, ProxyClient, ProxyServer, RetryPolicy};
//!
//! let mut server = ProxyServer::bind(&Address::localhost(0), DEFAULT_POLL_INTERVAL).await?;
//! server.add("log", ExperimentLog::new());
//!
//! let mut client = ProxyClient::connect(server.endpoint().clone(), RetryPolicy::default()).await?;
//! let run: u64 = client.method("start_run").send_as().await?;
//!
//! server.close().await;
//! ```
//!
//! # Module Overview
//!
//! - [`transport`]: addresses, sockets, polling and frames
//! - [`messages`]: wire envelopes
//! - [`broadcast`]: publish/subscribe channel
//! - [`reliable`]: retrying request client
//! - [`proxy`]: remote object server and client
//! - [`config`]: TOML/env/CLI configuration

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod broadcast;
pub mod config;
pub mod messages;
pub mod proxy;
pub mod reliable;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{Publisher, Subscriber, SubscriberStats};
pub use messages::{
    BroadcastMessage, InvocationKind, InvocationReply, InvocationRequest, Kwargs, Outcome,
    RemoteError, RequestId, WIRE_VERSION,
};
pub use proxy::{
    Arguments, Call, DispatchError, Interface, Member, MemberKind, MethodSpec, Param, ProxyClient,
    ProxyError, ProxyServer, RemoteObject, ServerStats, TargetError, ValueKind,
};
pub use reliable::{ClientState, ReliableClient, RequestError, RequestStats, RetryPolicy};
pub use transport::{Address, BusSocket, SocketPattern, TransportConfig, TransportError};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, RelayConfig, RelayToml,
};
