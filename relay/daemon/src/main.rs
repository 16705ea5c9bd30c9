//! Relay Daemon - Remote Objects and Broadcasts from the Command Line
//!
//! Serves an experiment log over the relay proxy, and lets other processes
//! call it, read its properties, publish and listen to broadcasts.
//!
//! # Usage
//!
//! ```bash
//! # Serve with defaults (tcp://127.0.0.1:8123 and :8765)
//! relay-daemon serve
//!
//! # Serve elsewhere, without broadcasting
//! relay-daemon --address tcp://0.0.0.0:7000 serve --no-broadcast
//!
//! # Invoke members of the served log
//! relay-daemon call start_run
//! relay-daemon call log loss 0.25
//! relay-daemon call entries --kwarg limit=10
//! relay-daemon get run_count
//! relay-daemon describe
//!
//! # Watch logged entries
//! relay-daemon subscribe --count 5
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon serve
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod experiment;
mod serve;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use relay_core::{
    load_config_from_path, Address, ConfigOverrides, Kwargs, ProxyClient,
    Publisher, RelayConfig, Subscriber,
};
use serde_json::{json, Value};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use serve::{DaemonServer, ServeOptions};

/// Relay Daemon - remote objects and broadcasts over a message bus
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short = 'l',
        long,
        env = "RELAY_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: String,

    /// Proxy endpoint to bind or connect to
    #[arg(short = 'a', long, value_name = "ADDRESS", global = true)]
    address: Option<String>,

    /// Broadcast endpoint to bind or connect to
    #[arg(short = 'b', long, value_name = "ADDRESS", global = true)]
    broadcast_address: Option<String>,

    /// Per-attempt request timeout in milliseconds
    #[arg(long, value_name = "MS", global = true)]
    timeout_ms: Option<u64>,

    /// Attempts per request before giving up
    #[arg(long, value_name = "N", global = true)]
    retries: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve an experiment log and broadcast its entries
    Serve {
        /// Do not bind the broadcast endpoint
        #[arg(long)]
        no_broadcast: bool,

        /// Directory experiment sessions are named under
        #[arg(long, value_name = "PATH")]
        session_dir: Option<PathBuf>,
    },

    /// Call a remote method; arguments are JSON, bare words are strings
    Call {
        /// Method name
        method: String,

        /// Positional arguments
        args: Vec<String>,

        /// Keyword argument as NAME=VALUE (repeatable)
        #[arg(short = 'k', long = "kwarg", value_name = "NAME=VALUE")]
        kwargs: Vec<String>,

        /// Registered target id (defaults to the first one)
        #[arg(short = 't', long)]
        target: Option<String>,
    },

    /// Read a remote property
    Get {
        /// Property name
        property: String,

        /// Registered target id (defaults to the first one)
        #[arg(short = 't', long)]
        target: Option<String>,
    },

    /// Print the remote target's interface
    Describe {
        /// Registered target id (defaults to the first one)
        #[arg(short = 't', long)]
        target: Option<String>,
    },

    /// Publish one broadcast message
    Publish {
        /// Message header
        header: String,

        /// Payload, JSON or a bare string
        payload: String,

        /// How long to wait for subscribers to connect before sending
        #[arg(long, value_name = "MS", default_value_t = 500)]
        settle_ms: u64,
    },

    /// Print broadcast messages as JSON lines
    Subscribe {
        /// Stop after this many messages
        #[arg(short = 'n', long)]
        count: Option<u64>,
    },
}

/// Initialize logging with the specified level
///
/// Logs go to stderr so command output on stdout stays machine-readable.
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))
}

/// Load the configuration file, then apply command line overrides
fn resolve_config(args: &Args) -> Result<RelayConfig> {
    let mut config =
        load_config_from_path(args.config.clone()).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(address) = &args.address {
        overrides = overrides.with_proxy_address(
            Address::parse(address).with_context(|| format!("Invalid --address {address}"))?,
        );
    }
    if let Some(address) = &args.broadcast_address {
        overrides = overrides.with_broadcast_address(
            Address::parse(address)
                .with_context(|| format!("Invalid --broadcast-address {address}"))?,
        );
    }
    if let Some(ms) = args.timeout_ms {
        overrides = overrides.with_request_timeout_ms(ms);
    }
    if let Some(retries) = args.retries {
        overrides = overrides.with_max_retries(retries);
    }

    if !overrides.is_empty() {
        overrides.apply(&mut config);
    }
    config.validate().context("Invalid configuration")?;

    info!(
        source = ?config.source(),
        proxy = %config.transport.proxy_address,
        broadcast = %config.transport.broadcast_address,
        "Configuration loaded"
    );
    Ok(config)
}

/// Parse a command line value as JSON, falling back to a plain string
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Parse `NAME=VALUE` pairs into keyword arguments
fn parse_kwargs(pairs: &[String]) -> Result<Kwargs> {
    let mut kwargs = Kwargs::new();
    for pair in pairs {
        let Some((name, raw)) = pair.split_once('=') else {
            bail!("Keyword argument '{pair}' is not NAME=VALUE");
        };
        if name.is_empty() {
            bail!("Keyword argument '{pair}' has an empty name");
        }
        kwargs.insert(name.to_string(), parse_value(raw));
    }
    Ok(kwargs)
}

/// Resolve once SIGINT or SIGTERM arrives
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
        _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
    }
    Ok(())
}

async fn client_for(config: &RelayConfig, target: Option<String>) -> Result<ProxyClient> {
    let client = ProxyClient::connect(
        config.transport.proxy_address.clone(),
        config.retry_policy(),
    )
    .await
    .with_context(|| format!("Failed to connect to {}", config.transport.proxy_address))?;

    Ok(match target {
        Some(id) => client.with_target(id),
        None => client,
    })
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(config: &RelayConfig, no_broadcast: bool, session_dir: Option<PathBuf>) -> Result<()> {
    let mut options = ServeOptions::from_config(config, !no_broadcast);
    if let Some(dir) = session_dir {
        options.session_root = dir;
    }

    let daemon = DaemonServer::start(options).await?;

    // Bound endpoints, so scripts can find ephemeral ports
    println!(
        "{}",
        json!({
            "proxy": daemon.endpoint().to_string(),
            "broadcast": daemon.broadcast_address().map(ToString::to_string),
        })
    );

    // A failed handler install still shuts down, just immediately
    daemon
        .run(async {
            if let Err(e) = shutdown_signal().await {
                error!(error = %e, "Signal handling unavailable");
            }
        })
        .await;
    Ok(())
}

async fn publish(config: &RelayConfig, header: &str, payload: &str, settle: Duration) -> Result<()> {
    let mut publisher = Publisher::bind(&config.transport.broadcast_address)
        .await
        .with_context(|| {
            format!(
                "Failed to bind broadcast endpoint {}",
                config.transport.broadcast_address
            )
        })?;

    // Subscribers need a moment to connect to a freshly bound endpoint
    tokio::time::sleep(settle).await;
    publisher.send(header, &parse_value(payload)).await?;

    // Give the bus a moment to flush before the socket goes away
    tokio::time::sleep(Duration::from_millis(100)).await;
    publisher.close();
    info!(header, "Published");
    Ok(())
}

async fn subscribe(config: &RelayConfig, count: Option<u64>) -> Result<()> {
    let mut subscriber = Subscriber::start(
        &config.transport.broadcast_address,
        config.transport.connect_timeout(),
    )
    .await?;

    let signals = shutdown_signal();
    tokio::pin!(signals);

    let mut received = 0u64;
    while count.map_or(true, |limit| received < limit) {
        let message = tokio::select! {
            result = &mut signals => {
                result?;
                break;
            }
            message = subscriber.recv() => message,
        };

        let Ok(message) = message else { break };
        println!(
            "{}",
            json!({ "header": message.header, "payload": message.payload })
        );
        received += 1;
    }

    subscriber.stop().await;
    info!(received, "Subscription ended");
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = resolve_config(&args)?;

    match args.command {
        Command::Serve {
            no_broadcast,
            session_dir,
        } => serve(&config, no_broadcast, session_dir).await,

        Command::Call {
            method,
            args,
            kwargs,
            target,
        } => {
            let mut client = client_for(&config, target).await?;
            let positional = args.iter().map(|a| parse_value(a)).collect();
            let value = client
                .call(&method, positional, parse_kwargs(&kwargs)?)
                .await?;
            client.close();
            print_json(&value)
        }

        Command::Get { property, target } => {
            let mut client = client_for(&config, target).await?;
            let value = client.get(&property).await?;
            client.close();
            print_json(&value)
        }

        Command::Describe { target } => {
            let mut client = client_for(&config, target).await?;
            let interface = serde_json::to_value(client.interface().await?)?;
            client.close();
            print_json(&interface)
        }

        Command::Publish {
            header,
            payload,
            settle_ms,
        } => publish(&config, &header, &payload, Duration::from_millis(settle_ms)).await,

        Command::Subscribe { count } => subscribe(&config, count).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level)?;

    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "Relay daemon starting");

    let result = run(args).await;
    if let Err(e) = &result {
        error!(error = %e, "Relay daemon stopped with error");
    }
    result
}
