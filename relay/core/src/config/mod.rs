//! TOML Configuration File Support
//!
//! Loads endpoints and timings for the relay from a TOML file at
//! `~/.config/relay/relay.toml`, the environment and command-line overrides.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! - `$XDG_CONFIG_HOME/relay/relay.toml` (typically `~/.config/relay/relay.toml`)
//!
//! # Example Configuration
//!
//! ```toml
//! [proxy]
//! address = "tcp://127.0.0.1:8123"
//! poll_interval_ms = 500
//!
//! [broadcast]
//! address = "tcp://127.0.0.1:8765"
//!
//! [request]
//! timeout_ms = 2500
//! max_retries = 3
//! connect_timeout_ms = 1000
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reliable::RetryPolicy;
use crate::transport::{Address, TransportConfig};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[proxy]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyToml {
    /// Endpoint the proxy server binds and clients connect to
    pub address: Option<String>,

    /// Server poll interval in milliseconds
    pub poll_interval_ms: Option<u64>,
}

/// `[broadcast]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastToml {
    /// Endpoint the publisher binds and subscribers connect to
    pub address: Option<String>,
}

/// `[request]` section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestToml {
    /// Per-attempt reply timeout in milliseconds
    pub timeout_ms: Option<u64>,

    /// Attempts before an endpoint is declared offline
    pub max_retries: Option<u32>,

    /// Connection timeout in milliseconds
    pub connect_timeout_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Proxy section
    pub proxy: ProxyToml,

    /// Broadcast section
    pub broadcast: BroadcastToml,

    /// Request section
    pub request: RequestToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved relay configuration
///
/// Use [`load_config`] to load it with proper priority handling.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Endpoints and socket timings
    pub transport: TransportConfig,

    /// Per-attempt reply timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Attempts before an endpoint is declared offline
    pub max_retries: u32,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            transport: TransportConfig::default(),
            request_timeout_ms: duration_ms(policy.timeout),
            max_retries: policy.max_retries,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Retry policy for request clients
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(self.request_timeout_ms),
            max_retries: self.max_retries,
            connect_timeout: self.transport.connect_timeout(),
        }
    }

    /// Check values are usable
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for zero retries, zero
    /// timeouts or a proxy and broadcast endpoint that collide.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_retries == 0 {
            return Err(ConfigError::ValidationError(
                "request.max_retries must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "request.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.transport.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "request.connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.transport.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "proxy.poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        let proxy = &self.transport.proxy_address;
        if proxy.port() != Some(0) && *proxy == self.transport.broadcast_address {
            return Err(ConfigError::ValidationError(format!(
                "proxy and broadcast cannot share the endpoint {proxy}"
            )));
        }
        Ok(())
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay/relay.toml` or
/// `~/.config/relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// CLI overrides are not handled here; apply [`ConfigOverrides`] after.
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed,
/// or if a value is malformed. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Arguments
///
/// * `path` - Optional path to the configuration file. If `None`, only defaults
///   and environment variables are used.
///
/// # Errors
///
/// Same as [`load_config`].
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with a custom environment lookup
///
/// # Errors
///
/// Same as [`load_config`].
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env)?;

    Ok(config)
}

fn parse_address(field: &str, value: &str) -> Result<Address, ConfigError> {
    Address::parse(value).map_err(|e| ConfigError::ValidationError(format!("{field}: {e}")))
}

fn parse_number<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{var}: '{value}' is not a number")))
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) -> Result<(), ConfigError> {
    if let Some(ref address) = toml.proxy.address {
        config.transport.proxy_address = parse_address("proxy.address", address)?;
    }
    if let Some(interval) = toml.proxy.poll_interval_ms {
        config.transport.poll_interval_ms = interval;
    }

    if let Some(ref address) = toml.broadcast.address {
        config.transport.broadcast_address = parse_address("broadcast.address", address)?;
    }

    if let Some(timeout) = toml.request.timeout_ms {
        config.request_timeout_ms = timeout;
    }
    if let Some(retries) = toml.request.max_retries {
        config.max_retries = retries;
    }
    if let Some(timeout) = toml.request.connect_timeout_ms {
        config.transport.connect_timeout_ms = timeout;
    }

    Ok(())
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut RelayConfig, env: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(address) = env("RELAY_PROXY_ADDRESS") {
        config.transport.proxy_address = parse_address("RELAY_PROXY_ADDRESS", &address)?;
        config.source = ConfigSource::Env;
    }
    if let Some(address) = env("RELAY_BROADCAST_ADDRESS") {
        config.transport.broadcast_address = parse_address("RELAY_BROADCAST_ADDRESS", &address)?;
        config.source = ConfigSource::Env;
    }
    if let Some(interval) = env("RELAY_POLL_INTERVAL") {
        config.transport.poll_interval_ms = parse_number("RELAY_POLL_INTERVAL", &interval)?;
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = env("RELAY_REQUEST_TIMEOUT") {
        config.request_timeout_ms = parse_number("RELAY_REQUEST_TIMEOUT", &timeout)?;
        config.source = ConfigSource::Env;
    }
    if let Some(retries) = env("RELAY_REQUEST_RETRIES") {
        config.max_retries = parse_number("RELAY_REQUEST_RETRIES", &retries)?;
        config.source = ConfigSource::Env;
    }
    if let Some(timeout) = env("RELAY_CONNECT_TIMEOUT") {
        config.transport.connect_timeout_ms = parse_number("RELAY_CONNECT_TIMEOUT", &timeout)?;
        config.source = ConfigSource::Env;
    }

    Ok(())
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Proxy endpoint override
    pub proxy_address: Option<Address>,

    /// Broadcast endpoint override
    pub broadcast_address: Option<Address>,

    /// Poll interval override (milliseconds)
    pub poll_interval_ms: Option<u64>,

    /// Request timeout override (milliseconds)
    pub request_timeout_ms: Option<u64>,

    /// Attempts override
    pub max_retries: Option<u32>,

    /// Connect timeout override (milliseconds)
    pub connect_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set proxy endpoint override
    #[must_use]
    pub fn with_proxy_address(mut self, address: Address) -> Self {
        self.proxy_address = Some(address);
        self
    }

    /// Set broadcast endpoint override
    #[must_use]
    pub fn with_broadcast_address(mut self, address: Address) -> Self {
        self.broadcast_address = Some(address);
        self
    }

    /// Set poll interval override
    #[must_use]
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = Some(ms);
        self
    }

    /// Set request timeout override
    #[must_use]
    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = Some(ms);
        self
    }

    /// Set attempts override
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    /// Set connect timeout override
    #[must_use]
    pub fn with_connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = Some(ms);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.proxy_address.is_none()
            && self.broadcast_address.is_none()
            && self.poll_interval_ms.is_none()
            && self.request_timeout_ms.is_none()
            && self.max_retries.is_none()
            && self.connect_timeout_ms.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }

        if let Some(ref address) = self.proxy_address {
            config.transport.proxy_address = address.clone();
        }
        if let Some(ref address) = self.broadcast_address {
            config.transport.broadcast_address = address.clone();
        }
        if let Some(interval) = self.poll_interval_ms {
            config.transport.poll_interval_ms = interval;
        }
        if let Some(timeout) = self.request_timeout_ms {
            config.request_timeout_ms = timeout;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(timeout) = self.connect_timeout_ms {
            config.transport.connect_timeout_ms = timeout;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
