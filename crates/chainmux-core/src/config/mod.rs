//! Application configuration with layered loading.
//!
//! # Configuration Hierarchy
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: `Default` implementations and `serde` defaults
//! 2. **Config file**: TOML file specified by the `CHAINMUX_CONFIG` env var
//! 3. **Environment variables**: `CHAINMUX__*` env vars override specific fields
//!
//! # Configuration Sections
//!
//! - [`EndpointConfig`]: upstream node definitions keyed by unique endpoint name
//! - [`StoreConfig`]: logical store names mapped to connection URLs
//! - [`HubConfig`]: which chain status hub backend to run
//! - [`SyncConfig`]: failure interval and push reconnect delay for the sync engine
//! - [`CacheConfig`]: presence (affinity) and result caches
//! - [`RateLimitConfig`]: fixed-window request limiting
//! - [`LoggingConfig`], [`ServerConfig`]: process-level settings
//!
//! # Example
//!
//! ```toml
//! [endpoints.eth-main-1]
//! chain = { brand = "eth", network = "mainnet" }
//! url = "https://eth-mainnet.example.com"
//! streaming_url = "wss://eth-mainnet.example.com"
//! weight = 150
//! skip_methods = ["debug_traceTransaction"]
//!
//! [stores.shared]
//! url = "redis://127.0.0.1:6379/0"
//!
//! [hub]
//! backend = "stream"
//! store = "shared"
//!
//! [cache.result]
//! store = "shared"
//! methods = [{ method = "eth_chainId", ttl_seconds = 3600 }]
//! ```
//!
//! Table keys are folded to lowercase by the loader, so anything case-sensitive (method
//! names in particular) is written as a value rather than a key. Endpoint names are
//! therefore lowercase identifiers.

use crate::types::ChainRef;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path, time::Duration};
use thiserror::Error;

/// Weight assigned to endpoints configured with a weight of zero or less.
pub const DEFAULT_WEIGHT: u64 = 100;

/// Timeout assigned to endpoints configured with a timeout of zero or less.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 90;

/// Configuration errors detected after a successful parse.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    #[error("endpoint {0}: chain brand and network must be non-empty")]
    EmptyChain(String),

    #[error("endpoint {0}: url must start with http or https, got {1:?}")]
    InvalidUrl(String, String),

    #[error("endpoint {0}: streaming url must start with ws or wss, got {1:?}")]
    InvalidStreamingUrl(String, String),

    #[error("{component} references undeclared store {store:?}")]
    UnknownStore { component: &'static str, store: String },

    #[error("hub backend {0} requires a store")]
    HubStoreMissing(&'static str),

    #[error("logging format must be 'json' or 'pretty'")]
    LoggingFormat,
}

/// Configuration for one upstream node endpoint.
///
/// Numeric fields are signed so that zero and negative values can be written in the file;
/// they are normalised by the accessor methods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Chain this endpoint serves. Determines its endpoint set.
    pub chain: ChainRef,

    /// Base URL for JSON-RPC / REST / GraphQL calls.
    pub url: String,

    /// Optional push URL (e.g. WebSocket) for delegators that subscribe to new heads.
    #[serde(default)]
    pub streaming_url: Option<String>,

    /// Extra headers sent with every request to this endpoint.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Weighted selection weight. Values `<= 0` mean [`DEFAULT_WEIGHT`].
    #[serde(default)]
    pub weight: i64,

    /// Methods (or REST path keys) this endpoint must never be selected for.
    #[serde(default)]
    pub skip_methods: Vec<String>,

    /// Seconds between tip polls. Values `< 1` mean one second.
    #[serde(default)]
    pub fetch_interval: i64,

    /// Request timeout in seconds. Values `<= 0` mean [`DEFAULT_TIMEOUT_SECONDS`].
    #[serde(default)]
    pub timeout: i64,
}

impl EndpointConfig {
    #[must_use]
    pub fn new(chain: ChainRef, url: impl Into<String>) -> Self {
        Self {
            chain,
            url: url.into(),
            streaming_url: None,
            headers: HashMap::new(),
            weight: 0,
            skip_methods: Vec::new(),
            fetch_interval: 0,
            timeout: 0,
        }
    }

    #[must_use]
    pub fn effective_weight(&self) -> u64 {
        u64::try_from(self.weight).ok().filter(|w| *w > 0).unwrap_or(DEFAULT_WEIGHT)
    }

    #[must_use]
    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(u64::try_from(self.fetch_interval).unwrap_or(1).max(1))
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        let secs = u64::try_from(self.timeout).ok().filter(|t| *t > 0);
        Duration::from_secs(secs.unwrap_or(DEFAULT_TIMEOUT_SECONDS))
    }
}

/// A logical store (Redis today) referenced by name from the hub, caches, and rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Connection URL. `redis://`, `rediss://`, and `memory://` are recognised.
    pub url: String,
}

/// Chain status hub backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubBackend {
    /// In-process fan-out. Single process only.
    #[default]
    Memory,
    /// Store pub/sub plus per-endpoint snapshot keys.
    Pubsub,
    /// Capped store log with replay.
    Stream,
}

impl HubBackend {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Pubsub => "pubsub",
            Self::Stream => "stream",
        }
    }
}

/// Chain status hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    #[serde(default)]
    pub backend: HubBackend,

    /// Logical store name. Required for `pubsub` and `stream`.
    #[serde(default)]
    pub store: Option<String>,

    /// Prefix for channel, snapshot, and stream keys.
    #[serde(default = "default_hub_prefix")]
    pub prefix: String,

    /// Expiry of pub/sub snapshot keys. Defaults to six hours.
    #[serde(default = "default_snapshot_ttl_seconds")]
    pub snapshot_ttl_seconds: u64,

    /// Maximum length of the durable log.
    #[serde(default = "default_stream_max_len")]
    pub stream_max_len: usize,

    /// Number of most recent log entries replayed to a new subscriber.
    #[serde(default = "default_replay_count")]
    pub replay_count: usize,

    /// Idle sleep between empty log reads.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Consecutive store failures tolerated before the hub run loop gives up.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
}

fn default_hub_prefix() -> String {
    "chainmux".to_string()
}

fn default_snapshot_ttl_seconds() -> u64 {
    6 * 60 * 60
}

fn default_stream_max_len() -> usize {
    1000
}

fn default_replay_count() -> usize {
    200
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_max_failures() -> u32 {
    30
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            backend: HubBackend::Memory,
            store: None,
            prefix: default_hub_prefix(),
            snapshot_ttl_seconds: default_snapshot_ttl_seconds(),
            stream_max_len: default_stream_max_len(),
            replay_count: default_replay_count(),
            poll_interval_ms: default_poll_interval_ms(),
            max_failures: default_max_failures(),
        }
    }
}

impl HubConfig {
    #[must_use]
    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_secs(self.snapshot_ttl_seconds)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Sync engine timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Retry interval after a failed tip fetch. Defaults to `5`.
    #[serde(default = "default_failure_interval_seconds")]
    pub failure_interval_seconds: u64,

    /// Fixed delay between push subscription reconnect attempts. Defaults to `3`.
    #[serde(default = "default_push_reconnect_delay_seconds")]
    pub push_reconnect_delay_seconds: u64,
}

fn default_failure_interval_seconds() -> u64 {
    5
}

fn default_push_reconnect_delay_seconds() -> u64 {
    3
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            failure_interval_seconds: default_failure_interval_seconds(),
            push_reconnect_delay_seconds: default_push_reconnect_delay_seconds(),
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn failure_interval(&self) -> Duration {
        Duration::from_secs(self.failure_interval_seconds.max(1))
    }

    #[must_use]
    pub fn push_reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.push_reconnect_delay_seconds)
    }
}

/// Presence (transaction affinity) cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceCacheConfig {
    pub store: String,

    #[serde(default = "default_presence_prefix")]
    pub prefix: String,

    /// Lifetime of each `(identifier, endpoint)` entry. Defaults to ten minutes.
    #[serde(default = "default_presence_ttl_seconds")]
    pub ttl_seconds: u64,
}

fn default_presence_prefix() -> String {
    "presence".to_string()
}

fn default_presence_ttl_seconds() -> u64 {
    600
}

/// One allow-listed method of the result cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedMethod {
    pub method: String,
    pub ttl_seconds: u64,
}

impl CachedMethod {
    pub fn new(method: impl Into<String>, ttl_seconds: u64) -> Self {
        Self { method: method.into(), ttl_seconds }
    }
}

/// Result cache settings. Only methods listed in `methods` are cached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultCacheConfig {
    pub store: String,

    #[serde(default = "default_result_prefix")]
    pub prefix: String,

    #[serde(default)]
    pub methods: Vec<CachedMethod>,
}

impl ResultCacheConfig {
    /// Method name to TTL. A method listed twice keeps its last TTL.
    pub fn method_ttls(&self) -> HashMap<String, Duration> {
        self.methods
            .iter()
            .map(|entry| (entry.method.clone(), Duration::from_secs(entry.ttl_seconds)))
            .collect()
    }
}

fn default_result_prefix() -> String {
    "result".to_string()
}

/// Cache section. Both caches are optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub presence: Option<PresenceCacheConfig>,

    #[serde(default)]
    pub result: Option<ResultCacheConfig>,
}

/// Fixed-window rate limiting settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub store: String,

    #[serde(default = "default_rate_limit_prefix")]
    pub prefix: String,

    /// Requests allowed per subject per one-minute window.
    pub limit_per_minute: u64,
}

fn default_rate_limit_prefix() -> String {
    "ratelimit".to_string()
}

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "trace", "debug", "info", "warn", "error"). Defaults to `"info"`.
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "pretty".to_string() }
    }
}

/// Status server settings for the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_bind_port() -> u16 {
    3030
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind_address: default_bind_address(), bind_port: default_bind_port() }
    }
}

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,

    #[serde(default)]
    pub stores: HashMap<String, StoreConfig>,

    #[serde(default)]
    pub hub: HubConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl AppConfig {
    /// Loads configuration from a TOML file with environment variable overrides.
    ///
    /// Environment variables with the `CHAINMUX__` prefix override any value, using `__`
    /// as the nesting separator (e.g. `CHAINMUX__HUB__BACKEND=stream`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or deserialized.
    pub fn from_file<P: AsRef<Path>>(config_path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            .set_default("server.bind_address", "127.0.0.1")?
            .set_default("server.bind_port", 3030)?
            .add_source(File::with_name(&config_path.as_ref().to_string_lossy()).required(false))
            .add_source(Environment::with_prefix("CHAINMUX").separator("__"))
            .build()?
            .try_deserialize()
    }

    /// Loads configuration from `config/config.toml`, or the path in `CHAINMUX_CONFIG`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the configuration cannot be loaded or parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            std::env::var("CHAINMUX_CONFIG").unwrap_or_else(|_| "config/config.toml".to_string());
        Self::from_file(&config_path)
    }

    /// Validates cross-references and URL shapes.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigValidationError`] found.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        for (name, endpoint) in &self.endpoints {
            if endpoint.chain.is_empty() {
                return Err(ConfigValidationError::EmptyChain(name.clone()));
            }
            if !endpoint.url.starts_with("http") {
                return Err(ConfigValidationError::InvalidUrl(name.clone(), endpoint.url.clone()));
            }
            if let Some(streaming) = &endpoint.streaming_url {
                if !streaming.starts_with("ws") {
                    return Err(ConfigValidationError::InvalidStreamingUrl(
                        name.clone(),
                        streaming.clone(),
                    ));
                }
            }
        }

        match (&self.hub.backend, &self.hub.store) {
            (HubBackend::Memory, _) => {}
            (backend, None) => return Err(ConfigValidationError::HubStoreMissing(backend.as_str())),
            (_, Some(store)) => self.check_store("hub", store)?,
        }
        if let Some(presence) = &self.cache.presence {
            self.check_store("presence cache", &presence.store)?;
        }
        if let Some(result) = &self.cache.result {
            self.check_store("result cache", &result.store)?;
        }
        if let Some(rate_limit) = &self.rate_limit {
            self.check_store("rate limiter", &rate_limit.store)?;
        }

        if !["json", "pretty"].contains(&self.logging.format.as_str()) {
            return Err(ConfigValidationError::LoggingFormat);
        }

        Ok(())
    }

    fn check_store(&self, component: &'static str, store: &str) -> Result<(), ConfigValidationError> {
        if self.stores.contains_key(store) {
            Ok(())
        } else {
            Err(ConfigValidationError::UnknownStore { component, store: store.to_string() })
        }
    }

    /// Returns the parsed socket address for the status server.
    ///
    /// # Errors
    ///
    /// Returns an error string if the address cannot be parsed.
    pub fn socket_addr(&self) -> Result<std::net::SocketAddr, String> {
        format!("{}:{}", self.server.bind_address, self.server.bind_port)
            .parse()
            .map_err(|_| {
                format!(
                    "Invalid socket address: {}:{}",
                    self.server.bind_address, self.server.bind_port
                )
            })
    }
}
