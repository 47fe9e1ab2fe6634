//! Shared key/value store used by the hub backends, the caches, and the rate limiter.
//!
//! The [`Store`] trait covers the handful of Redis operations the core needs. Two
//! implementations exist: [`RedisStore`] for deployments and [`MemoryStore`] for single-node
//! runs and tests. [`StorePool`] resolves logical store names from configuration into shared
//! handles, creating each one on first use.

mod memory;
mod redis;

pub use self::{memory::MemoryStore, redis::RedisStore};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::{collections::HashMap, fmt, str::FromStr, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use crate::config::StoreConfig;

/// Field under which stream entries carry their payload.
pub const STREAM_PAYLOAD_FIELD: &str = "data";

/// Errors raised by store operations and store construction.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("malformed store payload: {0}")]
    Malformed(String),

    #[error("invalid store url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("store {0:?} is not declared")]
    UnknownStore(String),

    #[error("subscription closed")]
    SubscriptionClosed,
}

/// Identifier of an entry in a capped log, ordered by `(millis, seq)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamId {
    pub millis: u64,
    pub seq: u64,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for StreamId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || StoreError::Malformed(format!("stream id {s:?}"));
        let (millis, seq) = s.split_once('-').ok_or_else(malformed)?;
        Ok(Self {
            millis: millis.parse().map_err(|_| malformed())?,
            seq: seq.parse().map_err(|_| malformed())?,
        })
    }
}

/// One entry read from a capped log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub payload: String,
}

/// Stream of pub/sub payloads. Ends when the underlying subscription is lost.
pub type MessageStream = BoxStream<'static, Result<String, StoreError>>;

/// Operations the core performs against a shared store.
///
/// All methods are safe to call concurrently from many tasks.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Reads several keys at once. The result is aligned with `keys`.
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Returns every key starting with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;

    /// Attaches to a broadcast channel. Only messages published after attach are delivered.
    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError>;

    /// Appends to a log capped at roughly `max_len` entries. Returns the new entry id.
    async fn xadd_capped(
        &self,
        key: &str,
        payload: &str,
        max_len: usize,
    ) -> Result<String, StoreError>;

    /// Returns up to `count` entries, newest first.
    async fn xrevrange(&self, key: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError>;

    /// Returns up to `count` entries strictly after `after_id`, oldest first.
    async fn xrange_after(
        &self,
        key: &str,
        after_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError>;

    /// Adds `member` to a sorted set where it stays live for `ttl`. The key itself lives
    /// at least as long as its newest member.
    async fn zadd_expiring(&self, key: &str, member: &str, ttl: Duration)
        -> Result<(), StoreError>;

    /// Returns the members of a sorted set whose expiry has not passed.
    async fn zlive_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Increments a hash field and returns the new value.
    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: i64) -> Result<(), StoreError>;

    /// Sets an expiry only if the key has none. Returns `true` if the expiry was set.
    async fn expire_nx(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;
}

/// Builds a store from its configuration.
///
/// Returns `Ok(None)` for well-formed URLs with an unsupported scheme.
///
/// # Errors
///
/// Returns [`StoreError::InvalidUrl`] if the URL cannot be parsed, or a connection error if a
/// Redis client cannot be created.
pub async fn connect(config: &StoreConfig) -> Result<Option<Arc<dyn Store>>, StoreError> {
    let url = Url::parse(&config.url)
        .map_err(|e| StoreError::InvalidUrl { url: config.url.clone(), reason: e.to_string() })?;

    match url.scheme() {
        "redis" | "rediss" => Ok(Some(Arc::new(RedisStore::connect(&config.url).await?))),
        "memory" => Ok(Some(Arc::new(MemoryStore::new()))),
        scheme => {
            tracing::warn!(scheme = scheme, "ignoring store with unsupported scheme");
            Ok(None)
        }
    }
}

/// Lazily-populated pool of stores keyed by logical name.
///
/// Each name is connected once and the handle is shared by every component that asks for it.
pub struct StorePool {
    configs: HashMap<String, StoreConfig>,
    stores: Mutex<HashMap<String, Option<Arc<dyn Store>>>>,
}

impl StorePool {
    #[must_use]
    pub fn new(configs: HashMap<String, StoreConfig>) -> Self {
        Self { configs, stores: Mutex::new(HashMap::new()) }
    }

    /// Registers an already-built store under `name`. Used by tests and embedders.
    pub async fn insert(&self, name: impl Into<String>, store: Arc<dyn Store>) {
        self.stores.lock().await.insert(name.into(), Some(store));
    }

    /// Returns the store for `name`, connecting it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownStore`] if `name` is not configured, or the connection
    /// error if the store cannot be built.
    pub async fn get(&self, name: &str) -> Result<Option<Arc<dyn Store>>, StoreError> {
        let mut stores = self.stores.lock().await;
        if let Some(existing) = stores.get(name) {
            return Ok(existing.clone());
        }

        let config =
            self.configs.get(name).ok_or_else(|| StoreError::UnknownStore(name.to_string()))?;
        let store = connect(config).await?;
        tracing::info!(store = name, supported = store.is_some(), "store initialized");
        stores.insert(name.to_string(), store.clone());
        Ok(store)
    }
}
