//! Builder pattern for constructing a [`Multiplexer`] with its collaborators.

use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;

use super::{http_client::HttpClientConfig, multiplexer::Multiplexer};
use crate::{
    cache::{PresenceCache, ResultCache},
    config::{AppConfig, SyncConfig},
    delegator::DelegatorFactory,
    hub::{build_hub, ChainStatusHub, HubError, LocalHub},
    middleware::FixedWindowRateLimiter,
    store::{Store, StoreError, StorePool},
};

/// Errors that can occur during multiplexer construction.
#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("store initialization failed: {0}")]
    Store(#[from] StoreError),

    #[error("hub initialization failed: {0}")]
    Hub(#[from] HubError),
}

/// Builder for constructing a [`Multiplexer`].
///
/// Defaults to an in-process hub, the built-in delegators, no stores, and no caches.
///
/// # Examples
///
/// ```no_run
/// # use chainmux_core::{config::AppConfig, delegator::DelegatorFactory, upstream::MultiplexerBuilder};
/// # use std::sync::Arc;
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = AppConfig::load()?;
/// let registry = Arc::new(
///     MultiplexerBuilder::from_config(&config, DelegatorFactory::with_defaults()).await?.build(),
/// );
/// registry.load_config(&config.endpoints)?;
/// registry.start_sync().await;
/// # Ok(())
/// # }
/// ```
pub struct MultiplexerBuilder {
    hub: Option<Arc<dyn ChainStatusHub>>,
    delegators: DelegatorFactory,
    stores: Option<Arc<StorePool>>,
    presence: Option<PresenceCache>,
    results: Option<ResultCache>,
    rate_limiter: Option<FixedWindowRateLimiter>,
    sync_config: SyncConfig,
    http_config: HttpClientConfig,
}

impl MultiplexerBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hub: None,
            delegators: DelegatorFactory::with_defaults(),
            stores: None,
            presence: None,
            results: None,
            rate_limiter: None,
            sync_config: SyncConfig::default(),
            http_config: HttpClientConfig::default(),
        }
    }

    /// Resolves every store-backed component named in `config`.
    ///
    /// Components whose store uses an unsupported scheme are left disabled.
    ///
    /// # Errors
    ///
    /// Returns [`BuilderError::Store`] for malformed or unreachable stores and
    /// [`BuilderError::Hub`] if a shared hub backend has no usable store.
    pub async fn from_config(
        config: &AppConfig,
        delegators: DelegatorFactory,
    ) -> Result<Self, BuilderError> {
        let stores = Arc::new(StorePool::new(config.stores.clone()));

        let hub_store = match &config.hub.store {
            Some(name) => stores.get(name).await?,
            None => None,
        };
        let hub = build_hub(&config.hub, hub_store)?;

        let mut builder = Self::new()
            .hub(hub)
            .delegators(delegators)
            .sync_config(config.sync.clone());

        if let Some(presence) = &config.cache.presence {
            if let Some(store) = Self::optional_store(&stores, &presence.store, "presence cache").await? {
                builder = builder.presence_cache(PresenceCache::new(
                    store,
                    presence.prefix.clone(),
                    Duration::from_secs(presence.ttl_seconds),
                ));
            }
        }

        if let Some(result) = &config.cache.result {
            if let Some(store) = Self::optional_store(&stores, &result.store, "result cache").await? {
                builder = builder.result_cache(ResultCache::new(
                    store,
                    result.prefix.clone(),
                    result.method_ttls(),
                ));
            }
        }

        if let Some(rate_limit) = &config.rate_limit {
            if let Some(store) = Self::optional_store(&stores, &rate_limit.store, "rate limiter").await? {
                builder = builder.rate_limiter(FixedWindowRateLimiter::new(
                    store,
                    rate_limit.prefix.clone(),
                    rate_limit.limit_per_minute,
                ));
            }
        }

        Ok(builder.stores(stores))
    }

    async fn optional_store(
        stores: &StorePool,
        name: &str,
        component: &str,
    ) -> Result<Option<Arc<dyn Store>>, StoreError> {
        let store = stores.get(name).await?;
        if store.is_none() {
            tracing::warn!(component = component, store = name, "store scheme unsupported, component disabled");
        }
        Ok(store)
    }

    #[must_use]
    pub fn hub(mut self, hub: Arc<dyn ChainStatusHub>) -> Self {
        self.hub = Some(hub);
        self
    }

    #[must_use]
    pub fn delegators(mut self, delegators: DelegatorFactory) -> Self {
        self.delegators = delegators;
        self
    }

    #[must_use]
    pub fn stores(mut self, stores: Arc<StorePool>) -> Self {
        self.stores = Some(stores);
        self
    }

    #[must_use]
    pub fn presence_cache(mut self, cache: PresenceCache) -> Self {
        self.presence = Some(cache);
        self
    }

    #[must_use]
    pub fn result_cache(mut self, cache: ResultCache) -> Self {
        self.results = Some(cache);
        self
    }

    #[must_use]
    pub fn rate_limiter(mut self, limiter: FixedWindowRateLimiter) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn sync_config(mut self, config: SyncConfig) -> Self {
        self.sync_config = config;
        self
    }

    #[must_use]
    pub fn http_config(mut self, config: HttpClientConfig) -> Self {
        self.http_config = config;
        self
    }

    #[must_use]
    pub fn build(self) -> Multiplexer {
        Multiplexer::new(
            self.hub.unwrap_or_else(|| Arc::new(LocalHub::new())),
            self.delegators,
            self.stores.unwrap_or_else(|| Arc::new(StorePool::new(HashMap::new()))),
            self.presence,
            self.results,
            self.rate_limiter,
            self.sync_config,
            self.http_config,
        )
    }
}

impl Default for MultiplexerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
