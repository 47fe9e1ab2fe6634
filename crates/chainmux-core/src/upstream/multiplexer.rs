use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    cache::{PresenceCache, ResultCache},
    config::{EndpointConfig, SyncConfig},
    delegator::{Delegator, DelegatorFactory},
    hub::ChainStatusHub,
    middleware::FixedWindowRateLimiter,
    store::StorePool,
    sync::{self, SyncHandle},
    types::ChainRef,
    upstream::{
        endpoint::{Endpoint, EndpointStatus},
        endpoint_set::EndpointSet,
        http_client::HttpClientConfig,
    },
};

/// Errors raised while registering endpoints or changing the registry lifecycle.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum MultiplexerError {
    #[error("endpoint {0:?} is already registered")]
    DuplicateEndpoint(String),

    #[error("endpoint {0:?} has an empty chain brand or network")]
    EmptyChain(String),

    #[error("endpoint {endpoint:?} uses chain brand {brand:?}, which has no delegator")]
    UnknownBrand { endpoint: String, brand: String },

    #[error("operation not allowed while syncing")]
    SyncActive,
}

/// The endpoint registry.
///
/// Owns the name index and the chain index and exposes selection over them. Everything
/// else a request path or sync task needs (hub, delegators, stores, caches, rate limiter)
/// is reachable from here, so one value can be passed around instead of process globals.
///
/// Lifecycle: build → [`load_config`](Self::load_config) → [`start_sync`](Self::start_sync)
/// → [`stop_sync`](Self::stop_sync). Syncing is active exactly while a sync handle is held.
pub struct Multiplexer {
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    chains: RwLock<HashMap<ChainRef, Arc<EndpointSet>>>,
    hub: Arc<dyn ChainStatusHub>,
    delegators: DelegatorFactory,
    stores: Arc<StorePool>,
    presence: Option<PresenceCache>,
    results: Option<ResultCache>,
    rate_limiter: Option<FixedWindowRateLimiter>,
    sync_config: SyncConfig,
    http_config: HttpClientConfig,
    sync: Mutex<Option<SyncHandle>>,
    fatal: CancellationToken,
}

impl Multiplexer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        hub: Arc<dyn ChainStatusHub>,
        delegators: DelegatorFactory,
        stores: Arc<StorePool>,
        presence: Option<PresenceCache>,
        results: Option<ResultCache>,
        rate_limiter: Option<FixedWindowRateLimiter>,
        sync_config: SyncConfig,
        http_config: HttpClientConfig,
    ) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            chains: RwLock::new(HashMap::new()),
            hub,
            delegators,
            stores,
            presence,
            results,
            rate_limiter,
            sync_config,
            http_config,
            sync: Mutex::new(None),
            fatal: CancellationToken::new(),
        }
    }

    /// Registers an endpoint in both indices.
    ///
    /// The endpoint keeps the HTTP settings it was built with; use [`Self::add_config`] to
    /// register a config with the registry's own [`HttpClientConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::DuplicateEndpoint`] if the name is taken; the registry is
    /// left unchanged. Returns [`MultiplexerError::EmptyChain`] for an incomplete chain.
    pub fn add(&self, endpoint: Endpoint) -> Result<Arc<Endpoint>, MultiplexerError> {
        if endpoint.chain().is_empty() {
            return Err(MultiplexerError::EmptyChain(endpoint.name().to_string()));
        }

        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(endpoint.name()) {
            return Err(MultiplexerError::DuplicateEndpoint(endpoint.name().to_string()));
        }

        let endpoint = Arc::new(endpoint);
        endpoints.insert(endpoint.name().to_string(), endpoint.clone());
        let set = self
            .chains
            .write()
            .entry(endpoint.chain().clone())
            .or_insert_with(|| Arc::new(EndpointSet::new(endpoint.chain().clone())))
            .clone();
        set.push(endpoint.clone());

        tracing::info!(
            endpoint = %endpoint.name(),
            chain = %endpoint.chain(),
            weight = endpoint.weight(),
            "endpoint registered"
        );
        Ok(endpoint)
    }

    /// Registers an endpoint built from `config` with the registry's HTTP settings.
    ///
    /// # Errors
    ///
    /// Same as [`Self::add`].
    pub fn add_config(
        &self,
        name: impl Into<String>,
        config: EndpointConfig,
    ) -> Result<Arc<Endpoint>, MultiplexerError> {
        self.add(Endpoint::with_http_config(name, config, self.http_config.clone()))
    }

    /// Registers every configured endpoint, in name order.
    ///
    /// # Errors
    ///
    /// Fails on the first endpoint whose brand has no delegator, or that cannot be added.
    pub fn load_config(
        &self,
        endpoints: &HashMap<String, EndpointConfig>,
    ) -> Result<(), MultiplexerError> {
        let mut names: Vec<&String> = endpoints.keys().collect();
        names.sort();
        for name in names {
            let config = &endpoints[name];
            if !self.delegators.contains(&config.chain.brand) {
                return Err(MultiplexerError::UnknownBrand {
                    endpoint: name.clone(),
                    brand: config.chain.brand.clone(),
                });
            }
            self.add_config(name.clone(), config.clone())?;
        }
        Ok(())
    }

    /// Removes every endpoint and chain.
    ///
    /// # Errors
    ///
    /// Returns [`MultiplexerError::SyncActive`] while syncing.
    pub fn reset(&self) -> Result<(), MultiplexerError> {
        let guard = self.sync.try_lock().map_err(|_| MultiplexerError::SyncActive)?;
        if guard.is_some() {
            return Err(MultiplexerError::SyncActive);
        }
        self.endpoints.write().clear();
        self.chains.write().clear();
        tracing::info!("registry reset");
        Ok(())
    }

    #[must_use]
    pub fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.read().get(name).cloned()
    }

    /// Every endpoint, in name order.
    #[must_use]
    pub fn endpoints(&self) -> Vec<Arc<Endpoint>> {
        let mut endpoints: Vec<_> = self.endpoints.read().values().cloned().collect();
        endpoints.sort_by(|a, b| a.name().cmp(b.name()));
        endpoints
    }

    #[must_use]
    pub fn endpoint_set(&self, chain: &ChainRef) -> Option<Arc<EndpointSet>> {
        self.chains.read().get(chain).cloned()
    }

    #[must_use]
    pub fn chains(&self) -> Vec<ChainRef> {
        let mut chains: Vec<_> = self.chains.read().keys().cloned().collect();
        chains.sort();
        chains
    }

    /// Round-robin selection of a healthy endpoint of `chain` that supports `method`.
    #[must_use]
    pub fn select(&self, chain: &ChainRef, method: &str) -> Option<Arc<Endpoint>> {
        self.endpoint_set(chain)?.select(method)
    }

    /// Selection with a freshness requirement. See [`EndpointSet::select_over_height`].
    #[must_use]
    pub fn select_over_height(
        &self,
        chain: &ChainRef,
        method: &str,
        height_spec: i64,
    ) -> Option<Arc<Endpoint>> {
        self.endpoint_set(chain)?.select_over_height(method, height_spec)
    }

    #[must_use]
    pub fn weight_search(&self, chain: &ChainRef, x: i64) -> Option<Arc<Endpoint>> {
        self.endpoint_set(chain)?.weight_search(x)
    }

    #[must_use]
    pub fn weighted_random(&self, chain: &ChainRef) -> Option<Arc<Endpoint>> {
        self.endpoint_set(chain)?.weighted_random()
    }

    #[must_use]
    pub fn max_tip_height(&self, chain: &ChainRef) -> Option<u64> {
        self.endpoint_set(chain).map(|set| set.max_tip_height())
    }

    /// Snapshot of every endpoint, in name order.
    #[must_use]
    pub fn status(&self) -> Vec<EndpointStatus> {
        self.endpoints().iter().map(|endpoint| endpoint.status()).collect()
    }

    #[must_use]
    pub fn hub(&self) -> &Arc<dyn ChainStatusHub> {
        &self.hub
    }

    #[must_use]
    pub fn delegators(&self) -> &DelegatorFactory {
        &self.delegators
    }

    #[must_use]
    pub fn delegator_for(&self, chain: &ChainRef) -> Option<Arc<dyn Delegator>> {
        self.delegators.get(&chain.brand)
    }

    #[must_use]
    pub fn stores(&self) -> &Arc<StorePool> {
        &self.stores
    }

    #[must_use]
    pub fn presence_cache(&self) -> Option<&PresenceCache> {
        self.presence.as_ref()
    }

    #[must_use]
    pub fn result_cache(&self) -> Option<&ResultCache> {
        self.results.as_ref()
    }

    #[must_use]
    pub fn rate_limiter(&self) -> Option<&FixedWindowRateLimiter> {
        self.rate_limiter.as_ref()
    }

    #[must_use]
    pub fn sync_config(&self) -> &SyncConfig {
        &self.sync_config
    }

    /// Fires if the hub run loop dies. The process is expected to exit and be restarted.
    #[must_use]
    pub fn fatal_signal(&self) -> CancellationToken {
        self.fatal.clone()
    }

    pub async fn is_syncing(&self) -> bool {
        self.sync.lock().await.is_some()
    }

    /// Starts the hub, the updater, and one sync task per endpoint.
    ///
    /// Returns `false` without doing anything if syncing is already active.
    pub async fn start_sync(self: &Arc<Self>) -> bool {
        let mut guard = self.sync.lock().await;
        if guard.is_some() {
            return false;
        }
        *guard = Some(sync::start(self).await);
        true
    }

    /// Cancels every sync task and waits for them to finish.
    ///
    /// Returns `false` if syncing was not active.
    pub async fn stop_sync(&self) -> bool {
        let handle = self.sync.lock().await.take();
        match handle {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }
}
