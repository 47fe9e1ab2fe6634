use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::OnceCell;

use crate::{
    config::EndpointConfig,
    types::{Block, ChainRef},
    upstream::{
        http_client::{HttpClient, HttpClientConfig},
        UpstreamError,
    },
};

/// One configured upstream node plus its runtime health and tip.
///
/// Identity is the name, fixed at construction. Health and tip are written only by the sync
/// updater; the transport is created on first use and a racing initialiser simply loses.
/// Endpoints start healthy with no known tip.
pub struct Endpoint {
    name: String,
    config: EndpointConfig,
    skip_methods: HashSet<String>,
    healthy: AtomicBool,
    tip: ArcSwapOption<Block>,
    client_version: ArcSwapOption<String>,
    http: OnceCell<HttpClient>,
    http_config: HttpClientConfig,
}

/// Read-only view of an endpoint for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointStatus {
    pub name: String,
    pub chain: ChainRef,
    pub url: String,
    pub healthy: bool,
    pub tip: Option<Block>,
    pub client_version: Option<String>,
    pub weight: u64,
}

impl Endpoint {
    #[must_use]
    pub fn new(name: impl Into<String>, config: EndpointConfig) -> Self {
        Self::with_http_config(name, config, HttpClientConfig::default())
    }

    #[must_use]
    pub fn with_http_config(
        name: impl Into<String>,
        config: EndpointConfig,
        http_config: HttpClientConfig,
    ) -> Self {
        let skip_methods = config.skip_methods.iter().cloned().collect();
        Self {
            name: name.into(),
            config,
            skip_methods,
            healthy: AtomicBool::new(true),
            tip: ArcSwapOption::empty(),
            client_version: ArcSwapOption::empty(),
            http: OnceCell::new(),
            http_config,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn chain(&self) -> &ChainRef {
        &self.config.chain
    }

    #[must_use]
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    #[must_use]
    pub fn http_config(&self) -> &HttpClientConfig {
        &self.http_config
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    #[must_use]
    pub fn streaming_url(&self) -> Option<&str> {
        self.config.streaming_url.as_deref()
    }

    #[must_use]
    pub fn weight(&self) -> u64 {
        self.config.effective_weight()
    }

    #[must_use]
    pub fn fetch_interval(&self) -> Duration {
        self.config.fetch_interval()
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Returns `false` if `method` is on this endpoint's skip list. An empty method is
    /// always supported.
    #[must_use]
    pub fn supports(&self, method: &str) -> bool {
        method.is_empty() || !self.skip_methods.contains(method)
    }

    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn tip(&self) -> Option<Block> {
        self.tip.load().as_deref().cloned()
    }

    /// Tip height, or `0` when no tip is known yet.
    #[must_use]
    pub fn tip_height(&self) -> u64 {
        self.tip.load().as_ref().map_or(0, |block| block.height)
    }

    #[must_use]
    pub fn client_version(&self) -> Option<String> {
        self.client_version.load().as_deref().cloned()
    }

    /// Returns the endpoint's HTTP transport, building it on first call.
    ///
    /// # Errors
    ///
    /// Returns the construction error if the client cannot be built. The next call retries.
    pub async fn http_client(&self) -> Result<&HttpClient, UpstreamError> {
        self.http
            .get_or_try_init(|| async {
                tracing::debug!(endpoint = %self.name, "creating http transport");
                HttpClient::for_endpoint(&self.config, &self.http_config)
            })
            .await
    }

    #[must_use]
    pub fn status(&self) -> EndpointStatus {
        EndpointStatus {
            name: self.name.clone(),
            chain: self.config.chain.clone(),
            url: self.config.url.clone(),
            healthy: self.is_healthy(),
            tip: self.tip(),
            client_version: self.client_version(),
            weight: self.weight(),
        }
    }

    /// Returns the previous value.
    pub(crate) fn set_healthy(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::AcqRel)
    }

    pub(crate) fn set_tip(&self, tip: Option<Block>) {
        self.tip.store(tip.map(Arc::new));
    }

    pub(crate) fn set_client_version(&self, version: String) {
        self.client_version.store(Some(Arc::new(version)));
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("chain", &self.config.chain)
            .field("healthy", &self.is_healthy())
            .field("tip", &self.tip())
            .finish_non_exhaustive()
    }
}
