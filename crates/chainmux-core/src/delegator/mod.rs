//! Per-chain adapters.
//!
//! The core knows nothing about a chain's native API. A [`Delegator`] supplies tip
//! retrieval and handles requests for one protocol; the [`DelegatorFactory`] maps chain brands
//! to delegators. Adding a chain means registering one more delegator.

pub mod evm;

pub use evm::EvmDelegator;

use async_trait::async_trait;
use serde::Serialize;
use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    sync::SyncContext,
    types::{Block, ChainRef, JsonRpcRequest, JsonRpcResponse},
    upstream::{Endpoint, Multiplexer, RelayedResponse, RestRequest, UpstreamError},
};

/// Request protocol a delegator serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    JsonRpc,
    Rest,
    GraphQl,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::JsonRpc => "jsonrpc",
            Self::Rest => "rest",
            Self::GraphQl => "graphql",
        })
    }
}

/// Capability set of one chain brand.
///
/// Only [`protocol`](Delegator::protocol) and [`get_tip`](Delegator::get_tip) are required.
/// The `delegate_*` method matching the protocol should be overridden; the others keep their
/// default, which reports the protocol as unsupported.
#[async_trait]
pub trait Delegator: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Fetches the endpoint's current tip.
    async fn get_tip(&self, registry: &Multiplexer, endpoint: &Endpoint)
        -> Result<Block, UpstreamError>;

    /// Fetches the node's self-reported version. Best effort.
    async fn get_client_version(&self, _endpoint: &Endpoint) -> Result<String, UpstreamError> {
        Err(UpstreamError::Unsupported("client version".to_string()))
    }

    /// Lets the delegator take over tip tracking for `endpoint`.
    ///
    /// Returning `true` opts the endpoint out of the default poll loop; the delegator is
    /// then responsible for publishing its statuses, typically by spawning a push task on
    /// `ctx`.
    async fn start_sync(
        &self,
        _ctx: &SyncContext,
        _endpoint: &Arc<Endpoint>,
    ) -> Result<bool, UpstreamError> {
        Ok(false)
    }

    /// Namespace for this delegator's result-cache keys.
    fn cache_key_prefix(&self) -> &str {
        ""
    }

    async fn delegate_rpc(
        &self,
        _registry: &Multiplexer,
        _chain: &ChainRef,
        _request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        Err(UpstreamError::Unsupported(format!("{} delegator does not serve json-rpc", self.protocol())))
    }

    async fn delegate_rest(
        &self,
        _registry: &Multiplexer,
        _chain: &ChainRef,
        _request: RestRequest,
    ) -> Result<RelayedResponse, UpstreamError> {
        Err(UpstreamError::Unsupported(format!("{} delegator does not serve rest", self.protocol())))
    }

    async fn delegate_graphql(
        &self,
        _registry: &Multiplexer,
        _chain: &ChainRef,
        _request: RestRequest,
    ) -> Result<RelayedResponse, UpstreamError> {
        Err(UpstreamError::Unsupported(format!(
            "{} delegator does not serve graphql",
            self.protocol()
        )))
    }
}

/// Lookup table from chain brand to its delegator.
#[derive(Clone, Default)]
pub struct DelegatorFactory {
    delegators: HashMap<String, Arc<dyn Delegator>>,
}

impl DelegatorFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory with the delegators that ship with the core: `eth` → [`EvmDelegator`].
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new().with("eth", Arc::new(EvmDelegator::new()))
    }

    #[must_use]
    pub fn with(mut self, brand: impl Into<String>, delegator: Arc<dyn Delegator>) -> Self {
        self.register(brand, delegator);
        self
    }

    pub fn register(&mut self, brand: impl Into<String>, delegator: Arc<dyn Delegator>) {
        self.delegators.insert(brand.into(), delegator);
    }

    #[must_use]
    pub fn get(&self, brand: &str) -> Option<Arc<dyn Delegator>> {
        self.delegators.get(brand).cloned()
    }

    #[must_use]
    pub fn contains(&self, brand: &str) -> bool {
        self.delegators.contains_key(brand)
    }

    #[must_use]
    pub fn brands(&self) -> Vec<&str> {
        let mut brands: Vec<&str> = self.delegators.keys().map(String::as_str).collect();
        brands.sort_unstable();
        brands
    }
}
