use sha2::{Digest, Sha256};
use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::{
    store::Store,
    types::{ChainRef, JsonRpcRequest},
    upstream::Multiplexer,
};

/// A result served from the cache, with the endpoint that originally produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedResult {
    pub result: serde_json::Value,
    pub endpoint: String,
}

/// Caches results of idempotent JSON-RPC calls.
///
/// Only methods on the allow-list are cached, each with its own TTL. Entries are written per
/// answering endpoint under `{prefix}:{brand}:{network}:{delegator prefix}:{fingerprint}:{endpoint}`
/// and looked up across every endpoint of the chain in one multi-get. Store errors are logged
/// and behave like a miss.
pub struct ResultCache {
    store: Arc<dyn Store>,
    prefix: String,
    methods: HashMap<String, Duration>,
}

impl ResultCache {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>, methods: HashMap<String, Duration>) -> Self {
        Self { store, prefix: prefix.into(), methods }
    }

    #[must_use]
    pub fn is_cacheable(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// SHA-256 over the method name and canonical JSON of the params.
    #[must_use]
    pub fn fingerprint(request: &JsonRpcRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.method.as_bytes());
        hasher.update([0u8]);
        if let Some(params) = &request.params {
            hasher.update(params.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    fn key(&self, chain: &ChainRef, key_prefix: &str, fingerprint: &str, endpoint: &str) -> String {
        format!("{}:{}:{key_prefix}:{fingerprint}:{endpoint}", self.prefix, chain.key_fragment())
    }

    /// Looks up a cached result for `request` from any endpoint of `chain`.
    pub async fn lookup(
        &self,
        registry: &Multiplexer,
        chain: &ChainRef,
        key_prefix: &str,
        request: &JsonRpcRequest,
    ) -> Option<CachedResult> {
        if !self.is_cacheable(&request.method) {
            return None;
        }
        let set = registry.endpoint_set(chain)?;
        let fingerprint = Self::fingerprint(request);
        let members = set.members();
        let keys: Vec<String> = members
            .iter()
            .map(|endpoint| self.key(chain, key_prefix, &fingerprint, endpoint.name()))
            .collect();

        let values = match self.store.mget(&keys).await {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!(chain = %chain, method = %request.method, error = %e, "result cache read failed");
                return None;
            }
        };

        members.iter().zip(values).find_map(|(endpoint, value)| {
            let value = value?;
            match serde_json::from_str(&value) {
                Ok(result) => Some(CachedResult { result, endpoint: endpoint.name().to_string() }),
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint.name(), error = %e, "discarding malformed cached result");
                    None
                }
            }
        })
    }

    /// Stores `result` as produced by `endpoint`, if the method is cacheable.
    pub async fn store(
        &self,
        chain: &ChainRef,
        key_prefix: &str,
        request: &JsonRpcRequest,
        endpoint: &str,
        result: &serde_json::Value,
    ) {
        let Some(ttl) = self.methods.get(&request.method) else { return };
        let key = self.key(chain, key_prefix, &Self::fingerprint(request), endpoint);
        if let Err(e) = self.store.set_ex(&key, &result.to_string(), *ttl).await {
            tracing::warn!(chain = %chain, method = %request.method, error = %e, "result cache write failed");
        }
    }
}
