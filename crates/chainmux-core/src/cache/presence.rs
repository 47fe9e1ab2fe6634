use rand::Rng;
use std::{sync::Arc, time::Duration};

use crate::{
    store::Store,
    types::ChainRef,
    upstream::{Endpoint, Multiplexer},
};

/// Remembers which endpoints have seen an identifier, such as a transaction hash.
///
/// Each identifier maps to a sorted set `{prefix}:{brand}:{network}:{id}` whose members are
/// endpoint names, each expiring on its own after the configured TTL. Reads and writes are
/// best effort: store errors are logged and behave like a miss.
pub struct PresenceCache {
    store: Arc<dyn Store>,
    prefix: String,
    ttl: Duration,
}

impl PresenceCache {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self { store, prefix: prefix.into(), ttl }
    }

    fn key(&self, chain: &ChainRef, id: &str) -> String {
        format!("{}:{}:{id}", self.prefix, chain.key_fragment())
    }

    /// Records that `endpoint` has observed `id`.
    pub async fn record(&self, chain: &ChainRef, id: &str, endpoint: &str) {
        if let Err(e) = self.store.zadd_expiring(&self.key(chain, id), endpoint, self.ttl).await {
            tracing::warn!(chain = %chain, id = id, endpoint = endpoint, error = %e, "presence cache write failed");
        }
    }

    /// Returns a healthy endpoint known to have observed `id` that supports `method`.
    ///
    /// Tries one random member first, then falls back to scanning the set in order.
    pub async fn lookup(
        &self,
        registry: &Multiplexer,
        chain: &ChainRef,
        id: &str,
        method: &str,
    ) -> Option<Arc<Endpoint>> {
        let members = match self.store.zlive_members(&self.key(chain, id)).await {
            Ok(members) => members,
            Err(e) => {
                tracing::warn!(chain = %chain, id = id, error = %e, "presence cache read failed");
                return None;
            }
        };
        if members.is_empty() {
            return None;
        }

        let usable = |name: &str| {
            registry
                .endpoint(name)
                .filter(|e| e.chain() == chain && e.is_healthy() && e.supports(method))
        };

        let pick = rand::rng().random_range(0..members.len());
        usable(&members[pick]).or_else(|| members.iter().find_map(|name| usable(name)))
    }
}
