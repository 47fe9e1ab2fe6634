//! Fixtures shared by the integration tests.

use chainmux_core::{
    config::EndpointConfig,
    delegator::DelegatorFactory,
    types::ChainRef,
    upstream::{Endpoint, Multiplexer, MultiplexerBuilder},
};
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};

#[must_use]
pub fn eth_mainnet() -> ChainRef {
    ChainRef::new("eth", "mainnet")
}

/// A `newHeads`-style block header. The hash encodes the height.
#[must_use]
pub fn block_header(height: u64) -> Value {
    json!({
        "number": format!("0x{height:x}"),
        "hash": format!("0x{height:064x}"),
        "parentHash": format!("0x{:064x}", height.saturating_sub(1)),
        "timestamp": format!("0x{:x}", 1_600_000_000 + height),
        "gasLimit": "0x1c9c380",
        "gasUsed": "0x0",
        "baseFeePerGas": "0x7"
    })
}

#[must_use]
pub fn block_hash(height: u64) -> String {
    format!("0x{height:064x}")
}

/// Endpoint config polling every `fetch_interval_secs`.
#[must_use]
pub fn endpoint_config(url: &str, fetch_interval_secs: i64) -> EndpointConfig {
    let mut config = EndpointConfig::new(eth_mainnet(), url);
    config.fetch_interval = fetch_interval_secs;
    config.timeout = 2;
    config
}

/// Registry with the default delegators and the given `(name, config)` endpoints.
///
/// # Panics
///
/// Panics on duplicate endpoint names.
#[must_use]
pub fn registry_with(endpoints: Vec<(&str, EndpointConfig)>) -> Arc<Multiplexer> {
    let registry = MultiplexerBuilder::new().delegators(DelegatorFactory::with_defaults()).build();
    for (name, config) in endpoints {
        registry.add(Endpoint::new(name, config)).expect("unique endpoint names");
    }
    Arc::new(registry)
}

/// Polls `condition` every 20ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_header_fields() {
        let header = block_header(100);
        assert_eq!(header["number"], "0x64");
        assert_eq!(header["hash"], block_hash(100));
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(50), || false).await);
        assert!(wait_until(Duration::from_millis(50), || true).await);
    }
}
