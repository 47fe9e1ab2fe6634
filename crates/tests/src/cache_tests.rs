//! Caches and rate limiting built from configuration over a `memory://` store.

use crate::mock_infrastructure::{endpoint_config, eth_mainnet, NodeMock};
use chainmux_core::{
    config::{AppConfig, CachedMethod, PresenceCacheConfig, RateLimitConfig, ResultCacheConfig, StoreConfig},
    delegator::{Delegator, DelegatorFactory, EvmDelegator},
    types::JsonRpcRequest,
    upstream::{Multiplexer, MultiplexerBuilder},
};
use serde_json::json;

fn cached_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.stores.insert("local".to_string(), StoreConfig { url: "memory://".to_string() });
    config.cache.presence = Some(PresenceCacheConfig {
        store: "local".to_string(),
        prefix: "presence".to_string(),
        ttl_seconds: 60,
    });
    config.cache.result = Some(ResultCacheConfig {
        store: "local".to_string(),
        prefix: "result".to_string(),
        methods: vec![CachedMethod::new("eth_chainId", 60)],
    });
    config.rate_limit = Some(RateLimitConfig {
        store: "local".to_string(),
        prefix: "ratelimit".to_string(),
        limit_per_minute: 5,
    });
    config
}

async fn build(config: &AppConfig) -> Multiplexer {
    let registry = MultiplexerBuilder::from_config(config, DelegatorFactory::with_defaults())
        .await
        .unwrap()
        .build();
    registry.load_config(&config.endpoints).unwrap();
    registry
}

#[tokio::test]
async fn test_result_cache_serves_repeated_calls() {
    let mut node = NodeMock::new().await;
    let chain_id = node.expect_method("eth_chainId", &json!("0x1"), 1).await;
    let block_number = node.expect_method("eth_blockNumber", &json!("0x10"), 2).await;

    let mut config = cached_config();
    config.endpoints.insert("a".to_string(), endpoint_config(&node.url(), 1));
    let registry = build(&config).await;
    let delegator = EvmDelegator::new();

    for id in 0..3 {
        let request = JsonRpcRequest::new("eth_chainId", None, json!(id));
        let response = delegator.delegate_rpc(&registry, &eth_mainnet(), request).await.unwrap();
        assert_eq!(response.result, Some(json!("0x1")));
    }
    chain_id.assert_async().await;

    for id in 0..2 {
        let request = JsonRpcRequest::new("eth_blockNumber", None, json!(id));
        delegator.delegate_rpc(&registry, &eth_mainnet(), request).await.unwrap();
    }
    block_number.assert_async().await;
}

#[tokio::test]
async fn test_presence_cache_pins_receipts_to_submitting_endpoint() {
    let tx_hash = format!("0x{:064x}", 0xfeed);
    let mut submitter = NodeMock::new().await;
    let mut other = NodeMock::new().await;
    submitter.mock_method("eth_sendRawTransaction", &json!(tx_hash)).await;
    let pinned = submitter.expect_method("eth_getTransactionReceipt", &json!({"status": "0x1"}), 4).await;
    let bypassed = other.expect_method("eth_getTransactionReceipt", &json!(null), 0).await;

    let mut config = cached_config();
    config.endpoints.insert("submitter".to_string(), endpoint_config(&submitter.url(), 1));
    let mut other_config = endpoint_config(&other.url(), 1);
    other_config.skip_methods = vec!["eth_sendRawTransaction".to_string()];
    config.endpoints.insert("other".to_string(), other_config);
    let registry = build(&config).await;
    let delegator = EvmDelegator::new();

    let send = JsonRpcRequest::new("eth_sendRawTransaction", Some(json!(["0x02f8"])), json!(1));
    let sent = delegator.delegate_rpc(&registry, &eth_mainnet(), send).await.unwrap();
    assert_eq!(sent.result, Some(json!(tx_hash)));

    for id in 0..4 {
        let receipt = JsonRpcRequest::new("eth_getTransactionReceipt", Some(json!([tx_hash])), json!(id));
        let response = delegator.delegate_rpc(&registry, &eth_mainnet(), receipt).await.unwrap();
        assert_eq!(response.result, Some(json!({"status": "0x1"})));
    }
    pinned.assert_async().await;
    bypassed.assert_async().await;
}

#[tokio::test]
async fn test_rate_limiter_counts_per_subject() {
    let registry = build(&cached_config()).await;
    let limiter = registry.rate_limiter().unwrap();
    let now = 1_700_000_040;

    for _ in 0..5 {
        assert!(limiter.check_at("client-1", now).await);
    }
    assert!(!limiter.check_at("client-1", now + 5).await);
    assert!(limiter.check_at("client-2", now + 5).await);
    assert!(limiter.check_at("client-1", now + 60).await);
}

#[tokio::test]
async fn test_components_share_one_store_instance() {
    let registry = build(&cached_config()).await;
    let first = registry.stores().get("local").await.unwrap().unwrap();
    let second = registry.stores().get("local").await.unwrap().unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
}
