//! Sync engine against mock nodes.

use crate::mock_infrastructure::{
    block_hash, endpoint_config, eth_mainnet, registry_with, wait_until, MockWebSocketServer, NodeMock,
};
use chainmux_core::{
    config::SyncConfig,
    types::Block,
    upstream::{Endpoint, Multiplexer, MultiplexerBuilder, MultiplexerError},
};
use std::{sync::Arc, time::Duration};

const CONVERGE: Duration = Duration::from_secs(5);

fn fast_sync_registry(endpoints: Vec<(&str, chainmux_core::config::EndpointConfig)>) -> Arc<Multiplexer> {
    let registry = MultiplexerBuilder::new()
        .sync_config(SyncConfig { failure_interval_seconds: 1, push_reconnect_delay_seconds: 1 })
        .build();
    for (name, config) in endpoints {
        registry.add(Endpoint::new(name, config)).unwrap();
    }
    Arc::new(registry)
}

#[tokio::test]
async fn test_poll_sync_tracks_tip_and_client_version() {
    let mut node = NodeMock::new().await;
    node.set_tip(100).await;
    node.mock_client_version("Geth/v1.14.0").await;

    let registry = registry_with(vec![("a", endpoint_config(&node.url(), 1))]);
    assert!(registry.start_sync().await);

    let endpoint = registry.endpoint("a").unwrap();
    assert!(wait_until(CONVERGE, || endpoint.tip_height() == 100).await);
    assert_eq!(endpoint.tip(), Some(Block::new(100, Some(block_hash(100)))));
    assert!(wait_until(CONVERGE, || endpoint.client_version().is_some()).await);
    assert_eq!(endpoint.client_version().as_deref(), Some("Geth/v1.14.0"));

    node.set_tip(101).await;
    assert!(wait_until(CONVERGE, || endpoint.tip_height() == 101).await);
    assert_eq!(registry.max_tip_height(&eth_mainnet()), Some(101));

    assert!(registry.stop_sync().await);
}

#[tokio::test]
async fn test_failing_node_is_marked_unhealthy_and_recovers() {
    let mut node = NodeMock::new().await;
    node.fail_tip().await;

    let registry = fast_sync_registry(vec![("a", endpoint_config(&node.url(), 1))]);
    registry.start_sync().await;

    let endpoint = registry.endpoint("a").unwrap();
    assert!(wait_until(CONVERGE, || !endpoint.is_healthy()).await);
    assert!(registry.select(&eth_mainnet(), "").is_none());

    node.set_tip(7).await;
    assert!(wait_until(CONVERGE, || endpoint.is_healthy() && endpoint.tip_height() == 7).await);
    assert_eq!(registry.select(&eth_mainnet(), "").unwrap().name(), "a");

    registry.stop_sync().await;
}

#[tokio::test]
async fn test_rpc_error_from_tip_query_marks_unhealthy() {
    let mut node = NodeMock::new().await;
    node.mock_rpc_error("eth_getBlockByNumber", -32000, "header not found").await;

    let registry = fast_sync_registry(vec![("a", endpoint_config(&node.url(), 1))]);
    registry.start_sync().await;

    let endpoint = registry.endpoint("a").unwrap();
    assert!(wait_until(CONVERGE, || !endpoint.is_healthy()).await);
    registry.stop_sync().await;
}

#[tokio::test]
async fn test_sync_lifecycle_rules() {
    let mut node = NodeMock::new().await;
    node.set_tip(1).await;
    let registry = registry_with(vec![("a", endpoint_config(&node.url(), 1))]);

    assert!(!registry.is_syncing().await);
    assert!(registry.start_sync().await);
    assert!(!registry.start_sync().await);
    assert!(registry.is_syncing().await);
    assert_eq!(registry.reset(), Err(MultiplexerError::SyncActive));

    assert!(registry.stop_sync().await);
    assert!(!registry.stop_sync().await);
    registry.reset().unwrap();
    assert!(registry.endpoints().is_empty());
    assert!(registry.chains().is_empty());
}

#[tokio::test]
async fn test_sync_can_restart_after_stop() {
    let mut node = NodeMock::new().await;
    node.set_tip(5).await;
    let registry = registry_with(vec![("a", endpoint_config(&node.url(), 1))]);
    let endpoint = registry.endpoint("a").unwrap();

    registry.start_sync().await;
    assert!(wait_until(CONVERGE, || endpoint.tip_height() == 5).await);
    registry.stop_sync().await;

    node.set_tip(6).await;
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(endpoint.tip_height(), 5);

    registry.start_sync().await;
    assert!(wait_until(CONVERGE, || endpoint.tip_height() == 6).await);
    registry.stop_sync().await;
}

#[tokio::test]
async fn test_push_sync_follows_new_heads_and_reconnects() {
    let mut node = NodeMock::new().await;
    node.set_tip(50).await;
    let ws = MockWebSocketServer::new().await.unwrap();

    let mut config = endpoint_config(&node.url(), 3600);
    config.streaming_url = Some(ws.url());
    let registry = fast_sync_registry(vec![("a", config)]);
    registry.start_sync().await;

    let endpoint = registry.endpoint("a").unwrap();
    assert!(wait_until(CONVERGE, || endpoint.tip_height() == 50).await);
    assert!(ws.wait_for_subscriptions(1, CONVERGE).await);

    ws.push_head(51);
    assert!(wait_until(CONVERGE, || endpoint.tip_height() == 51).await);

    ws.close_all();
    assert!(ws.wait_for_subscriptions(2, CONVERGE).await);
    ws.push_head(52);
    assert!(wait_until(CONVERGE, || endpoint.tip_height() == 52 && endpoint.is_healthy()).await);
    assert_eq!(registry.max_tip_height(&eth_mainnet()), Some(52));

    registry.stop_sync().await;
}
