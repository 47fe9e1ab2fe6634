//! Selection reacting to upstream health with the sync engine running.

use crate::mock_infrastructure::{endpoint_config, eth_mainnet, registry_with, wait_until, NodeMock};
use chainmux_core::{
    sync::apply_status,
    types::{ChainStatus, JsonRpcRequest},
};
use serde_json::json;
use std::{collections::HashMap, time::Duration};

const CONVERGE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_height_aware_selection_follows_node_health() {
    let mut ahead = NodeMock::new().await;
    let mut behind = NodeMock::new().await;
    ahead.set_tip(10).await;
    behind.set_tip(8).await;

    let registry = registry_with(vec![
        ("a", endpoint_config(&ahead.url(), 1)),
        ("b", endpoint_config(&behind.url(), 1)),
    ]);
    registry.start_sync().await;

    let chain = eth_mainnet();
    assert!(wait_until(CONVERGE, || registry.max_tip_height(&chain) == Some(10)).await);
    assert!(wait_until(CONVERGE, || registry.endpoint("b").is_some_and(|b| b.tip_height() == 8)).await);

    for _ in 0..10 {
        assert_eq!(registry.select_over_height(&chain, "", -1).unwrap().name(), "a");
    }
    assert!(registry.select_over_height(&chain, "", 11).is_none());

    ahead.fail_tip().await;
    assert!(wait_until(CONVERGE, || registry.select_over_height(&chain, "", -1).is_none()).await);
    assert_eq!(registry.select(&chain, "").unwrap().name(), "b");
    assert_eq!(registry.max_tip_height(&chain), Some(10));

    behind.set_tip(11).await;
    assert!(wait_until(CONVERGE, || registry.max_tip_height(&chain) == Some(11)).await);
    assert_eq!(registry.select_over_height(&chain, "", -1).unwrap().name(), "b");

    let status = registry.status();
    assert_eq!(status.len(), 2);
    assert_eq!(status[0].name, "a");
    assert!(!status[0].healthy);
    assert_eq!(status[1].tip.as_ref().map(|tip| tip.height), Some(11));

    registry.stop_sync().await;
}

#[tokio::test]
async fn test_weighted_selection_distributes_by_weight() {
    let node = NodeMock::new().await;
    let mut heavy = endpoint_config(&node.url(), 1);
    heavy.weight = 300;
    let mut light = endpoint_config(&node.url(), 1);
    light.weight = 100;
    let mut down = endpoint_config(&node.url(), 1);
    down.weight = 1000;

    let registry = registry_with(vec![("heavy", heavy), ("light", light), ("down", down)]);
    let chain = eth_mainnet();
    apply_status(&registry, &ChainStatus::unhealthy("down", chain.clone(), None));

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..4000 {
        let endpoint = registry.weighted_random(&chain).unwrap();
        *counts.entry(endpoint.name().to_string()).or_default() += 1;
    }

    assert!(!counts.contains_key("down"));
    let heavy = counts["heavy"] as f64;
    let light = counts["light"] as f64;
    let ratio = heavy / light;
    assert!((2.4..3.8).contains(&ratio), "heavy/light ratio {ratio}");
}

#[tokio::test]
async fn test_relay_stops_using_a_failed_node() {
    let mut primary = NodeMock::new().await;
    let mut backup = NodeMock::new().await;
    primary.set_tip(20).await;
    backup.set_tip(20).await;
    primary.mock_method("eth_blockNumber", &json!("0x14")).await;
    backup.mock_method("eth_blockNumber", &json!("0x14")).await;

    let registry = registry_with(vec![
        ("primary", endpoint_config(&primary.url(), 1)),
        ("backup", endpoint_config(&backup.url(), 1)),
    ]);
    registry.start_sync().await;
    let chain = eth_mainnet();
    let synced = || registry.status().iter().all(|s| s.tip.as_ref().is_some_and(|tip| tip.height == 20));
    assert!(wait_until(CONVERGE, synced).await);

    primary.fail_tip().await;
    let failed = registry.endpoint("primary").unwrap();
    assert!(wait_until(CONVERGE, || !failed.is_healthy()).await);

    for id in 0..5 {
        let request = JsonRpcRequest::new("eth_blockNumber", None, json!(id));
        let (response, endpoint) = registry.relay_rpc(&chain, &request, None).await.unwrap();
        assert_eq!(endpoint.name(), "backup");
        assert_eq!(response.result, Some(json!("0x14")));
    }

    registry.stop_sync().await;
}
