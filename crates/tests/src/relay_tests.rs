//! Relay helpers and the EVM delegator against mock nodes.

use crate::mock_infrastructure::{endpoint_config, eth_mainnet, registry_with, wait_until, NodeMock};
use chainmux_core::{
    delegator::{Delegator, EvmDelegator},
    sync::apply_status,
    types::{Block, ChainStatus, JsonRpcRequest},
    upstream::{
        relay::{REAL_ENDPOINT_HEADER, UPSTREAM_SERVER_HEADER},
        HttpClientConfig, MultiplexerBuilder, RestRequest, UpstreamError,
    },
};
use reqwest::{header::SERVER, StatusCode};
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_util::sync::CancellationToken;

fn eth_call(id: u64) -> JsonRpcRequest {
    JsonRpcRequest::new("eth_call", Some(json!([{"to": "0x01"}, "latest"])), json!(id))
}

#[tokio::test]
async fn test_relay_http_renames_server_header_and_names_endpoint() {
    let mut node = NodeMock::new().await;
    node.mock_rest("/v1/info", 200, r#"{"version":"1"}"#).await;
    let registry = registry_with(vec![("node-a", endpoint_config(&node.url(), 1))]);

    let response = registry
        .relay_http(&eth_mainnet(), "/v1/info", None, RestRequest::get("/v1/info"))
        .await
        .unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert!(response.headers.get(SERVER).is_none());
    assert_eq!(response.headers[UPSTREAM_SERVER_HEADER], "mock-node/1.0");
    assert_eq!(response.headers[REAL_ENDPOINT_HEADER], "node-a");
    assert_eq!(&response.body[..], br#"{"version":"1"}"#);
}

#[tokio::test]
async fn test_relay_http_server_error_is_returned_and_marks_unhealthy() {
    let mut node = NodeMock::new().await;
    node.set_tip(10).await;
    node.mock_rest("/v1/info", 503, "overloaded").await;
    let registry = registry_with(vec![("a", endpoint_config(&node.url(), 3600))]);
    registry.start_sync().await;

    let endpoint = registry.endpoint("a").unwrap();
    assert!(wait_until(Duration::from_secs(5), || endpoint.tip_height() == 10).await);

    let response = registry
        .relay_http(&eth_mainnet(), "/v1/info", None, RestRequest::get("/v1/info"))
        .await
        .unwrap();
    assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(&response.body[..], b"overloaded");

    assert!(wait_until(Duration::from_secs(2), || !endpoint.is_healthy()).await);
    assert!(registry.select(&eth_mainnet(), "").is_none());
    registry.stop_sync().await;
}

#[tokio::test]
async fn test_relay_rpc_honours_height_spec() {
    let mut fresh = NodeMock::new().await;
    let mut stale = NodeMock::new().await;
    fresh.mock_method("eth_call", &json!("0xa")).await;
    stale.mock_method("eth_call", &json!("0xb")).await;

    let registry = registry_with(vec![
        ("a", endpoint_config(&fresh.url(), 1)),
        ("b", endpoint_config(&stale.url(), 1)),
    ]);
    apply_status(&registry, &ChainStatus::healthy("a", eth_mainnet(), Block::at_height(100)));
    apply_status(&registry, &ChainStatus::healthy("b", eth_mainnet(), Block::at_height(90)));

    for id in 0..4 {
        let (response, endpoint) = registry.relay_rpc(&eth_mainnet(), &eth_call(id), Some(-5)).await.unwrap();
        assert_eq!(endpoint.name(), "a");
        assert_eq!(response.result, Some(json!("0xa")));
    }

    let mut served = Vec::new();
    for id in 0..4 {
        let (_, endpoint) = registry.relay_rpc(&eth_mainnet(), &eth_call(id), None).await.unwrap();
        served.push(endpoint.name().to_string());
    }
    served.sort();
    assert_eq!(served, ["a", "a", "b", "b"]);

    let result = registry.relay_rpc(&eth_mainnet(), &eth_call(9), Some(1000)).await;
    assert!(matches!(result, Err(UpstreamError::NoEndpointAvailable { .. })));
}

#[tokio::test]
async fn test_evm_delegator_routes_state_reads_to_fresh_endpoints() {
    let mut fresh = NodeMock::new().await;
    let mut stale = NodeMock::new().await;
    let balance = fresh.expect_method("eth_getBalance", &json!("0x10"), 3).await;
    let never = stale.expect_method("eth_getBalance", &json!("0x0"), 0).await;

    let registry = registry_with(vec![
        ("a", endpoint_config(&fresh.url(), 1)),
        ("b", endpoint_config(&stale.url(), 1)),
    ]);
    apply_status(&registry, &ChainStatus::healthy("a", eth_mainnet(), Block::at_height(100)));
    apply_status(&registry, &ChainStatus::healthy("b", eth_mainnet(), Block::at_height(96)));

    let delegator = EvmDelegator::new();
    for id in 0..3 {
        let request = JsonRpcRequest::new("eth_getBalance", Some(json!(["0x01", "latest"])), json!(id));
        let response = delegator.delegate_rpc(&registry, &eth_mainnet(), request).await.unwrap();
        assert_eq!(response.result, Some(json!("0x10")));
    }
    balance.assert_async().await;
    never.assert_async().await;

    let rest = delegator.delegate_rest(&registry, &eth_mainnet(), RestRequest::get("/")).await;
    assert!(matches!(rest, Err(UpstreamError::Unsupported(_))));
}

#[tokio::test]
async fn test_only_transport_failures_are_reported_to_hub() {
    let mut node = NodeMock::new().await;
    node.mock_rpc_error("eth_call", 3, "execution reverted").await;
    let registry = registry_with(vec![
        ("reverts", endpoint_config(&node.url(), 1)),
        ("down", endpoint_config("http://127.0.0.1:1", 1)),
    ]);

    let (queue, mut feed) = mpsc::unbounded_channel();
    registry.hub().subscribe(queue);
    let cancel = CancellationToken::new();
    let hub = registry.hub().clone();
    let hub_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { hub.run(cancel).await }
    });

    let reverts = registry.endpoint("reverts").unwrap();
    let response = registry.relay_rpc_to(&reverts, &eth_call(1)).await.unwrap();
    assert_eq!(response.error.map(|e| e.code), Some(3));
    assert!(tokio::time::timeout(Duration::from_millis(200), feed.recv()).await.is_err());

    let down = registry.endpoint("down").unwrap();
    let result = registry.relay_rpc_to(&down, &eth_call(2)).await;
    assert!(matches!(result, Err(UpstreamError::ConnectionFailed(_) | UpstreamError::Network(_))));
    let status = tokio::time::timeout(Duration::from_secs(2), feed.recv()).await.unwrap().unwrap();
    assert_eq!(status, ChainStatus::unhealthy("down", eth_mainnet(), None));

    cancel.cancel();
    hub_task.await.unwrap().unwrap();
}

/// Accepts connections and never answers them.
async fn silent_node() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{address}")
}

#[tokio::test]
async fn test_local_saturation_does_not_mark_endpoint_unhealthy() {
    let http = HttpClientConfig {
        concurrent_limit: 1,
        permit_timeout: Duration::from_millis(50),
        ..HttpClientConfig::default()
    };
    let registry = Arc::new(MultiplexerBuilder::new().http_config(http).build());
    let mut slow = endpoint_config(&silent_node().await, 1);
    slow.timeout = 5;
    let endpoint = registry.add_config("a", slow).unwrap();

    let (queue, mut feed) = mpsc::unbounded_channel();
    registry.hub().subscribe(queue);
    let cancel = CancellationToken::new();
    let hub = registry.hub().clone();
    let hub_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { hub.run(cancel).await }
    });

    let in_flight = tokio::spawn({
        let registry = registry.clone();
        let endpoint = endpoint.clone();
        async move { registry.relay_rpc_to(&endpoint, &eth_call(1)).await }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let result = registry.relay_rpc_to(&endpoint, &eth_call(2)).await;
    assert!(matches!(result, Err(UpstreamError::ConcurrencyLimit(_))));
    assert!(tokio::time::timeout(Duration::from_millis(300), feed.recv()).await.is_err());
    assert!(endpoint.is_healthy());
    assert_eq!(registry.select(&eth_mainnet(), "").unwrap().name(), "a");

    in_flight.abort();
    cancel.cancel();
    hub_task.await.unwrap().unwrap();
}
