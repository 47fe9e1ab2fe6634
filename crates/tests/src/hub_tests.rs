//! Two registries sharing one store: a leader that polls nodes and a follower that only
//! consumes the hub.

use crate::mock_infrastructure::{endpoint_config, eth_mainnet, wait_until, NodeMock};
use async_trait::async_trait;
use chainmux_core::{
    config::{HubBackend, HubConfig},
    delegator::{Delegator, DelegatorFactory, Protocol},
    hub::build_hub,
    store::{MemoryStore, Store},
    sync::SyncContext,
    types::Block,
    upstream::{Endpoint, Multiplexer, MultiplexerBuilder, UpstreamError},
};
use std::{sync::Arc, time::Duration};

const CONVERGE: Duration = Duration::from_secs(5);

/// Claims every endpoint so no local fetch task runs.
struct Follower;

#[async_trait]
impl Delegator for Follower {
    fn protocol(&self) -> Protocol {
        Protocol::JsonRpc
    }

    async fn get_tip(&self, _: &Multiplexer, _: &Endpoint) -> Result<Block, UpstreamError> {
        Err(UpstreamError::Unsupported("follower".to_string()))
    }

    async fn start_sync(&self, _: &SyncContext, _: &Arc<Endpoint>) -> Result<bool, UpstreamError> {
        Ok(true)
    }
}

fn hub_config(backend: HubBackend) -> HubConfig {
    HubConfig { backend, store: Some("shared".to_string()), poll_interval_ms: 50, ..HubConfig::default() }
}

fn leader(store: &Arc<dyn Store>, backend: HubBackend, url: &str) -> Arc<Multiplexer> {
    let registry = MultiplexerBuilder::new()
        .hub(build_hub(&hub_config(backend), Some(store.clone())).unwrap())
        .build();
    registry.add(Endpoint::new("a", endpoint_config(url, 1))).unwrap();
    Arc::new(registry)
}

fn follower(store: &Arc<dyn Store>, backend: HubBackend, url: &str) -> Arc<Multiplexer> {
    let registry = MultiplexerBuilder::new()
        .hub(build_hub(&hub_config(backend), Some(store.clone())).unwrap())
        .delegators(DelegatorFactory::new().with("eth", Arc::new(Follower)))
        .build();
    registry.add(Endpoint::new("a", endpoint_config(url, 1))).unwrap();
    Arc::new(registry)
}

async fn follower_tracks_leader(backend: HubBackend) {
    let mut node = NodeMock::new().await;
    node.set_tip(20).await;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    let follower = follower(&store, backend, &node.url());
    follower.start_sync().await;
    let leader = leader(&store, backend, &node.url());
    leader.start_sync().await;

    let seen = follower.endpoint("a").unwrap();
    assert!(wait_until(CONVERGE, || seen.tip_height() == 20).await, "{backend:?}: initial tip");

    node.set_tip(21).await;
    assert!(wait_until(CONVERGE, || seen.tip_height() == 21).await, "{backend:?}: next tip");
    assert_eq!(follower.max_tip_height(&eth_mainnet()), Some(21));

    node.fail_tip().await;
    assert!(wait_until(CONVERGE, || !seen.is_healthy()).await, "{backend:?}: unhealthy");
    assert!(follower.select(&eth_mainnet(), "").is_none());

    leader.stop_sync().await;
    follower.stop_sync().await;
}

async fn late_follower_catches_up(backend: HubBackend) {
    let mut node = NodeMock::new().await;
    node.set_tip(30).await;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

    let leader = leader(&store, backend, &node.url());
    leader.start_sync().await;
    let origin = leader.endpoint("a").unwrap();
    assert!(wait_until(CONVERGE, || origin.tip_height() == 30).await);

    let follower = follower(&store, backend, &node.url());
    follower.start_sync().await;
    let seen = follower.endpoint("a").unwrap();
    assert!(wait_until(CONVERGE, || seen.tip_height() == 30).await, "{backend:?}: replayed tip");

    leader.stop_sync().await;
    follower.stop_sync().await;
}

#[tokio::test]
async fn test_pubsub_follower_tracks_leader() {
    follower_tracks_leader(HubBackend::Pubsub).await;
}

#[tokio::test]
async fn test_stream_follower_tracks_leader() {
    follower_tracks_leader(HubBackend::Stream).await;
}

#[tokio::test]
async fn test_pubsub_late_follower_reads_snapshot() {
    late_follower_catches_up(HubBackend::Pubsub).await;
}

#[tokio::test]
async fn test_stream_late_follower_replays_log() {
    late_follower_catches_up(HubBackend::Stream).await;
}
