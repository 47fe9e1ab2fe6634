//! Reference delegator for EVM-compatible JSON-RPC nodes.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio_tungstenite::tungstenite::Message;

use super::{Delegator, Protocol};
use crate::{
    sync::{run_push_loop, BlockStream, SyncContext, TipStream},
    types::{Block, ChainRef, JsonRpcRequest, JsonRpcResponse},
    upstream::{call_rpc, Endpoint, Multiplexer, UpstreamError},
};

/// Staleness tolerance per method, as a height spec. Unlisted methods use plain round-robin.
const HEIGHT_SPECS: &[(&str, i64)] = &[
    ("eth_call", -3),
    ("eth_getBalance", -3),
    ("eth_getCode", -3),
    ("eth_getTransactionCount", -3),
    ("eth_getStorageAt", -3),
    ("eth_estimateGas", -3),
    ("eth_getTransactionReceipt", -1),
];

/// Methods whose first parameter is a transaction hash.
const TX_LOOKUP_METHODS: &[&str] = &["eth_getTransactionByHash", "eth_getTransactionReceipt"];

const SEND_RAW_TRANSACTION: &str = "eth_sendRawTransaction";

/// Delegator for the `eth` brand and other EVM chains.
///
/// Requests go through the result cache, then transaction-hash affinity in the presence
/// cache, then height-aware selection. Endpoints with a `streaming_url` track their tip
/// over a `newHeads` WebSocket subscription instead of polling.
#[derive(Debug, Default, Clone, Copy)]
pub struct EvmDelegator;

impl EvmDelegator {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Height spec for `method`, if it declares one.
    #[must_use]
    pub fn height_spec(method: &str) -> Option<i64> {
        HEIGHT_SPECS.iter().find(|(m, _)| *m == method).map(|(_, spec)| *spec)
    }
}

#[async_trait]
impl Delegator for EvmDelegator {
    fn protocol(&self) -> Protocol {
        Protocol::JsonRpc
    }

    async fn get_tip(&self, _registry: &Multiplexer, endpoint: &Endpoint) -> Result<Block, UpstreamError> {
        let result = call_rpc(endpoint, "eth_getBlockByNumber", json!(["latest", false])).await?;
        parse_header(&result)
    }

    async fn get_client_version(&self, endpoint: &Endpoint) -> Result<String, UpstreamError> {
        let result = call_rpc(endpoint, "web3_clientVersion", json!([])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| UpstreamError::InvalidResponse("web3_clientVersion: not a string".to_string()))
    }

    async fn start_sync(&self, ctx: &SyncContext, endpoint: &Arc<Endpoint>) -> Result<bool, UpstreamError> {
        if endpoint.streaming_url().is_none() {
            return Ok(false);
        }
        ctx.spawn(run_push_loop(ctx.clone(), Arc::new(*self), endpoint.clone(), Arc::new(NewHeadsStream)));
        Ok(true)
    }

    fn cache_key_prefix(&self) -> &str {
        "evm"
    }

    async fn delegate_rpc(
        &self,
        registry: &Multiplexer,
        chain: &ChainRef,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        if let Some(cache) = registry.result_cache() {
            if let Some(hit) = cache.lookup(registry, chain, self.cache_key_prefix(), &request).await {
                tracing::debug!(method = %request.method, endpoint = %hit.endpoint, "result cache hit");
                return Ok(JsonRpcResponse::success(hit.result, request.id.clone()));
            }
        }

        let affinity = match (registry.presence_cache(), request.first_param_str()) {
            (Some(cache), Some(hash)) if TX_LOOKUP_METHODS.contains(&request.method.as_str()) => {
                cache.lookup(registry, chain, hash, &request.method).await
            }
            _ => None,
        };

        let (response, endpoint) = match affinity {
            Some(endpoint) => {
                tracing::debug!(method = %request.method, endpoint = %endpoint.name(), "presence affinity");
                (registry.relay_rpc_to(&endpoint, &request).await?, endpoint)
            }
            None => registry.relay_rpc(chain, &request, Self::height_spec(&request.method)).await?,
        };

        if let Some(result) = &response.result {
            if request.method == SEND_RAW_TRANSACTION {
                if let (Some(cache), Some(hash)) = (registry.presence_cache(), result.as_str()) {
                    cache.record(chain, hash, endpoint.name()).await;
                }
            }
            if let Some(cache) = registry.result_cache() {
                cache.store(chain, self.cache_key_prefix(), &request, endpoint.name(), result).await;
            }
        }

        Ok(response)
    }
}

/// `newHeads` subscription over the endpoint's streaming URL.
struct NewHeadsStream;

#[async_trait]
impl TipStream for NewHeadsStream {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BlockStream, UpstreamError> {
        let url = endpoint
            .streaming_url()
            .ok_or_else(|| UpstreamError::InvalidRequest("no streaming url configured".to_string()))?;

        let (mut socket, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| UpstreamError::ConnectionFailed(format!("websocket connect failed: {e}")))?;
        tracing::info!(
            endpoint = %endpoint.name(),
            status = response.status().as_u16(),
            "websocket connected"
        );

        let subscribe = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_subscribe",
            "params": ["newHeads"]
        });
        socket
            .send(Message::Text(subscribe.to_string().into()))
            .await
            .map_err(|e| UpstreamError::ConnectionFailed(format!("websocket send failed: {e}")))?;

        let blocks = futures::stream::unfold(socket, |mut socket| async move {
            loop {
                let item = match socket.next().await? {
                    Ok(Message::Text(text)) => match parse_message(&text) {
                        Ok(Some(block)) => Ok(block),
                        Ok(None) => continue,
                        Err(e) => Err(e),
                    },
                    Ok(Message::Close(_)) => return None,
                    Ok(_) => continue,
                    Err(e) => Err(UpstreamError::ConnectionFailed(format!("websocket error: {e}"))),
                };
                return Some((item, socket));
            }
        });
        Ok(blocks.boxed())
    }
}

/// Parses one subscription message. Confirmations and unrelated messages yield `None`.
fn parse_message(text: &str) -> Result<Option<Block>, UpstreamError> {
    let message: Value = serde_json::from_str(text)
        .map_err(|e| UpstreamError::InvalidResponse(format!("websocket message: {e}")))?;

    if let Some(error) = message.get("error") {
        let code = error.get("code").and_then(Value::as_i64).unwrap_or(-32000);
        let text = error.get("message").and_then(Value::as_str).unwrap_or("subscription rejected");
        return Err(UpstreamError::RpcError(i32::try_from(code).unwrap_or(-32000), text.to_string()));
    }

    match message.get("params").and_then(|p| p.get("result")) {
        Some(header) => parse_header(header).map(Some),
        None => Ok(None),
    }
}

/// Reads `number` and `hash` out of a block header object.
fn parse_header(header: &Value) -> Result<Block, UpstreamError> {
    let number = header
        .get("number")
        .and_then(Value::as_str)
        .ok_or_else(|| UpstreamError::InvalidResponse("block without number".to_string()))?;
    let height = parse_hex_u64(number)
        .ok_or_else(|| UpstreamError::InvalidResponse(format!("invalid block number: {number}")))?;
    let hash = header.get("hash").and_then(Value::as_str).map(str::to_string);
    Ok(Block::new(height, hash))
}

fn parse_hex_u64(value: &str) -> Option<u64> {
    let digits = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"))?;
    u64::from_str_radix(digits, 16).ok()
}
