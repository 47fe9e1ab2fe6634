//! Core value types shared by the registry, the hub, and the sync engine.
//!
//! # Type Categories
//!
//! ## Routing Types
//! - [`ChainRef`]: `(brand, network)` pair used as the key of every per-chain index
//! - [`Block`]: a tip observation (height plus optional hash)
//! - [`ChainStatus`]: the event carried by the chain status hub
//!
//! ## JSON-RPC Protocol Types
//! - [`JsonRpcRequest`], [`JsonRpcResponse`], [`JsonRpcError`]: relayed as-is to upstreams

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, sync::Arc};

/// JSON-RPC protocol version constant to avoid repeated allocations.
pub const JSONRPC_VERSION: &str = "2.0";

/// Pre-allocated `Cow` for the JSON-RPC version.
pub const JSONRPC_VERSION_COW: Cow<'static, str> = Cow::Borrowed(JSONRPC_VERSION);

/// Identifies one blockchain variant, e.g. `eth/mainnet` or `eth/sepolia`.
///
/// Used as the key of the chain index, of hub snapshots, and of every cache key.
/// Equality is field-wise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainRef {
    pub brand: String,
    pub network: String,
}

impl ChainRef {
    #[must_use]
    pub fn new(brand: impl Into<String>, network: impl Into<String>) -> Self {
        Self { brand: brand.into(), network: network.into() }
    }

    /// Returns `true` if either component is empty. Such a chain can never be registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.brand.is_empty() || self.network.is_empty()
    }

    /// Key fragment used by store-backed components (`brand:network`).
    #[must_use]
    pub fn key_fragment(&self) -> String {
        format!("{}:{}", self.brand, self.network)
    }
}

impl fmt::Display for ChainRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.brand, self.network)
    }
}

/// A tip observation reported by an endpoint.
///
/// Two blocks are equal iff height and hash match. Ordering between tips is decided by
/// height alone; two different hashes at the same height are an anomaly that gets logged
/// by the updater but never resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl Block {
    #[must_use]
    pub fn new(height: u64, hash: Option<String>) -> Self {
        Self { height, hash }
    }

    #[must_use]
    pub fn at_height(height: u64) -> Self {
        Self { height, hash: None }
    }

    /// Returns `true` if this block is strictly higher than `other`.
    #[must_use]
    pub fn is_newer_than(&self, other: &Block) -> bool {
        self.height > other.height
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hash {
            Some(hash) => write!(f, "#{} ({hash})", self.height),
            None => write!(f, "#{}", self.height),
        }
    }
}

/// Health/tip event flowing from fetch tasks, through the hub, to the updater.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub endpoint: String,
    pub chain: ChainRef,
    #[serde(default)]
    pub tip: Option<Block>,
    pub healthy: bool,
}

impl ChainStatus {
    #[must_use]
    pub fn healthy(endpoint: impl Into<String>, chain: ChainRef, tip: Block) -> Self {
        Self { endpoint: endpoint.into(), chain, tip: Some(tip), healthy: true }
    }

    #[must_use]
    pub fn unhealthy(endpoint: impl Into<String>, chain: ChainRef, tip: Option<Block>) -> Self {
        Self { endpoint: endpoint.into(), chain, tip, healthy: false }
    }
}

/// JSON-RPC 2.0 request.
///
/// `id` is an `Arc` so that error responses can echo it without deep-copying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: Cow<'static, str>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    pub id: Arc<serde_json::Value>,
}

impl JsonRpcRequest {
    #[must_use]
    pub fn new(
        method: impl Into<String>,
        params: Option<serde_json::Value>,
        id: serde_json::Value,
    ) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, method: method.into(), params, id: Arc::new(id) }
    }

    /// Returns the first positional parameter as a string, if any.
    #[must_use]
    pub fn first_param_str(&self) -> Option<&str> {
        self.params.as_ref()?.as_array()?.first()?.as_str()
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 response. Contains either `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: Cow<'static, str>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Arc<serde_json::Value>,
}

impl JsonRpcResponse {
    #[must_use]
    pub fn success(result: serde_json::Value, id: Arc<serde_json::Value>) -> Self {
        Self { jsonrpc: JSONRPC_VERSION_COW, result: Some(result), error: None, id }
    }

    #[must_use]
    pub fn error(code: i32, message: impl Into<String>, id: Arc<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION_COW,
            result: None,
            error: Some(JsonRpcError { code, message: message.into(), data: None }),
            id,
        }
    }
}
