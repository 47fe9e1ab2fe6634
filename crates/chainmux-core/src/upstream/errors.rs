use std::time::Duration;
use thiserror::Error;

use crate::types::ChainRef;

/// Errors that can occur when selecting or talking to an upstream node endpoint.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum UpstreamError {
    /// Request exceeded the endpoint's configured timeout.
    #[error("Request timeout")]
    Timeout,

    /// This process already has the endpoint's maximum of requests in flight and no permit
    /// freed up in time. Says nothing about the endpoint's health.
    #[error("Concurrency limit reached after waiting {0:?} for a permit")]
    ConcurrencyLimit(Duration),

    /// Failed to establish a connection to the upstream endpoint.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// HTTP-level error occurred (non-2xx status code).
    ///
    /// First field is the HTTP status code, second is the error message.
    #[error("HTTP error: {0}")]
    HttpError(u16, String),

    /// JSON-RPC error returned by the upstream node.
    #[error("RPC error {0}: {1}")]
    RpcError(i32, String),

    /// Network-level error from the underlying HTTP client.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Response from upstream could not be parsed or was malformed.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// No registered endpoint for the chain is healthy, synced enough, and supports the method.
    #[error("No backend available for {chain} (method: {method})")]
    NoEndpointAvailable { chain: ChainRef, method: String },

    /// The chain's delegator does not implement the requested protocol or capability.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Request validation failed before being sent to upstream.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl UpstreamError {
    /// Returns `true` if this error is transient and the request could succeed elsewhere or later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout
            | Self::ConcurrencyLimit(_)
            | Self::Network(_)
            | Self::ConnectionFailed(_) => true,
            Self::HttpError(status, _) => (500..=599).contains(status) || *status == 429,
            Self::RpcError(code, _) => *code == -32005 || *code == -32603,
            _ => false,
        }
    }

    /// Returns `true` if the failure is the endpoint's fault and should flip it unhealthy.
    ///
    /// JSON-RPC errors are answers, not transport failures, and never mark an endpoint down.
    /// HTTP 429 is throttling and is left to the next poll. Local backpressure
    /// ([`Self::ConcurrencyLimit`]) never reached the endpoint at all.
    #[must_use]
    pub fn marks_unhealthy(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) | Self::ConnectionFailed(_) | Self::InvalidResponse(_) => {
                true
            }
            Self::HttpError(status, _) => (500..=599).contains(status),
            _ => false,
        }
    }

    /// Returns `true` for the expected "nothing eligible" outcome of selection.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NoEndpointAvailable { .. })
    }

    /// JSON-RPC error code used when this error is surfaced to a client.
    #[must_use]
    pub fn json_rpc_code(&self) -> i32 {
        match self {
            Self::NoEndpointAvailable { .. } | Self::Unsupported(_) => -32601,
            Self::InvalidRequest(_) => -32600,
            Self::RpcError(code, _) => *code,
            Self::HttpError(429, _) | Self::ConcurrencyLimit(_) => -32005,
            _ => -32603,
        }
    }
}
