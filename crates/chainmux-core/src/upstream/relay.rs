//! Default relay helpers exposed to delegators.
//!
//! [`Multiplexer::relay_rpc`] forwards a JSON-RPC call and [`Multiplexer::relay_http`] pipes a
//! raw REST or GraphQL request. Both pick the endpoint through the registry's selection (height
//! aware when a spec is given) and report transport failures to the hub so the endpoint drops
//! out of rotation until its fetch task sees it recover.

use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode,
};
use std::sync::Arc;

use crate::{
    types::{ChainRef, ChainStatus, JsonRpcRequest, JsonRpcResponse},
    upstream::{Endpoint, Multiplexer, UpstreamError},
};

/// Response header naming the endpoint that served a relayed request.
pub const REAL_ENDPOINT_HEADER: &str = "x-real-endpoint";

/// Name the upstream `Server` header is moved to.
pub const UPSTREAM_SERVER_HEADER: &str = "x-upstream-server";

const HOP_BY_HOP: [&str; 10] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// An inbound REST or GraphQL request to pipe through.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub method: Method,
    /// Path plus optional query string, relative to the endpoint URL.
    pub path: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl RestRequest {
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self { method: Method::GET, path: path.into(), headers: HeaderMap::new(), body: Bytes::new() }
    }
}

/// Response piped back from an endpoint.
#[derive(Debug, Clone)]
pub struct RelayedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    if path.is_empty() {
        base.to_string()
    } else if path.starts_with('/') || path.starts_with('?') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Copies upstream response headers for the client, moving `Server` aside and naming the
/// endpoint.
fn response_headers(upstream: &HeaderMap, endpoint: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream.len() + 1);
    for (name, value) in upstream {
        if is_hop_by_hop(name) {
            continue;
        }
        if *name == reqwest::header::SERVER {
            headers.append(HeaderName::from_static(UPSTREAM_SERVER_HEADER), value.clone());
        } else {
            headers.append(name.clone(), value.clone());
        }
    }
    if let Ok(value) = HeaderValue::from_str(endpoint) {
        headers.insert(HeaderName::from_static(REAL_ENDPOINT_HEADER), value);
    }
    headers
}

/// Sends one JSON-RPC request to `endpoint` and parses the reply.
///
/// JSON-RPC error replies are returned as responses, not errors.
///
/// # Errors
///
/// Returns transport, HTTP status, and parse failures.
pub async fn send_rpc(
    endpoint: &Endpoint,
    request: &JsonRpcRequest,
) -> Result<JsonRpcResponse, UpstreamError> {
    let body = serde_json::to_vec(request)
        .map_err(|e| UpstreamError::InvalidRequest(format!("Failed to serialize request: {e}")))?;
    let bytes = endpoint.http_client().await?.post_json(endpoint.url(), Bytes::from(body)).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| UpstreamError::InvalidResponse(format!("Failed to parse response: {e}")))
}

/// Calls `method` on `endpoint` and returns its `result`, mapping JSON-RPC errors to
/// [`UpstreamError::RpcError`].
///
/// # Errors
///
/// Returns transport failures, JSON-RPC errors, and missing results.
pub async fn call_rpc(
    endpoint: &Endpoint,
    method: &str,
    params: serde_json::Value,
) -> Result<serde_json::Value, UpstreamError> {
    let request = JsonRpcRequest::new(method, Some(params), serde_json::json!(1));
    let response = send_rpc(endpoint, &request).await?;
    if let Some(error) = response.error {
        return Err(UpstreamError::RpcError(error.code, error.message));
    }
    response
        .result
        .ok_or_else(|| UpstreamError::InvalidResponse(format!("{method}: missing result")))
}

impl Multiplexer {
    fn pick(
        &self,
        chain: &ChainRef,
        method: &str,
        height_spec: Option<i64>,
    ) -> Result<Arc<Endpoint>, UpstreamError> {
        let selected = match height_spec {
            Some(spec) => self.select_over_height(chain, method, spec),
            None => self.select(chain, method),
        };
        selected.ok_or_else(|| UpstreamError::NoEndpointAvailable {
            chain: chain.clone(),
            method: method.to_string(),
        })
    }

    /// Publishes an unhealthy status for `endpoint` if `error` is the endpoint's fault.
    pub fn report_failure(&self, endpoint: &Endpoint, error: &UpstreamError) {
        if !error.marks_unhealthy() {
            return;
        }
        tracing::warn!(
            endpoint = %endpoint.name(),
            chain = %endpoint.chain(),
            error = %error,
            "relay failure, marking endpoint unhealthy"
        );
        self.hub().publish(ChainStatus::unhealthy(
            endpoint.name(),
            endpoint.chain().clone(),
            endpoint.tip(),
        ));
    }

    /// Relays a JSON-RPC request to an eligible endpoint of `chain`.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::NoEndpointAvailable`] if nothing is eligible, or the relay
    /// failure.
    pub async fn relay_rpc(
        &self,
        chain: &ChainRef,
        request: &JsonRpcRequest,
        height_spec: Option<i64>,
    ) -> Result<(JsonRpcResponse, Arc<Endpoint>), UpstreamError> {
        let endpoint = self.pick(chain, &request.method, height_spec)?;
        let response = self.relay_rpc_to(&endpoint, request).await?;
        Ok((response, endpoint))
    }

    /// Relays a JSON-RPC request to a specific endpoint.
    ///
    /// # Errors
    ///
    /// Returns the relay failure after reporting it.
    pub async fn relay_rpc_to(
        &self,
        endpoint: &Endpoint,
        request: &JsonRpcRequest,
    ) -> Result<JsonRpcResponse, UpstreamError> {
        tracing::debug!(endpoint = %endpoint.name(), method = %request.method, "relaying rpc");
        send_rpc(endpoint, request).await.inspect_err(|e| self.report_failure(endpoint, e))
    }

    /// Pipes a REST or GraphQL request through to an eligible endpoint of `chain`.
    ///
    /// `method_key` is matched against endpoint skip lists. Request headers are forwarded
    /// without hop-by-hop headers, `Host`, and `Content-Length`. The response keeps the
    /// upstream status and body; its `Server` header is renamed `X-Upstream-Server` and
    /// `X-Real-Endpoint` names the endpoint. A 5xx reply is returned to the caller and also
    /// marks the endpoint unhealthy.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::NoEndpointAvailable`] if nothing is eligible, or a transport
    /// failure.
    pub async fn relay_http(
        &self,
        chain: &ChainRef,
        method_key: &str,
        height_spec: Option<i64>,
        request: RestRequest,
    ) -> Result<RelayedResponse, UpstreamError> {
        let endpoint = self.pick(chain, method_key, height_spec)?;
        let url = join_url(endpoint.url(), &request.path);

        let mut headers = request.headers;
        for name in HOP_BY_HOP {
            headers.remove(name);
        }

        tracing::debug!(endpoint = %endpoint.name(), url = %url, method = %request.method, "relaying http");
        let result = async {
            let response = endpoint
                .http_client()
                .await?
                .send(request.method, &url, headers, request.body)
                .await?;
            let status = response.status();
            let upstream_headers = response.headers().clone();
            let body = response
                .bytes()
                .await
                .map_err(|e| UpstreamError::InvalidResponse(format!("body read failed: {e}")))?;
            Ok::<_, UpstreamError>(RelayedResponse {
                status,
                headers: response_headers(&upstream_headers, endpoint.name()),
                body,
            })
        }
        .await;

        match result {
            Ok(relayed) => {
                if relayed.status.is_server_error() {
                    let snippet = String::from_utf8_lossy(&relayed.body[..relayed.body.len().min(128)]).into_owned();
                    self.report_failure(&endpoint, &UpstreamError::HttpError(relayed.status.as_u16(), snippet));
                }
                Ok(relayed)
            }
            Err(e) => {
                self.report_failure(&endpoint, &e);
                Err(e)
            }
        }
    }
}
