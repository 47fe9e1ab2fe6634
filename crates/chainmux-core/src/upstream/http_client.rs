use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE},
    Client, ClientBuilder, Method, Response,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::Semaphore;

use crate::{config::EndpointConfig, upstream::UpstreamError};

/// Per-endpoint concurrency and connection settings.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Maximum number of in-flight requests to one endpoint.
    pub concurrent_limit: usize,
    /// How long a request may wait for a concurrency permit.
    pub permit_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            concurrent_limit: 256,
            permit_timeout: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// HTTP transport for one endpoint.
///
/// Carries the endpoint's configured headers on every request, applies its timeout, and
/// bounds in-flight requests with a semaphore.
pub struct HttpClient {
    client: Client,
    concurrent_limit: Arc<Semaphore>,
    permit_timeout: Duration,
}

impl HttpClient {
    /// Builds the client for an endpoint from its configuration.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::InvalidRequest`] if a configured header is not valid HTTP, or
    /// [`UpstreamError::ConnectionFailed`] if the reqwest client fails to build.
    pub fn for_endpoint(
        config: &EndpointConfig,
        http: &HttpClientConfig,
    ) -> Result<Self, UpstreamError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| UpstreamError::InvalidRequest(format!("header {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| UpstreamError::InvalidRequest(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }

        let client = ClientBuilder::new()
            .default_headers(headers)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(64)
            .connect_timeout(http.connect_timeout)
            .timeout(config.timeout())
            .use_rustls_tls()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("chainmux/", env!("CARGO_PKG_VERSION")))
            .tcp_keepalive(Duration::from_secs(30))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| {
                tracing::error!(error = %e, "failed to build http client");
                UpstreamError::ConnectionFailed(format!("HTTP client build failed: {e}"))
            })?;

        Ok(Self {
            client,
            concurrent_limit: Arc::new(Semaphore::new(http.concurrent_limit.max(1))),
            permit_timeout: http.permit_timeout,
        })
    }

    /// Sanitizes network errors to prevent information disclosure.
    fn sanitize_network_error(error: &reqwest::Error) -> String {
        if error.is_connect() {
            "connection refused or unreachable".to_string()
        } else if error.is_request() {
            "request failed".to_string()
        } else if error.is_body() {
            "response body error".to_string()
        } else if error.is_decode() {
            "response decode error".to_string()
        } else {
            "network error".to_string()
        }
    }

    fn map_error(error: reqwest::Error) -> UpstreamError {
        if error.is_timeout() {
            UpstreamError::Timeout
        } else if error.is_connect() {
            UpstreamError::ConnectionFailed(Self::sanitize_network_error(&error))
        } else {
            UpstreamError::Network(error)
        }
    }

    /// Posts a JSON body and returns the response body of a 2xx reply.
    ///
    /// # Errors
    ///
    /// - [`UpstreamError::ConcurrencyLimit`] if no concurrency permit frees up in time
    /// - [`UpstreamError::Timeout`] if the request times out
    /// - [`UpstreamError::HttpError`] for non-success HTTP status codes
    /// - [`UpstreamError::ConnectionFailed`] / [`UpstreamError::Network`] for transport failures
    pub async fn post_json(&self, url: &str, body: Bytes) -> Result<Bytes, UpstreamError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let response = self.send(Method::POST, url, headers, body).await?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(Self::map_error)?;
        if !status.is_success() {
            let snippet = String::from_utf8_lossy(&bytes[..bytes.len().min(256)]).into_owned();
            return Err(UpstreamError::HttpError(status.as_u16(), snippet));
        }
        Ok(bytes)
    }

    /// Sends an arbitrary request and returns the raw response, whatever its status.
    ///
    /// # Errors
    ///
    /// Returns transport-level failures only.
    pub async fn send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response, UpstreamError> {
        let _permit = tokio::time::timeout(
            self.permit_timeout,
            Arc::clone(&self.concurrent_limit).acquire_owned(),
        )
        .await
        .map_err(|_| {
            tracing::warn!(
                url = url,
                available_permits = self.concurrent_limit.available_permits(),
                "http client semaphore acquisition timeout"
            );
            UpstreamError::ConcurrencyLimit(self.permit_timeout)
        })?
        .map_err(|_| UpstreamError::ConnectionFailed("http client closed".to_string()))?;

        tracing::trace!(url = url, method = %method, "http request started");

        self.client
            .request(method, url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(Self::map_error)
    }
}
