//! Endpoint registry, selection, and relay.
//!
//! - [`Endpoint`]: one upstream node with its runtime health and tip
//! - [`EndpointSet`]: the endpoints of one chain plus rotation cursor, weight table, and
//!   max tip height
//! - [`Multiplexer`]: owner of both indices and the public selection API
//! - [`relay`]: default JSON-RPC and HTTP passthrough helpers built on selection
//!
//! # Selection Strategies
//!
//! 1. **Round-robin** ([`Multiplexer::select`]) - rotate from the chain's cursor, skipping
//!    unhealthy endpoints and those that list the method in `skip_methods`.
//! 2. **Height-aware** ([`Multiplexer::select_over_height`]) - round-robin restricted to
//!    endpoints whose tip is at least an absolute height, or within `-spec` blocks of the
//!    freshest tip when the height spec is negative.
//! 3. **Weighted** ([`Multiplexer::weighted_random`], [`Multiplexer::weight_search`]) -
//!    upper-bound search in the prefix sums of healthy endpoints' weights.

pub mod builder;
pub mod endpoint;
pub mod endpoint_set;
pub mod errors;
pub mod http_client;
pub mod multiplexer;
pub mod relay;

pub use builder::{BuilderError, MultiplexerBuilder};
pub use endpoint::{Endpoint, EndpointStatus};
pub use endpoint_set::EndpointSet;
pub use errors::UpstreamError;
pub use http_client::{HttpClient, HttpClientConfig};
pub use multiplexer::{Multiplexer, MultiplexerError};
pub use relay::{call_rpc, send_rpc, RelayedResponse, RestRequest};
