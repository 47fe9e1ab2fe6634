//! Mock upstreams for integration tests.
//!
//! - `NodeMock`: mockito-backed EVM JSON-RPC and REST node
//! - `MockWebSocketServer`: `newHeads` subscription server
//! - fixtures and polling helpers
//!
//! ```ignore
//! use tests::mock_infrastructure::{endpoint_config, registry_with, NodeMock};
//!
//! let mut node = NodeMock::new().await;
//! node.set_tip(100).await;
//! let registry = registry_with(vec![("a", endpoint_config(&node.url(), 1))]);
//! ```

pub mod test_helpers;

pub use node_mock::NodeMock;
pub use test_helpers::*;
pub use websocket_mock::MockWebSocketServer;
