//! Push-based tip tracking over a persistent subscription.

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use std::sync::Arc;

use super::{SyncContext, TipReporter};
use crate::{
    delegator::Delegator,
    hub::sleep_or_cancel,
    types::Block,
    upstream::{Endpoint, UpstreamError},
};

/// Tips announced by a node, in arrival order.
pub type BlockStream = BoxStream<'static, Result<Block, UpstreamError>>;

/// Opens a tip subscription against one endpoint.
#[async_trait]
pub trait TipStream: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<BlockStream, UpstreamError>;
}

/// Keeps a subscription to `endpoint` alive until cancelled.
///
/// Each connection attempt first fetches the current tip through the delegator so that no
/// block is missed between reconnects, then forwards every announced tip. A failed fetch,
/// connect, or stream error publishes an unhealthy status and waits the fixed reconnect
/// delay before the next attempt.
pub async fn run_push_loop(
    ctx: SyncContext,
    delegator: Arc<dyn Delegator>,
    endpoint: Arc<Endpoint>,
    source: Arc<dyn TipStream>,
) {
    let registry = ctx.registry().clone();
    let cancel = ctx.cancel_token().clone();
    let delay = registry.sync_config().push_reconnect_delay();
    let mut reporter = TipReporter::new(registry.clone(), endpoint.clone());

    tracing::debug!(endpoint = %endpoint.name(), "push loop started");

    loop {
        let attempt = async {
            let tip = delegator.get_tip(&registry, &endpoint).await?;
            reporter.observe(tip);

            let mut blocks = source.connect(&endpoint).await?;
            tracing::debug!(endpoint = %endpoint.name(), "tip subscription established");
            while let Some(block) = blocks.next().await {
                reporter.observe(block?);
            }
            Err::<(), _>(UpstreamError::ConnectionFailed("tip subscription ended".to_string()))
        };

        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = attempt => result,
        };

        if let Err(e) = result {
            tracing::warn!(endpoint = %endpoint.name(), error = %e, "tip subscription lost");
            reporter.fail();
        }

        if sleep_or_cancel(&cancel, delay).await {
            break;
        }
    }

    tracing::debug!(endpoint = %endpoint.name(), "push loop stopped");
}
