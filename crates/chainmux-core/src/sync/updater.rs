//! The single consumer of the hub feed and the only writer of endpoint runtime state.

use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::{hub::SubscriptionId, types::ChainStatus, upstream::Multiplexer};

pub(crate) async fn run_updater(
    registry: Arc<Multiplexer>,
    mut feed: UnboundedReceiver<ChainStatus>,
    subscription: SubscriptionId,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            status = feed.recv() => match status {
                Some(status) => apply_status(&registry, &status),
                None => {
                    tracing::warn!("hub feed closed, updater stopping");
                    break;
                }
            },
        }
    }
    registry.hub().unsubscribe(subscription);
    tracing::debug!("updater stopped");
}

/// Applies one status event to the named endpoint and its chain's aggregate state.
///
/// A status without a tip leaves the stored tip untouched. Height regressions and hash
/// changes at the same height are logged but applied as reported; a regression triggers a
/// full rescan of the chain's max tip height.
pub fn apply_status(registry: &Multiplexer, status: &ChainStatus) {
    let Some(endpoint) = registry.endpoint(&status.endpoint) else {
        tracing::debug!(endpoint = %status.endpoint, "status for unknown endpoint ignored");
        return;
    };
    if endpoint.chain() != &status.chain {
        tracing::warn!(
            endpoint = %status.endpoint,
            expected = %endpoint.chain(),
            reported = %status.chain,
            "status chain mismatch, ignored"
        );
        return;
    }
    let Some(set) = registry.endpoint_set(&status.chain) else {
        return;
    };

    let was_healthy = endpoint.set_healthy(status.healthy);

    if let Some(tip) = &status.tip {
        let previous = endpoint.tip();
        let regressed = match &previous {
            Some(prev) if prev.is_newer_than(tip) => {
                tracing::warn!(endpoint = %endpoint.name(), from = %prev, to = %tip, "tip height regressed");
                true
            }
            Some(prev) if prev.height == tip.height && prev.hash != tip.hash => {
                tracing::warn!(endpoint = %endpoint.name(), from = %prev, to = %tip, "tip hash changed at same height");
                false
            }
            _ => false,
        };

        endpoint.set_tip(Some(tip.clone()));
        if regressed {
            let max = set.rescan_max_tip();
            tracing::debug!(chain = %status.chain, max_tip = max, "max tip rescanned");
        } else {
            set.raise_max_tip(tip.height);
        }
    }

    if was_healthy != status.healthy {
        set.rebuild_weights();
        tracing::info!(
            endpoint = %endpoint.name(),
            chain = %status.chain,
            healthy = status.healthy,
            "endpoint health changed"
        );
    }
}
