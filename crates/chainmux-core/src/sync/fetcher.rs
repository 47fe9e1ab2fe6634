//! Default poll loop.

use std::sync::Arc;

use super::{SyncContext, TipReporter};
use crate::{delegator::Delegator, hub::sleep_or_cancel, upstream::Endpoint};

/// Polls the endpoint's tip until cancelled.
///
/// Waits the endpoint's fetch interval after a success and the configured failure interval
/// after an error. Only changed tips are published; every failure publishes an unhealthy
/// status.
pub async fn run_fetch_loop(ctx: SyncContext, delegator: Arc<dyn Delegator>, endpoint: Arc<Endpoint>) {
    let registry = ctx.registry().clone();
    let cancel = ctx.cancel_token().clone();
    let failure_interval = registry.sync_config().failure_interval();
    let mut reporter = TipReporter::new(registry.clone(), endpoint.clone());

    tracing::debug!(
        endpoint = %endpoint.name(),
        interval_secs = endpoint.fetch_interval().as_secs(),
        "fetch loop started"
    );

    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = delegator.get_tip(&registry, &endpoint) => result,
        };

        let delay = match result {
            Ok(tip) => {
                reporter.observe(tip);
                endpoint.fetch_interval()
            }
            Err(e) => {
                tracing::warn!(endpoint = %endpoint.name(), error = %e, "tip fetch failed");
                reporter.fail();
                failure_interval
            }
        };

        if sleep_or_cancel(&cancel, delay).await {
            break;
        }
    }

    tracing::debug!(endpoint = %endpoint.name(), "fetch loop stopped");
}

/// Fetches and stores the node's client version once. Failures are only logged.
pub async fn refresh_client_version(delegator: Arc<dyn Delegator>, endpoint: Arc<Endpoint>) {
    match delegator.get_client_version(&endpoint).await {
        Ok(version) => {
            tracing::info!(endpoint = %endpoint.name(), version = %version, "client version");
            endpoint.set_client_version(version);
        }
        Err(e) => {
            tracing::debug!(endpoint = %endpoint.name(), error = %e, "client version unavailable");
        }
    }
}
