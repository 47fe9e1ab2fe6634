//! Sync engine: keeps endpoint health and tips current.
//!
//! # Architecture
//!
//! ```text
//!  fetch task (poll) ──┐
//!  fetch task (poll) ──┼──► hub.publish ──► hub run loop ──► updater ──► Endpoint / EndpointSet
//!  push task (ws)    ──┘
//! ```
//!
//! One task per endpoint produces [`ChainStatus`] events: the default poll loop
//! ([`fetcher`]) or a delegator-owned push loop ([`push`]). The updater ([`updater`]) is the
//! single consumer of the hub feed and the only writer of endpoint health, tips, weight
//! tables, and max tip heights. A single cancellation token stops every task.

pub mod fetcher;
pub mod push;
pub mod updater;

pub use push::{run_push_loop, BlockStream, TipStream};
pub use updater::apply_status;

use parking_lot::Mutex;
use std::{future::Future, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    types::{Block, ChainStatus},
    upstream::{Endpoint, Multiplexer},
};

type TaskList = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// What a sync task needs: the registry, the shared cancellation token, and a way to spawn
/// tasks that are awaited on shutdown.
#[derive(Clone)]
pub struct SyncContext {
    registry: Arc<Multiplexer>,
    cancel: CancellationToken,
    tasks: TaskList,
}

impl SyncContext {
    pub(crate) fn new(registry: Arc<Multiplexer>, cancel: CancellationToken) -> Self {
        Self { registry, cancel, tasks: TaskList::default() }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<Multiplexer> {
        &self.registry
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Spawns a task tracked by the sync lifecycle.
    pub fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().push(tokio::spawn(task));
    }
}

/// Held by the registry while syncing is active.
pub(crate) struct SyncHandle {
    cancel: CancellationToken,
    tasks: TaskList,
}

impl SyncHandle {
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        let count = tasks.len();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "sync task ended abnormally");
            }
        }
        tracing::info!(tasks = count, "sync stopped");
    }
}

/// Starts the hub run loop, the updater, and one sync task per endpoint.
pub(crate) async fn start(registry: &Arc<Multiplexer>) -> SyncHandle {
    let cancel = CancellationToken::new();
    let ctx = SyncContext::new(registry.clone(), cancel.clone());

    let (queue, feed) = mpsc::unbounded_channel();
    let subscription = registry.hub().subscribe(queue);

    ctx.spawn({
        let hub = registry.hub().clone();
        let fatal = registry.fatal_signal();
        let cancel = cancel.clone();
        async move {
            if let Err(e) = hub.run(cancel).await {
                tracing::error!(error = %e, "chain status hub stopped");
                fatal.cancel();
            }
        }
    });
    ctx.spawn(updater::run_updater(registry.clone(), feed, subscription, cancel.clone()));

    let endpoints = registry.endpoints();
    for endpoint in &endpoints {
        start_endpoint(&ctx, endpoint).await;
    }
    tracing::info!(endpoints = endpoints.len(), "sync started");

    SyncHandle { cancel, tasks: ctx.tasks }
}

async fn start_endpoint(ctx: &SyncContext, endpoint: &Arc<Endpoint>) {
    let Some(delegator) = ctx.registry.delegator_for(endpoint.chain()) else {
        tracing::error!(endpoint = %endpoint.name(), chain = %endpoint.chain(), "no delegator for chain, not syncing");
        return;
    };

    ctx.spawn(fetcher::refresh_client_version(delegator.clone(), endpoint.clone()));

    match delegator.start_sync(ctx, endpoint).await {
        Ok(true) => {
            tracing::debug!(endpoint = %endpoint.name(), "sync handled by delegator");
        }
        Ok(false) => ctx.spawn(fetcher::run_fetch_loop(ctx.clone(), delegator, endpoint.clone())),
        Err(e) => {
            tracing::warn!(endpoint = %endpoint.name(), error = %e, "delegator sync failed, falling back to polling");
            ctx.spawn(fetcher::run_fetch_loop(ctx.clone(), delegator, endpoint.clone()));
        }
    }
}

/// Publishes an endpoint's observations, suppressing repeats of an unchanged healthy tip.
pub(crate) struct TipReporter {
    registry: Arc<Multiplexer>,
    endpoint: Arc<Endpoint>,
    last: Option<Block>,
    failing: bool,
}

impl TipReporter {
    pub(crate) fn new(registry: Arc<Multiplexer>, endpoint: Arc<Endpoint>) -> Self {
        Self { registry, endpoint, last: None, failing: false }
    }

    /// Publishes a healthy status if the tip changed, the previous attempt failed, or the
    /// endpoint is currently marked unhealthy.
    pub(crate) fn observe(&mut self, tip: Block) {
        let changed = self.last.as_ref() != Some(&tip);
        if changed || self.failing || !self.endpoint.is_healthy() {
            tracing::debug!(endpoint = %self.endpoint.name(), tip = %tip, "tip observed");
            self.registry.hub().publish(ChainStatus::healthy(
                self.endpoint.name(),
                self.endpoint.chain().clone(),
                tip.clone(),
            ));
            self.last = Some(tip);
        }
        self.failing = false;
    }

    pub(crate) fn fail(&mut self) {
        self.failing = true;
        self.registry.hub().publish(ChainStatus::unhealthy(
            self.endpoint.name(),
            self.endpoint.chain().clone(),
            self.last.clone(),
        ));
    }
}
