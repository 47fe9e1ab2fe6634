//! Chain status hub: the bus carrying health and tip events from fetch tasks to the updater.
//!
//! Every backend follows the same single-writer discipline. `publish`, `subscribe`, and
//! `unsubscribe` only enqueue a [`Command`] on an unbounded control channel; the backend's
//! `run` loop is the only code that touches the subscriber list or any snapshot state.
//! Commands issued before `run` starts are buffered and applied once it does.
//!
//! | Backend | Scope | Late subscriber sees |
//! |---------|-------|----------------------|
//! | [`LocalHub`] | one process | latest status per endpoint, replayed in full |
//! | [`PubSubHub`] | cross-process | snapshot keys at attach time, then live (racy gap) |
//! | [`StreamHub`] | cross-process | last N log entries deduplicated, then tailed |

mod local;
mod pubsub;
mod stream;

pub use self::{local::LocalHub, pubsub::PubSubHub, stream::StreamHub};

use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{HubBackend, HubConfig},
    store::{Store, StoreError},
    types::ChainStatus,
};

/// Queue a subscriber receives statuses on.
pub type StatusQueue = mpsc::UnboundedSender<ChainStatus>;

/// Handle returned by [`ChainStatusHub::subscribe`], used to unsubscribe.
pub type SubscriptionId = u64;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HubError {
    #[error("hub control channel closed")]
    Closed,

    #[error("hub run loop is already running")]
    AlreadyRunning,

    #[error("hub store failure: {0}")]
    Store(#[from] StoreError),

    #[error("hub gave up after {0} consecutive store failures")]
    TooManyFailures(u32),

    #[error("hub backend {0} requires a store")]
    MissingStore(&'static str),
}

/// Publish/subscribe bus for [`ChainStatus`] events.
#[async_trait]
pub trait ChainStatusHub: Send + Sync {
    /// Enqueues a status for delivery. Never blocks.
    fn publish(&self, status: ChainStatus);

    /// Registers `queue`. The backend replays its snapshot into the queue before live events.
    fn subscribe(&self, queue: StatusQueue) -> SubscriptionId;

    fn unsubscribe(&self, id: SubscriptionId);

    /// Runs the control loop until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`HubError::AlreadyRunning`] if another `run` is active, and
    /// [`HubError::TooManyFailures`] when a store-backed hub exceeds its failure threshold.
    async fn run(&self, cancel: CancellationToken) -> Result<(), HubError>;
}

/// Builds the hub selected by configuration.
///
/// # Errors
///
/// Returns [`HubError::MissingStore`] when a store-backed backend has no store.
pub fn build_hub(
    config: &HubConfig,
    store: Option<Arc<dyn Store>>,
) -> Result<Arc<dyn ChainStatusHub>, HubError> {
    let hub: Arc<dyn ChainStatusHub> = match (config.backend, store) {
        (HubBackend::Memory, _) => Arc::new(LocalHub::new()),
        (HubBackend::Pubsub, Some(store)) => Arc::new(PubSubHub::new(store, config.clone())),
        (HubBackend::Stream, Some(store)) => Arc::new(StreamHub::new(store, config.clone())),
        (backend, None) => return Err(HubError::MissingStore(backend.as_str())),
    };
    tracing::info!(backend = config.backend.as_str(), "chain status hub created");
    Ok(hub)
}

/// Message serialized through a hub's control loop.
#[derive(Debug)]
pub(crate) enum Command {
    Publish(ChainStatus),
    Subscribe(SubscriptionId, StatusQueue),
    Unsubscribe(SubscriptionId),
}

/// Control channel shared by all backends.
///
/// The receiver and the run-loop state live behind one async mutex that `run` holds for its
/// whole lifetime, so a stopped hub can be run again without losing subscribers.
pub(crate) struct Control<S> {
    sender: mpsc::UnboundedSender<Command>,
    state: Mutex<(mpsc::UnboundedReceiver<Command>, S)>,
    next_id: AtomicU64,
}

impl<S> Control<S> {
    pub(crate) fn new(state: S) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self { sender, state: Mutex::new((receiver, state)), next_id: AtomicU64::new(1) }
    }

    pub(crate) fn send(&self, command: Command) {
        // the receiver lives as long as self
        let _ = self.sender.send(command);
    }

    pub(crate) fn subscribe(&self, queue: StatusQueue) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(Command::Subscribe(id, queue));
        id
    }

    pub(crate) fn lock(
        &self,
    ) -> Result<MutexGuard<'_, (mpsc::UnboundedReceiver<Command>, S)>, HubError> {
        self.state.try_lock().map_err(|_| HubError::AlreadyRunning)
    }
}

/// Live subscriber queues keyed by subscription id.
#[derive(Default)]
pub(crate) struct Subscribers {
    queues: HashMap<SubscriptionId, StatusQueue>,
}

impl Subscribers {
    pub(crate) fn insert(&mut self, id: SubscriptionId, queue: StatusQueue) {
        self.queues.insert(id, queue);
    }

    pub(crate) fn remove(&mut self, id: SubscriptionId) {
        self.queues.remove(&id);
    }

    /// Delivers to every queue, dropping subscribers whose receiver is gone.
    pub(crate) fn deliver(&mut self, status: &ChainStatus) {
        self.queues.retain(|id, queue| {
            let alive = queue.send(status.clone()).is_ok();
            if !alive {
                tracing::debug!(subscription = id, "dropping closed hub subscriber");
            }
            alive
        });
    }
}

/// Consecutive-failure counter for store-backed hubs.
pub(crate) struct FailureCounter {
    count: u32,
    max: u32,
}

impl FailureCounter {
    pub(crate) fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    pub(crate) fn reset(&mut self) {
        self.count = 0;
    }

    /// Records a failure. Errors once the count exceeds the threshold.
    pub(crate) fn record(&mut self, backend: &str, error: &StoreError) -> Result<(), HubError> {
        self.count += 1;
        tracing::warn!(
            backend = backend,
            failures = self.count,
            max_failures = self.max,
            error = %error,
            "hub store operation failed"
        );
        if self.count > self.max {
            tracing::error!(backend = backend, failures = self.count, "hub failure threshold exceeded");
            return Err(HubError::TooManyFailures(self.count));
        }
        Ok(())
    }
}

/// Sleeps for `delay`. Returns `true` if `cancel` fired first.
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => true,
        () = tokio::time::sleep(delay) => false,
    }
}

pub(crate) fn encode(status: &ChainStatus) -> String {
    // ChainStatus contains only strings, integers, and bools
    serde_json::to_string(status).unwrap_or_default()
}

pub(crate) fn decode(payload: &str) -> Option<ChainStatus> {
    match serde_json::from_str(payload) {
        Ok(status) => Some(status),
        Err(e) => {
            tracing::warn!(error = %e, "discarding malformed chain status payload");
            None
        }
    }
}
