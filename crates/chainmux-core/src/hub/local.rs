use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use super::{ChainStatusHub, Command, Control, HubError, StatusQueue, Subscribers, SubscriptionId};
use crate::types::{ChainRef, ChainStatus};

#[derive(Default)]
struct LocalState {
    subscribers: Subscribers,
    snapshots: BTreeMap<ChainRef, BTreeMap<String, ChainStatus>>,
}

impl LocalState {
    fn apply(&mut self, command: Command) {
        match command {
            Command::Publish(status) => {
                self.subscribers.deliver(&status);
                self.snapshots
                    .entry(status.chain.clone())
                    .or_default()
                    .insert(status.endpoint.clone(), status);
            }
            Command::Subscribe(id, queue) => {
                for status in self.snapshots.values().flat_map(BTreeMap::values) {
                    if queue.send(status.clone()).is_err() {
                        return;
                    }
                }
                self.subscribers.insert(id, queue);
            }
            Command::Unsubscribe(id) => self.subscribers.remove(id),
        }
    }
}

/// In-process hub. Publishes fan out to every subscriber in publish order.
///
/// Keeps one snapshot per chain holding the latest status of each of its endpoints; a new
/// subscriber receives all of them before any live event.
pub struct LocalHub {
    control: Control<LocalState>,
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalHub {
    #[must_use]
    pub fn new() -> Self {
        Self { control: Control::new(LocalState::default()) }
    }
}

#[async_trait]
impl ChainStatusHub for LocalHub {
    fn publish(&self, status: ChainStatus) {
        self.control.send(Command::Publish(status));
    }

    fn subscribe(&self, queue: StatusQueue) -> SubscriptionId {
        self.control.subscribe(queue)
    }

    fn unsubscribe(&self, id: SubscriptionId) {
        self.control.send(Command::Unsubscribe(id));
    }

    async fn run(&self, cancel: CancellationToken) -> Result<(), HubError> {
        let mut guard = self.control.lock()?;
        let (receiver, state) = &mut *guard;
        tracing::debug!("local hub running");

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                command = receiver.recv() => match command {
                    Some(command) => state.apply(command),
                    None => return Err(HubError::Closed),
                },
            }
        }
    }
}
