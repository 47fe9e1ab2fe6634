use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::{
    decode, encode, sleep_or_cancel, ChainStatusHub, Command, Control, FailureCounter, HubError,
    StatusQueue, Subscribers, SubscriptionId,
};
use crate::{
    config::HubConfig,
    store::{MessageStream, Store, StoreError},
    types::ChainStatus,
};

const BACKEND: &str = "pubsub";

enum Event {
    Command(Option<Command>),
    Message(Option<Result<String, StoreError>>),
}

/// Cross-process hub over store pub/sub.
///
/// Every publish is broadcast on `{prefix}:status` and written to a per-endpoint snapshot key
/// `{prefix}:snapshot:{brand}:{network}:{endpoint}` that expires after
/// [`HubConfig::snapshot_ttl`]. A new subscriber first reads every snapshot key and then joins
/// the live fan-out. A status published between those two steps is missed until the endpoint
/// changes again.
///
/// Broadcast delivery is at most once. Consecutive store failures beyond
/// [`HubConfig::max_failures`] end the run loop with [`HubError::TooManyFailures`].
pub struct PubSubHub {
    store: Arc<dyn Store>,
    config: HubConfig,
    channel: String,
    control: Control<Subscribers>,
}

impl PubSubHub {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: HubConfig) -> Self {
        let channel = format!("{}:status", config.prefix);
        Self { store, config, channel, control: Control::new(Subscribers::default()) }
    }

    fn snapshot_prefix(&self) -> String {
        format!("{}:snapshot:", self.config.prefix)
    }

    fn snapshot_key(&self, status: &ChainStatus) -> String {
        format!("{}{}:{}", self.snapshot_prefix(), status.chain.key_fragment(), status.endpoint)
    }

    async fn apply(
        &self,
        command: Command,
        subscribers: &mut Subscribers,
        failures: &mut FailureCounter,
    ) -> Result<(), HubError> {
        match command {
            Command::Publish(status) => {
                let payload = encode(&status);
                let written = self
                    .store
                    .set_ex(&self.snapshot_key(&status), &payload, self.config.snapshot_ttl())
                    .await;
                let published = self.store.publish(&self.channel, &payload).await;
                match written.and(published) {
                    Ok(()) => failures.reset(),
                    Err(e) => failures.record(BACKEND, &e)?,
                }
            }
            Command::Subscribe(id, queue) => {
                match self.bootstrap().await {
                    Ok(snapshot) => {
                        failures.reset();
                        tracing::debug!(subscription = id, replayed = snapshot.len(), "pubsub bootstrap");
                        for status in snapshot {
                            if queue.send(status).is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Err(e) => failures.record(BACKEND, &e)?,
                }
                subscribers.insert(id, queue);
            }
            Command::Unsubscribe(id) => subscribers.remove(id),
        }
        Ok(())
    }

    async fn bootstrap(&self) -> Result<Vec<ChainStatus>, StoreError> {
        let keys = self.store.scan_prefix(&self.snapshot_prefix()).await?;
        let values = self.store.mget(&keys).await?;
        Ok(values.iter().flatten().filter_map(|payload| decode(payload)).collect())
    }
}

#[async_trait]
impl ChainStatusHub for PubSubHub {
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
        let (receiver, subscribers) = &mut *guard;
        let mut failures = FailureCounter::new(self.config.max_failures);
        let mut feed: Option<MessageStream> = None;

        loop {
            if feed.is_none() {
                match self.store.subscribe(&self.channel).await {
                    Ok(stream) => {
                        tracing::info!(channel = %self.channel, "pubsub hub attached");
                        feed = Some(stream);
                    }
                    Err(e) => {
                        failures.record(BACKEND, &e)?;
                        if sleep_or_cancel(&cancel, self.config.poll_interval()).await {
                            return Ok(());
                        }
                        continue;
                    }
                }
            }
            let Some(stream) = feed.as_mut() else { continue };

            let event = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                command = receiver.recv() => Event::Command(command),
                message = stream.next() => Event::Message(message),
            };

            match event {
                Event::Command(None) => return Err(HubError::Closed),
                Event::Command(Some(command)) => {
                    self.apply(command, subscribers, &mut failures).await?;
                }
                Event::Message(Some(Ok(payload))) => {
                    failures.reset();
                    if let Some(status) = decode(&payload) {
                        subscribers.deliver(&status);
                    }
                }
                Event::Message(Some(Err(e))) => failures.record(BACKEND, &e)?,
                Event::Message(None) => {
                    failures.record(BACKEND, &StoreError::SubscriptionClosed)?;
                    feed = None;
                    if sleep_or_cancel(&cancel, self.config.poll_interval()).await {
                        return Ok(());
                    }
                }
            }
        }
    }
}
