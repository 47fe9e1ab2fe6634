use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;

use super::{
    decode, encode, ChainStatusHub, Command, Control, FailureCounter, HubError, StatusQueue,
    SubscriptionId,
};
use crate::{
    config::HubConfig,
    store::{Store, StoreError, StreamEntry},
    types::ChainStatus,
};

const BACKEND: &str = "stream";
const TAIL_BATCH: usize = 100;
const LOG_START: &str = "0-0";

enum Event {
    Command(Option<Command>),
    Tail,
}

struct Tail {
    queue: StatusQueue,
    /// `None` until the replay has been read.
    cursor: Option<String>,
}

/// Cross-process hub over a capped store log.
///
/// Publishes append to `{prefix}:stream`, capped at [`HubConfig::stream_max_len`]. A new
/// subscriber replays the latest [`HubConfig::replay_count`] entries, keeping only the newest
/// entry per endpoint and delivering those in log order, then tails from its own cursor with
/// exclusive range reads. A replay that fails is retried on the next tail pass rather than
/// tailing from the start of the log. Empty reads back off by [`HubConfig::poll_interval`].
pub struct StreamHub {
    store: Arc<dyn Store>,
    config: HubConfig,
    key: String,
    control: Control<HashMap<SubscriptionId, Tail>>,
}

impl StreamHub {
    #[must_use]
    pub fn new(store: Arc<dyn Store>, config: HubConfig) -> Self {
        let key = format!("{}:stream", config.prefix);
        Self { store, config, key, control: Control::new(HashMap::new()) }
    }

    /// Newest-per-endpoint view of `entries` (given newest first), returned oldest first.
    fn dedup_replay(entries: &[StreamEntry]) -> Vec<ChainStatus> {
        let mut seen = HashSet::new();
        let mut kept: Vec<ChainStatus> = entries
            .iter()
            .filter_map(|entry| decode(&entry.payload))
            .filter(|status| seen.insert(status.endpoint.clone()))
            .collect();
        kept.reverse();
        kept
    }

    /// Sends the replay and positions the cursor at the newest entry read. Returns `false` if
    /// the subscriber has gone away.
    async fn replay(&self, id: SubscriptionId, tail: &mut Tail) -> Result<bool, StoreError> {
        let entries = self.store.xrevrange(&self.key, self.config.replay_count).await?;
        let replay = Self::dedup_replay(&entries);
        tracing::debug!(
            subscription = id,
            read = entries.len(),
            replayed = replay.len(),
            "stream replay"
        );
        tail.cursor =
            Some(entries.first().map_or_else(|| LOG_START.to_string(), |e| e.id.clone()));
        Ok(replay.into_iter().all(|status| tail.queue.send(status).is_ok()))
    }

    async fn apply(
        &self,
        command: Command,
        tails: &mut HashMap<SubscriptionId, Tail>,
        failures: &mut FailureCounter,
    ) -> Result<(), HubError> {
        match command {
            Command::Publish(status) => {
                match self.store.xadd_capped(&self.key, &encode(&status), self.config.stream_max_len).await
                {
                    Ok(_) => failures.reset(),
                    Err(e) => failures.record(BACKEND, &e)?,
                }
            }
            Command::Subscribe(id, queue) => {
                let mut tail = Tail { queue, cursor: None };
                match self.replay(id, &mut tail).await {
                    Ok(open) => {
                        failures.reset();
                        if open {
                            tails.insert(id, tail);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(subscription = id, error = %e, "stream replay failed, will retry");
                        failures.record(BACKEND, &e)?;
                        tails.insert(id, tail);
                    }
                }
            }
            Command::Unsubscribe(id) => {
                tails.remove(&id);
            }
        }
        Ok(())
    }

    /// Advances every subscriber's cursor. Returns `true` if anything was delivered.
    async fn tail(
        &self,
        tails: &mut HashMap<SubscriptionId, Tail>,
        failures: &mut FailureCounter,
    ) -> Result<bool, HubError> {
        let mut progressed = false;
        let mut closed = Vec::new();

        for (id, tail) in tails.iter_mut() {
            let Some(cursor) = tail.cursor.as_deref() else {
                match self.replay(*id, tail).await {
                    Ok(open) => {
                        failures.reset();
                        progressed = true;
                        if !open {
                            closed.push(*id);
                        }
                    }
                    Err(e) => {
                        failures.record(BACKEND, &e)?;
                        return Ok(progressed);
                    }
                }
                continue;
            };
            let entries: Result<Vec<StreamEntry>, StoreError> =
                self.store.xrange_after(&self.key, cursor, TAIL_BATCH).await;
            let entries = match entries {
                Ok(entries) => {
                    failures.reset();
                    entries
                }
                Err(e) => {
                    failures.record(BACKEND, &e)?;
                    return Ok(progressed);
                }
            };

            for entry in entries {
                progressed = true;
                tail.cursor = Some(entry.id);
                if let Some(status) = decode(&entry.payload) {
                    if tail.queue.send(status).is_err() {
                        closed.push(*id);
                        break;
                    }
                }
            }
        }

        for id in closed {
            tracing::debug!(subscription = id, "dropping closed hub subscriber");
            tails.remove(&id);
        }
        Ok(progressed)
    }
}

#[async_trait]
impl ChainStatusHub for StreamHub {
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
        let (receiver, tails) = &mut *guard;
        let mut failures = FailureCounter::new(self.config.max_failures);
        let mut idle = false;
        tracing::info!(key = %self.key, "stream hub running");

        loop {
            let delay = match (tails.is_empty(), idle) {
                (true, _) => None,
                (false, true) => Some(self.config.poll_interval()),
                (false, false) => Some(Duration::ZERO),
            };
            let tick = async move {
                match delay {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return Ok(()),
                command = receiver.recv() => Event::Command(command),
                () = tick => Event::Tail,
            };

            match event {
                Event::Command(None) => return Err(HubError::Closed),
                Event::Command(Some(command)) => {
                    self.apply(command, tails, &mut failures).await?;
                    idle = false;
                }
                Event::Tail => idle = !self.tail(tails, &mut failures).await?,
            }
        }
    }
}
