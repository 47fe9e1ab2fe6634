use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use std::{
    collections::{HashMap, VecDeque},
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::sync::broadcast;

use super::{MessageStream, Store, StoreError, StreamEntry, StreamId};

const CHANNEL_CAPACITY: usize = 1024;

/// Expired keys are swept once per this many writes.
const SWEEP_EVERY_WRITES: usize = 256;

#[derive(Default)]
struct Hash {
    fields: HashMap<String, i64>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Log {
    entries: VecDeque<(StreamId, String)>,
    last_id: StreamId,
}

/// In-process [`Store`] with Redis-compatible semantics for the operations the core uses.
///
/// Expiry is evaluated on read, and every few hundred writes a sweep drops expired strings,
/// hashes, and sorted-set members so one-shot keys do not accumulate. Pub/sub uses one
/// broadcast channel per name, so a subscriber that falls more than the channel capacity
/// behind skips the missed messages.
#[derive(Default)]
pub struct MemoryStore {
    strings: DashMap<String, (String, Instant)>,
    sorted_sets: DashMap<String, HashMap<String, Instant>>,
    hashes: DashMap<String, Hash>,
    logs: DashMap<String, Log>,
    channels: DashMap<String, broadcast::Sender<String>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default()
    }

    /// Drops every expired string, hash, and sorted-set member, and sorted sets left empty.
    pub fn purge_expired(&self) {
        let now = Instant::now();
        self.strings.retain(|_, (_, expires_at)| *expires_at > now);
        self.hashes.retain(|_, hash| hash.expires_at.map_or(true, |at| at > now));
        self.sorted_sets.retain(|_, set| {
            set.retain(|_, expires_at| *expires_at > now);
            !set.is_empty()
        });
    }

    /// Counts a write and sweeps on every [`SWEEP_EVERY_WRITES`]th. Must not be called
    /// while holding a map guard.
    fn note_write(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY_WRITES == SWEEP_EVERY_WRITES - 1 {
            self.purge_expired();
        }
    }

    fn live_string(&self, key: &str) -> Option<String> {
        let expired = {
            let entry = self.strings.get(key)?;
            if entry.1 > Instant::now() {
                return Some(entry.0.clone());
            }
            true
        };
        if expired {
            self.strings.remove(key);
        }
        None
    }

    fn to_entries<'a>(items: impl Iterator<Item = &'a (StreamId, String)>) -> Vec<StreamEntry> {
        items.map(|(id, payload)| StreamEntry { id: id.to_string(), payload: payload.clone() }).collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.live_string(key))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        Ok(keys.iter().map(|key| self.live_string(key)).collect())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.strings.insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        self.note_write();
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .strings
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().1 > now)
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        if let Some(sender) = self.channels.get(channel) {
            // no receivers is not an error for fire-and-forget pub/sub
            let _ = sender.send(payload.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();

        let stream = futures::stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((Ok(message), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped = skipped, "memory subscription lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn xadd_capped(
        &self,
        key: &str,
        payload: &str,
        max_len: usize,
    ) -> Result<String, StoreError> {
        let mut log = self.logs.entry(key.to_string()).or_default();
        let millis = Self::now_millis().max(log.last_id.millis);
        let id = if millis == log.last_id.millis {
            StreamId { millis, seq: log.last_id.seq + 1 }
        } else {
            StreamId { millis, seq: 0 }
        };
        log.last_id = id;
        log.entries.push_back((id, payload.to_string()));
        while log.entries.len() > max_len.max(1) {
            log.entries.pop_front();
        }
        Ok(id.to_string())
    }

    async fn xrevrange(&self, key: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError> {
        Ok(self
            .logs
            .get(key)
            .map(|log| Self::to_entries(log.entries.iter().rev().take(count)))
            .unwrap_or_default())
    }

    async fn xrange_after(
        &self,
        key: &str,
        after_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let after: StreamId = after_id.parse()?;
        Ok(self
            .logs
            .get(key)
            .map(|log| {
                Self::to_entries(log.entries.iter().filter(|(id, _)| *id > after).take(count))
            })
            .unwrap_or_default())
    }

    async fn zadd_expiring(
        &self,
        key: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Instant::now();
        {
            let mut set = self.sorted_sets.entry(key.to_string()).or_default();
            set.retain(|_, expires_at| *expires_at > now);
            set.insert(member.to_string(), now + ttl);
        }
        self.note_write();
        Ok(())
    }

    async fn zlive_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        Ok(self
            .sorted_sets
            .get(key)
            .map(|set| {
                set.iter()
                    .filter(|(_, expires_at)| **expires_at > now)
                    .map(|(member, _)| member.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let value = {
            let mut hash = self.hashes.entry(key.to_string()).or_default();
            if hash.expires_at.is_some_and(|at| at <= Instant::now()) {
                *hash = Hash::default();
            }
            let value = hash.fields.entry(field.to_string()).or_insert(0);
            *value += delta;
            *value
        };
        self.note_write();
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: i64) -> Result<(), StoreError> {
        self.hashes.entry(key.to_string()).or_default().fields.insert(field.to_string(), value);
        self.note_write();
        Ok(())
    }

    async fn expire_nx(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        match self.hashes.get_mut(key) {
            Some(mut hash) if hash.expires_at.is_none() => {
                hash.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
