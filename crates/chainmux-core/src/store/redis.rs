use ::redis::{aio::ConnectionManager, streams::StreamRangeReply, Client};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::{MessageStream, Store, StoreError, StreamEntry, STREAM_PAYLOAD_FIELD};

const SCAN_BATCH: usize = 200;

/// [`Store`] backed by a Redis server.
///
/// Commands share one multiplexed [`ConnectionManager`], which reconnects on its own.
/// Each pub/sub subscription opens a dedicated connection.
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
}

impl RedisStore {
    /// Opens a client for `url` and establishes the shared command connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Redis`] if the URL is rejected or the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, connection })
    }

    fn conn(&self) -> ConnectionManager {
        self.connection.clone()
    }

    fn now_millis() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default()
    }

    /// `PX` argument for `ttl`: at least one millisecond, saturating at the largest value
    /// Redis accepts.
    fn px_millis(ttl: Duration) -> i64 {
        i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
    }

    fn entries(reply: StreamRangeReply) -> Vec<StreamEntry> {
        reply
            .ids
            .into_iter()
            .filter_map(|entry| {
                let payload = entry.get::<String>(STREAM_PAYLOAD_FIELD);
                if payload.is_none() {
                    tracing::warn!(id = %entry.id, "stream entry without payload field");
                }
                payload.map(|payload| StreamEntry { id: entry.id, payload })
            })
            .collect()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value: Option<String> =
            ::redis::cmd("GET").arg(key).query_async(&mut self.conn()).await?;
        Ok(value)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let values: Vec<Option<String>> =
            ::redis::cmd("MGET").arg(keys).query_async(&mut self.conn()).await?;
        Ok(values)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(Self::px_millis(ttl))
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{prefix}*");
        let mut conn = self.conn();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let _: () =
            ::redis::cmd("PUBLISH").arg(channel).arg(payload).query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<MessageStream, StoreError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub
            .into_on_message()
            .map(|message| message.get_payload::<String>().map_err(StoreError::from));
        Ok(stream.boxed())
    }

    async fn xadd_capped(
        &self,
        key: &str,
        payload: &str,
        max_len: usize,
    ) -> Result<String, StoreError> {
        let id: String = ::redis::cmd("XADD")
            .arg(key)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .arg("*")
            .arg(STREAM_PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut self.conn())
            .await?;
        Ok(id)
    }

    async fn xrevrange(&self, key: &str, count: usize) -> Result<Vec<StreamEntry>, StoreError> {
        let reply: StreamRangeReply = ::redis::cmd("XREVRANGE")
            .arg(key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn())
            .await?;
        Ok(Self::entries(reply))
    }

    async fn xrange_after(
        &self,
        key: &str,
        after_id: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let reply: StreamRangeReply = ::redis::cmd("XRANGE")
            .arg(key)
            .arg(format!("({after_id}"))
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut self.conn())
            .await?;
        Ok(Self::entries(reply))
    }

    async fn zadd_expiring(
        &self,
        key: &str,
        member: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = Self::now_millis();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let _: () = ::redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(now)
            .ignore()
            .cmd("ZADD")
            .arg(key)
            .arg(now.saturating_add(ttl_ms))
            .arg(member)
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms.max(1))
            .arg("GT")
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms.max(1))
            .arg("NX")
            .ignore()
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn zlive_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let members: Vec<String> = ::redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(format!("({}", Self::now_millis()))
            .arg("+inf")
            .query_async(&mut self.conn())
            .await?;
        Ok(members)
    }

    async fn hincr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        let value: i64 = ::redis::cmd("HINCRBY")
            .arg(key)
            .arg(field)
            .arg(delta)
            .query_async(&mut self.conn())
            .await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: i64) -> Result<(), StoreError> {
        let _: () = ::redis::cmd("HSET")
            .arg(key)
            .arg(field)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn expire_nx(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let set: i64 = ::redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg("NX")
            .query_async(&mut self.conn())
            .await?;
        Ok(set == 1)
    }
}
