//! Stream command seam between the broker and Redis.
//!
//! [`RedisBroker`](super::RedisBroker) only talks to Redis through the
//! [`StreamClient`] trait, so the delivery loop can be driven by an in-process
//! fake in tests.

use super::envelope::PAYLOAD_FIELD;
use crate::error::{QueueError, QueueResult};
use ::redis::streams::{
    StreamClaimReply, StreamId, StreamInfoGroupsReply, StreamMaxlen, StreamPendingCountReply,
    StreamReadOptions, StreamReadReply,
};
use ::redis::{AsyncCommands, Client, RedisError, aio::ConnectionManager};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// A stream entry as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Redis stream id (`<ms>-<seq>`)
    pub id: String,
    /// The `payload` field, if present
    pub payload: Option<String>,
}

impl From<StreamId> for StreamEntry {
    fn from(entry: StreamId) -> Self {
        let payload = entry.get::<String>(PAYLOAD_FIELD);
        Self {
            id: entry.id,
            payload,
        }
    }
}

/// One row of `XPENDING` extended output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    pub times_delivered: usize,
}

/// Stream trimming applied by `XADD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trim {
    /// `MAXLEN ~ n`
    Approximate(usize),
    /// `MAXLEN = n`
    Exact(usize),
}

/// Redis Streams commands used by the broker.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// `XADD stream [MAXLEN ...] * payload <payload>`; returns the entry id.
    async fn add(&self, stream: &str, payload: &str, trim: Option<Trim>) -> QueueResult<String>;

    /// Names of the consumer groups of `stream` (empty when the stream does not exist).
    async fn groups(&self, stream: &str) -> QueueResult<Vec<String>>;

    /// `XGROUP CREATE stream group 0 MKSTREAM`. Returns `false` if the group
    /// already existed.
    async fn create_group(&self, stream: &str, group: &str) -> QueueResult<bool>;

    /// `XREADGROUP GROUP group consumer COUNT count BLOCK block STREAMS stream >`.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<StreamEntry>>;

    /// `XPENDING stream group IDLE min_idle - + count`.
    async fn pending_idle(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<PendingEntry>>;

    /// `XCLAIM stream group consumer min_idle ids...`.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> QueueResult<Vec<StreamEntry>>;

    /// `XACK stream group ids...`; returns the number of acknowledged entries.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> QueueResult<u64>;

    /// A client whose blocking reads do not stall commands issued through `self`.
    async fn dedicated(&self) -> QueueResult<Arc<dyn StreamClient>>;
}

/// [`StreamClient`] over a Redis connection manager.
#[derive(Clone)]
pub struct RedisStreamClient {
    client: Client,
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStreamClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamClient")
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

fn is_missing_stream(error: &RedisError) -> bool {
    error.to_string().to_lowercase().contains("no such key")
}

impl RedisStreamClient {
    /// Connect to the Redis server at `connection_string`
    pub async fn connect(connection_string: &str) -> QueueResult<Self> {
        let client = Client::open(connection_string)
            .map_err(|e| QueueError::broker(format!("Failed to create Redis client: {}", e), e))?;
        Self::from_client(client).await
    }

    /// Open a connection manager on an existing client
    pub async fn from_client(client: Client) -> QueueResult<Self> {
        let conn = timeout(Duration::from_secs(10), client.get_connection_manager())
            .await
            .map_err(|e| QueueError::broker("Timed out connecting to Redis", e))?
            .map_err(|e| {
                QueueError::broker(
                    format!("Failed to create Redis connection manager: {}", e),
                    e,
                )
            })?;

        Ok(Self { client, conn })
    }
}

#[async_trait]
impl StreamClient for RedisStreamClient {
    async fn add(&self, stream: &str, payload: &str, trim: Option<Trim>) -> QueueResult<String> {
        let mut conn = self.conn.clone();
        let items = [(PAYLOAD_FIELD, payload)];

        let id: String = match trim {
            Some(Trim::Approximate(len)) => {
                conn.xadd_maxlen(stream, StreamMaxlen::Approx(len), "*", &items)
                    .await?
            }
            Some(Trim::Exact(len)) => {
                conn.xadd_maxlen(stream, StreamMaxlen::Equals(len), "*", &items)
                    .await?
            }
            None => conn.xadd(stream, "*", &items).await?,
        };

        Ok(id)
    }

    async fn groups(&self, stream: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let reply: Result<StreamInfoGroupsReply, RedisError> = conn.xinfo_groups(stream).await;

        match reply {
            Ok(reply) => Ok(reply.groups.into_iter().map(|group| group.name).collect()),
            Err(e) if is_missing_stream(&e) => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_group(&self, stream: &str, group: &str) -> QueueResult<bool> {
        let mut conn = self.conn.clone();
        let created: Result<(), RedisError> = conn.xgroup_create_mkstream(stream, group, "0").await;

        match created {
            Ok(()) => Ok(true),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> QueueResult<Vec<StreamEntry>> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block.as_millis() as usize);

        let reply: Option<StreamReadReply> = conn.xread_options(&[stream], &[">"], &options).await?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(StreamEntry::from)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn pending_idle(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> QueueResult<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply = ::redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle.as_millis() as u64)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .ids
            .into_iter()
            .map(|pending| PendingEntry {
                id: pending.id,
                consumer: pending.consumer,
                idle: Duration::from_millis(pending.last_delivered_ms as u64),
                times_delivered: pending.times_delivered,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> QueueResult<Vec<StreamEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let reply: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle.as_millis() as u64, ids)
            .await?;

        Ok(reply.ids.into_iter().map(StreamEntry::from).collect())
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> QueueResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let acked: u64 = conn.xack(stream, group, ids).await?;
        Ok(acked)
    }

    async fn dedicated(&self) -> QueueResult<Arc<dyn StreamClient>> {
        let client = Self::from_client(self.client.clone()).await?;
        Ok(Arc::new(client))
    }
}
