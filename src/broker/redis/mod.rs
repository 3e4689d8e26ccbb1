//! Redis Streams broker for typedq.
//!
//! Each topic maps to one stream (`stream:{topic}` by default) shared through a
//! single consumer group, so every message is handled by one consumer of the
//! group. Entries are acknowledged only after the message callback succeeds;
//! anything left pending longer than the processing timeout is reclaimed by
//! whichever consumer scans the pending list next.
//!
//! # Features
//!
//! - **Distributed**: any number of processes can consume the same topic
//! - **Persistent**: messages survive process restarts
//! - **At-least-once**: failed or crashed deliveries are redelivered after the processing timeout
//! - **Bounded**: optional `MAXLEN` trimming on produce

mod client;
mod envelope;

pub use client::{PendingEntry, RedisStreamClient, StreamClient, StreamEntry, Trim};
pub use envelope::{Envelope, PAYLOAD_FIELD};

use super::{Broker, MessageHandler, panic_message};
use crate::config::RedisBrokerConfig;
use crate::error::{QueueError, QueueResult};
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pause after a failed read before the loop tries again.
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Registrations {
    consumers: Vec<(CancellationToken, JoinHandle<()>)>,
    closed: bool,
}

/// Redis Streams broker backend implementation
pub struct RedisBroker {
    client: Arc<dyn StreamClient>,
    config: RedisBrokerConfig,
    registrations: Mutex<Registrations>,
}

impl std::fmt::Debug for RedisBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBroker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisBroker {
    /// Connect to Redis using the given configuration
    pub async fn new(config: RedisBrokerConfig) -> QueueResult<Self> {
        if let Err(errors) = config.validate() {
            return Err(QueueError::config(format!(
                "invalid Redis broker configuration: {}",
                errors.join("; ")
            )));
        }

        let client = RedisStreamClient::connect(&config.connection_string).await?;
        info!(
            connection = %config.connection_string,
            group = %config.consumer_group,
            "connected to Redis"
        );

        Ok(Self::with_client(Arc::new(client), config))
    }

    /// Connect to Redis with default settings
    pub async fn connect(connection_string: &str) -> QueueResult<Self> {
        Self::new(RedisBrokerConfig::new(connection_string)).await
    }

    /// Build a broker on top of an existing stream client
    pub fn with_client(client: Arc<dyn StreamClient>, config: RedisBrokerConfig) -> Self {
        Self {
            client,
            config,
            registrations: Mutex::new(Registrations::default()),
        }
    }

    pub fn config(&self) -> &RedisBrokerConfig {
        &self.config
    }

    /// Number of delivery loops currently registered
    pub async fn consumer_count(&self) -> usize {
        self.registrations.lock().await.consumers.len()
    }

    fn trim(&self) -> Option<Trim> {
        self.config.max_len.map(|len| {
            if self.config.approximate_trim {
                Trim::Approximate(len)
            } else {
                Trim::Exact(len)
            }
        })
    }

    /// Create the consumer group for `stream` unless it already exists.
    async fn ensure_group(&self, stream: &str) -> QueueResult<()> {
        let group = &self.config.consumer_group;
        let groups = self.client.groups(stream).await?;
        if groups.iter().any(|existing| existing == group) {
            return Ok(());
        }

        if self.client.create_group(stream, group).await? {
            info!(stream = %stream, group = %group, "created consumer group");
        } else {
            debug!(stream = %stream, group = %group, "consumer group created concurrently");
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn produce(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        payload: Vec<u8>,
    ) -> QueueResult<()> {
        if self.registrations.lock().await.closed {
            return Err(QueueError::Closed);
        }
        if ctx.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let stream = self.config.stream_key(topic);
        let encoded = Envelope::new(payload).encode()?;

        tokio::select! {
            _ = ctx.cancelled() => Err(QueueError::Cancelled),
            added = self.client.add(&stream, &encoded, self.trim()) => {
                let id = added?;
                debug!(stream = %stream, id = %id, "message added to stream");
                Ok(())
            }
        }
    }

    async fn consume(
        &self,
        ctx: CancellationToken,
        topic: &str,
        on_message: MessageHandler,
    ) -> QueueResult<()> {
        if self.registrations.lock().await.closed {
            return Err(QueueError::Closed);
        }

        let stream = self.config.stream_key(topic);
        self.ensure_group(&stream).await?;

        let consumer = format!("{}{}-{}", self.config.consumer_prefix, topic, Uuid::new_v4());
        let reader = self.client.dedicated().await?;
        let token = ctx.child_token();

        let delivery = DeliveryLoop {
            client: Arc::clone(&self.client),
            reader,
            stream,
            group: self.config.consumer_group.clone(),
            consumer,
            config: self.config.clone(),
            on_message,
            token: token.clone(),
        };

        let mut registrations = self.registrations.lock().await;
        if registrations.closed {
            return Err(QueueError::Closed);
        }
        registrations
            .consumers
            .retain(|(_, handle)| !handle.is_finished());
        registrations
            .consumers
            .push((token, tokio::spawn(delivery.run())));

        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        let consumers = {
            let mut registrations = self.registrations.lock().await;
            if registrations.closed {
                return Ok(());
            }
            registrations.closed = true;
            std::mem::take(&mut registrations.consumers)
        };

        for (token, _) in &consumers {
            token.cancel();
        }

        let count = consumers.len();
        for (_, handle) in consumers {
            if let Err(e) = handle.await {
                warn!(error = %e, "delivery loop ended abnormally");
            }
        }

        debug!(consumers = count, "redis broker closed");
        Ok(())
    }
}

/// One consumer of one stream: blocking reads interleaved with claim scans.
struct DeliveryLoop {
    /// Shared connection for acks and claims
    client: Arc<dyn StreamClient>,
    /// Connection reserved for blocking reads
    reader: Arc<dyn StreamClient>,
    stream: String,
    group: String,
    consumer: String,
    config: RedisBrokerConfig,
    on_message: MessageHandler,
    token: CancellationToken,
}

impl DeliveryLoop {
    async fn run(self) {
        info!(stream = %self.stream, consumer = %self.consumer, "delivery loop started");

        let claim_every = self.config.claim_interval();
        let claim_enabled = self.config.claim_enabled && !claim_every.is_zero();
        let period = if claim_enabled {
            claim_every
        } else {
            Duration::from_secs(3600)
        };
        let mut claim_tick = interval_at(Instant::now() + period, period);
        claim_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut read = self.read_next();

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = claim_tick.tick(), if claim_enabled => self.reclaim().await,
                entries = &mut read => {
                    read = self.read_next();
                    match entries {
                        Ok(entries) => {
                            for entry in entries {
                                self.process(entry).await;
                            }
                        }
                        Err(e) => {
                            warn!(stream = %self.stream, error = %e, "stream read failed");
                            tokio::select! {
                                _ = self.token.cancelled() => break,
                                _ = sleep(READ_RETRY_DELAY) => {}
                            }
                        }
                    }
                }
            }
        }

        info!(stream = %self.stream, consumer = %self.consumer, "delivery loop stopped");
    }

    fn read_next(&self) -> BoxFuture<'_, QueueResult<Vec<StreamEntry>>> {
        self.reader.read_group(
            &self.stream,
            &self.group,
            &self.consumer,
            1,
            self.config.block_timeout(),
        )
    }

    /// Scan the pending list and take over entries idle past the processing timeout.
    async fn reclaim(&self) {
        let min_idle = self.config.processing_timeout();
        let pending = match self
            .client
            .pending_idle(&self.stream, &self.group, min_idle, self.config.max_claim_batch)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                warn!(stream = %self.stream, error = %e, "pending scan failed");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        let mut claimable = Vec::with_capacity(pending.len());
        for entry in pending {
            match self.config.max_deliveries {
                Some(max) if entry.times_delivered >= max => {
                    error!(
                        stream = %self.stream,
                        id = %entry.id,
                        deliveries = entry.times_delivered,
                        "dropping message after too many deliveries"
                    );
                    self.ack(&entry.id).await;
                }
                _ => claimable.push(entry.id),
            }
        }
        if claimable.is_empty() {
            return;
        }

        let claimed = match self
            .client
            .claim(&self.stream, &self.group, &self.consumer, min_idle, &claimable)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(stream = %self.stream, error = %e, "claim failed");
                return;
            }
        };

        if !claimed.is_empty() {
            info!(
                stream = %self.stream,
                consumer = %self.consumer,
                count = claimed.len(),
                "reclaimed stalled messages"
            );
        }
        for entry in claimed {
            if self.token.is_cancelled() {
                break;
            }
            self.process(entry).await;
        }
    }

    async fn process(&self, entry: StreamEntry) {
        let Some(raw) = entry.payload.as_deref() else {
            warn!(stream = %self.stream, id = %entry.id, "stream entry has no payload field");
            self.ack(&entry.id).await;
            return;
        };

        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(stream = %self.stream, id = %entry.id, error = %e, "dropping undecodable message");
                self.ack(&entry.id).await;
                return;
            }
        };

        let on_message = Arc::clone(&self.on_message);
        let delivery = AssertUnwindSafe(async move { on_message(envelope.data).await });
        match delivery.catch_unwind().await {
            Ok(Ok(())) => self.ack(&entry.id).await,
            Ok(Err(e)) => {
                debug!(stream = %self.stream, id = %entry.id, error = %e, "message left pending");
            }
            Err(panic) => {
                error!(
                    stream = %self.stream,
                    id = %entry.id,
                    panic = %panic_message(panic.as_ref()),
                    "message handler panicked"
                );
            }
        }
    }

    async fn ack(&self, id: &str) {
        let ids = [id.to_string()];
        if let Err(e) = self.client.ack(&self.stream, &self.group, &ids).await {
            warn!(stream = %self.stream, id = %id, error = %e, "ack failed");
        }
    }
}
