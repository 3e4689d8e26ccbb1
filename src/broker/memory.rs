//! In-memory broker implementation for typedq.
//!
//! Every topic owns a bounded channel created on first use and shared by all
//! producers and consumers of that topic. Nothing survives a restart, which
//! makes this broker a good fit for tests and single-process applications.
//!
//! Several `consume` calls on the same topic compete for messages: each payload
//! goes to whichever delivery loop receives it first.
//!
//! A delivery loop runs at most [`MAX_IN_FLIGHT`] callbacks at once and stops
//! reading its topic while they are all busy, so a slow consumer makes
//! `produce` block instead of buffering without limit.

use super::{Broker, MessageHandler, panic_message};
use crate::error::{QueueError, QueueResult};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

/// Capacity of each topic channel.
pub const TOPIC_CAPACITY: usize = 100;

/// Callbacks a single delivery loop may run concurrently.
pub const MAX_IN_FLIGHT: usize = TOPIC_CAPACITY;

#[derive(Debug)]
struct TopicChannel {
    sender: mpsc::Sender<Vec<u8>>,
    receiver: Arc<Mutex<mpsc::Receiver<Vec<u8>>>>,
}

impl TopicChannel {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel(TOPIC_CAPACITY);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    topics: HashMap<String, TopicChannel>,
    consumers: Vec<CancellationToken>,
    closed: bool,
}

impl BrokerState {
    fn topic(&mut self, topic: &str) -> &TopicChannel {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(TopicChannel::new)
    }
}

/// In-memory broker backend implementation
#[derive(Debug)]
pub struct MemoryBroker {
    state: RwLock<BrokerState>,
    shutdown: CancellationToken,
}

impl MemoryBroker {
    /// Create a new, empty in-memory broker
    pub fn new() -> Self {
        Self {
            state: RwLock::new(BrokerState::default()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Number of payloads waiting in a topic channel
    pub async fn pending(&self, topic: &str) -> usize {
        let state = self.state.read().await;
        state
            .topics
            .get(topic)
            .map(|channel| channel.sender.max_capacity() - channel.sender.capacity())
            .unwrap_or(0)
    }

    /// Whether `close` has been called
    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn produce(
        &self,
        ctx: &CancellationToken,
        topic: &str,
        payload: Vec<u8>,
    ) -> QueueResult<()> {
        let sender = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.topic(topic).sender.clone()
        };

        tokio::select! {
            _ = ctx.cancelled() => Err(QueueError::Cancelled),
            _ = self.shutdown.cancelled() => Err(QueueError::Closed),
            sent = sender.send(payload) => sent.map_err(|_| QueueError::Closed),
        }
    }

    async fn consume(
        &self,
        ctx: CancellationToken,
        topic: &str,
        on_message: MessageHandler,
    ) -> QueueResult<()> {
        let token = ctx.child_token();
        let receiver = {
            let mut state = self.state.write().await;
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.consumers.retain(|consumer| !consumer.is_cancelled());
            state.consumers.push(token.clone());
            Arc::clone(&state.topic(topic).receiver)
        };

        let topic = topic.to_string();
        tokio::spawn(async move {
            tracing::debug!(topic = %topic, "memory delivery loop started");

            let in_flight = Arc::new(Semaphore::new(MAX_IN_FLIGHT));

            loop {
                let permit = tokio::select! {
                    _ = token.cancelled() => break,
                    permit = Arc::clone(&in_flight).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let payload = tokio::select! {
                    _ = token.cancelled() => break,
                    payload = async { receiver.lock().await.recv().await } => payload,
                };

                let Some(payload) = payload else {
                    break;
                };

                let on_message = Arc::clone(&on_message);
                let topic = topic.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let delivery = AssertUnwindSafe(async move { on_message(payload).await });
                    match delivery.catch_unwind().await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => {
                            tracing::debug!(topic = %topic, error = %e, "message handler returned an error");
                        }
                        Err(panic) => {
                            tracing::error!(
                                topic = %topic,
                                panic = %panic_message(panic.as_ref()),
                                "message handler panicked"
                            );
                        }
                    }
                });
            }

            tracing::debug!(topic = %topic, "memory delivery loop stopped");
        });

        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        let mut state = self.state.write().await;
        if state.closed {
            return Ok(());
        }

        state.closed = true;
        for consumer in state.consumers.drain(..) {
            consumer.cancel();
        }
        let topics = state.topics.len();
        state.topics.clear();
        self.shutdown.cancel();

        tracing::debug!(topics, "memory broker closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::message_handler;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};
    use tokio_test::{assert_err, assert_ok};

    fn collecting_handler() -> (MessageHandler, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = message_handler(move |payload| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(payload);
                Ok(())
            }
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_produce_consume() {
        let broker = MemoryBroker::new();
        let ctx = CancellationToken::new();
        let (handler, mut rx) = collecting_handler();

        assert_ok!(broker.consume(ctx.clone(), "topic-a", handler).await);
        assert_ok!(broker.produce(&ctx, "topic-a", b"one".to_vec()).await);
        assert_ok!(broker.produce(&ctx, "topic-a", b"two".to_vec()).await);

        let mut received = vec![
            timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap(),
            timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap(),
        ];
        received.sort();
        assert_eq!(received, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_messages_buffer_until_consumed() {
        let broker = MemoryBroker::new();
        let ctx = CancellationToken::new();

        broker.produce(&ctx, "later", b"x".to_vec()).await.unwrap();
        assert_eq!(broker.pending("later").await, 1);

        let (handler, mut rx) = collecting_handler();
        broker.consume(ctx.clone(), "later", handler).await.unwrap();
        let payload = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(payload, Some(b"x".to_vec()));
        assert_eq!(broker.pending("later").await, 0);
    }

    #[tokio::test]
    async fn test_produce_blocks_when_full_and_honors_cancellation() {
        let broker = MemoryBroker::new();
        let ctx = CancellationToken::new();

        for i in 0..TOPIC_CAPACITY {
            broker.produce(&ctx, "full", vec![i as u8]).await.unwrap();
        }

        let blocked = CancellationToken::new();
        let canceller = blocked.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = broker.produce(&blocked, "full", vec![0]).await;
        assert!(matches!(result, Err(QueueError::Cancelled)));
        assert_eq!(broker.pending("full").await, TOPIC_CAPACITY);
    }

    #[tokio::test]
    async fn test_competing_consumers_share_messages() {
        let broker = MemoryBroker::new();
        let ctx = CancellationToken::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let delivered = Arc::clone(&delivered);
            let handler = message_handler(move |_payload| {
                let delivered = Arc::clone(&delivered);
                async move {
                    delivered.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
            broker.consume(ctx.clone(), "shared", handler).await.unwrap();
        }

        for i in 0..20u8 {
            broker.produce(&ctx, "shared", vec![i]).await.unwrap();
        }

        sleep(Duration::from_millis(200)).await;
        assert_eq!(delivered.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_loop() {
        let broker = MemoryBroker::new();
        let ctx = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handler = message_handler(move |payload: Vec<u8>| {
            let tx = tx.clone();
            async move {
                if payload == b"boom" {
                    panic!("handler exploded");
                }
                let _ = tx.send(payload);
                Ok(())
            }
        });

        broker.consume(ctx.clone(), "panics", handler).await.unwrap();
        broker.produce(&ctx, "panics", b"boom".to_vec()).await.unwrap();
        broker.produce(&ctx, "panics", b"fine".to_vec()).await.unwrap();

        let payload = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(payload, Some(b"fine".to_vec()));
    }

    #[tokio::test]
    async fn test_cancelled_consumer_stops_receiving() {
        let broker = MemoryBroker::new();
        let ctx = CancellationToken::new();
        let consumer_ctx = CancellationToken::new();
        let (handler, mut rx) = collecting_handler();

        broker.consume(consumer_ctx.clone(), "stop", handler).await.unwrap();
        consumer_ctx.cancel();
        sleep(Duration::from_millis(20)).await;

        broker.produce(&ctx, "stop", b"late".to_vec()).await.unwrap();
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
        assert_eq!(broker.pending("stop").await, 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let broker = MemoryBroker::new();
        let ctx = CancellationToken::new();
        let (handler, _rx) = collecting_handler();

        broker.consume(ctx.clone(), "t", handler.clone()).await.unwrap();
        assert_ok!(broker.close().await);
        assert_ok!(broker.close().await);
        assert!(broker.is_closed().await);

        let produced = broker.produce(&ctx, "t", b"x".to_vec()).await;
        assert!(matches!(produced, Err(QueueError::Closed)));
        assert_err!(broker.consume(ctx, "t", handler).await);
    }

    #[tokio::test]
    async fn test_stalled_consumer_blocks_producer() {
        let broker = MemoryBroker::new();
        let ctx = CancellationToken::new();
        let started = Arc::new(AtomicUsize::new(0));

        let counted = Arc::clone(&started);
        let handler = message_handler(move |_payload| {
            let started = Arc::clone(&counted);
            async move {
                started.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
                Ok(())
            }
        });
        broker.consume(ctx.clone(), "stalled", handler).await.unwrap();

        let mut accepted = 0;
        for i in 0..(TOPIC_CAPACITY + MAX_IN_FLIGHT) * 3 {
            let produce = broker.produce(&ctx, "stalled", vec![i as u8]);
            match timeout(Duration::from_millis(200), produce).await {
                Ok(result) => {
                    result.unwrap();
                    accepted += 1;
                }
                Err(_) => break,
            }
        }

        assert_eq!(accepted, TOPIC_CAPACITY + MAX_IN_FLIGHT);
        assert_eq!(started.load(Ordering::SeqCst), MAX_IN_FLIGHT);
        assert_eq!(broker.pending("stalled").await, TOPIC_CAPACITY);
        ctx.cancel();
    }

    #[tokio::test]
    async fn test_close_unblocks_waiting_producer() {
        let broker = Arc::new(MemoryBroker::new());
        let ctx = CancellationToken::new();

        for i in 0..TOPIC_CAPACITY {
            broker.produce(&ctx, "jam", vec![i as u8]).await.unwrap();
        }

        let closer = Arc::clone(&broker);
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            closer.close().await.unwrap();
        });

        let result = timeout(Duration::from_secs(1), broker.produce(&ctx, "jam", vec![0]))
            .await
            .unwrap();
        assert!(matches!(result, Err(QueueError::Closed)));
    }
}
