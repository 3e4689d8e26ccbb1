//! The typed queue engine.
//!
//! [`Queue`] ties a job type to a [`Broker`]: it serializes jobs on the way in and
//! runs a bounded pool of workers that decode, retry and dead-letter them on the
//! way out.

use crate::broker::{Broker, message_handler};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobHandler, validate_job_type};
use crate::observability::{ErrorHandler, PanicHandler};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

pub(crate) mod worker;

pub use worker::Outcome;
use worker::{Processor, Worker};

/// Prefix of dead-letter topics.
pub const DLQ_PREFIX: &str = "dlq:";

/// A strongly-typed job queue on top of a [`Broker`].
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use serde::{Deserialize, Serialize};
/// use tokio_util::sync::CancellationToken;
/// use typedq::prelude::*;
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// typedq::job!(SendEmail, "emails");
///
/// # async fn run() -> QueueResult<()> {
/// let queue = Queue::<SendEmail>::new(Arc::new(MemoryBroker::new()), QueueConfig::default())?;
/// let token = CancellationToken::new();
///
/// queue
///     .produce(&token, &SendEmail { to: "user@example.com".to_string() })
///     .await?;
///
/// let result = queue
///     .consume(token.clone(), |_ctx: CancellationToken, job: Arc<SendEmail>| async move {
///         println!("sending to {}", job.to);
///         Ok::<(), BoxError>(())
///     })
///     .await;
/// assert!(result.is_err_and(|e| e.is_shutdown()));
/// # Ok(())
/// # }
/// ```
pub struct Queue<T: Job> {
    broker: Arc<dyn Broker>,
    topic: String,
    dlq_topic: String,
    config: QueueConfig,
    error_handler: Arc<dyn ErrorHandler>,
    panic_handler: Arc<dyn PanicHandler>,
    closed: Mutex<bool>,
    shutdown: CancellationToken,
    _job: PhantomData<fn() -> T>,
}

impl<T: Job> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("topic", &self.topic)
            .field("dlq_topic", &self.dlq_topic)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: Job> Queue<T> {
    /// Create a queue for `T` on top of `broker`.
    ///
    /// Fails when `T` declares an unusable topic name or when no error/panic
    /// handler can be built from the configuration.
    pub fn new(broker: Arc<dyn Broker>, config: QueueConfig) -> QueueResult<Self> {
        let name = validate_job_type::<T>()?;
        let error_handler = config.resolve_error_handler()?;
        let panic_handler = config.resolve_panic_handler()?;

        let topic = config.topic_for(&name);
        let dlq_topic = format!("{DLQ_PREFIX}{topic}");

        tracing::debug!(topic = %topic, concurrency = config.concurrency, "queue created");

        Ok(Self {
            broker,
            topic,
            dlq_topic,
            config,
            error_handler,
            panic_handler,
            closed: Mutex::new(false),
            shutdown: CancellationToken::new(),
            _job: PhantomData,
        })
    }

    /// Topic this queue produces to and consumes from.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Topic receiving jobs that exhausted their retries.
    pub fn dlq_topic(&self) -> &str {
        &self.dlq_topic
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub async fn is_closed(&self) -> bool {
        *self.closed.lock().await
    }

    /// Serialize `job` and hand it to the broker.
    pub async fn produce(&self, ctx: &CancellationToken, job: &T) -> QueueResult<()> {
        if self.is_closed().await {
            return Err(QueueError::Closed);
        }

        let payload = serde_json::to_vec(job)?;
        self.broker.produce(ctx, &self.topic, payload).await
    }

    /// Process jobs with `handler` until `ctx` is cancelled or the queue is closed.
    ///
    /// Returns [`QueueError::Cancelled`] or [`QueueError::Closed`] once deliveries
    /// have stopped and every in-flight job has finished. Business errors never
    /// surface here; they go to the configured handlers and counters.
    pub async fn consume<H>(&self, ctx: CancellationToken, handler: H) -> QueueResult<()>
    where
        H: JobHandler<T>,
    {
        if self.is_closed().await {
            return Err(QueueError::Closed);
        }

        let handler_name = handler.name().into_owned();
        let token = ctx.child_token();
        let processor = Arc::new(Processor {
            topic: self.topic.clone(),
            dlq_topic: self.dlq_topic.clone(),
            handler: Arc::new(handler),
            handler_name,
            broker: Arc::clone(&self.broker),
            config: self.config.clone(),
            error_handler: Arc::clone(&self.error_handler),
            panic_handler: Arc::clone(&self.panic_handler),
            token: token.clone(),
        });

        let (sender, receiver) = mpsc::channel::<Vec<u8>>(self.config.buffer_capacity());
        let deliveries = Arc::new(Mutex::new(receiver));

        let workers: Vec<_> = (0..self.config.concurrency.max(1))
            .map(|id| {
                let worker = Worker::new(id, Arc::clone(&processor), Arc::clone(&deliveries));
                tokio::spawn(worker.run())
            })
            .collect();

        let forward_token = token.clone();
        let on_message = message_handler(move |payload| {
            let sender = sender.clone();
            let token = forward_token.clone();
            async move {
                tokio::select! {
                    _ = token.cancelled() => Err(QueueError::Cancelled),
                    sent = sender.send(payload) => sent.map_err(|_| QueueError::Closed),
                }
            }
        });

        let result = match self
            .broker
            .consume(token.clone(), &self.topic, on_message)
            .await
        {
            Ok(()) => {
                tracing::info!(
                    topic = %self.topic,
                    workers = workers.len(),
                    "consuming"
                );
                tokio::select! {
                    _ = ctx.cancelled() => Err(QueueError::Cancelled),
                    _ = self.shutdown.cancelled() => Err(QueueError::Closed),
                }
            }
            Err(e) => Err(e),
        };

        token.cancel();
        for handle in workers {
            if let Err(e) = handle.await {
                tracing::warn!(topic = %self.topic, error = %e, "worker ended abnormally");
            }
        }

        tracing::info!(topic = %self.topic, "consumer stopped");
        result
    }

    /// Close the queue and its broker. Idempotent.
    pub async fn close(&self) -> QueueResult<()> {
        {
            let mut closed = self.closed.lock().await;
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        self.shutdown.cancel();
        self.broker.close().await
    }
}
