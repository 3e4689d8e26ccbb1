//! Worker implementation for typedq.
//!
//! Workers share one bounded delivery channel. Each worker takes a raw payload,
//! decodes it into the job type and drives it through the handler with retries,
//! backoff and dead-lettering. A panic inside the handler only aborts the
//! message being processed.

use crate::broker::{Broker, panic_message};
use crate::config::QueueConfig;
use crate::error::QueueError;
use crate::job::{Job, JobHandler};
use crate::observability::{ErrorHandler, PanicHandler, ProcessStatus};
use futures::FutureExt;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, mpsc};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Shared receiving end of the delivery channel.
pub(crate) type Deliveries = Arc<Mutex<mpsc::Receiver<Vec<u8>>>>;

/// How a single message ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The handler succeeded after `attempts` invocations
    Succeeded { attempts: u32 },
    /// Retries exhausted and the job was not dead-lettered
    Failed { attempts: u32 },
    /// Retries exhausted and the job was routed to the DLQ topic
    DeadLettered { attempts: u32 },
    /// The payload could not be decoded into the job type
    Discarded,
    /// The worker was already shutting down when the message arrived
    Dropped,
    /// Shutdown interrupted the backoff wait
    Aborted { attempts: u32 },
    /// The handler panicked
    Panicked,
}

/// Everything a worker needs to process a message of type `T`.
pub(crate) struct Processor<T: Job> {
    pub(crate) topic: String,
    pub(crate) dlq_topic: String,
    pub(crate) handler: Arc<dyn JobHandler<T>>,
    pub(crate) handler_name: String,
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) config: QueueConfig,
    pub(crate) error_handler: Arc<dyn ErrorHandler>,
    pub(crate) panic_handler: Arc<dyn PanicHandler>,
    pub(crate) token: CancellationToken,
}

impl<T: Job> Processor<T> {
    /// Process one payload, recovering from handler panics.
    pub(crate) async fn handle_delivery(&self, payload: Vec<u8>) -> Outcome {
        match AssertUnwindSafe(self.process(payload)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                let backtrace = Backtrace::force_capture();
                self.panic_handler.on_panic(&self.topic, &message, &backtrace);
                self.config
                    .counter
                    .inc_processed(&self.topic, ProcessStatus::Failed);
                Outcome::Panicked
            }
        }
    }

    async fn process(&self, payload: Vec<u8>) -> Outcome {
        if self.token.is_cancelled() {
            return Outcome::Dropped;
        }

        let counter = &self.config.counter;
        let job: Arc<T> = match serde_json::from_slice(&payload) {
            Ok(job) => Arc::new(job),
            Err(e) => {
                self.error_handler
                    .on_error(&self.topic, &QueueError::Serialization(e));
                counter.inc_error(&self.topic, &self.handler_name);
                counter.inc_processed(&self.topic, ProcessStatus::Failed);
                return Outcome::Discarded;
            }
        };

        let mut attempts: u32 = 0;
        loop {
            let started = Instant::now();
            let result = self
                .handler
                .handle(self.token.child_token(), Arc::clone(&job))
                .await;

            let source = match result {
                Ok(()) => {
                    counter.observe_processing_time(&self.topic, started.elapsed());
                    counter.inc_processed(&self.topic, ProcessStatus::Success);
                    return Outcome::Succeeded {
                        attempts: attempts + 1,
                    };
                }
                Err(source) => source,
            };

            let error = QueueError::Handler {
                handler: self.handler_name.clone(),
                source,
            };
            self.error_handler.on_error(&self.topic, &error);
            counter.inc_error(&self.topic, &self.handler_name);

            attempts += 1;
            if attempts > self.config.max_retries {
                return self.give_up(&job, attempts).await;
            }

            counter.inc_retry(&self.topic);
            let delay = self.config.backoff.delay(attempts);
            tracing::debug!(
                topic = %self.topic,
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                "retrying job"
            );

            tokio::select! {
                _ = self.token.cancelled() => return Outcome::Aborted { attempts },
                _ = sleep(delay) => {}
            }
        }
    }

    async fn give_up(&self, job: &T, attempts: u32) -> Outcome {
        let counter = &self.config.counter;
        if !self.config.dlq_enabled {
            counter.inc_processed(&self.topic, ProcessStatus::Failed);
            return Outcome::Failed { attempts };
        }

        let routed = match serde_json::to_vec(job) {
            Ok(payload) => self
                .broker
                .produce(&self.token, &self.dlq_topic, payload)
                .await
                .map_err(|e| self.error_handler.on_error(&self.dlq_topic, &e))
                .is_ok(),
            Err(e) => {
                self.error_handler
                    .on_error(&self.topic, &QueueError::Serialization(e));
                false
            }
        };

        if !routed {
            counter.inc_processed(&self.topic, ProcessStatus::Failed);
            return Outcome::Failed { attempts };
        }

        counter.inc_dlq(&self.topic);
        counter.inc_processed(&self.topic, ProcessStatus::DeadLettered);
        Outcome::DeadLettered { attempts }
    }
}

/// Individual worker draining the delivery channel
pub(crate) struct Worker<T: Job> {
    id: usize,
    processor: Arc<Processor<T>>,
    deliveries: Deliveries,
}

impl<T: Job> Worker<T> {
    pub(crate) fn new(id: usize, processor: Arc<Processor<T>>, deliveries: Deliveries) -> Self {
        Self {
            id,
            processor,
            deliveries,
        }
    }

    /// Run until the queue token is cancelled or the channel closes.
    pub(crate) async fn run(self) {
        let topic = &self.processor.topic;
        tracing::debug!(worker = self.id, topic = %topic, "worker started");

        loop {
            let payload = tokio::select! {
                _ = self.processor.token.cancelled() => break,
                payload = async { self.deliveries.lock().await.recv().await } => payload,
            };
            let Some(payload) = payload else {
                break;
            };

            let outcome = self.processor.handle_delivery(payload).await;
            tracing::trace!(worker = self.id, topic = %topic, ?outcome, "message processed");
        }

        tracing::debug!(worker = self.id, topic = %topic, "worker stopped");
    }
}
