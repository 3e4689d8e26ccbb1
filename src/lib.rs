//! # typedq
//!
//! Strongly-typed job queues for async Rust applications.
//!
//! ## Features
//!
//! - **Typed jobs**: every payload type owns its topic; jobs travel as JSON
//! - **Pluggable brokers**: in-memory channels or Redis Streams with consumer groups
//! - **Bounded worker pool**: backpressure from the broker down to the handlers
//! - **Retries and dead-lettering**: configurable backoff and an optional `dlq:` topic
//! - **Observability**: tracing-based logging, error/panic hooks and metric counters
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde::{Deserialize, Serialize};
//! use tokio_util::sync::CancellationToken;
//! use typedq::prelude::*;
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct ResizeImage {
//!     path: String,
//!     width: u32,
//! }
//!
//! typedq::job!(ResizeImage, "images.resize");
//!
//! #[tokio::main]
//! async fn main() -> QueueResult<()> {
//!     let broker = Arc::new(MemoryBroker::new());
//!     let queue = Queue::<ResizeImage>::new(broker, QueueConfig::default())?;
//!     let token = CancellationToken::new();
//!
//!     let job = ResizeImage { path: "cat.png".to_string(), width: 320 };
//!     queue.produce(&token, &job).await?;
//!
//!     let _ = queue
//!         .consume(token, |_ctx: CancellationToken, job: Arc<ResizeImage>| async move {
//!             println!("resizing {} to {}px", job.path, job.width);
//!             Ok::<(), BoxError>(())
//!         })
//!         .await;
//!
//!     queue.close().await
//! }
//! ```

pub mod backoff;
pub mod broker;
pub mod config;
pub mod core;
pub mod error;
pub mod job;
pub mod observability;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

pub mod prelude {
    pub use crate::backoff::{BackoffStrategy, ExponentialBackoff, FixedBackoff, NoBackoff};
    pub use crate::broker::{Broker, MemoryBroker};
    pub use crate::config::{LogLevel, LoggingConfig, QueueConfig};
    pub use crate::core::Queue;
    pub use crate::error::{BoxError, QueueError, QueueResult};
    pub use crate::job::{Job, JobHandler};
    pub use crate::observability::{Counter, ErrorHandler, Logger, PanicHandler, TracingLogger};
    pub use async_trait::async_trait;

    #[cfg(feature = "redis-broker")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
    pub use crate::broker::RedisBroker;

    #[cfg(feature = "redis-broker")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
    pub use crate::config::RedisBrokerConfig;

    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub use crate::metrics::PrometheusCounter;
}

pub use crate::config::QueueConfig;
pub use crate::core::{Outcome, Queue};
pub use crate::error::{BoxError, QueueError, QueueResult};
pub use crate::job::{Job, JobHandler};
pub use async_trait::async_trait;
