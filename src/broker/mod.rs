//! Transport backends for typedq.
//!
//! A [`Broker`] moves opaque byte payloads between producers and consumers of a
//! topic. typedq ships two of them:
//! - **Memory**: in-process, lightweight, perfect for tests and single-process applications
//! - **Redis**: durable Redis Streams with consumer groups and stalled-message reclamation
//!
//! # Examples
//!
//! ```rust,no_run
//! use typedq::broker::{Broker, MemoryBroker};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> typedq::QueueResult<()> {
//! let broker = MemoryBroker::new();
//! let token = CancellationToken::new();
//! broker.produce(&token, "greetings", b"hello".to_vec()).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::QueueResult;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub mod memory;
pub use memory::MemoryBroker;

#[cfg(feature = "redis-broker")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
pub mod redis;

#[cfg(feature = "redis-broker")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
pub use self::redis::RedisBroker;

/// Callback invoked by a broker for every delivered payload.
///
/// For acknowledging brokers an `Err` leaves the message unacknowledged.
pub type MessageHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, QueueResult<()>> + Send + Sync>;

/// Wrap an async closure into a [`MessageHandler`].
pub fn message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = QueueResult<()>> + Send + 'static,
{
    Arc::new(move |payload| Box::pin(f(payload)))
}

/// Trait that all transport backends must implement
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload to a topic.
    ///
    /// Blocks until the transport accepts the payload or `ctx` is cancelled.
    async fn produce(&self, ctx: &CancellationToken, topic: &str, payload: Vec<u8>)
    -> QueueResult<()>;

    /// Register a delivery loop for `topic`.
    ///
    /// Returns as soon as the loop is running; the loop stops when `ctx` is
    /// cancelled or the broker is closed.
    async fn consume(
        &self,
        ctx: CancellationToken,
        topic: &str,
        on_message: MessageHandler,
    ) -> QueueResult<()>;

    /// Stop every delivery loop and release transport resources. Idempotent.
    async fn close(&self) -> QueueResult<()>;
}

/// Human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
