//! Job definition and handler traits.

use crate::error::{BoxError, QueueError, QueueResult};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Trait implemented by every payload type carried by a [`Queue`](crate::Queue).
///
/// The topic a job travels on is tied to its type. By default it is the
/// fully-qualified type name; override [`Job::topic`] (or use the [`job!`](crate::job)
/// macro) to pin a stable name that survives module moves.
///
/// ```rust
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// typedq::job!(SendEmail, "emails.send");
///
/// use typedq::Job;
/// assert_eq!(SendEmail::topic(), "emails.send");
/// ```
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Topic name for this job type, before any namespace prefix.
    fn topic() -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }
}

/// Implement [`Job`] for a type, optionally with an explicit topic name.
#[macro_export]
macro_rules! job {
    ($job:ty) => {
        impl $crate::Job for $job {}
    };
    ($job:ty, $topic:expr) => {
        impl $crate::Job for $job {
            fn topic() -> ::std::borrow::Cow<'static, str> {
                ::std::borrow::Cow::Borrowed($topic)
            }
        }
    };
}

/// Check that `T` declares a usable topic name and return it.
pub(crate) fn validate_job_type<T: Job>() -> QueueResult<Cow<'static, str>> {
    let topic = T::topic();
    let type_name = std::any::type_name::<T>();

    if topic.trim().is_empty() {
        return Err(QueueError::InvalidJobType {
            type_name,
            reason: "topic name is empty".to_string(),
        });
    }

    if topic.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(QueueError::InvalidJobType {
            type_name,
            reason: format!("topic name '{topic}' contains whitespace or control characters"),
        });
    }

    Ok(topic)
}

/// Business logic invoked for every delivered job.
///
/// Any `Fn(CancellationToken, Arc<T>) -> impl Future<Output = Result<(), BoxError>>`
/// closure is a handler. The same `Arc<T>` is passed to every retry of one
/// delivery.
#[async_trait]
pub trait JobHandler<T: Job>: Send + Sync + 'static {
    /// Process one job. Returning an error schedules a retry.
    async fn handle(&self, ctx: CancellationToken, job: Arc<T>) -> Result<(), BoxError>;

    /// Name reported to the error counter.
    fn name(&self) -> Cow<'static, str> {
        Cow::Borrowed(std::any::type_name::<Self>())
    }
}

#[async_trait]
impl<T, F, Fut> JobHandler<T> for F
where
    T: Job,
    F: Fn(CancellationToken, Arc<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn handle(&self, ctx: CancellationToken, job: Arc<T>) -> Result<(), BoxError> {
        (self)(ctx, job).await
    }
}
