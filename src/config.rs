//! Configuration types for typedq.
//!
//! This module contains the queue engine configuration, the Redis broker
//! settings and the logging setup used by applications embedding the queue.

use crate::backoff::{BackoffStrategy, ExponentialBackoff, FixedBackoff};
use crate::error::{QueueError, QueueResult};
use crate::observability::{Counter, ErrorHandler, Logger, NoopCounter, PanicHandler, TracingLogger};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Configuration of a [`Queue`](crate::Queue).
///
/// Built once with the `with_*` methods and handed to `Queue::new`; the queue
/// never mutates it afterwards.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use typedq::backoff::FixedBackoff;
/// use typedq::config::QueueConfig;
///
/// let config = QueueConfig::default()
///     .with_concurrency(4)
///     .with_max_retries(5)
///     .with_backoff(FixedBackoff::new(Duration::from_millis(500)))
///     .with_topic_prefix("billing")
///     .with_dlq(true);
/// assert_eq!(config.concurrency, 4);
/// ```
#[derive(Clone)]
pub struct QueueConfig {
    /// Number of worker tasks draining the delivery channel (at least 1)
    pub concurrency: usize,

    /// Number of retries after the first failed attempt
    pub max_retries: u32,

    /// Delay policy between retries
    pub backoff: Arc<dyn BackoffStrategy>,

    /// Receives per-message errors; defaults to logging through `logger`
    pub error_handler: Option<Arc<dyn ErrorHandler>>,

    /// Receives recovered panics; defaults to logging through `logger`
    pub panic_handler: Option<Arc<dyn PanicHandler>>,

    /// Logger backing the default handlers
    pub logger: Option<Arc<dyn Logger>>,

    /// Namespace prepended to every topic
    pub topic_prefix: Option<String>,

    /// Forward exhausted jobs to `dlq:<topic>`
    pub dlq_enabled: bool,

    /// Metrics sink
    pub counter: Arc<dyn Counter>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: num_cpus::get().max(1),
            max_retries: 3,
            backoff: Arc::new(ExponentialBackoff::default()),
            error_handler: None,
            panic_handler: None,
            logger: Some(Arc::new(TracingLogger)),
            topic_prefix: None,
            dlq_enabled: false,
            counter: Arc::new(NoopCounter),
        }
    }
}

impl std::fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("concurrency", &self.concurrency)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("topic_prefix", &self.topic_prefix)
            .field("dlq_enabled", &self.dlq_enabled)
            .finish_non_exhaustive()
    }
}

impl QueueConfig {
    /// Set the worker count. Values below 1 clamp to 1.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the number of retries after the first failure.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the backoff strategy.
    pub fn with_backoff(mut self, backoff: impl BackoffStrategy + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Set a custom error handler.
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    /// Set a custom panic handler.
    pub fn with_panic_handler(mut self, handler: Arc<dyn PanicHandler>) -> Self {
        self.panic_handler = Some(handler);
        self
    }

    /// Set the logger used by the default handlers. `None` removes it.
    pub fn with_logger(mut self, logger: Option<Arc<dyn Logger>>) -> Self {
        self.logger = logger;
        self
    }

    /// Prefix every topic with `prefix`.
    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = Some(prefix.into());
        self
    }

    /// Enable or disable dead-letter routing.
    pub fn with_dlq(mut self, enabled: bool) -> Self {
        self.dlq_enabled = enabled;
        self
    }

    /// Set the metrics sink.
    pub fn with_counter(mut self, counter: Arc<dyn Counter>) -> Self {
        self.counter = counter;
        self
    }

    /// Capacity of the internal delivery channel.
    pub fn buffer_capacity(&self) -> usize {
        self.concurrency.max(1) * 10
    }

    /// Build the full topic name for a job topic.
    pub fn topic_for(&self, name: &str) -> String {
        match self.topic_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}:{name}"),
            _ => name.to_string(),
        }
    }

    /// Small pool with short fixed retries, for local development.
    pub fn development() -> Self {
        Self::default()
            .with_concurrency(2)
            .with_backoff(FixedBackoff::new(Duration::from_millis(500)))
            .with_dlq(true)
    }

    /// Single worker with one quick retry, for tests.
    pub fn testing() -> Self {
        Self::default()
            .with_concurrency(1)
            .with_max_retries(1)
            .with_backoff(FixedBackoff::new(Duration::from_millis(10)))
    }

    /// Resolve the error handler, falling back to the logger.
    pub(crate) fn resolve_error_handler(&self) -> QueueResult<Arc<dyn ErrorHandler>> {
        match (&self.error_handler, &self.logger) {
            (Some(handler), _) => Ok(Arc::clone(handler)),
            (None, Some(logger)) => Ok(Arc::new(
                crate::observability::LoggingErrorHandler::new(Arc::clone(logger)),
            )),
            (None, None) => Err(QueueError::config(
                "no error handler configured and no logger to build the default one",
            )),
        }
    }

    /// Resolve the panic handler, falling back to the logger.
    pub(crate) fn resolve_panic_handler(&self) -> QueueResult<Arc<dyn PanicHandler>> {
        match (&self.panic_handler, &self.logger) {
            (Some(handler), _) => Ok(Arc::clone(handler)),
            (None, Some(logger)) => Ok(Arc::new(
                crate::observability::LoggingPanicHandler::new(Arc::clone(logger)),
            )),
            (None, None) => Err(QueueError::config(
                "no panic handler configured and no logger to build the default one",
            )),
        }
    }
}

/// Redis Streams broker configuration.
#[cfg(feature = "redis-broker")]
#[cfg_attr(docsrs, doc(cfg(feature = "redis-broker")))]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisBrokerConfig {
    /// Redis connection string (e.g., "redis://localhost:6379")
    pub connection_string: String,

    /// Stream key pattern; `{topic}` is replaced by the topic name
    pub stream_key_format: String,

    /// Consumer group shared by every consumer of a stream
    pub consumer_group: String,

    /// Idle time after which a pending entry may be claimed (in milliseconds)
    pub processing_timeout_ms: u64,

    /// Interval between PEL scans (in milliseconds)
    pub claim_interval_ms: u64,

    /// Maximum number of entries claimed per scan
    pub max_claim_batch: usize,

    /// `XREADGROUP` block timeout (in milliseconds)
    pub block_timeout_ms: u64,

    /// Trim streams to this length on produce (None = unbounded)
    pub max_len: Option<usize>,

    /// Use `MAXLEN ~` instead of an exact trim
    pub approximate_trim: bool,

    /// Whether stalled entries are reclaimed at all
    pub claim_enabled: bool,

    /// Prefix of generated consumer names
    pub consumer_prefix: String,

    /// Drop claimed entries delivered more than this many times (None = never)
    pub max_deliveries: Option<usize>,
}

#[cfg(feature = "redis-broker")]
impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            connection_string: "redis://localhost:6379".to_string(),
            stream_key_format: "stream:{topic}".to_string(),
            consumer_group: "typedq".to_string(),
            processing_timeout_ms: 300_000, // 5 minutes
            claim_interval_ms: 30_000,
            max_claim_batch: 10,
            block_timeout_ms: 5_000,
            max_len: None,
            approximate_trim: true,
            claim_enabled: true,
            consumer_prefix: "consumer-".to_string(),
            max_deliveries: None,
        }
    }
}

#[cfg(feature = "redis-broker")]
impl RedisBrokerConfig {
    /// Create a configuration for the given connection string.
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Default::default()
        }
    }

    /// Set the stream key pattern.
    pub fn with_stream_key_format(mut self, format: impl Into<String>) -> Self {
        self.stream_key_format = format.into();
        self
    }

    /// Set the consumer group name.
    pub fn with_consumer_group(mut self, group: impl Into<String>) -> Self {
        self.consumer_group = group.into();
        self
    }

    /// Set the idle time before a pending entry is reclaimed.
    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the interval between PEL scans.
    pub fn with_claim_interval(mut self, interval: Duration) -> Self {
        self.claim_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the maximum claim batch.
    pub fn with_max_claim_batch(mut self, batch: usize) -> Self {
        self.max_claim_batch = batch;
        self
    }

    /// Set the blocking read timeout.
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Trim streams on produce.
    pub fn with_max_len(mut self, max_len: usize, approximate: bool) -> Self {
        self.max_len = Some(max_len);
        self.approximate_trim = approximate;
        self
    }

    /// Enable or disable reclamation.
    pub fn with_claim(mut self, enabled: bool) -> Self {
        self.claim_enabled = enabled;
        self
    }

    /// Set the consumer name prefix.
    pub fn with_consumer_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.consumer_prefix = prefix.into();
        self
    }

    /// Bound the number of deliveries of a reclaimed entry.
    pub fn with_max_deliveries(mut self, max: usize) -> Self {
        self.max_deliveries = Some(max);
        self
    }

    /// Stream key for a topic.
    pub fn stream_key(&self, topic: &str) -> String {
        self.stream_key_format.replace("{topic}", topic)
    }

    pub fn processing_timeout(&self) -> Duration {
        self.processing_timeout_ms.millis()
    }

    pub fn claim_interval(&self) -> Duration {
        self.claim_interval_ms.millis()
    }

    pub fn block_timeout(&self) -> Duration {
        self.block_timeout_ms.millis()
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.stream_key_format.contains("{topic}") {
            errors.push("Stream key format must contain {topic}".to_string());
        }

        if self.consumer_group.is_empty() {
            errors.push("Consumer group must not be empty".to_string());
        }

        if self.claim_enabled {
            if self.claim_interval_ms == 0 {
                errors.push("Claim interval must be greater than 0".to_string());
            }

            if self.max_claim_batch == 0 {
                errors.push("Claim batch size must be greater than 0".to_string());
            }
        }

        if self.max_len == Some(0) {
            errors.push("Max stream length must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter
    pub level: LogLevel,

    /// Enable structured JSON logging
    pub json_format: bool,

    /// Enable colored output (ignored if json_format is true)
    pub colored: bool,

    /// Include target module in logs
    pub include_targets: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            json_format: false,
            colored: true,
            include_targets: false,
        }
    }
}

impl LoggingConfig {
    /// Install a global `tracing` subscriber. `RUST_LOG` overrides `level`.
    ///
    /// Returns an error if a global subscriber is already set.
    pub fn init(&self) -> QueueResult<()> {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(tracing::Level::from(self.level).as_str()));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(self.include_targets);

        let result = if self.json_format {
            builder.json().try_init()
        } else {
            builder.with_ansi(self.colored).try_init()
        };

        result.map_err(|e| QueueError::config(format!("failed to install subscriber: {e}")))
    }
}

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
    /// Critical level (reported as error with a `critical` marker)
    Critical,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error | LogLevel::Critical => tracing::Level::ERROR,
        }
    }
}

/// Helper trait for converting durations in configuration.
pub trait DurationExt {
    /// Convert seconds to Duration
    fn secs(self) -> Duration;
    /// Convert milliseconds to Duration
    fn millis(self) -> Duration;
}

impl DurationExt for u64 {
    fn secs(self) -> Duration {
        Duration::from_secs(self)
    }

    fn millis(self) -> Duration {
        Duration::from_millis(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = QueueConfig::default();
        assert!(config.concurrency > 0);
        assert_eq!(config.max_retries, 3);
        assert!(!config.dlq_enabled);
        assert!(config.topic_prefix.is_none());
        assert_eq!(config.backoff.delay(1), Duration::from_secs(2));
    }

    #[test]
    fn test_concurrency_clamps_to_one() {
        let config = QueueConfig::default().with_concurrency(0);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.buffer_capacity(), 10);

        let config = QueueConfig::default().with_concurrency(3);
        assert_eq!(config.buffer_capacity(), 30);
    }

    #[test]
    fn test_topic_prefix() {
        let config = QueueConfig::default();
        assert_eq!(config.topic_for("orders"), "orders");

        let config = QueueConfig::default().with_topic_prefix("");
        assert_eq!(config.topic_for("orders"), "orders");

        let config = QueueConfig::default().with_topic_prefix("billing");
        assert_eq!(config.topic_for("orders"), "billing:orders");
    }

    #[test]
    fn test_presets() {
        let dev = QueueConfig::development();
        assert_eq!(dev.concurrency, 2);
        assert!(dev.dlq_enabled);

        let testing = QueueConfig::testing();
        assert_eq!(testing.concurrency, 1);
        assert_eq!(testing.max_retries, 1);
        assert_eq!(testing.backoff.delay(5), Duration::from_millis(10));
    }

    #[test]
    fn test_handlers_require_logger() {
        let config = QueueConfig::default().with_logger(None);
        assert!(matches!(
            config.resolve_error_handler(),
            Err(QueueError::Config { .. })
        ));
        assert!(matches!(
            config.resolve_panic_handler(),
            Err(QueueError::Config { .. })
        ));

        let config = QueueConfig::default();
        assert!(config.resolve_error_handler().is_ok());
        assert!(config.resolve_panic_handler().is_ok());
    }

    #[cfg(feature = "redis-broker")]
    #[test]
    fn test_redis_config() {
        let config = RedisBrokerConfig::new("redis://example:6379")
            .with_consumer_group("mailers")
            .with_processing_timeout(Duration::from_secs(10))
            .with_max_len(1000, false)
            .with_claim(false);

        assert_eq!(config.connection_string, "redis://example:6379");
        assert_eq!(config.stream_key("orders"), "stream:orders");
        assert_eq!(config.consumer_group, "mailers");
        assert_eq!(config.processing_timeout(), Duration::from_secs(10));
        assert_eq!(config.max_len, Some(1000));
        assert!(!config.approximate_trim);
        assert!(!config.claim_enabled);
        assert!(config.validate().is_ok());
    }

    #[cfg(feature = "redis-broker")]
    #[test]
    fn test_redis_config_validation() {
        let mut config = RedisBrokerConfig::default();
        assert!(config.validate().is_ok());

        config.stream_key_format = "stream".to_string();
        config.max_claim_batch = 0;
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().any(|e| e.contains("{topic}")));
        assert!(errors.iter().any(|e| e.contains("batch")));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(tracing::Level::from(LogLevel::Debug), tracing::Level::DEBUG);
        assert_eq!(tracing::Level::from(LogLevel::Critical), tracing::Level::ERROR);
    }

    #[test]
    fn test_duration_ext() {
        assert_eq!(5u64.secs(), Duration::from_secs(5));
        assert_eq!(1500u64.millis(), Duration::from_millis(1500));
    }
}
