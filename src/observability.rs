//! Observability hooks used by the queue engine.
//!
//! The engine reports every per-message failure through an [`ErrorHandler`]
//! or [`PanicHandler`] and records outcomes on a [`Counter`]. The default
//! handlers write through a [`Logger`], which by default forwards to `tracing`.

use crate::config::LogLevel;
use crate::error::QueueError;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstract structured logger.
pub trait Logger: Debug + Send + Sync {
    /// Emit `message` at `level` with the given key/value fields.
    fn log(&self, level: LogLevel, message: &str, fields: &[(&str, &str)]);

    fn trace(&self, message: &str, fields: &[(&str, &str)]) {
        self.log(LogLevel::Trace, message, fields);
    }

    fn debug(&self, message: &str, fields: &[(&str, &str)]) {
        self.log(LogLevel::Debug, message, fields);
    }

    fn info(&self, message: &str, fields: &[(&str, &str)]) {
        self.log(LogLevel::Info, message, fields);
    }

    fn warn(&self, message: &str, fields: &[(&str, &str)]) {
        self.log(LogLevel::Warn, message, fields);
    }

    fn error(&self, message: &str, fields: &[(&str, &str)]) {
        self.log(LogLevel::Error, message, fields);
    }

    fn critical(&self, message: &str, fields: &[(&str, &str)]) {
        self.log(LogLevel::Critical, message, fields);
    }
}

/// [`Logger`] backed by the `tracing` macros.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

fn render_fields(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(" ")
}

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, message: &str, fields: &[(&str, &str)]) {
        let fields = render_fields(fields);
        match level {
            LogLevel::Trace => tracing::trace!(%fields, "{}", message),
            LogLevel::Debug => tracing::debug!(%fields, "{}", message),
            LogLevel::Info => tracing::info!(%fields, "{}", message),
            LogLevel::Warn => tracing::warn!(%fields, "{}", message),
            LogLevel::Error => tracing::error!(%fields, "{}", message),
            LogLevel::Critical => tracing::error!(critical = true, %fields, "{}", message),
        }
    }
}

/// Receives per-message errors (decode failures, handler failures, DLQ failures).
pub trait ErrorHandler: Debug + Send + Sync {
    fn on_error(&self, topic: &str, error: &QueueError);
}

/// Receives panics recovered while processing a message.
pub trait PanicHandler: Debug + Send + Sync {
    fn on_panic(&self, topic: &str, message: &str, backtrace: &Backtrace);
}

/// Default [`ErrorHandler`]: logs at error level.
#[derive(Debug, Clone)]
pub struct LoggingErrorHandler {
    logger: Arc<dyn Logger>,
}

impl LoggingErrorHandler {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self { logger }
    }
}

impl ErrorHandler for LoggingErrorHandler {
    fn on_error(&self, topic: &str, error: &QueueError) {
        let error = error.to_string();
        self.logger.error(
            "job processing failed",
            &[("topic", topic), ("error", error.as_str())],
        );
    }
}

/// Default [`PanicHandler`]: logs at critical level with the backtrace.
#[derive(Debug, Clone)]
pub struct LoggingPanicHandler {
    logger: Arc<dyn Logger>,
}

impl LoggingPanicHandler {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self { logger }
    }
}

impl PanicHandler for LoggingPanicHandler {
    fn on_panic(&self, topic: &str, message: &str, backtrace: &Backtrace) {
        let backtrace = backtrace.to_string();
        self.logger.critical(
            "job handler panicked",
            &[
                ("topic", topic),
                ("panic", message),
                ("backtrace", backtrace.as_str()),
            ],
        );
    }
}

/// Final status of a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessStatus {
    /// Handler succeeded
    Success,
    /// Message was discarded (decode failure or retries exhausted without DLQ)
    Failed,
    /// Message was forwarded to the dead-letter topic
    DeadLettered,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Success => "success",
            ProcessStatus::Failed => "failed",
            ProcessStatus::DeadLettered => "dlq",
        }
    }
}

/// Metrics sink. Implementations must be safe for concurrent use.
pub trait Counter: Debug + Send + Sync {
    fn inc_processed(&self, topic: &str, status: ProcessStatus);
    fn inc_error(&self, topic: &str, handler: &str);
    fn inc_retry(&self, topic: &str);
    fn inc_dlq(&self, topic: &str);
    fn observe_processing_time(&self, topic: &str, duration: Duration);
}

/// Counter that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCounter;

impl Counter for NoopCounter {
    fn inc_processed(&self, _topic: &str, _status: ProcessStatus) {}
    fn inc_error(&self, _topic: &str, _handler: &str) {}
    fn inc_retry(&self, _topic: &str) {}
    fn inc_dlq(&self, _topic: &str) {}
    fn observe_processing_time(&self, _topic: &str, _duration: Duration) {}
}

/// Point-in-time copy of an [`InMemoryCounter`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub processed: HashMap<(String, ProcessStatus), u64>,
    pub errors: HashMap<(String, String), u64>,
    pub retries: HashMap<String, u64>,
    pub dlq: HashMap<String, u64>,
    pub observations: HashMap<String, u64>,
}

impl CounterSnapshot {
    pub fn processed(&self, topic: &str, status: ProcessStatus) -> u64 {
        self.processed
            .get(&(topic.to_string(), status))
            .copied()
            .unwrap_or(0)
    }

    /// Errors for `topic` summed over all handlers
    pub fn errors(&self, topic: &str) -> u64 {
        self.errors
            .iter()
            .filter(|((t, _), _)| t == topic)
            .map(|(_, count)| *count)
            .sum()
    }

    pub fn retries(&self, topic: &str) -> u64 {
        self.retries.get(topic).copied().unwrap_or(0)
    }

    pub fn dlq(&self, topic: &str) -> u64 {
        self.dlq.get(topic).copied().unwrap_or(0)
    }
}

/// Counter that keeps totals in memory, for embedding applications and tests.
#[derive(Debug, Default)]
pub struct InMemoryCounter {
    inner: Mutex<CounterSnapshot>,
}

impl InMemoryCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn update(&self, f: impl FnOnce(&mut CounterSnapshot)) {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }
}

impl Counter for InMemoryCounter {
    fn inc_processed(&self, topic: &str, status: ProcessStatus) {
        self.update(|s| *s.processed.entry((topic.to_string(), status)).or_default() += 1);
    }

    fn inc_error(&self, topic: &str, handler: &str) {
        self.update(|s| {
            *s.errors
                .entry((topic.to_string(), handler.to_string()))
                .or_default() += 1
        });
    }

    fn inc_retry(&self, topic: &str) {
        self.update(|s| *s.retries.entry(topic.to_string()).or_default() += 1);
    }

    fn inc_dlq(&self, topic: &str) {
        self.update(|s| *s.dlq.entry(topic.to_string()).or_default() += 1);
    }

    fn observe_processing_time(&self, topic: &str, _duration: Duration) {
        self.update(|s| *s.observations.entry(topic.to_string()).or_default() += 1);
    }
}
