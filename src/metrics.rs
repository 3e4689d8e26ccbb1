//! Prometheus implementation of the [`Counter`] sink.

use crate::observability::{Counter, ProcessStatus};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::time::Duration;

/// [`Counter`] backed by Prometheus metric vectors.
///
/// ```rust
/// use prometheus::Registry;
/// use typedq::metrics::PrometheusCounter;
///
/// let registry = Registry::new();
/// let counter = PrometheusCounter::new("typedq").unwrap();
/// counter.register(&registry).unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct PrometheusCounter {
    processed: IntCounterVec,
    errors: IntCounterVec,
    retries: IntCounterVec,
    dlq: IntCounterVec,
    processing_time: HistogramVec,
}

impl PrometheusCounter {
    /// Create the metric vectors under `namespace`.
    pub fn new(namespace: &str) -> prometheus::Result<Self> {
        Ok(Self {
            processed: IntCounterVec::new(
                Opts::new("processed_total", "Messages processed, by final status").namespace(namespace),
                &["topic", "status"],
            )?,
            errors: IntCounterVec::new(
                Opts::new("errors_total", "Handler and decode errors").namespace(namespace),
                &["topic", "handler"],
            )?,
            retries: IntCounterVec::new(
                Opts::new("retries_total", "Scheduled retries").namespace(namespace),
                &["topic"],
            )?,
            dlq: IntCounterVec::new(
                Opts::new("dlq_total", "Messages routed to the dead-letter topic").namespace(namespace),
                &["topic"],
            )?,
            processing_time: HistogramVec::new(
                HistogramOpts::new("processing_seconds", "Successful handler run time")
                    .namespace(namespace),
                &["topic"],
            )?,
        })
    }

    /// Register every metric with `registry`.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.processed.clone()))?;
        registry.register(Box::new(self.errors.clone()))?;
        registry.register(Box::new(self.retries.clone()))?;
        registry.register(Box::new(self.dlq.clone()))?;
        registry.register(Box::new(self.processing_time.clone()))?;
        Ok(())
    }
}

impl Counter for PrometheusCounter {
    fn inc_processed(&self, topic: &str, status: ProcessStatus) {
        self.processed
            .with_label_values(&[topic, status.as_str()])
            .inc();
    }

    fn inc_error(&self, topic: &str, handler: &str) {
        self.errors.with_label_values(&[topic, handler]).inc();
    }

    fn inc_retry(&self, topic: &str) {
        self.retries.with_label_values(&[topic]).inc();
    }

    fn inc_dlq(&self, topic: &str) {
        self.dlq.with_label_values(&[topic]).inc();
    }

    fn observe_processing_time(&self, topic: &str, duration: Duration) {
        self.processing_time
            .with_label_values(&[topic])
            .observe(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_are_exported() {
        let registry = Registry::new();
        let counter = PrometheusCounter::new("typedq_test").unwrap();
        counter.register(&registry).unwrap();

        counter.inc_processed("orders", ProcessStatus::Success);
        counter.inc_processed("orders", ProcessStatus::Success);
        counter.inc_processed("orders", ProcessStatus::DeadLettered);
        counter.inc_error("orders", "ship");
        counter.inc_retry("orders");
        counter.inc_dlq("orders");
        counter.observe_processing_time("orders", Duration::from_millis(250));

        assert_eq!(
            counter
                .processed
                .with_label_values(&["orders", "success"])
                .get(),
            2
        );
        assert_eq!(
            counter.processed.with_label_values(&["orders", "dlq"]).get(),
            1
        );
        assert_eq!(counter.errors.with_label_values(&["orders", "ship"]).get(), 1);
        assert_eq!(
            counter
                .processing_time
                .with_label_values(&["orders"])
                .get_sample_count(),
            1
        );

        assert_eq!(registry.gather().len(), 5);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        let counter = PrometheusCounter::new("typedq_dup").unwrap();
        counter.register(&registry).unwrap();
        assert!(counter.register(&registry).is_err());
    }
}
