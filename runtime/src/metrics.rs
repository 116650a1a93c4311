//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for every propagation stage:
//! - Outbox recording and relay publishing
//! - Projection applies, skips, buffering and conflicts
//! - Fault entries and replays
//!
//! # Example
//!
//! ```rust,no_run
//! use bidstream_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use bidstream_core::envelope::EventKind;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
#[derive(Debug, Clone, Copy)]
pub struct MetricsServer {
    addr: SocketAddr,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Register metric descriptions and start the HTTP exporter.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    pub fn start(&self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            // Configure histogram buckets for latency measurements
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        builder
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    // Outbox
    describe_counter!(
        "outbox_events_recorded_total",
        "Total number of events recorded in the outbox"
    );
    describe_counter!(
        "outbox_events_published_total",
        "Total number of outbox entries confirmed by the bus"
    );
    describe_counter!(
        "outbox_publish_failures_total",
        "Total number of failed publish attempts from the relay"
    );
    describe_counter!(
        "outbox_events_dead_lettered_total",
        "Total number of outbox entries rejected permanently by the bus"
    );
    describe_gauge!("outbox_pending_entries", "Outbox entries awaiting publish");
    describe_histogram!(
        "outbox_publish_duration_seconds",
        "Time taken to publish one outbox entry"
    );

    // Projection
    describe_counter!(
        "projection_envelopes_applied_total",
        "Total number of envelopes that changed the read model"
    );
    describe_counter!(
        "projection_envelopes_skipped_total",
        "Total number of duplicate or stale envelopes ignored"
    );
    describe_counter!(
        "projection_envelopes_buffered_total",
        "Total number of out-of-order envelopes stashed"
    );
    describe_counter!(
        "projection_conflicts_total",
        "Total number of ordering conflicts detected"
    );
    describe_counter!(
        "projection_apply_failures_total",
        "Total number of failed applies"
    );
    describe_counter!(
        "projection_stash_expired_total",
        "Total number of stashed envelopes dead-lettered after their gap outlived retention"
    );
    describe_histogram!(
        "projection_apply_duration_seconds",
        "Time taken to apply one envelope"
    );

    // Bus
    describe_counter!(
        "bus_redeliveries_total",
        "Total number of nacked deliveries scheduled for redelivery"
    );
    describe_counter!(
        "bus_dead_letters_total",
        "Total number of consumed messages handed to the dead-letter sink"
    );

    // Faults
    describe_counter!(
        "fault_entries_recorded_total",
        "Total number of dead letters persisted"
    );
    describe_counter!(
        "fault_entries_replayed_total",
        "Total number of fault entries replayed"
    );
    describe_counter!(
        "fault_entries_discarded_total",
        "Total number of fault entries discarded"
    );

    // Retry
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!(
        "retry_exhausted_total",
        "Total number of retry attempts that exhausted max retries"
    );
}

/// Outbox metrics recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record an event written to the outbox.
    pub fn record_recorded(kind: EventKind) {
        counter!("outbox_events_recorded_total", "kind" => kind.as_str()).increment(1);
    }

    /// Record a confirmed publish.
    pub fn record_published(duration: Duration) {
        counter!("outbox_events_published_total").increment(1);
        histogram!("outbox_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed publish attempt.
    pub fn record_publish_failure(permanent: bool) {
        let class = if permanent { "permanent" } else { "transient" };
        counter!("outbox_publish_failures_total", "class" => class).increment(1);
        if permanent {
            counter!("outbox_events_dead_lettered_total").increment(1);
        }
    }

    /// Record the size of the pending set.
    #[allow(clippy::cast_precision_loss)] // Pending counts stay far below 2^52
    pub fn record_pending(pending: u64) {
        gauge!("outbox_pending_entries").set(pending as f64);
    }
}

/// Projection metrics recorder.
pub struct ProjectionMetrics;

impl ProjectionMetrics {
    /// Record an envelope that changed the read model.
    pub fn record_applied(kind: EventKind, duration: Duration) {
        counter!("projection_envelopes_applied_total", "kind" => kind.as_str()).increment(1);
        histogram!("projection_apply_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a duplicate or stale envelope.
    pub fn record_skipped(kind: EventKind) {
        counter!("projection_envelopes_skipped_total", "kind" => kind.as_str()).increment(1);
    }

    /// Record a stashed envelope.
    pub fn record_buffered() {
        counter!("projection_envelopes_buffered_total").increment(1);
    }

    /// Record an ordering conflict.
    pub fn record_conflict(kind: EventKind) {
        counter!("projection_conflicts_total", "kind" => kind.as_str()).increment(1);
    }

    /// Record a failed apply.
    pub fn record_failure(permanent: bool) {
        let class = if permanent { "permanent" } else { "transient" };
        counter!("projection_apply_failures_total", "class" => class).increment(1);
    }

    /// Record a stashed envelope dead-lettered on expiry.
    pub fn record_stash_expired() {
        counter!("projection_stash_expired_total").increment(1);
    }
}

/// Fault handler metrics recorder.
pub struct FaultMetrics;

impl FaultMetrics {
    /// Record a persisted dead letter.
    pub fn record_recorded(topic: &str) {
        counter!("fault_entries_recorded_total", "topic" => topic.to_string()).increment(1);
    }

    /// Record a replay.
    pub fn record_replayed() {
        counter!("fault_entries_replayed_total").increment(1);
    }

    /// Record a discard.
    pub fn record_discarded() {
        counter!("fault_entries_discarded_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorders_work_without_installed_exporter() {
        register_metrics();
        OutboxMetrics::record_recorded(EventKind::Created);
        OutboxMetrics::record_publish_failure(true);
        OutboxMetrics::record_pending(3);
        ProjectionMetrics::record_applied(EventKind::Updated, Duration::from_millis(3));
        ProjectionMetrics::record_conflict(EventKind::Created);
        FaultMetrics::record_recorded("auction-events");
    }
}
