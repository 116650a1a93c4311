//! Process wiring shared by the `outbox-relay` and `search-sync` binaries.
//!
//! Both binaries read [`BidstreamConfig`] from the environment, log through
//! `tracing-subscriber`, optionally expose Prometheus metrics and stop on
//! Ctrl+C or SIGTERM.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;

use anyhow::Context;
use bidstream_core::environment::{Clock, SystemClock};
use bidstream_redpanda::RedpandaMessageBus;
use bidstream_runtime::BidstreamConfig;
use bidstream_runtime::metrics::MetricsServer;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the long-running binaries run their retention pass.
pub const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins; otherwise `info` with `bidstream` crates at `debug`.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bidstream=debug,sqlx=warn,rdkafka=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load the configuration and start the metrics exporter if one is configured.
///
/// # Errors
///
/// Returns an error if a variable is invalid or the exporter cannot start.
pub fn load_config() -> anyhow::Result<BidstreamConfig> {
    let config = BidstreamConfig::from_env().context("Invalid configuration")?;

    if let Some(addr) = config.metrics_addr {
        MetricsServer::new(addr)
            .start()
            .context("Failed to start metrics exporter")?;
    }

    tracing::info!(
        brokers = %config.brokers,
        topic = %config.topic,
        consumer_group = %config.consumer_group,
        metrics = config.metrics_addr.is_some(),
        "Configuration loaded"
    );
    Ok(config)
}

/// The shared bus client.
///
/// # Errors
///
/// Returns an error if the producer cannot be created.
pub fn connect_bus(config: &BidstreamConfig) -> anyhow::Result<Arc<RedpandaMessageBus>> {
    let bus = RedpandaMessageBus::builder()
        .brokers(&config.brokers)
        .build()
        .context("Failed to create message bus")?;
    Ok(Arc::new(bus))
}

/// Wall clock for production wiring.
#[must_use]
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Rows older than the returned instant are past retention.
///
/// # Errors
///
/// Returns an error if `retention` does not fit a calendar duration.
pub fn retention_cutoff(now: DateTime<Utc>, retention: Duration) -> anyhow::Result<DateTime<Utc>> {
    let retention = chrono::Duration::from_std(retention).context("Retention out of range")?;
    now.checked_sub_signed(retention)
        .context("Retention reaches before the earliest representable time")
}

/// Resolve on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            tracing::info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cutoff_is_retention_before_now() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        let cutoff = retention_cutoff(now, Duration::from_secs(7 * 24 * 3600)).unwrap();
        assert_eq!(cutoff, Utc.with_ymd_and_hms(2026, 3, 3, 12, 0, 0).unwrap());
    }

    #[test]
    fn absurd_retention_is_an_error() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
        assert!(retention_cutoff(now, Duration::from_secs(u64::MAX)).is_err());
    }
}
