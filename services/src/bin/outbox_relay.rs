//! Outbox relay
//!
//! Drains the write-side outbox to the bus until stopped.
//!
//! This binary:
//! - Connects to the write-side `PostgreSQL` and runs its migrations
//! - Publishes due outbox entries in order per aggregate
//! - Hands permanently rejected entries to the fault store
//! - Purges published rows past retention once an hour
//!
//! # Usage
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/bidstream \
//! BIDSTREAM_BROKERS=localhost:9092 \
//! cargo run --bin outbox-relay
//! ```

use anyhow::Context;
use bidstream_core::environment::Clock;
use bidstream_postgres::{PostgresFaultStore, PostgresOutboxStore};
use bidstream_runtime::{FaultHandler, OutboxRelay};
use bidstream_services::{
    RETENTION_INTERVAL, connect_bus, init_tracing, load_config, retention_cutoff, shutdown_signal,
    system_clock,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    tracing::info!("Starting outbox relay...");

    let config = load_config()?;
    let clock = system_clock();

    let outbox = PostgresOutboxStore::connect(config.require_database_url()?)
        .await
        .context("Failed to connect to the write database")?;
    outbox.migrate().await.context("Failed to migrate the write database")?;
    let faults = PostgresFaultStore::new(outbox.pool().clone());

    let bus = connect_bus(&config)?;
    let handler = Arc::new(
        FaultHandler::new(Arc::new(faults), bus.clone(), Arc::clone(&clock))
            .with_publish_policy(config.retry_policy()),
    );

    let (mut relay, relay_shutdown) = OutboxRelay::new(
        Arc::new(outbox.clone()),
        bus,
        handler,
        Arc::clone(&clock),
        config.relay_config(),
    );
    let relay_task = tokio::spawn(async move { relay.run().await });

    let (purge_shutdown, purge_stop) = watch::channel(false);
    let purge_task = tokio::spawn(purge_loop(outbox, clock, config.retention, purge_stop));

    tracing::info!("Outbox relay is running. Press Ctrl+C to shutdown");
    shutdown_signal().await;

    let _ = relay_shutdown.send(true);
    let _ = purge_shutdown.send(true);
    relay_task.await.context("Relay task failed")?;
    purge_task.await.context("Purge task failed")?;

    tracing::info!("Outbox relay shut down");
    Ok(())
}

async fn purge_loop(
    outbox: PostgresOutboxStore,
    clock: Arc<dyn Clock>,
    retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(RETENTION_INTERVAL);
    while !*shutdown.borrow() {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        let purged = match retention_cutoff(clock.now(), retention) {
            Ok(cutoff) => outbox.purge_published(cutoff).await.map_err(anyhow::Error::from),
            Err(e) => Err(e),
        };
        if let Err(e) = purged {
            tracing::warn!(error = %e, "Outbox purge failed");
        }
    }
}
