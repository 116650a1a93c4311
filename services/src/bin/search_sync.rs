//! Search sync
//!
//! Read-service side of auction propagation, plus the operator commands for
//! its fault queue.
//!
//! `search-sync run` (the default):
//! - Connects to the search `PostgreSQL` and runs its migrations
//! - Consumes `auction-events` as the `search-service` consumer group
//! - Dead-letters poison and exhausted messages into the fault store
//! - Once an hour, dead-letters stashed updates whose gap outlived retention
//!
//! The fault store lives in the write-side database, next to the outbox, so
//! both the relay and the consumer report into one queue.
//!
//! # Usage
//!
//! ```bash
//! search-sync                      # run the consumer
//! search-sync faults --limit 20    # list pending fault entries
//! search-sync replay <envelope-id>
//! search-sync discard <envelope-id> --reason "auction withdrawn"
//! search-sync expire-stash
//! ```

use anyhow::Context;
use bidstream_core::environment::Clock;
use bidstream_core::fault::DeadLetterSink;
use bidstream_postgres::{PostgresFaultStore, PostgresOutboxStore};
use bidstream_projections::PostgresSearchItemStore;
use bidstream_runtime::{
    BidstreamConfig, FaultHandler, ProjectionConsumer, SearchProjector, StashExpiry,
};
use bidstream_services::cli::{Command, SearchSyncCli};
use bidstream_services::{
    RETENTION_INTERVAL, connect_bus, init_tracing, load_config, retention_cutoff, shutdown_signal,
    system_clock,
};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = SearchSyncCli::parse();
    init_tracing();

    let config = load_config()?;
    let clock = system_clock();

    match cli.command() {
        Command::Run => run(&config, clock).await,
        Command::Faults { limit } => {
            let handler = fault_handler(&config, clock).await?;
            let total = handler.count_pending().await?;
            for entry in handler.list_pending(limit).await? {
                println!(
                    "{}  {}  attempts={}  group={}  first_failed={}  last_error={}",
                    entry.envelope_id,
                    entry.original_topic,
                    entry.attempts,
                    entry.consumer_group.as_deref().unwrap_or("-"),
                    entry.first_failed_at.to_rfc3339(),
                    entry.last_error,
                );
            }
            println!("{total} pending");
            Ok(())
        }
        Command::Replay { envelope_id } => {
            let handler = fault_handler(&config, clock).await?;
            let envelope = handler.replay(envelope_id).await?;
            println!("Replayed {envelope}");
            Ok(())
        }
        Command::ReplayPending { limit } => {
            let handler = fault_handler(&config, clock).await?;
            let report = handler.replay_pending(limit).await?;
            for (envelope_id, error) in &report.failed {
                println!("{envelope_id}  failed: {error}");
            }
            println!(
                "{} replayed, {} failed",
                report.replayed.len(),
                report.failed.len()
            );
            Ok(())
        }
        Command::Discard { envelope_id, reason } => {
            let handler = fault_handler(&config, clock).await?;
            handler.discard(envelope_id, reason).await?;
            println!("Discarded {envelope_id}");
            Ok(())
        }
        Command::ExpireStash => {
            let store = Arc::new(search_store(&config).await?);
            let handler = fault_handler(&config, Arc::clone(&clock)).await?;
            let projector = SearchProjector::new(store, Arc::clone(&clock));
            let report = expire_stash(&projector, &handler, &config, clock.as_ref()).await?;
            println!(
                "{} stashed envelopes dead-lettered, {} already superseded",
                report.dead_lettered, report.superseded
            );
            Ok(())
        }
    }
}

async fn search_store(config: &BidstreamConfig) -> anyhow::Result<PostgresSearchItemStore> {
    let store = PostgresSearchItemStore::connect(config.require_search_database_url()?)
        .await
        .context("Failed to connect to the search database")?;
    store.migrate().await.context("Failed to migrate the search database")?;
    Ok(store)
}

async fn fault_handler(config: &BidstreamConfig, clock: Arc<dyn Clock>) -> anyhow::Result<FaultHandler> {
    let write_db = PostgresOutboxStore::connect(config.require_database_url()?)
        .await
        .context("Failed to connect to the write database")?;
    write_db.migrate().await.context("Failed to migrate the write database")?;

    let faults = PostgresFaultStore::new(write_db.pool().clone());
    Ok(FaultHandler::new(Arc::new(faults), connect_bus(config)?, clock)
        .with_publish_policy(config.retry_policy()))
}

async fn run(config: &BidstreamConfig, clock: Arc<dyn Clock>) -> anyhow::Result<()> {
    tracing::info!("Starting search sync...");

    let store = Arc::new(search_store(config).await?);
    let handler = Arc::new(fault_handler(config, Arc::clone(&clock)).await?);
    let bus = connect_bus(config)?;

    let projector = SearchProjector::new(store, Arc::clone(&clock));
    let (consumer, consumer_shutdown) = ProjectionConsumer::new(
        projector.clone(),
        bus,
        Arc::clone(&handler) as Arc<dyn DeadLetterSink>,
        config.consumer_config(),
    );
    let mut consumer_task = tokio::spawn(async move { consumer.run().await });

    let (expiry_shutdown, expiry_stop) = watch::channel(false);
    let expiry_task = tokio::spawn(expiry_loop(
        projector,
        handler,
        config.clone(),
        clock,
        expiry_stop,
    ));

    tracing::info!("Search sync is running. Press Ctrl+C to shutdown");
    tokio::select! {
        () = shutdown_signal() => {}
        finished = &mut consumer_task => {
            let _ = expiry_shutdown.send(true);
            expiry_task.await.context("Stash expiry task failed")?;
            finished.context("Consumer task failed")??;
            anyhow::bail!("Projection consumer stopped unexpectedly");
        }
    }

    let _ = consumer_shutdown.send(true);
    let _ = expiry_shutdown.send(true);
    consumer_task.await.context("Consumer task failed")??;
    expiry_task.await.context("Stash expiry task failed")?;

    tracing::info!("Search sync shut down");
    Ok(())
}

async fn expire_stash(
    projector: &SearchProjector<PostgresSearchItemStore>,
    handler: &FaultHandler,
    config: &BidstreamConfig,
    clock: &dyn Clock,
) -> anyhow::Result<StashExpiry> {
    let cutoff = retention_cutoff(clock.now(), config.retention)?;
    let report = projector
        .expire_stash(cutoff, handler, &config.topic, &config.consumer_group)
        .await?;
    Ok(report)
}

async fn expiry_loop(
    projector: SearchProjector<PostgresSearchItemStore>,
    handler: Arc<FaultHandler>,
    config: BidstreamConfig,
    clock: Arc<dyn Clock>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(RETENTION_INTERVAL);
    while !*shutdown.borrow() {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        match expire_stash(&projector, &handler, &config, clock.as_ref()).await {
            Ok(report) => tracing::debug!(
                dead_lettered = report.dead_lettered,
                superseded = report.superseded,
                "Stash expiry pass complete"
            ),
            Err(e) => tracing::warn!(error = %e, "Stash expiry failed"),
        }
    }
}
