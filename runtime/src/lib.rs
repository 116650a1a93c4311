//! # Bidstream Runtime
//!
//! The moving parts of auction event propagation.
//!
//! ## Core Components
//!
//! - **Outbox publisher**: records envelopes inside the caller's unit of work
//! - **Outbox relay**: drains pending entries to the bus with backoff
//! - **Search projector**: idempotent, order-tolerant apply algorithm
//! - **Projection consumer**: bounded-concurrency consumer loop with per-key locks
//! - **Fault handler**: dead-letter sink plus replay and discard
//!
//! ## Example
//!
//! ```ignore
//! use bidstream_runtime::{ConsumerConfig, FaultHandler, ProjectionConsumer, SearchProjector};
//!
//! let faults = Arc::new(FaultHandler::new(fault_store, bus.clone(), clock.clone()));
//! let projector = SearchProjector::new(search_store, clock);
//! let (consumer, shutdown) =
//!     ProjectionConsumer::new(projector, bus, faults, ConsumerConfig::default());
//!
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     shutdown.send(true).ok();
//! });
//! consumer.run().await?;
//! ```

/// Environment-based configuration
pub mod config;

/// Projection consumer loop
pub mod consumer;

/// Dead-letter sink and operator replay
pub mod fault_handler;

/// Per-aggregate async locks
pub mod key_lock;

/// Prometheus metrics for observability
pub mod metrics;

/// Search read-model apply algorithm
pub mod projector;

/// Request-side outbox recording
pub mod publisher;

/// Outbox drain loop
pub mod relay;

/// Retry logic with exponential backoff
pub mod retry;

pub use config::{BidstreamConfig, ConfigError};
pub use consumer::{ConsumerConfig, ProjectionConsumer};
pub use fault_handler::{FaultHandler, ReplayReport};
pub use projector::{ExpiryError, SearchProjector, StashExpiry};
pub use publisher::OutboxPublisher;
pub use relay::{DrainReport, OutboxRelay, RelayConfig};
