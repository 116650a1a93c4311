//! Read-side storage for the Bidstream search projection.
//!
//! # Overview
//!
//! [`PostgresSearchItemStore`] implements
//! [`SearchItemStore`](bidstream_core::projection::SearchItemStore) on
//! `PostgreSQL`: live search items, tombstones for deleted auctions and the
//! stash of updates that arrived ahead of their predecessor.
//!
//! # CQRS Separation
//!
//! The read model usually lives in its own database:
//!
//! ```text
//! Write DB (auctions + outbox)  →  Relay  →  Bus  →  Consumer  →  Search DB
//! ```
//!
//! The projection itself (ordering, idempotency, stash replay) lives in
//! `bidstream-runtime`; this crate only stores what it decides.

pub mod postgres;

pub use postgres::PostgresSearchItemStore;
