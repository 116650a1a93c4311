//! In-memory search read model.
//!
//! Holds live records, tombstones and stashed envelopes in one lock so every
//! write is atomic, matching what the SQL store gets from a transaction.
//! Write failures can be injected to exercise the transient-failure path.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use bidstream_core::envelope::{AggregateId, EventEnvelope, SequenceNumber};
use bidstream_core::projection::{ReadState, SearchItem, SearchItemStore, StoreError};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone)]
struct Tombstone {
    sequence: SequenceNumber,
    deleted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Stashed {
    envelope: EventEnvelope,
    stashed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SearchState {
    items: HashMap<AggregateId, SearchItem>,
    tombstones: HashMap<AggregateId, Tombstone>,
    stash: HashMap<AggregateId, BTreeMap<SequenceNumber, Stashed>>,
    fail_reads: usize,
    fail_writes: usize,
    writes: u64,
}

/// In-memory [`SearchItemStore`].
///
/// # Example
///
/// ```
/// use bidstream_testing::InMemorySearchItemStore;
///
/// let store = InMemorySearchItemStore::new();
/// assert!(store.items().is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemorySearchItemStore {
    state: Arc<RwLock<SearchState>>,
}

impl InMemorySearchItemStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, count: usize) {
        self.state.write().unwrap().fail_writes += count;
    }

    /// Make the next `count` reads fail with [`StoreError::Unavailable`].
    pub fn fail_next_reads(&self, count: usize) {
        self.state.write().unwrap().fail_reads += count;
    }

    /// Live record of an aggregate.
    #[must_use]
    pub fn item(&self, aggregate_id: AggregateId) -> Option<SearchItem> {
        self.state.read().unwrap().items.get(&aggregate_id).cloned()
    }

    /// Every live record.
    #[must_use]
    pub fn items(&self) -> Vec<SearchItem> {
        self.state.read().unwrap().items.values().cloned().collect()
    }

    /// Tombstone sequence of a deleted aggregate.
    #[must_use]
    pub fn tombstone(&self, aggregate_id: AggregateId) -> Option<SequenceNumber> {
        self.state
            .read()
            .unwrap()
            .tombstones
            .get(&aggregate_id)
            .map(|t| t.sequence)
    }

    /// Sequences currently stashed for an aggregate, ascending.
    #[must_use]
    pub fn stashed_sequences(&self, aggregate_id: AggregateId) -> Vec<SequenceNumber> {
        self.state
            .read()
            .unwrap()
            .stash
            .get(&aggregate_id)
            .map(|s| s.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Successful writes so far.
    #[must_use]
    pub fn write_count(&self) -> u64 {
        self.state.read().unwrap().writes
    }

    fn read<R>(&self, f: impl FnOnce(&SearchState) -> R) -> Result<R, StoreError> {
        let mut state = self.state.write().unwrap();
        if state.fail_reads > 0 {
            state.fail_reads -= 1;
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        Ok(f(&state))
    }

    fn write<R>(&self, f: impl FnOnce(&mut SearchState) -> R) -> Result<R, StoreError> {
        let mut state = self.state.write().unwrap();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(StoreError::Unavailable("injected write failure".into()));
        }
        state.writes += 1;
        Ok(f(&mut state))
    }
}

impl SearchItemStore for InMemorySearchItemStore {
    fn load(
        &self,
        aggregate_id: AggregateId,
    ) -> impl Future<Output = Result<ReadState, StoreError>> + Send {
        let result = self.read(|state| {
            if let Some(item) = state.items.get(&aggregate_id) {
                ReadState::Live(item.clone())
            } else if let Some(tombstone) = state.tombstones.get(&aggregate_id) {
                ReadState::Deleted {
                    last_applied: tombstone.sequence,
                    deleted_at: tombstone.deleted_at,
                }
            } else {
                ReadState::Absent
            }
        });
        std::future::ready(result)
    }

    fn upsert(&self, item: &SearchItem) -> impl Future<Output = Result<(), StoreError>> + Send {
        let result = self.write(|state| {
            state.tombstones.remove(&item.aggregate_id);
            state.items.insert(item.aggregate_id, item.clone());
        });
        std::future::ready(result)
    }

    fn remove(
        &self,
        aggregate_id: AggregateId,
        sequence: SequenceNumber,
        deleted_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let result = self.write(|state| {
            state.items.remove(&aggregate_id);
            state.tombstones.insert(
                aggregate_id,
                Tombstone {
                    sequence,
                    deleted_at,
                },
            );
        });
        std::future::ready(result)
    }

    fn stash(
        &self,
        envelope: &EventEnvelope,
        stashed_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let result = self.write(|state| {
            state
                .stash
                .entry(envelope.aggregate_id)
                .or_default()
                .entry(envelope.sequence)
                .or_insert_with(|| Stashed {
                    envelope: envelope.clone(),
                    stashed_at,
                });
        });
        std::future::ready(result)
    }

    fn stashed(
        &self,
        aggregate_id: AggregateId,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, StoreError>> + Send {
        let result = self.read(|state| {
            state
                .stash
                .get(&aggregate_id)
                .map(|s| s.values().map(|st| st.envelope.clone()).collect())
                .unwrap_or_default()
        });
        std::future::ready(result)
    }

    fn discard_stashed(
        &self,
        aggregate_id: AggregateId,
        through: SequenceNumber,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let result = self.write(|state| {
            if let Some(stash) = state.stash.get_mut(&aggregate_id) {
                stash.retain(|seq, _| *seq > through);
                if stash.is_empty() {
                    state.stash.remove(&aggregate_id);
                }
            }
        });
        std::future::ready(result)
    }

    fn unstash(
        &self,
        aggregate_id: AggregateId,
        sequence: SequenceNumber,
    ) -> impl Future<Output = Result<(), StoreError>> + Send {
        let result = self.write(|state| {
            if let Some(stash) = state.stash.get_mut(&aggregate_id) {
                stash.remove(&sequence);
                if stash.is_empty() {
                    state.stash.remove(&aggregate_id);
                }
            }
        });
        std::future::ready(result)
    }

    fn expired_stash(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<EventEnvelope>, StoreError>> + Send {
        let result = self.read(|state| {
            let mut expired: Vec<&Stashed> = state
                .stash
                .values()
                .flat_map(BTreeMap::values)
                .filter(|s| s.stashed_at < cutoff)
                .collect();
            expired.sort_by_key(|s| (s.stashed_at, s.envelope.aggregate_id, s.envelope.sequence));
            expired
                .into_iter()
                .take(limit)
                .map(|s| s.envelope.clone())
                .collect()
        });
        std::future::ready(result)
    }
}
