//! In-memory write side: an outbox table plus the unit of work that fills it.
//!
//! [`InMemoryOutbox::begin`] opens an [`InMemoryUnitOfWork`] that stages an
//! aggregate row and its outbox entries. Nothing is visible until
//! [`InMemoryUnitOfWork::commit`]; a failed or abandoned unit of work leaves
//! no trace, which is what the all-or-nothing tests rely on.
//!
//! Sequence allocation is optimistic: a commit fails if another unit of work
//! committed an event for the same aggregate after this one allocated.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use bidstream_core::envelope::{AggregateId, EnvelopeId, SequenceNumber};
use bidstream_core::outbox::{OutboxEntry, OutboxStore, OutboxTransaction, PersistenceError};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct OutboxState {
    entries: Vec<OutboxEntry>,
    sequences: HashMap<AggregateId, SequenceNumber>,
    aggregates: HashMap<AggregateId, Value>,
    fail_commits: usize,
    fail_fetches: usize,
    fail_updates: usize,
}

/// In-memory outbox implementing [`OutboxStore`].
///
/// # Example
///
/// ```
/// use bidstream_testing::InMemoryOutbox;
///
/// let outbox = InMemoryOutbox::new();
/// assert!(outbox.entries().is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryOutbox {
    state: Arc<RwLock<OutboxState>>,
}

impl InMemoryOutbox {
    /// Create an empty outbox.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a unit of work.
    #[must_use]
    pub fn begin(&self) -> InMemoryUnitOfWork {
        InMemoryUnitOfWork {
            outbox: self.clone(),
            base: HashMap::new(),
            allocated: HashMap::new(),
            aggregates: Vec::new(),
            staged: Vec::new(),
        }
    }

    /// Make the next `count` commits fail.
    pub fn fail_next_commits(&self, count: usize) {
        self.state.write().unwrap().fail_commits += count;
    }

    /// Make the next `count` calls to `fetch_pending` fail.
    pub fn fail_next_fetches(&self, count: usize) {
        self.state.write().unwrap().fail_fetches += count;
    }

    /// Make the next `count` entry updates (`mark_*`, `record_*`) fail.
    ///
    /// Failing `mark_published` right after a successful publish is how tests
    /// simulate a relay crash between the two.
    pub fn fail_next_updates(&self, count: usize) {
        self.state.write().unwrap().fail_updates += count;
    }

    /// Every committed entry, in recording order.
    #[must_use]
    pub fn entries(&self) -> Vec<OutboxEntry> {
        self.state.read().unwrap().entries.clone()
    }

    /// One committed entry.
    #[must_use]
    pub fn entry(&self, envelope_id: EnvelopeId) -> Option<OutboxEntry> {
        self.state
            .read()
            .unwrap()
            .entries
            .iter()
            .find(|e| e.envelope_id() == envelope_id)
            .cloned()
    }

    /// Committed aggregate row.
    #[must_use]
    pub fn aggregate(&self, aggregate_id: AggregateId) -> Option<Value> {
        self.state.read().unwrap().aggregates.get(&aggregate_id).cloned()
    }

    /// Last committed sequence of an aggregate.
    #[must_use]
    pub fn last_sequence(&self, aggregate_id: AggregateId) -> Option<SequenceNumber> {
        self.state.read().unwrap().sequences.get(&aggregate_id).copied()
    }

    fn take_failure(counter: &mut usize) -> bool {
        if *counter > 0 {
            *counter -= 1;
            true
        } else {
            false
        }
    }

    fn update<F>(&self, envelope_id: EnvelopeId, f: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut OutboxEntry),
    {
        let mut state = self.state.write().unwrap();
        if Self::take_failure(&mut state.fail_updates) {
            return Err(PersistenceError::Database("injected update failure".into()));
        }
        match state.entries.iter_mut().find(|e| e.envelope_id() == envelope_id) {
            Some(entry) => {
                f(entry);
                Ok(())
            }
            None => Err(PersistenceError::Database(format!(
                "no outbox entry {envelope_id}"
            ))),
        }
    }
}

impl OutboxStore for InMemoryOutbox {
    fn fetch_pending(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxEntry>, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            if Self::take_failure(&mut state.fail_fetches) {
                return Err(PersistenceError::Database("injected fetch failure".into()));
            }
            let mut waiting: HashSet<AggregateId> = HashSet::new();
            let mut due = Vec::new();
            for entry in state.entries.iter().filter(|e| e.is_pending()) {
                if due.len() >= limit {
                    break;
                }
                let aggregate_id = entry.envelope.aggregate_id;
                if !entry.is_due(now) {
                    waiting.insert(aggregate_id);
                } else if !waiting.contains(&aggregate_id) {
                    due.push(entry.clone());
                }
            }
            Ok(due)
        })
    }

    fn mark_published(
        &self,
        envelope_id: EnvelopeId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            self.update(envelope_id, |entry| {
                entry.published_at.get_or_insert(at);
            })
        })
    }

    fn record_publish_failure(
        &self,
        envelope_id: EnvelopeId,
        error: String,
        retry_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            self.update(envelope_id, |entry| {
                entry.attempts += 1;
                entry.last_error = Some(error);
                entry.next_attempt_at = Some(retry_at);
            })
        })
    }

    fn mark_dead_lettered(
        &self,
        envelope_id: EnvelopeId,
        error: String,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            self.update(envelope_id, |entry| {
                entry.attempts += 1;
                entry.last_error = Some(error);
                entry.dead_lettered_at = Some(at);
            })
        })
    }

    fn count_pending(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<u64, PersistenceError>> + Send + '_>> {
        Box::pin(async move {
            let state = self.state.read().unwrap();
            Ok(state.entries.iter().filter(|e| e.is_pending()).count() as u64)
        })
    }
}

/// Staged write-side changes, applied atomically on commit.
#[derive(Debug)]
pub struct InMemoryUnitOfWork {
    outbox: InMemoryOutbox,
    base: HashMap<AggregateId, Option<SequenceNumber>>,
    allocated: HashMap<AggregateId, SequenceNumber>,
    aggregates: Vec<(AggregateId, Value)>,
    staged: Vec<OutboxEntry>,
}

impl InMemoryUnitOfWork {
    /// Stage the aggregate's new state.
    pub fn put_aggregate(&mut self, aggregate_id: AggregateId, state: Value) {
        self.aggregates.push((aggregate_id, state));
    }

    /// Entries staged so far.
    #[must_use]
    pub fn staged(&self) -> &[OutboxEntry] {
        &self.staged
    }

    /// Apply every staged change, or none.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::CommitFailed`] if a failure was injected or
    /// another unit of work committed to one of the same aggregates first.
    pub fn commit(self) -> Result<(), PersistenceError> {
        let mut state = self.outbox.state.write().unwrap();

        if InMemoryOutbox::take_failure(&mut state.fail_commits) {
            return Err(PersistenceError::CommitFailed("injected commit failure".into()));
        }
        for (aggregate_id, base) in &self.base {
            if state.sequences.get(aggregate_id).copied() != *base {
                return Err(PersistenceError::CommitFailed(format!(
                    "concurrent write to aggregate {aggregate_id}"
                )));
            }
        }

        state.sequences.extend(self.allocated);
        state.aggregates.extend(self.aggregates);
        state.entries.extend(self.staged);
        Ok(())
    }

    /// Drop every staged change.
    pub fn rollback(self) {}
}

impl OutboxTransaction for InMemoryUnitOfWork {
    fn next_sequence(
        &mut self,
        aggregate_id: AggregateId,
    ) -> impl Future<Output = Result<SequenceNumber, PersistenceError>> + Send {
        let committed = self.outbox.last_sequence(aggregate_id);
        self.base.entry(aggregate_id).or_insert(committed);
        let next = self
            .allocated
            .get(&aggregate_id)
            .copied()
            .or(committed)
            .map_or(SequenceNumber::FIRST, SequenceNumber::next);
        self.allocated.insert(aggregate_id, next);
        std::future::ready(Ok(next))
    }

    fn append(
        &mut self,
        entry: &OutboxEntry,
    ) -> impl Future<Output = Result<(), PersistenceError>> + Send {
        self.staged.push(entry.clone());
        std::future::ready(Ok(()))
    }
}
