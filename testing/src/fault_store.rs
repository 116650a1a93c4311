//! In-memory fault store.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on poisoned locks

use bidstream_core::envelope::EnvelopeId;
use bidstream_core::fault::{DeadLetter, FaultEntry, FaultError, FaultStatus, FaultStore};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct FaultState {
    // Insertion order doubles as "oldest first".
    entries: Vec<FaultEntry>,
    fail_records: usize,
}

/// In-memory [`FaultStore`], keyed by envelope id.
///
/// # Example
///
/// ```
/// use bidstream_testing::InMemoryFaultStore;
///
/// let store = InMemoryFaultStore::new();
/// assert!(store.entries().is_empty());
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryFaultStore {
    state: Arc<RwLock<FaultState>>,
}

impl InMemoryFaultStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls to `record` fail.
    pub fn fail_next_records(&self, count: usize) {
        self.state.write().unwrap().fail_records += count;
    }

    /// Every entry, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<FaultEntry> {
        self.state.read().unwrap().entries.clone()
    }

    /// Entries currently pending.
    #[must_use]
    pub fn pending(&self) -> Vec<FaultEntry> {
        self.state
            .read()
            .unwrap()
            .entries
            .iter()
            .filter(|e| e.status == FaultStatus::Pending)
            .cloned()
            .collect()
    }

    fn resolve(
        &self,
        envelope_id: EnvelopeId,
        status: FaultStatus,
        notes: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<(), FaultError> {
        let mut state = self.state.write().unwrap();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.envelope_id == envelope_id)
            .ok_or(FaultError::NotFound(envelope_id))?;
        entry.status = status;
        entry.resolved_at = Some(at);
        if notes.is_some() {
            entry.resolution_notes = notes;
        }
        Ok(())
    }
}

impl FaultStore for InMemoryFaultStore {
    fn record(
        &self,
        letter: DeadLetter,
    ) -> Pin<Box<dyn Future<Output = Result<FaultEntry, FaultError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.write().unwrap();
            if state.fail_records > 0 {
                state.fail_records -= 1;
                return Err(FaultError::Storage("injected record failure".into()));
            }

            if let Some(existing) = state
                .entries
                .iter_mut()
                .find(|e| e.envelope_id == letter.envelope_id)
            {
                existing.absorb(letter);
                return Ok(existing.clone());
            }

            let entry = FaultEntry::from_letter(letter);
            state.entries.push(entry.clone());
            Ok(entry)
        })
    }

    fn get(
        &self,
        envelope_id: EnvelopeId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<FaultEntry>, FaultError>> + Send + '_>> {
        Box::pin(async move {
            let state = self.state.read().unwrap();
            Ok(state
                .entries
                .iter()
                .find(|e| e.envelope_id == envelope_id)
                .cloned())
        })
    }

    fn list_by_status(
        &self,
        status: FaultStatus,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<FaultEntry>, FaultError>> + Send + '_>> {
        Box::pin(async move {
            let state = self.state.read().unwrap();
            let mut entries: Vec<FaultEntry> = state
                .entries
                .iter()
                .filter(|e| e.status == status)
                .cloned()
                .collect();
            entries.sort_by_key(|e| e.first_failed_at);
            entries.truncate(limit);
            Ok(entries)
        })
    }

    fn mark_replayed(
        &self,
        envelope_id: EnvelopeId,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), FaultError>> + Send + '_>> {
        Box::pin(async move { self.resolve(envelope_id, FaultStatus::Replayed, None, at) })
    }

    fn mark_discarded(
        &self,
        envelope_id: EnvelopeId,
        reason: String,
        at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), FaultError>> + Send + '_>> {
        Box::pin(async move {
            self.resolve(envelope_id, FaultStatus::Discarded, Some(reason), at)
        })
    }

    fn count_pending(&self) -> Pin<Box<dyn Future<Output = Result<u64, FaultError>> + Send + '_>> {
        Box::pin(async move {
            let state = self.state.read().unwrap();
            Ok(state
                .entries
                .iter()
                .filter(|e| e.status == FaultStatus::Pending)
                .count() as u64)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    fn letter(envelope_id: EnvelopeId, attempts: u32) -> DeadLetter {
        DeadLetter {
            envelope_id,
            original_topic: "auction-events".into(),
            consumer_group: Some("search-service".into()),
            attempts,
            last_error: "store down".into(),
            raw_envelope: b"{}".to_vec(),
            failed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn repeated_failures_fold_into_one_entry() {
        let store = InMemoryFaultStore::new();
        let id = EnvelopeId::new();

        store.record(letter(id, 5)).await.unwrap();
        store.mark_discarded(id, "known bad".into(), Utc::now()).await.unwrap();
        let entry = store.record(letter(id, 5)).await.unwrap();

        assert_eq!(store.entries().len(), 1);
        assert_eq!(entry.attempts, 10);
        assert_eq!(entry.status, FaultStatus::Pending);
        assert_eq!(store.count_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn resolving_unknown_entry_is_not_found() {
        let store = InMemoryFaultStore::new();
        let id = EnvelopeId::new();

        let err = store.mark_replayed(id, Utc::now()).await.unwrap_err();
        assert_eq!(err, FaultError::NotFound(id));
    }
}
