//! Per-aggregate async locks.
//!
//! The bus keys messages by aggregate id, but redelivery and rebalancing can
//! still hand two envelopes of the same aggregate to different workers. The
//! consumer takes a [`KeyedLocks`] guard around every read-check-write so that
//! they never interleave. Envelopes of different aggregates run in parallel.

use bidstream_core::envelope::AggregateId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = Mutex<HashMap<AggregateId, Arc<AsyncMutex<()>>>>;

/// A set of async mutexes, one per key in use.
///
/// Entries are created on demand and removed when the last holder or waiter
/// goes away, so the map only holds keys currently being processed.
#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<LockMap>,
}

impl KeyedLocks {
    /// Create an empty lock set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: AggregateId) -> KeyGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key).or_default())
        };

        let guard = mutex.lock_owned().await;

        KeyGuard {
            key,
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Number of keys currently locked or awaited.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Exclusive access to one key; released on drop.
#[derive(Debug)]
pub struct KeyGuard {
    key: AggregateId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map still references the mutex: nobody holds or awaits it.
        if locks
            .get(&self.key)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_serialized() {
        let locks = KeyedLocks::new();
        let key = AggregateId::new();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.lock(key).await;
                let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                max_inside.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            let _ = task.await;
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert_eq!(locks.active_keys(), 0);
    }

    #[tokio::test]
    async fn different_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _first = locks.lock(AggregateId::new()).await;

        let second = tokio::time::timeout(Duration::from_millis(50), locks.lock(AggregateId::new()));
        assert!(second.await.is_ok());
    }
}
