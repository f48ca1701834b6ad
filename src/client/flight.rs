//! Per-key single-flight locking.
//!
//! Used wherever concurrent callers for the same key must collapse into a
//! single piece of work: metadata discovery (one fetch per issuer) and
//! proactive token refresh (one refresh per session/issuer). Callers
//! acquire the key's lock, re-check the shared state they guard, and only
//! then do the work; everyone who was queued behind them observes the
//! result on their own re-check.

use std::{collections::HashMap, hash::Hash, sync::Arc};

use tokio::sync::{Mutex, OwnedMutexGuard};

pub(crate) struct KeyedLocks<K> {
    locks: Mutex<HashMap<K, Arc<Mutex<()>>>>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    pub(crate) fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock for `key`, creating it on first use.
    ///
    /// Entries nobody holds or waits on are pruned on the way in, so the
    /// registry stays bounded by the number of keys currently in flight.
    pub(crate) async fn acquire(&self, key: K) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            Arc::clone(locks.entry(key).or_default())
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn same_key_serializes() {
        let locks = Arc::new(KeyedLocks::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            tasks.push(tokio::spawn(async move {
                let _guard = locks.acquire("issuer").await;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_keys_proceed_independently() {
        let locks = KeyedLocks::new();
        let a = locks.acquire("a").await;
        // Holding "a" must not block "b".
        let b = tokio::time::timeout(std::time::Duration::from_millis(50), locks.acquire("b"))
            .await
            .expect("distinct key should not block");
        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = KeyedLocks::new();
        drop(locks.acquire("a").await);
        drop(locks.acquire("b").await);
        // The next acquire prunes the released entries before inserting.
        let _guard = locks.acquire("c").await;
        assert_eq!(locks.len().await, 1);
    }
}
