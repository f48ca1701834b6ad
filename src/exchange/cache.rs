//! Bounded cache of exchanged tokens.
//!
//! Keyed by `(endpoint, connector_id, user_id)` so one upstream user's
//! exchanged credential is reused across requests until it expires. The
//! cache is capacity-bounded: when full, expired entries go first, then
//! the least recently used.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::{EXPIRY_MARGIN, secret::Secret};

/// Default capacity, overridable at exchanger construction.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ExchangeKey {
    pub endpoint: String,
    pub connector_id: String,
    pub user_id: String,
}

pub(crate) struct CacheEntry {
    pub access_token: Secret,
    pub issued_token_type: String,
    pub token_type: String,
    pub expires_at: Instant,
    last_accessed: Instant,
}

impl CacheEntry {
    fn is_expired(&self, margin: Duration) -> bool {
        self.expires_at <= Instant::now() + margin
    }
}

/// Point-in-time counters for operational introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeCacheStats {
    pub entries: usize,
    pub max_entries: usize,
}

pub(crate) struct ExchangeCache {
    entries: DashMap<ExchangeKey, CacheEntry>,
    max_entries: usize,
}

impl ExchangeCache {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Non-expiring lookup; refreshes the entry's LRU position.
    pub(crate) fn get(&self, key: &ExchangeKey) -> Option<(Secret, String, String)> {
        let mut entry = self.entries.get_mut(key)?;
        if entry.is_expired(EXPIRY_MARGIN) {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        entry.last_accessed = Instant::now();
        Some((
            entry.access_token.clone(),
            entry.issued_token_type.clone(),
            entry.token_type.clone(),
        ))
    }

    pub(crate) fn insert(
        &self,
        key: ExchangeKey,
        access_token: Secret,
        issued_token_type: String,
        token_type: String,
        expires_in: Duration,
    ) {
        self.evict_if_needed();
        let now = Instant::now();
        self.entries.insert(
            key,
            CacheEntry {
                access_token,
                issued_token_type,
                token_type,
                expires_at: now + expires_in,
                last_accessed: now,
            },
        );
    }

    /// Remove entries whose expiry has passed (margin zero).
    pub(crate) fn cleanup(&self) {
        self.entries
            .retain(|_, entry| !entry.is_expired(Duration::ZERO));
    }

    pub(crate) fn clear(&self, key: &ExchangeKey) {
        self.entries.remove(key);
    }

    pub(crate) fn clear_all(&self) {
        self.entries.clear();
    }

    pub(crate) fn stats(&self) -> ExchangeCacheStats {
        ExchangeCacheStats {
            entries: self.entries.len(),
            max_entries: self.max_entries,
        }
    }

    /// Two-pass bound enforcement before an insert: drop expired entries,
    /// then enough least-recently-used ones to make room.
    fn evict_if_needed(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }

        self.entries
            .retain(|_, entry| !entry.is_expired(Duration::ZERO));

        let current = self.entries.len();
        if current < self.max_entries {
            return;
        }

        let overflow = current + 1 - self.max_entries;
        let mut by_age: Vec<(ExchangeKey, Instant)> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.last_accessed))
            .collect();
        by_age.sort_by_key(|(_, accessed)| *accessed);

        for (key, _) in by_age.into_iter().take(overflow) {
            self.entries.remove(&key);
        }
        tracing::debug!(evicted = overflow, "exchange cache evicted lru entries");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(user: &str) -> ExchangeKey {
        ExchangeKey {
            endpoint: "https://dex.example.com/token".to_string(),
            connector_id: "ldap".to_string(),
            user_id: user.to_string(),
        }
    }

    fn insert(cache: &ExchangeCache, user: &str, expires_in: Duration) {
        cache.insert(
            key(user),
            Secret::new(format!("token-{user}")),
            "urn:ietf:params:oauth:token-type:access_token".to_string(),
            "bearer".to_string(),
            expires_in,
        );
    }

    #[test]
    fn hit_and_miss() {
        let cache = ExchangeCache::new(10);
        insert(&cache, "alice", Duration::from_secs(3600));

        let (token, _, _) = cache.get(&key("alice")).unwrap();
        assert_eq!(token.value(), "token-alice");
        assert!(cache.get(&key("bob")).is_none());
    }

    #[test]
    fn entries_within_the_margin_are_expired() {
        let cache = ExchangeCache::new(10);
        insert(&cache, "alice", Duration::from_secs(10));

        assert!(cache.get(&key("alice")).is_none());
        assert_eq!(cache.stats().entries, 0, "expired entry is removed on read");
    }

    #[test]
    fn cleanup_removes_only_absolutely_expired_entries() {
        let cache = ExchangeCache::new(10);
        insert(&cache, "stale", Duration::ZERO);
        insert(&cache, "expiring", Duration::from_secs(10));
        insert(&cache, "fresh", Duration::from_secs(3600));

        cache.cleanup();
        assert_eq!(cache.stats().entries, 2);
    }

    #[test]
    fn lru_eviction_keeps_recently_used_entries() {
        let cache = ExchangeCache::new(3);
        insert(&cache, "a", Duration::from_secs(3600));
        std::thread::sleep(Duration::from_millis(5));
        insert(&cache, "b", Duration::from_secs(3600));
        std::thread::sleep(Duration::from_millis(5));
        insert(&cache, "c", Duration::from_secs(3600));

        // Touch "a" so "b" becomes the oldest.
        std::thread::sleep(Duration::from_millis(5));
        cache.get(&key("a")).unwrap();

        insert(&cache, "d", Duration::from_secs(3600));
        assert!(cache.get(&key("a")).is_some());
        assert!(cache.get(&key("b")).is_none(), "lru entry was evicted");
        assert_eq!(cache.stats().entries, 3);
    }

    #[test]
    fn clear_and_clear_all() {
        let cache = ExchangeCache::new(10);
        insert(&cache, "a", Duration::from_secs(3600));
        insert(&cache, "b", Duration::from_secs(3600));

        cache.clear(&key("a"));
        assert!(cache.get(&key("a")).is_none());
        assert!(cache.get(&key("b")).is_some());

        cache.clear_all();
        assert_eq!(cache.stats().entries, 0);
    }
}
