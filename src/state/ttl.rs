//! Keyed map whose entries expire after a fixed time window.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry<V> {
    payload: V,
    updated_at: Instant,
    last_access: Instant,
}

/// Expiration behaviour of a [`TtlStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    /// Maximum age of an entry since its last update (or read, when sliding)
    pub ttl: Duration,
    /// Whether a successful read renews the entry
    pub sliding: bool,
    /// Upper bound on entries; the least recently accessed is evicted beyond it
    pub max_entries: Option<usize>,
}

impl TtlPolicy {
    /// Fixed expiration, no size cap
    #[must_use]
    pub const fn fixed(ttl: Duration) -> Self {
        Self {
            ttl,
            sliding: false,
            max_entries: None,
        }
    }

    /// Sliding expiration, no size cap
    #[must_use]
    pub const fn sliding(ttl: Duration) -> Self {
        Self {
            ttl,
            sliding: true,
            max_entries: None,
        }
    }

    /// Add an entry cap with least-recently-accessed eviction
    #[must_use]
    pub const fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }
}

/// Mutex-guarded map with opportunistic expiry.
///
/// Expired entries are swept on every `put` and `get`, and a `get` never
/// returns an entry older than the TTL even if a sweep has not run yet.
#[derive(Debug)]
pub struct TtlStore<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    policy: TtlPolicy,
}

impl<K, V> TtlStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty store
    #[must_use]
    pub fn new(policy: TtlPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy,
        }
    }

    /// Insert or replace an entry
    pub fn put(&self, key: K, value: V) {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        sweep_locked(&mut entries, self.policy.ttl, now);
        entries.insert(
            key,
            Entry {
                payload: value,
                updated_at: now,
                last_access: now,
            },
        );
        if let Some(max) = self.policy.max_entries {
            evict_lru_locked(&mut entries, max);
        }
    }

    /// Read a copy of an entry, renewing it when the policy is sliding
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        sweep_locked(&mut entries, self.policy.ttl, now);
        let entry = entries.get_mut(key)?;
        entry.last_access = now;
        if self.policy.sliding {
            entry.updated_at = now;
        }
        Some(entry.payload.clone())
    }

    /// Replace an entry's payload under the store lock.
    ///
    /// Returns `false` if the entry is missing or expired.
    pub fn modify<F>(&self, key: &K, f: F) -> bool
    where
        F: FnOnce(&V) -> V,
    {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        sweep_locked(&mut entries, self.policy.ttl, now);
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        entry.payload = f(&entry.payload);
        entry.updated_at = now;
        entry.last_access = now;
        true
    }

    /// Remove an entry, returning its payload
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().remove(key).map(|e| e.payload)
    }

    /// Drop every expired entry now
    pub fn sweep(&self) {
        let now = Instant::now();
        sweep_locked(&mut self.entries.lock(), self.policy.ttl, now);
    }

    /// Number of stored entries, expired ones included until the next sweep
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the store holds no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Expiration policy of this store
    #[must_use]
    pub const fn policy(&self) -> TtlPolicy {
        self.policy
    }
}

fn sweep_locked<K, V>(entries: &mut HashMap<K, Entry<V>>, ttl: Duration, now: Instant) {
    entries.retain(|_, e| now.saturating_duration_since(e.updated_at) <= ttl);
}

fn evict_lru_locked<K: Eq + Hash + Clone, V>(entries: &mut HashMap<K, Entry<V>>, max: usize) {
    while entries.len() > max {
        let oldest = entries
            .iter()
            .min_by_key(|(_, e)| e.last_access)
            .map(|(k, _)| k.clone());
        match oldest {
            Some(key) => {
                entries.remove(&key);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TTL: Duration = Duration::from_secs(600);
    const EPS: Duration = Duration::from_secs(1);

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let store = TtlStore::new(TtlPolicy::fixed(TTL));
        store.put("k", 1);

        tokio::time::advance(TTL - EPS).await;
        assert_eq!(store.get(&"k"), Some(1));

        tokio::time::advance(EPS + EPS).await;
        assert_eq!(store.get(&"k"), None);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fixed_ttl_is_not_renewed_by_reads() {
        let store = TtlStore::new(TtlPolicy::fixed(TTL));
        store.put("k", 1);

        tokio::time::advance(TTL / 2).await;
        assert_eq!(store.get(&"k"), Some(1));
        tokio::time::advance(TTL / 2 + EPS).await;
        assert_eq!(store.get(&"k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn sliding_ttl_is_renewed_by_reads() {
        let store = TtlStore::new(TtlPolicy::sliding(TTL));
        store.put("k", 1);

        for _ in 0..5 {
            tokio::time::advance(TTL - EPS).await;
            assert_eq!(store.get(&"k"), Some(1));
        }

        tokio::time::advance(TTL + EPS).await;
        assert_eq!(store.get(&"k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn put_sweeps_other_expired_entries() {
        let store = TtlStore::new(TtlPolicy::fixed(TTL));
        store.put("old", 1);
        tokio::time::advance(TTL + EPS).await;

        store.put("new", 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lru_evicts_least_recently_accessed() {
        let store = TtlStore::new(TtlPolicy::sliding(TTL).with_max_entries(2));
        store.put("a", 1);
        tokio::time::advance(EPS).await;
        store.put("b", 2);
        tokio::time::advance(EPS).await;

        // touching "a" makes "b" the eviction candidate
        assert_eq!(store.get(&"a"), Some(1));
        tokio::time::advance(EPS).await;
        store.put("c", 3);

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&"b"), None);
        assert_eq!(store.get(&"a"), Some(1));
        assert_eq!(store.get(&"c"), Some(3));
    }

    #[test]
    fn modify_replaces_payload() {
        let store = TtlStore::new(TtlPolicy::fixed(TTL));
        store.put("k", vec![1]);
        assert!(store.modify(&"k", |v| {
            let mut v = v.clone();
            v.push(2);
            v
        }));
        assert_eq!(store.get(&"k"), Some(vec![1, 2]));
        assert!(!store.modify(&"missing", Clone::clone));
    }

    proptest! {
        #[test]
        fn capped_store_never_exceeds_max(max in 1usize..8, keys in proptest::collection::vec(0u8..32, 0..64)) {
            let store = TtlStore::new(TtlPolicy::sliding(TTL).with_max_entries(max));
            for k in keys {
                store.put(k, ());
                prop_assert!(store.len() <= max);
            }
        }
    }
}
