use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;

use crate::clock::Clock;
use crate::model::Ms;

/// Key/value cache where every entry carries an absolute expiry.
///
/// Entries are dead once `now >= expires_at` and are dropped lazily on the
/// next lookup, the same way holds expire. `purge_expired` reclaims the rest.
pub struct TtlCache<K, V> {
    entries: DashMap<K, (V, Ms)>,
    ttl_ms: Ms,
    clock: Arc<dyn Clock>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl_ms: Ms, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_ms,
            clock,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now_ms();
        let hit = self.entries.get(key).and_then(|entry| {
            let (value, expires_at) = entry.value();
            (*expires_at > now).then(|| value.clone())
        });
        if hit.is_none() {
            self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        }
        hit
    }

    pub fn insert(&self, key: K, value: V) {
        let expires_at = self.clock.now_ms() + self.ttl_ms;
        self.entries.insert(key, (value, expires_at));
    }

    /// Return the cached value or compute, store and return a fresh one.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: K,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(v) = self.get(&key) {
            return Ok(v);
        }
        let value = compute()?;
        self.insert(key, value.clone());
        Ok(value)
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn cache(ttl: Ms) -> (Arc<ManualClock>, TtlCache<&'static str, u32>) {
        let clock = Arc::new(ManualClock::new(10_000));
        let cache = TtlCache::new(ttl, clock.clone() as Arc<dyn Clock>);
        (clock, cache)
    }

    #[test]
    fn entry_lives_until_ttl() {
        let (clock, cache) = cache(1_000);
        cache.insert("a", 1);
        clock.advance(999);
        assert_eq!(cache.get(&"a"), Some(1));
        clock.advance(1);
        assert_eq!(cache.get(&"a"), None);
        // expired entry already dropped on lookup
        assert_eq!(cache.purge_expired(), 0);
    }

    #[test]
    fn get_or_try_insert_with_computes_once() {
        let (_clock, cache) = cache(1_000);
        let mut calls = 0;
        let v: Result<u32, ()> = cache.get_or_try_insert_with("k", || {
            calls += 1;
            Ok(7)
        });
        assert_eq!(v, Ok(7));
        let v: Result<u32, ()> = cache.get_or_try_insert_with("k", || {
            calls += 1;
            Ok(8)
        });
        assert_eq!(v, Ok(7));
        assert_eq!(calls, 1);
    }

    #[test]
    fn failed_compute_is_not_cached() {
        let (_clock, cache) = cache(1_000);
        let v: Result<u32, &str> = cache.get_or_try_insert_with("k", || Err("upstream down"));
        assert!(v.is_err());
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn invalidate_and_purge() {
        let (clock, cache) = cache(100);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.invalidate(&"a");
        assert_eq!(cache.get(&"a"), None);
        clock.advance(100);
        cache.insert("c", 3);
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.get(&"c"), Some(3));
    }
}
