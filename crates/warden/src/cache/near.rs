//! Near-cache: bounded, short-lived local copies of recently read entries.

use moka::Expiry;
use moka::sync::Cache;
use std::hash::Hash;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct NearEntry<V> {
    value: V,
    /// Expiry of the underlying cache entry
    expires_at: Instant,
}

/// Caps each copy at the remaining TTL of the entry it copies
struct EntryDeadline;

impl<K, V> Expiry<K, NearEntry<V>> for EntryDeadline {
    fn expire_after_create(
        &self,
        _key: &K,
        entry: &NearEntry<V>,
        created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.expires_at.saturating_duration_since(created_at))
    }
}

/// Local read-through layer in front of a replicated cache.
///
/// Entries live for at most `lifespan` and never past the TTL of the entry
/// they copy. A zero lifespan or capacity disables the layer.
pub struct NearCache<K, V> {
    entries: Option<Cache<K, NearEntry<V>>>,
}

impl<K, V> NearCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(lifespan: Duration, max_entries: usize) -> Self {
        let entries = (!lifespan.is_zero() && max_entries > 0).then(|| {
            Cache::builder()
                .max_capacity(u64::try_from(max_entries).unwrap_or(u64::MAX))
                .time_to_live(lifespan)
                .expire_after(EntryDeadline)
                .build()
        });
        Self { entries }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.as_ref()?;
        let entry = entries.get(key)?;
        // Expiry is checked lazily by the cache; never serve past the entry TTL
        if Instant::now() >= entry.expires_at {
            entries.invalidate(key);
            return None;
        }
        Some(entry.value)
    }

    pub fn insert(&self, key: K, value: V, expires_at: Instant) {
        let Some(entries) = self.entries.as_ref() else {
            return;
        };
        if Instant::now() >= expires_at {
            return;
        }
        entries.insert(key, NearEntry { value, expires_at });
    }

    pub fn invalidate(&self, key: &K) {
        if let Some(entries) = self.entries.as_ref() {
            entries.invalidate(key);
        }
    }

    pub fn clear(&self) {
        if let Some(entries) = self.entries.as_ref() {
            entries.invalidate_all();
        }
    }

    /// Run pending evictions and drop expired copies
    pub fn purge(&self) {
        if let Some(entries) = self.entries.as_ref() {
            entries.run_pending_tasks();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| {
            entries.run_pending_tasks();
            usize::try_from(entries.entry_count()).unwrap_or(usize::MAX)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn serves_fresh_copies() {
        let near = NearCache::new(Duration::from_secs(5), 10);
        near.insert(1u64, "a".to_string(), far());
        assert_eq!(near.get(&1), Some("a".to_string()));
        near.invalidate(&1);
        assert_eq!(near.get(&1), None);
    }

    #[test]
    fn never_outlives_the_entry_ttl() {
        let near = NearCache::new(Duration::from_secs(5), 10);
        near.insert(1u64, "a".to_string(), Instant::now());
        assert_eq!(near.get(&1), None);
        assert!(near.is_empty());

        near.insert(2u64, "b".to_string(), Instant::now() + Duration::from_millis(20));
        assert_eq!(near.get(&2), Some("b".to_string()));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(near.get(&2), None);
    }

    #[test]
    fn lifespan_bounds_copies() {
        let near = NearCache::new(Duration::from_millis(20), 10);
        near.insert(1u64, "a".to_string(), far());
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(near.get(&1), None);
    }

    #[test]
    fn capacity_is_bounded() {
        let near = NearCache::new(Duration::from_secs(5), 10);
        for key in 0..100u64 {
            near.insert(key, key.to_string(), far());
        }
        assert!(near.len() <= 10);
    }

    #[test]
    fn clear_drops_everything() {
        let near = NearCache::new(Duration::from_secs(5), 10);
        near.insert(1u64, "a", far());
        near.insert(2u64, "b", far());
        near.clear();
        assert_eq!(near.get(&1), None);
        assert_eq!(near.get(&2), None);
    }

    #[test]
    fn zero_lifespan_disables() {
        let near = NearCache::new(Duration::ZERO, 10);
        near.insert(1u64, "a", far());
        assert_eq!(near.get(&1), None);
        assert!(near.is_empty());
    }
}
