use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// Fixed-capacity map with first-in, first-out eviction.
///
/// Used to memoize lookups that are repeated many times within one run, such
/// as resolving the script that creates a given object. Reads go through
/// `peek` so they never refresh an entry's position.
#[derive(Debug)]
pub struct LimitedCache<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
}

impl<K, V> LimitedCache<K, V>
where
    K: Hash + Eq,
{
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        LimitedCache {
            entries: LruCache::new(capacity),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.peek(key)
    }

    /// Inserts or replaces `key`. Replacing keeps the key's original position in
    /// the eviction order; inserting a new key into a full cache evicts the
    /// oldest entry first.
    pub fn set(&mut self, key: K, value: V) {
        if let Some(existing) = self.entries.peek_mut(&key) {
            *existing = value;
            return;
        }
        self.entries.push(key, value);
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }
}
