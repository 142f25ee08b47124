use std::hash::Hash;
use std::num::NonZeroUsize;

use parking_lot::Mutex;

/// Capacity-bounded key-value map with least-recently-used eviction.
///
/// `put` and `get` both count as a use. When an insert would exceed the
/// capacity, the least recently used entry is evicted and the eviction
/// callback is invoked with the evicted pair on the calling thread.
/// Explicit `remove` and `clear` never invoke the callback.
pub struct LruCache<K, V> {
    inner: Mutex<lru::LruCache<K, V>>,
    on_evict: Box<dyn Fn(K, V) + Send + Sync>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize, on_evict: impl Fn(K, V) + Send + Sync + 'static) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("cache capacity must be non-zero");
        Self {
            inner: Mutex::new(lru::LruCache::new(capacity)),
            on_evict: Box::new(on_evict),
        }
    }

    /// Inserts or updates an entry, making it the most recently used one.
    ///
    /// Updating an existing key never evicts.
    pub fn put(&self, key: K, value: V) {
        let evicted = {
            let mut inner = self.inner.lock();
            match inner.push(key.clone(), value) {
                // An entry for the same key was replaced, not evicted.
                Some((old_key, _)) if old_key == key => None,
                other => other
            }
        };
        // The callback runs outside the lock so that it may touch the cache.
        if let Some((key, value)) = evicted {
            (self.on_evict)(key, value);
        }
    }

    /// Returns a copy of the value and marks the entry as most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    pub fn has_key(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    /// Removes the entry, returning whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        self.inner.lock().pop(key).is_some()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn eviction_order() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = evicted.clone();
        let cache = LruCache::new(3, move |k: u32, v: u32| sink.lock().push((k, v)));
        cache.put(1, 10);
        assert_eq!(cache.len(), 1);
        cache.put(2, 20);
        cache.put(3, 30);
        assert_eq!(cache.len(), 3);
        assert!(evicted.lock().is_empty());

        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&3), Some(30));

        // 1 is the least recently used entry after the reads above
        cache.put(4, 40);
        assert_eq!(evicted.lock().as_slice(), &[(1, 10)]);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.get(&4), Some(40));
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&3), Some(30));

        cache.put(5, 50);
        assert_eq!(cache.len(), 3);

        assert!(cache.remove(&3));
        cache.put(6, 60);
        assert_eq!(cache.get(&3), None);
        assert_eq!(cache.get(&4), None);
        assert_eq!(cache.get(&2), Some(20));
        assert_eq!(cache.get(&5), Some(50));
        assert_eq!(cache.get(&6), Some(60));
    }

    #[test]
    fn update_does_not_evict() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = evictions.clone();
        let cache = LruCache::new(2, move |_k: u32, _v: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        cache.put(1, 10);
        cache.put(2, 20);
        assert_eq!(evictions.load(Ordering::SeqCst), 0);
        cache.put(3, 30);
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        cache.put(2, 200);
        assert_eq!(evictions.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 2);

        assert!(!cache.has_key(&1));
        assert_eq!(cache.get(&2), Some(200));
        assert_eq!(cache.get(&3), Some(30));

        cache.put(4, 40);
        assert_eq!(evictions.load(Ordering::SeqCst), 2);
        assert!(!cache.has_key(&2));
        assert_eq!(cache.get(&3), Some(30));
        assert_eq!(cache.get(&4), Some(40));

        assert!(cache.remove(&4));
        assert_eq!(cache.len(), 1);
        cache.put(2, 2000);
        assert!(!cache.has_key(&4));
        assert_eq!(cache.get(&3), Some(30));
        assert_eq!(cache.get(&2), Some(2000));

        assert!(cache.remove(&2));
        assert!(cache.remove(&3));
        cache.put(5, 50);
        cache.put(1, 100);
        cache.put(1, 1000);
        assert_eq!(cache.len(), 2);
        assert_eq!(evictions.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get(&1), Some(1000));
        assert_eq!(cache.get(&5), Some(50));
    }

    #[test]
    fn read_refreshes_entry() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = evicted.clone();
        let cache = LruCache::new(3, move |k: u32, v: u32| sink.lock().push((k, v)));
        cache.put(1, 10);
        cache.put(2, 20);
        cache.put(3, 30);
        assert_eq!(cache.get(&1), Some(10));
        cache.put(4, 40);
        assert_eq!(evicted.lock().as_slice(), &[(2, 20)]);
        assert!(cache.has_key(&1));
        assert!(cache.has_key(&3));
        assert!(cache.has_key(&4));
    }

    #[test]
    fn remove_does_not_fire_callback() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let counter = evictions.clone();
        let cache = LruCache::new(10, move |_k: i32, _v: i32| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        for key in 0..=30 {
            cache.put(key, key * 100);
        }
        for key in 0..=20 {
            assert!(!cache.has_key(&key));
        }
        for key in 21..=30 {
            assert!(cache.has_key(&key));
        }
        assert_eq!(evictions.load(Ordering::SeqCst), 21);
        for key in 21..=30 {
            assert!(cache.remove(&key));
        }
        for key in 21..=30 {
            assert!(!cache.has_key(&key));
        }
        assert_eq!(evictions.load(Ordering::SeqCst), 21);
        assert!(cache.is_empty());
    }

    #[test]
    fn clear_resets() {
        let cache = LruCache::new(10, |_k: i32, _v: i32| {});
        for key in 0..10 {
            cache.put(key, key * 100);
        }
        cache.clear();
        for key in 0..10 {
            assert!(!cache.has_key(&key));
        }
        for key in 0..10 {
            cache.put(key, key * 1000);
        }
        for key in 0..10 {
            assert!(cache.has_key(&key));
        }
    }

    #[test]
    fn concurrent_access() {
        let cache = Arc::new(LruCache::new(100, |_k: i32, _v: i32| {}));
        let workers: Vec<_> = (0..100)
            .map(|key| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    cache.put(key, key);
                    assert!(cache.has_key(&key));
                    assert!(cache.remove(&key));
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(cache.len(), 0);
    }
}
