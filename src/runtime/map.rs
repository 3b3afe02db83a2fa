//! Lock-guarded associative container used as the connection registry.
//!
//! Every operation takes the lock once, so individual operations are atomic
//! with respect to each other. Iteration works on a snapshot taken under the
//! read lock, which lets a visitor call back into the map (including deleting
//! the key it is visiting) without deadlocking.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Thread-safe map with snapshot iteration.
#[derive(Debug)]
pub struct ConcurrentMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> Default for ConcurrentMap<K, V> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> ConcurrentMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty map with room for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    // The map only holds plain data, so a panic in another holder cannot
    // leave it logically inconsistent.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a clone of the value stored under `key`.
    pub fn load(&self, key: &K) -> Option<V> {
        self.read().get(key).cloned()
    }

    /// Insert or overwrite `key`.
    pub fn store(&self, key: K, value: V) {
        self.write().insert(key, value);
    }

    /// Remove `key` if present.
    pub fn delete(&self, key: &K) {
        self.write().remove(key);
    }

    /// Store `value` under `key`, returning the previous value if there was one.
    pub fn swap(&self, key: K, value: V) -> Option<V> {
        self.write().insert(key, value)
    }

    /// Remove `key`, returning the value it held.
    pub fn load_and_delete(&self, key: &K) -> Option<V> {
        self.write().remove(key)
    }

    /// Return the existing value for `key` (and `true`), or store `value`
    /// and return it (and `false`).
    pub fn load_or_store(&self, key: K, value: V) -> (V, bool) {
        let mut map = self.write();
        if let Some(existing) = map.get(&key) {
            return (existing.clone(), true);
        }
        map.insert(key, value.clone());
        (value, false)
    }

    /// Copy every entry out under the read lock.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Visit every entry of a snapshot until `visitor` returns `false`.
    ///
    /// Mutations made by the visitor are not reflected in the current pass.
    /// Iteration order is unspecified.
    pub fn range<F>(&self, mut visitor: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for (key, value) in self.snapshot() {
            if !visitor(&key, &value) {
                break;
            }
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_map_operations() {
        let m = ConcurrentMap::with_capacity(5);

        m.store(1, 1000);
        assert_eq!(m.load(&1), Some(1000));
        assert_eq!(m.load(&0), None);

        m.delete(&1);
        assert!(m.is_empty());

        m.store(2, 2000);
        assert_eq!(m.swap(2, 2001), Some(2000));
        assert_eq!(m.swap(1, 1000), None);

        assert_eq!(m.load_and_delete(&1), Some(1000));
        assert_eq!(m.load_and_delete(&0), None);

        // Present key: existing value wins.
        assert_eq!(m.load_or_store(2, 2000), (2001, true));
        assert_eq!(m.load(&2), Some(2001));
        assert_eq!(m.load_or_store(1, 1000), (1000, false));

        let mut seen = HashMap::new();
        m.range(|k, v| {
            seen.insert(*k, *v);
            true
        });
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[&1], 1000);
        assert_eq!(seen[&2], 2001);
    }

    #[test]
    fn test_range_mutation_does_not_deadlock() {
        let m = ConcurrentMap::new();
        for k in 1..=8 {
            m.store(k, k * 101);
        }

        let mut visited = 0;
        m.range(|k, _| {
            visited += 1;
            if *k == 8 {
                m.delete(k);
            }
            m.store(100 + *k, 0);
            true
        });

        // The pass sees the snapshot, not the inserts made during it.
        assert_eq!(visited, 8);
        assert_eq!(m.load(&8), None);
        assert_eq!(m.len(), 7 + 8);
    }

    #[test]
    fn test_range_stops_early() {
        let m = ConcurrentMap::new();
        for k in 0..10 {
            m.store(k, ());
        }

        let mut visited = 0;
        m.range(|_, _| {
            visited += 1;
            visited < 3
        });
        assert_eq!(visited, 3);
    }

    #[test]
    fn test_concurrent_store_then_load() {
        let m = Arc::new(ConcurrentMap::new());
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for i in 0..500u64 {
                        let key = t * 1000 + i;
                        m.store(key, key * 2);
                        assert_eq!(m.load(&key), Some(key * 2));
                        m.range(|_, _| true);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(m.len(), 8 * 500);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Store(u8, u32),
        Delete(u8),
        Swap(u8, u32),
        LoadAndDelete(u8),
        LoadOrStore(u8, u32),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<u8>(), any::<u32>()).prop_map(|(k, v)| Op::Store(k, v)),
            any::<u8>().prop_map(Op::Delete),
            (any::<u8>(), any::<u32>()).prop_map(|(k, v)| Op::Swap(k, v)),
            any::<u8>().prop_map(Op::LoadAndDelete),
            (any::<u8>(), any::<u32>()).prop_map(|(k, v)| Op::LoadOrStore(k, v)),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_hashmap_model(ops in prop::collection::vec(op(), 0..200)) {
            let m = ConcurrentMap::new();
            let mut model = HashMap::new();

            for op in ops {
                match op {
                    Op::Store(k, v) => {
                        m.store(k, v);
                        model.insert(k, v);
                        prop_assert_eq!(m.load(&k), Some(v));
                    }
                    Op::Delete(k) => {
                        m.delete(&k);
                        model.remove(&k);
                    }
                    Op::Swap(k, v) => {
                        prop_assert_eq!(m.swap(k, v), model.insert(k, v));
                    }
                    Op::LoadAndDelete(k) => {
                        prop_assert_eq!(m.load_and_delete(&k), model.remove(&k));
                    }
                    Op::LoadOrStore(k, v) => {
                        let expected = match model.get(&k) {
                            Some(existing) => (*existing, true),
                            None => {
                                model.insert(k, v);
                                (v, false)
                            }
                        };
                        prop_assert_eq!(m.load_or_store(k, v), expected);
                    }
                }
            }

            let mut snapshot = m.snapshot();
            snapshot.sort_unstable();
            let mut expected: Vec<_> = model.into_iter().collect();
            expected.sort_unstable();
            prop_assert_eq!(snapshot, expected);
        }
    }
}
