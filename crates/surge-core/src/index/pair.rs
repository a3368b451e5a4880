//! Bijective key ↔ value map.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::RwLock;

struct PairInner<K, V> {
    forward: HashMap<K, V>,
    reverse: HashMap<V, K>,
}

/// A one-to-one reversible mapping.
///
/// The forward and reverse maps are always mutually consistent: whenever
/// both lookups succeed, `get_by_value(get_by_key(k)) == k` and vice versa.
/// `put` evicts any prior pairing involving either the key or the value.
pub struct PairIndex<K, V> {
    inner: RwLock<PairInner<K, V>>,
}

impl<K, V> PairIndex<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PairInner {
                forward: HashMap::new(),
                reverse: HashMap::new(),
            }),
        }
    }

    /// Pair `key` with `value`, evicting any prior pairing of either side.
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.write();
        if let Some(old_value) = inner.forward.remove(&key) {
            inner.reverse.remove(&old_value);
        }
        if let Some(old_key) = inner.reverse.remove(&value) {
            inner.forward.remove(&old_key);
        }
        inner.forward.insert(key.clone(), value.clone());
        inner.reverse.insert(value, key);
    }

    /// Remove the pairing for `key`, returning its value if present.
    pub fn remove_by_key(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.write();
        let value = inner.forward.remove(key)?;
        inner.reverse.remove(&value);
        Some(value)
    }

    /// Remove the pairing for `value`, returning its key if present.
    pub fn remove_by_value(&self, value: &V) -> Option<K> {
        let mut inner = self.inner.write();
        let key = inner.reverse.remove(value)?;
        inner.forward.remove(&key);
        Some(key)
    }

    #[must_use]
    pub fn get_by_key(&self, key: &K) -> Option<V> {
        self.inner.read().forward.get(key).cloned()
    }

    #[must_use]
    pub fn get_by_value(&self, value: &V) -> Option<K> {
        self.inner.read().reverse.get(value).cloned()
    }

    /// Look up many keys under one read lock. Misses come back as `None`
    /// at their input position.
    #[must_use]
    pub fn get_many(&self, keys: &[K]) -> Vec<Option<V>> {
        let inner = self.inner.read();
        keys.iter().map(|k| inner.forward.get(k).cloned()).collect()
    }

    /// All paired values.
    #[must_use]
    pub fn values(&self) -> Vec<V> {
        self.inner.read().forward.values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().forward.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().forward.is_empty()
    }
}

impl<K, V> Default for PairIndex<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_round_trip() {
        let index: PairIndex<i64, String> = PairIndex::new();

        index.put(1, "a".to_string());
        index.put(2, "b".to_string());

        assert_eq!(index.get_by_key(&1), Some("a".to_string()));
        assert_eq!(index.get_by_value(&"b".to_string()), Some(2));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_put_overwrites_both_sides() {
        let index: PairIndex<i64, String> = PairIndex::new();

        index.put(1, "a".to_string());
        // re-pairing the key evicts the old value entirely
        index.put(1, "b".to_string());
        assert_eq!(index.get_by_value(&"a".to_string()), None);
        assert_eq!(index.get_by_key(&1), Some("b".to_string()));

        // re-pairing the value evicts the old key entirely
        index.put(2, "b".to_string());
        assert_eq!(index.get_by_key(&1), None);
        assert_eq!(index.get_by_value(&"b".to_string()), Some(2));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_bijection_invariant() {
        let index: PairIndex<i64, String> = PairIndex::new();

        index.put(1, "a".to_string());
        index.put(2, "b".to_string());
        index.put(2, "c".to_string());
        index.remove_by_key(&1);
        index.put(3, "c".to_string());

        for key in [1i64, 2, 3] {
            if let Some(value) = index.get_by_key(&key) {
                assert_eq!(index.get_by_value(&value), Some(key));
            }
        }
        for value in ["a", "b", "c"] {
            if let Some(key) = index.get_by_value(&value.to_string()) {
                assert_eq!(index.get_by_key(&key), Some(value.to_string()));
            }
        }
    }

    #[test]
    fn test_remove_either_side() {
        let index: PairIndex<i64, String> = PairIndex::new();
        index.put(1, "a".to_string());
        index.put(2, "b".to_string());

        assert_eq!(index.remove_by_key(&1), Some("a".to_string()));
        assert_eq!(index.get_by_value(&"a".to_string()), None);
        assert_eq!(index.remove_by_key(&1), None);

        assert_eq!(index.remove_by_value(&"b".to_string()), Some(2));
        assert_eq!(index.get_by_key(&2), None);
        assert!(index.is_empty());
    }

    #[test]
    fn test_get_many_preserves_positions() {
        let index: PairIndex<i64, String> = PairIndex::new();
        index.put(1, "a".to_string());
        index.put(3, "c".to_string());

        let values = index.get_many(&[1, 2, 3]);
        assert_eq!(
            values,
            vec![Some("a".to_string()), None, Some("c".to_string())]
        );
    }
}
