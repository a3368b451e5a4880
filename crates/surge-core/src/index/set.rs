//! Bidirectional many-to-many index.

use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use parking_lot::RwLock;

struct SetInner<K, T> {
    forward: HashMap<K, HashSet<T>>,
    reverse: HashMap<T, HashSet<K>>,
}

/// Keys tagged with sets of tags, queryable from both directions.
///
/// A key appears in a tag's reverse set iff that tag appears in the key's
/// forward set. Empty sets are dropped from both maps the moment they
/// empty, so `all_tags`/`all_keys` never report dangling entries.
/// Operations on absent keys or tags are no-ops that report not-found.
pub struct SetIndex<K, T> {
    inner: RwLock<SetInner<K, T>>,
}

impl<K, T> SetIndex<K, T>
where
    K: Eq + Hash + Clone,
    T: Eq + Hash + Clone,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SetInner {
                forward: HashMap::new(),
                reverse: HashMap::new(),
            }),
        }
    }

    /// Tag `key` with every tag in `tags`.
    pub fn add_tags(&self, key: &K, tags: &[T]) {
        if tags.is_empty() {
            return;
        }
        let mut inner = self.inner.write();
        let tag_set = inner.forward.entry(key.clone()).or_default();
        for tag in tags {
            tag_set.insert(tag.clone());
        }
        for tag in tags {
            inner
                .reverse
                .entry(tag.clone())
                .or_default()
                .insert(key.clone());
        }
    }

    /// Remove the given tags from `key`. Returns `false` when the key is
    /// absent.
    pub fn remove_tags(&self, key: &K, tags: &[T]) -> bool {
        let mut inner = self.inner.write();
        let Some(tag_set) = inner.forward.get_mut(key) else {
            return false;
        };
        for tag in tags {
            tag_set.remove(tag);
        }
        if tag_set.is_empty() {
            inner.forward.remove(key);
        }
        for tag in tags {
            if let Some(key_set) = inner.reverse.get_mut(tag) {
                key_set.remove(key);
                if key_set.is_empty() {
                    inner.reverse.remove(tag);
                }
            }
        }
        true
    }

    /// The tags on `key`, if any.
    #[must_use]
    pub fn tags_of<Q>(&self, key: &Q) -> Option<Vec<T>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.inner
            .read()
            .forward
            .get(key)
            .map(|tags| tags.iter().cloned().collect())
    }

    /// The keys carrying `tag`, if any.
    #[must_use]
    pub fn keys_of<Q>(&self, tag: &Q) -> Option<Vec<K>>
    where
        T: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.inner
            .read()
            .reverse
            .get(tag)
            .map(|keys| keys.iter().cloned().collect())
    }

    /// The concatenated members of several tags, resolved under one read
    /// lock.
    ///
    /// A key carrying more than one of the tags appears once per tag; this
    /// backs "send once per channel" broadcast semantics, not "send once
    /// per recipient".
    #[must_use]
    pub fn keys_of_any(&self, tags: &[T]) -> Vec<K> {
        let inner = self.inner.read();
        let mut keys = Vec::new();
        for tag in tags {
            if let Some(key_set) = inner.reverse.get(tag) {
                keys.extend(key_set.iter().cloned());
            }
        }
        keys
    }

    #[must_use]
    pub fn all_tags(&self) -> Vec<T> {
        self.inner.read().reverse.keys().cloned().collect()
    }

    #[must_use]
    pub fn all_keys(&self) -> Vec<K> {
        self.inner.read().forward.keys().cloned().collect()
    }

    #[must_use]
    pub fn contains_tag<Q>(&self, tag: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.inner.read().reverse.contains_key(tag)
    }

    /// Drop `key` from every tag's reverse set and forget it. Idempotent;
    /// returns `false` when the key was already absent.
    pub fn remove_key(&self, key: &K) -> bool {
        let mut inner = self.inner.write();
        let Some(tag_set) = inner.forward.remove(key) else {
            return false;
        };
        for tag in &tag_set {
            if let Some(key_set) = inner.reverse.get_mut(tag) {
                key_set.remove(key);
                if key_set.is_empty() {
                    inner.reverse.remove(tag);
                }
            }
        }
        true
    }

    /// Symmetric counterpart of [`SetIndex::remove_key`].
    pub fn remove_tag(&self, tag: &T) -> bool {
        let mut inner = self.inner.write();
        let Some(key_set) = inner.reverse.remove(tag) else {
            return false;
        };
        for key in &key_set {
            if let Some(tag_set) = inner.forward.get_mut(key) {
                tag_set.remove(tag);
                if tag_set.is_empty() {
                    inner.forward.remove(key);
                }
            }
        }
        true
    }
}

impl<K, T> Default for SetIndex<K, T>
where
    K: Eq + Hash + Clone,
    T: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
