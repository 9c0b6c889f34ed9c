use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

/// In-process typed key-value store with prefix listing.
///
/// Per-key operations are atomic and last-writer-wins; values are opaque to
/// the cache. Clones share the underlying map.
#[derive(Debug)]
pub struct Cache<T> {
    inner: Arc<RwLock<HashMap<String, T>>>,
}

impl<T> Clone for Cache<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Cache<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl<T: Clone> Cache<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn set(&self, key: impl Into<String>, value: T) {
        self.inner.write().insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.inner.read().get(key).cloned()
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.write().remove(key).is_some()
    }

    /// Returns all entries whose key begins with `prefix`. Order is
    /// unspecified.
    pub fn list(&self, prefix: &str) -> Vec<(String, T)> {
        self.inner
            .read()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_overwrite() {
        let cache = Cache::new();
        assert_eq!(cache.get("a"), None);

        cache.set("a", 1);
        assert_eq!(cache.get("a"), Some(1));

        cache.set("a", 2);
        assert_eq!(cache.get("a"), Some(2));
    }

    #[test]
    fn delete_removes_entry() {
        let cache = Cache::new();
        cache.set("a", 1);

        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn list_filters_by_prefix() {
        let cache = Cache::new();
        cache.set("c1/s1", 1);
        cache.set("c1/s2", 2);
        cache.set("c2/s1", 3);

        let mut entries = cache.list("c1/");
        entries.sort();
        assert_eq!(
            entries,
            vec![("c1/s1".to_string(), 1), ("c1/s2".to_string(), 2)]
        );
        assert!(cache.list("c3/").is_empty());
    }

    #[test]
    fn clones_share_the_map() {
        let cache = Cache::new();
        let other = cache.clone();
        cache.set("a", 1);
        assert_eq!(other.get("a"), Some(1));
    }
}
