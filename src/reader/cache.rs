//! Shared name-to-ordinal cache keyed by query shape.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, PoisonError, RwLock};
use tracing::debug;

/// Resolved column ordinals for one query shape, filled lazily by readers.
#[derive(Debug, Default)]
pub struct ShapeOrdinals {
    ordinals: RwLock<HashMap<String, usize>>,
}

impl ShapeOrdinals {
    pub fn get(&self, name: &str) -> Option<usize> {
        self.ordinals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
    }

    /// Record `name` unless already present; returns the stored ordinal.
    pub fn insert(&self, name: &str, ordinal: usize) -> usize {
        *self
            .ordinals
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_insert(ordinal)
    }

    pub fn len(&self) -> usize {
        self.ordinals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Thread-safe cache of [`ShapeOrdinals`] shared across reader instances.
///
/// Entries are never evicted; [`OrdinalCache::clear`] drops all of them. A
/// bounded cache stops sharing once full: readers asking for a new key get a
/// private entry that is not retained.
#[derive(Debug, Default)]
pub struct OrdinalCache {
    shapes: RwLock<HashMap<String, Arc<ShapeOrdinals>>>,
    max_shapes: Option<usize>,
}

static GLOBAL: LazyLock<OrdinalCache> = LazyLock::new(OrdinalCache::new);

impl OrdinalCache {
    /// An unbounded cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cache that retains at most `max_shapes` query shapes.
    pub fn bounded(max_shapes: usize) -> Self {
        Self {
            shapes: RwLock::default(),
            max_shapes: Some(max_shapes),
        }
    }

    /// The process-wide cache (unbounded).
    pub fn global() -> &'static OrdinalCache {
        &GLOBAL
    }

    /// Fetch the entry for `key`, inserting an empty one if absent.
    pub fn entry(&self, key: &str) -> Arc<ShapeOrdinals> {
        if let Some(shape) = self
            .shapes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
        {
            return Arc::clone(shape);
        }

        let mut shapes = self.shapes.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(shape) = shapes.get(key) {
            return Arc::clone(shape);
        }
        if self.max_shapes.is_some_and(|max| shapes.len() >= max) {
            debug!(key, "Ordinal cache full, using an unshared entry");
            return Arc::new(ShapeOrdinals::default());
        }
        Arc::clone(shapes.entry(key.to_string()).or_default())
    }

    /// Number of shapes retained.
    pub fn len(&self) -> usize {
        self.shapes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.shapes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_entry_is_shared_per_key() {
        let cache = OrdinalCache::new();
        let a = cache.entry("orders");
        a.insert("id", 0);
        let b = cache.entry("orders");
        assert_eq!(b.get("id"), Some(0));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(cache.entry("customers").is_empty());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_insert_keeps_first_ordinal() {
        let shape = ShapeOrdinals::default();
        assert_eq!(shape.insert("id", 0), 0);
        assert_eq!(shape.insert("id", 3), 0);
        assert_eq!(shape.len(), 1);
    }

    #[test]
    fn test_bounded_cache_stops_sharing() {
        let cache = OrdinalCache::bounded(1);
        let first = cache.entry("a");
        first.insert("x", 1);
        let other = cache.entry("b");
        other.insert("y", 2);
        assert_eq!(cache.len(), 1);
        assert!(cache.entry("b").is_empty());
        assert_eq!(cache.entry("a").get("x"), Some(1));
    }

    #[test]
    fn test_clear() {
        let cache = OrdinalCache::new();
        cache.entry("a");
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_insert_or_fetch() {
        let cache = Arc::new(OrdinalCache::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    let shape = cache.entry("shared");
                    shape.insert("col", i)
                })
            })
            .collect();
        let stored: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(cache.len(), 1);
        assert!(stored.windows(2).all(|w| w[0] == w[1]));
    }
}
