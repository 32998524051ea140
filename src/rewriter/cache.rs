//! Process-wide method info cache shared by all rewriters.
//!
//! Cached lookups emitted by [`crate::MethodRewriter::load_method_info`] identify the method
//! they want by a key built from class name, method name and an identifier chosen by the
//! caller, so overloads sharing a class and method name end up with distinct entries. The
//! cache maps every key to what is needed to resolve it, and keeps the first value stored
//! per key; concurrent rewrites registering the same key resolve redundantly, but agree on
//! one result.

use std::{fmt, sync::OnceLock};

use dashmap::DashMap;

use crate::Result;

/// Key of a cached method lookup
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodInfoCacheKey(String);

impl MethodInfoCacheKey {
    /// Build the key for `method_name` of `class_name`, disambiguated by `function_id`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use ilweave::rewriter::MethodInfoCacheKey;
    ///
    /// let key = MethodInfoCacheKey::new("Sample.Tracer", "Enter", 0x0600_0012);
    /// assert_eq!(key.as_str(), "Sample.Tracer.Enter_100663314");
    /// ```
    #[must_use]
    pub fn new(class_name: &str, method_name: &str, function_id: u32) -> Self {
        MethodInfoCacheKey(format!("{class_name}.{method_name}_{function_id}"))
    }

    /// The key as emitted into the rewritten code
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MethodInfoCacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a cached method is resolved from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodLookup {
    /// Path of the assembly defining the class
    pub assembly_path: String,
    /// Full name of the class
    pub class_name: String,
    /// Name of the method
    pub method_name: String,
}

/// Concurrent, first-writer-wins store of resolved values.
pub struct MethodInfoCache<V> {
    entries: DashMap<MethodInfoCacheKey, V>,
}

impl<V: Clone> MethodInfoCache<V> {
    /// Create an empty cache
    #[must_use]
    pub fn new() -> Self {
        MethodInfoCache {
            entries: DashMap::new(),
        }
    }

    /// Returns the value stored for `key`, running `resolve` only if there is none yet.
    ///
    /// `resolve` runs without holding a lock on the map. If another thread stores a value
    /// for the same key in the meantime, that value wins and is returned.
    ///
    /// # Errors
    /// Returns the error of `resolve`; nothing is stored in that case.
    pub fn get_or_resolve<R>(&self, key: &MethodInfoCacheKey, resolve: R) -> Result<V>
    where
        R: FnOnce() -> Result<V>,
    {
        if let Some(existing) = self.entries.get(key) {
            return Ok(existing.value().clone());
        }

        let resolved = resolve()?;
        Ok(self
            .entries
            .entry(key.clone())
            .or_insert(resolved)
            .value()
            .clone())
    }

    /// The value stored for `key`
    pub fn get(&self, key: &MethodInfoCacheKey) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Number of stored keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is stored
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone> Default for MethodInfoCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodInfoCache<MethodLookup> {
    /// The cache shared by every rewriter of the process
    pub fn global() -> &'static MethodInfoCache<MethodLookup> {
        static GLOBAL: OnceLock<MethodInfoCache<MethodLookup>> = OnceLock::new();
        GLOBAL.get_or_init(MethodInfoCache::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn key_determinism() {
        let first = MethodInfoCacheKey::new("A.B", "Run", 1);
        let overload = MethodInfoCacheKey::new("A.B", "Run", 2);

        assert_ne!(first, overload);
        assert_eq!(first, MethodInfoCacheKey::new("A.B", "Run", 1));
        assert_eq!(first.to_string(), "A.B.Run_1");
    }

    #[test]
    fn resolves_once_per_key() {
        let cache = MethodInfoCache::<u32>::new();
        let calls = Cell::new(0);
        let key = MethodInfoCacheKey::new("A", "M", 0);

        for _ in 0..3 {
            let value = cache
                .get_or_resolve(&key, || {
                    calls.set(calls.get() + 1);
                    Ok(42)
                })
                .unwrap();
            assert_eq!(value, 42);
        }

        assert_eq!(calls.get(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_resolution_stores_nothing() {
        let cache = MethodInfoCache::<u32>::new();
        let key = MethodInfoCacheKey::new("A", "M", 0);

        let result = cache.get_or_resolve(&key, || Err(crate::Error::Tokenizer("A".into())));
        assert!(result.is_err());
        assert!(cache.is_empty());
        assert_eq!(cache.get_or_resolve(&key, || Ok(7)).unwrap(), 7);
    }

    #[test]
    fn first_writer_wins() {
        let cache = MethodInfoCache::<u32>::new();
        let key = MethodInfoCacheKey::new("A", "M", 0);

        // A racing writer stores its value while this resolution is in flight
        let value = cache
            .get_or_resolve(&key, || {
                cache.entries.insert(key.clone(), 1);
                Ok(2)
            })
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(cache.get(&key), Some(1));
    }
}
