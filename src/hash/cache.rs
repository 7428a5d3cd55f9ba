//! Process-lifetime fast path digest cache

use super::Digest;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe mapping from path to `(content, metadata)` digests.
///
/// A lookup passes only when the caller's freshly computed metadata digest
/// matches the stored one; anything else is a miss and the caller re-hashes
/// content. Cleared at session end.
pub struct FastHashCache {
    entries: DashMap<PathBuf, CachedDigests>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Clone, Copy)]
struct CachedDigests {
    content: Digest,
    metadata: Digest,
}

/// Hit/miss counters for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FastHashCacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that forced a content re-hash
    pub misses: u64,
    /// Entries currently held
    pub entries: usize,
}

impl FastHashCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        FastHashCache {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached content digest when the metadata digest still
    /// matches.
    pub fn lookup(&self, path: &Path, metadata: &Digest) -> Option<Digest> {
        if let Some(entry) = self.entries.get(path) {
            if entry.metadata == *metadata {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.content);
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or refresh the digests for a path.
    pub fn store(&self, path: &Path, content: Digest, metadata: Digest) {
        self.entries
            .insert(path.to_path_buf(), CachedDigests { content, metadata });
    }

    /// Drop every entry. Counters are kept for end-of-session reporting.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of cached paths.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Current counters.
    pub fn stats(&self) -> FastHashCacheStats {
        FastHashCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

impl Default for FastHashCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(seed: &str) -> Digest {
        Digest::from(blake3::hash(seed.as_bytes()))
    }

    #[test]
    fn test_lookup_requires_matching_metadata() {
        let cache = FastHashCache::new();
        let path = Path::new("src/main.py");
        cache.store(path, digest("content"), digest("meta-v1"));

        assert_eq!(
            cache.lookup(path, &digest("meta-v1")),
            Some(digest("content"))
        );
        assert_eq!(cache.lookup(path, &digest("meta-v2")), None);
    }

    #[test]
    fn test_miss_on_unknown_path() {
        let cache = FastHashCache::new();
        assert_eq!(cache.lookup(Path::new("unknown"), &digest("m")), None);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_store_overwrites() {
        let cache = FastHashCache::new();
        let path = Path::new("lib.rs");
        cache.store(path, digest("old"), digest("m1"));
        cache.store(path, digest("new"), digest("m2"));

        assert_eq!(cache.lookup(path, &digest("m1")), None);
        assert_eq!(cache.lookup(path, &digest("m2")), Some(digest("new")));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear_empties() {
        let cache = FastHashCache::new();
        cache.store(Path::new("a"), digest("a"), digest("am"));
        cache.clear();
        assert!(cache.is_empty());
    }
}
