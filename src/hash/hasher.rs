//! File, metadata, string-sequence, and batch hashing

use super::cache::FastHashCache;
use super::{backend, Digest, HashError, Result};
use rayon::prelude::*;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

const READ_BUF_SIZE: usize = 64 * 1024;

/// Content-addressed fingerprint computation.
///
/// Owns the process-lifetime [`FastHashCache`]; `hash_file_cached` consults
/// it with a metadata pre-check before falling back to a full content read.
pub struct Hasher {
    cache: FastHashCache,
}

impl Hasher {
    /// Create a hasher. Forces backend selection and the self-test on first
    /// construction in the process.
    pub fn new() -> Self {
        let _ = backend::selected();
        Hasher {
            cache: FastHashCache::new(),
        }
    }

    /// The fast path cache.
    pub fn cache(&self) -> &FastHashCache {
        &self.cache
    }

    /// Content digest of a file, streamed in 64 KiB chunks.
    pub fn hash_file(&self, path: &Path) -> Result<Digest> {
        let mut file = File::open(path).map_err(|source| HashError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut hasher = blake3::Hasher::new();
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            let n = file.read(&mut buf).map_err(|source| HashError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hasher.finalize().into())
    }

    /// Digest over (size, mtime, inode), used only as an optimistic
    /// pre-check. A matching metadata digest suggests unchanged content; a
    /// mismatch forces a content re-hash.
    pub fn hash_metadata(&self, path: &Path) -> Result<Digest> {
        let meta = std::fs::metadata(path).map_err(|source| HashError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| (d.as_secs(), d.subsec_nanos()))
            .unwrap_or((0, 0));

        let mut hasher = blake3::Hasher::new();
        hasher.update(&meta.len().to_be_bytes());
        hasher.update(&mtime.0.to_be_bytes());
        hasher.update(&mtime.1.to_be_bytes());
        hasher.update(&inode_of(&meta).to_be_bytes());
        Ok(hasher.finalize().into())
    }

    /// Digest over a length-prefixed concatenation of byte strings. The
    /// prefixing makes `["ab", "c"]` and `["a", "bc"]` distinct.
    pub fn hash_strings<I, B>(&self, items: I) -> Digest
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut hasher = blake3::Hasher::new();
        for item in items {
            let bytes = item.as_ref();
            hasher.update(&(bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        }
        hasher.finalize().into()
    }

    /// Batch file hashing, parallelized across the rayon pool. Results are
    /// in input order.
    pub fn hash_many(&self, paths: &[PathBuf]) -> Vec<Result<Digest>> {
        paths
            .par_iter()
            .map(|path| self.hash_file_cached(path))
            .collect()
    }

    /// Content digest through the fast path cache: if the stored metadata
    /// digest still matches, the cached content digest is returned without
    /// reading the file.
    pub fn hash_file_cached(&self, path: &Path) -> Result<Digest> {
        let metadata = self.hash_metadata(path)?;
        if let Some(content) = self.cache.lookup(path, &metadata) {
            return Ok(content);
        }
        let content = self.hash_file(path)?;
        self.cache.store(path, content, metadata);
        Ok(content)
    }
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn inode_of(meta: &std::fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.ino()
}

#[cfg(not(unix))]
fn inode_of(_meta: &std::fs::Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hash_file_matches_oneshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("input.txt");
        std::fs::write(&path, b"file contents").unwrap();

        let hasher = Hasher::new();
        let streamed = hasher.hash_file(&path).unwrap();
        assert_eq!(streamed, Digest::from(blake3::hash(b"file contents")));
    }

    #[test]
    fn test_hash_file_missing_is_io_error() {
        let hasher = Hasher::new();
        let err = hasher.hash_file(Path::new("/nonexistent/input")).unwrap_err();
        assert!(matches!(err, HashError::Io { .. }));
    }

    #[test]
    fn test_hash_strings_length_prefixed() {
        let hasher = Hasher::new();
        let a = hasher.hash_strings(["ab", "c"]);
        let b = hasher.hash_strings(["a", "bc"]);
        assert_ne!(a, b);

        // Deterministic for identical input
        assert_eq!(a, hasher.hash_strings(["ab", "c"]));
    }

    #[test]
    fn test_hash_many_in_input_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..8 {
            let path = dir.path().join(format!("f{}.txt", i));
            std::fs::write(&path, format!("contents {}", i)).unwrap();
            paths.push(path);
        }

        let hasher = Hasher::new();
        let digests = hasher.hash_many(&paths);
        for (i, digest) in digests.iter().enumerate() {
            let expected = blake3::hash(format!("contents {}", i).as_bytes());
            assert_eq!(*digest.as_ref().unwrap(), Digest::from(expected));
        }
    }

    #[test]
    fn test_cached_hash_detects_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mutable.txt");
        std::fs::write(&path, b"before").unwrap();

        let hasher = Hasher::new();
        let first = hasher.hash_file_cached(&path).unwrap();

        // Rewrite with different content and a different length so the
        // metadata digest cannot collide.
        let mut file = File::create(&path).unwrap();
        file.write_all(b"after, longer").unwrap();
        drop(file);

        let second = hasher.hash_file_cached(&path).unwrap();
        assert_ne!(first, second);
        assert_eq!(second, Digest::from(blake3::hash(b"after, longer")));
    }
}
