//! # Content-Addressed Result Caching
//!
//! Two-tier persisted caching with integrity protection:
//! - `codec`: the versioned binary format (magic, big-endian integers,
//!   length-prefixed UTF-8 strings)
//! - `integrity`: workspace-keyed MAC signing and expiry for persisted blobs
//! - `eviction`: LRU-by-last-access selection under size/count/age budgets
//! - `target_cache`: fingerprint → artifact records with source, dependency,
//!   output, and metadata validation
//! - `action_cache`: fine-grained sub-target action results
//!
//! Every load-path failure here is recovered locally: a blob that fails
//! verification, carries an unknown version, or decodes to garbage is
//! discarded with a warning and the in-memory cache starts empty. Cache
//! trouble never stops a build.

use thiserror::Error;

/// Cache error types
#[derive(Error, Debug)]
pub enum CacheError {
    /// MAC verification failed; the blob is not trusted
    #[error("Cache signature verification failed")]
    SignatureVerification,

    /// Blob was written by an incompatible format version
    #[error("Cache version mismatch: found {found}, expected {expected}")]
    VersionMismatch {
        /// Version byte found in the blob
        found: u8,
        /// Version this build reads
        expected: u8,
    },

    /// Structurally invalid blob
    #[error("Corrupt cache: {0}")]
    CorruptCache(String),

    /// A string region failed UTF-8 validation
    #[error("Corrupt cache: invalid UTF-8 in string data")]
    InvalidUtf8,

    /// I/O error
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

/// Cache directory name under the workspace root.
pub const CACHE_DIR: &str = ".builder-cache";

/// Target-level cache file, under [`CACHE_DIR`].
pub const TARGET_CACHE_FILE: &str = "targets.bin";

/// Action-level cache file, under [`CACHE_DIR`].
pub const ACTION_CACHE_FILE: &str = "actions/actions.bin";

/// Checkpoint file, under [`CACHE_DIR`].
pub const CHECKPOINT_FILE: &str = "checkpoint.bin";

pub mod action_cache;
pub mod codec;
pub mod eviction;
pub mod integrity;
pub mod target_cache;

pub use action_cache::{ActionCache, ActionEntry, ActionId, ActionKind};
pub use codec::{BinaryDecode, BinaryEncode, ByteReader, ByteWriter};
pub use eviction::{select_evictions, EvictionCandidate};
pub use integrity::{Integrity, SignedBlob};
pub use target_cache::{CacheEntry, CacheStats, Probe, TargetCache};
