//! # Content-Addressed Hashing
//!
//! BLAKE3 fingerprints over files and byte strings:
//! - `Digest`: 32-byte content address with hex rendering
//! - `backend`: instruction-set detection and the once-per-process self-test
//! - `Hasher`: file, metadata, string-sequence, and batch hashing
//! - `FastHashCache`: process-lifetime path digest cache with metadata
//!   pre-checks

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Hashing error types
#[derive(Error, Debug)]
pub enum HashError {
    /// File could not be read
    #[error("Cannot hash {path}: {source}")]
    Io {
        /// Offending path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Hex string is not a valid digest
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
}

/// Result type for hashing operations
pub type Result<T> = std::result::Result<T, HashError>;

pub mod backend;
pub mod cache;
pub mod hasher;

pub use backend::HashBackend;
pub use cache::FastHashCache;
pub use hasher::Hasher;

/// A 32-byte BLAKE3 content address.
///
/// Backend-independent: the same input hashes to the same digest on every
/// instruction-set tier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Digest length in bytes.
    pub const LEN: usize = 32;

    /// The all-zero digest, used as a placeholder for "no output".
    pub const ZERO: Digest = Digest([0u8; 32]);

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Digest(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s).map_err(|_| HashError::InvalidDigest(s.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| HashError::InvalidDigest(s.to_string()))?;
        Ok(Digest(bytes))
    }

    /// Abbreviated hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl From<blake3::Hash> for Digest {
    fn from(hash: blake3::Hash) -> Self {
        Digest(*hash.as_bytes())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}
