//! Workspace-keyed signing for persisted cache blobs
//!
//! Every cache file is wrapped in a [`SignedBlob`]: the payload, a creation
//! timestamp, and an HMAC-SHA256 tag over both. The MAC key derives from a
//! workspace-specific seed (`BUILDER_WORKSPACE_KEY`, falling back to the
//! canonical workspace path), so moving a cache between workspaces
//! invalidates it. Verification failure is non-fatal by contract: callers
//! discard the blob and start empty.

use super::{CacheError, Result};
use hmac::{Hmac, Mac};
use sha2::{Digest as _, Sha256};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const MAC_LEN: usize = 32;
const CREATED_LEN: usize = 8;

/// Default blob expiry threshold: 30 days.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// A persisted payload with tamper and staleness detection.
///
/// On-disk layout: `payload || created(8, BE) || mac(32)`. The payload comes
/// first so cache files begin with the format magic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBlob {
    /// The wrapped payload
    pub data: Vec<u8>,
    /// Unix seconds at signing time
    pub created: u64,
    /// HMAC-SHA256 over `data || created`
    pub mac: [u8; MAC_LEN],
}

impl SignedBlob {
    /// Serialize to the on-disk layout.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.data.len() + CREATED_LEN + MAC_LEN);
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.created.to_be_bytes());
        out.extend_from_slice(&self.mac);
        out
    }

    /// Parse the on-disk layout. Fails with `CorruptCache` when the file is
    /// too short to carry a trailer.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < CREATED_LEN + MAC_LEN {
            return Err(CacheError::CorruptCache(format!(
                "Signed blob too short: {} bytes",
                raw.len()
            )));
        }
        let data_len = raw.len() - CREATED_LEN - MAC_LEN;
        let created = u64::from_be_bytes(
            raw[data_len..data_len + CREATED_LEN]
                .try_into()
                .expect("8-byte slice"),
        );
        let mac: [u8; MAC_LEN] = raw[data_len + CREATED_LEN..]
            .try_into()
            .expect("32-byte slice");
        Ok(SignedBlob {
            data: raw[..data_len].to_vec(),
            created,
            mac,
        })
    }
}

/// Signs and verifies cache blobs with a workspace-derived key.
pub struct Integrity {
    key: [u8; 32],
}

impl Integrity {
    /// Derive the MAC key for a workspace. `BUILDER_WORKSPACE_KEY` wins when
    /// set; otherwise the canonical workspace path seeds the key, so two
    /// checkouts never trust each other's blobs.
    pub fn for_workspace(workspace: &Path) -> Self {
        let seed = match crate::core::config::workspace_key_from_env() {
            Some(key) => key,
            None => workspace
                .canonicalize()
                .unwrap_or_else(|_| workspace.to_path_buf())
                .to_string_lossy()
                .into_owned(),
        };
        Self::from_seed(seed.as_bytes())
    }

    /// Derive the MAC key from an explicit seed.
    pub fn from_seed(seed: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"builder-cache-mac-v1");
        hasher.update(seed);
        Integrity {
            key: hasher.finalize().into(),
        }
    }

    /// Wrap a payload with the current timestamp and its MAC.
    pub fn sign(&self, data: Vec<u8>) -> SignedBlob {
        let created = unix_now();
        let mac = self.compute_mac(&data, created);
        SignedBlob { data, created, mac }
    }

    /// Check a blob's MAC. Constant-time comparison via the MAC
    /// implementation.
    pub fn verify(&self, blob: &SignedBlob) -> bool {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts 32-byte keys");
        mac.update(&blob.data);
        mac.update(&blob.created.to_be_bytes());
        mac.verify_slice(&blob.mac).is_ok()
    }

    /// Whether the blob's creation time is further in the past than
    /// `max_age`. A clock that moved backwards never expires a blob.
    pub fn is_expired(&self, blob: &SignedBlob, max_age: Duration) -> bool {
        let now = unix_now();
        now.saturating_sub(blob.created) > max_age.as_secs()
    }

    fn compute_mac(&self, data: &[u8], created: u64) -> [u8; MAC_LEN] {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts 32-byte keys");
        mac.update(data);
        mac.update(&created.to_be_bytes());
        mac.finalize().into_bytes().into()
    }
}

/// Current time as unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
