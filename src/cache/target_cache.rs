//! Target-level cache: fingerprint → artifact records
//!
//! A probe is a hit only when the whole story checks out: the stored
//! fingerprint matches, every source file still hashes to its recorded
//! digest, every dependency's output hash is unchanged, every declared
//! output exists on disk, and the recorded metadata equals the current
//! metadata. Anything less is a miss with a reason.
//!
//! The cache also arbitrates concurrent builders of the same fingerprint:
//! `try_claim`/`wait`/`release` guarantee at most one handler invocation per
//! `(target, fingerprint)` while the losers block and re-probe.

use super::codec::{self, BinaryDecode, BinaryEncode, ByteReader, ByteWriter};
use super::eviction::{select_evictions, EvictionCandidate};
use super::integrity::{unix_now, Integrity, SignedBlob, DEFAULT_MAX_AGE};
use super::{CacheError, Result, CACHE_DIR, TARGET_CACHE_FILE};
use crate::core::config::CacheBudget;
use crate::core::{BuildNode, TargetId};
use crate::hash::{Digest, Hasher};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// One persisted target record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Target label string
    pub target_id: String,
    /// Combined digest of sources, deps, flags, env, and handler identity
    pub build_hash: Digest,
    /// Digest of the produced outputs
    pub output_hash: Digest,
    /// Creation time, unix seconds
    pub timestamp: u64,
    /// Last probe hit or record time, unix seconds
    pub last_access: u64,
    /// Digest over the recorded metadata pairs
    pub metadata_hash: Digest,
    /// Per-source content digests
    pub source_hashes: BTreeMap<String, Digest>,
    /// Per-dependency output digests
    pub dep_hashes: BTreeMap<String, Digest>,
    /// Optional per-source stat digests for the optimistic pre-check
    pub source_metadata: BTreeMap<String, Digest>,
}

impl BinaryEncode for CacheEntry {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.target_id);
        writer.write_digest(&self.build_hash);
        writer.write_digest(&self.output_hash);
        writer.write_u64(self.timestamp);
        writer.write_u64(self.last_access);
        writer.write_digest(&self.metadata_hash);
        encode_digest_map(writer, &self.source_hashes);
        encode_digest_map(writer, &self.dep_hashes);
        encode_digest_map(writer, &self.source_metadata);
    }
}

impl BinaryDecode for CacheEntry {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        Ok(CacheEntry {
            target_id: reader.read_string()?,
            build_hash: reader.read_digest()?,
            output_hash: reader.read_digest()?,
            timestamp: reader.read_u64()?,
            last_access: reader.read_u64()?,
            metadata_hash: reader.read_digest()?,
            source_hashes: decode_digest_map(reader)?,
            dep_hashes: decode_digest_map(reader)?,
            source_metadata: decode_digest_map(reader)?,
        })
    }
}

fn encode_digest_map(writer: &mut ByteWriter, map: &BTreeMap<String, Digest>) {
    writer.write_u32(map.len() as u32);
    for (key, digest) in map {
        writer.write_string(key);
        writer.write_digest(digest);
    }
}

fn decode_digest_map(reader: &mut ByteReader<'_>) -> Result<BTreeMap<String, Digest>> {
    let count = reader.read_u32()?;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key = reader.read_string()?;
        let digest = reader.read_digest()?;
        map.insert(key, digest);
    }
    Ok(map)
}

/// Outcome of a cache probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Entry is valid; the target does not need to build
    Hit {
        /// Recorded output digest
        output_hash: Digest,
    },
    /// Entry is absent or invalid
    Miss(MissReason),
}

/// Why a probe missed, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    /// No entry for this target
    NoEntry,
    /// Stored fingerprint differs
    FingerprintChanged,
    /// A source file's content digest changed
    SourceChanged(String),
    /// A source file could not be hashed
    SourceUnreadable(String),
    /// A dependency's output digest changed
    DepChanged(String),
    /// A declared output is gone from disk
    OutputMissing(String),
    /// Recorded metadata no longer matches
    MetadataChanged,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    /// Entries held
    pub entries: usize,
    /// Total encoded bytes held
    pub total_bytes: u64,
    /// Probe hits
    pub hits: u64,
    /// Probe misses
    pub misses: u64,
}

impl CacheStats {
    /// Hits over total probes, 0.0 when unused.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct StoredEntry {
    entry: CacheEntry,
    size: u64,
}

type ClaimKey = (String, Digest);

/// Thread-safe fingerprint → artifact cache, persisted as a signed blob.
pub struct TargetCache {
    workspace: PathBuf,
    file: PathBuf,
    integrity: Integrity,
    budget: CacheBudget,
    entries: Mutex<HashMap<String, StoredEntry>>,
    inflight: Mutex<HashSet<ClaimKey>>,
    inflight_cond: Condvar,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TargetCache {
    /// Open the cache for a workspace, loading `targets.bin` when present.
    /// Any load failure is logged and recovered by starting empty.
    pub fn open(workspace: &Path, budget: CacheBudget) -> Self {
        let integrity = Integrity::for_workspace(workspace);
        let file = workspace.join(CACHE_DIR).join(TARGET_CACHE_FILE);
        let entries = match load_entries(&file, &integrity) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("Discarding target cache: {}", err);
                HashMap::new()
            }
        };
        if !entries.is_empty() {
            log::debug!("Loaded {} target cache entries", entries.len());
        }
        TargetCache {
            workspace: workspace.to_path_buf(),
            file,
            integrity,
            budget,
            entries: Mutex::new(entries),
            inflight: Mutex::new(HashSet::new()),
            inflight_cond: Condvar::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Validate the stored entry for a node against the current world.
    /// Idempotent with respect to cache contents; only `last_access` moves.
    pub fn probe(
        &self,
        node: &BuildNode,
        build_hash: &Digest,
        dep_hashes: &BTreeMap<String, Digest>,
        metadata: &BTreeMap<String, String>,
        hasher: &Hasher,
    ) -> Probe {
        let reason = match self.validate(node, build_hash, dep_hashes, metadata, hasher) {
            Ok(output_hash) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                let mut entries = self.entries.lock();
                if let Some(stored) = entries.get_mut(node.id.as_str()) {
                    stored.entry.last_access = unix_now();
                }
                log::debug!("Cache hit for {}", node.id);
                return Probe::Hit { output_hash };
            }
            Err(reason) => reason,
        };
        self.misses.fetch_add(1, Ordering::Relaxed);
        log::debug!("Cache miss for {}: {:?}", node.id, reason);
        Probe::Miss(reason)
    }

    fn validate(
        &self,
        node: &BuildNode,
        build_hash: &Digest,
        dep_hashes: &BTreeMap<String, Digest>,
        metadata: &BTreeMap<String, String>,
        hasher: &Hasher,
    ) -> std::result::Result<Digest, MissReason> {
        let entries = self.entries.lock();
        let stored = entries
            .get(node.id.as_str())
            .ok_or(MissReason::NoEntry)?;
        let entry = &stored.entry;

        if entry.build_hash != *build_hash {
            return Err(MissReason::FingerprintChanged);
        }

        if entry.metadata_hash != metadata_digest(hasher, metadata) {
            return Err(MissReason::MetadataChanged);
        }

        for (dep, recorded) in &entry.dep_hashes {
            match dep_hashes.get(dep) {
                Some(current) if current == recorded => {}
                _ => return Err(MissReason::DepChanged(dep.clone())),
            }
        }

        for source in &node.sources {
            let key = source.to_string_lossy().into_owned();
            let recorded = entry
                .source_hashes
                .get(&key)
                .ok_or_else(|| MissReason::SourceChanged(key.clone()))?;

            let path = self.workspace.join(source);

            // Optimistic pre-check: unchanged stat digest means unchanged
            // content for our purposes.
            if let Some(stat) = entry.source_metadata.get(&key) {
                if let Ok(current_stat) = hasher.hash_metadata(&path) {
                    if current_stat == *stat {
                        continue;
                    }
                }
            }

            let current = hasher
                .hash_file_cached(&path)
                .map_err(|_| MissReason::SourceUnreadable(key.clone()))?;
            if current != *recorded {
                return Err(MissReason::SourceChanged(key));
            }
        }

        for output in &node.outputs {
            let path = self.workspace.join(output);
            if !path.exists() {
                return Err(MissReason::OutputMissing(
                    output.to_string_lossy().into_owned(),
                ));
            }
        }

        Ok(entry.output_hash)
    }

    /// Upsert the record for a node after a successful build.
    pub fn record(
        &self,
        node: &BuildNode,
        build_hash: Digest,
        output_hash: Digest,
        dep_hashes: BTreeMap<String, Digest>,
        metadata: &BTreeMap<String, String>,
        hasher: &Hasher,
    ) {
        let now = unix_now();
        let mut source_hashes = BTreeMap::new();
        let mut source_metadata = BTreeMap::new();
        for source in &node.sources {
            let key = source.to_string_lossy().into_owned();
            let path = self.workspace.join(source);
            match hasher.hash_file_cached(&path) {
                Ok(digest) => {
                    source_hashes.insert(key.clone(), digest);
                }
                Err(err) => {
                    log::warn!("Recording {} without hash for {}: {}", node.id, key, err);
                    continue;
                }
            }
            if let Ok(stat) = hasher.hash_metadata(&path) {
                source_metadata.insert(key, stat);
            }
        }

        let entry = CacheEntry {
            target_id: node.id.as_str().to_string(),
            build_hash,
            output_hash,
            timestamp: now,
            last_access: now,
            metadata_hash: metadata_digest(hasher, metadata),
            source_hashes,
            dep_hashes,
            source_metadata,
        };
        let size = encoded_size(&entry);
        self.entries
            .lock()
            .insert(entry.target_id.clone(), StoredEntry { entry, size });
    }

    /// Remove the record for a target.
    pub fn invalidate(&self, id: &TargetId) {
        self.entries.lock().remove(id.as_str());
    }

    /// Claim the right to build `(target, fingerprint)`. Returns false when
    /// another thread already holds the claim.
    pub fn try_claim(&self, id: &TargetId, build_hash: &Digest) -> bool {
        self.inflight
            .lock()
            .insert((id.as_str().to_string(), *build_hash))
    }

    /// Block until the holder of `(target, fingerprint)` releases. Callers
    /// re-probe afterwards.
    pub fn wait(&self, id: &TargetId, build_hash: &Digest) {
        let key = (id.as_str().to_string(), *build_hash);
        let mut inflight = self.inflight.lock();
        while inflight.contains(&key) {
            self.inflight_cond.wait(&mut inflight);
        }
    }

    /// Release a claim taken with `try_claim`.
    pub fn release(&self, id: &TargetId, build_hash: &Digest) {
        let key = (id.as_str().to_string(), *build_hash);
        self.inflight.lock().remove(&key);
        self.inflight_cond.notify_all();
    }

    /// Run eviction and persist the surviving entries as a signed blob.
    pub fn flush(&self) -> Result<()> {
        let mut entries = self.entries.lock();
        let now = unix_now();

        let candidates: Vec<EvictionCandidate> = entries
            .values()
            .map(|stored| EvictionCandidate {
                key: stored.entry.target_id.clone(),
                size: stored.size,
                timestamp: stored.entry.timestamp,
                last_access: stored.entry.last_access,
            })
            .collect();
        let evicted = select_evictions(&candidates, &self.budget, now);
        for key in &evicted {
            entries.remove(key);
        }
        if !evicted.is_empty() {
            log::debug!("Evicted {} target cache entries", evicted.len());
        }

        let mut keys: Vec<&String> = entries.keys().collect();
        keys.sort();
        let mut writer = ByteWriter::new();
        codec::write_header(&mut writer, entries.len() as u32);
        for key in keys {
            entries[key].entry.encode(&mut writer);
        }
        let blob = self.integrity.sign(writer.finish());

        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.file, blob.to_bytes())?;

        let stats = self.stats_locked(&entries);
        log::debug!(
            "Target cache flushed: {} entries, {} bytes, {:.0}% hit rate",
            stats.entries,
            stats.total_bytes,
            stats.hit_rate() * 100.0
        );
        Ok(())
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        self.stats_locked(&self.entries.lock())
    }

    fn stats_locked(&self, entries: &HashMap<String, StoredEntry>) -> CacheStats {
        CacheStats {
            entries: entries.len(),
            total_bytes: entries.values().map(|s| s.size).sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True when no entries are held.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

fn metadata_digest(hasher: &Hasher, metadata: &BTreeMap<String, String>) -> Digest {
    hasher.hash_strings(
        metadata
            .iter()
            .map(|(key, value)| format!("{}={}", key, value)),
    )
}

fn encoded_size(entry: &CacheEntry) -> u64 {
    let mut writer = ByteWriter::new();
    entry.encode(&mut writer);
    writer.len() as u64
}

fn load_entries(file: &Path, integrity: &Integrity) -> Result<HashMap<String, StoredEntry>> {
    if !file.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read(file)?;
    let blob = SignedBlob::from_bytes(&raw)?;
    if !integrity.verify(&blob) {
        return Err(CacheError::SignatureVerification);
    }
    if integrity.is_expired(&blob, DEFAULT_MAX_AGE) {
        log::debug!("Target cache blob expired; starting empty");
        return Ok(HashMap::new());
    }

    let mut reader = ByteReader::new(&blob.data);
    let count = codec::read_header(&mut reader)?;
    let mut entries = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let entry = CacheEntry::decode(&mut reader)?;
        let size = encoded_size(&entry);
        entries.insert(entry.target_id.clone(), StoredEntry { entry, size });
    }
    Ok(entries)
}
