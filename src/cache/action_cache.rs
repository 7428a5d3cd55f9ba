//! Action-level cache: fine-grained sub-target results
//!
//! A single target's work can be partitioned into actions (one compile per
//! source file plus a link, say). The executor decides granularity; this
//! cache only enforces key uniqueness on `(target, kind, sub-id, input
//! hash)`. Failed actions are recorded for diagnostics but never count as
//! hits.

use super::codec::{self, BinaryDecode, BinaryEncode, ByteReader, ByteWriter};
use super::eviction::{select_evictions, EvictionCandidate};
use super::integrity::{unix_now, Integrity, SignedBlob, DEFAULT_MAX_AGE};
use super::target_cache::CacheStats;
use super::{CacheError, Result, ACTION_CACHE_FILE, CACHE_DIR};
use crate::core::config::CacheBudget;
use crate::core::TargetId;
use crate::hash::{Digest, Hasher};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// What kind of sub-step an action is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Compile one translation unit
    Compile,
    /// Link objects into an artifact
    Link,
    /// Generate source code
    Codegen,
    /// Run a test binary
    Test,
    /// Assemble a distributable package
    Package,
    /// Transform an asset
    Transform,
    /// Handler-defined
    Custom,
}

impl ActionKind {
    /// Stable lowercase name used in string keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Compile => "compile",
            ActionKind::Link => "link",
            ActionKind::Codegen => "codegen",
            ActionKind::Test => "test",
            ActionKind::Package => "package",
            ActionKind::Transform => "transform",
            ActionKind::Custom => "custom",
        }
    }

    /// Parse from the stable name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "compile" => Some(ActionKind::Compile),
            "link" => Some(ActionKind::Link),
            "codegen" => Some(ActionKind::Codegen),
            "test" => Some(ActionKind::Test),
            "package" => Some(ActionKind::Package),
            "transform" => Some(ActionKind::Transform),
            "custom" => Some(ActionKind::Custom),
            _ => None,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composite action key. Unique by the full tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActionId {
    /// Owning target
    pub target: TargetId,
    /// Sub-step kind
    pub kind: ActionKind,
    /// Optional discriminator when a target has several actions of one kind
    pub sub_id: Option<String>,
    /// Digest over the action's inputs
    pub input_hash: Digest,
}

impl ActionId {
    /// Create a key without a sub-id.
    pub fn new(target: TargetId, kind: ActionKind, input_hash: Digest) -> Self {
        ActionId {
            target,
            kind,
            sub_id: None,
            input_hash,
        }
    }

    /// Attach a sub-id discriminator.
    pub fn with_sub_id(mut self, sub_id: &str) -> Self {
        self.sub_id = Some(sub_id.to_string());
        self
    }

    /// String form `target:kind:[subId:]inputHash`, used as the persisted
    /// map key.
    pub fn to_key(&self) -> String {
        match &self.sub_id {
            Some(sub) => format!(
                "{}:{}:{}:{}",
                self.target,
                self.kind,
                sub,
                self.input_hash.to_hex()
            ),
            None => format!("{}:{}:{}", self.target, self.kind, self.input_hash.to_hex()),
        }
    }
}

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_key())
    }
}

/// One persisted action record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionEntry {
    /// Owning target label
    pub target_id: String,
    /// Sub-step kind
    pub kind: ActionKind,
    /// Optional discriminator
    pub sub_id: Option<String>,
    /// Digest over the action's inputs
    pub input_hash: Digest,
    /// Input paths, in declaration order
    pub inputs: Vec<String>,
    /// Per-input content digests
    pub input_hashes: BTreeMap<String, Digest>,
    /// Output paths, in declaration order
    pub outputs: Vec<String>,
    /// Per-output content digests
    pub output_hashes: BTreeMap<String, Digest>,
    /// Free-form metadata (sorted for deterministic digests)
    pub metadata: BTreeMap<String, String>,
    /// Digest over the sorted metadata
    pub execution_hash: Digest,
    /// Creation time, unix seconds
    pub timestamp: u64,
    /// Last hit or record time, unix seconds
    pub last_access: u64,
    /// Whether the action succeeded
    pub success: bool,
}

impl ActionEntry {
    /// Build an entry from an id plus observed inputs and outputs, hashing
    /// the metadata in sorted order.
    pub fn new(
        id: &ActionId,
        inputs: Vec<String>,
        input_hashes: BTreeMap<String, Digest>,
        outputs: Vec<String>,
        output_hashes: BTreeMap<String, Digest>,
        metadata: BTreeMap<String, String>,
        success: bool,
        hasher: &Hasher,
    ) -> Self {
        let execution_hash = hasher.hash_strings(
            metadata
                .iter()
                .map(|(key, value)| format!("{}={}", key, value)),
        );
        let now = unix_now();
        ActionEntry {
            target_id: id.target.as_str().to_string(),
            kind: id.kind,
            sub_id: id.sub_id.clone(),
            input_hash: id.input_hash,
            inputs,
            input_hashes,
            outputs,
            output_hashes,
            metadata,
            execution_hash,
            timestamp: now,
            last_access: now,
            success,
        }
    }

    /// Reconstruct the composite key.
    pub fn action_id(&self) -> ActionId {
        ActionId {
            target: TargetId::parse(&self.target_id)
                .unwrap_or_else(|_| TargetId::new("unknown", "unknown")),
            kind: self.kind,
            sub_id: self.sub_id.clone(),
            input_hash: self.input_hash,
        }
    }
}

impl BinaryEncode for ActionEntry {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.target_id);
        writer.write_string(self.kind.as_str());
        match &self.sub_id {
            Some(sub) => {
                writer.write_bool(true);
                writer.write_string(sub);
            }
            None => writer.write_bool(false),
        }
        writer.write_digest(&self.input_hash);
        encode_string_list(writer, &self.inputs);
        encode_digest_map(writer, &self.input_hashes);
        encode_string_list(writer, &self.outputs);
        encode_digest_map(writer, &self.output_hashes);
        writer.write_u32(self.metadata.len() as u32);
        for (key, value) in &self.metadata {
            writer.write_string(key);
            writer.write_string(value);
        }
        writer.write_digest(&self.execution_hash);
        writer.write_u64(self.timestamp);
        writer.write_u64(self.last_access);
        writer.write_bool(self.success);
    }
}

impl BinaryDecode for ActionEntry {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let target_id = reader.read_string()?;
        let kind_name = reader.read_string()?;
        let kind = ActionKind::parse(&kind_name).ok_or_else(|| {
            CacheError::CorruptCache(format!("Unknown action kind: {}", kind_name))
        })?;
        let sub_id = if reader.read_bool()? {
            Some(reader.read_string()?)
        } else {
            None
        };
        let input_hash = reader.read_digest()?;
        let inputs = decode_string_list(reader)?;
        let input_hashes = decode_digest_map(reader)?;
        let outputs = decode_string_list(reader)?;
        let output_hashes = decode_digest_map(reader)?;
        let metadata_count = reader.read_u32()?;
        let mut metadata = BTreeMap::new();
        for _ in 0..metadata_count {
            let key = reader.read_string()?;
            let value = reader.read_string()?;
            metadata.insert(key, value);
        }
        Ok(ActionEntry {
            target_id,
            kind,
            sub_id,
            input_hash,
            inputs,
            input_hashes,
            outputs,
            output_hashes,
            metadata,
            execution_hash: reader.read_digest()?,
            timestamp: reader.read_u64()?,
            last_access: reader.read_u64()?,
            success: reader.read_bool()?,
        })
    }
}

fn encode_string_list(writer: &mut ByteWriter, items: &[String]) {
    writer.write_u32(items.len() as u32);
    for item in items {
        writer.write_string(item);
    }
}

fn decode_string_list(reader: &mut ByteReader<'_>) -> Result<Vec<String>> {
    let count = reader.read_u32()?;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(reader.read_string()?);
    }
    Ok(items)
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

struct StoredEntry {
    entry: ActionEntry,
    size: u64,
}

/// Thread-safe action result cache, persisted as a signed blob.
pub struct ActionCache {
    file: PathBuf,
    integrity: Integrity,
    budget: CacheBudget,
    entries: Mutex<HashMap<String, StoredEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ActionCache {
    /// Open the cache for a workspace, loading `actions/actions.bin` when
    /// present. Any load failure is logged and recovered by starting empty.
    pub fn open(workspace: &Path, budget: CacheBudget) -> Self {
        let integrity = Integrity::for_workspace(workspace);
        let file = workspace.join(CACHE_DIR).join(ACTION_CACHE_FILE);
        let entries = match load_entries(&file, &integrity) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("Discarding action cache: {}", err);
                HashMap::new()
            }
        };
        if !entries.is_empty() {
            log::debug!("Loaded {} action cache entries", entries.len());
        }
        ActionCache {
            file,
            integrity,
            budget,
            entries: Mutex::new(entries),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a successful prior result for this exact key. Failed entries
    /// never hit.
    pub fn probe(&self, id: &ActionId) -> Option<ActionEntry> {
        let mut entries = self.entries.lock();
        if let Some(stored) = entries.get_mut(&id.to_key()) {
            if stored.entry.success {
                stored.entry.last_access = unix_now();
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(stored.entry.clone());
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Upsert an action result, successful or not.
    pub fn record(&self, entry: ActionEntry) {
        let key = entry.action_id().to_key();
        let size = encoded_size(&entry);
        self.entries.lock().insert(key, StoredEntry { entry, size });
    }

    /// All current entries for one target, for diagnostics and
    /// invalidation. Sorted by key for stable output.
    pub fn actions_for_target(&self, id: &TargetId) -> Vec<ActionEntry> {
        let entries = self.entries.lock();
        let mut matching: Vec<ActionEntry> = entries
            .values()
            .filter(|stored| stored.entry.target_id == id.as_str())
            .map(|stored| stored.entry.clone())
            .collect();
        matching.sort_by_key(|entry| entry.action_id().to_key());
        matching
    }

    /// Remove every entry belonging to a target.
    pub fn invalidate_target(&self, id: &TargetId) {
        self.entries
            .lock()
            .retain(|_, stored| stored.entry.target_id != id.as_str());
    }

    /// Run eviction and persist the surviving entries as a signed blob.
    pub fn flush(&self) -> Result<()> {
        let mut entries = self.entries.lock();
        let now = unix_now();

        let candidates: Vec<EvictionCandidate> = entries
            .iter()
            .map(|(key, stored)| EvictionCandidate {
                key: key.clone(),
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
            log::debug!("Evicted {} action cache entries", evicted.len());
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
        Ok(())
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock();
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

fn encoded_size(entry: &ActionEntry) -> u64 {
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
        log::debug!("Action cache blob expired; starting empty");
        return Ok(HashMap::new());
    }

    let mut reader = ByteReader::new(&blob.data);
    let count = codec::read_header(&mut reader)?;
    let mut entries = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let entry = ActionEntry::decode(&mut reader)?;
        let size = encoded_size(&entry);
        entries.insert(entry.action_id().to_key(), StoredEntry { entry, size });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest(seed: &str) -> Digest {
        Digest::from(blake3::hash(seed.as_bytes()))
    }

    fn target(label: &str) -> TargetId {
        TargetId::parse(label).unwrap()
    }

    fn entry(id: &ActionId, success: bool, hasher: &Hasher) -> ActionEntry {
        let mut metadata = BTreeMap::new();
        metadata.insert("tool".to_string(), "cc".to_string());
        ActionEntry::new(
            id,
            vec!["a.c".to_string()],
            BTreeMap::from([("a.c".to_string(), digest("a.c"))]),
            vec!["a.o".to_string()],
            BTreeMap::from([("a.o".to_string(), digest("a.o"))]),
            metadata,
            success,
            hasher,
        )
    }

    #[test]
    fn test_key_format() {
        let id = ActionId::new(target("//app:a"), ActionKind::Compile, digest("in"));
        assert_eq!(
            id.to_key(),
            format!("//app:a:compile:{}", digest("in").to_hex())
        );

        let with_sub = id.clone().with_sub_id("a.c");
        assert_eq!(
            with_sub.to_key(),
            format!("//app:a:compile:a.c:{}", digest("in").to_hex())
        );
    }

    #[test]
    fn test_record_then_probe() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ActionCache::open(dir.path(), CacheBudget::actions());
        let hasher = Hasher::new();
        let id = ActionId::new(target("//app:a"), ActionKind::Compile, digest("in"));

        assert!(cache.probe(&id).is_none());
        cache.record(entry(&id, true, &hasher));
        let hit = cache.probe(&id).unwrap();
        assert_eq!(hit.outputs, vec!["a.o".to_string()]);
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_failed_actions_never_hit() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ActionCache::open(dir.path(), CacheBudget::actions());
        let hasher = Hasher::new();
        let id = ActionId::new(target("//app:a"), ActionKind::Compile, digest("in"));

        cache.record(entry(&id, false, &hasher));
        assert!(cache.probe(&id).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_sub_ids_are_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ActionCache::open(dir.path(), CacheBudget::actions());
        let hasher = Hasher::new();
        let base = ActionId::new(target("//app:a"), ActionKind::Compile, digest("in"));

        cache.record(entry(&base.clone().with_sub_id("a.c"), true, &hasher));
        cache.record(entry(&base.clone().with_sub_id("b.c"), true, &hasher));
        assert_eq!(cache.len(), 2);
        assert!(cache.probe(&base).is_none());
    }

    #[test]
    fn test_actions_for_target_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ActionCache::open(dir.path(), CacheBudget::actions());
        let hasher = Hasher::new();

        let a = ActionId::new(target("//app:a"), ActionKind::Compile, digest("1"));
        let b = ActionId::new(target("//app:a"), ActionKind::Link, digest("2"));
        let other = ActionId::new(target("//lib:z"), ActionKind::Compile, digest("3"));
        cache.record(entry(&b, true, &hasher));
        cache.record(entry(&a, true, &hasher));
        cache.record(entry(&other, true, &hasher));

        let actions = cache.actions_for_target(&target("//app:a"));
        assert_eq!(actions.len(), 2);
        assert!(actions.iter().all(|e| e.target_id == "//app:a"));
    }

    #[test]
    fn test_invalidate_target() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ActionCache::open(dir.path(), CacheBudget::actions());
        let hasher = Hasher::new();

        let a = ActionId::new(target("//app:a"), ActionKind::Compile, digest("1"));
        let other = ActionId::new(target("//lib:z"), ActionKind::Compile, digest("2"));
        cache.record(entry(&a, true, &hasher));
        cache.record(entry(&other, true, &hasher));

        cache.invalidate_target(&target("//app:a"));
        assert_eq!(cache.len(), 1);
        assert!(cache.probe(&other).is_some());
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let hasher = Hasher::new();
        let id = ActionId::new(target("//app:a"), ActionKind::Compile, digest("in"))
            .with_sub_id("a.c");

        {
            let cache = ActionCache::open(dir.path(), CacheBudget::actions());
            cache.record(entry(&id, true, &hasher));
            cache.record(entry(
                &ActionId::new(target("//app:a"), ActionKind::Link, digest("ln")),
                false,
                &hasher,
            ));
            cache.flush().unwrap();
        }

        let reopened = ActionCache::open(dir.path(), CacheBudget::actions());
        assert_eq!(reopened.len(), 2);
        let hit = reopened.probe(&id).unwrap();
        assert_eq!(hit.sub_id.as_deref(), Some("a.c"));
        assert_eq!(hit.metadata.get("tool").map(String::as_str), Some("cc"));
    }

    #[test]
    fn test_entry_codec_round_trip() {
        let hasher = Hasher::new();
        let id = ActionId::new(target("//app:a"), ActionKind::Package, digest("in"));
        let original = entry(&id, true, &hasher);

        let mut writer = ByteWriter::new();
        original.encode(&mut writer);
        let data = writer.finish();

        let mut reader = ByteReader::new(&data);
        let decoded = ActionEntry::decode(&mut reader).unwrap();
        assert_eq!(decoded, original);
        assert!(reader.is_exhausted());
    }
}
