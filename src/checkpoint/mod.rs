//! # Checkpoint / Resume
//!
//! After every node completion the coordinator appends a per-node record;
//! the snapshot is persisted as a signed blob alongside the caches. On
//! resume, the snapshot is valid only when its graph signature matches the
//! current graph and every recorded id still exists; anything else is stale
//! and discarded. A valid snapshot yields a resume plan: checkpointed
//! successes are skipped, everything else returns to pending.

use crate::cache::codec::{self, BinaryDecode, BinaryEncode, ByteReader, ByteWriter};
use crate::cache::integrity::{unix_now, Integrity, SignedBlob};
use crate::cache::{CacheError, Result, CACHE_DIR, CHECKPOINT_FILE};
use crate::core::{BuildStatus, TargetId};
use crate::graph::BuildGraph;
use crate::hash::{Digest, Hasher};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One node's completion record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Target label
    pub id: String,
    /// Terminal status reached
    pub status: BuildStatus,
    /// Output digest for successful nodes
    pub output_hash: Option<Digest>,
    /// Completion time, unix seconds
    pub completed_at: u64,
}

impl CheckpointRecord {
    /// Record a completion observed now.
    pub fn new(id: &TargetId, status: BuildStatus, output_hash: Option<Digest>) -> Self {
        CheckpointRecord {
            id: id.as_str().to_string(),
            status,
            output_hash,
            completed_at: unix_now(),
        }
    }
}

impl BinaryEncode for CheckpointRecord {
    fn encode(&self, writer: &mut ByteWriter) {
        writer.write_string(&self.id);
        writer.write_string(self.status.as_str());
        match &self.output_hash {
            Some(digest) => {
                writer.write_bool(true);
                writer.write_digest(digest);
            }
            None => writer.write_bool(false),
        }
        writer.write_u64(self.completed_at);
    }
}

impl BinaryDecode for CheckpointRecord {
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self> {
        let id = reader.read_string()?;
        let status_name = reader.read_string()?;
        let status = BuildStatus::parse(&status_name).ok_or_else(|| {
            CacheError::CorruptCache(format!("Unknown status: {}", status_name))
        })?;
        let output_hash = if reader.read_bool()? {
            Some(reader.read_digest()?)
        } else {
            None
        };
        Ok(CheckpointRecord {
            id,
            status,
            output_hash,
            completed_at: reader.read_u64()?,
        })
    }
}

/// What resume decided to do with a valid snapshot.
#[derive(Debug, Clone)]
pub struct ResumePlan {
    /// Nodes to mark satisfied without work: `(id, output digest)`
    pub skip: Vec<(TargetId, Option<Digest>)>,
    /// Total nodes in the graph
    pub total: usize,
}

impl ResumePlan {
    /// Estimated fraction of the build already done.
    pub fn savings(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.skip.len() as f64 / self.total as f64
        }
    }
}

struct State {
    graph_signature: Option<Digest>,
    records: BTreeMap<String, CheckpointRecord>,
}

/// Owns the checkpoint file. Written by the coordinator only.
pub struct CheckpointManager {
    file: PathBuf,
    integrity: Integrity,
    state: Mutex<State>,
}

impl CheckpointManager {
    /// Bind to a workspace's checkpoint file. Nothing is read until
    /// [`CheckpointManager::resume_plan`].
    pub fn open(workspace: &Path) -> Self {
        CheckpointManager {
            file: workspace.join(CACHE_DIR).join(CHECKPOINT_FILE),
            integrity: Integrity::for_workspace(workspace),
            state: Mutex::new(State {
                graph_signature: None,
                records: BTreeMap::new(),
            }),
        }
    }

    /// Start a session against a graph: fixes the signature new records are
    /// stamped with and carries forward any still-valid prior records.
    pub fn begin(&self, graph: &BuildGraph, hasher: &Hasher) {
        let signature = graph.signature(hasher);
        let mut state = self.state.lock();
        match self.load() {
            Ok(Some((prior_signature, records))) if prior_signature == signature => {
                state.records = records;
            }
            Ok(_) => state.records.clear(),
            Err(err) => {
                log::warn!("Discarding checkpoint: {}", err);
                state.records.clear();
            }
        }
        state.graph_signature = Some(signature);
    }

    /// Append one completion record.
    pub fn record(&self, record: CheckpointRecord) {
        self.state.lock().records.insert(record.id.clone(), record);
    }

    /// Persist the snapshot as a signed blob.
    pub fn flush(&self) -> Result<()> {
        let state = self.state.lock();
        let signature = match state.graph_signature {
            Some(signature) => signature,
            None => return Ok(()),
        };

        let mut writer = ByteWriter::new();
        codec::write_header(&mut writer, state.records.len() as u32);
        writer.write_digest(&signature);
        for record in state.records.values() {
            record.encode(&mut writer);
        }
        let blob = self.integrity.sign(writer.finish());

        if let Some(parent) = self.file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.file, blob.to_bytes())?;
        Ok(())
    }

    /// Build a resume plan from the persisted snapshot, or `None` when the
    /// snapshot is absent, stale, or unreadable.
    pub fn resume_plan(&self, graph: &BuildGraph, hasher: &Hasher) -> Option<ResumePlan> {
        let (signature, records) = match self.load() {
            Ok(Some(loaded)) => loaded,
            Ok(None) => return None,
            Err(err) => {
                log::warn!("Discarding checkpoint: {}", err);
                return None;
            }
        };

        if signature != graph.signature(hasher) {
            log::info!("Checkpoint is stale (graph changed); starting fresh");
            return None;
        }
        for id in records.keys() {
            let target = TargetId::parse(id).ok()?;
            if !graph.contains(&target) {
                log::info!("Checkpoint references missing target {}; starting fresh", id);
                return None;
            }
        }

        let skip: Vec<(TargetId, Option<Digest>)> = records
            .values()
            .filter(|record| record.status.is_satisfied())
            .filter_map(|record| {
                TargetId::parse(&record.id)
                    .ok()
                    .map(|id| (id, record.output_hash))
            })
            .collect();

        Some(ResumePlan {
            skip,
            total: graph.len(),
        })
    }

    /// Delete the persisted snapshot and forget in-memory state.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.records.clear();
        state.graph_signature = None;
        match std::fs::remove_file(&self.file) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn load(&self) -> Result<Option<(Digest, BTreeMap<String, CheckpointRecord>)>> {
        if !self.file.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&self.file)?;
        let blob = SignedBlob::from_bytes(&raw)?;
        if !self.integrity.verify(&blob) {
            return Err(CacheError::SignatureVerification);
        }

        let mut reader = ByteReader::new(&blob.data);
        let count = codec::read_header(&mut reader)?;
        let signature = reader.read_digest()?;
        let mut records = BTreeMap::new();
        for _ in 0..count {
            let record = CheckpointRecord::decode(&mut reader)?;
            records.insert(record.id.clone(), record);
        }
        Ok(Some((signature, records)))
    }
}
