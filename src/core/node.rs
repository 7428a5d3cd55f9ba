//! Build graph nodes and their lifecycle states

use super::target::{Language, TargetId, TargetKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Lifecycle state of a node within a build session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildStatus {
    /// Waiting on unfinished dependencies
    Pending,
    /// All dependencies satisfied, eligible for dispatch
    Ready,
    /// Handler invocation in progress
    Building,
    /// Built in this session
    Success,
    /// Satisfied from the target cache or a checkpoint
    Cached,
    /// Build failed, or a dependency failed
    Failed,
    /// Deliberately not attempted (fail-fast shutdown)
    Skipped,
}

impl BuildStatus {
    /// True once the node can no longer change state this session.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Cached | BuildStatus::Failed | BuildStatus::Skipped
        )
    }

    /// True when the node's outputs are usable by dependents.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, BuildStatus::Success | BuildStatus::Cached)
    }

    /// Stable lowercase name, used in query output and checkpoints.
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Ready => "ready",
            BuildStatus::Building => "building",
            BuildStatus::Success => "success",
            BuildStatus::Cached => "cached",
            BuildStatus::Failed => "failed",
            BuildStatus::Skipped => "skipped",
        }
    }

    /// Parse from the stable name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BuildStatus::Pending),
            "ready" => Some(BuildStatus::Ready),
            "building" => Some(BuildStatus::Building),
            "success" => Some(BuildStatus::Success),
            "cached" => Some(BuildStatus::Cached),
            "failed" => Some(BuildStatus::Failed),
            "skipped" => Some(BuildStatus::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single buildable unit in the graph.
///
/// `dependent_ids` is the inverse index of `dependency_ids` and is maintained
/// by the graph, not by callers. `pending_deps` counts dependencies whose
/// status is not yet satisfied; it is initialized by
/// [`crate::graph::BuildGraph::init_pending_deps`] and decremented by the
/// coordinator as predecessors complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildNode {
    /// Stable label
    pub id: TargetId,
    /// What this target produces
    pub kind: TargetKind,
    /// Which language handler builds it
    pub language: Language,
    /// Input source files, in declaration order
    pub sources: Vec<PathBuf>,
    /// Handler flags, in declaration order
    pub flags: Vec<String>,
    /// Environment overrides (unique keys, deterministic order)
    pub env: BTreeMap<String, String>,
    /// Declared output files, in declaration order
    pub outputs: Vec<PathBuf>,
    /// Direct dependencies
    pub dependency_ids: Vec<TargetId>,
    /// Inverse index: targets that depend on this one
    pub dependent_ids: Vec<TargetId>,
    /// Lifecycle state
    pub status: BuildStatus,
    /// Count of unsatisfied direct dependencies
    pub pending_deps: usize,
    /// Whether the handler may announce new nodes mid-build
    pub discoverable: bool,
}

impl BuildNode {
    /// Create a node with no sources, flags, or edges.
    pub fn new(id: TargetId, kind: TargetKind, language: Language) -> Self {
        BuildNode {
            id,
            kind,
            language,
            sources: Vec::new(),
            flags: Vec::new(),
            env: BTreeMap::new(),
            outputs: Vec::new(),
            dependency_ids: Vec::new(),
            dependent_ids: Vec::new(),
            status: BuildStatus::Pending,
            pending_deps: 0,
            discoverable: false,
        }
    }

    /// Attach source files.
    pub fn with_sources(mut self, sources: Vec<PathBuf>) -> Self {
        self.sources = sources;
        self
    }

    /// Attach declared outputs.
    pub fn with_outputs(mut self, outputs: Vec<PathBuf>) -> Self {
        self.outputs = outputs;
        self
    }

    /// Attach direct dependencies.
    pub fn with_dependencies(mut self, deps: Vec<TargetId>) -> Self {
        self.dependency_ids = deps;
        self
    }

    /// Attach handler flags.
    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    /// Mark the node as allowed to announce new nodes during its build.
    pub fn discoverable(mut self) -> Self {
        self.discoverable = true;
        self
    }

    /// True when eligible for the scheduler: no unsatisfied dependencies and
    /// not yet dispatched.
    pub fn is_ready(&self) -> bool {
        self.pending_deps == 0
            && matches!(self.status, BuildStatus::Pending | BuildStatus::Ready)
    }

    /// Whether two definitions describe the same unit of work. Used by the
    /// discovery path to tell re-announcements from conflicts.
    pub fn same_definition(&self, other: &BuildNode) -> bool {
        self.id == other.id
            && self.kind == other.kind
            && self.language == other.language
            && self.sources == other.sources
            && self.flags == other.flags
            && self.env == other.env
            && self.outputs == other.outputs
            && self.dependency_ids == other.dependency_ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(label: &str) -> BuildNode {
        BuildNode::new(
            TargetId::parse(label).unwrap(),
            TargetKind::Library,
            Language::new("cpp"),
        )
    }

    #[test]
    fn test_new_node_is_pending() {
        let n = node("//lib:a");
        assert_eq!(n.status, BuildStatus::Pending);
        assert_eq!(n.pending_deps, 0);
        assert!(n.is_ready());
        assert!(!n.discoverable);
    }

    #[test]
    fn test_ready_requires_zero_pending() {
        let mut n = node("//lib:a");
        n.pending_deps = 1;
        assert!(!n.is_ready());
        n.pending_deps = 0;
        n.status = BuildStatus::Building;
        assert!(!n.is_ready());
    }

    #[test]
    fn test_status_terminality() {
        assert!(!BuildStatus::Building.is_terminal());
        assert!(BuildStatus::Failed.is_terminal());
        assert!(BuildStatus::Cached.is_satisfied());
        assert!(!BuildStatus::Failed.is_satisfied());
    }

    #[test]
    fn test_status_name_round_trip() {
        for status in [
            BuildStatus::Pending,
            BuildStatus::Ready,
            BuildStatus::Building,
            BuildStatus::Success,
            BuildStatus::Cached,
            BuildStatus::Failed,
            BuildStatus::Skipped,
        ] {
            assert_eq!(BuildStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_same_definition_ignores_runtime_state() {
        let a = node("//lib:a");
        let mut b = node("//lib:a");
        b.status = BuildStatus::Success;
        b.pending_deps = 3;
        assert!(a.same_definition(&b));

        let c = node("//lib:a").with_flags(vec!["-O2".to_string()]);
        assert!(!a.same_definition(&c));
    }
}
