//! # Dynamic Graph Discovery
//!
//! Discoverable targets may announce new nodes and edges while they build.
//! Announcements land in a buffer during the batch and are applied at the
//! batch boundary, which keeps the graph effectively immutable while workers
//! are running and preserves the scheduler's ordering invariants.
//!
//! Application is transactional: conflicts and cycles reject the whole
//! announcement batch and leave the graph exactly as it was.

use crate::core::{BuildNode, BuildStatus, TargetId};
use crate::graph::{BuildGraph, GraphError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

/// A handler's mid-build announcement of new graph structure.
#[derive(Debug, Clone)]
pub struct DiscoveryAnnouncement {
    /// The discoverable target that made the announcement
    pub source: TargetId,
    /// Newly revealed nodes
    pub nodes: Vec<BuildNode>,
    /// Extra `(new_id, depends_on)` edges beyond the nodes' own dependency
    /// lists
    pub edges: Vec<(TargetId, TargetId)>,
}

impl DiscoveryAnnouncement {
    /// Announce nodes with no extra edges.
    pub fn new(source: TargetId, nodes: Vec<BuildNode>) -> Self {
        DiscoveryAnnouncement {
            source,
            nodes,
            edges: Vec::new(),
        }
    }

    /// Attach extra edges.
    pub fn with_edges(mut self, edges: Vec<(TargetId, TargetId)>) -> Self {
        self.edges = edges;
        self
    }
}

/// Buffers announcements made during a batch until the coordinator drains
/// them at the batch boundary.
pub struct DiscoveryBuffer {
    pending: Mutex<Vec<DiscoveryAnnouncement>>,
}

impl DiscoveryBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        DiscoveryBuffer {
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Record an announcement. Called from worker threads via the handler
    /// context.
    pub fn announce(&self, announcement: DiscoveryAnnouncement) {
        log::debug!(
            "{} announced {} nodes, {} edges",
            announcement.source,
            announcement.nodes.len(),
            announcement.edges.len()
        );
        self.pending.lock().push(announcement);
    }

    /// Take everything buffered so far.
    pub fn drain(&self) -> Vec<DiscoveryAnnouncement> {
        std::mem::take(&mut self.pending.lock())
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Default for DiscoveryBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Applies announcement batches into the live graph between scheduler
/// batches.
pub struct DiscoveryEngine;

impl DiscoveryEngine {
    /// Validate and apply a batch of announcements.
    ///
    /// Rules:
    /// - A re-announcement of an identical definition is ignored.
    /// - A conflicting definition for any existing id (completed or not)
    ///   rejects the batch.
    /// - Every edge must connect announced or existing nodes.
    /// - The augmented graph must stay acyclic; a cycle rejects the batch
    ///   and leaves the graph unchanged.
    ///
    /// Returns the newly inserted nodes that are immediately ready, sorted,
    /// for the scheduler to submit.
    pub fn apply(
        graph: &mut BuildGraph,
        batch: Vec<DiscoveryAnnouncement>,
    ) -> Result<Vec<TargetId>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        // Collect the distinct new nodes, folding extra edges into their
        // dependency lists and screening for conflicts.
        let mut incoming: HashMap<TargetId, BuildNode> = HashMap::new();
        for announcement in &batch {
            for node in &announcement.nodes {
                let mut node = node.clone();
                node.status = BuildStatus::Pending;
                node.dependent_ids.clear();
                for (new_id, depends_on) in &announcement.edges {
                    if *new_id == node.id && !node.dependency_ids.contains(depends_on) {
                        node.dependency_ids.push(depends_on.clone());
                    }
                }

                if let Some(existing) = graph.node(&node.id) {
                    if existing.same_definition(&node) {
                        continue;
                    }
                    return Err(GraphError::ConflictingDiscovery(node.id.clone()));
                }
                if let Some(already) = incoming.get(&node.id) {
                    if already.same_definition(&node) {
                        continue;
                    }
                    return Err(GraphError::ConflictingDiscovery(node.id.clone()));
                }
                incoming.insert(node.id.clone(), node);
            }
        }

        // Every extra edge must name an announced or existing node on both
        // ends.
        for announcement in &batch {
            for (new_id, depends_on) in &announcement.edges {
                if !incoming.contains_key(new_id) && !graph.contains(new_id) {
                    return Err(GraphError::UnknownTarget(new_id.clone()));
                }
                if !incoming.contains_key(depends_on) && !graph.contains(depends_on) {
                    return Err(GraphError::MissingDependency {
                        target: new_id.clone(),
                        dependency: depends_on.clone(),
                    });
                }
            }
        }

        if incoming.is_empty() {
            return Ok(Vec::new());
        }

        // Stage into a copy; commit only after the augmented graph proves
        // acyclic.
        let mut staged = graph.clone();
        let mut nodes: Vec<BuildNode> = incoming.into_values().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let inserted: Vec<TargetId> = nodes.iter().map(|n| n.id.clone()).collect();
        staged.extend(nodes)?;
        staged.topological_sort()?;

        // Pending-dep counts for the inserted nodes reflect the statuses
        // already reached by their dependencies.
        for id in &inserted {
            let count = {
                let node = staged.node(id).expect("just inserted");
                node.dependency_ids
                    .iter()
                    .filter(|dep| {
                        staged
                            .node(dep)
                            .map(|d| !d.status.is_satisfied())
                            .unwrap_or(true)
                    })
                    .count()
            };
            staged.node_mut(id).expect("just inserted").pending_deps = count;
        }

        *graph = staged;
        log::info!("Discovery applied: {} new targets", inserted.len());

        let mut ready: Vec<TargetId> = inserted
            .into_iter()
            .filter(|id| graph.node(id).map(|n| n.is_ready()).unwrap_or(false))
            .collect();
        ready.sort();
        Ok(ready)
    }
}
