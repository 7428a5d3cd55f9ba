//! Priority hints from graph shape
//!
//! Two signals feed a node's hint: its height (the longest dependency chain
//! above it, i.e. how much work is gated behind it) and the fan-out of its
//! direct dependents. Nodes gating the most downstream work dispatch first,
//! which shortens the critical path under bounded parallelism.

use super::Priority;
use crate::core::TargetId;
use crate::graph::BuildGraph;
use std::collections::HashMap;

/// Computes per-node priority hints for a graph.
pub struct PriorityAnalyzer;

impl PriorityAnalyzer {
    /// Score every node. Returns nothing for an unsortable (cyclic) graph;
    /// the caller will have rejected it already.
    pub fn analyze(graph: &BuildGraph) -> HashMap<TargetId, Priority> {
        let order = match graph.topological_sort() {
            Ok(order) => order,
            Err(_) => return HashMap::new(),
        };

        // Height: longest chain of dependents above each node. Walk the
        // topological order backwards so every dependent is already scored.
        let mut height: HashMap<&TargetId, usize> = HashMap::with_capacity(order.len());
        for id in order.iter().rev() {
            let node = graph.node(id).expect("sorted id is in the graph");
            let h = node
                .dependent_ids
                .iter()
                .filter_map(|dep| height.get(dep))
                .map(|h| h + 1)
                .max()
                .unwrap_or(0);
            height.insert(id, h);
        }

        order
            .iter()
            .map(|id| {
                let node = graph.node(id).expect("sorted id is in the graph");
                let score = height[id] + node.dependent_ids.len();
                (id.clone(), priority_for(score))
            })
            .collect()
    }
}

fn priority_for(score: usize) -> Priority {
    match score {
        0 => Priority::Low,
        1..=2 => Priority::Normal,
        3..=5 => Priority::High,
        _ => Priority::Critical,
    }
}
