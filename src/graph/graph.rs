//! Node arena, topological analysis, and the structure signature

use super::{GraphError, Result};
use crate::core::{BuildNode, TargetId};
use crate::hash::{Digest, Hasher};
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet, VecDeque};
use std::cmp::Reverse;

/// The build graph: a mapping from id to node with a consistent inverse
/// dependency index.
///
/// Built once from workspace analysis and augmented only through the
/// discovery protocol. Between scheduler batches the coordinator is the sole
/// mutator; during a batch the graph is effectively immutable.
#[derive(Debug, Clone, Default)]
pub struct BuildGraph {
    nodes: HashMap<TargetId, BuildNode>,
}

impl BuildGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a node set, wiring the inverse dependency index
    /// and validating that every edge resolves.
    pub fn from_nodes(nodes: Vec<BuildNode>) -> Result<Self> {
        let mut graph = BuildGraph::new();
        for mut node in nodes {
            node.dependent_ids.clear();
            if graph.nodes.contains_key(&node.id) {
                return Err(GraphError::DuplicateTarget(node.id));
            }
            graph.nodes.insert(node.id.clone(), node);
        }
        graph.rebuild_dependents()?;
        Ok(graph)
    }

    /// Insert one node, wiring its dependencies' inverse index. Allowed only
    /// during construction and discovery; every dependency must already be
    /// present.
    pub fn add_node(&mut self, mut node: BuildNode) -> Result<()> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::DuplicateTarget(node.id));
        }
        for dep in &node.dependency_ids {
            if !self.nodes.contains_key(dep) {
                return Err(GraphError::MissingDependency {
                    target: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        node.dependent_ids.clear();
        let id = node.id.clone();
        let deps = node.dependency_ids.clone();
        self.nodes.insert(id.clone(), node);
        for dep in deps {
            let dep_node = self.nodes.get_mut(&dep).expect("dependency just checked");
            if !dep_node.dependent_ids.contains(&id) {
                dep_node.dependent_ids.push(id.clone());
            }
        }
        Ok(())
    }

    /// Insert several nodes that may depend on one another. Validates edges
    /// across the union of existing and new nodes and wires the inverse
    /// index. The graph is left unchanged on error only if the caller
    /// staged into a clone; the discovery engine does exactly that.
    pub fn extend(&mut self, nodes: Vec<BuildNode>) -> Result<()> {
        let mut added = Vec::with_capacity(nodes.len());
        for mut node in nodes {
            if self.nodes.contains_key(&node.id) {
                return Err(GraphError::DuplicateTarget(node.id));
            }
            node.dependent_ids.clear();
            added.push(node.id.clone());
            self.nodes.insert(node.id.clone(), node);
        }
        for id in &added {
            let deps = self.nodes[id].dependency_ids.clone();
            for dep in deps {
                if !self.nodes.contains_key(&dep) {
                    return Err(GraphError::MissingDependency {
                        target: id.clone(),
                        dependency: dep,
                    });
                }
                let dep_node = self.nodes.get_mut(&dep).expect("checked above");
                if !dep_node.dependent_ids.contains(id) {
                    dep_node.dependent_ids.push(id.clone());
                }
            }
        }
        Ok(())
    }

    /// Read-only lookup.
    pub fn node(&self, id: &TargetId) -> Option<&BuildNode> {
        self.nodes.get(id)
    }

    /// Mutable lookup, for the coordinator's between-batch transitions.
    pub fn node_mut(&mut self, id: &TargetId) -> Option<&mut BuildNode> {
        self.nodes.get_mut(id)
    }

    /// Node count.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether an id is present.
    pub fn contains(&self, id: &TargetId) -> bool {
        self.nodes.contains_key(id)
    }

    /// All ids, ascending.
    pub fn ids(&self) -> Vec<TargetId> {
        let mut ids: Vec<TargetId> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Iterate nodes in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &BuildNode> {
        self.nodes.values()
    }

    /// Deterministic topological order: Kahn's algorithm with ties broken by
    /// id ascending. On a cycle, reports one minimal offending cycle path.
    pub fn topological_sort(&self) -> Result<Vec<TargetId>> {
        let mut in_degree: HashMap<&TargetId, usize> = self
            .nodes
            .values()
            .map(|node| (&node.id, node.dependency_ids.len()))
            .collect();

        let mut heap: BinaryHeap<Reverse<&TargetId>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| Reverse(*id))
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(id)) = heap.pop() {
            order.push(id.clone());
            let node = &self.nodes[id];
            for dependent in &node.dependent_ids {
                let degree = in_degree
                    .get_mut(dependent)
                    .expect("dependent is in the graph");
                *degree -= 1;
                if *degree == 0 {
                    heap.push(Reverse(dependent));
                }
            }
        }

        if order.len() < self.nodes.len() {
            return Err(GraphError::Cycle {
                path: self.find_cycle(),
            });
        }
        Ok(order)
    }

    /// Locate one cycle via DFS over the unresolved remainder. The returned
    /// path repeats the entry node at the end.
    fn find_cycle(&self) -> Vec<TargetId> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        let mut marks: HashMap<&TargetId, Mark> =
            self.nodes.keys().map(|id| (id, Mark::White)).collect();
        let mut roots: Vec<&TargetId> = self.nodes.keys().collect();
        roots.sort();

        for root in roots {
            if marks[root] != Mark::White {
                continue;
            }
            // Iterative DFS along dependency edges, tracking the gray path.
            let mut stack: Vec<(&TargetId, usize)> = vec![(root, 0)];
            let mut path: Vec<&TargetId> = vec![root];
            marks.insert(root, Mark::Gray);

            while let Some((id, next_edge)) = stack.last().copied() {
                let deps = &self.nodes[id].dependency_ids;
                if next_edge < deps.len() {
                    stack.last_mut().expect("stack nonempty").1 += 1;
                    let dep = &deps[next_edge];
                    match marks.get(dep).copied() {
                        Some(Mark::White) => {
                            marks.insert(dep, Mark::Gray);
                            stack.push((dep, 0));
                            path.push(dep);
                        }
                        Some(Mark::Gray) => {
                            let start = path
                                .iter()
                                .position(|p| *p == dep)
                                .expect("gray node is on the path");
                            let mut cycle: Vec<TargetId> =
                                path[start..].iter().map(|p| (*p).clone()).collect();
                            cycle.push(dep.clone());
                            return cycle;
                        }
                        _ => {}
                    }
                } else {
                    marks.insert(id, Mark::Black);
                    stack.pop();
                    path.pop();
                }
            }
        }
        Vec::new()
    }

    /// The transitive consumers of a seed set, used to propagate failure.
    /// The seeds themselves are not included. Output is sorted.
    pub fn reverse_dependents(&self, seeds: &[TargetId]) -> Vec<TargetId> {
        let mut seen: HashSet<&TargetId> = HashSet::new();
        let mut queue: VecDeque<&TargetId> = seeds.iter().collect();
        let seed_set: HashSet<&TargetId> = seeds.iter().collect();

        while let Some(id) = queue.pop_front() {
            if let Some(node) = self.nodes.get(id) {
                for dependent in &node.dependent_ids {
                    if seen.insert(dependent) {
                        queue.push_back(dependent);
                    }
                }
            }
        }

        let mut result: Vec<TargetId> = seen
            .into_iter()
            .filter(|id| !seed_set.contains(*id))
            .cloned()
            .collect();
        result.sort();
        result
    }

    /// Digest over the id-sorted `(id, sorted(dependency_ids))` pairs. Two
    /// graphs with the same structure sign identically regardless of
    /// insertion order or runtime state.
    pub fn signature(&self, hasher: &Hasher) -> Digest {
        let sorted: BTreeMap<&TargetId, Vec<&TargetId>> = self
            .nodes
            .values()
            .map(|node| {
                let mut deps: Vec<&TargetId> = node.dependency_ids.iter().collect();
                deps.sort();
                (&node.id, deps)
            })
            .collect();

        let mut lines = Vec::with_capacity(sorted.len());
        for (id, deps) in sorted {
            let mut line = String::from(id.as_str());
            for dep in deps {
                line.push('\u{1}');
                line.push_str(dep.as_str());
            }
            lines.push(line);
        }
        hasher.hash_strings(lines)
    }

    /// Initialize every node's `pending_deps` to the count of dependencies
    /// whose status is not yet satisfied.
    pub fn init_pending_deps(&mut self) {
        let pending: HashMap<TargetId, usize> = self
            .nodes
            .values()
            .map(|node| {
                let count = node
                    .dependency_ids
                    .iter()
                    .filter(|dep| {
                        self.nodes
                            .get(dep)
                            .map(|d| !d.status.is_satisfied())
                            .unwrap_or(true)
                    })
                    .count();
                (node.id.clone(), count)
            })
            .collect();
        for (id, count) in pending {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.pending_deps = count;
            }
        }
    }

    /// The subgraph reachable from `root` along dependency edges, including
    /// `root`. Dependent indexes are rewired for the restricted node set.
    pub fn subgraph(&self, root: &TargetId) -> Result<BuildGraph> {
        if !self.nodes.contains_key(root) {
            return Err(GraphError::UnknownTarget(root.clone()));
        }
        let mut keep: HashSet<TargetId> = HashSet::new();
        let mut queue = VecDeque::from([root.clone()]);
        while let Some(id) = queue.pop_front() {
            if !keep.insert(id.clone()) {
                continue;
            }
            for dep in &self.nodes[&id].dependency_ids {
                queue.push_back(dep.clone());
            }
        }
        let nodes = keep
            .into_iter()
            .map(|id| self.nodes[&id].clone())
            .collect();
        BuildGraph::from_nodes(nodes)
    }

    fn rebuild_dependents(&mut self) -> Result<()> {
        let edges: Vec<(TargetId, TargetId)> = self
            .nodes
            .values()
            .flat_map(|node| {
                node.dependency_ids
                    .iter()
                    .map(move |dep| (dep.clone(), node.id.clone()))
            })
            .collect();

        for (dep, dependent) in &edges {
            if !self.nodes.contains_key(dep) {
                return Err(GraphError::MissingDependency {
                    target: dependent.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        for (dep, dependent) in edges {
            let node = self.nodes.get_mut(&dep).expect("checked above");
            if !node.dependent_ids.contains(&dependent) {
                node.dependent_ids.push(dependent);
            }
        }
        for node in self.nodes.values_mut() {
            node.dependent_ids.sort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BuildStatus, Language, TargetKind};

    fn node(label: &str, deps: &[&str]) -> BuildNode {
        BuildNode::new(
            TargetId::parse(label).unwrap(),
            TargetKind::Library,
            Language::new("cpp"),
        )
        .with_dependencies(deps.iter().map(|d| TargetId::parse(d).unwrap()).collect())
    }

    fn id(label: &str) -> TargetId {
        TargetId::parse(label).unwrap()
    }

    /// Chain //x:a -> //x:b -> //x:c (a is the leaf dependency).
    fn chain() -> BuildGraph {
        BuildGraph::from_nodes(vec![
            node("//x:a", &[]),
            node("//x:b", &["//x:a"]),
            node("//x:c", &["//x:b"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_dependents_are_inverse_of_dependencies() {
        let graph = chain();
        assert_eq!(graph.node(&id("//x:a")).unwrap().dependent_ids, vec![id("//x:b")]);
        assert_eq!(graph.node(&id("//x:b")).unwrap().dependent_ids, vec![id("//x:c")]);
        assert!(graph.node(&id("//x:c")).unwrap().dependent_ids.is_empty());
    }

    #[test]
    fn test_topological_order_of_chain() {
        let graph = chain();
        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec![id("//x:a"), id("//x:b"), id("//x:c")]);
    }

    #[test]
    fn test_topological_ties_break_by_id() {
        let graph = BuildGraph::from_nodes(vec![
            node("//x:z", &[]),
            node("//x:a", &[]),
            node("//x:m", &["//x:a", "//x:z"]),
        ])
        .unwrap();
        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec![id("//x:a"), id("//x:z"), id("//x:m")]);
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let graph = BuildGraph::from_nodes(vec![
            node("//x:a", &["//x:b"]),
            node("//x:b", &["//x:a"]),
        ])
        .unwrap();
        match graph.topological_sort() {
            Err(GraphError::Cycle { path }) => {
                assert!(path.len() >= 3);
                assert_eq!(path.first(), path.last());
                assert!(path.contains(&id("//x:a")));
                assert!(path.contains(&id("//x:b")));
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_self_cycle_detected() {
        let graph = BuildGraph::from_nodes(vec![node("//x:a", &["//x:a"])]).unwrap();
        assert!(matches!(
            graph.topological_sort(),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let result = BuildGraph::from_nodes(vec![node("//x:a", &["//x:ghost"])]);
        assert!(matches!(
            result,
            Err(GraphError::MissingDependency { .. })
        ));
    }

    #[test]
    fn test_duplicate_rejected() {
        let result = BuildGraph::from_nodes(vec![node("//x:a", &[]), node("//x:a", &[])]);
        assert!(matches!(result, Err(GraphError::DuplicateTarget(_))));
    }

    #[test]
    fn test_add_node_wires_dependents() {
        let mut graph = chain();
        graph
            .add_node(node("//x:d", &["//x:c", "//x:a"]))
            .unwrap();
        assert!(graph
            .node(&id("//x:a"))
            .unwrap()
            .dependent_ids
            .contains(&id("//x:d")));
        assert_eq!(graph.topological_sort().unwrap().last(), Some(&id("//x:d")));
    }

    #[test]
    fn test_reverse_dependents_transitive() {
        let graph = BuildGraph::from_nodes(vec![
            node("//x:a", &[]),
            node("//x:b", &["//x:a"]),
            node("//x:c", &["//x:a"]),
            node("//x:d", &["//x:b", "//x:c"]),
        ])
        .unwrap();
        assert_eq!(
            graph.reverse_dependents(&[id("//x:a")]),
            vec![id("//x:b"), id("//x:c"), id("//x:d")]
        );
        assert_eq!(graph.reverse_dependents(&[id("//x:b")]), vec![id("//x:d")]);
        assert!(graph.reverse_dependents(&[id("//x:d")]).is_empty());
    }

    #[test]
    fn test_signature_ignores_runtime_state() {
        let hasher = Hasher::new();
        let a = chain();
        let mut b = chain();
        b.node_mut(&id("//x:a")).unwrap().status = BuildStatus::Success;
        b.node_mut(&id("//x:b")).unwrap().pending_deps = 9;
        assert_eq!(a.signature(&hasher), b.signature(&hasher));
    }

    #[test]
    fn test_signature_sees_structure_changes() {
        let hasher = Hasher::new();
        let a = chain();
        let mut b = chain();
        b.add_node(node("//x:d", &["//x:c"])).unwrap();
        assert_ne!(a.signature(&hasher), b.signature(&hasher));
    }

    #[test]
    fn test_init_pending_deps_counts_unsatisfied() {
        let mut graph = chain();
        graph.node_mut(&id("//x:a")).unwrap().status = BuildStatus::Cached;
        graph.init_pending_deps();
        assert_eq!(graph.node(&id("//x:a")).unwrap().pending_deps, 0);
        assert_eq!(graph.node(&id("//x:b")).unwrap().pending_deps, 0);
        assert_eq!(graph.node(&id("//x:c")).unwrap().pending_deps, 1);
    }

    #[test]
    fn test_subgraph_restricts_to_dependencies() {
        let graph = BuildGraph::from_nodes(vec![
            node("//x:a", &[]),
            node("//x:b", &["//x:a"]),
            node("//x:c", &["//x:b"]),
            node("//x:other", &[]),
        ])
        .unwrap();
        let sub = graph.subgraph(&id("//x:b")).unwrap();
        assert_eq!(sub.ids(), vec![id("//x:a"), id("//x:b")]);
        assert!(sub.node(&id("//x:a")).unwrap().dependent_ids == vec![id("//x:b")]);
    }

    #[test]
    fn test_subgraph_unknown_root() {
        let graph = chain();
        assert!(matches!(
            graph.subgraph(&id("//x:ghost")),
            Err(GraphError::UnknownTarget(_))
        ));
    }
}
