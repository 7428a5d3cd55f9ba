//! # Build Graph
//!
//! The immutable-after-construction dependency graph:
//! - Node arena keyed by `TargetId` (references are ids, never pointers, so
//!   the inherent dependency/dependent cycles of references stay trivially
//!   serializable)
//! - Deterministic topological sort with minimal-cycle reporting
//! - Transitive reverse-dependent queries for failure propagation
//! - A structure signature consumed by the checkpoint layer
//! - The query expression language used by the CLI

use crate::core::TargetId;
use thiserror::Error;

/// Graph error types
#[derive(Error, Debug)]
pub enum GraphError {
    /// Dependency cycle; `path` is one minimal offending cycle
    #[error("Dependency cycle: {}", format_cycle(.path))]
    Cycle {
        /// The cycle, first node repeated at the end
        path: Vec<TargetId>,
    },

    /// An edge points at a target that is not in the graph
    #[error("{target} depends on missing target {dependency}")]
    MissingDependency {
        /// Node with the dangling edge
        target: TargetId,
        /// The id that failed to resolve
        dependency: TargetId,
    },

    /// Two different definitions for one id
    #[error("Duplicate target: {0}")]
    DuplicateTarget(TargetId),

    /// A discovery announcement conflicts with an existing definition
    #[error("Discovery conflicts with existing target {0}")]
    ConflictingDiscovery(TargetId),

    /// Lookup of an id that is not in the graph
    #[error("Unknown target: {0}")]
    UnknownTarget(TargetId),
}

fn format_cycle(path: &[TargetId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Result type for graph operations
pub type Result<T> = std::result::Result<T, GraphError>;

#[allow(clippy::module_inception)]
pub mod graph;
pub mod query;

pub use graph::BuildGraph;
pub use query::{QueryError, QueryExpr};
