//! # Build Coordination
//!
//! The loop that drives a whole session: sort the graph, apply any valid
//! checkpoint, seed the ready queue, dispatch batches to the scheduler,
//! apply discoveries at batch boundaries, cascade failures, and emit the
//! summary. The coordinator thread is the only writer of node status,
//! pending-dep counts, and the checkpoint file.

use crate::cache::CacheError;
use crate::graph::GraphError;
use thiserror::Error;

/// Coordinator error types
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// Graph analysis failed (cycles, dangling edges); surfaces before any
    /// node is scheduled
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Cache persistence failed in a way that could not be recovered
    /// locally
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// I/O error outside the cache layer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invariant violation; names the invariant that broke
    #[error("Internal invariant violated: {0}")]
    Internal(String),
}

/// Result type for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;

#[allow(clippy::module_inception)]
pub mod coordinator;
pub mod observer;
pub mod summary;

pub use coordinator::Coordinator;
pub use observer::{BuildObserver, LogObserver, NullObserver};
pub use summary::BuildSummary;
