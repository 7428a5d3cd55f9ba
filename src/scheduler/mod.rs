//! # Parallel Scheduler
//!
//! Dependency-ready dispatch across a fixed pool of OS worker threads:
//! - `queue`: priority-aware FIFO ready queue holding heap-stable
//!   (`Arc`-allocated) job records
//! - `worker`: the thread pool, fed over crossbeam channels, returning batch
//!   results in input order
//! - `scheduler`: the coordinator-facing facade (`submit`, `dequeue_ready`,
//!   `execute_batch`)
//! - `priority`: optional depth/fan-out analysis producing priority hints
//!
//! Job records are handed to workers as owned `Arc` clones. Nothing a worker
//! holds can be invalidated by later submissions; the queue never lends out
//! pointers into its own storage.

use crate::core::{BuildNode, TargetId};
use crate::hash::Digest;

/// Dispatch priority. Higher dispatches first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Background work
    Low = 0,
    /// Default
    Normal = 1,
    /// Wide fan-out
    High = 2,
    /// On the critical path
    Critical = 3,
}

impl Priority {
    /// All priorities, highest first. Dispatch scans in this order.
    pub const DESCENDING: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Lane index for queue storage.
    pub fn lane(&self) -> usize {
        *self as usize
    }
}

/// One unit of dispatchable work: an owned snapshot of the node plus the
/// output digests of its already-completed dependencies.
///
/// Jobs are always heap-allocated behind `Arc` and identified by target id;
/// a worker finishing batch `N` can safely hold its job while batch `N+1`
/// is being enqueued.
#[derive(Debug)]
pub struct BuildJob {
    /// Read-only node snapshot taken at submit time
    pub node: BuildNode,
    /// Output digests of completed dependencies, keyed by label string
    pub dep_outputs: Vec<(TargetId, Digest)>,
    /// Dispatch priority
    pub priority: Priority,
}

impl BuildJob {
    /// Snapshot a node with its dependency outputs.
    pub fn new(node: BuildNode, dep_outputs: Vec<(TargetId, Digest)>, priority: Priority) -> Self {
        BuildJob {
            node,
            dep_outputs,
            priority,
        }
    }

    /// The job's target id.
    pub fn id(&self) -> &TargetId {
        &self.node.id
    }
}

pub mod priority;
pub mod queue;
#[allow(clippy::module_inception)]
pub mod scheduler;
pub mod worker;

pub use priority::PriorityAnalyzer;
pub use queue::ReadyQueue;
pub use scheduler::Scheduler;
pub use worker::WorkerPool;
