//! Priority-aware FIFO ready queue

use super::{BuildJob, Priority};
use crate::core::TargetId;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// The ready queue: FIFO within a priority, higher priorities first.
///
/// Stores `Arc<BuildJob>` records, so identity is stable for as long as any
/// worker holds a reference; pushing later batches can never relocate an
/// outstanding job. Submission is idempotent per target id until the job is
/// popped.
pub struct ReadyQueue {
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    lanes: [VecDeque<Arc<BuildJob>>; 4],
    queued: HashSet<TargetId>,
}

impl ReadyQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        ReadyQueue {
            inner: Mutex::new(QueueInner {
                lanes: Default::default(),
                queued: HashSet::new(),
            }),
        }
    }

    /// Enqueue a job. Returns false (and drops the duplicate) when a job for
    /// the same target is already queued.
    pub fn push(&self, job: Arc<BuildJob>) -> bool {
        let mut inner = self.inner.lock();
        if !inner.queued.insert(job.id().clone()) {
            return false;
        }
        let lane = job.priority.lane();
        inner.lanes[lane].push_back(job);
        true
    }

    /// Dequeue the highest-priority, oldest job.
    pub fn pop(&self) -> Option<Arc<BuildJob>> {
        let mut inner = self.inner.lock();
        for priority in Priority::DESCENDING {
            if let Some(job) = inner.lanes[priority.lane()].pop_front() {
                inner.queued.remove(job.id());
                return Some(job);
            }
        }
        None
    }

    /// Dequeue up to `max` jobs, highest priority first, FIFO within.
    pub fn pop_batch(&self, max: usize) -> Vec<Arc<BuildJob>> {
        let mut batch = Vec::with_capacity(max.min(self.len()));
        while batch.len() < max {
            match self.pop() {
                Some(job) => batch.push(job),
                None => break,
            }
        }
        batch
    }

    /// Whether a job for this target is currently queued.
    pub fn contains(&self, id: &TargetId) -> bool {
        self.inner.lock().queued.contains(id)
    }

    /// Jobs currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().queued.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().queued.is_empty()
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}
