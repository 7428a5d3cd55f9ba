//! Coordinator-facing scheduling facade

use super::queue::ReadyQueue;
use super::worker::WorkerPool;
use super::BuildJob;
use crate::core::TargetId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Ready-queue plus worker-pool pairing.
///
/// `submit` accepts only genuinely ready jobs and is idempotent: a target
/// that is already queued or mid-execution is dropped silently. The
/// coordinator drains with `dequeue_ready` and runs batches through
/// `execute_batch`; results come back in batch order.
pub struct Scheduler {
    queue: ReadyQueue,
    pool: WorkerPool,
    executing: Mutex<HashSet<TargetId>>,
    active: AtomicUsize,
}

impl Scheduler {
    /// Spin up `workers` worker threads.
    pub fn new(workers: usize) -> Self {
        Scheduler {
            queue: ReadyQueue::new(),
            pool: WorkerPool::new(workers),
            executing: Mutex::new(HashSet::new()),
            active: AtomicUsize::new(0),
        }
    }

    /// Number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.pool.size()
    }

    /// Enqueue a ready job. No-ops (returning false) when the node is not
    /// ready, already queued, or already executing.
    pub fn submit(&self, job: BuildJob) -> bool {
        if !job.node.is_ready() {
            return false;
        }
        if self.executing.lock().contains(job.id()) {
            return false;
        }
        self.queue.push(Arc::new(job))
    }

    /// Pull up to `max` ready jobs for the next batch. Pulled jobs are
    /// tracked as executing until their batch completes.
    pub fn dequeue_ready(&self, max: usize) -> Vec<Arc<BuildJob>> {
        let batch = self.queue.pop_batch(max);
        if !batch.is_empty() {
            let mut executing = self.executing.lock();
            for job in &batch {
                executing.insert(job.id().clone());
            }
            self.active.fetch_add(batch.len(), Ordering::SeqCst);
        }
        batch
    }

    /// Run a batch across the pool, returning results in input order. The
    /// batch's targets stop being "executing" when this returns.
    pub fn execute_batch<F, R>(&self, batch: &[Arc<BuildJob>], f: Arc<F>) -> Vec<R>
    where
        F: Fn(&BuildJob) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let results = self.pool.execute_batch(batch, f);
        {
            let mut executing = self.executing.lock();
            for job in batch {
                executing.remove(job.id());
            }
        }
        self.active.fetch_sub(batch.len(), Ordering::SeqCst);
        results
    }

    /// Jobs currently dequeued but not yet completed.
    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Jobs waiting in the ready queue.
    pub fn queued_tasks(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BuildNode, BuildStatus, Language, TargetKind};
    use crate::scheduler::Priority;

    fn job(label: &str) -> BuildJob {
        let node = BuildNode::new(
            TargetId::parse(label).unwrap(),
            TargetKind::Library,
            Language::new("cpp"),
        );
        BuildJob::new(node, Vec::new(), Priority::Normal)
    }

    #[test]
    fn test_submit_requires_ready() {
        let scheduler = Scheduler::new(1);

        let mut blocked = job("//x:blocked");
        blocked.node.pending_deps = 2;
        assert!(!scheduler.submit(blocked));

        let mut building = job("//x:building");
        building.node.status = BuildStatus::Building;
        assert!(!scheduler.submit(building));

        assert!(scheduler.submit(job("//x:ready")));
        assert_eq!(scheduler.queued_tasks(), 1);
    }

    #[test]
    fn test_submit_idempotent_while_queued() {
        let scheduler = Scheduler::new(1);
        assert!(scheduler.submit(job("//x:a")));
        assert!(!scheduler.submit(job("//x:a")));
    }

    #[test]
    fn test_submit_idempotent_while_executing() {
        let scheduler = Scheduler::new(1);
        scheduler.submit(job("//x:a"));
        let batch = scheduler.dequeue_ready(1);
        assert_eq!(batch.len(), 1);
        assert_eq!(scheduler.active_tasks(), 1);

        // Mid-batch resubmission is dropped.
        assert!(!scheduler.submit(job("//x:a")));

        let _ = scheduler.execute_batch(&batch, Arc::new(|_: &BuildJob| ()));
        assert_eq!(scheduler.active_tasks(), 0);

        // After completion, submission works again.
        assert!(scheduler.submit(job("//x:a")));
    }

    #[test]
    fn test_batch_results_in_order() {
        let scheduler = Scheduler::new(4);
        for i in 0..8 {
            scheduler.submit(job(&format!("//x:t{}", i)));
        }
        let batch = scheduler.dequeue_ready(8);
        let results = scheduler.execute_batch(
            &batch,
            Arc::new(|job: &BuildJob| job.id().as_str().to_string()),
        );
        for (job, result) in batch.iter().zip(&results) {
            assert_eq!(job.id().as_str(), result);
        }
    }

    #[test]
    fn test_dequeue_caps_at_max() {
        let scheduler = Scheduler::new(2);
        for i in 0..5 {
            scheduler.submit(job(&format!("//x:t{}", i)));
        }
        assert_eq!(scheduler.dequeue_ready(2).len(), 2);
        assert_eq!(scheduler.queued_tasks(), 3);
    }
}
