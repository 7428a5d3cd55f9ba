//! Fixed worker thread pool fed over channels

use super::BuildJob;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Shutdown,
}

/// A pool of OS worker threads.
///
/// Workers block on a shared channel; any idle worker steals the next task,
/// so a slow job on one thread never strands queued work behind it. The pool
/// joins all threads on drop.
pub struct WorkerPool {
    sender: Sender<Message>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spin up `count` workers (at least one).
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        let (sender, receiver) = unbounded::<Message>();
        let handles = (0..count)
            .map(|index| {
                let receiver: Receiver<Message> = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("builder-worker-{}", index))
                    .spawn(move || worker_loop(index, receiver))
                    .expect("spawning a worker thread")
            })
            .collect();
        WorkerPool { sender, handles }
    }

    /// Number of worker threads.
    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Run `f` over every job in the batch, in parallel across the pool, and
    /// return the results in input order. Blocks until the whole batch is
    /// done.
    pub fn execute_batch<F, R>(&self, batch: &[Arc<BuildJob>], f: Arc<F>) -> Vec<R>
    where
        F: Fn(&BuildJob) -> R + Send + Sync + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = unbounded::<(usize, R)>();
        for (index, job) in batch.iter().enumerate() {
            let job = Arc::clone(job);
            let f = Arc::clone(&f);
            let result_tx = result_tx.clone();
            let task: Task = Box::new(move || {
                let result = f(&job);
                let _ = result_tx.send((index, result));
            });
            self.sender
                .send(Message::Run(task))
                .expect("worker pool is alive while the scheduler holds it");
        }
        drop(result_tx);

        let mut slots: Vec<Option<R>> = (0..batch.len()).map(|_| None).collect();
        for _ in 0..batch.len() {
            let (index, result) = result_rx
                .recv()
                .expect("every dispatched task reports exactly once");
            slots[index] = Some(result);
        }
        slots
            .into_iter()
            .map(|slot| slot.expect("every slot filled"))
            .collect()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for _ in &self.handles {
            let _ = self.sender.send(Message::Shutdown);
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(index: usize, receiver: Receiver<Message>) {
    log::trace!("Worker {} up", index);
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Run(task) => task(),
            Message::Shutdown => break,
        }
    }
    log::trace!("Worker {} down", index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BuildNode, Language, TargetId, TargetKind};
    use crate::scheduler::Priority;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn jobs(n: usize) -> Vec<Arc<BuildJob>> {
        (0..n)
            .map(|i| {
                let node = BuildNode::new(
                    TargetId::parse(&format!("//x:t{}", i)).unwrap(),
                    TargetKind::Library,
                    Language::new("cpp"),
                );
                Arc::new(BuildJob::new(node, Vec::new(), Priority::Normal))
            })
            .collect()
    }

    #[test]
    fn test_results_in_input_order() {
        let pool = WorkerPool::new(4);
        let batch = jobs(16);
        let results = pool.execute_batch(
            &batch,
            Arc::new(|job: &BuildJob| job.id().as_str().to_string()),
        );
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result, &format!("//x:t{}", i));
        }
    }

    #[test]
    fn test_all_tasks_run_exactly_once() {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        let pool = WorkerPool::new(3);
        let batch = jobs(20);
        let _ = pool.execute_batch(
            &batch,
            Arc::new(|_: &BuildJob| {
                COUNTER.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(COUNTER.load(Ordering::SeqCst), 20);
    }

    #[test]
    fn test_batch_larger_than_pool() {
        let pool = WorkerPool::new(2);
        let batch = jobs(10);
        let results = pool.execute_batch(&batch, Arc::new(|_: &BuildJob| 1usize));
        assert_eq!(results.iter().sum::<usize>(), 10);
    }

    #[test]
    fn test_empty_batch() {
        let pool = WorkerPool::new(2);
        let results = pool.execute_batch(&[], Arc::new(|_: &BuildJob| ()));
        assert!(results.is_empty());
    }

    #[test]
    fn test_pool_size_floor() {
        let pool = WorkerPool::new(0);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn test_successive_batches_reuse_workers() {
        let pool = WorkerPool::new(2);
        for round in 0..3 {
            let batch = jobs(4);
            let results = pool.execute_batch(&batch, Arc::new(move |_: &BuildJob| round));
            assert_eq!(results, vec![round; 4]);
        }
    }
}
