//! The session loop

use super::observer::{BuildObserver, LogObserver};
use super::summary::BuildSummary;
use super::Result;
use crate::cache::{ActionCache, TargetCache};
use crate::checkpoint::{CheckpointManager, CheckpointRecord};
use crate::core::config::CacheBudget;
use crate::core::{BuildOptions, BuildStatus, TargetId};
use crate::discovery::{DiscoveryBuffer, DiscoveryEngine};
use crate::exec::{CancelReason, CancellationToken, Executor, HandlerRegistry, NodeResult};
use crate::graph::BuildGraph;
use crate::hash::{Digest, Hasher};
use crate::scheduler::{BuildJob, Priority, PriorityAnalyzer, Scheduler};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Drives one build session over a graph.
///
/// Owns the graph for the session's duration and is the only thread that
/// mutates node status, pending-dep counts, or the checkpoint. Workers see
/// owned node snapshots and talk back through batch results.
pub struct Coordinator {
    workspace: std::path::PathBuf,
    graph: BuildGraph,
    options: BuildOptions,
    scheduler: Scheduler,
    executor: Arc<Executor>,
    targets: Arc<TargetCache>,
    actions: Arc<ActionCache>,
    hasher: Arc<Hasher>,
    checkpoint: CheckpointManager,
    discoveries: Arc<DiscoveryBuffer>,
    observer: Arc<dyn BuildObserver>,
    session: CancellationToken,
}

impl Coordinator {
    /// Wire a session for a workspace. Caches open (and recover) here.
    pub fn new(
        workspace: &Path,
        graph: BuildGraph,
        registry: Arc<HandlerRegistry>,
        options: BuildOptions,
    ) -> Self {
        let hasher = Arc::new(Hasher::new());
        let targets = Arc::new(TargetCache::open(workspace, CacheBudget::targets_from_env()));
        let actions = Arc::new(ActionCache::open(workspace, CacheBudget::actions_from_env()));
        let discoveries = Arc::new(DiscoveryBuffer::new());
        let executor = Arc::new(Executor::new(
            workspace.to_path_buf(),
            Arc::clone(&hasher),
            Arc::clone(&targets),
            Arc::clone(&actions),
            registry,
            Arc::clone(&discoveries),
        ));
        let scheduler = Scheduler::new(options.workers);
        let checkpoint = CheckpointManager::open(workspace);
        let session = CancellationToken::with_deadline(
            options.global_timeout.map(|t| Instant::now() + t),
        );

        Coordinator {
            workspace: workspace.to_path_buf(),
            graph,
            options,
            scheduler,
            executor,
            targets,
            actions,
            hasher,
            checkpoint,
            discoveries,
            observer: Arc::new(LogObserver),
            session,
        }
    }

    /// Replace the default log-backed observer.
    pub fn with_observer(mut self, observer: Arc<dyn BuildObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// A handle external code (Ctrl-C wiring) can trip.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.session.clone()
    }

    /// The session's graph.
    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    /// Run the session to completion and report the summary. Graph errors
    /// surface before anything is scheduled; build failures are counted,
    /// cascaded, and reported in the summary rather than returned as `Err`.
    pub fn run(&mut self) -> Result<BuildSummary> {
        let started = Instant::now();
        let sorted = self.graph.topological_sort()?;
        let priorities = PriorityAnalyzer::analyze(&self.graph);
        self.checkpoint.begin(&self.graph, &self.hasher);

        let mut summary = BuildSummary::default();
        let mut completed: HashMap<TargetId, Digest> = HashMap::new();

        if self.options.resume {
            self.apply_resume_plan(&mut summary, &mut completed);
        }
        self.graph.init_pending_deps();
        self.observer.build_started(self.graph.len());

        for id in &sorted {
            self.try_submit(id, &completed, &priorities);
        }

        loop {
            if self.session.is_cancelled() {
                self.skip_remaining(&mut summary);
                break;
            }

            self.apply_discoveries(&completed, &priorities);

            let batch = self.scheduler.dequeue_ready(self.scheduler.worker_count());
            if batch.is_empty() {
                if self.scheduler.active_tasks() == 0 {
                    // One more boundary: late discoveries may still be
                    // waiting to enter the graph.
                    self.apply_discoveries(&completed, &priorities);
                    if self.scheduler.queued_tasks() == 0 {
                        break;
                    }
                    continue;
                }
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }

            for job in &batch {
                if let Some(node) = self.graph.node_mut(job.id()) {
                    node.status = BuildStatus::Building;
                }
                self.checkpoint.record(CheckpointRecord::new(
                    job.id(),
                    BuildStatus::Building,
                    None,
                ));
                self.observer.node_started(job.id());
            }

            let results = {
                let executor = Arc::clone(&self.executor);
                let session = self.session.clone();
                let node_timeout = self.options.node_timeout;
                self.scheduler.execute_batch(
                    &batch,
                    Arc::new(move |job: &BuildJob| {
                        let deadline = node_timeout.map(|t| Instant::now() + t);
                        executor.run(job, &session.child(deadline))
                    }),
                )
            };

            for (job, result) in batch.iter().zip(results) {
                self.process_result(job, result, &mut summary, &mut completed, &priorities);
            }
            if let Err(err) = self.checkpoint.flush() {
                log::warn!("Checkpoint flush failed: {}", err);
            }

            if summary.failed > 0 && self.options.fail_fast {
                log::warn!("Fail-fast: stopping dispatch after first failure");
                self.session.trip(CancelReason::FailFast);
                self.skip_remaining(&mut summary);
                break;
            }
        }

        // Anything not driven to a terminal state is accounted as skipped.
        self.skip_remaining(&mut summary);

        summary.elapsed = started.elapsed();
        self.observer.build_finished(&summary);
        self.finish_session(&summary);
        Ok(summary)
    }

    fn apply_resume_plan(
        &mut self,
        summary: &mut BuildSummary,
        completed: &mut HashMap<TargetId, Digest>,
    ) {
        let plan = match self.checkpoint.resume_plan(&self.graph, &self.hasher) {
            Some(plan) => plan,
            None => return,
        };
        log::info!(
            "Resuming: {} of {} targets already complete ({:.0}% saved)",
            plan.skip.len(),
            plan.total,
            plan.savings() * 100.0
        );
        for (id, output_hash) in plan.skip {
            if let Some(node) = self.graph.node_mut(&id) {
                node.status = BuildStatus::Cached;
                summary.cached += 1;
            }
            if let Some(digest) = output_hash {
                completed.insert(id, digest);
            }
        }
    }

    fn apply_discoveries(
        &mut self,
        completed: &HashMap<TargetId, Digest>,
        priorities: &HashMap<TargetId, Priority>,
    ) {
        let batch = self.discoveries.drain();
        if batch.is_empty() {
            return;
        }
        match DiscoveryEngine::apply(&mut self.graph, batch) {
            Ok(ready) => {
                if !ready.is_empty() {
                    self.observer.discovery_applied(ready.len());
                }
                for id in ready {
                    self.try_submit(&id, completed, priorities);
                }
            }
            Err(err) => {
                // A rejected batch leaves the graph unchanged; the build
                // carries on with what it has.
                log::warn!("Discovery batch rejected: {}", err);
            }
        }
    }

    fn try_submit(
        &mut self,
        id: &TargetId,
        completed: &HashMap<TargetId, Digest>,
        priorities: &HashMap<TargetId, Priority>,
    ) {
        let job = {
            let node = match self.graph.node(id) {
                Some(node) => node,
                None => return,
            };
            if !node.is_ready() {
                return;
            }
            let dep_outputs: Vec<(TargetId, Digest)> = node
                .dependency_ids
                .iter()
                .filter_map(|dep| completed.get(dep).map(|digest| (dep.clone(), *digest)))
                .collect();
            let priority = priorities.get(id).copied().unwrap_or(Priority::Normal);
            BuildJob::new(node.clone(), dep_outputs, priority)
        };
        if self.scheduler.submit(job) {
            if let Some(node) = self.graph.node_mut(id) {
                node.status = BuildStatus::Ready;
            }
        }
    }

    fn process_result(
        &mut self,
        job: &Arc<BuildJob>,
        result: NodeResult,
        summary: &mut BuildSummary,
        completed: &mut HashMap<TargetId, Digest>,
        priorities: &HashMap<TargetId, Priority>,
    ) {
        let id = job.id().clone();
        match &result.outcome {
            Ok(success) => {
                let status = if success.cached {
                    summary.cached += 1;
                    BuildStatus::Cached
                } else {
                    summary.built += 1;
                    BuildStatus::Success
                };
                if let Some(node) = self.graph.node_mut(&id) {
                    node.status = status;
                }
                completed.insert(id.clone(), success.output_hash);
                self.checkpoint
                    .record(CheckpointRecord::new(&id, status, Some(success.output_hash)));
                self.release_dependents(&id, completed, priorities);
            }
            Err(err) => {
                log::error!("{} failed: {}", id, err);
                if let Some(node) = self.graph.node_mut(&id) {
                    node.status = BuildStatus::Failed;
                }
                summary.failed += 1;
                self.checkpoint
                    .record(CheckpointRecord::new(&id, BuildStatus::Failed, None));
                self.cascade_failure(&id, summary);
            }
        }
        self.observer.node_finished(&result);
    }

    fn release_dependents(
        &mut self,
        id: &TargetId,
        completed: &HashMap<TargetId, Digest>,
        priorities: &HashMap<TargetId, Priority>,
    ) {
        let dependents = match self.graph.node(id) {
            Some(node) => node.dependent_ids.clone(),
            None => return,
        };
        for dependent in dependents {
            let now_ready = match self.graph.node_mut(&dependent) {
                Some(node) => {
                    if node.pending_deps == 0 {
                        log::error!(
                            "Internal invariant violated: pending_deps underflow on {}",
                            dependent
                        );
                        continue;
                    }
                    node.pending_deps -= 1;
                    node.pending_deps == 0 && node.status == BuildStatus::Pending
                }
                None => false,
            };
            if now_ready {
                self.try_submit(&dependent, completed, priorities);
            }
        }
    }

    /// Transitive dependents of a failed node fail with it; only nodes that
    /// have not started are touched.
    fn cascade_failure(&mut self, id: &TargetId, summary: &mut BuildSummary) {
        for dependent in self.graph.reverse_dependents(&[id.clone()]) {
            if let Some(node) = self.graph.node_mut(&dependent) {
                if matches!(node.status, BuildStatus::Pending | BuildStatus::Ready) {
                    node.status = BuildStatus::Failed;
                    summary.failed += 1;
                    log::warn!("{} failed: dependency {} failed", dependent, id);
                    self.checkpoint.record(CheckpointRecord::new(
                        &dependent,
                        BuildStatus::Failed,
                        None,
                    ));
                }
            }
        }
    }

    fn skip_remaining(&mut self, summary: &mut BuildSummary) {
        for id in self.graph.ids() {
            if let Some(node) = self.graph.node_mut(&id) {
                if !node.status.is_terminal() {
                    node.status = BuildStatus::Skipped;
                    summary.skipped += 1;
                }
            }
        }
    }

    fn finish_session(&self, summary: &BuildSummary) {
        if summary.success() && summary.skipped == 0 {
            // A complete pass leaves nothing to resume.
            if let Err(err) = self.checkpoint.clear() {
                log::warn!("Could not clear checkpoint: {}", err);
            }
        } else if let Err(err) = self.checkpoint.flush() {
            log::warn!("Checkpoint flush failed: {}", err);
        }

        if let Err(err) = self.targets.flush() {
            log::warn!("Target cache flush failed: {}", err);
        }
        if let Err(err) = self.actions.flush() {
            log::warn!("Action cache flush failed: {}", err);
        }

        let fast = self.hasher.cache().stats();
        log::debug!(
            "Fast hash cache: {} entries, {} hits, {} misses",
            fast.entries,
            fast.hits,
            fast.misses
        );
        self.hasher.cache().clear();
    }
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("workspace", &self.workspace)
            .field("targets", &self.graph.len())
            .field("workers", &self.scheduler.worker_count())
            .finish()
    }
}
