//! Per-node build execution
//!
//! For each dispatched node: compute the input fingerprint, probe the target
//! cache, invoke the language handler under the at-most-one-build claim,
//! verify declared outputs, update the caches, and report the result. All
//! graph mutation stays with the coordinator; the executor only reads node
//! snapshots and talks to caches.

use super::cancel::{CancelState, CancellationToken};
use super::handler::{ActionRecorder, HandlerContext, HandlerRegistry, LanguageHandler};
use super::BuildError;
use crate::cache::integrity::unix_now;
use crate::cache::{ActionCache, Probe, TargetCache};
use crate::core::{BuildNode, TargetId};
use crate::discovery::DiscoveryBuffer;
use crate::hash::{Digest, Hasher};
use crate::scheduler::BuildJob;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Retry behavior for transient error classes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, first try included
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per retry
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, completed_attempts: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(completed_attempts.saturating_sub(1))
    }
}

/// A successful node outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSuccess {
    /// Digest of the produced outputs
    pub output_hash: Digest,
    /// True when satisfied from the target cache without a handler call
    pub cached: bool,
}

/// Everything the coordinator needs to know about one finished node.
#[derive(Debug)]
pub struct NodeResult {
    /// The node's id
    pub id: TargetId,
    /// Success with its output digest, or the failure
    pub outcome: std::result::Result<NodeSuccess, BuildError>,
    /// Completion time, unix seconds
    pub completed_at: u64,
    /// Wall time spent on this node
    pub duration: Duration,
}

impl NodeResult {
    /// True on success, cached or built.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// True when satisfied from cache.
    pub fn is_cached(&self) -> bool {
        matches!(&self.outcome, Ok(success) if success.cached)
    }
}

/// Runs single nodes on worker threads.
pub struct Executor {
    workspace: PathBuf,
    hasher: Arc<Hasher>,
    targets: Arc<TargetCache>,
    actions: Arc<ActionCache>,
    registry: Arc<HandlerRegistry>,
    discoveries: Arc<DiscoveryBuffer>,
    retry: RetryPolicy,
}

impl Executor {
    /// Wire an executor to its collaborators.
    pub fn new(
        workspace: PathBuf,
        hasher: Arc<Hasher>,
        targets: Arc<TargetCache>,
        actions: Arc<ActionCache>,
        registry: Arc<HandlerRegistry>,
        discoveries: Arc<DiscoveryBuffer>,
    ) -> Self {
        Executor {
            workspace,
            hasher,
            targets,
            actions,
            registry,
            discoveries,
            retry: RetryPolicy::default(),
        }
    }

    /// Override the transient-error retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Build one node, consulting the caches first.
    pub fn run(&self, job: &BuildJob, cancel: &CancellationToken) -> NodeResult {
        let started = Instant::now();
        let outcome = self.execute(job, cancel, started);
        NodeResult {
            id: job.node.id.clone(),
            outcome,
            completed_at: unix_now(),
            duration: started.elapsed(),
        }
    }

    fn execute(
        &self,
        job: &BuildJob,
        cancel: &CancellationToken,
        started: Instant,
    ) -> std::result::Result<NodeSuccess, BuildError> {
        let node = &job.node;
        let handler =
            self.registry
                .get(&node.language)
                .ok_or_else(|| BuildError::NoHandler {
                    target: node.id.clone(),
                    language: node.language.clone(),
                })?;

        let dep_hashes: BTreeMap<String, Digest> = job
            .dep_outputs
            .iter()
            .map(|(id, digest)| (id.as_str().to_string(), *digest))
            .collect();
        let metadata = self.cache_metadata(node, handler.as_ref());
        let fingerprint = self.fingerprint(node, &dep_hashes, &handler.identity())?;

        // Probe under the claim protocol: at most one concurrent builder per
        // (target, fingerprint). Losers wait for the winner and re-probe.
        loop {
            match self
                .targets
                .probe(node, &fingerprint, &dep_hashes, &metadata, &self.hasher)
            {
                Probe::Hit { output_hash } => {
                    return Ok(NodeSuccess {
                        output_hash,
                        cached: true,
                    });
                }
                Probe::Miss(_) => {
                    if self.targets.try_claim(&node.id, &fingerprint) {
                        break;
                    }
                    self.targets.wait(&node.id, &fingerprint);
                }
            }
        }
        let _claim = ClaimGuard {
            cache: &self.targets,
            id: &node.id,
            fingerprint: &fingerprint,
        };

        self.check_cancel(node, cancel, started)?;

        log::debug!("Building {} (fingerprint {})", node.id, fingerprint.short());
        let recorder = ActionRecorder::new(&self.workspace, &self.actions, &self.hasher);
        let ctx = HandlerContext {
            workspace: &self.workspace,
            dep_outputs: &job.dep_outputs,
            cancel,
            recorder: &recorder,
            discoveries: &self.discoveries,
        };

        let handler_hash =
            self.invoke_with_retry(handler.as_ref(), node, &ctx, cancel, started)?;

        let output_hash = match handler_hash {
            Some(digest) => {
                self.verify_outputs(node)?;
                digest
            }
            None => self.verify_outputs(node)?,
        };

        self.targets.record(
            node,
            fingerprint,
            output_hash,
            dep_hashes,
            &metadata,
            &self.hasher,
        );

        Ok(NodeSuccess {
            output_hash,
            cached: false,
        })
    }

    /// Everything that can legitimately change a target's output feeds the
    /// fingerprint: source contents, dependency outputs, flags, environment,
    /// and the handler identity.
    fn fingerprint(
        &self,
        node: &BuildNode,
        dep_hashes: &BTreeMap<String, Digest>,
        handler_identity: &str,
    ) -> std::result::Result<Digest, BuildError> {
        let mut parts: Vec<String> =
            Vec::with_capacity(node.sources.len() + dep_hashes.len() + node.flags.len() + 4);

        for source in &node.sources {
            let path = self.workspace.join(source);
            let digest = self
                .hasher
                .hash_file_cached(&path)
                .map_err(|err| match err {
                    crate::hash::HashError::Io { path, source } => {
                        BuildError::from_io(&node.id, &path, &source)
                    }
                    other => BuildError::Io {
                        target: node.id.clone(),
                        path: path.clone(),
                        message: other.to_string(),
                    },
                })?;
            parts.push(format!("src:{}={}", source.display(), digest.to_hex()));
        }
        for (dep, digest) in dep_hashes {
            parts.push(format!("dep:{}={}", dep, digest.to_hex()));
        }
        for flag in &node.flags {
            parts.push(format!("flag:{}", flag));
        }
        for (key, value) in &node.env {
            parts.push(format!("env:{}={}", key, value));
        }
        parts.push(format!("kind:{}", node.kind));
        parts.push(format!("lang:{}", node.language));
        parts.push(format!("handler:{}", handler_identity));

        Ok(self.hasher.hash_strings(parts))
    }

    fn cache_metadata(
        &self,
        node: &BuildNode,
        handler: &dyn LanguageHandler,
    ) -> BTreeMap<String, String> {
        let mut metadata = BTreeMap::new();
        metadata.insert("handler".to_string(), handler.identity());
        metadata.insert("kind".to_string(), node.kind.as_str().to_string());
        metadata.insert("language".to_string(), node.language.as_str().to_string());
        metadata
    }

    fn invoke_with_retry(
        &self,
        handler: &dyn LanguageHandler,
        node: &BuildNode,
        ctx: &HandlerContext<'_>,
        cancel: &CancellationToken,
        started: Instant,
    ) -> std::result::Result<Option<Digest>, BuildError> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.check_cancel(node, cancel, started)?;

            match handler.build_impl(node, ctx) {
                Ok(output) => return Ok(output),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    log::warn!(
                        "{}: transient failure (attempt {}/{}), retrying in {:?}: {}",
                        node.id,
                        attempt,
                        self.retry.max_attempts,
                        delay,
                        err
                    );
                    std::thread::sleep(delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Every declared output must exist; the combined output digest covers
    /// their contents in declaration order.
    fn verify_outputs(&self, node: &BuildNode) -> std::result::Result<Digest, BuildError> {
        let mut parts = Vec::with_capacity(node.outputs.len());
        for output in &node.outputs {
            let path = self.workspace.join(output);
            if !path.exists() {
                return Err(BuildError::MissingOutput {
                    target: node.id.clone(),
                    path: output.clone(),
                });
            }
            let digest = self
                .hasher
                .hash_file(&path)
                .map_err(|_| BuildError::MissingOutput {
                    target: node.id.clone(),
                    path: output.clone(),
                })?;
            parts.push(format!("{}={}", output.display(), digest.to_hex()));
        }
        Ok(self.hasher.hash_strings(parts))
    }

    fn check_cancel(
        &self,
        node: &BuildNode,
        cancel: &CancellationToken,
        started: Instant,
    ) -> std::result::Result<(), BuildError> {
        match cancel.state() {
            CancelState::Active => Ok(()),
            CancelState::Cancelled(_) => Err(BuildError::Cancelled {
                target: node.id.clone(),
            }),
            CancelState::DeadlineExceeded => Err(BuildError::Timeout {
                target: node.id.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }
}

struct ClaimGuard<'a> {
    cache: &'a TargetCache,
    id: &'a TargetId,
    fingerprint: &'a Digest,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        self.cache.release(self.id, self.fingerprint);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CacheBudget;
    use crate::core::{Language, TargetKind};
    use crate::exec::cancel::CancelReason;
    use crate::exec::Result as ExecResult;
    use crate::scheduler::Priority;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Writes each declared output; fails while `failures` is positive.
    struct ScriptedHandler {
        invocations: AtomicU32,
        failures: AtomicU32,
        transient: bool,
        skip_outputs: bool,
    }

    impl ScriptedHandler {
        fn succeeding() -> Self {
            ScriptedHandler {
                invocations: AtomicU32::new(0),
                failures: AtomicU32::new(0),
                transient: false,
                skip_outputs: false,
            }
        }

        fn writing_nothing() -> Self {
            ScriptedHandler {
                skip_outputs: true,
                ..Self::succeeding()
            }
        }

        fn failing_first(n: u32, transient: bool) -> Self {
            ScriptedHandler {
                invocations: AtomicU32::new(0),
                failures: AtomicU32::new(n),
                transient,
                skip_outputs: false,
            }
        }
    }

    impl LanguageHandler for ScriptedHandler {
        fn language(&self) -> Language {
            Language::new("scripted")
        }

        fn build_impl(
            &self,
            node: &BuildNode,
            ctx: &HandlerContext<'_>,
        ) -> ExecResult<Option<Digest>> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if self.failures.load(Ordering::SeqCst) > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return if self.transient {
                    Err(BuildError::ProcessSpawn {
                        target: node.id.clone(),
                        message: "flaky".to_string(),
                    })
                } else {
                    Err(BuildError::Handler {
                        target: node.id.clone(),
                        message: "broken".to_string(),
                    })
                };
            }
            if !self.skip_outputs {
                for output in &node.outputs {
                    let path = ctx.workspace.join(output);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent).unwrap();
                    }
                    std::fs::write(&path, format!("output of {}", node.id)).unwrap();
                }
            }
            Ok(None)
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        executor: Executor,
        handler: Arc<ScriptedHandler>,
        workspace: PathBuf,
    }

    fn fixture(handler: ScriptedHandler) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().to_path_buf();
        let hasher = Arc::new(Hasher::new());
        let targets = Arc::new(TargetCache::open(&workspace, CacheBudget::targets()));
        let actions = Arc::new(ActionCache::open(&workspace, CacheBudget::actions()));
        let registry = Arc::new(HandlerRegistry::new());
        let handler = Arc::new(handler);
        registry.register(Arc::clone(&handler) as Arc<dyn LanguageHandler>);
        let discoveries = Arc::new(DiscoveryBuffer::new());
        let executor = Executor::new(
            workspace.clone(),
            hasher,
            targets,
            actions,
            registry,
            discoveries,
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        });
        Fixture {
            _dir: dir,
            executor,
            handler,
            workspace,
        }
    }

    fn job(fixture: &Fixture, label: &str) -> BuildJob {
        let id = TargetId::parse(label).unwrap();
        let source = PathBuf::from(format!("{}.src", id.name()));
        std::fs::write(fixture.workspace.join(&source), format!("source {}", label)).unwrap();
        let node = BuildNode::new(id.clone(), TargetKind::Library, Language::new("scripted"))
            .with_sources(vec![source])
            .with_outputs(vec![PathBuf::from(format!("out/{}.bin", id.name()))]);
        BuildJob::new(node, Vec::new(), Priority::Normal)
    }

    #[test]
    fn test_build_then_cache_hit() {
        let fx = fixture(ScriptedHandler::succeeding());
        let job = job(&fx, "//app:a");
        let cancel = CancellationToken::new();

        let first = fx.executor.run(&job, &cancel);
        assert!(first.is_success());
        assert!(!first.is_cached());

        let second = fx.executor.run(&job, &cancel);
        assert!(second.is_success());
        assert!(second.is_cached());
        assert_eq!(fx.handler.invocations.load(Ordering::SeqCst), 1);

        // Same fingerprint, same output digest.
        assert_eq!(
            first.outcome.unwrap().output_hash,
            second.outcome.unwrap().output_hash
        );
    }

    #[test]
    fn test_missing_output_fails() {
        let fx = fixture(ScriptedHandler::writing_nothing());
        let job = job(&fx, "//app:a");
        let result = fx.executor.run(&job, &CancellationToken::new());
        assert!(matches!(
            result.outcome,
            Err(BuildError::MissingOutput { .. })
        ));

        // A handler success with no declared outputs verifies trivially.
        let fx2 = fixture(ScriptedHandler::writing_nothing());
        let mut no_output_job = self::job(&fx2, "//app:b");
        no_output_job.node.outputs.clear();
        let result = fx2.executor.run(&no_output_job, &CancellationToken::new());
        assert!(result.is_success());
    }

    #[test]
    fn test_transient_failure_retries_to_success() {
        let fx = fixture(ScriptedHandler::failing_first(2, true));
        let job = job(&fx, "//app:a");
        let result = fx.executor.run(&job, &CancellationToken::new());
        assert!(result.is_success());
        assert_eq!(fx.handler.invocations.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_transient_failure_exhausts_retries() {
        let fx = fixture(ScriptedHandler::failing_first(10, true));
        let job = job(&fx, "//app:a");
        let result = fx.executor.run(&job, &CancellationToken::new());
        assert!(matches!(
            result.outcome,
            Err(BuildError::ProcessSpawn { .. })
        ));
        assert_eq!(fx.handler.invocations.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_deterministic_failure_does_not_retry() {
        let fx = fixture(ScriptedHandler::failing_first(1, false));
        let job = job(&fx, "//app:a");
        let result = fx.executor.run(&job, &CancellationToken::new());
        assert!(matches!(result.outcome, Err(BuildError::Handler { .. })));
        assert_eq!(fx.handler.invocations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let fx = fixture(ScriptedHandler::succeeding());
        let job = job(&fx, "//app:a");
        let cancel = CancellationToken::new();
        cancel.trip(CancelReason::UserInterrupt);
        let result = fx.executor.run(&job, &cancel);
        assert!(matches!(result.outcome, Err(BuildError::Cancelled { .. })));
        assert_eq!(fx.handler.invocations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_deadline_reports_timeout() {
        let fx = fixture(ScriptedHandler::succeeding());
        let job = job(&fx, "//app:a");
        let cancel =
            CancellationToken::with_deadline(Some(Instant::now() - Duration::from_millis(1)));
        let result = fx.executor.run(&job, &cancel);
        assert!(matches!(result.outcome, Err(BuildError::Timeout { .. })));
    }

    #[test]
    fn test_unknown_language_fails() {
        let fx = fixture(ScriptedHandler::succeeding());
        let mut job = job(&fx, "//app:a");
        job.node.language = Language::new("fortran");
        let result = fx.executor.run(&job, &CancellationToken::new());
        assert!(matches!(result.outcome, Err(BuildError::NoHandler { .. })));
    }

    #[test]
    fn test_source_change_invalidates() {
        let fx = fixture(ScriptedHandler::succeeding());
        let job = job(&fx, "//app:a");
        let cancel = CancellationToken::new();

        assert!(!fx.executor.run(&job, &cancel).is_cached());
        std::fs::write(
            fx.workspace.join(&job.node.sources[0]),
            "changed source text",
        )
        .unwrap();
        let rebuilt = fx.executor.run(&job, &cancel);
        assert!(rebuilt.is_success());
        assert!(!rebuilt.is_cached());
        assert_eq!(fx.handler.invocations.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_dep_hash_changes_fingerprint() {
        let fx = fixture(ScriptedHandler::succeeding());
        let base = job(&fx, "//app:a");
        let cancel = CancellationToken::new();
        let dep = TargetId::parse("//lib:d").unwrap();

        let with_dep_v1 = BuildJob::new(
            base.node.clone(),
            vec![(dep.clone(), Digest::from(blake3::hash(b"v1")))],
            Priority::Normal,
        );
        let with_dep_v2 = BuildJob::new(
            base.node.clone(),
            vec![(dep, Digest::from(blake3::hash(b"v2")))],
            Priority::Normal,
        );

        assert!(!fx.executor.run(&with_dep_v1, &cancel).is_cached());
        // Different dependency output digest forces a rebuild.
        assert!(!fx.executor.run(&with_dep_v2, &cancel).is_cached());
        assert_eq!(fx.handler.invocations.load(Ordering::SeqCst), 2);
    }
}
