//! Language handler interface, registry, and the action recorder
//!
//! Handlers are the narrow boundary to per-language build logic. They
//! receive read-only node views and a context of capabilities: an action
//! recorder for fine-grained caching, a discovery buffer for announcing new
//! nodes, and a cancellation token. A handler never mutates the graph; the
//! discovery buffer is the only channel for extending it.

use super::cancel::CancellationToken;
use super::{BuildError, Result};
use crate::cache::{ActionCache, ActionEntry, ActionId};
use crate::core::{BuildNode, Language};
use crate::discovery::DiscoveryBuffer;
use crate::hash::{Digest, Hasher};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An import statement found in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// Imported module name as written
    pub module: String,
    /// Resolved path, when the handler could resolve it
    pub path: Option<PathBuf>,
}

/// Capabilities offered to a handler for one invocation.
pub struct HandlerContext<'a> {
    /// Workspace root
    pub workspace: &'a Path,
    /// Output digests of the node's completed dependencies
    pub dep_outputs: &'a [(crate::core::TargetId, Digest)],
    /// Cooperative cancellation; poll at convenient points
    pub cancel: &'a CancellationToken,
    /// Fine-grained action caching
    pub recorder: &'a ActionRecorder<'a>,
    /// Discovery announcements (only honored for discoverable nodes)
    pub discoveries: &'a DiscoveryBuffer,
}

/// Per-language build logic, registered by language tag.
pub trait LanguageHandler: Send + Sync {
    /// The language this handler builds.
    fn language(&self) -> Language;

    /// Source extensions (without dot) this handler claims, for target
    /// inference.
    fn extensions(&self) -> &[&str] {
        &[]
    }

    /// Identity string folded into every fingerprint. Bump it when the
    /// handler's output semantics change.
    fn identity(&self) -> String {
        format!("{}:1", self.language())
    }

    /// Build one node. Returns the output digest when the handler computed
    /// one; otherwise the executor hashes the declared outputs itself.
    fn build_impl(&self, node: &BuildNode, ctx: &HandlerContext<'_>) -> Result<Option<Digest>>;

    /// The outputs this node will produce. Defaults to the node's declared
    /// outputs.
    fn outputs(&self, node: &BuildNode, _workspace: &Path) -> Vec<PathBuf> {
        node.outputs.clone()
    }

    /// Cheap staleness hint; the cache probe is authoritative.
    fn needs_rebuild(&self, _node: &BuildNode, _workspace: &Path) -> bool {
        true
    }

    /// Scan sources for imports, for dependency inference.
    fn analyze_imports(&self, _sources: &[PathBuf]) -> Result<Vec<Import>> {
        Ok(Vec::new())
    }
}

/// Thread-safe handler registry keyed by language tag.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<Language, Arc<dyn LanguageHandler>>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        HandlerRegistry {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler under its language tag, replacing any previous
    /// registration.
    pub fn register(&self, handler: Arc<dyn LanguageHandler>) {
        let language = handler.language();
        log::debug!("Registered handler for {}", language);
        self.handlers.write().insert(language, handler);
    }

    /// Look up the handler for a language.
    pub fn get(&self, language: &Language) -> Option<Arc<dyn LanguageHandler>> {
        self.handlers.read().get(language).cloned()
    }

    /// Registered languages, sorted.
    pub fn languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.handlers.read().keys().cloned().collect();
        languages.sort();
        languages
    }

    /// The language claiming a source extension, if any.
    pub fn language_for_extension(&self, extension: &str) -> Option<Language> {
        let handlers = self.handlers.read();
        let mut claims: Vec<&Arc<dyn LanguageHandler>> = handlers
            .values()
            .filter(|h| h.extensions().contains(&extension))
            .collect();
        claims.sort_by_key(|h| h.language());
        claims.first().map(|h| h.language())
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Records fine-grained sub-steps into the action cache on a handler's
/// behalf. Each report is `(ActionId, inputs, outputs, metadata, success)`;
/// the recorder hashes the files and forwards the entry.
pub struct ActionRecorder<'a> {
    workspace: &'a Path,
    cache: &'a ActionCache,
    hasher: &'a Hasher,
    recorded: parking_lot::Mutex<Vec<(ActionId, bool)>>,
}

impl<'a> ActionRecorder<'a> {
    /// Create a recorder bound to one target build.
    pub fn new(workspace: &'a Path, cache: &'a ActionCache, hasher: &'a Hasher) -> Self {
        ActionRecorder {
            workspace,
            cache,
            hasher,
            recorded: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Combined digest over a set of input files, for building an
    /// `ActionId`. Unreadable files contribute their path only.
    pub fn input_hash(&self, inputs: &[PathBuf]) -> Digest {
        let mut parts = Vec::with_capacity(inputs.len());
        for input in inputs {
            let path = self.workspace.join(input);
            match self.hasher.hash_file_cached(&path) {
                Ok(digest) => parts.push(format!("{}={}", input.display(), digest.to_hex())),
                Err(_) => parts.push(format!("{}=?", input.display())),
            }
        }
        self.hasher.hash_strings(parts)
    }

    /// Look up a prior successful result for this exact action.
    pub fn probe(&self, id: &ActionId) -> Option<ActionEntry> {
        self.cache.probe(id)
    }

    /// Report one completed sub-step.
    pub fn record(
        &self,
        id: ActionId,
        inputs: &[PathBuf],
        outputs: &[PathBuf],
        metadata: BTreeMap<String, String>,
        success: bool,
    ) {
        let input_hashes = self.hash_existing(inputs);
        let output_hashes = self.hash_existing(outputs);
        let entry = ActionEntry::new(
            &id,
            inputs.iter().map(|p| p.display().to_string()).collect(),
            input_hashes,
            outputs.iter().map(|p| p.display().to_string()).collect(),
            output_hashes,
            metadata,
            success,
            self.hasher,
        );
        self.cache.record(entry);
        self.recorded.lock().push((id, success));
    }

    /// Every action reported through this recorder, in report order.
    pub fn reported(&self) -> Vec<(ActionId, bool)> {
        self.recorded.lock().clone()
    }

    fn hash_existing(&self, paths: &[PathBuf]) -> BTreeMap<String, Digest> {
        let mut hashes = BTreeMap::new();
        for path in paths {
            let absolute = self.workspace.join(path);
            match self.hasher.hash_file_cached(&absolute) {
                Ok(digest) => {
                    hashes.insert(path.display().to_string(), digest);
                }
                Err(err) => {
                    log::debug!("Skipping action hash for {}: {}", path.display(), err);
                }
            }
        }
        hashes
    }
}

/// Convenience for propagating handler failures with context.
pub fn handler_failure(node: &BuildNode, message: impl Into<String>) -> BuildError {
    BuildError::Handler {
        target: node.id.clone(),
        message: message.into(),
    }
}
