//! # Node Execution
//!
//! Everything that happens to a single node once it is dispatched:
//! - `cancel`: cooperative cancellation tokens with optional deadlines
//! - `handler`: the language handler interface, the registry keyed by
//!   language tag, and the action recorder capability
//! - `executor`: fingerprint, cache probe, handler invocation, output
//!   verification, cache update, and transient-error retry

use crate::core::{Language, TargetId};
use std::path::PathBuf;
use thiserror::Error;

/// Build error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// The language handler reported failure
    #[error("{target}: handler failed: {message}")]
    Handler {
        /// Failing target
        target: TargetId,
        /// Handler-reported message
        message: String,
    },

    /// No handler registered for the node's language
    #[error("{target}: no handler registered for language '{language}'")]
    NoHandler {
        /// Failing target
        target: TargetId,
        /// Unhandled language tag
        language: Language,
    },

    /// A declared output was not produced
    #[error("{target}: declared output not produced: {path}")]
    MissingOutput {
        /// Failing target
        target: TargetId,
        /// The missing path
        path: PathBuf,
    },

    /// The node's deadline elapsed
    #[error("{target}: timed out after {elapsed_ms}ms")]
    Timeout {
        /// Failing target
        target: TargetId,
        /// Time spent before the deadline tripped
        elapsed_ms: u64,
    },

    /// The node was cancelled
    #[error("{target}: cancelled")]
    Cancelled {
        /// Cancelled target
        target: TargetId,
    },

    /// A tool process could not be spawned (transient)
    #[error("{target}: process spawn failed: {message}")]
    ProcessSpawn {
        /// Failing target
        target: TargetId,
        /// Spawn failure detail
        message: String,
    },

    /// A transient I/O failure (transient)
    #[error("{target}: transient I/O failure on {path}: {message}")]
    IoTransient {
        /// Failing target
        target: TargetId,
        /// Offending path
        path: PathBuf,
        /// Failure detail
        message: String,
    },

    /// A deterministic I/O failure
    #[error("{target}: cannot read {path}: {message}")]
    Io {
        /// Failing target
        target: TargetId,
        /// Offending path
        path: PathBuf,
        /// Failure detail
        message: String,
    },

    /// A dependency of this target failed
    #[error("{target}: dependency {dependency} failed")]
    DependencyFailed {
        /// Failing target
        target: TargetId,
        /// The failed dependency
        dependency: TargetId,
    },
}

impl BuildError {
    /// Whether retrying might help. Only spawn failures and transient I/O
    /// classes retry; everything else is deterministic.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BuildError::ProcessSpawn { .. } | BuildError::IoTransient { .. }
        )
    }

    /// Classify an I/O error for a target, splitting the transient kinds
    /// from the deterministic ones.
    pub fn from_io(target: &TargetId, path: &std::path::Path, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let transient = matches!(
            err.kind(),
            ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
        );
        if transient {
            BuildError::IoTransient {
                target: target.clone(),
                path: path.to_path_buf(),
                message: err.to_string(),
            }
        } else {
            BuildError::Io {
                target: target.clone(),
                path: path.to_path_buf(),
                message: err.to_string(),
            }
        }
    }

    /// The target this error is attached to.
    pub fn target(&self) -> &TargetId {
        match self {
            BuildError::Handler { target, .. }
            | BuildError::NoHandler { target, .. }
            | BuildError::MissingOutput { target, .. }
            | BuildError::Timeout { target, .. }
            | BuildError::Cancelled { target }
            | BuildError::ProcessSpawn { target, .. }
            | BuildError::IoTransient { target, .. }
            | BuildError::Io { target, .. }
            | BuildError::DependencyFailed { target, .. } => target,
        }
    }
}

/// Result type for execution operations
pub type Result<T> = std::result::Result<T, BuildError>;

pub mod cancel;
pub mod executor;
pub mod handler;

pub use cancel::{CancelReason, CancelState, CancellationToken};
pub use executor::{Executor, NodeResult, NodeSuccess, RetryPolicy};
pub use handler::{ActionRecorder, HandlerContext, HandlerRegistry, Import, LanguageHandler};
