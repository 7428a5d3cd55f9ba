//! # BUILDER - Polyglot Build Orchestrator
//!
//! A zero-configuration build engine built in Rust.
//!
//! ## Architecture
//!
//! - `core`: target identity, build nodes, configuration
//! - `hash`: BLAKE3 content addressing and the fast path digest cache
//! - `cache`: signed, versioned target- and action-level result caches
//! - `graph`: the dependency graph, topological analysis, and queries
//! - `scheduler`: ready-queue dispatch across a worker thread pool
//! - `exec`: per-node execution against pluggable language handlers
//! - `discovery`: mid-build graph extension by discoverable targets
//! - `checkpoint`: crash-safe per-node completion snapshots
//! - `coordinator`: the session loop tying all of the above together
//! - `infer`: zero-configuration target inference from workspace contents
//! - `commands`: the entry points the CLI drives

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core vocabulary - targets, nodes, configuration
pub mod core;

// Content-addressed hashing
pub mod hash;

// Persisted result caches
pub mod cache;

// Dependency graph and queries
pub mod graph;

// Parallel dispatch
pub mod scheduler;

// Node execution and language handlers
pub mod exec;

// Dynamic graph discovery
pub mod discovery;

// Checkpoint / resume
pub mod checkpoint;

// Session coordination
pub mod coordinator;

// Target inference
pub mod infer;

// CLI-facing entry points
pub mod commands;

// Re-export commonly used types
pub use crate::core::{BuildNode, BuildOptions, BuildStatus, Language, TargetId, TargetKind};
pub use cache::{ActionCache, ActionId, ActionKind, TargetCache};
pub use coordinator::{BuildObserver, BuildSummary, Coordinator};
pub use exec::{CancellationToken, Executor, HandlerRegistry, LanguageHandler};
pub use graph::{BuildGraph, QueryExpr};
pub use hash::{Digest, Hasher};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
