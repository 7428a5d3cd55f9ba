//! # Core Types for BUILDER
//!
//! Foundational vocabulary shared by every subsystem:
//! - Target identity and classification (`TargetId`, `TargetKind`, `Language`)
//! - Build graph nodes and their lifecycle (`BuildNode`, `BuildStatus`)
//! - Process configuration sourced from the environment (`BuildOptions`,
//!   cache budgets, worker counts)

use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum CoreError {
    /// Malformed target label
    #[error("Invalid target id '{0}': expected //path/segment:name")]
    InvalidTargetId(String),

    /// Unrecognized target kind string
    #[error("Unknown target kind: {0}")]
    UnknownTargetKind(String),

    /// Environment variable present but unparsable
    #[error("Invalid value '{value}' for {var}")]
    InvalidConfig {
        /// Variable name
        var: &'static str,
        /// Offending value
        value: String,
    },
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

pub mod config;
pub mod node;
pub mod target;

pub use config::{BuildOptions, CacheBudget};
pub use node::{BuildNode, BuildStatus};
pub use target::{Language, TargetId, TargetKind};
