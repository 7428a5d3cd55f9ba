//! Build lifecycle observer
//!
//! The cache and scheduler cores stay free of reporting concerns; the
//! coordinator narrates the session through this interface and the CLI (or
//! an embedder) wires the sink it wants.

use super::summary::BuildSummary;
use crate::core::TargetId;
use crate::exec::NodeResult;

/// Receives session lifecycle events. All methods have no-op defaults.
pub trait BuildObserver: Send + Sync {
    /// The session is starting with this many known nodes.
    fn build_started(&self, _total_nodes: usize) {}

    /// A node was handed to a worker.
    fn node_started(&self, _id: &TargetId) {}

    /// A node finished, successfully or not.
    fn node_finished(&self, _result: &NodeResult) {}

    /// A discovery batch inserted new nodes.
    fn discovery_applied(&self, _new_nodes: usize) {}

    /// The session is over.
    fn build_finished(&self, _summary: &BuildSummary) {}
}

/// Observer that narrates through the `log` crate.
pub struct LogObserver;

impl BuildObserver for LogObserver {
    fn build_started(&self, total_nodes: usize) {
        log::info!("Building {} targets", total_nodes);
    }

    fn node_started(&self, id: &TargetId) {
        log::debug!("{} started", id);
    }

    fn node_finished(&self, result: &NodeResult) {
        match &result.outcome {
            Ok(success) if success.cached => log::info!("{} (cached)", result.id),
            Ok(_) => log::info!("{} built in {:?}", result.id, result.duration),
            Err(err) => log::error!("{} failed: {}", result.id, err),
        }
    }

    fn discovery_applied(&self, new_nodes: usize) {
        log::info!("Discovered {} new targets", new_nodes);
    }

    fn build_finished(&self, summary: &BuildSummary) {
        if summary.success() {
            log::info!("Build finished: {}", summary);
        } else {
            log::error!("Build failed: {}", summary);
        }
    }
}

/// Observer that drops every event, for embedding and tests.
pub struct NullObserver;

impl BuildObserver for NullObserver {}
