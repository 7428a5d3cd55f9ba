//! # Command Entry Points
//!
//! The verbs the CLI (or an embedder) drives the core with: `build`,
//! `resume`, `clean`, `graph`, `query`, and `infer`. Each is a thin function
//! over the subsystems; argument parsing and process concerns stay in
//! `main.rs`.

use crate::coordinator::{BuildSummary, Coordinator, CoordinatorError};
use crate::core::{BuildOptions, CoreError, TargetId};
use crate::exec::HandlerRegistry;
use crate::graph::{BuildGraph, GraphError, QueryError, QueryExpr};
use crate::infer::infer_targets;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Command error types
#[derive(Error, Debug)]
pub enum CommandError {
    /// Session-level failure
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    /// Graph construction or analysis failure
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Query parse or evaluation failure
    #[error(transparent)]
    Query(#[from] QueryError),

    /// Malformed target label or configuration
    #[error(transparent)]
    Core(#[from] CoreError),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for command operations
pub type Result<T> = std::result::Result<T, CommandError>;

/// Run a build session over an explicit graph. The primary entry point for
/// embedders that construct graphs themselves.
pub fn run_graph(
    workspace: &Path,
    graph: BuildGraph,
    registry: Arc<HandlerRegistry>,
    options: BuildOptions,
) -> Result<BuildSummary> {
    let mut coordinator = Coordinator::new(workspace, graph, registry, options);
    Ok(coordinator.run()?)
}

/// `build [target]`: infer targets, restrict to `target`'s dependency
/// closure when given, and drive the coordinator.
pub fn build(
    workspace: &Path,
    registry: Arc<HandlerRegistry>,
    options: BuildOptions,
    target: Option<&str>,
) -> Result<BuildSummary> {
    let graph = load_graph(workspace, &registry, target)?;
    run_graph(workspace, graph, registry, options)
}

/// `resume`: like `build`, but applies a valid checkpoint first. A stale or
/// missing checkpoint degrades to a full build.
pub fn resume(
    workspace: &Path,
    registry: Arc<HandlerRegistry>,
    mut options: BuildOptions,
    target: Option<&str>,
) -> Result<BuildSummary> {
    options.resume = true;
    build(workspace, registry, options, target)
}

/// `clean`: delete the cache directory and the output directory. Absent
/// directories are fine.
pub fn clean(workspace: &Path, options: &BuildOptions) -> Result<()> {
    for dir in [&options.cache_dir, &options.output_dir] {
        let path = workspace.join(dir);
        match std::fs::remove_dir_all(&path) {
            Ok(()) => log::info!("Removed {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// `graph [target]`: the topological order with dependency edges, as text
/// or JSON.
pub fn graph_report(
    workspace: &Path,
    registry: &Arc<HandlerRegistry>,
    target: Option<&str>,
    json: bool,
) -> Result<String> {
    let graph = load_graph(workspace, registry, target)?;
    let order = graph.topological_sort()?;

    if json {
        let targets: Vec<serde_json::Value> = order
            .iter()
            .map(|id| {
                let node = graph.node(id).expect("sorted id is in the graph");
                json!({
                    "id": id.as_str(),
                    "kind": node.kind.as_str(),
                    "language": node.language.as_str(),
                    "deps": node.dependency_ids.iter().map(|d| d.as_str()).collect::<Vec<_>>(),
                })
            })
            .collect();
        return Ok(serde_json::to_string_pretty(&json!({ "targets": targets }))
            .expect("graph report serializes"));
    }

    let mut out = String::new();
    for id in &order {
        let node = graph.node(id).expect("sorted id is in the graph");
        if node.dependency_ids.is_empty() {
            out.push_str(&format!("{}\n", id));
        } else {
            let deps: Vec<&str> = node.dependency_ids.iter().map(|d| d.as_str()).collect();
            out.push_str(&format!("{} <- {}\n", id, deps.join(", ")));
        }
    }
    Ok(out)
}

/// `query <expr>`: evaluate a query expression over the inferred graph.
pub fn query(
    workspace: &Path,
    registry: &Arc<HandlerRegistry>,
    expr: &str,
) -> Result<Vec<TargetId>> {
    let graph = load_graph(workspace, registry, None)?;
    let parsed = QueryExpr::parse(expr)?;
    Ok(parsed.evaluate(&graph)?)
}

/// `infer`: dry-run target inference, as text or JSON.
pub fn infer_report(
    workspace: &Path,
    registry: &Arc<HandlerRegistry>,
    json: bool,
) -> Result<String> {
    let nodes = infer_targets(workspace, registry)?;

    if json {
        let targets: Vec<serde_json::Value> = nodes
            .iter()
            .map(|node| {
                json!({
                    "id": node.id.as_str(),
                    "kind": node.kind.as_str(),
                    "language": node.language.as_str(),
                    "sources": node.sources.iter().map(|s| s.display().to_string()).collect::<Vec<_>>(),
                    "deps": node.dependency_ids.iter().map(|d| d.as_str()).collect::<Vec<_>>(),
                })
            })
            .collect();
        return Ok(serde_json::to_string_pretty(&json!({ "targets": targets }))
            .expect("inference report serializes"));
    }

    let mut out = String::new();
    for node in &nodes {
        out.push_str(&format!(
            "{} ({} {}, {} sources)\n",
            node.id,
            node.language,
            node.kind,
            node.sources.len()
        ));
    }
    Ok(out)
}

fn load_graph(
    workspace: &Path,
    registry: &Arc<HandlerRegistry>,
    target: Option<&str>,
) -> Result<BuildGraph> {
    let nodes = infer_targets(workspace, registry)?;
    let graph = BuildGraph::from_nodes(nodes)?;
    match target {
        Some(label) => {
            let id = TargetId::parse(label)?;
            Ok(graph.subgraph(&id)?)
        }
        None => Ok(graph),
    }
}
