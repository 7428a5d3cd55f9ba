//! Graph query expressions
//!
//! The expression language offered by the `query` command:
//! - `//...` — every target
//! - `//path:name` — one target
//! - `deps(expr)` — the expression's targets plus their transitive
//!   dependencies
//! - `rdeps(expr)` — the expression's targets plus their transitive
//!   dependents
//! - `allpaths(a, b)` — every target on any dependency path from `a` to `b`
//! - `kind(t, expr)` — filter by target kind
//! - `attr(name, value, expr)` — filter by attribute (`language`, `kind`,
//!   `status`, `discoverable`)

use super::graph::BuildGraph;
use super::GraphError;
use crate::core::{TargetId, TargetKind};
use std::collections::{BTreeSet, VecDeque};
use thiserror::Error;

/// Query error types
#[derive(Error, Debug)]
pub enum QueryError {
    /// Expression could not be parsed
    #[error("Cannot parse query: {0}")]
    Parse(String),

    /// Evaluation touched an unknown target or attribute
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Attribute name is not queryable
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),
}

/// Result type for query operations
pub type Result<T> = std::result::Result<T, QueryError>;

/// A parsed query expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryExpr {
    /// `//...`
    All,
    /// A single target literal
    Target(TargetId),
    /// `deps(expr)`
    Deps(Box<QueryExpr>),
    /// `rdeps(expr)`
    Rdeps(Box<QueryExpr>),
    /// `allpaths(a, b)`
    AllPaths(TargetId, TargetId),
    /// `kind(t, expr)`
    Kind(TargetKind, Box<QueryExpr>),
    /// `attr(name, value, expr)`
    Attr(String, String, Box<QueryExpr>),
}

impl QueryExpr {
    /// Parse an expression string.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(QueryError::Parse("empty expression".to_string()));
        }
        if input == "//..." {
            return Ok(QueryExpr::All);
        }

        if let Some(inner) = call_body(input, "deps") {
            return Ok(QueryExpr::Deps(Box::new(Self::parse(inner)?)));
        }
        if let Some(inner) = call_body(input, "rdeps") {
            return Ok(QueryExpr::Rdeps(Box::new(Self::parse(inner)?)));
        }
        if let Some(inner) = call_body(input, "allpaths") {
            let args = split_args(inner);
            if args.len() != 2 {
                return Err(QueryError::Parse(format!(
                    "allpaths takes 2 arguments, got {}",
                    args.len()
                )));
            }
            return Ok(QueryExpr::AllPaths(
                parse_target(args[0])?,
                parse_target(args[1])?,
            ));
        }
        if let Some(inner) = call_body(input, "kind") {
            let args = split_args(inner);
            if args.len() != 2 {
                return Err(QueryError::Parse(format!(
                    "kind takes 2 arguments, got {}",
                    args.len()
                )));
            }
            let kind = TargetKind::parse(args[0])
                .map_err(|_| QueryError::Parse(format!("unknown kind: {}", args[0])))?;
            return Ok(QueryExpr::Kind(kind, Box::new(Self::parse(args[1])?)));
        }
        if let Some(inner) = call_body(input, "attr") {
            let args = split_args(inner);
            if args.len() != 3 {
                return Err(QueryError::Parse(format!(
                    "attr takes 3 arguments, got {}",
                    args.len()
                )));
            }
            return Ok(QueryExpr::Attr(
                args[0].to_string(),
                args[1].to_string(),
                Box::new(Self::parse(args[2])?),
            ));
        }

        Ok(QueryExpr::Target(parse_target(input)?))
    }

    /// Evaluate against a graph. Output is sorted ascending.
    pub fn evaluate(&self, graph: &BuildGraph) -> Result<Vec<TargetId>> {
        let set = self.evaluate_set(graph)?;
        Ok(set.into_iter().collect())
    }

    fn evaluate_set(&self, graph: &BuildGraph) -> Result<BTreeSet<TargetId>> {
        match self {
            QueryExpr::All => Ok(graph.ids().into_iter().collect()),
            QueryExpr::Target(id) => {
                if !graph.contains(id) {
                    return Err(GraphError::UnknownTarget(id.clone()).into());
                }
                Ok(BTreeSet::from([id.clone()]))
            }
            QueryExpr::Deps(inner) => {
                let seeds = inner.evaluate_set(graph)?;
                Ok(deps_closure(graph, &seeds))
            }
            QueryExpr::Rdeps(inner) => {
                let seeds = inner.evaluate_set(graph)?;
                let seed_vec: Vec<TargetId> = seeds.iter().cloned().collect();
                let mut result = seeds;
                result.extend(graph.reverse_dependents(&seed_vec));
                Ok(result)
            }
            QueryExpr::AllPaths(from, to) => {
                for id in [from, to] {
                    if !graph.contains(id) {
                        return Err(GraphError::UnknownTarget(id.clone()).into());
                    }
                }
                let below = deps_closure(graph, &BTreeSet::from([from.clone()]));
                let mut above: BTreeSet<TargetId> = BTreeSet::from([to.clone()]);
                above.extend(graph.reverse_dependents(&[to.clone()]));
                Ok(below.intersection(&above).cloned().collect())
            }
            QueryExpr::Kind(kind, inner) => {
                let set = inner.evaluate_set(graph)?;
                Ok(set
                    .into_iter()
                    .filter(|id| graph.node(id).map(|n| n.kind == *kind).unwrap_or(false))
                    .collect())
            }
            QueryExpr::Attr(name, value, inner) => {
                let set = inner.evaluate_set(graph)?;
                let mut result = BTreeSet::new();
                for id in set {
                    let node = match graph.node(&id) {
                        Some(node) => node,
                        None => continue,
                    };
                    let actual = match name.as_str() {
                        "language" => node.language.as_str().to_string(),
                        "kind" => node.kind.as_str().to_string(),
                        "status" => node.status.as_str().to_string(),
                        "discoverable" => node.discoverable.to_string(),
                        other => return Err(QueryError::UnknownAttribute(other.to_string())),
                    };
                    if actual == *value {
                        result.insert(id);
                    }
                }
                Ok(result)
            }
        }
    }
}

/// Transitive dependency closure of a seed set, seeds included.
fn deps_closure(graph: &BuildGraph, seeds: &BTreeSet<TargetId>) -> BTreeSet<TargetId> {
    let mut result = BTreeSet::new();
    let mut queue: VecDeque<TargetId> = seeds.iter().cloned().collect();
    while let Some(id) = queue.pop_front() {
        if !result.insert(id.clone()) {
            continue;
        }
        if let Some(node) = graph.node(&id) {
            for dep in &node.dependency_ids {
                queue.push_back(dep.clone());
            }
        }
    }
    result
}

/// Strip `name(...)` and return the body, when `input` is exactly one call.
fn call_body<'a>(input: &'a str, name: &str) -> Option<&'a str> {
    let rest = input.strip_prefix(name)?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('(')?;
    let rest = rest.strip_suffix(')')?;
    Some(rest)
}

/// Split on top-level commas, trimming each argument.
fn split_args(input: &str) -> Vec<&str> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in input.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                args.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    args.push(input[start..].trim());
    args
}

fn parse_target(input: &str) -> Result<TargetId> {
    TargetId::parse(input).map_err(|_| QueryError::Parse(format!("bad target label: {}", input)))
}
