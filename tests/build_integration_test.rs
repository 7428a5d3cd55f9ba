// End-to-end build engine scenarios: cold builds, cache reuse, failure
// cascades, checkpoint resume, discovery, and cycle rejection.

use builder::coordinator::{BuildObserver, BuildSummary, Coordinator, CoordinatorError};
use builder::core::{BuildNode, BuildOptions, Language, TargetId, TargetKind};
use builder::discovery::DiscoveryAnnouncement;
use builder::exec::{HandlerContext, HandlerRegistry, LanguageHandler, NodeResult};
use builder::graph::{BuildGraph, GraphError};
use builder::hash::Digest;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A compiler stand-in: writes each declared output as a function of the
/// node's source text and its dependencies' output digests, so changes
/// propagate downstream the way real object code does.
struct TestHandler {
    fail: Mutex<HashSet<String>>,
    invoked: Mutex<Vec<String>>,
    announcements: Mutex<HashMap<String, DiscoveryAnnouncement>>,
}

impl TestHandler {
    fn new() -> Self {
        TestHandler {
            fail: Mutex::new(HashSet::new()),
            invoked: Mutex::new(Vec::new()),
            announcements: Mutex::new(HashMap::new()),
        }
    }

    fn fail_target(&self, label: &str) {
        self.fail.lock().insert(label.to_string());
    }

    fn clear_failures(&self) {
        self.fail.lock().clear();
    }

    fn announce_for(&self, label: &str, announcement: DiscoveryAnnouncement) {
        self.announcements
            .lock()
            .insert(label.to_string(), announcement);
    }

    fn invocations(&self) -> Vec<String> {
        self.invoked.lock().clone()
    }
}

impl LanguageHandler for TestHandler {
    fn language(&self) -> Language {
        Language::new("test")
    }

    fn extensions(&self) -> &[&str] {
        &["t"]
    }

    fn build_impl(
        &self,
        node: &BuildNode,
        ctx: &HandlerContext<'_>,
    ) -> builder::exec::Result<Option<Digest>> {
        let label = node.id.as_str().to_string();
        self.invoked.lock().push(label.clone());

        if self.fail.lock().contains(&label) {
            return Err(builder::exec::BuildError::Handler {
                target: node.id.clone(),
                message: "scripted failure".to_string(),
            });
        }

        let mut artifact = String::new();
        for source in &node.sources {
            artifact.push_str(&std::fs::read_to_string(ctx.workspace.join(source)).unwrap());
        }
        for (dep, digest) in ctx.dep_outputs {
            artifact.push_str(&format!("{}={}\n", dep, digest.to_hex()));
        }
        for output in &node.outputs {
            let path = ctx.workspace.join(output);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(&path, &artifact).unwrap();
        }

        if node.discoverable {
            if let Some(announcement) = self.announcements.lock().get(&label) {
                ctx.discoveries.announce(announcement.clone());
            }
        }
        Ok(None)
    }
}

/// Records finish order for ordering assertions.
#[derive(Default)]
struct RecordingObserver {
    finished: Mutex<Vec<(String, bool)>>,
}

impl RecordingObserver {
    fn successes_in_order(&self) -> Vec<String> {
        self.finished
            .lock()
            .iter()
            .filter(|(_, ok)| *ok)
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn started_any(&self) -> bool {
        !self.finished.lock().is_empty()
    }
}

impl BuildObserver for RecordingObserver {
    fn node_finished(&self, result: &NodeResult) {
        self.finished
            .lock()
            .push((result.id.as_str().to_string(), result.is_success()));
    }
}

fn id(label: &str) -> TargetId {
    TargetId::parse(label).unwrap()
}

fn make_node(workspace: &Path, label: &str, deps: &[&str]) -> BuildNode {
    let target = id(label);
    let source = PathBuf::from(format!("{}.t", target.name()));
    let source_path = workspace.join(&source);
    if !source_path.exists() {
        std::fs::write(&source_path, format!("source of {}\n", label)).unwrap();
    }
    BuildNode::new(target.clone(), TargetKind::Library, Language::new("test"))
        .with_sources(vec![source])
        .with_outputs(vec![PathBuf::from(format!("out/{}.bin", target.name()))])
        .with_dependencies(deps.iter().map(|d| id(d)).collect())
}

fn options() -> BuildOptions {
    BuildOptions {
        workers: 2,
        ..BuildOptions::default()
    }
}

fn run_build(
    workspace: &Path,
    nodes: Vec<BuildNode>,
    handler: &Arc<TestHandler>,
    options: BuildOptions,
) -> (
    Result<BuildSummary, CoordinatorError>,
    Arc<RecordingObserver>,
) {
    let graph = match BuildGraph::from_nodes(nodes) {
        Ok(graph) => graph,
        Err(err) => return (Err(err.into()), Arc::new(RecordingObserver::default())),
    };
    let registry = Arc::new(HandlerRegistry::new());
    registry.register(Arc::clone(handler) as Arc<dyn LanguageHandler>);
    let observer = Arc::new(RecordingObserver::default());
    let summary = Coordinator::new(workspace, graph, registry, options)
        .with_observer(Arc::clone(&observer) as Arc<dyn BuildObserver>)
        .run();
    (summary, observer)
}

/// Linear chain, cold build: everything builds, in dependency order.
#[test]
fn test_linear_chain_cold_build() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(TestHandler::new());
    let nodes = vec![
        make_node(dir.path(), "//x:a", &[]),
        make_node(dir.path(), "//x:b", &["//x:a"]),
        make_node(dir.path(), "//x:c", &["//x:b"]),
    ];

    let (summary, observer) = run_build(dir.path(), nodes, &handler, options());
    let summary = summary.unwrap();
    assert_eq!(summary.built, 3);
    assert_eq!(summary.cached, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(
        observer.successes_in_order(),
        vec!["//x:a", "//x:b", "//x:c"]
    );
}

/// Second run with nothing changed: all cache hits, no handler calls.
#[test]
fn test_second_run_is_fully_cached() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(TestHandler::new());
    let nodes = || {
        vec![
            make_node(dir.path(), "//x:a", &[]),
            make_node(dir.path(), "//x:b", &["//x:a"]),
            make_node(dir.path(), "//x:c", &["//x:b"]),
        ]
    };

    let (first, _) = run_build(dir.path(), nodes(), &handler, options());
    assert_eq!(first.unwrap().built, 3);
    assert_eq!(handler.invocations().len(), 3);

    let (second, _) = run_build(dir.path(), nodes(), &handler, options());
    let second = second.unwrap();
    assert_eq!(second.built, 0);
    assert_eq!(second.cached, 3);
    assert_eq!(second.failed, 0);
    assert_eq!(handler.invocations().len(), 3);
}

/// Changing one byte in the leaf's source rebuilds the whole chain: each
/// dependent sees a different dependency output digest.
#[test]
fn test_source_change_rebuilds_downstream() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(TestHandler::new());
    let nodes = || {
        vec![
            make_node(dir.path(), "//x:a", &[]),
            make_node(dir.path(), "//x:b", &["//x:a"]),
            make_node(dir.path(), "//x:c", &["//x:b"]),
        ]
    };

    let (first, _) = run_build(dir.path(), nodes(), &handler, options());
    assert_eq!(first.unwrap().built, 3);

    std::fs::write(dir.path().join("a.t"), "source of //x:a, edited\n").unwrap();

    let (second, _) = run_build(dir.path(), nodes(), &handler, options());
    let second = second.unwrap();
    assert_eq!(second.built, 3);
    assert_eq!(second.cached, 0);
    assert_eq!(second.failed, 0);
}

/// Diamond with one side failing: the failure cascades to the sink, the
/// other side and the root still build.
#[test]
fn test_failure_cascades_to_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(TestHandler::new());
    handler.fail_target("//x:b");
    let nodes = vec![
        make_node(dir.path(), "//x:a", &[]),
        make_node(dir.path(), "//x:b", &["//x:a"]),
        make_node(dir.path(), "//x:c", &["//x:a"]),
        make_node(dir.path(), "//x:d", &["//x:b", "//x:c"]),
    ];

    let (summary, _) = run_build(dir.path(), nodes, &handler, options());
    let summary = summary.unwrap();
    assert_eq!(summary.built, 2); // a and c
    assert_eq!(summary.failed, 2); // b directly, d by cascade
    assert!(!summary.success());

    // d was never invoked; its failure is inherited.
    assert!(!handler.invocations().contains(&"//x:d".to_string()));
}

/// Resume after a partial run: checkpointed successes are skipped, the
/// rest are attempted.
#[test]
fn test_resume_skips_checkpointed_successes() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(TestHandler::new());
    let nodes = || {
        vec![
            make_node(dir.path(), "//x:a", &[]),
            make_node(dir.path(), "//x:b", &["//x:a"]),
            make_node(dir.path(), "//x:c", &["//x:a"]),
            make_node(dir.path(), "//x:d", &["//x:b", "//x:c"]),
        ]
    };

    // First session: b and c fail, so only a completes. The checkpoint
    // survives the failed session.
    handler.fail_target("//x:b");
    handler.fail_target("//x:c");
    let (first, _) = run_build(dir.path(), nodes(), &handler, options());
    let first = first.unwrap();
    assert_eq!(first.built, 1);
    assert_eq!(first.failed, 3);

    // Resume with the failures fixed: a is skipped, b/c/d are attempted.
    handler.clear_failures();
    let resume_options = BuildOptions {
        resume: true,
        ..options()
    };
    let invocations_before = handler.invocations().len();
    let (second, _) = run_build(dir.path(), nodes(), &handler, resume_options);
    let second = second.unwrap();
    assert_eq!(second.failed, 0);
    assert_eq!(second.cached, 1);
    assert_eq!(second.built, 3);

    let new_invocations: Vec<String> = handler.invocations()[invocations_before..].to_vec();
    assert!(!new_invocations.contains(&"//x:a".to_string()));
}

/// A discoverable target announces a new node mid-build; both complete in
/// announcement order.
#[test]
fn test_discovery_extends_live_graph() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(TestHandler::new());

    let g = {
        let mut node = make_node(dir.path(), "//x:g", &[]);
        node.discoverable = true;
        node
    };
    let h = make_node(dir.path(), "//x:h", &[]);
    handler.announce_for(
        "//x:g",
        DiscoveryAnnouncement::new(id("//x:g"), vec![h]).with_edges(vec![(
            id("//x:h"),
            id("//x:g"),
        )]),
    );

    let (summary, observer) = run_build(dir.path(), vec![g], &handler, options());
    let summary = summary.unwrap();
    assert_eq!(summary.built, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(observer.successes_in_order(), vec!["//x:g", "//x:h"]);
}

/// A cyclic graph is rejected before anything is scheduled.
#[test]
fn test_cycle_rejected_before_scheduling() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(TestHandler::new());
    let nodes = vec![
        make_node(dir.path(), "//x:a", &["//x:b"]),
        make_node(dir.path(), "//x:b", &["//x:a"]),
    ];

    let (summary, observer) = run_build(dir.path(), nodes, &handler, options());
    match summary {
        Err(CoordinatorError::Graph(GraphError::Cycle { path })) => {
            assert!(path.contains(&id("//x:a")) || path.contains(&id("//x:b")));
        }
        other => panic!("expected cycle error, got {:?}", other.map(|s| s.to_string())),
    }
    assert!(!observer.started_any());
    assert!(handler.invocations().is_empty());
}

/// Fail-fast mode stops dispatching after the first failure and marks the
/// rest skipped.
#[test]
fn test_fail_fast_skips_remaining() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(TestHandler::new());
    handler.fail_target("//x:a");
    let nodes = vec![
        make_node(dir.path(), "//x:a", &[]),
        make_node(dir.path(), "//x:b", &["//x:a"]),
        make_node(dir.path(), "//x:c", &["//x:b"]),
    ];

    let fail_fast = BuildOptions {
        workers: 1,
        fail_fast: true,
        ..BuildOptions::default()
    };
    let (summary, _) = run_build(dir.path(), nodes, &handler, fail_fast);
    let summary = summary.unwrap();
    assert!(!summary.success());
    assert_eq!(summary.built, 0);
    // b and c end as failed-by-cascade or skipped, never built.
    assert_eq!(summary.built + summary.cached, 0);
    assert_eq!(handler.invocations(), vec!["//x:a".to_string()]);
}

/// Priority-tagged independent roots all finish regardless of dispatch
/// order, and dependents observe every predecessor.
#[test]
fn test_wide_graph_completes_under_bounded_workers() {
    let dir = tempfile::tempdir().unwrap();
    let handler = Arc::new(TestHandler::new());
    let mut nodes = vec![make_node(dir.path(), "//x:sink", &[])];
    let mut deps = Vec::new();
    for i in 0..12 {
        let label = format!("//x:leaf{}", i);
        nodes.push(make_node(dir.path(), &label, &[]));
        deps.push(label);
    }
    let dep_refs: Vec<&str> = deps.iter().map(String::as_str).collect();
    nodes[0] = make_node(dir.path(), "//x:sink", &dep_refs);

    let (summary, _) = run_build(dir.path(), nodes, &handler, options());
    let summary = summary.unwrap();
    assert_eq!(summary.built, 13);
    assert_eq!(summary.failed, 0);

    // The sink ran after every leaf.
    let invocations = handler.invocations();
    let sink_pos = invocations.iter().position(|l| l == "//x:sink").unwrap();
    assert_eq!(sink_pos, invocations.len() - 1);
}
