//! # Zero-Configuration Target Inference
//!
//! When a workspace carries no manifest, targets are proposed from what is
//! on disk: source files are grouped by (directory, language) using the
//! extensions the registered handlers claim, a directory with an entry-point
//! file becomes an executable, and import analysis wires dependency edges
//! between the proposals. The `infer` command prints the proposal; `build`
//! can run it directly.

use crate::core::{BuildNode, Language, TargetId, TargetKind};
use crate::exec::HandlerRegistry;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Directory names never scanned.
const SKIPPED_DIRS: [&str; 4] = [".builder-cache", "build-out", "target", "node_modules"];

/// Source file stems that mark a directory as producing an executable.
const ENTRY_POINT_STEMS: [&str; 2] = ["main", "__main__"];

/// Proposes build targets for a workspace.
pub struct TargetInference<'a> {
    registry: &'a HandlerRegistry,
}

impl<'a> TargetInference<'a> {
    /// Infer with the languages the registry knows.
    pub fn new(registry: &'a HandlerRegistry) -> Self {
        TargetInference { registry }
    }

    /// Scan the workspace and propose one node per (directory, language)
    /// group. Deterministic: sources and nodes come back sorted.
    pub fn scan(&self, workspace: &Path) -> std::io::Result<Vec<BuildNode>> {
        let mut files: Vec<PathBuf> = Vec::new();
        collect_sources(workspace, Path::new(""), &mut files)?;
        files.sort();

        let mut groups: BTreeMap<(String, Language), Vec<PathBuf>> = BTreeMap::new();
        for file in files {
            let extension = match file.extension().and_then(|e| e.to_str()) {
                Some(ext) => ext,
                None => continue,
            };
            let language = match self.registry.language_for_extension(extension) {
                Some(language) => language,
                None => continue,
            };
            let dir = file
                .parent()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            groups.entry((dir, language)).or_default().push(file);
        }

        let mut nodes = Vec::with_capacity(groups.len());
        for ((dir, language), sources) in &groups {
            let base = Path::new(dir)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("root")
                .to_string();
            let multi_language = groups
                .keys()
                .filter(|(other_dir, _)| other_dir == dir)
                .count()
                > 1;
            let name = if multi_language {
                format!("{}-{}", base, language)
            } else {
                base
            };

            let kind = if sources.iter().any(is_entry_point) {
                TargetKind::Executable
            } else {
                TargetKind::Library
            };

            let node = BuildNode::new(TargetId::new(dir, &name), kind, language.clone())
                .with_sources(sources.clone());
            log::debug!(
                "Inferred {} ({}, {} sources)",
                node.id,
                node.kind,
                node.sources.len()
            );
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Wire dependency edges between proposals by asking each language
    /// handler to analyze imports. An import resolving to another
    /// proposal's source becomes an edge.
    pub fn link_dependencies(&self, workspace: &Path, nodes: &mut Vec<BuildNode>) {
        let source_owner: BTreeMap<PathBuf, TargetId> = nodes
            .iter()
            .flat_map(|node| {
                node.sources
                    .iter()
                    .map(move |source| (source.clone(), node.id.clone()))
            })
            .collect();

        for node in nodes.iter_mut() {
            let handler = match self.registry.get(&node.language) {
                Some(handler) => handler,
                None => continue,
            };
            let absolute: Vec<PathBuf> =
                node.sources.iter().map(|s| workspace.join(s)).collect();
            let imports = match handler.analyze_imports(&absolute) {
                Ok(imports) => imports,
                Err(err) => {
                    log::warn!("Import analysis failed for {}: {}", node.id, err);
                    continue;
                }
            };
            for import in imports {
                let resolved = match import.path {
                    Some(path) => path,
                    None => continue,
                };
                let relative = resolved
                    .strip_prefix(workspace)
                    .map(|p| p.to_path_buf())
                    .unwrap_or(resolved);
                if let Some(owner) = source_owner.get(&relative) {
                    if *owner != node.id && !node.dependency_ids.contains(owner) {
                        node.dependency_ids.push(owner.clone());
                    }
                }
            }
            node.dependency_ids.sort();
        }
    }
}

/// Scan and link in one pass.
pub fn infer_targets(
    workspace: &Path,
    registry: &HandlerRegistry,
) -> std::io::Result<Vec<BuildNode>> {
    let inference = TargetInference::new(registry);
    let mut nodes = inference.scan(workspace)?;
    inference.link_dependencies(workspace, &mut nodes);
    Ok(nodes)
}

fn collect_sources(
    workspace: &Path,
    relative: &Path,
    out: &mut Vec<PathBuf>,
) -> std::io::Result<()> {
    let absolute = workspace.join(relative);
    for entry in std::fs::read_dir(&absolute)? {
        let entry = entry?;
        let name = entry.file_name();
        let name_str = name.to_string_lossy();
        if name_str.starts_with('.') || SKIPPED_DIRS.contains(&name_str.as_ref()) {
            continue;
        }
        let child = relative.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            collect_sources(workspace, &child, out)?;
        } else if file_type.is_file() {
            out.push(child);
        }
    }
    Ok(())
}

fn is_entry_point(path: &PathBuf) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(|stem| ENTRY_POINT_STEMS.contains(&stem))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{HandlerContext, Import, LanguageHandler};
    use crate::hash::Digest;
    use std::sync::Arc;

    struct StubHandler {
        language: &'static str,
        extensions: &'static [&'static str],
        imports: Vec<Import>,
    }

    impl LanguageHandler for StubHandler {
        fn language(&self) -> Language {
            Language::new(self.language)
        }

        fn extensions(&self) -> &[&str] {
            self.extensions
        }

        fn build_impl(
            &self,
            _node: &BuildNode,
            _ctx: &HandlerContext<'_>,
        ) -> crate::exec::Result<Option<Digest>> {
            Ok(None)
        }

        fn analyze_imports(&self, _sources: &[PathBuf]) -> crate::exec::Result<Vec<Import>> {
            Ok(self.imports.clone())
        }
    }

    fn registry() -> Arc<HandlerRegistry> {
        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Arc::new(StubHandler {
            language: "python",
            extensions: &["py"],
            imports: Vec::new(),
        }));
        registry
    }

    #[test]
    fn test_scan_groups_by_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("app/main.py"), "import lib.util\n").unwrap();
        std::fs::write(dir.path().join("app/helpers.py"), "\n").unwrap();
        std::fs::write(dir.path().join("lib/util.py"), "\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "docs\n").unwrap();

        let registry = registry();
        let nodes = TargetInference::new(&registry).scan(dir.path()).unwrap();
        assert_eq!(nodes.len(), 2);

        let app = nodes.iter().find(|n| n.id.package() == "app").unwrap();
        assert_eq!(app.kind, TargetKind::Executable);
        assert_eq!(app.sources.len(), 2);

        let lib = nodes.iter().find(|n| n.id.package() == "lib").unwrap();
        assert_eq!(lib.kind, TargetKind::Library);
    }

    #[test]
    fn test_scan_skips_cache_and_hidden_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".builder-cache")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join(".builder-cache/stray.py"), "\n").unwrap();
        std::fs::write(dir.path().join(".git/hook.py"), "\n").unwrap();
        std::fs::write(dir.path().join("main.py"), "\n").unwrap();

        let registry = registry();
        let nodes = TargetInference::new(&registry).scan(dir.path()).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].sources, vec![PathBuf::from("main.py")]);
    }

    #[test]
    fn test_unclaimed_extensions_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.zig"), "\n").unwrap();
        let registry = registry();
        assert!(TargetInference::new(&registry)
            .scan(dir.path())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_link_dependencies_from_imports() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("app")).unwrap();
        std::fs::create_dir_all(dir.path().join("lib")).unwrap();
        std::fs::write(dir.path().join("app/main.py"), "\n").unwrap();
        std::fs::write(dir.path().join("lib/util.py"), "\n").unwrap();

        let registry = Arc::new(HandlerRegistry::new());
        registry.register(Arc::new(StubHandler {
            language: "python",
            extensions: &["py"],
            imports: vec![Import {
                module: "lib.util".to_string(),
                path: Some(PathBuf::from("lib/util.py")),
            }],
        }));

        let nodes = infer_targets(dir.path(), &registry).unwrap();
        let app = nodes.iter().find(|n| n.id.package() == "app").unwrap();
        let lib = nodes.iter().find(|n| n.id.package() == "lib").unwrap();
        assert_eq!(app.dependency_ids, vec![lib.id.clone()]);
        // The stub reports the same import for every node; self-imports are
        // dropped.
        assert!(lib.dependency_ids.is_empty());
    }
}
