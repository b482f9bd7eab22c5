//! Dependency graph construction and build ordering.
//!
//! The graph is a transient name-to-dependency-names map built fresh for
//! every request. Three independent passes: expansion through the template
//! store, cycle detection, and ordering. A cycle aborts the whole request;
//! no partial order is ever returned.

use crate::adapters::TemplateStore;
use crate::error::{BuildError, Result};
use std::collections::{HashMap, HashSet};

/// Adjacency map: template name to its direct dependency names.
pub type DependencyGraph = HashMap<String, Vec<String>>;

/// Build order for `root`: every dependency appears before its dependents.
///
/// Sibling ordering among independent dependencies follows traversal order
/// and is not guaranteed to be stable across calls.
pub async fn build_order(store: &dyn TemplateStore, root: &str) -> Result<Vec<String>> {
    let graph = expand(store, root).await?;
    detect_cycles(root, &graph)?;
    Ok(topological_order(root, &graph))
}

/// Expand the dependency graph rooted at `root`.
///
/// Each node is expanded exactly once; templates already visited are not
/// re-expanded. A missing root is an error; a declared dependency absent
/// from the store stays in the graph as a leaf, and the status-resolution
/// pass decides whether that is fatal.
async fn expand(store: &dyn TemplateStore, root: &str) -> Result<DependencyGraph> {
    let mut graph = DependencyGraph::new();
    let mut visited = HashSet::new();
    let mut pending = vec![root.to_string()];

    while let Some(name) = pending.pop() {
        if !visited.insert(name.clone()) {
            continue;
        }

        let template = match store.get_template(&name).await {
            Ok(template) => template,
            Err(err) if name == root => return Err(err),
            Err(_) => {
                graph.insert(name, Vec::new());
                continue;
            }
        };
        let dependencies: Vec<String> =
            template.dependencies.iter().map(|dep| dep.name.clone()).collect();

        for dependency in &dependencies {
            if !visited.contains(dependency) {
                pending.push(dependency.clone());
            }
        }

        graph.insert(name, dependencies);
    }

    Ok(graph)
}

/// Depth-first cycle check over the expanded graph.
fn detect_cycles(root: &str, graph: &DependencyGraph) -> Result<()> {
    let mut visited = HashSet::new();
    let mut on_path = HashSet::new();

    if has_cycle(root, graph, &mut visited, &mut on_path) {
        return Err(BuildError::circular_dependency(format!(
            "circular dependency detected while expanding '{root}'"
        ))
        .with_context("template", root));
    }

    Ok(())
}

fn has_cycle(
    name: &str,
    graph: &DependencyGraph,
    visited: &mut HashSet<String>,
    on_path: &mut HashSet<String>,
) -> bool {
    visited.insert(name.to_string());
    on_path.insert(name.to_string());

    for dependency in graph.get(name).map(Vec::as_slice).unwrap_or_default() {
        if !visited.contains(dependency) {
            if has_cycle(dependency, graph, visited, on_path) {
                return true;
            }
        } else if on_path.contains(dependency) {
            return true;
        }
    }

    on_path.remove(name);
    false
}

/// Post-order traversal from `root`. Appending on exit places every
/// dependency before the templates that require it.
fn topological_order(root: &str, graph: &DependencyGraph) -> Vec<String> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    visit(root, graph, &mut visited, &mut order);
    order
}

fn visit(
    name: &str,
    graph: &DependencyGraph,
    visited: &mut HashSet<String>,
    order: &mut Vec<String>,
) {
    if !visited.insert(name.to_string()) {
        return;
    }

    for dependency in graph.get(name).map(Vec::as_slice).unwrap_or_default() {
        visit(dependency, graph, visited, order);
    }

    order.push(name.to_string());
}
