use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use serde::Serialize;

use crate::core::lock;
use crate::engine::Engine;
use crate::engine::context::State;
use crate::slug::{Fingerprint, Slug};

/// Snapshot of what a fingerprint was computed from, as last recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyTree {
    pub slug: String,
    pub cacheable: bool,
    /// Sequence index of the main iteration, if the fingerprint ever ran.
    pub index: Option<u64>,
    pub up_to_date: Option<bool>,
    pub dependencies: Vec<DependencyTree>,
}

impl DependencyTree {
    fn label(&self) -> String {
        if !self.cacheable {
            return format!("[uncacheable] {}", self.slug);
        }

        match (self.index, self.up_to_date) {
            (Some(index), Some(true)) => format!("[#{index}] [upToDate] {}", self.slug),
            (Some(index), _) => format!("[#{index}] [outOfDate] {}", self.slug),
            (None, _) => format!("[missing] {}", self.slug),
        }
    }

    /// Indented text tree, one node per line.
    pub fn render(&self) -> String {
        self.to_string()
    }

    /// Nested `<details>` elements, one per node with dependencies.
    pub fn render_html(&self) -> String {
        let mut acc = String::new();
        self.write_html(&mut acc);
        acc
    }

    fn write_html(&self, acc: &mut String) {
        let label = escape_html(&self.label());

        if self.dependencies.is_empty() {
            acc.push_str(&format!("<div>{label}</div>"));
            return;
        }

        acc.push_str(&format!("<details open><summary>{label}</summary><ul>"));
        for dependency in &self.dependencies {
            acc.push_str("<li>");
            dependency.write_html(acc);
            acc.push_str("</li>");
        }
        acc.push_str("</ul></details>");
    }

    /// Renders the tree as a Mermaid diagram, color-coded by freshness.
    ///
    /// * **Green**: Up to date
    /// * **Red**: Out of date
    /// * **Grey**: Uncacheable or never ran
    pub fn render_mermaid(&self) -> String {
        let mut lines = vec!["graph TD".to_string()];
        let mut next = 0;
        self.write_mermaid(&mut lines, &mut next);
        lines.join("\n")
    }

    fn write_mermaid(&self, lines: &mut Vec<String>, next: &mut usize) -> usize {
        let id = *next;
        *next += 1;

        let color = match (self.cacheable, self.up_to_date) {
            (true, Some(true)) => "#90EE90",
            (true, Some(false)) => "#F08080",
            _ => "#D3D3D3",
        };

        lines.push(format!("    n{id}[\"{}\"]", self.label().replace('"', "#quot;")));
        lines.push(format!("    style n{id} fill:{color}"));

        for dependency in &self.dependencies {
            let child = dependency.write_mermaid(lines, next);
            lines.push(format!("    n{id} --> n{child}"));
        }

        id
    }

    fn write_indented(&self, f: &mut Formatter<'_>, depth: usize) -> std::fmt::Result {
        writeln!(f, "{:indent$}{}", "", self.label(), indent = depth * 2)?;
        for dependency in &self.dependencies {
            dependency.write_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl Display for DependencyTree {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        self.write_indented(f, 0)
    }
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// A fingerprint in the exported dependency graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub slug: Slug,
    pub index: Option<u64>,
    pub up_to_date: Option<bool>,
    /// How many later runs reused the main iteration.
    pub repeats: usize,
}

impl Engine {
    /// Snapshot of the recorded dependencies of `of`.
    ///
    /// A fingerprint reached again on its own path is shown without children.
    pub fn dependency_tree(&self, of: &impl Fingerprint) -> DependencyTree {
        let state = lock(&self.inner.state);
        let mut path = HashSet::new();
        build_tree(&state, of.fingerprint(), &mut path)
    }

    /// Every fingerprint seen so far, with an edge from each to the
    /// fingerprints recorded beneath it.
    pub fn graph(&self) -> Graph<GraphNode, ()> {
        let state = lock(&self.inner.state);
        let mut graph = Graph::new();
        let mut nodes = HashMap::new();

        for (id, collection) in state.collections() {
            let main = collection.main.map(|main| state.context(main));
            let index = graph.add_node(GraphNode {
                slug: collection.slug.clone(),
                index: main.map(|ctx| ctx.index),
                up_to_date: main.map(|ctx| ctx.up_to_date),
                repeats: main.map_or(0, |ctx| ctx.copies.len()),
            });
            nodes.insert(id, index);
        }

        let mut edges: HashSet<(NodeIndex, NodeIndex)> = HashSet::new();
        for (_, ctx) in state.contexts() {
            let Some(parent) = ctx.parent else {
                continue;
            };

            let from = nodes[&state.context(parent).collection];
            let to = nodes[&ctx.collection];
            if edges.insert((from, to)) {
                graph.add_edge(from, to, ());
            }
        }

        graph
    }
}

fn build_tree(state: &State, slug: Slug, path: &mut HashSet<Slug>) -> DependencyTree {
    let main = state
        .find(&slug)
        .and_then(|collection| state.collection(collection).main)
        .map(|id| state.context(id));

    let mut tree = DependencyTree {
        slug: slug.key().to_string(),
        cacheable: slug.is_cacheable(),
        index: main.map(|ctx| ctx.index),
        up_to_date: main.map(|ctx| ctx.up_to_date),
        dependencies: Vec::new(),
    };

    if !slug.is_cacheable() || !path.insert(slug.clone()) {
        return tree;
    }

    if let Some(dependencies) = main.and_then(|ctx| ctx.dependencies.as_ref()) {
        tree.dependencies = dependencies
            .iter()
            .map(|&dep| build_tree(state, state.context(dep).slug.clone(), path))
            .collect();
    }

    path.remove(&slug);
    tree
}
