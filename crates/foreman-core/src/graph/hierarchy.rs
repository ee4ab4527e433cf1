//! Containment queries and the dependency graph view.
//!
//! The `parent` edge forms a forest: every item has at most one parent and
//! containment never loops (the store rejects cycles on insertion). These
//! functions answer the usual hierarchy questions over a [`GraphView`]:
//!
//! - Which items are children of a given epic?
//! - What is the full subtree under an item?
//! - What are an item's ancestors, and which root does it belong to?
//! - How far along is an epic (done/total leaf items)?
//!
//! [`dependency_graph`] returns the sub-graph reachable from one root through
//! every edge kind, for visualization and debugging.

#![allow(
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::doc_markdown
)]

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;

use serde::Serialize;

use super::GraphView;
use super::edges::{Edge, EdgeKind};
use crate::model::{ItemId, Status};

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Completion of the leaf items under an epic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Progress {
    /// Leaf items in `done`.
    pub done: u32,
    /// Leaf items currently owned by a worker.
    pub in_flight: u32,
    /// All leaf items in the subtree.
    pub total: u32,
}

impl Progress {
    /// Returns `true` if every leaf is done (or there are none).
    pub const fn is_complete(&self) -> bool {
        self.total == 0 || self.done == self.total
    }

    pub const fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.done)
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} done", self.done, self.total)
    }
}

// ---------------------------------------------------------------------------
// Containment queries
// ---------------------------------------------------------------------------

/// Direct children of `id`, sorted by id.
pub fn children(view: &GraphView, id: &str) -> Vec<ItemId> {
    let mut out: Vec<ItemId> = view
        .edges()
        .sources(id, EdgeKind::Parent)
        .cloned()
        .collect();
    out.sort_unstable();
    out
}

/// Every item contained (transitively) by `id`, breadth-first.
///
/// `id` itself is not included.
pub fn descendants(view: &GraphView, id: &str) -> Vec<ItemId> {
    let mut out = Vec::new();
    let mut seen: HashSet<ItemId> = HashSet::new();
    let mut queue: VecDeque<ItemId> = children(view, id).into();

    while let Some(next) = queue.pop_front() {
        if !seen.insert(next.clone()) {
            continue;
        }
        queue.extend(children(view, next.as_str()));
        out.push(next);
    }
    out
}

/// Parents of `id` from the immediate parent up to the root.
pub fn ancestors(view: &GraphView, id: &str) -> Vec<ItemId> {
    let mut out = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut current = view.get(id).and_then(|item| item.parent.as_ref());

    while let Some(parent) = current {
        if !seen.insert(parent.as_str()) {
            break;
        }
        out.push(parent.clone());
        current = view.get(parent.as_str()).and_then(|item| item.parent.as_ref());
    }
    out
}

/// Top-most container of `id`, or `id` itself when it has no parent.
///
/// Returns `None` if `id` is unknown.
pub fn root(view: &GraphView, id: &str) -> Option<ItemId> {
    let item = view.get(id)?;
    Some(
        ancestors(view, id)
            .pop()
            .unwrap_or_else(|| item.id.clone()),
    )
}

/// Leaf-item completion under `id`.
///
/// Intermediate containers are not counted themselves; a childless `id`
/// counts as its own single leaf.
pub fn progress(view: &GraphView, id: &str) -> Progress {
    let mut progress = Progress::default();
    let subtree = descendants(view, id);
    let leaves: Vec<&ItemId> = subtree
        .iter()
        .filter(|item| view.edges().sources(item.as_str(), EdgeKind::Parent).next().is_none())
        .collect();

    let mut count = |status: Option<Status>| {
        progress.total += 1;
        match status {
            Some(Status::Done) => progress.done += 1,
            Some(s) if s.is_owned() => progress.in_flight += 1,
            _ => {}
        }
    };

    if leaves.is_empty() {
        if view.contains(id) {
            count(view.status(id));
        }
    } else {
        for leaf in leaves {
            count(view.status(leaf.as_str()));
        }
    }
    progress
}

// ---------------------------------------------------------------------------
// Dependency graph view
// ---------------------------------------------------------------------------

/// One node of a [`DependencyGraph`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    pub id: ItemId,
    pub title: String,
    pub status: Status,
    /// Breadth-first distance from the root.
    pub depth: usize,
}

/// Sub-graph reachable from a root through any edge kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DependencyGraph {
    pub root: ItemId,
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<Edge>,
}

impl DependencyGraph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.iter().find(|node| node.id.as_str() == id)
    }

    /// Graphviz rendering, one line per node and edge.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph work {\n");
        for node in &self.nodes {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}\"];\n",
                node.id,
                node.title.replace('"', "'"),
                node.status
            ));
        }
        for edge in &self.edges {
            let style = match edge.kind {
                EdgeKind::DependsOn => "solid",
                EdgeKind::SoftDependsOn => "dashed",
                EdgeKind::Parent => "dotted",
            };
            out.push_str(&format!(
                "  \"{}\" -> \"{}\" [style={style}];\n",
                edge.from, edge.to
            ));
        }
        out.push('}');
        out
    }
}

/// Collect every item reachable from `root_id` through outgoing edges of any
/// kind and through incoming containment edges (children).
///
/// Returns `None` if `root_id` is unknown.
pub fn dependency_graph(view: &GraphView, root_id: &str) -> Option<DependencyGraph> {
    let root_item = view.get(root_id)?;

    let mut nodes = Vec::new();
    let mut edges: BTreeSet<Edge> = BTreeSet::new();
    let mut seen: HashSet<ItemId> = HashSet::new();
    let mut queue: VecDeque<(ItemId, usize)> = VecDeque::new();
    queue.push_back((root_item.id.clone(), 0));

    while let Some((id, depth)) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        let Some(item) = view.get(id.as_str()) else {
            continue;
        };
        nodes.push(GraphNode {
            id: item.id.clone(),
            title: item.title.clone(),
            status: item.status,
            depth,
        });

        for edge in view.edges().outgoing(id.as_str()) {
            edges.insert(edge.clone());
            queue.push_back((edge.to.clone(), depth + 1));
        }
        for edge in view.edges().incoming(id.as_str()) {
            if edge.kind == EdgeKind::Parent {
                edges.insert(edge.clone());
                queue.push_back((edge.from.clone(), depth + 1));
            }
        }
    }

    Some(DependencyGraph {
        root: root_item.id.clone(),
        nodes,
        edges: edges.into_iter().collect(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
