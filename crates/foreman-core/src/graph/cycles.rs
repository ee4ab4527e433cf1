//! Cycle detection for the structural (hard dependency + containment) graph.
//!
//! # Overview
//!
//! Hard dependencies and parent links together form a directed graph. A
//! cycle would make items permanently stuck, so the store runs
//! [`detect_cycle_on_add`] before every structural edge insertion and
//! rejects the write when it returns a path.
//!
//! # Design
//!
//! - **DFS-based**: depth-first search from the target of the new edge,
//!   looking for a path back to the source. This finds the exact cycle the
//!   new edge would close.
//! - **Reject, don't repair**: the caller gets the cycle path in the error and
//!   the graph is left untouched.
//! - **O(V+E)**: each check visits every node and edge at most once.

#![allow(
    clippy::must_use_candidate,
    clippy::module_name_repetitions,
    clippy::doc_markdown
)]

use std::collections::{HashMap, HashSet};
use std::fmt;

use super::edges::{EdgeIndex, EdgeKind};
use crate::model::ItemId;

// ---------------------------------------------------------------------------
// CyclePath
// ---------------------------------------------------------------------------

/// The cycle a rejected edge would have closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePath {
    /// Item ids forming the loop, starting and ending at `edge_from`.
    ///
    /// Adding `A -> B` when `B -> C -> A` already exists yields
    /// `["A", "B", "C", "A"]`.
    pub path: Vec<ItemId>,

    /// Source of the rejected edge.
    pub edge_from: ItemId,

    /// Target of the rejected edge.
    pub edge_to: ItemId,

    /// Kind of the rejected edge.
    pub kind: EdgeKind,
}

impl CyclePath {
    /// Number of distinct items in the cycle.
    pub fn cycle_len(&self) -> usize {
        self.path.len().saturating_sub(1)
    }

    pub fn is_self_loop(&self) -> bool {
        self.edge_from == self.edge_to
    }
}

impl fmt::Display for CyclePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_self_loop() {
            write!(
                f,
                "cycle detected: self-loop on '{}' ({} edge)",
                self.edge_from, self.kind
            )
        } else {
            let shown: Vec<&str> = self.path.iter().map(ItemId::as_str).collect();
            write!(
                f,
                "cycle detected ({} items) adding {} edge: {}",
                self.cycle_len(),
                self.kind,
                shown.join(" → ")
            )
        }
    }
}

// ---------------------------------------------------------------------------
// Core detection
// ---------------------------------------------------------------------------

/// Detect whether adding the structural edge `from -> to` would close a cycle.
///
/// Checks whether `to` already reaches `from` through structural edges.
/// Soft edges are ignored: they never participate in the invariant, so a
/// soft edge is never reported.
///
/// # Complexity
///
/// O(V+E).
pub fn detect_cycle_on_add(
    edges: &EdgeIndex,
    from: &ItemId,
    to: &ItemId,
    kind: EdgeKind,
) -> Option<CyclePath> {
    if !kind.is_structural() {
        return None;
    }

    if from == to {
        return Some(CyclePath {
            path: vec![from.clone(), from.clone()],
            edge_from: from.clone(),
            edge_to: to.clone(),
            kind,
        });
    }

    let mut visited: HashSet<&ItemId> = HashSet::new();
    let mut parent_map: HashMap<&ItemId, &ItemId> = HashMap::new();

    if dfs_find_path(edges, to, from, &mut visited, &mut parent_map) {
        // parent_map walks back from `from` to `to`.
        let mut chain = vec![from.clone()];
        let mut current = from;
        while current != to {
            match parent_map.get(current) {
                Some(prev) => {
                    chain.push((*prev).clone());
                    current = *prev;
                }
                None => break,
            }
        }
        chain.push(from.clone());
        // chain is [from, ..., to, from]; reverse the middle to get
        // from -> to -> ... -> from.
        let mut path = vec![from.clone()];
        path.extend(chain[1..chain.len() - 1].iter().rev().cloned());
        path.push(from.clone());

        Some(CyclePath {
            path,
            edge_from: from.clone(),
            edge_to: to.clone(),
            kind,
        })
    } else {
        None
    }
}

/// Check whether the structural graph contains any cycle at all.
///
/// Used to re-validate graphs loaded from storage.
pub fn has_cycles(edges: &EdgeIndex, nodes: impl IntoIterator<Item = ItemId>) -> bool {
    let nodes: Vec<ItemId> = nodes.into_iter().collect();
    let mut color: HashMap<&ItemId, Color> = nodes.iter().map(|id| (id, Color::White)).collect();

    for node in &nodes {
        if color.get(node) == Some(&Color::White) && dfs_has_cycle(edges, node, &mut color) {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// DFS internals
// ---------------------------------------------------------------------------

/// DFS colors for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    /// Not yet visited.
    White,
    /// On the DFS stack.
    Gray,
    /// Fully processed.
    Black,
}

fn dfs_find_path<'a>(
    edges: &'a EdgeIndex,
    current: &'a ItemId,
    target: &ItemId,
    visited: &mut HashSet<&'a ItemId>,
    parent_map: &mut HashMap<&'a ItemId, &'a ItemId>,
) -> bool {
    if current == target {
        return true;
    }

    if !visited.insert(current) {
        return false;
    }

    for neighbor in edges.structural_targets(current.as_str()) {
        if !visited.contains(neighbor) {
            parent_map.insert(neighbor, current);
            if dfs_find_path(edges, neighbor, target, visited, parent_map) {
                return true;
            }
        }
    }

    false
}

fn dfs_has_cycle<'a>(
    edges: &'a EdgeIndex,
    node: &'a ItemId,
    color: &mut HashMap<&'a ItemId, Color>,
) -> bool {
    color.insert(node, Color::Gray);

    for neighbor in edges.structural_targets(node.as_str()) {
        match color.get(neighbor).copied().unwrap_or(Color::White) {
            Color::White => {
                if dfs_has_cycle(edges, neighbor, color) {
                    return true;
                }
            }
            Color::Gray => return true,
            Color::Black => {}
        }
    }

    color.insert(node, Color::Black);
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::edges::Edge;

    fn id(raw: &str) -> ItemId {
        ItemId::new_unchecked(raw)
    }

    fn build(edges: &[(&str, &str, EdgeKind)]) -> EdgeIndex {
        let mut index = EdgeIndex::new();
        for (from, to, kind) in edges {
            index.insert(Edge::new(id(from), id(to), *kind));
        }
        index
    }

    #[test]
    fn self_loop_detected() {
        let index = build(&[]);
        let cycle = detect_cycle_on_add(&index, &id("a"), &id("a"), EdgeKind::DependsOn)
            .expect("self loop");
        assert!(cycle.is_self_loop());
        assert_eq!(cycle.cycle_len(), 1);
        assert!(cycle.to_string().contains("self-loop"));
    }

    #[test]
    fn mutual_dependency_detected() {
        let index = build(&[("a", "b", EdgeKind::DependsOn)]);
        let cycle = detect_cycle_on_add(&index, &id("b"), &id("a"), EdgeKind::DependsOn)
            .expect("cycle");
        assert_eq!(cycle.path, vec![id("b"), id("a"), id("b")]);
        assert_eq!(cycle.cycle_len(), 2);
    }

    #[test]
    fn long_cycle_path_is_ordered() {
        // b -> c -> d already; adding d -> b closes d -> b -> c -> d.
        let index = build(&[
            ("b", "c", EdgeKind::DependsOn),
            ("c", "d", EdgeKind::DependsOn),
        ]);
        let cycle = detect_cycle_on_add(&index, &id("d"), &id("b"), EdgeKind::DependsOn)
            .expect("cycle");
        assert_eq!(cycle.path, vec![id("d"), id("b"), id("c"), id("d")]);
        let shown = cycle.to_string();
        assert!(shown.contains("d → b → c → d"), "display: {shown}");
    }

    #[test]
    fn containment_and_dependency_edges_combine() {
        // child is contained by epic; epic depends on child would loop.
        let index = build(&[("child", "epic", EdgeKind::Parent)]);
        assert!(
            detect_cycle_on_add(&index, &id("epic"), &id("child"), EdgeKind::DependsOn).is_some()
        );
    }

    #[test]
    fn soft_edges_never_form_cycles() {
        let index = build(&[("a", "b", EdgeKind::DependsOn)]);
        assert!(
            detect_cycle_on_add(&index, &id("b"), &id("a"), EdgeKind::SoftDependsOn).is_none()
        );

        let soft_only = build(&[("a", "b", EdgeKind::SoftDependsOn)]);
        assert!(
            detect_cycle_on_add(&soft_only, &id("b"), &id("a"), EdgeKind::DependsOn).is_none()
        );
    }

    #[test]
    fn diamond_is_not_a_cycle() {
        let index = build(&[
            ("d", "b", EdgeKind::DependsOn),
            ("d", "c", EdgeKind::DependsOn),
            ("b", "a", EdgeKind::DependsOn),
        ]);
        assert!(detect_cycle_on_add(&index, &id("c"), &id("a"), EdgeKind::DependsOn).is_none());
    }

    #[test]
    fn has_cycles_over_whole_graph() {
        let acyclic = build(&[
            ("b", "a", EdgeKind::DependsOn),
            ("c", "b", EdgeKind::Parent),
        ]);
        assert!(!has_cycles(&acyclic, [id("a"), id("b"), id("c")]));

        let cyclic = build(&[
            ("a", "b", EdgeKind::DependsOn),
            ("b", "c", EdgeKind::Parent),
            ("c", "a", EdgeKind::DependsOn),
        ]);
        assert!(has_cycles(&cyclic, [id("a"), id("b"), id("c")]));
    }
}
