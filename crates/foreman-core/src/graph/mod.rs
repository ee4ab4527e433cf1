//! Graph-level abstractions for work-item relationships.
//!
//! ## Submodules
//!
//! - [`edges`]: typed edge records and the forward/reverse adjacency index.
//! - [`cycles`]: reachability-based cycle detection run on every structural
//!   edge insertion.
//! - [`hierarchy`]: containment queries (children, ancestors, roots) and the
//!   dependency graph view used by external tooling.
//!
//! All query functions operate on a [`GraphView`], an immutable snapshot
//! taken from the [`GraphStore`](crate::store::GraphStore).

pub mod cycles;
pub mod edges;
pub mod hierarchy;

use std::collections::BTreeMap;

use crate::model::{ItemId, Status, WorkItem};
use edges::{Edge, EdgeIndex, EdgeKind};

/// Immutable snapshot of the item graph at one store revision.
#[derive(Debug, Clone, Default)]
pub struct GraphView {
    items: BTreeMap<ItemId, WorkItem>,
    edges: EdgeIndex,
    revision: u64,
}

impl GraphView {
    pub(crate) const fn new(
        items: BTreeMap<ItemId, WorkItem>,
        edges: EdgeIndex,
        revision: u64,
    ) -> Self {
        Self {
            items,
            edges,
            revision,
        }
    }

    /// Build a view straight from item records, deriving the edge index from
    /// each item's `parent`, `depends_on`, and `soft_depends_on` fields.
    ///
    /// No invariant is checked; use the store for validated writes.
    #[must_use]
    pub fn from_items(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let mut map = BTreeMap::new();
        let mut edges = EdgeIndex::new();
        for item in items {
            for edge in item_edges(&item) {
                edges.insert(edge);
            }
            map.insert(item.id.clone(), item);
        }
        Self::new(map, edges, 0)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&WorkItem> {
        self.items.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    #[must_use]
    pub fn status(&self, id: &str) -> Option<Status> {
        self.items.get(id).map(|item| item.status)
    }

    /// Items ordered by id.
    pub fn items(&self) -> impl Iterator<Item = &WorkItem> {
        self.items.values()
    }

    #[must_use]
    pub const fn edges(&self) -> &EdgeIndex {
        &self.edges
    }

    /// Store revision this snapshot was taken at.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn into_items(self) -> BTreeMap<ItemId, WorkItem> {
        self.items
    }
}

/// Edges implied by an item's relationship fields.
pub(crate) fn item_edges(item: &WorkItem) -> impl Iterator<Item = Edge> + '_ {
    let parent = item
        .parent
        .iter()
        .map(|p| Edge::new(item.id.clone(), p.clone(), EdgeKind::Parent));
    let hard = item
        .depends_on
        .iter()
        .map(|d| Edge::new(item.id.clone(), d.clone(), EdgeKind::DependsOn));
    let soft = item
        .soft_depends_on
        .iter()
        .map(|d| Edge::new(item.id.clone(), d.clone(), EdgeKind::SoftDependsOn));
    parent.chain(hard).chain(soft)
}
