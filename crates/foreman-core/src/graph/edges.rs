//! Typed edge records with forward and reverse indexes.
//!
//! Every relationship between two items is stored as an explicit
//! [`Edge`] `(from, to, kind)`:
//!
//! - [`EdgeKind::DependsOn`]: `from` cannot become ready until `to` is done.
//! - [`EdgeKind::SoftDependsOn`]: advisory context, never blocks.
//! - [`EdgeKind::Parent`]: `from` is contained by `to`.
//!
//! Hard dependency and containment edges are *structural*: together they
//! must stay acyclic.

#![allow(clippy::module_name_repetitions)]

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::ItemId;

/// Kind of relationship an edge expresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    DependsOn,
    SoftDependsOn,
    Parent,
}

impl EdgeKind {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::DependsOn => "depends_on",
            Self::SoftDependsOn => "soft_depends_on",
            Self::Parent => "parent",
        }
    }

    /// Whether this edge participates in the acyclicity invariant.
    #[must_use]
    pub const fn is_structural(self) -> bool {
        matches!(self, Self::DependsOn | Self::Parent)
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EdgeKind {
    type Err = crate::model::item::ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "depends_on" => Ok(Self::DependsOn),
            "soft_depends_on" => Ok(Self::SoftDependsOn),
            "parent" => Ok(Self::Parent),
            _ => Err(crate::model::item::ParseEnumError {
                expected: "edge kind",
                got: s.to_string(),
            }),
        }
    }
}

/// A typed directed edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: ItemId,
    pub to: ItemId,
    pub kind: EdgeKind,
}

impl Edge {
    #[must_use]
    pub const fn new(from: ItemId, to: ItemId, kind: EdgeKind) -> Self {
        Self { from, to, kind }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -[{}]-> {}", self.from, self.kind, self.to)
    }
}

/// Adjacency structure over [`Edge`] records with reverse lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeIndex {
    /// from -> edges leaving it.
    outgoing: HashMap<ItemId, BTreeSet<Edge>>,
    /// to -> edges arriving at it.
    incoming: HashMap<ItemId, BTreeSet<Edge>>,
}

impl EdgeIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an edge. Returns `false` if it was already present.
    pub fn insert(&mut self, edge: Edge) -> bool {
        let added = self
            .outgoing
            .entry(edge.from.clone())
            .or_default()
            .insert(edge.clone());
        if added {
            self.incoming.entry(edge.to.clone()).or_default().insert(edge);
        }
        added
    }

    /// Remove an edge. Returns `false` if it was absent.
    pub fn remove(&mut self, edge: &Edge) -> bool {
        let removed = self
            .outgoing
            .get_mut(&edge.from)
            .is_some_and(|set| set.remove(edge));
        if removed {
            if let Some(set) = self.incoming.get_mut(&edge.to) {
                set.remove(edge);
            }
        }
        removed
    }

    #[must_use]
    pub fn contains(&self, edge: &Edge) -> bool {
        self.outgoing
            .get(&edge.from)
            .is_some_and(|set| set.contains(edge))
    }

    /// Targets of `kind` edges leaving `id`.
    pub fn targets<'a>(&'a self, id: &str, kind: EdgeKind) -> impl Iterator<Item = &'a ItemId> + use<'a> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .filter(move |edge| edge.kind == kind)
            .map(|edge| &edge.to)
    }

    /// Sources of `kind` edges arriving at `id`.
    pub fn sources<'a>(&'a self, id: &str, kind: EdgeKind) -> impl Iterator<Item = &'a ItemId> + use<'a> {
        self.incoming
            .get(id)
            .into_iter()
            .flatten()
            .filter(move |edge| edge.kind == kind)
            .map(|edge| &edge.from)
    }

    /// Targets of hard dependency and containment edges leaving `id`.
    pub fn structural_targets<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a ItemId> + use<'a> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .filter(|edge| edge.kind.is_structural())
            .map(|edge| &edge.to)
    }

    /// All edges leaving `id`.
    pub fn outgoing<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a Edge> + use<'a> {
        self.outgoing.get(id).into_iter().flatten()
    }

    /// All edges arriving at `id`.
    pub fn incoming<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a Edge> + use<'a> {
        self.incoming.get(id).into_iter().flatten()
    }

    /// Every edge, in no particular order.
    pub fn iter(&self) -> impl Iterator<Item = &Edge> {
        self.outgoing.values().flatten()
    }

    /// Number of edges.
    #[must_use]
    pub fn len(&self) -> usize {
        self.outgoing.values().map(BTreeSet::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
