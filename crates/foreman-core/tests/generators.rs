//! Shared proptest strategies for graph-level property tests.

#![allow(dead_code)]

use std::collections::BTreeSet;

use chrono::Utc;
use foreman_core::graph::edges::EdgeKind;
use foreman_core::model::{Assignee, ItemId, ItemType, Status, WorkItem};
use proptest::prelude::*;

pub fn node_id(index: usize) -> ItemId {
    ItemId::new_unchecked(format!("n{index}"))
}

pub fn arb_edge_kind() -> impl Strategy<Value = EdgeKind> {
    prop_oneof![
        3 => Just(EdgeKind::DependsOn),
        1 => Just(EdgeKind::SoftDependsOn),
        1 => Just(EdgeKind::Parent),
    ]
}

pub fn arb_status() -> impl Strategy<Value = Status> {
    proptest::sample::select(Status::ALL.to_vec())
}

/// `(node count, proposed edges as index pairs)`. Edges may be cyclic,
/// duplicated, or self-loops.
pub fn arb_edge_script() -> impl Strategy<Value = (usize, Vec<(usize, usize, EdgeKind)>)> {
    (2_usize..10).prop_flat_map(|n| {
        let edge = (0..n, 0..n, arb_edge_kind());
        (Just(n), proptest::collection::vec(edge, 0..40))
    })
}

/// A valid item as it could exist in a store.
pub fn item(index: usize, status: Status, depends_on: BTreeSet<ItemId>) -> WorkItem {
    let now = Utc::now();
    WorkItem {
        id: node_id(index),
        title: format!("node {index}"),
        body: String::new(),
        item_type: ItemType::Task,
        status,
        priority: 2,
        project: "prop".to_string(),
        assignee: if status.is_owned() {
            Assignee::worker(format!("w{index}"))
        } else {
            Assignee::Unassigned
        },
        parent: None,
        depends_on,
        soft_depends_on: BTreeSet::new(),
        workspace_ref: matches!(status, Status::Review).then(|| format!("ws-{index}")),
        block: None,
        created_at: now,
        updated_at: now,
    }
}

/// Items with random statuses whose hard dependencies only point at lower
/// indexes, so the graph is acyclic by construction.
pub fn arb_layered_graph() -> impl Strategy<Value = Vec<WorkItem>> {
    (1_usize..12).prop_flat_map(|n| {
        let statuses = proptest::collection::vec(arb_status(), n);
        let deps = proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n);
        (statuses, deps).prop_map(move |(statuses, deps)| {
            (0..n)
                .map(|i| {
                    let depends_on = (0..i).filter(|&j| deps[i][j]).map(node_id).collect();
                    item(i, statuses[i], depends_on)
                })
                .collect()
        })
    })
}
