//! Readiness: which items can be claimed right now.
//!
//! An item is ready iff its status is `inbox` or `ready` and every hard
//! dependency is `done`. Soft dependencies are reported as hints on each
//! entry but never filter anything out.
//!
//! Everything here is a pure function of a [`GraphView`]. [`ReadyCache`] only
//! memoizes the result for one store revision; it is never authoritative.

#![allow(clippy::module_name_repetitions)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::graph::GraphView;
use crate::model::{ItemId, Status, WorkItem};

/// A soft dependency surfaced as context on a ready item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoftHint {
    pub id: ItemId,
    /// `None` when the target no longer resolves.
    pub status: Option<Status>,
}

/// One ready item with the fields the queue orders by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadyEntry {
    pub id: ItemId,
    pub title: String,
    pub project: String,
    pub priority: u8,
    pub created_at: DateTime<Utc>,
    pub hints: Vec<SoftHint>,
}

impl ReadyEntry {
    fn from_item(view: &GraphView, item: &WorkItem) -> Self {
        Self {
            id: item.id.clone(),
            title: item.title.clone(),
            project: item.project.clone(),
            priority: item.priority,
            created_at: item.created_at,
            hints: item
                .soft_depends_on
                .iter()
                .map(|soft| SoftHint {
                    id: soft.clone(),
                    status: view.status(soft.as_str()),
                })
                .collect(),
        }
    }

    fn queue_key(&self) -> (u8, DateTime<Utc>, &str, &ItemId) {
        (self.priority, self.created_at, self.title.as_str(), &self.id)
    }
}

/// The set of ready items at one graph revision.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadySet {
    entries: BTreeMap<ItemId, ReadyEntry>,
    revision: u64,
}

impl ReadySet {
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ReadyEntry> {
        self.entries.get(id)
    }

    /// Ready ids in id order.
    #[must_use]
    pub fn ids(&self) -> BTreeSet<ItemId> {
        self.entries.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReadyEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Graph revision this set was computed from.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }
}

/// Whether every hard dependency of `item` is done in `view`.
fn dependencies_done(view: &GraphView, item: &WorkItem) -> bool {
    item.depends_on
        .iter()
        .all(|dep| view.status(dep.as_str()) == Some(Status::Done))
}

/// Compute the ready set of `view`.
#[must_use]
pub fn ready_set(view: &GraphView) -> ReadySet {
    let entries = view
        .items()
        .filter(|item| item.status.is_claimable() && dependencies_done(view, item))
        .map(|item| (item.id.clone(), ReadyEntry::from_item(view, item)))
        .collect();
    ReadySet {
        entries,
        revision: view.revision(),
    }
}

/// Whether `id` is ready in `view`. Unknown ids are never ready.
#[must_use]
pub fn is_ready(view: &GraphView, id: &str) -> bool {
    view.get(id)
        .is_some_and(|item| item.status.is_claimable() && dependencies_done(view, item))
}

/// Hard dependencies of `id` that are not done. Unknown targets count as
/// unmet.
#[must_use]
pub fn unmet_dependencies(view: &GraphView, id: &str) -> Vec<ItemId> {
    view.get(id)
        .map(|item| {
            item.depends_on
                .iter()
                .filter(|dep| view.status(dep.as_str()) != Some(Status::Done))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Ready items ordered for dispatch: priority, then age, then title.
///
/// When `project` is set only that project's items are returned.
#[must_use]
pub fn ready_queue(view: &GraphView, project: Option<&str>) -> Vec<ReadyEntry> {
    let mut queue: Vec<ReadyEntry> = ready_set(view)
        .entries
        .into_values()
        .filter(|entry| project.is_none_or(|p| entry.project == p))
        .collect();
    queue.sort_by(|a, b| a.queue_key().cmp(&b.queue_key()));
    queue
}

/// Memoizes one [`ReadySet`] per store revision.
#[derive(Debug, Default)]
pub struct ReadyCache {
    slot: Mutex<Option<ReadySet>>,
}

impl ReadyCache {
    /// Return the cached set if it was computed at `revision`, otherwise
    /// compute, store, and return a fresh one.
    pub fn get_or_compute(&self, revision: u64, compute: impl FnOnce() -> ReadySet) -> ReadySet {
        {
            let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = slot.as_ref().filter(|set| set.revision == revision) {
                return cached.clone();
            }
        }
        let fresh = compute();
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_none_or(|old| old.revision <= fresh.revision) {
            *slot = Some(fresh.clone());
        }
        fresh
    }

    /// Drop the memoized set.
    pub fn invalidate(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}
