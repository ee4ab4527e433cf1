//! In-memory graph store with invariant-checked writes.
//!
//! # Concurrency
//!
//! Structural writes (`create`, `add_edge`, `remove_edge`) take the store's
//! write lock. Per-item writes (status, assignee, body, workspace) take the
//! read lock plus that item's own mutex, so different items are written
//! concurrently and the same item's `(status, assignee)` pair is the only
//! contended resource. Every per-item write is a compare-and-swap: the caller
//! states what it expects and the write fails with
//! [`ForemanError::ConcurrentModification`] when the item moved on.
//!
//! While holding an item's mutex the store may lock that item's hard
//! dependencies to check they are done. Hard dependencies are acyclic, so
//! these nested acquisitions always follow the dependency order and cannot
//! deadlock.
//!
//! Every accepted write bumps [`GraphStore::revision`].

#![allow(clippy::module_name_repetitions)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{ForemanError, Result};
use crate::graph::cycles::{self, CyclePath};
use crate::graph::edges::{Edge, EdgeIndex, EdgeKind};
use crate::graph::hierarchy::{self, DependencyGraph};
use crate::graph::{GraphView, item_edges};
use crate::model::item::{DEFAULT_PRIORITY, MAX_PRIORITY};
use crate::model::{
    Assignee, BlockCause, BlockDiagnostic, InvalidTransition, ItemId, ItemSpec, ItemType,
    Ownership, Status, WorkItem,
};
use crate::readiness::{self, ReadyCache, ReadySet};

// ---------------------------------------------------------------------------
// ItemFilter
// ---------------------------------------------------------------------------

/// Filter for [`GraphStore::list`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemFilter {
    pub status: Option<Status>,
    pub project: Option<String>,
    pub assignee: Option<Assignee>,
}

impl ItemFilter {
    #[must_use]
    pub const fn status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    #[must_use]
    pub fn assignee(mut self, assignee: Assignee) -> Self {
        self.assignee = Some(assignee);
        self
    }

    fn matches(&self, item: &WorkItem) -> bool {
        self.status.is_none_or(|s| item.status == s)
            && self.project.as_deref().is_none_or(|p| item.project == p)
            && self.assignee.as_ref().is_none_or(|a| &item.assignee == a)
    }
}

// ---------------------------------------------------------------------------
// GraphStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Inner {
    items: HashMap<ItemId, Mutex<WorkItem>>,
    edges: EdgeIndex,
}

/// Authoritative collection of work items and their typed edges.
#[derive(Debug, Default)]
pub struct GraphStore {
    inner: RwLock<Inner>,
    revision: AtomicU64,
    ready_cache: ReadyCache,
}

fn lock_item(slot: &Mutex<WorkItem>) -> MutexGuard<'_, WorkItem> {
    // Writers replace the whole value, so a poisoned guard still holds a
    // consistent item.
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn item_mut(slot: &mut Mutex<WorkItem>) -> &mut WorkItem {
    slot.get_mut().unwrap_or_else(PoisonError::into_inner)
}

impl GraphStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from persisted records, re-validating every invariant.
    ///
    /// # Errors
    ///
    /// Returns the first violation found: duplicate ids
    /// ([`ForemanError::Validation`]), self references, dangling edge
    /// targets, structural cycles, or a non-inbox item without a project.
    pub fn from_items(items: impl IntoIterator<Item = WorkItem>) -> Result<Self> {
        let mut inner = Inner::default();
        for item in items {
            validate_fields(&item.title, item.priority)?;
            if item.status != Status::Inbox && item.project.trim().is_empty() {
                return Err(ForemanError::validation(format!(
                    "item {} is {} but has no project",
                    item.id, item.status
                )));
            }
            if item.status == Status::Active && item.assignee.is_unassigned() {
                return Err(ForemanError::validation(format!(
                    "item {} is active but unassigned",
                    item.id
                )));
            }
            for edge in item_edges(&item) {
                if edge.to == edge.from {
                    return Err(ForemanError::validation(format!(
                        "item {} references itself via {}",
                        item.id, edge.kind
                    )));
                }
                inner.edges.insert(edge);
            }
            let id = item.id.clone();
            if inner.items.insert(id.clone(), Mutex::new(item)).is_some() {
                return Err(ForemanError::validation(format!("duplicate item id {id}")));
            }
        }

        for edge in inner.edges.iter() {
            if !inner.items.contains_key(&edge.to) {
                return Err(ForemanError::DanglingReference {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                    kind: edge.kind,
                });
            }
        }
        if cycles::has_cycles(&inner.edges, inner.items.keys().cloned()) {
            return Err(ForemanError::validation(
                "stored graph contains a dependency/containment cycle",
            ));
        }

        debug!(items = inner.items.len(), edges = inner.edges.len(), "store loaded");
        Ok(Self {
            inner: RwLock::new(inner),
            revision: AtomicU64::new(0),
            ready_cache: ReadyCache::default(),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) -> u64 {
        self.revision.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Monotonic counter incremented by every accepted write.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().items.is_empty()
    }

    // -----------------------------------------------------------------------
    // Structural writes
    // -----------------------------------------------------------------------

    /// Create a new item in `inbox`.
    ///
    /// # Errors
    ///
    /// [`ForemanError::Validation`] for an empty title, out-of-range priority,
    /// malformed or duplicate id, a self reference, or an edge to an item that
    /// does not exist.
    pub fn create(&self, spec: ItemSpec) -> Result<WorkItem> {
        let priority = spec.priority.unwrap_or(DEFAULT_PRIORITY);
        validate_fields(&spec.title, priority)?;

        let mut inner = self.write();
        let now = Utc::now();
        let id = match spec.id.as_deref() {
            Some(raw) => {
                let id = ItemId::parse(raw).map_err(|e| ForemanError::validation(e.to_string()))?;
                if inner.items.contains_key(&id) {
                    return Err(ForemanError::validation(format!("item {id} already exists")));
                }
                id
            }
            None => loop {
                let id = ItemId::generate(&spec.project, &spec.title, now);
                if !inner.items.contains_key(&id) {
                    break id;
                }
            },
        };

        let targets = spec
            .parent
            .iter()
            .chain(&spec.depends_on)
            .chain(&spec.soft_depends_on);
        for target in targets {
            if *target == id {
                return Err(ForemanError::validation(format!(
                    "item {id} cannot reference itself"
                )));
            }
            if !inner.items.contains_key(target) {
                return Err(ForemanError::validation(format!(
                    "item {id} references missing item {target}"
                )));
            }
        }

        let item = WorkItem {
            id: id.clone(),
            title: spec.title.trim().to_string(),
            body: spec.body,
            item_type: spec.item_type.unwrap_or(ItemType::Task),
            status: Status::Inbox,
            priority,
            project: spec.project.trim().to_string(),
            assignee: Assignee::Unassigned,
            parent: spec.parent,
            depends_on: spec.depends_on.into_iter().collect(),
            soft_depends_on: spec.soft_depends_on.into_iter().collect(),
            workspace_ref: None,
            block: None,
            created_at: now,
            updated_at: now,
        };

        // A brand-new item has no incoming edges, so none of its outgoing
        // edges can close a cycle.
        for edge in item_edges(&item) {
            inner.edges.insert(edge);
        }
        inner.items.insert(id.clone(), Mutex::new(item.clone()));
        let rev = self.bump();
        info!(item_id = %id, project = %item.project, revision = rev, "item created");
        Ok(item)
    }

    /// Insert a typed edge `from -> to`.
    ///
    /// Returns `false` when the edge already existed. A `parent` edge
    /// replaces any existing parent of `from`.
    ///
    /// # Errors
    ///
    /// - [`ForemanError::NotFound`] when `from` does not exist.
    /// - [`ForemanError::DanglingReference`] when `to` does not exist.
    /// - [`ForemanError::Cycle`] when a structural edge would close a cycle
    ///   (including a self loop); the graph is left unchanged.
    /// - [`ForemanError::Validation`] for a soft self reference.
    pub fn add_edge(&self, from: &str, to: &str, kind: EdgeKind) -> Result<bool> {
        let mut inner = self.write();
        let from_id = inner
            .items
            .get_key_value(from)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| ForemanError::NotFound(from.to_string()))?;
        let Some(to_id) = inner.items.get_key_value(to).map(|(k, _)| k.clone()) else {
            return Err(ForemanError::DanglingReference {
                from: from_id,
                to: ItemId::new_unchecked(to),
                kind,
            });
        };

        if from_id == to_id && !kind.is_structural() {
            return Err(ForemanError::validation(format!(
                "item {from_id} cannot reference itself"
            )));
        }

        let edge = Edge::new(from_id.clone(), to_id.clone(), kind);
        if inner.edges.contains(&edge) {
            return Ok(false);
        }

        if let Some(cycle) = cycles::detect_cycle_on_add(&inner.edges, &from_id, &to_id, kind) {
            debug!(from = %from_id, to = %to_id, %kind, "edge rejected: cycle");
            return Err(ForemanError::Cycle(cycle));
        }

        let Inner { items, edges } = &mut *inner;
        let Some(slot) = items.get_mut(&from_id) else {
            return Err(ForemanError::NotFound(from.to_string()));
        };
        let item = item_mut(slot);
        match kind {
            EdgeKind::Parent => {
                if let Some(old) = item.parent.replace(to_id.clone()) {
                    edges.remove(&Edge::new(from_id.clone(), old, EdgeKind::Parent));
                }
            }
            EdgeKind::DependsOn => {
                item.depends_on.insert(to_id.clone());
            }
            EdgeKind::SoftDependsOn => {
                item.soft_depends_on.insert(to_id.clone());
            }
        }
        item.touch();
        edges.insert(edge);
        drop(inner);

        let rev = self.bump();
        info!(from = %from_id, to = %to_id, %kind, revision = rev, "edge added");
        Ok(true)
    }

    /// Remove a typed edge. Returns `false` when it did not exist.
    ///
    /// # Errors
    ///
    /// [`ForemanError::NotFound`] when `from` does not exist.
    pub fn remove_edge(&self, from: &str, to: &str, kind: EdgeKind) -> Result<bool> {
        let mut inner = self.write();
        let Inner { items, edges } = &mut *inner;
        let slot = items
            .get_mut(from)
            .ok_or_else(|| ForemanError::NotFound(from.to_string()))?;
        let edge = Edge::new(
            ItemId::new_unchecked(from),
            ItemId::new_unchecked(to),
            kind,
        );
        if !edges.remove(&edge) {
            return Ok(false);
        }
        let item = item_mut(slot);
        match kind {
            EdgeKind::Parent => item.parent = None,
            EdgeKind::DependsOn => {
                item.depends_on.remove(to);
            }
            EdgeKind::SoftDependsOn => {
                item.soft_depends_on.remove(to);
            }
        }
        item.touch();
        drop(inner);
        self.bump();
        debug!(from, to, %kind, "edge removed");
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Per-item compare-and-swap writes
    // -----------------------------------------------------------------------

    /// Apply `f` to a copy of item `id` under its mutex and publish the copy
    /// only if `f` succeeds.
    fn mutate<F>(&self, id: &str, f: F) -> Result<WorkItem>
    where
        F: FnOnce(&Inner, &mut WorkItem) -> Result<()>,
    {
        let inner = self.read();
        let slot = inner
            .items
            .get(id)
            .ok_or_else(|| ForemanError::NotFound(id.to_string()))?;
        let mut guard = lock_item(slot);
        let mut next = guard.clone();
        f(&inner, &mut next)?;
        next.touch();
        *guard = next.clone();
        self.bump();
        Ok(next)
    }

    /// Move `id` from `expected` to `target`.
    ///
    /// This is the compare-and-swap of the lifecycle: it fails with
    /// [`ForemanError::ConcurrentModification`] when the current status is
    /// not `expected`. Items become `active` only through a claim
    /// ([`GraphStore::compare_and_swap`]). Moving to `blocked` attaches a
    /// dependency diagnostic when hard dependencies are unmet, otherwise an
    /// administrative one; an `inbox` item with nothing to wait on cannot be
    /// blocked here (see [`GraphStore::settle`]). Reaching `done` clears the
    /// workspace and unblocks dependents.
    ///
    /// # Errors
    ///
    /// - [`ForemanError::ConcurrentModification`] on status mismatch.
    /// - [`ForemanError::InvalidTransition`] for transitions outside the
    ///   lifecycle, `blocked -> ready` with unmet dependencies, `inbox ->
    ///   blocked` with none, or `review` without a workspace.
    /// - [`ForemanError::Validation`] when leaving `inbox` without a project.
    pub fn update_status(&self, id: &str, target: Status, expected: Status) -> Result<WorkItem> {
        let item = self.mutate(id, |inner, item| {
            if item.status != expected {
                return Err(ForemanError::ConcurrentModification {
                    id: item.id.clone(),
                    expected: Ownership::new(expected, item.assignee.clone()),
                    actual: item.ownership(),
                });
            }
            if target == Status::Active {
                return Err(ForemanError::transition(
                    &item.id,
                    InvalidTransition {
                        from: item.status,
                        to: target,
                        reason: "items become active only through a claim",
                    },
                ));
            }
            if target == Status::Blocked {
                let unmet = unmet_in(inner, item);
                if unmet.is_empty() && item.status == Status::Inbox {
                    return Err(ForemanError::transition(
                        &item.id,
                        InvalidTransition {
                            from: item.status,
                            to: target,
                            reason: "no unmet dependencies to wait on",
                        },
                    ));
                }
                let diag = if unmet.is_empty() {
                    BlockDiagnostic::new(BlockCause::Cancelled, "blocked administratively")
                } else {
                    BlockDiagnostic::new(BlockCause::Dependency, waiting_on(&unmet))
                };
                return block_in(inner, item, diag);
            }
            apply_transition(inner, item, target)
        })?;
        info!(item_id = %item.id, from = %expected, to = %target, "status updated");
        if target == Status::Done {
            self.propagate_unblock(id);
        }
        Ok(item)
    }

    /// Move `id` out of `expected` to `ready` when every hard dependency is
    /// done, otherwise to `blocked` waiting on the unmet ones.
    ///
    /// The dependency check and the write happen under the item's lock, so a
    /// dependency finishing concurrently either is seen here or unblocks the
    /// item afterwards.
    ///
    /// # Errors
    ///
    /// Same as [`GraphStore::update_status`].
    pub fn settle(&self, id: &str, expected: Status) -> Result<WorkItem> {
        let item = self.mutate(id, |inner, item| {
            if item.status != expected {
                return Err(ForemanError::ConcurrentModification {
                    id: item.id.clone(),
                    expected: Ownership::new(expected, item.assignee.clone()),
                    actual: item.ownership(),
                });
            }
            let unmet = unmet_in(inner, item);
            if unmet.is_empty() {
                apply_transition(inner, item, Status::Ready)
            } else {
                block_in(
                    inner,
                    item,
                    BlockDiagnostic::new(BlockCause::Dependency, waiting_on(&unmet)),
                )
            }
        })?;
        info!(item_id = %item.id, from = %expected, to = %item.status, "status settled");
        Ok(item)
    }

    /// Replace the `(status, assignee)` pair of `id` if it still equals
    /// `expected`.
    ///
    /// # Errors
    ///
    /// - [`ForemanError::ConcurrentModification`] when the pair moved on.
    /// - [`ForemanError::InvalidTransition`] for lifecycle violations, or a
    ///   target of `blocked` (use [`GraphStore::block`]).
    /// - [`ForemanError::Validation`] for an `active` item without an owner
    ///   or an item leaving `inbox` without a project.
    pub fn compare_and_swap(
        &self,
        id: &str,
        expected: &Ownership,
        next: Ownership,
    ) -> Result<WorkItem> {
        let target = next.status;
        let item = self.mutate(id, |inner, item| {
            if item.ownership() != *expected {
                return Err(ForemanError::ConcurrentModification {
                    id: item.id.clone(),
                    expected: expected.clone(),
                    actual: item.ownership(),
                });
            }
            if target == Status::Blocked {
                return Err(ForemanError::transition(
                    &item.id,
                    InvalidTransition {
                        from: item.status,
                        to: target,
                        reason: "blocking requires a diagnostic",
                    },
                ));
            }
            if target == Status::Active && next.assignee.is_unassigned() {
                return Err(ForemanError::validation(format!(
                    "item {} cannot be active without an owner",
                    item.id
                )));
            }
            apply_transition(inner, item, target)?;
            item.assignee = next.assignee;
            Ok(())
        })?;
        debug!(item_id = %item.id, from = %expected, to = %item.ownership(), "ownership swapped");
        if target == Status::Done {
            self.propagate_unblock(id);
        }
        Ok(item)
    }

    /// Move `id` from `expected` to `blocked`, release its assignee, record
    /// `diagnostic`, and append the diagnostic report to the body.
    ///
    /// # Errors
    ///
    /// [`ForemanError::ConcurrentModification`] on status mismatch,
    /// [`ForemanError::InvalidTransition`] when `expected` cannot block.
    pub fn block(
        &self,
        id: &str,
        expected: Status,
        diagnostic: BlockDiagnostic,
    ) -> Result<WorkItem> {
        let cause = diagnostic.cause;
        let item = self.mutate(id, |inner, item| {
            if item.status != expected {
                return Err(ForemanError::ConcurrentModification {
                    id: item.id.clone(),
                    expected: Ownership::new(expected, item.assignee.clone()),
                    actual: item.ownership(),
                });
            }
            block_in(inner, item, diagnostic)
        })?;
        info!(item_id = %item.id, from = %expected, %cause, "item blocked");
        Ok(item)
    }

    /// Set or clear the isolated workspace reference.
    ///
    /// # Errors
    ///
    /// [`ForemanError::NotFound`], or [`ForemanError::Validation`] for an
    /// empty reference.
    pub fn set_workspace_ref(&self, id: &str, workspace: Option<String>) -> Result<WorkItem> {
        if workspace.as_deref().is_some_and(|w| w.trim().is_empty()) {
            return Err(ForemanError::validation("workspace reference is empty"));
        }
        self.mutate(id, |_, item| {
            item.workspace_ref = workspace;
            Ok(())
        })
    }

    /// Append free text to the body.
    ///
    /// # Errors
    ///
    /// [`ForemanError::NotFound`].
    pub fn append_body(&self, id: &str, text: &str) -> Result<WorkItem> {
        self.mutate(id, |_, item| {
            item.body.push_str(text);
            Ok(())
        })
    }

    /// Apply classifier output to the scalar fields of an item.
    ///
    /// # Errors
    ///
    /// [`ForemanError::Validation`] for an out-of-range priority, or an empty
    /// project on an item that already left `inbox`.
    pub fn update_classification(
        &self,
        id: &str,
        project: &str,
        priority: u8,
        item_type: ItemType,
    ) -> Result<WorkItem> {
        if priority > MAX_PRIORITY {
            return Err(ForemanError::validation(format!(
                "priority {priority} is out of range 0..={MAX_PRIORITY}"
            )));
        }
        let project = project.trim().to_string();
        self.mutate(id, |_, item| {
            if project.is_empty() && item.status != Status::Inbox {
                return Err(ForemanError::validation(format!(
                    "item {} is {} and needs a project",
                    item.id, item.status
                )));
            }
            item.project = project;
            item.priority = priority;
            item.item_type = item_type;
            Ok(())
        })
    }

    /// Move every dependency-blocked dependent of `done_id` whose hard
    /// dependencies are now all done back to `ready`.
    ///
    /// Returns the ids that were unblocked.
    pub fn propagate_unblock(&self, done_id: &str) -> Vec<ItemId> {
        let candidates: Vec<ItemId> = {
            let inner = self.read();
            inner
                .edges
                .sources(done_id, EdgeKind::DependsOn)
                .cloned()
                .collect()
        };

        let mut unblocked = Vec::new();
        for dependent in candidates {
            let result = self.mutate(dependent.as_str(), |inner, item| {
                let dependency_blocked = item.status == Status::Blocked
                    && item
                        .block
                        .as_ref()
                        .is_none_or(|b| b.cause == BlockCause::Dependency);
                if !dependency_blocked {
                    return Err(ForemanError::validation("not blocked on dependencies"));
                }
                apply_transition(inner, item, Status::Ready)
            });
            if result.is_ok() {
                info!(item_id = %dependent, after = done_id, "dependent unblocked");
                unblocked.push(dependent);
            }
        }
        unblocked
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Latest committed state of `id`.
    ///
    /// # Errors
    ///
    /// [`ForemanError::NotFound`].
    pub fn get(&self, id: &str) -> Result<WorkItem> {
        let inner = self.read();
        inner
            .items
            .get(id)
            .map(|slot| lock_item(slot).clone())
            .ok_or_else(|| ForemanError::NotFound(id.to_string()))
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.read().items.contains_key(id)
    }

    /// Items matching `filter`, ordered by id.
    #[must_use]
    pub fn list(&self, filter: &ItemFilter) -> Vec<WorkItem> {
        let inner = self.read();
        let mut out: Vec<WorkItem> = inner
            .items
            .values()
            .map(|slot| lock_item(slot).clone())
            .filter(|item| filter.matches(item))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Immutable copy of the whole graph.
    #[must_use]
    pub fn snapshot(&self) -> GraphView {
        let inner = self.read();
        let revision = self.revision();
        let items: BTreeMap<ItemId, WorkItem> = inner
            .items
            .iter()
            .map(|(id, slot)| (id.clone(), lock_item(slot).clone()))
            .collect();
        GraphView::new(items, inner.edges.clone(), revision)
    }

    /// Ready items of the current graph.
    ///
    /// Served from a cache keyed on [`GraphStore::revision`], so any write
    /// invalidates it.
    #[must_use]
    pub fn ready_set(&self) -> ReadySet {
        self.ready_cache
            .get_or_compute(self.revision(), || readiness::ready_set(&self.snapshot()))
    }

    /// Sub-graph reachable from `root_id`.
    ///
    /// # Errors
    ///
    /// [`ForemanError::NotFound`].
    pub fn dependency_graph(&self, root_id: &str) -> Result<DependencyGraph> {
        hierarchy::dependency_graph(&self.snapshot(), root_id)
            .ok_or_else(|| ForemanError::NotFound(root_id.to_string()))
    }

    /// Hard dependencies of `id` that are not done yet.
    ///
    /// # Errors
    ///
    /// [`ForemanError::NotFound`].
    pub fn unmet_dependencies(&self, id: &str) -> Result<Vec<ItemId>> {
        let inner = self.read();
        let slot = inner
            .items
            .get(id)
            .ok_or_else(|| ForemanError::NotFound(id.to_string()))?;
        let item = lock_item(slot).clone();
        Ok(unmet_in(&inner, &item))
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

fn validate_fields(title: &str, priority: u8) -> Result<()> {
    if title.trim().is_empty() {
        return Err(ForemanError::validation("title is empty"));
    }
    if priority > MAX_PRIORITY {
        return Err(ForemanError::validation(format!(
            "priority {priority} is out of range 0..={MAX_PRIORITY}"
        )));
    }
    Ok(())
}

fn unmet_in(inner: &Inner, item: &WorkItem) -> Vec<ItemId> {
    item.depends_on
        .iter()
        .filter(|dep| {
            inner
                .items
                .get(*dep)
                .is_none_or(|slot| lock_item(slot).status != Status::Done)
        })
        .cloned()
        .collect()
}

fn waiting_on(unmet: &[ItemId]) -> String {
    let ids: BTreeSet<&str> = unmet.iter().map(ItemId::as_str).collect();
    format!(
        "waiting on: {}",
        ids.into_iter().collect::<Vec<_>>().join(", ")
    )
}

/// Lifecycle checks shared by every status-changing write, followed by the
/// field resets each target state implies.
fn apply_transition(inner: &Inner, item: &mut WorkItem, target: Status) -> Result<()> {
    let from = item.status;
    from.can_transition_to(target)
        .map_err(|e| ForemanError::transition(&item.id, e))?;

    if from == Status::Inbox && item.project.trim().is_empty() {
        return Err(ForemanError::validation(format!(
            "item {} needs a project before leaving inbox",
            item.id
        )));
    }

    let needs_dependencies =
        target == Status::Active || (from == Status::Blocked && target == Status::Ready);
    let refusal = if needs_dependencies && !unmet_in(inner, item).is_empty() {
        Some("hard dependencies are not done")
    } else if target == Status::Review && item.workspace_ref.is_none() {
        Some("review requires a populated workspace")
    } else {
        None
    };
    if let Some(reason) = refusal {
        return Err(ForemanError::transition(
            &item.id,
            InvalidTransition {
                from,
                to: target,
                reason,
            },
        ));
    }

    item.status = target;
    match target {
        Status::Blocked => item.assignee = Assignee::Unassigned,
        Status::Done => item.workspace_ref = None,
        _ => {}
    }
    if from == Status::Blocked {
        item.block = None;
    }
    Ok(())
}

fn block_in(inner: &Inner, item: &mut WorkItem, diagnostic: BlockDiagnostic) -> Result<()> {
    apply_transition(inner, item, Status::Blocked)?;
    item.body.push_str(&diagnostic.report());
    item.block = Some(diagnostic);
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(ids: &[&str]) -> GraphStore {
        let store = GraphStore::new();
        for id in ids {
            store
                .create(ItemSpec::new(format!("task {id}")).id(*id).project("core"))
                .unwrap();
        }
        store
    }

    fn id(raw: &str) -> ItemId {
        ItemId::new_unchecked(raw)
    }

    #[test]
    fn create_starts_in_inbox_with_defaults() {
        let store = GraphStore::new();
        let item = store.create(ItemSpec::new("  Write docs ")).unwrap();
        assert_eq!(item.status, Status::Inbox);
        assert_eq!(item.priority, DEFAULT_PRIORITY);
        assert_eq!(item.title, "Write docs");
        assert!(item.id.as_str().starts_with("inbox-"));
        assert_eq!(store.revision(), 1);
    }

    #[test]
    fn create_rejects_malformed_items() {
        let store = store_with(&["a"]);
        for spec in [
            ItemSpec::new(""),
            ItemSpec::new("x").priority(9),
            ItemSpec::new("x").id("../escape"),
            ItemSpec::new("x").id("a"),
            ItemSpec::new("x").id("b").depends_on(id("b")),
            ItemSpec::new("x").depends_on(id("ghost")),
            ItemSpec::new("x").parent(id("ghost")),
        ] {
            let err = store.create(spec.clone()).unwrap_err();
            assert!(
                matches!(err, ForemanError::Validation(_)),
                "{spec:?} gave {err}"
            );
        }
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn add_edge_reports_each_failure_kind() {
        let store = store_with(&["a", "b"]);
        assert!(store.add_edge("b", "a", EdgeKind::DependsOn).unwrap());
        assert!(!store.add_edge("b", "a", EdgeKind::DependsOn).unwrap());

        assert!(matches!(
            store.add_edge("a", "b", EdgeKind::DependsOn),
            Err(ForemanError::Cycle(_))
        ));
        assert!(matches!(
            store.add_edge("a", "a", EdgeKind::Parent),
            Err(ForemanError::Cycle(_))
        ));
        assert!(matches!(
            store.add_edge("a", "a", EdgeKind::SoftDependsOn),
            Err(ForemanError::Validation(_))
        ));
        assert!(matches!(
            store.add_edge("a", "zzz", EdgeKind::DependsOn),
            Err(ForemanError::DanglingReference { .. })
        ));
        assert!(matches!(
            store.add_edge("zzz", "a", EdgeKind::DependsOn),
            Err(ForemanError::NotFound(_))
        ));
        // Soft edges may point "backwards".
        assert!(store.add_edge("a", "b", EdgeKind::SoftDependsOn).unwrap());
        assert_eq!(store.snapshot().edges().len(), 2);
    }

    #[test]
    fn rejected_edge_leaves_graph_unchanged() {
        let store = store_with(&["a", "b", "c"]);
        store.add_edge("b", "a", EdgeKind::DependsOn).unwrap();
        store.add_edge("c", "b", EdgeKind::Parent).unwrap();
        let before = store.snapshot();
        assert!(store.add_edge("a", "c", EdgeKind::DependsOn).is_err());
        let after = store.snapshot();
        assert_eq!(before.edges(), after.edges());
        assert_eq!(before.revision(), after.revision());
        assert!(store.get("a").unwrap().depends_on.is_empty());
    }

    #[test]
    fn parent_edge_replaces_previous_parent() {
        let store = store_with(&["e1", "e2", "t"]);
        store.add_edge("t", "e1", EdgeKind::Parent).unwrap();
        store.add_edge("t", "e2", EdgeKind::Parent).unwrap();
        let view = store.snapshot();
        assert_eq!(view.get("t").unwrap().parent, Some(id("e2")));
        assert_eq!(view.edges().sources("e1", EdgeKind::Parent).count(), 0);
        assert!(store.remove_edge("t", "e2", EdgeKind::Parent).unwrap());
        assert_eq!(store.get("t").unwrap().parent, None);
    }

    #[test]
    fn update_status_is_compare_and_swap() {
        let store = store_with(&["a"]);
        store.update_status("a", Status::Ready, Status::Inbox).unwrap();
        let err = store
            .update_status("a", Status::Blocked, Status::Inbox)
            .unwrap_err();
        assert!(matches!(err, ForemanError::ConcurrentModification { .. }));
        assert!(err.is_retryable());
        assert_eq!(store.get("a").unwrap().status, Status::Ready);
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        let store = store_with(&["a"]);
        assert!(matches!(
            store.update_status("a", Status::Done, Status::Inbox),
            Err(ForemanError::InvalidTransition { .. })
        ));
        assert!(matches!(
            store.update_status("a", Status::Active, Status::Inbox),
            Err(ForemanError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn leaving_inbox_requires_project() {
        let store = GraphStore::new();
        let item = store.create(ItemSpec::new("capture")).unwrap();
        assert!(matches!(
            store.update_status(item.id.as_str(), Status::Ready, Status::Inbox),
            Err(ForemanError::Validation(_))
        ));
    }

    #[test]
    fn blocked_to_ready_waits_for_dependencies() {
        let store = store_with(&["a", "b"]);
        store.add_edge("b", "a", EdgeKind::DependsOn).unwrap();
        let blocked = store
            .update_status("b", Status::Blocked, Status::Inbox)
            .unwrap();
        assert_eq!(
            blocked.block.as_ref().map(|b| b.cause),
            Some(BlockCause::Dependency)
        );
        assert!(blocked.body.contains("waiting on: a"));
        assert!(matches!(
            store.update_status("b", Status::Ready, Status::Blocked),
            Err(ForemanError::InvalidTransition { .. })
        ));
    }

    fn drive_to_done(store: &GraphStore, id: &str) {
        let worker = Assignee::worker(format!("w-{id}"));
        let item = store.get(id).unwrap();
        store
            .compare_and_swap(id, &item.ownership(), Ownership::new(Status::Active, worker.clone()))
            .unwrap();
        store
            .compare_and_swap(
                id,
                &Ownership::new(Status::Active, worker.clone()),
                Ownership::new(Status::InProgress, worker),
            )
            .unwrap();
        store.set_workspace_ref(id, Some(format!("ws-{id}"))).unwrap();
        store.update_status(id, Status::Review, Status::InProgress).unwrap();
        store.update_status(id, Status::Done, Status::Review).unwrap();
    }

    #[test]
    fn settle_picks_ready_or_blocked_from_dependencies() {
        let store = store_with(&["a", "b", "c"]);
        store.add_edge("b", "a", EdgeKind::DependsOn).unwrap();

        let c = store.settle("c", Status::Inbox).unwrap();
        assert_eq!(c.status, Status::Ready);
        let b = store.settle("b", Status::Inbox).unwrap();
        assert_eq!(b.status, Status::Blocked);
        assert_eq!(b.block.map(|d| d.cause), Some(BlockCause::Dependency));
        assert!(matches!(
            store.settle("b", Status::Inbox),
            Err(ForemanError::ConcurrentModification { .. })
        ));

        drive_to_done(&store, "a");
        assert_eq!(store.get("b").unwrap().status, Status::Ready);
    }

    #[test]
    fn dependency_finishing_after_the_check_does_not_strand_the_item() {
        let store = store_with(&["a", "b"]);
        store.add_edge("b", "a", EdgeKind::DependsOn).unwrap();
        assert_eq!(store.unmet_dependencies("b").unwrap(), vec![id("a")]);

        // `a` finishes while `b` is still in inbox, so nothing unblocks `b`.
        drive_to_done(&store, "a");

        assert!(matches!(
            store.update_status("b", Status::Blocked, Status::Inbox),
            Err(ForemanError::InvalidTransition { .. })
        ));
        let b = store.settle("b", Status::Inbox).unwrap();
        assert_eq!(b.status, Status::Ready);
        assert!(b.block.is_none());
        assert!(store.ready_set().contains("b"));
    }

    #[test]
    fn done_unblocks_dependency_blocked_dependents() {
        let store = store_with(&["a", "b", "c"]);
        store.add_edge("b", "a", EdgeKind::DependsOn).unwrap();
        store.add_edge("c", "a", EdgeKind::DependsOn).unwrap();
        store.update_status("b", Status::Blocked, Status::Inbox).unwrap();
        store
            .block(
                "c",
                Status::Inbox,
                BlockDiagnostic::new(BlockCause::MergeConflict, "x"),
            )
            .unwrap();

        let worker = Assignee::worker("w1");
        let a = store.get("a").unwrap();
        store
            .compare_and_swap("a", &a.ownership(), Ownership::new(Status::Active, worker.clone()))
            .unwrap();
        store
            .compare_and_swap(
                "a",
                &Ownership::new(Status::Active, worker.clone()),
                Ownership::new(Status::InProgress, worker),
            )
            .unwrap();
        store.set_workspace_ref("a", Some("ws-a".into())).unwrap();
        store
            .update_status("a", Status::Review, Status::InProgress)
            .unwrap();
        let done = store.update_status("a", Status::Done, Status::Review).unwrap();
        assert_eq!(done.workspace_ref, None);

        let b = store.get("b").unwrap();
        assert_eq!(b.status, Status::Ready);
        assert!(b.block.is_none());
        // Merge-conflict blocks need a human.
        assert_eq!(store.get("c").unwrap().status, Status::Blocked);
    }

    #[test]
    fn blocking_releases_assignee() {
        let store = store_with(&["a"]);
        let a = store.get("a").unwrap();
        store
            .compare_and_swap(
                "a",
                &a.ownership(),
                Ownership::new(Status::Active, Assignee::Human),
            )
            .unwrap();
        let blocked = store
            .block(
                "a",
                Status::Active,
                BlockDiagnostic::new(BlockCause::Cancelled, "timeout"),
            )
            .unwrap();
        assert_eq!(blocked.assignee, Assignee::Unassigned);
        assert!(blocked.body.contains("## Integration report"));
    }

    #[test]
    fn list_filters_by_status_project_assignee() {
        let store = store_with(&["a", "b"]);
        store
            .create(ItemSpec::new("other").id("c").project("web"))
            .unwrap();
        store.update_status("b", Status::Ready, Status::Inbox).unwrap();

        let ready = store.list(&ItemFilter::default().status(Status::Ready));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, id("b"));

        let web = store.list(&ItemFilter::default().project("web"));
        assert_eq!(web.len(), 1);

        let unassigned = store.list(&ItemFilter::default().assignee(Assignee::Unassigned));
        assert_eq!(unassigned.len(), 3);
    }

    #[test]
    fn from_items_revalidates_invariants() {
        let store = store_with(&["a", "b"]);
        store.add_edge("b", "a", EdgeKind::DependsOn).unwrap();
        let items: Vec<WorkItem> = store.snapshot().into_items().into_values().collect();

        let reloaded = GraphStore::from_items(items.clone()).unwrap();
        assert_eq!(reloaded.snapshot().edges(), store.snapshot().edges());

        let mut cyclic = items.clone();
        for item in &mut cyclic {
            if item.id.as_str() == "a" {
                item.depends_on.insert(id("b"));
            }
        }
        assert!(GraphStore::from_items(cyclic).is_err());

        let mut dangling = items;
        dangling.retain(|item| item.id.as_str() == "b");
        assert!(matches!(
            GraphStore::from_items(dangling),
            Err(ForemanError::DanglingReference { .. })
        ));
    }

    #[test]
    fn ready_set_cache_follows_writes() {
        let store = store_with(&["a", "b"]);
        store.add_edge("b", "a", EdgeKind::DependsOn).unwrap();
        assert!(store.ready_set().contains("a"));
        assert!(!store.ready_set().contains("b"));
        store
            .block("a", Status::Inbox, BlockDiagnostic::new(BlockCause::Cancelled, "paused"))
            .unwrap();
        assert!(!store.ready_set().contains("a"));
    }
}
