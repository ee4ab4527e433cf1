//! Batch dispatch: independence check, execution-mode sizing, claiming, and
//! running assignments on a bounded set of worker threads.
//!
//! # Flow
//!
//! 1. [`check_independence`] rejects a batch whose members are linked by a
//!    (transitive) hard dependency or mutate the same external resource.
//!    Nothing is claimed when it fails.
//! 2. [`execution_mode`] sizes the batch: below `low_threshold` a single
//!    direct dispatch, below `high_threshold` one thread per item, otherwise
//!    a supervised pool of at most `max_pool_size` threads that refills each
//!    freed slot with the next assignment.
//! 3. Every member is claimed for a fresh worker identity and given an
//!    isolated workspace. Members that cannot be claimed are dropped from
//!    the plan without failing the batch.
//! 4. [`Dispatcher::run`] executes the plan through a [`WorkExecutor`] and
//!    moves each item to `review` or `blocked`.

#![allow(clippy::module_name_repetitions)]

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::claim::{self, RetryPolicy};
use crate::collab::WorkspaceProvider;
use crate::config::DispatchConfig;
use crate::error::{ForemanError, Result};
use crate::graph::GraphView;
use crate::graph::edges::EdgeKind;
use crate::model::{Assignee, BlockCause, BlockDiagnostic, ItemId, Status};
use crate::readiness;
use crate::store::GraphStore;

// ---------------------------------------------------------------------------
// Sizing
// ---------------------------------------------------------------------------

/// How a batch is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ExecutionMode {
    /// One item, run directly by the caller.
    Single,
    /// One thread per item, no pool manager.
    Parallel,
    /// Bounded pool; a finished worker's slot takes the next item.
    SupervisedPool { pool_size: usize },
}

/// Pick the execution mode for a batch of `len` items.
#[must_use]
pub fn execution_mode(config: &DispatchConfig, len: usize) -> ExecutionMode {
    if len >= config.high_threshold {
        ExecutionMode::SupervisedPool {
            pool_size: len.min(config.max_pool_size).max(1),
        }
    } else if len >= config.low_threshold {
        ExecutionMode::Parallel
    } else {
        ExecutionMode::Single
    }
}

// ---------------------------------------------------------------------------
// Independence
// ---------------------------------------------------------------------------

/// External resources each batch member will mutate, supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceClaims {
    by_item: BTreeMap<ItemId, BTreeSet<String>>,
}

impl ResourceClaims {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `item` mutates `resource`.
    #[must_use]
    pub fn with(mut self, item: &ItemId, resource: impl Into<String>) -> Self {
        self.claim(item, resource);
        self
    }

    pub fn claim(&mut self, item: &ItemId, resource: impl Into<String>) {
        self.by_item
            .entry(item.clone())
            .or_default()
            .insert(resource.into());
    }

    pub fn resources_of<'a>(&'a self, item: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        self.by_item
            .get(item)
            .into_iter()
            .flatten()
            .map(String::as_str)
    }
}

/// Why two batch members cannot run side by side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum ConflictReason {
    /// The same item appears twice.
    Duplicate,
    /// `first` depends on `second` through `path` (hard edges only).
    HardDependency { path: Vec<ItemId> },
    /// Both mutate `resource`.
    SharedResource { resource: String },
}

/// One offending pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemConflict {
    pub first: ItemId,
    pub second: ItemId,
    pub reason: ConflictReason,
}

impl fmt::Display for ItemConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            ConflictReason::Duplicate => write!(f, "{} listed twice", self.first),
            ConflictReason::HardDependency { path } => {
                let shown: Vec<&str> = path.iter().map(ItemId::as_str).collect();
                write!(
                    f,
                    "{} depends on {} ({})",
                    self.first,
                    self.second,
                    shown.join(" → ")
                )
            }
            ConflictReason::SharedResource { resource } => write!(
                f,
                "{} and {} both mutate {resource}",
                self.first, self.second
            ),
        }
    }
}

/// A batch that is unsafe to run in parallel. The caller must serialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchConflict {
    pub conflicts: Vec<ItemConflict>,
}

impl BatchConflict {
    /// Whether `id` takes part in any conflict.
    #[must_use]
    pub fn involves(&self, id: &str) -> bool {
        self.conflicts
            .iter()
            .any(|c| c.first.as_str() == id || c.second.as_str() == id)
    }
}

impl fmt::Display for BatchConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown: Vec<String> = self.conflicts.iter().map(ToString::to_string).collect();
        write!(
            f,
            "batch conflict: {} pair(s) not independent: {}",
            self.conflicts.len(),
            shown.join("; ")
        )
    }
}

/// Members of `members` reachable from `start` through hard dependency
/// edges, each with the path taken.
fn dependency_paths(
    view: &GraphView,
    start: &ItemId,
    members: &BTreeSet<&ItemId>,
) -> Vec<(ItemId, Vec<ItemId>)> {
    let mut found = Vec::new();
    let mut came_from: HashMap<&ItemId, &ItemId> = HashMap::new();
    let mut queue: VecDeque<&ItemId> = VecDeque::from([start]);

    while let Some(node) = queue.pop_front() {
        for next in view.edges().targets(node.as_str(), EdgeKind::DependsOn) {
            if next == start || came_from.contains_key(next) {
                continue;
            }
            came_from.insert(next, node);
            if members.contains(next) {
                let mut path = vec![next.clone()];
                let mut cursor = next;
                while let Some(prev) = came_from.get(cursor) {
                    path.push((*prev).clone());
                    cursor = *prev;
                }
                path.reverse();
                found.push((next.clone(), path));
            }
            queue.push_back(next);
        }
    }
    found
}

/// Check that no two members of `batch` are linked by a hard dependency
/// (direct or transitive), appear twice, or share a mutated resource.
///
/// # Errors
///
/// [`BatchConflict`] listing every offending pair.
pub fn check_independence(
    view: &GraphView,
    batch: &[ItemId],
    resources: &ResourceClaims,
) -> std::result::Result<(), BatchConflict> {
    let mut conflicts = Vec::new();

    let mut members: BTreeSet<&ItemId> = BTreeSet::new();
    for id in batch {
        if !members.insert(id) {
            conflicts.push(ItemConflict {
                first: id.clone(),
                second: id.clone(),
                reason: ConflictReason::Duplicate,
            });
        }
    }

    for &id in &members {
        for (other, path) in dependency_paths(view, id, &members) {
            conflicts.push(ItemConflict {
                first: id.clone(),
                second: other,
                reason: ConflictReason::HardDependency { path },
            });
        }
    }

    let mut holders: BTreeMap<&str, Vec<&ItemId>> = BTreeMap::new();
    for &id in &members {
        for resource in resources.resources_of(id.as_str()) {
            holders.entry(resource).or_default().push(id);
        }
    }
    for (resource, ids) in holders {
        for (i, first) in ids.iter().enumerate() {
            for second in &ids[i + 1..] {
                conflicts.push(ItemConflict {
                    first: (*first).clone(),
                    second: (*second).clone(),
                    reason: ConflictReason::SharedResource {
                        resource: resource.to_string(),
                    },
                });
            }
        }
    }

    if conflicts.is_empty() {
        Ok(())
    } else {
        Err(BatchConflict { conflicts })
    }
}

/// Greedily pick up to `limit` mutually independent ready items in queue
/// order. Helper for callers assembling a batch; dispatch still re-checks.
#[must_use]
pub fn select_independent(
    view: &GraphView,
    project: Option<&str>,
    resources: &ResourceClaims,
    limit: usize,
) -> Vec<ItemId> {
    let mut chosen: Vec<ItemId> = Vec::new();
    for entry in readiness::ready_queue(view, project) {
        if chosen.len() >= limit {
            break;
        }
        let mut candidate = chosen.clone();
        candidate.push(entry.id.clone());
        if check_independence(view, &candidate, resources).is_ok() {
            chosen = candidate;
        }
    }
    chosen
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// A claimed item handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Assignment {
    pub item_id: ItemId,
    pub title: String,
    pub worker: Assignee,
    pub workspace_ref: String,
}

/// A batch member dropped from the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedItem {
    pub item_id: ItemId,
    pub reason: String,
}

/// Result of [`Dispatcher::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub mode: ExecutionMode,
    pub assignments: Vec<Assignment>,
    pub skipped: Vec<SkippedItem>,
}

impl ExecutionPlan {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.assignments.len()
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// What a worker reports after running an assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Changes are in the workspace; submit for review.
    Completed,
    /// Execution failed; block with this detail.
    Failed(String),
}

/// Runs one assignment inside its isolated workspace.
pub trait WorkExecutor: Send + Sync {
    fn execute(&self, assignment: &Assignment) -> WorkOutcome;
}

impl<F> WorkExecutor for F
where
    F: Fn(&Assignment) -> WorkOutcome + Send + Sync,
{
    fn execute(&self, assignment: &Assignment) -> WorkOutcome {
        self(assignment)
    }
}

/// Shared flag asking a running plan to stop starting new work.
#[derive(Debug, Clone, Default)]
pub struct DrainHandle {
    requested: Arc<AtomicBool>,
}

impl DrainHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop starting new items. Items already running finish normally.
    pub fn request(&self) {
        self.requested.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

/// Outcome of [`Dispatcher::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    /// Moved to `review`.
    pub submitted: Vec<ItemId>,
    /// Blocked with a worker-failure diagnostic.
    pub failed: Vec<ItemId>,
    /// Returned to `ready` by drain before starting.
    pub released: Vec<ItemId>,
    /// Changed underneath the worker (e.g. cancelled); left as found.
    pub interrupted: Vec<ItemId>,
    /// Most assignments running at the same moment.
    pub peak_concurrency: usize,
}

#[derive(Debug, Clone, Copy)]
enum Finish {
    Submitted,
    Failed,
    Released,
    Interrupted,
}

#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Claims batches and runs them on worker threads.
pub struct Dispatcher<'a> {
    store: &'a GraphStore,
    workspaces: &'a dyn WorkspaceProvider,
    config: DispatchConfig,
    retry: RetryPolicy,
    next_worker: AtomicU64,
}

impl<'a> Dispatcher<'a> {
    #[must_use]
    pub fn new(
        store: &'a GraphStore,
        workspaces: &'a dyn WorkspaceProvider,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            workspaces,
            config,
            retry: RetryPolicy::default(),
            next_worker: AtomicU64::new(1),
        }
    }

    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn fresh_worker(&self) -> Assignee {
        let n = self.next_worker.fetch_add(1, Ordering::Relaxed);
        Assignee::worker(format!("{}-{n}", self.config.worker_prefix))
    }

    /// Validate `batch`, claim its members, and create their workspaces.
    ///
    /// # Errors
    ///
    /// - [`ForemanError::NotFound`] when a member does not exist.
    /// - [`ForemanError::BatchConflict`] when members are not independent.
    ///
    /// Both are raised before any claim. Per-member claim or workspace
    /// failures only drop that member into [`ExecutionPlan::skipped`].
    pub fn dispatch(&self, batch: &[ItemId], resources: &ResourceClaims) -> Result<ExecutionPlan> {
        let view = self.store.snapshot();
        if let Some(missing) = batch.iter().find(|id| !view.contains(id.as_str())) {
            return Err(ForemanError::NotFound(missing.to_string()));
        }
        check_independence(&view, batch, resources).map_err(|conflict| {
            warn!(batch = batch.len(), %conflict, "batch rejected");
            ForemanError::BatchConflict(conflict)
        })?;

        let mode = execution_mode(&self.config, batch.len());
        info!(batch = batch.len(), ?mode, "dispatching batch");

        let mut assignments = Vec::new();
        let mut skipped = Vec::new();
        for id in batch {
            let worker = self.fresh_worker();
            let item = match claim::claim_with_retry(self.store, id.as_str(), &worker, self.retry) {
                Ok(item) => item,
                Err(err) => {
                    debug!(item_id = %id, error = %err, "dropped from plan");
                    skipped.push(SkippedItem {
                        item_id: id.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
            };

            match self.attach_workspace(id) {
                Ok(workspace_ref) => assignments.push(Assignment {
                    item_id: id.clone(),
                    title: item.title,
                    worker,
                    workspace_ref,
                }),
                Err(err) => {
                    warn!(item_id = %id, error = %err, "workspace creation failed");
                    let reason = self.release_unattached(id, &err);
                    skipped.push(SkippedItem {
                        item_id: id.clone(),
                        reason,
                    });
                }
            }
        }

        Ok(ExecutionPlan {
            mode,
            assignments,
            skipped,
        })
    }

    fn attach_workspace(&self, id: &ItemId) -> Result<String> {
        let workspace_ref = self.workspaces.create(id)?;
        if let Err(err) = self
            .store
            .set_workspace_ref(id.as_str(), Some(workspace_ref.clone()))
        {
            if let Err(cleanup) = self.workspaces.destroy(&workspace_ref) {
                warn!(item_id = %id, workspace = %workspace_ref, error = %cleanup, "orphaned workspace");
            }
            return Err(err);
        }
        Ok(workspace_ref)
    }

    /// Block a claimed item whose workspace could not be attached, falling
    /// back to a cancellation when the item has moved on. Returns the skip
    /// reason.
    fn release_unattached(&self, id: &ItemId, cause: &ForemanError) -> String {
        let diagnostic = BlockDiagnostic::new(BlockCause::Infrastructure, cause.to_string());
        let Err(block_err) = self.store.block(id.as_str(), Status::Active, diagnostic) else {
            return cause.to_string();
        };
        warn!(item_id = %id, error = %block_err, "could not block, cancelling claim");
        match claim::cancel(self.store, id.as_str(), &cause.to_string()) {
            Ok(_) => format!("{cause}; cancelled after block failed: {block_err}"),
            Err(cancel_err) => {
                error!(
                    item_id = %id,
                    block_error = %block_err,
                    cancel_error = %cancel_err,
                    "claimed item could not be released"
                );
                format!("{cause}; release failed: {block_err}; {cancel_err}")
            }
        }
    }

    /// Execute `plan` through `executor` in the plan's mode.
    ///
    /// Once `drain` is requested no new assignment starts; unstarted ones are
    /// released back to `ready`.
    pub fn run(
        &self,
        plan: ExecutionPlan,
        executor: &dyn WorkExecutor,
        drain: &DrainHandle,
    ) -> RunReport {
        let report = Mutex::new(RunReport::default());
        let gauge = Gauge::default();
        let record = |id: &ItemId, finish: Finish| {
            let mut report = report.lock().unwrap_or_else(PoisonError::into_inner);
            let bucket = match finish {
                Finish::Submitted => &mut report.submitted,
                Finish::Failed => &mut report.failed,
                Finish::Released => &mut report.released,
                Finish::Interrupted => &mut report.interrupted,
            };
            bucket.push(id.clone());
        };
        let work = |assignment: Assignment| {
            let finish = self.run_one(&assignment, executor, drain, &gauge);
            record(&assignment.item_id, finish);
        };

        match plan.mode {
            ExecutionMode::Single => plan.assignments.into_iter().for_each(work),
            ExecutionMode::Parallel => thread::scope(|scope| {
                for assignment in plan.assignments {
                    scope.spawn(|| work(assignment));
                }
            }),
            ExecutionMode::SupervisedPool { pool_size } => {
                let queue = Mutex::new(VecDeque::from(plan.assignments));
                let next = || {
                    queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front()
                };
                thread::scope(|scope| {
                    for _ in 0..pool_size {
                        scope.spawn(|| {
                            while let Some(assignment) = next() {
                                work(assignment);
                            }
                        });
                    }
                });
            }
        }

        let mut report = report.into_inner().unwrap_or_else(PoisonError::into_inner);
        report.peak_concurrency = gauge.peak.load(Ordering::Acquire);
        info!(
            submitted = report.submitted.len(),
            failed = report.failed.len(),
            released = report.released.len(),
            interrupted = report.interrupted.len(),
            peak = report.peak_concurrency,
            "plan finished"
        );
        report
    }

    fn run_one(
        &self,
        assignment: &Assignment,
        executor: &dyn WorkExecutor,
        drain: &DrainHandle,
        gauge: &Gauge,
    ) -> Finish {
        let id = assignment.item_id.as_str();
        let worker = &assignment.worker;

        if drain.is_requested() {
            return match claim::release_unstarted(self.store, id, worker) {
                Ok(_) => {
                    info!(item_id = id, worker = %worker, "released by drain");
                    Finish::Released
                }
                Err(err) => {
                    debug!(item_id = id, error = %err, "release skipped");
                    Finish::Interrupted
                }
            };
        }

        if let Err(err) = claim::begin(self.store, id, worker) {
            debug!(item_id = id, error = %err, "could not begin");
            return Finish::Interrupted;
        }

        gauge.enter();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(assignment)))
            .unwrap_or_else(|payload| {
                WorkOutcome::Failed(format!("worker panicked: {}", panic_message(&*payload)))
            });
        gauge.leave();

        let result = match &outcome {
            WorkOutcome::Completed => claim::submit_for_review(self.store, id, worker),
            WorkOutcome::Failed(detail) => claim::report_failure(self.store, id, worker, detail),
        };
        match (result, outcome) {
            (Ok(_), WorkOutcome::Completed) => Finish::Submitted,
            (Ok(_), WorkOutcome::Failed(_)) => Finish::Failed,
            (Err(err), _) => {
                debug!(item_id = id, error = %err, "item changed during execution");
                Finish::Interrupted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepository;
    use crate::model::ItemSpec;

    fn store_with(ids: &[&str]) -> GraphStore {
        let store = GraphStore::new();
        for id in ids {
            store
                .create(ItemSpec::new(format!("task {id}")).id(*id).project("core"))
                .unwrap();
        }
        store
    }

    fn ids(raw: &[&str]) -> Vec<ItemId> {
        raw.iter().map(|r| ItemId::new_unchecked(*r)).collect()
    }

    #[test]
    fn sizing_follows_thresholds() {
        let cfg = DispatchConfig::default();
        assert_eq!(execution_mode(&cfg, 0), ExecutionMode::Single);
        assert_eq!(execution_mode(&cfg, 1), ExecutionMode::Single);
        assert_eq!(execution_mode(&cfg, 2), ExecutionMode::Parallel);
        assert_eq!(execution_mode(&cfg, 4), ExecutionMode::Parallel);
        assert_eq!(
            execution_mode(&cfg, 5),
            ExecutionMode::SupervisedPool { pool_size: 5 }
        );
        assert_eq!(
            execution_mode(&cfg, 20),
            ExecutionMode::SupervisedPool { pool_size: 8 }
        );
    }

    #[test]
    fn transitive_dependency_is_a_conflict() {
        let store = store_with(&["a", "b", "c"]);
        store.add_edge("b", "a", EdgeKind::DependsOn).unwrap();
        store.add_edge("c", "b", EdgeKind::DependsOn).unwrap();
        let view = store.snapshot();
        let err = check_independence(&view, &ids(&["c", "a"]), &ResourceClaims::new())
            .unwrap_err();
        assert_eq!(err.conflicts.len(), 1);
        assert_eq!(
            err.conflicts[0].reason,
            ConflictReason::HardDependency {
                path: ids(&["c", "b", "a"])
            }
        );
        assert!(err.to_string().contains("c → b → a"));
    }

    #[test]
    fn soft_and_containment_edges_do_not_conflict() {
        let store = store_with(&["a", "b", "c"]);
        store.add_edge("b", "a", EdgeKind::SoftDependsOn).unwrap();
        store.add_edge("c", "a", EdgeKind::Parent).unwrap();
        let view = store.snapshot();
        assert!(check_independence(&view, &ids(&["a", "b", "c"]), &ResourceClaims::new()).is_ok());
    }

    #[test]
    fn shared_resources_and_duplicates_conflict() {
        let store = store_with(&["a", "b"]);
        let view = store.snapshot();
        let a = ItemId::new_unchecked("a");
        let b = ItemId::new_unchecked("b");
        let resources = ResourceClaims::new()
            .with(&a, "src/lib.rs")
            .with(&b, "src/lib.rs");
        let err = check_independence(&view, &ids(&["a", "b", "a"]), &resources).unwrap_err();
        assert!(err.conflicts.iter().any(|c| c.reason == ConflictReason::Duplicate));
        assert!(err.conflicts.iter().any(|c| matches!(
            &c.reason,
            ConflictReason::SharedResource { resource } if resource == "src/lib.rs"
        )));
        assert!(err.involves("b"));
    }

    #[test]
    fn conflicting_batch_claims_nothing() {
        let store = store_with(&["a", "b", "c"]);
        store.add_edge("b", "a", EdgeKind::DependsOn).unwrap();
        let repo = MemoryRepository::new();
        let dispatcher = Dispatcher::new(&store, &repo, DispatchConfig::default());
        let err = dispatcher
            .dispatch(&ids(&["a", "b", "c"]), &ResourceClaims::new())
            .unwrap_err();
        assert!(matches!(err, ForemanError::BatchConflict(_)));
        for id in ["a", "b", "c"] {
            assert!(store.get(id).unwrap().assignee.is_unassigned());
        }
    }

    #[test]
    fn claimed_members_are_dropped_not_fatal() {
        let store = store_with(&["a", "b"]);
        claim::claim(&store, "a", &Assignee::Human).unwrap();
        let repo = MemoryRepository::new();
        let dispatcher = Dispatcher::new(&store, &repo, DispatchConfig::default());
        let plan = dispatcher
            .dispatch(&ids(&["a", "b"]), &ResourceClaims::new())
            .unwrap();
        assert_eq!(plan.mode, ExecutionMode::Parallel);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.assignments[0].item_id.as_str(), "b");
        assert_eq!(plan.skipped.len(), 1);
        assert_eq!(store.get("a").unwrap().assignee, Assignee::Human);
        let b = store.get("b").unwrap();
        assert_eq!(b.workspace_ref.as_deref(), Some(plan.assignments[0].workspace_ref.as_str()));
    }

    #[test]
    fn workspace_failure_blocks_as_infrastructure() {
        let store = store_with(&["a"]);
        let repo = MemoryRepository::new();
        repo.fail_next("create", 1);
        let dispatcher = Dispatcher::new(&store, &repo, DispatchConfig::default());
        let plan = dispatcher
            .dispatch(&ids(&["a"]), &ResourceClaims::new())
            .unwrap();
        assert!(plan.is_empty());
        let a = store.get("a").unwrap();
        assert_eq!(a.status, Status::Blocked);
        assert_eq!(a.block.map(|b| b.cause), Some(BlockCause::Infrastructure));
    }

    /// Starts the claimed item before failing, so the dispatcher finds it
    /// no longer `active`.
    struct RacingWorkspaces<'a> {
        store: &'a GraphStore,
    }

    impl WorkspaceProvider for RacingWorkspaces<'_> {
        fn create(&self, item: &ItemId) -> crate::collab::InfraResult<String> {
            let current = self.store.get(item.as_str()).unwrap();
            claim::begin(self.store, item.as_str(), &current.assignee).unwrap();
            Err(crate::collab::InfraError::permanent("create", "disk full"))
        }

        fn has_changes(&self, _workspace: &str) -> crate::collab::InfraResult<bool> {
            Ok(false)
        }

        fn merge(&self, _workspace: &str) -> crate::collab::InfraResult<crate::collab::MergeResult> {
            Ok(crate::collab::MergeResult::Merged)
        }

        fn destroy(&self, _workspace: &str) -> crate::collab::InfraResult<()> {
            Ok(())
        }
    }

    #[test]
    fn unattached_item_is_released_when_block_fails() {
        let store = store_with(&["a"]);
        let workspaces = RacingWorkspaces { store: &store };
        let dispatcher = Dispatcher::new(&store, &workspaces, DispatchConfig::default());
        let plan = dispatcher
            .dispatch(&ids(&["a"]), &ResourceClaims::new())
            .unwrap();
        assert!(plan.assignments.is_empty());
        assert_eq!(plan.skipped.len(), 1);
        assert!(plan.skipped[0].reason.contains("cancelled after block failed"));

        let a = store.get("a").unwrap();
        assert_eq!(a.status, Status::Blocked);
        assert!(a.assignee.is_unassigned());
        assert_eq!(a.block.map(|b| b.cause), Some(BlockCause::Cancelled));
    }

    #[test]
    fn pool_runs_every_item_within_bound() {
        let names: Vec<String> = (0..12).map(|n| format!("t{n}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let store = store_with(&refs);
        let repo = MemoryRepository::new();
        let config = DispatchConfig {
            max_pool_size: 3,
            ..DispatchConfig::default()
        };
        let dispatcher = Dispatcher::new(&store, &repo, config);
        let plan = dispatcher.dispatch(&ids(&refs), &ResourceClaims::new()).unwrap();
        assert_eq!(plan.mode, ExecutionMode::SupervisedPool { pool_size: 3 });

        let executor = |a: &Assignment| {
            thread::sleep(std::time::Duration::from_millis(2));
            if a.item_id.as_str() == "t3" {
                WorkOutcome::Failed("boom".into())
            } else if a.item_id.as_str() == "t4" {
                panic!("worker crashed");
            } else {
                WorkOutcome::Completed
            }
        };
        let report = dispatcher.run(plan, &executor, &DrainHandle::new());
        assert_eq!(report.submitted.len(), 10);
        assert_eq!(report.failed.len(), 2);
        assert!(report.peak_concurrency <= 3);
        assert!(report.peak_concurrency >= 1);
        assert_eq!(store.get("t0").unwrap().status, Status::Review);
        let crashed = store.get("t4").unwrap();
        assert_eq!(crashed.status, Status::Blocked);
        assert!(crashed.body.contains("worker panicked"));
    }

    #[test]
    fn drain_releases_unstarted_items() {
        let store = store_with(&["a", "b"]);
        let repo = MemoryRepository::new();
        let dispatcher = Dispatcher::new(&store, &repo, DispatchConfig::default());
        let plan = dispatcher
            .dispatch(&ids(&["a", "b"]), &ResourceClaims::new())
            .unwrap();
        let drain = DrainHandle::new();
        drain.request();
        let report = dispatcher.run(plan, &|_: &Assignment| WorkOutcome::Completed, &drain);
        assert_eq!(report.released.len(), 2);
        for id in ["a", "b"] {
            let item = store.get(id).unwrap();
            assert_eq!(item.status, Status::Ready);
            assert!(item.assignee.is_unassigned());
        }
    }

    #[test]
    fn select_independent_skips_resource_clashes() {
        let store = store_with(&["a", "b", "c"]);
        let view = store.snapshot();
        let resources = ResourceClaims::new()
            .with(&ItemId::new_unchecked("a"), "db")
            .with(&ItemId::new_unchecked("b"), "db");
        let chosen = select_independent(&view, None, &resources, 5);
        assert_eq!(chosen.len(), 2);
        assert!(check_independence(&view, &chosen, &resources).is_ok());
    }
}
