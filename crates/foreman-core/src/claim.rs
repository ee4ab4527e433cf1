//! Claim protocol and the worker side of the lifecycle.
//!
//! A claim is one compare-and-swap on `(status, assignee)`: it succeeds only
//! when the item is `inbox`/`ready` and unassigned, and atomically sets
//! `active` plus the claimant. There is no other lock. When the swap loses a
//! race the protocol re-reads the item before deciding whether to retry, so a
//! retry never acts on stale state.
//!
//! Worker transitions (`begin`, `submit_for_review`, `report_failure`) check
//! that the caller still owns the item. [`cancel`] is the administrative
//! escape hatch: it blocks an owned item and releases its assignee without
//! touching the workspace.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::ClaimConfig;
use crate::error::{ForemanError, Result};
use crate::model::{Assignee, BlockCause, BlockDiagnostic, Ownership, Status, WorkItem};
use crate::readiness;
use crate::store::GraphStore;

/// Bounded exponential backoff for compare-and-swap retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ClaimConfig::default())
    }
}

impl From<&ClaimConfig> for RetryPolicy {
    fn from(config: &ClaimConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// One re-read plus one swap.
fn try_claim(store: &GraphStore, id: &str, claimant: &Assignee) -> Result<WorkItem> {
    let current = store.get(id)?;
    if !current.status.is_claimable() || !current.assignee.is_unassigned() {
        return Err(ForemanError::ClaimConflict {
            id: current.id.clone(),
            current: current.ownership(),
        });
    }
    store.compare_and_swap(
        id,
        &current.ownership(),
        Ownership::new(Status::Active, claimant.clone()),
    )
}

/// Claim `id` for `claimant` with the default [`RetryPolicy`].
///
/// # Errors
///
/// See [`claim_with_retry`].
pub fn claim(store: &GraphStore, id: &str, claimant: &Assignee) -> Result<WorkItem> {
    claim_with_retry(store, id, claimant, RetryPolicy::default())
}

/// Claim `id` for `claimant`, re-reading and retrying when the swap races
/// another writer.
///
/// # Errors
///
/// - [`ForemanError::ClaimConflict`] when the item is owned or not claimable.
/// - [`ForemanError::Validation`] for an unassigned claimant or an inbox item
///   without a project.
/// - [`ForemanError::InvalidTransition`] when hard dependencies are not done.
/// - [`ForemanError::ConcurrentModification`] when every attempt raced.
/// - [`ForemanError::NotFound`].
pub fn claim_with_retry(
    store: &GraphStore,
    id: &str,
    claimant: &Assignee,
    policy: RetryPolicy,
) -> Result<WorkItem> {
    if claimant.is_unassigned() {
        return Err(ForemanError::validation("claimant must be a human or a worker"));
    }

    let mut attempt = 1;
    loop {
        match try_claim(store, id, claimant) {
            Ok(item) => {
                info!(item_id = %item.id, worker = %claimant, attempt, "item claimed");
                return Ok(item);
            }
            Err(err @ ForemanError::ConcurrentModification { .. })
                if attempt < policy.max_attempts =>
            {
                debug!(item_id = id, worker = %claimant, attempt, error = %err, "claim raced, re-reading");
                thread::sleep(policy.delay(attempt));
                attempt += 1;
            }
            Err(err) => {
                debug!(item_id = id, worker = %claimant, attempt, error = %err, "claim failed");
                return Err(err);
            }
        }
    }
}

/// Claim the first ready item in queue order, optionally within `project`.
///
/// Items that cannot be claimed (raced, missing project, dependencies
/// regressed) are skipped. Returns `None` when nothing could be claimed.
///
/// # Errors
///
/// Only storage-level failures propagate.
pub fn claim_next(
    store: &GraphStore,
    claimant: &Assignee,
    project: Option<&str>,
    policy: RetryPolicy,
) -> Result<Option<WorkItem>> {
    let queue = readiness::ready_queue(&store.snapshot(), project);
    for entry in queue {
        match claim_with_retry(store, entry.id.as_str(), claimant, policy) {
            Ok(item) => return Ok(Some(item)),
            Err(
                ForemanError::ClaimConflict { .. }
                | ForemanError::ConcurrentModification { .. }
                | ForemanError::InvalidTransition { .. }
                | ForemanError::Validation(_)
                | ForemanError::NotFound(_),
            ) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(None)
}

/// Re-read `id` and check `worker` owns it in one of `statuses`.
fn owned_by(
    store: &GraphStore,
    id: &str,
    worker: &Assignee,
    statuses: &[Status],
) -> Result<WorkItem> {
    let item = store.get(id)?;
    if &item.assignee != worker || !statuses.contains(&item.status) {
        return Err(ForemanError::ClaimConflict {
            id: item.id.clone(),
            current: item.ownership(),
        });
    }
    Ok(item)
}

/// `active -> in_progress` for the owning worker.
///
/// # Errors
///
/// [`ForemanError::ClaimConflict`] when `worker` does not own an active
/// item; [`ForemanError::ConcurrentModification`] if it moved meanwhile.
pub fn begin(store: &GraphStore, id: &str, worker: &Assignee) -> Result<WorkItem> {
    let item = owned_by(store, id, worker, &[Status::Active])?;
    store.compare_and_swap(
        id,
        &item.ownership(),
        Ownership::new(Status::InProgress, worker.clone()),
    )
}

/// `in_progress -> review` for the owning worker. The item must carry a
/// workspace reference.
///
/// # Errors
///
/// [`ForemanError::ClaimConflict`] for a non-owner,
/// [`ForemanError::InvalidTransition`] without a workspace.
pub fn submit_for_review(store: &GraphStore, id: &str, worker: &Assignee) -> Result<WorkItem> {
    let item = owned_by(store, id, worker, &[Status::InProgress])?;
    let item = store.compare_and_swap(
        id,
        &item.ownership(),
        Ownership::new(Status::Review, worker.clone()),
    )?;
    info!(item_id = %item.id, worker = %worker, "submitted for review");
    Ok(item)
}

/// The owning worker failed or crashed: block with a worker-failure
/// diagnostic.
///
/// # Errors
///
/// [`ForemanError::ClaimConflict`] for a non-owner.
pub fn report_failure(
    store: &GraphStore,
    id: &str,
    worker: &Assignee,
    detail: &str,
) -> Result<WorkItem> {
    let item = owned_by(store, id, worker, &[Status::Active, Status::InProgress])?;
    warn!(item_id = %item.id, worker = %worker, detail, "worker reported failure");
    store.block(
        id,
        item.status,
        BlockDiagnostic::new(BlockCause::WorkerFailure, detail),
    )
}

/// Administrative cancellation of an `active`/`in_progress` item.
///
/// Releases the assignee and leaves the workspace untouched so partial work
/// stays recoverable.
///
/// # Errors
///
/// [`ForemanError::InvalidTransition`] when the item is not owned by a
/// worker; [`ForemanError::ConcurrentModification`] if it moved meanwhile.
pub fn cancel(store: &GraphStore, id: &str, reason: &str) -> Result<WorkItem> {
    let item = store.get(id)?;
    if !matches!(item.status, Status::Active | Status::InProgress) {
        return Err(ForemanError::transition(
            &item.id,
            crate::model::InvalidTransition {
                from: item.status,
                to: Status::Blocked,
                reason: "only active or in-progress items can be cancelled",
            },
        ));
    }
    info!(item_id = %item.id, owner = %item.assignee, reason, "claim cancelled");
    store.block(
        id,
        item.status,
        BlockDiagnostic::new(BlockCause::Cancelled, reason),
    )
}

/// Hand back a claimed item the worker never started: cancel, then return it
/// to `ready`.
///
/// # Errors
///
/// [`ForemanError::ClaimConflict`] when `worker` does not own an active
/// item.
pub fn release_unstarted(store: &GraphStore, id: &str, worker: &Assignee) -> Result<WorkItem> {
    owned_by(store, id, worker, &[Status::Active])?;
    cancel(store, id, "released before start")?;
    store.update_status(id, Status::Ready, Status::Blocked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::edges::EdgeKind;
    use crate::model::ItemSpec;
    use std::sync::{Arc, Barrier};

    fn store_with(ids: &[&str]) -> GraphStore {
        let store = GraphStore::new();
        for id in ids {
            store
                .create(ItemSpec::new(format!("task {id}")).id(*id).project("core"))
                .unwrap();
        }
        store
    }

    #[test]
    fn claim_sets_active_and_claimant() {
        let store = store_with(&["a"]);
        let w = Assignee::worker("w1");
        let item = claim(&store, "a", &w).unwrap();
        assert_eq!(item.ownership(), Ownership::new(Status::Active, w));
    }

    #[test]
    fn second_claim_conflicts_without_changing_owner() {
        let store = store_with(&["a"]);
        claim(&store, "a", &Assignee::worker("w1")).unwrap();
        let err = claim(&store, "a", &Assignee::worker("w2")).unwrap_err();
        assert!(matches!(err, ForemanError::ClaimConflict { .. }));
        assert_eq!(store.get("a").unwrap().assignee, Assignee::worker("w1"));
    }

    #[test]
    fn claim_requires_project_and_done_dependencies() {
        let store = store_with(&["a", "b"]);
        store.add_edge("b", "a", EdgeKind::DependsOn).unwrap();
        assert!(matches!(
            claim(&store, "b", &Assignee::Human),
            Err(ForemanError::InvalidTransition { .. })
        ));

        let inbox = store.create(ItemSpec::new("unsorted")).unwrap();
        assert!(matches!(
            claim(&store, inbox.id.as_str(), &Assignee::Human),
            Err(ForemanError::Validation(_))
        ));
        assert!(matches!(
            claim(&store, "a", &Assignee::Unassigned),
            Err(ForemanError::Validation(_))
        ));
    }

    #[test]
    fn concurrent_claims_have_one_winner() {
        let store = Arc::new(store_with(&["hot"]));
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|n| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    claim(&store, "hot", &Assignee::worker(format!("w{n}")))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(winners, 1);
        for result in results.iter().filter(|r| r.is_err()) {
            assert!(matches!(result, Err(ForemanError::ClaimConflict { .. })));
        }
        assert_eq!(store.get("hot").unwrap().status, Status::Active);
    }

    #[test]
    fn claim_next_follows_queue_order() {
        let store = GraphStore::new();
        store
            .create(ItemSpec::new("low").id("low").project("core").priority(4))
            .unwrap();
        store
            .create(ItemSpec::new("urgent").id("urgent").project("core").priority(0))
            .unwrap();
        let w = Assignee::worker("w1");
        let first = claim_next(&store, &w, None, RetryPolicy::default())
            .unwrap()
            .unwrap();
        assert_eq!(first.id.as_str(), "urgent");
        let second = claim_next(&store, &w, Some("core"), RetryPolicy::default())
            .unwrap()
            .unwrap();
        assert_eq!(second.id.as_str(), "low");
        assert!(
            claim_next(&store, &w, None, RetryPolicy::default())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn worker_protocol_checks_ownership() {
        let store = store_with(&["a"]);
        let w1 = Assignee::worker("w1");
        let w2 = Assignee::worker("w2");
        claim(&store, "a", &w1).unwrap();
        assert!(matches!(
            begin(&store, "a", &w2),
            Err(ForemanError::ClaimConflict { .. })
        ));
        begin(&store, "a", &w1).unwrap();
        assert!(matches!(
            submit_for_review(&store, "a", &w1),
            Err(ForemanError::InvalidTransition { .. })
        ));
        store.set_workspace_ref("a", Some("ws-a".into())).unwrap();
        let item = submit_for_review(&store, "a", &w1).unwrap();
        assert_eq!(item.status, Status::Review);
    }

    #[test]
    fn failure_and_cancel_release_the_assignee() {
        let store = store_with(&["a", "b"]);
        let w = Assignee::worker("w1");
        claim(&store, "a", &w).unwrap();
        begin(&store, "a", &w).unwrap();
        let failed = report_failure(&store, "a", &w, "segfault").unwrap();
        assert_eq!(failed.status, Status::Blocked);
        assert_eq!(failed.assignee, Assignee::Unassigned);
        assert_eq!(
            failed.block.map(|b| b.cause),
            Some(BlockCause::WorkerFailure)
        );

        claim(&store, "b", &w).unwrap();
        store.set_workspace_ref("b", Some("ws-b".into())).unwrap();
        let cancelled = cancel(&store, "b", "timed out").unwrap();
        assert_eq!(cancelled.assignee, Assignee::Unassigned);
        assert_eq!(cancelled.workspace_ref.as_deref(), Some("ws-b"));
        assert!(cancel(&store, "b", "again").is_err());
    }

    #[test]
    fn release_unstarted_returns_item_to_ready() {
        let store = store_with(&["a"]);
        let w = Assignee::worker("w1");
        claim(&store, "a", &w).unwrap();
        let item = release_unstarted(&store, "a", &w).unwrap();
        assert_eq!(item.status, Status::Ready);
        assert_eq!(item.assignee, Assignee::Unassigned);
        assert!(item.block.is_none());
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            backoff: Duration::from_millis(2),
            max_backoff: Duration::from_millis(10),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(2));
        assert_eq!(policy.delay(2), Duration::from_millis(4));
        assert_eq!(policy.delay(3), Duration::from_millis(8));
        assert_eq!(policy.delay(4), Duration::from_millis(10));
        assert_eq!(policy.delay(40), Duration::from_millis(10));
    }
}
