//! Simulated workers.
//!
//! A worker's behaviour for an item is fixed by `(seed, item, round)`, so
//! the same seed produces the same graph outcome no matter how the worker
//! threads interleave.

use foreman_core::claim;
use foreman_core::collab::WorkspaceProvider;
use foreman_core::dispatch::{Assignment, WorkOutcome};
use foreman_core::memory::MemoryRepository;
use foreman_core::model::{Assignee, ItemId};
use foreman_core::store::GraphStore;

use crate::FaultProfile;
use crate::rng::DeterministicRng;

/// File every "shared" edit touches; concurrent edits to it conflict.
pub const SHARED_FILE: &str = "shared.txt";

/// Marker the simulated validation suite rejects.
pub const BROKEN_MARKER: &str = "!broken";

/// What a worker will do with an item this round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkPlan {
    /// Write `content` to `path` and submit.
    Edit { path: String, content: String },
    /// Give up with a failure report.
    Fail(String),
    /// Panic mid-execution. Only dispatched workers crash.
    Crash,
    /// Cancelled by an operator while in progress.
    Cancel,
}

impl WorkPlan {
    /// The file this plan edits, if any.
    #[must_use]
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Edit { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Decide the worker's behaviour for `item` in `round`.
#[must_use]
pub fn plan_work(seed: u64, item: &ItemId, round: u64, faults: &FaultProfile) -> WorkPlan {
    let mut rng = DeterministicRng::for_key(seed, item.as_str(), round);
    if rng.hit_rate_percent(faults.worker_failure_percent) {
        return if rng.hit_rate_percent(25) {
            WorkPlan::Crash
        } else {
            WorkPlan::Fail(format!("simulated failure in round {round}"))
        };
    }
    if rng.hit_rate_percent(faults.cancel_percent) {
        return WorkPlan::Cancel;
    }
    let path = if rng.hit_rate_percent(faults.shared_file_percent) {
        SHARED_FILE.to_string()
    } else {
        format!("{item}.txt")
    };
    let mut content = format!("{item}@{round}");
    if rng.hit_rate_percent(faults.validation_failure_percent) {
        content.push(' ');
        content.push_str(BROKEN_MARKER);
    }
    WorkPlan::Edit { path, content }
}

/// Execute `plan` for a dispatched assignment.
///
/// A [`WorkPlan::Cancel`] cancels the item from under the running worker;
/// the dispatcher then finds it moved and leaves it as found.
///
/// # Panics
///
/// On [`WorkPlan::Crash`]. The dispatcher turns the panic into a worker
/// failure.
pub fn perform(
    store: &GraphStore,
    repo: &MemoryRepository,
    assignment: &Assignment,
    plan: &WorkPlan,
) -> WorkOutcome {
    match plan {
        WorkPlan::Edit { path, content } => {
            match repo.write_file(&assignment.workspace_ref, path, content) {
                Ok(()) => WorkOutcome::Completed,
                Err(err) => WorkOutcome::Failed(err.to_string()),
            }
        }
        WorkPlan::Fail(detail) => WorkOutcome::Failed(detail.clone()),
        WorkPlan::Crash => panic!("simulated worker crash"),
        WorkPlan::Cancel => {
            if let Err(err) = claim::cancel(store, assignment.item_id.as_str(), "operator cancelled") {
                return WorkOutcome::Failed(err.to_string());
            }
            WorkOutcome::Completed
        }
    }
}

/// How a self-claimed item ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Finish {
    Submitted,
    Failed,
    Cancelled,
}

/// Drive an item this worker just claimed through the worker side of the
/// lifecycle: workspace, `in_progress`, then `review` or `blocked`.
///
/// # Errors
///
/// Any store or workspace error; the caller records it as a violation of
/// the simulated protocol.
pub fn work_claimed(
    store: &GraphStore,
    repo: &MemoryRepository,
    item: &ItemId,
    worker: &Assignee,
    plan: &WorkPlan,
) -> anyhow::Result<Finish> {
    let id = item.as_str();
    let workspace = repo.create(item)?;
    store.set_workspace_ref(id, Some(workspace.clone()))?;
    claim::begin(store, id, worker)?;

    let finish = match plan {
        WorkPlan::Edit { path, content } => {
            repo.write_file(&workspace, path, content)?;
            claim::submit_for_review(store, id, worker)?;
            Finish::Submitted
        }
        WorkPlan::Fail(detail) => {
            claim::report_failure(store, id, worker, detail)?;
            Finish::Failed
        }
        WorkPlan::Crash => {
            claim::report_failure(store, id, worker, "worker process exited")?;
            Finish::Failed
        }
        WorkPlan::Cancel => {
            claim::cancel(store, id, "operator cancelled")?;
            Finish::Cancelled
        }
    };
    Ok(finish)
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::model::{ItemSpec, Status};

    fn calm() -> FaultProfile {
        FaultProfile {
            worker_failure_percent: 0,
            cancel_percent: 0,
            shared_file_percent: 0,
            validation_failure_percent: 0,
            ..FaultProfile::default()
        }
    }

    #[test]
    fn plans_are_deterministic() {
        let id = ItemId::new_unchecked("sim-001");
        let faults = FaultProfile::default();
        for round in 0..10 {
            assert_eq!(
                plan_work(9, &id, round, &faults),
                plan_work(9, &id, round, &faults)
            );
        }
    }

    #[test]
    fn calm_profile_always_edits_own_file() {
        let id = ItemId::new_unchecked("sim-002");
        let plan = plan_work(1, &id, 3, &calm());
        assert_eq!(
            plan,
            WorkPlan::Edit {
                path: "sim-002.txt".into(),
                content: "sim-002@3".into()
            }
        );
    }

    #[test]
    fn claimed_edit_reaches_review() {
        let store = GraphStore::new();
        let repo = MemoryRepository::new();
        store
            .create(ItemSpec::new("t").id("sim-001").project("sim"))
            .unwrap();
        let worker = Assignee::worker("w1");
        claim::claim(&store, "sim-001", &worker).unwrap();

        let item = ItemId::new_unchecked("sim-001");
        let plan = plan_work(1, &item, 0, &calm());
        let finish = work_claimed(&store, &repo, &item, &worker, &plan).unwrap();
        assert_eq!(finish, Finish::Submitted);
        assert_eq!(store.get("sim-001").unwrap().status, Status::Review);
    }

    #[test]
    fn cancel_blocks_and_keeps_workspace() {
        let store = GraphStore::new();
        let repo = MemoryRepository::new();
        store
            .create(ItemSpec::new("t").id("sim-001").project("sim"))
            .unwrap();
        let worker = Assignee::worker("w1");
        claim::claim(&store, "sim-001", &worker).unwrap();

        let item = ItemId::new_unchecked("sim-001");
        let finish = work_claimed(&store, &repo, &item, &worker, &WorkPlan::Cancel).unwrap();
        assert_eq!(finish, Finish::Cancelled);
        let after = store.get("sim-001").unwrap();
        assert_eq!(after.status, Status::Blocked);
        assert!(repo.has_workspace(after.workspace_ref.as_deref().unwrap()));
    }
}
