//! Sequential integration of reviewed work into the mainline.
//!
//! The pipeline is the only mainline writer. It drains `review` items one at
//! a time; once an item enters merge it runs to completion before the next
//! one starts:
//!
//! 1. Sync the local mainline. If the workspace has no changes relative to
//!    it, skip straight to cleanup and `done` (this makes re-runs safe).
//! 2. Snapshot mainline, squash-merge the workspace. On conflict the merge
//!    is aborted, mainline restored, and the item blocked.
//! 3. Run validation against the merged state. On failure mainline is
//!    restored to the snapshot exactly and the item blocked.
//! 4. Commit referencing the item, publish, destroy the workspace, mark the
//!    item `done` (which clears `workspace_ref` and unblocks dependents).
//!
//! Transient infrastructure errors are retried `infra_retries` times with
//! linear backoff; after that the item is blocked with an infrastructure
//! diagnostic. Merge and validation failures are never retried here.

#![allow(clippy::module_name_repetitions)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::collab::{
    InfraError, InfraResult, MainlineHandle, MainlinePublisher, MergeResult, ValidationRunner,
    ValidationTarget, WorkspaceProvider,
};
use crate::config::IntegrationConfig;
use crate::error::{ForemanError, Result};
use crate::lock::MergeSlotLock;
use crate::model::{BlockCause, BlockDiagnostic, InvalidTransition, ItemId, Status, WorkItem};
use crate::store::{GraphStore, ItemFilter};

/// What happened to one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum IntegrationOutcome {
    /// Merged, validated, committed, and published.
    Merged { commit: MainlineHandle },
    /// Workspace had nothing new relative to mainline; marked done.
    NoChanges,
    /// Item was already done; nothing touched.
    AlreadyDone,
    /// Item moved to `blocked`; mainline left as it was before the attempt.
    Blocked { cause: BlockCause, detail: String },
}

impl IntegrationOutcome {
    /// The taxonomy error equivalent of a blocked outcome.
    #[must_use]
    pub fn to_error(&self, id: &ItemId) -> Option<ForemanError> {
        let Self::Blocked { cause, detail } = self else {
            return None;
        };
        Some(match cause {
            BlockCause::MergeConflict => ForemanError::MergeConflict {
                id: id.clone(),
                paths: Vec::new(),
                detail: detail.clone(),
            },
            BlockCause::ValidationFailure => ForemanError::ValidationFailure {
                id: id.clone(),
                detail: detail.clone(),
            },
            _ => ForemanError::Infrastructure(InfraError::permanent("integrate", detail.clone())),
        })
    }

    #[must_use]
    pub const fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Result of one [`IntegrationPipeline::run`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrationReport {
    pub outcomes: Vec<(ItemId, IntegrationOutcome)>,
    /// Items whose integration could not be recorded (store rejected the
    /// final transition, or rollback failed).
    pub errors: Vec<(ItemId, String)>,
}

impl IntegrationReport {
    pub fn merged(&self) -> impl Iterator<Item = &ItemId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, IntegrationOutcome::Merged { .. }))
            .map(|(id, _)| id)
    }

    pub fn blocked(&self) -> impl Iterator<Item = &ItemId> {
        self.outcomes
            .iter()
            .filter(|(_, o)| o.is_blocked())
            .map(|(id, _)| id)
    }
}

/// Failure inside one attempt, before the item is blocked.
enum StepFailure {
    Block(BlockCause, String),
    Fatal(ForemanError),
}

impl From<InfraError> for StepFailure {
    fn from(err: InfraError) -> Self {
        Self::Block(BlockCause::Infrastructure, err.to_string())
    }
}

/// The single mainline writer.
pub struct IntegrationPipeline<'a> {
    store: &'a GraphStore,
    workspaces: &'a dyn WorkspaceProvider,
    validator: &'a dyn ValidationRunner,
    mainline: &'a dyn MainlinePublisher,
    config: IntegrationConfig,
    slot: Mutex<()>,
    state_dir: Option<PathBuf>,
    lock_timeout: Duration,
}

impl<'a> IntegrationPipeline<'a> {
    #[must_use]
    pub fn new(
        store: &'a GraphStore,
        workspaces: &'a dyn WorkspaceProvider,
        validator: &'a dyn ValidationRunner,
        mainline: &'a dyn MainlinePublisher,
        config: IntegrationConfig,
    ) -> Self {
        Self {
            store,
            workspaces,
            validator,
            mainline,
            config,
            slot: Mutex::new(()),
            state_dir: None,
            lock_timeout: Duration::from_secs(60),
        }
    }

    /// Also hold the cross-process merge slot under `state_dir` while
    /// integrating each item.
    #[must_use]
    pub fn with_merge_lock(mut self, state_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        self.state_dir = Some(state_dir.into());
        self.lock_timeout = timeout;
        self
    }

    /// Drain the review queue, including items that reach `review` while the
    /// run is in progress. Each item is attempted at most once per run.
    ///
    /// # Errors
    ///
    /// Only a merge-slot lock failure aborts the run; per-item problems are
    /// recorded in the report.
    pub fn run(&self) -> Result<IntegrationReport> {
        let mut report = IntegrationReport::default();
        let mut attempted: HashSet<ItemId> = HashSet::new();

        loop {
            let mut queue: Vec<WorkItem> = self
                .store
                .list(&ItemFilter::default().status(Status::Review))
                .into_iter()
                .filter(|item| !attempted.contains(&item.id))
                .collect();
            if queue.is_empty() {
                break;
            }
            queue.sort_by(|a, b| (a.priority, a.updated_at).cmp(&(b.priority, b.updated_at)));

            for item in queue {
                attempted.insert(item.id.clone());
                match self.integrate(item.id.as_str()) {
                    Ok(outcome) => report.outcomes.push((item.id, outcome)),
                    Err(err @ ForemanError::Lock(_)) => return Err(err),
                    Err(err) => {
                        error!(item_id = %item.id, error = %err, "integration not recorded");
                        report.errors.push((item.id, err.to_string()));
                    }
                }
            }
        }

        info!(
            merged = report.merged().count(),
            blocked = report.blocked().count(),
            errors = report.errors.len(),
            "review queue drained"
        );
        Ok(report)
    }

    /// Integrate one item.
    ///
    /// # Errors
    ///
    /// - [`ForemanError::NotFound`].
    /// - [`ForemanError::InvalidTransition`] when the item is neither in
    ///   `review` nor `done`.
    /// - [`ForemanError::Lock`] when the merge slot is held elsewhere.
    /// - [`ForemanError::Infrastructure`] when a failed attempt could not be
    ///   rolled back; the item is blocked (unless another writer moved it
    ///   first) but mainline may differ from the snapshot.
    pub fn integrate(&self, id: &str) -> Result<IntegrationOutcome> {
        let _slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let _merge_lock = match &self.state_dir {
            Some(dir) => Some(MergeSlotLock::acquire(dir, self.lock_timeout)?),
            None => None,
        };

        let item = self.store.get(id)?;
        match item.status {
            Status::Done => {
                debug!(item_id = id, "already integrated");
                return Ok(IntegrationOutcome::AlreadyDone);
            }
            Status::Review => {}
            other => {
                return Err(ForemanError::transition(
                    &item.id,
                    InvalidTransition {
                        from: other,
                        to: Status::Done,
                        reason: "only review items can be integrated",
                    },
                ));
            }
        }
        info!(item_id = id, "integrating");

        match self.attempt(&item) {
            Ok(outcome) => Ok(outcome),
            Err(StepFailure::Block(cause, detail)) => {
                self.store
                    .block(id, Status::Review, BlockDiagnostic::new(cause, detail.clone()))?;
                Ok(IntegrationOutcome::Blocked { cause, detail })
            }
            Err(StepFailure::Fatal(err)) => Err(err),
        }
    }

    fn attempt(&self, item: &WorkItem) -> std::result::Result<IntegrationOutcome, StepFailure> {
        let id = &item.id;
        let Some(workspace) = item.workspace_ref.as_deref() else {
            return Err(StepFailure::Block(
                BlockCause::Infrastructure,
                "review item has no workspace".to_string(),
            ));
        };

        self.with_retries(id, "sync", || self.mainline.sync())?;
        if !self.with_retries(id, "diff", || self.workspaces.has_changes(workspace))? {
            info!(item_id = %id, workspace, "no changes relative to mainline");
            self.finish(item, workspace)?;
            return Ok(IntegrationOutcome::NoChanges);
        }

        let base = self.with_retries(id, "snapshot", || self.mainline.snapshot())?;
        let merged = self.with_retries(id, "merge", || self.workspaces.merge(workspace));
        match merged {
            Ok(MergeResult::Merged) => {}
            Ok(MergeResult::Conflict { paths, detail }) => {
                warn!(item_id = %id, ?paths, "merge conflict");
                self.rollback(id, &base)?;
                let detail = if paths.is_empty() {
                    detail
                } else {
                    format!("{detail}\nconflicting paths:\n  {}", paths.join("\n  "))
                };
                return Err(StepFailure::Block(BlockCause::MergeConflict, detail));
            }
            Err(err) => return Err(self.rollback_then(id, &base, err.into())),
        }

        let target = ValidationTarget { item, base: &base };
        match self.with_retries(id, "validate", || self.validator.run(&target)) {
            Ok(report) if report.passed => {}
            Ok(report) => {
                warn!(item_id = %id, summary = %report.summary, "validation failed");
                return Err(self.rollback_then(
                    id,
                    &base,
                    StepFailure::Block(BlockCause::ValidationFailure, report.detail()),
                ));
            }
            Err(err) => return Err(self.rollback_then(id, &base, err.into())),
        }

        let message = format!("Merge {workspace}: {} ({id})", item.title);
        let commit = match self.with_retries(id, "commit", || self.mainline.commit(&message, id)) {
            Ok(commit) => commit,
            Err(err) => return Err(self.rollback_then(id, &base, err.into())),
        };
        if let Err(err) = self.with_retries(id, "publish", || self.mainline.publish()) {
            return Err(self.rollback_then(id, &base, err.into()));
        }
        info!(item_id = %id, %commit, "published");

        self.finish(item, workspace)?;
        Ok(IntegrationOutcome::Merged { commit })
    }

    /// Destroy the workspace and mark the item done.
    fn finish(&self, item: &WorkItem, workspace: &str) -> std::result::Result<(), StepFailure> {
        if let Err(err) = self.with_retries(&item.id, "destroy", || self.workspaces.destroy(workspace))
        {
            warn!(item_id = %item.id, workspace, error = %err, "workspace cleanup failed");
        }
        self.store
            .update_status(item.id.as_str(), Status::Done, Status::Review)
            .map_err(StepFailure::Fatal)?;
        Ok(())
    }

    fn rollback(&self, id: &ItemId, base: &MainlineHandle) -> std::result::Result<(), StepFailure> {
        self.with_retries(id, "restore", || self.mainline.restore(base))
            .map_err(|err| {
                error!(item_id = %id, %base, error = %err, "rollback failed");
                let diagnostic = BlockDiagnostic::new(
                    BlockCause::Infrastructure,
                    format!("rollback to {base} failed: {err}"),
                );
                if let Err(block_err) = self.store.block(id.as_str(), Status::Review, diagnostic) {
                    error!(item_id = %id, error = %block_err, "item left in review after failed rollback");
                }
                StepFailure::Fatal(ForemanError::Infrastructure(err))
            })?;
        debug!(item_id = %id, %base, "mainline restored");
        Ok(())
    }

    fn rollback_then(&self, id: &ItemId, base: &MainlineHandle, failure: StepFailure) -> StepFailure {
        match self.rollback(id, base) {
            Ok(()) => failure,
            Err(fatal) => fatal,
        }
    }

    fn with_retries<T>(
        &self,
        id: &ItemId,
        operation: &str,
        mut call: impl FnMut() -> InfraResult<T>,
    ) -> InfraResult<T> {
        let attempts = self.config.infra_retries.saturating_add(1);
        let backoff = Duration::from_millis(self.config.retry_backoff_ms);
        let mut attempt = 1;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(err) if err.transient && attempt < attempts => {
                    warn!(item_id = %id, operation, attempt, error = %err, "transient failure, retrying");
                    thread::sleep(backoff.saturating_mul(attempt));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
