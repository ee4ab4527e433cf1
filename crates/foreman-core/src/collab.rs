//! Boundary contracts for the external collaborators.
//!
//! The orchestrator tracks the identity and lifecycle of isolated
//! workspaces, validation runs, and mainline commits, but the mechanics
//! behind them live elsewhere. [`crate::memory`] provides an in-process
//! implementation of all three for tests and simulation; [`crate::git`]
//! shells out to `git` and a configured test command.

#![allow(clippy::module_name_repetitions)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{ItemId, ItemType, WorkItem};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failure of the infrastructure behind a collaborator (network, storage,
/// subprocess).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation} failed: {message}")]
pub struct InfraError {
    /// Collaborator operation that failed, e.g. `fetch`, `publish`.
    pub operation: String,
    pub message: String,
    /// Whether retrying the same call may succeed.
    pub transient: bool,
}

impl InfraError {
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            transient: false,
        }
    }
}

pub type InfraResult<T> = Result<T, InfraError>;

// ---------------------------------------------------------------------------
// Workspaces
// ---------------------------------------------------------------------------

/// Outcome of merging a workspace into the local mainline copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeResult {
    /// The squashed changes are staged on top of mainline.
    Merged,
    /// Conflicting edits; the merge was aborted and mainline is untouched.
    Conflict { paths: Vec<String>, detail: String },
}

/// Per-item isolated execution sandbox.
pub trait WorkspaceProvider: Send + Sync {
    /// Create a workspace for `item` and return its reference.
    ///
    /// # Errors
    ///
    /// [`InfraError`] when the workspace cannot be created.
    fn create(&self, item: &ItemId) -> InfraResult<String>;

    /// Whether the workspace differs from the current mainline.
    ///
    /// # Errors
    ///
    /// [`InfraError`] when the comparison cannot be made.
    fn has_changes(&self, workspace: &str) -> InfraResult<bool>;

    /// Squash-merge the workspace into the local mainline copy without
    /// committing.
    ///
    /// # Errors
    ///
    /// [`InfraError`] for failures other than conflicting edits.
    fn merge(&self, workspace: &str) -> InfraResult<MergeResult>;

    /// Remove the workspace locally and remotely. Unknown references are
    /// not an error.
    ///
    /// # Errors
    ///
    /// [`InfraError`] when removal fails.
    fn destroy(&self, workspace: &str) -> InfraResult<()>;
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// What a validation run is asked to check.
#[derive(Debug, Clone, Copy)]
pub struct ValidationTarget<'a> {
    pub item: &'a WorkItem,
    /// Mainline state before the merge.
    pub base: &'a MainlineHandle,
}

/// Pass/fail with structured failure detail.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub summary: String,
    /// Individual failing checks, if the runner can tell them apart.
    pub failures: Vec<String>,
}

impl ValidationReport {
    #[must_use]
    pub fn pass() -> Self {
        Self {
            passed: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn fail(summary: impl Into<String>, failures: Vec<String>) -> Self {
        Self {
            passed: false,
            summary: summary.into(),
            failures,
        }
    }

    /// Text attached to a blocked item.
    #[must_use]
    pub fn detail(&self) -> String {
        if self.failures.is_empty() {
            self.summary.clone()
        } else {
            format!("{}\n{}", self.summary, self.failures.join("\n"))
        }
    }
}

/// Runs the project's validation suite against the merged mainline.
pub trait ValidationRunner: Send + Sync {
    /// # Errors
    ///
    /// [`InfraError`] when the suite could not run at all. A suite that ran
    /// and failed is an `Ok` report with `passed == false`.
    fn run(&self, target: &ValidationTarget<'_>) -> InfraResult<ValidationReport>;
}

// ---------------------------------------------------------------------------
// Mainline
// ---------------------------------------------------------------------------

/// Opaque restore point of the local mainline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MainlineHandle(pub String);

impl fmt::Display for MainlineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The shared mainline. Only the integration pipeline mutates it.
pub trait MainlinePublisher: Send + Sync {
    /// Bring the local mainline copy up to date with the shared remote.
    ///
    /// # Errors
    ///
    /// [`InfraError`] on fetch failure.
    fn sync(&self) -> InfraResult<()>;

    /// Capture the current local mainline state.
    ///
    /// # Errors
    ///
    /// [`InfraError`] when the state cannot be read.
    fn snapshot(&self) -> InfraResult<MainlineHandle>;

    /// Reset the local mainline to exactly `handle`, discarding any staged
    /// merge.
    ///
    /// # Errors
    ///
    /// [`InfraError`] when the reset fails.
    fn restore(&self, handle: &MainlineHandle) -> InfraResult<()>;

    /// Commit the staged merge with `message` and return the new head.
    ///
    /// # Errors
    ///
    /// [`InfraError`] when nothing can be committed.
    fn commit(&self, message: &str, item: &ItemId) -> InfraResult<MainlineHandle>;

    /// Push the local mainline to the shared remote.
    ///
    /// # Errors
    ///
    /// [`InfraError`] on push failure.
    fn publish(&self) -> InfraResult<()>;
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Typed fields proposed for an item leaving `inbox`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub project: String,
    pub priority: u8,
    pub item_type: ItemType,
    pub parent: Option<ItemId>,
    #[serde(default)]
    pub depends_on: Vec<ItemId>,
}

/// External request classifier. Its heuristics are not part of the core.
pub trait Classifier: Send + Sync {
    /// # Errors
    ///
    /// [`InfraError`] when the classifier is unavailable.
    fn classify(&self, item: &WorkItem) -> InfraResult<Classification>;
}

impl<F> Classifier for F
where
    F: Fn(&WorkItem) -> InfraResult<Classification> + Send + Sync,
{
    fn classify(&self, item: &WorkItem) -> InfraResult<Classification> {
        self(item)
    }
}
