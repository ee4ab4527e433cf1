use std::fmt;

use crate::collab::InfraError;
use crate::dispatch::BatchConflict;
use crate::graph::cycles::CyclePath;
use crate::graph::edges::EdgeKind;
use crate::lock::LockError;
use crate::model::{InvalidTransition, ItemId, Ownership};

/// Machine-readable error codes for operators and automated callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    ItemNotFound,
    InvalidStateTransition,
    CycleDetected,
    DanglingReference,
    InvalidItem,
    ConcurrentModification,
    ClaimConflict,
    BatchConflict,
    MergeConflict,
    ValidationFailed,
    InfrastructureFailure,
    StorageFailure,
    LockContention,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::ItemNotFound => "E2001",
            Self::InvalidStateTransition => "E2002",
            Self::CycleDetected => "E2003",
            Self::DanglingReference => "E2004",
            Self::InvalidItem => "E2005",
            Self::ConcurrentModification => "E3001",
            Self::ClaimConflict => "E3002",
            Self::BatchConflict => "E3003",
            Self::MergeConflict => "E4001",
            Self::ValidationFailed => "E4002",
            Self::InfrastructureFailure => "E4003",
            Self::StorageFailure => "E5001",
            Self::LockContention => "E5002",
        }
    }

    /// Short human-facing summary for logs.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::ItemNotFound => "Item not found",
            Self::InvalidStateTransition => "Invalid state transition",
            Self::CycleDetected => "Cycle would be created",
            Self::DanglingReference => "Edge target does not exist",
            Self::InvalidItem => "Malformed work item",
            Self::ConcurrentModification => "Item changed concurrently",
            Self::ClaimConflict => "Item already claimed",
            Self::BatchConflict => "Batch items are not independent",
            Self::MergeConflict => "Merge conflict",
            Self::ValidationFailed => "Validation suite failed",
            Self::InfrastructureFailure => "Infrastructure failure",
            Self::StorageFailure => "Storage failure",
            Self::LockContention => "Lock contention",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .foreman/config.toml and retry."),
            Self::ItemNotFound | Self::InvalidItem => None,
            Self::InvalidStateTransition => Some(
                "Follow valid transitions: inbox -> ready -> active -> in_progress -> review -> done.",
            ),
            Self::CycleDetected => Some("Remove/adjust dependency links to keep the graph acyclic."),
            Self::DanglingReference => Some("Create the target item before linking to it."),
            Self::ConcurrentModification => Some("Re-read the item and retry."),
            Self::ClaimConflict => Some("Pick another ready item."),
            Self::BatchConflict => Some("Dispatch the conflicting items sequentially."),
            Self::MergeConflict => Some("Rebase the workspace onto mainline and resolve conflicts."),
            Self::ValidationFailed => Some("Fix the failing checks in the workspace and resubmit."),
            Self::InfrastructureFailure => Some("Check remote and storage availability."),
            Self::StorageFailure => Some("Check disk space and write permissions."),
            Self::LockContention => Some("Retry after the other process releases its lock."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Every failure the orchestrator core can report.
#[derive(Debug, thiserror::Error)]
pub enum ForemanError {
    /// Malformed item or field value. Fatal to the write.
    #[error("validation error: {0}")]
    Validation(String),

    /// Edge insertion would close a structural cycle.
    #[error("{0}")]
    Cycle(CyclePath),

    /// Edge target does not exist.
    #[error("dangling reference: {kind} edge {from} -> {to}, target does not exist")]
    DanglingReference {
        from: ItemId,
        to: ItemId,
        kind: EdgeKind,
    },

    /// Transition outside the lifecycle state machine.
    #[error("item {id}: {source}")]
    InvalidTransition {
        id: ItemId,
        #[source]
        source: InvalidTransition,
    },

    /// Compare-and-swap mismatch. Re-read and retry.
    #[error("concurrent modification of {id}: expected {expected}, found {actual}")]
    ConcurrentModification {
        id: ItemId,
        expected: Ownership,
        actual: Ownership,
    },

    #[error("item not found: {0}")]
    NotFound(String),

    /// Another actor already owns the item, or it is not claimable.
    #[error("claim conflict on {id}: currently {current}")]
    ClaimConflict { id: ItemId, current: Ownership },

    /// Dispatch batch is not safe to run in parallel.
    #[error("{0}")]
    BatchConflict(BatchConflict),

    #[error("merge conflict integrating {id}: {detail}")]
    MergeConflict {
        id: ItemId,
        paths: Vec<String>,
        detail: String,
    },

    #[error("validation failed for {id}: {detail}")]
    ValidationFailure { id: ItemId, detail: String },

    /// Transient fetch/publish/workspace failure.
    #[error(transparent)]
    Infrastructure(#[from] InfraError),

    #[error("storage failure: {0}")]
    Storage(String),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl ForemanError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::InvalidItem,
            Self::Cycle(_) => ErrorCode::CycleDetected,
            Self::DanglingReference { .. } => ErrorCode::DanglingReference,
            Self::InvalidTransition { .. } => ErrorCode::InvalidStateTransition,
            Self::ConcurrentModification { .. } => ErrorCode::ConcurrentModification,
            Self::NotFound(_) => ErrorCode::ItemNotFound,
            Self::ClaimConflict { .. } => ErrorCode::ClaimConflict,
            Self::BatchConflict(_) => ErrorCode::BatchConflict,
            Self::MergeConflict { .. } => ErrorCode::MergeConflict,
            Self::ValidationFailure { .. } => ErrorCode::ValidationFailed,
            Self::Infrastructure(_) => ErrorCode::InfrastructureFailure,
            Self::Storage(_) => ErrorCode::StorageFailure,
            Self::Lock(_) => ErrorCode::LockContention,
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Whether re-reading and retrying the same operation can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentModification { .. } | Self::Infrastructure(_)
        )
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub(crate) fn transition(id: &ItemId, source: InvalidTransition) -> Self {
        Self::InvalidTransition {
            id: id.clone(),
            source,
        }
    }
}

impl From<rusqlite::Error> for ForemanError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

pub type Result<T, E = ForemanError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::{ErrorCode, ForemanError};
    use crate::collab::InfraError;
    use crate::model::{Assignee, ItemId, Ownership, Status};
    use std::collections::HashSet;

    #[test]
    fn all_codes_are_unique() {
        let all = [
            ErrorCode::ConfigParseError,
            ErrorCode::ItemNotFound,
            ErrorCode::InvalidStateTransition,
            ErrorCode::CycleDetected,
            ErrorCode::DanglingReference,
            ErrorCode::InvalidItem,
            ErrorCode::ConcurrentModification,
            ErrorCode::ClaimConflict,
            ErrorCode::BatchConflict,
            ErrorCode::MergeConflict,
            ErrorCode::ValidationFailed,
            ErrorCode::InfrastructureFailure,
            ErrorCode::StorageFailure,
            ErrorCode::LockContention,
        ];

        let mut seen = HashSet::new();
        for code in all {
            assert!(seen.insert(code.code()), "duplicate code {}", code.code());
        }
    }

    #[test]
    fn code_format_is_machine_friendly() {
        let code = ErrorCode::ConcurrentModification.code();
        assert_eq!(code.len(), 5);
        assert!(code.starts_with('E'));
        assert!(code.chars().skip(1).all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn only_cas_and_infrastructure_are_retryable() {
        let id = ItemId::new_unchecked("core-1");
        let cas = ForemanError::ConcurrentModification {
            id: id.clone(),
            expected: Ownership::new(Status::Ready, Assignee::Unassigned),
            actual: Ownership::new(Status::Active, Assignee::worker("w1")),
        };
        assert!(cas.is_retryable());
        assert!(cas.to_string().contains("ready/unassigned"));

        let infra = ForemanError::from(InfraError::transient("fetch", "connection reset"));
        assert!(infra.is_retryable());
        assert_eq!(infra.code(), ErrorCode::InfrastructureFailure);

        let claim = ForemanError::ClaimConflict {
            id,
            current: Ownership::new(Status::Active, Assignee::worker("w2")),
        };
        assert!(!claim.is_retryable());
        assert!(!ForemanError::validation("empty title").is_retryable());
    }
}
