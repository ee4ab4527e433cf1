use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::{fmt, str::FromStr};

use super::item_id::ItemId;

/// Highest (least urgent) priority value. 0 is critical, 4 is someday.
pub const MAX_PRIORITY: u8 = 4;

/// Priority assigned when the caller does not specify one.
pub const DEFAULT_PRIORITY: u8 = 2;

/// The three kinds of work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Task,
    Epic,
    Bug,
}

impl ItemType {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Epic => "epic",
            Self::Bug => "bug",
        }
    }
}

/// Lifecycle states.
///
/// ```text
/// inbox -> ready -> active -> in_progress -> review -> done
///   |        |        |           |            |
///   +--------+--------+-----------+------------+--> blocked -> ready
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Inbox,
    Ready,
    Active,
    InProgress,
    Review,
    Done,
    Blocked,
}

impl Status {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Inbox => "inbox",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::InProgress => "in_progress",
            Self::Review => "review",
            Self::Done => "done",
            Self::Blocked => "blocked",
        }
    }

    /// Every status, in lifecycle order.
    pub const ALL: [Self; 7] = [
        Self::Inbox,
        Self::Ready,
        Self::Active,
        Self::InProgress,
        Self::Review,
        Self::Done,
        Self::Blocked,
    ];

    /// Statuses from which the claim protocol may take an item.
    #[must_use]
    pub const fn is_claimable(self) -> bool {
        matches!(self, Self::Inbox | Self::Ready)
    }

    /// Statuses in which a worker owns the item.
    #[must_use]
    pub const fn is_owned(self) -> bool {
        matches!(self, Self::Active | Self::InProgress | Self::Review)
    }

    /// Validate whether a transition from self to `target` is allowed.
    ///
    /// Valid transitions:
    /// - `inbox -> ready | blocked | active` (`active` only through a claim)
    /// - `ready -> active | blocked`
    /// - `active -> in_progress | blocked`
    /// - `in_progress -> review | blocked`
    /// - `review -> done | blocked`
    /// - `blocked -> ready`
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] for no-op or unlisted transitions.
    pub fn can_transition_to(self, target: Self) -> Result<(), InvalidTransition> {
        if self == target {
            return Err(InvalidTransition {
                from: self,
                to: target,
                reason: "no-op transition is not allowed",
            });
        }

        let allowed = matches!(
            (self, target),
            (Self::Inbox, Self::Ready | Self::Blocked | Self::Active)
                | (Self::Ready, Self::Active | Self::Blocked)
                | (Self::Active, Self::InProgress | Self::Blocked)
                | (Self::InProgress, Self::Review | Self::Blocked)
                | (Self::Review, Self::Done | Self::Blocked)
                | (Self::Blocked, Self::Ready)
        );

        if allowed {
            Ok(())
        } else {
            Err(InvalidTransition {
                from: self,
                to: target,
                reason: "transition not allowed by lifecycle rules",
            })
        }
    }
}

/// Who currently owns a work item.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Assignee {
    #[default]
    Unassigned,
    Human,
    Worker(String),
}

impl Assignee {
    /// Convenience constructor for a worker identity.
    #[must_use]
    pub fn worker(id: impl Into<String>) -> Self {
        Self::Worker(id.into())
    }

    #[must_use]
    pub const fn is_unassigned(&self) -> bool {
        matches!(self, Self::Unassigned)
    }
}

/// The contended pair guarded by compare-and-swap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ownership {
    pub status: Status,
    pub assignee: Assignee,
}

impl Ownership {
    #[must_use]
    pub const fn new(status: Status, assignee: Assignee) -> Self {
        Self { status, assignee }
    }
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.status, self.assignee)
    }
}

/// Why an item sits in `blocked`. Remediation differs per cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockCause {
    /// A hard dependency is not done yet.
    Dependency,
    /// A proposed edge was rejected while moving the item out of inbox.
    GraphConflict,
    /// Squash merge into mainline hit conflicting edits.
    MergeConflict,
    /// The validation suite failed against the merged mainline.
    ValidationFailure,
    /// Fetch/publish/workspace infrastructure kept failing.
    Infrastructure,
    /// The worker reported failure or crashed.
    WorkerFailure,
    /// Administrative cancellation of a claim.
    Cancelled,
}

impl BlockCause {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Dependency => "dependency",
            Self::GraphConflict => "graph_conflict",
            Self::MergeConflict => "merge_conflict",
            Self::ValidationFailure => "validation_failure",
            Self::Infrastructure => "infrastructure",
            Self::WorkerFailure => "worker_failure",
            Self::Cancelled => "cancelled",
        }
    }

    /// Human-facing remediation advice.
    #[must_use]
    pub const fn remediation(self) -> &'static str {
        match self {
            Self::Dependency => "Wait for the listed dependencies to reach done.",
            Self::GraphConflict => "Fix the proposed parent/dependency edges and reclassify.",
            Self::MergeConflict => {
                "Rebase the workspace onto mainline, resolve conflicts, then move back to ready."
            }
            Self::ValidationFailure => "Fix the failing checks in the workspace and resubmit.",
            Self::Infrastructure => "Check remote/storage availability, then move back to ready.",
            Self::WorkerFailure => "Inspect the workspace for partial work and re-dispatch.",
            Self::Cancelled => "Partial work is preserved in the workspace; re-dispatch when ready.",
        }
    }
}

/// Diagnostic attached to a blocked item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDiagnostic {
    pub cause: BlockCause,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl BlockDiagnostic {
    #[must_use]
    pub fn new(cause: BlockCause, detail: impl Into<String>) -> Self {
        Self {
            cause,
            detail: detail.into(),
            at: Utc::now(),
        }
    }

    /// Markdown section appended to the item body.
    #[must_use]
    pub fn report(&self) -> String {
        format!(
            "\n\n## Integration report ({})\n**Blocked: {}**\n\n```\n{}\n```\n{}",
            self.at.format("%Y-%m-%d %H:%M"),
            self.cause,
            self.detail.trim_end(),
            self.cause.remediation()
        )
    }
}

/// A unit of trackable work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub status: Status,
    pub priority: u8,
    pub project: String,
    pub assignee: Assignee,
    pub parent: Option<ItemId>,
    pub depends_on: BTreeSet<ItemId>,
    pub soft_depends_on: BTreeSet<ItemId>,
    pub workspace_ref: Option<String>,
    pub block: Option<BlockDiagnostic>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// Current `(status, assignee)` pair.
    #[must_use]
    pub fn ownership(&self) -> Ownership {
        Ownership::new(self.status, self.assignee.clone())
    }

    /// Bump `updated_at`, never moving it backwards.
    pub(crate) fn touch(&mut self) {
        let now = Utc::now();
        if now > self.updated_at {
            self.updated_at = now;
        }
    }
}

/// Input for creating a work item. New items always start in `inbox`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemSpec {
    pub id: Option<String>,
    pub title: String,
    pub body: String,
    pub item_type: Option<ItemType>,
    pub priority: Option<u8>,
    pub project: String,
    pub parent: Option<ItemId>,
    pub depends_on: Vec<ItemId>,
    pub soft_depends_on: Vec<ItemId>,
}

impl ItemSpec {
    #[must_use]
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    #[must_use]
    pub const fn item_type(mut self, item_type: ItemType) -> Self {
        self.item_type = Some(item_type);
        self
    }

    #[must_use]
    pub const fn priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = project.into();
        self
    }

    #[must_use]
    pub fn parent(mut self, parent: ItemId) -> Self {
        self.parent = Some(parent);
        self
    }

    #[must_use]
    pub fn depends_on(mut self, target: ItemId) -> Self {
        self.depends_on.push(target);
        self
    }

    #[must_use]
    pub fn soft_depends_on(mut self, target: ItemId) -> Self {
        self.soft_depends_on.push(target);
        self
    }
}

/// Error returned when a state transition is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}: {reason}")]
pub struct InvalidTransition {
    pub from: Status,
    pub to: Status,
    pub reason: &'static str,
}

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for BlockCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Assignee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unassigned => f.write_str("unassigned"),
            Self::Human => f.write_str("human"),
            Self::Worker(id) => write!(f, "worker:{id}"),
        }
    }
}

fn normalize(input: &str) -> String {
    input.trim().to_ascii_lowercase()
}

impl FromStr for ItemType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "task" => Ok(Self::Task),
            "epic" => Ok(Self::Epic),
            "bug" => Ok(Self::Bug),
            _ => Err(ParseEnumError {
                expected: "type",
                got: s.to_string(),
            }),
        }
    }
}

impl FromStr for Status {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "inbox" => Ok(Self::Inbox),
            "ready" => Ok(Self::Ready),
            "active" => Ok(Self::Active),
            "in_progress" | "in-progress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            "blocked" => Ok(Self::Blocked),
            _ => Err(ParseEnumError {
                expected: "status",
                got: s.to_string(),
            }),
        }
    }
}

impl FromStr for BlockCause {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "dependency" => Ok(Self::Dependency),
            "graph_conflict" => Ok(Self::GraphConflict),
            "merge_conflict" => Ok(Self::MergeConflict),
            "validation_failure" => Ok(Self::ValidationFailure),
            "infrastructure" => Ok(Self::Infrastructure),
            "worker_failure" => Ok(Self::WorkerFailure),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(ParseEnumError {
                expected: "block cause",
                got: s.to_string(),
            }),
        }
    }
}

impl FromStr for Assignee {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed {
            "unassigned" | "" => Ok(Self::Unassigned),
            "human" => Ok(Self::Human),
            _ => match trimmed.strip_prefix("worker:") {
                Some(id) if !id.is_empty() => Ok(Self::Worker(id.to_string())),
                _ => Err(ParseEnumError {
                    expected: "assignee",
                    got: s.to_string(),
                }),
            },
        }
    }
}

impl TryFrom<String> for Assignee {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Assignee> for String {
    fn from(value: Assignee) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::{Assignee, BlockCause, BlockDiagnostic, InvalidTransition, ItemType, Status};
    use std::str::FromStr;

    #[test]
    fn enum_json_uses_wire_names() {
        assert_eq!(serde_json::to_string(&ItemType::Epic).unwrap(), "\"epic\"");
        assert_eq!(
            serde_json::to_string(&Status::InProgress).unwrap(),
            "\"in_progress\""
        );
        assert_eq!(
            serde_json::to_string(&Assignee::worker("w-3")).unwrap(),
            "\"worker:w-3\""
        );
        assert_eq!(
            serde_json::from_str::<Assignee>("\"human\"").unwrap(),
            Assignee::Human
        );
    }

    #[test]
    fn parse_rejects_unknown_values() {
        assert!(ItemType::from_str("goal").is_err());
        assert!(Status::from_str("doing").is_err());
        assert!(Assignee::from_str("worker:").is_err());
        assert!(BlockCause::from_str("flaky").is_err());
    }

    #[test]
    fn transition_table_matches_lifecycle() {
        let allowed = [
            (Status::Inbox, Status::Ready),
            (Status::Inbox, Status::Blocked),
            (Status::Inbox, Status::Active),
            (Status::Ready, Status::Active),
            (Status::Ready, Status::Blocked),
            (Status::Active, Status::InProgress),
            (Status::Active, Status::Blocked),
            (Status::InProgress, Status::Review),
            (Status::InProgress, Status::Blocked),
            (Status::Review, Status::Done),
            (Status::Review, Status::Blocked),
            (Status::Blocked, Status::Ready),
        ];

        for from in Status::ALL {
            for to in Status::ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to).is_ok(),
                    expected,
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn done_is_terminal() {
        assert!(matches!(
            Status::Done.can_transition_to(Status::Ready),
            Err(InvalidTransition {
                from: Status::Done,
                to: Status::Ready,
                ..
            })
        ));
    }

    #[test]
    fn diagnostic_report_names_cause_and_remediation() {
        let diag = BlockDiagnostic::new(BlockCause::MergeConflict, "src/lib.rs");
        let report = diag.report();
        assert!(report.contains("merge_conflict"));
        assert!(report.contains("src/lib.rs"));
        assert!(report.contains("Rebase"));
    }
}
