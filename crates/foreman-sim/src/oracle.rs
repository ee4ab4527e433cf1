use std::collections::{BTreeMap, BTreeSet};

use foreman_core::graph::GraphView;
use foreman_core::graph::cycles::has_cycles;
use foreman_core::memory::{Files, MemoryRepository};
use foreman_core::model::{Assignee, ItemId, Status};
use foreman_core::store::GraphStore;
use serde::Serialize;

// ── Core result types ─────────────────────────────────────────────────────────

/// Oracle result for an invariant check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OracleResult {
    /// `true` iff no violations were found.
    pub passed: bool,
    pub violations: Vec<InvariantViolation>,
}

impl OracleResult {
    pub(crate) fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    fn from_violations(violations: Vec<InvariantViolation>) -> Self {
        Self {
            passed: violations.is_empty(),
            violations,
        }
    }

    /// Merge another result into this one (failures accumulate).
    #[must_use]
    pub(crate) fn merge(mut self, other: Self) -> Self {
        if !other.passed {
            self.passed = false;
            self.violations.extend(other.violations);
        }
        self
    }
}

// ── Invariant violation diagnostics ──────────────────────────────────────────

/// Diagnostic information for a single failed invariant check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "invariant", rename_all = "snake_case")]
pub enum InvariantViolation {
    /// More than one racing worker came back owning the same item.
    DoubleClaim {
        round: u64,
        item: ItemId,
        claimants: Vec<String>,
    },

    /// A claim returned success but the store records another owner.
    ClaimNotRecorded {
        round: u64,
        item: ItemId,
        claimant: String,
        recorded: String,
        status: Status,
    },

    /// The accepted edge set contains a cycle.
    Cycle { round: u64 },

    /// The cached ready set disagrees with the definition evaluated over a
    /// snapshot.
    Readiness {
        round: u64,
        /// Ready by definition but absent from the ready set.
        missing: Vec<ItemId>,
        /// In the ready set but not ready by definition.
        unexpected: Vec<ItemId>,
    },

    /// Work was left owned by a worker after the round finished.
    LostWork {
        round: u64,
        item: ItemId,
        status: Status,
    },

    /// An item reached `done` without being integrated.
    UnrecordedDone { round: u64, item: ItemId },

    /// The same item was merged twice.
    DuplicateMerge { round: u64, item: ItemId },

    /// Mainline differs from the replay of every merged item's edit.
    MainlineDivergence {
        round: u64,
        path: String,
        expected: Option<String>,
        actual: Option<String>,
    },

    /// The published mainline differs from the local one after a round.
    Unpublished { round: u64, differing_paths: Vec<String> },
}

// ── Observations ─────────────────────────────────────────────────────────────

/// Results of one concurrent claim race: each worker and what it got.
#[derive(Debug, Clone, Default)]
pub struct ClaimRace {
    pub results: Vec<(Assignee, Option<ItemId>)>,
}

/// What the integration pipeline accepted, in merge order.
#[derive(Debug, Clone, Default)]
pub struct MergeLedger {
    /// Mainline before any item was merged.
    pub base: Files,
    /// `(item, path, content)` for every `Merged` outcome.
    pub merged: Vec<(ItemId, String, String)>,
    /// Items that reached `done` through the no-op path.
    pub no_changes: BTreeSet<ItemId>,
}

impl MergeLedger {
    /// Mainline expected from replaying the merged edits over the base.
    #[must_use]
    pub fn replay(&self) -> Files {
        let mut files = self.base.clone();
        for (_, path, content) in &self.merged {
            files.insert(path.clone(), content.clone());
        }
        files
    }
}

// ── Checkers ─────────────────────────────────────────────────────────────────

/// At most one winner per item, and every winner is the recorded owner.
///
/// Run right after the race, before any winner starts working.
#[must_use]
pub fn check_claim_exclusivity(round: u64, race: &ClaimRace, store: &GraphStore) -> OracleResult {
    let mut by_item: BTreeMap<&ItemId, Vec<&Assignee>> = BTreeMap::new();
    for (worker, claimed) in &race.results {
        if let Some(item) = claimed {
            by_item.entry(item).or_default().push(worker);
        }
    }

    let mut violations = Vec::new();
    for (item, claimants) in by_item {
        if claimants.len() > 1 {
            violations.push(InvariantViolation::DoubleClaim {
                round,
                item: item.clone(),
                claimants: claimants.iter().map(ToString::to_string).collect(),
            });
            continue;
        }
        let Ok(current) = store.get(item.as_str()) else {
            continue;
        };
        if current.assignee != *claimants[0] || current.status != Status::Active {
            violations.push(InvariantViolation::ClaimNotRecorded {
                round,
                item: item.clone(),
                claimant: claimants[0].to_string(),
                recorded: current.assignee.to_string(),
                status: current.status,
            });
        }
    }
    OracleResult::from_violations(violations)
}

#[must_use]
pub fn check_acyclic(round: u64, view: &GraphView) -> OracleResult {
    let nodes = view.items().map(|item| item.id.clone());
    if has_cycles(view.edges(), nodes) {
        OracleResult::from_violations(vec![InvariantViolation::Cycle { round }])
    } else {
        OracleResult::pass()
    }
}

/// The store's ready set equals `{inbox, ready} ∩ all-hard-deps-done`.
#[must_use]
pub fn check_readiness(round: u64, store: &GraphStore) -> OracleResult {
    let view = store.snapshot();
    let expected: BTreeSet<ItemId> = view
        .items()
        .filter(|item| matches!(item.status, Status::Inbox | Status::Ready))
        .filter(|item| {
            item.depends_on
                .iter()
                .all(|dep| view.status(dep.as_str()) == Some(Status::Done))
        })
        .map(|item| item.id.clone())
        .collect();
    let actual = store.ready_set().ids();

    if expected == actual {
        return OracleResult::pass();
    }
    OracleResult::from_violations(vec![InvariantViolation::Readiness {
        round,
        missing: expected.difference(&actual).cloned().collect(),
        unexpected: actual.difference(&expected).cloned().collect(),
    }])
}

/// Nothing is left owned after a round, and every `done` item went through
/// the pipeline exactly once.
#[must_use]
pub fn check_no_lost_work(round: u64, view: &GraphView, ledger: &MergeLedger) -> OracleResult {
    let mut violations = Vec::new();
    let mut merged: BTreeSet<&ItemId> = BTreeSet::new();
    for (item, _, _) in &ledger.merged {
        if !merged.insert(item) {
            violations.push(InvariantViolation::DuplicateMerge {
                round,
                item: item.clone(),
            });
        }
    }

    for item in view.items() {
        match item.status {
            Status::Active | Status::InProgress => violations.push(InvariantViolation::LostWork {
                round,
                item: item.id.clone(),
                status: item.status,
            }),
            Status::Done if !merged.contains(&item.id) && !ledger.no_changes.contains(&item.id) => {
                violations.push(InvariantViolation::UnrecordedDone {
                    round,
                    item: item.id.clone(),
                });
            }
            _ => {}
        }
    }
    OracleResult::from_violations(violations)
}

/// Local and published mainline both equal the ledger replay.
#[must_use]
pub fn check_mainline(round: u64, repo: &MemoryRepository, ledger: &MergeLedger) -> OracleResult {
    let expected = ledger.replay();
    let actual = repo.mainline();

    let paths: BTreeSet<&String> = expected.keys().chain(actual.keys()).collect();
    let mut violations: Vec<InvariantViolation> = paths
        .into_iter()
        .filter(|path| expected.get(*path) != actual.get(*path))
        .map(|path| InvariantViolation::MainlineDivergence {
            round,
            path: path.clone(),
            expected: expected.get(path).cloned(),
            actual: actual.get(path).cloned(),
        })
        .collect();

    let published = repo.published();
    if published != actual {
        let differing: BTreeSet<&String> = published
            .keys()
            .chain(actual.keys())
            .filter(|path| published.get(*path) != actual.get(*path))
            .collect();
        violations.push(InvariantViolation::Unpublished {
            round,
            differing_paths: differing.into_iter().cloned().collect(),
        });
    }
    OracleResult::from_violations(violations)
}

/// Every end-of-round check.
#[must_use]
pub fn check_round(
    round: u64,
    store: &GraphStore,
    repo: &MemoryRepository,
    ledger: &MergeLedger,
) -> OracleResult {
    let view = store.snapshot();
    check_acyclic(round, &view)
        .merge(check_readiness(round, store))
        .merge(check_no_lost_work(round, &view, ledger))
        .merge(check_mainline(round, repo, ledger))
}
