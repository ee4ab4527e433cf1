//! Deterministic simulation of the orchestrator.
//!
//! A [`Simulator`] builds a random work graph from a seed and runs it for a
//! number of rounds against the in-memory repository. Each round:
//!
//! 1. classifies whatever is still in `inbox` (the classifier flakes),
//! 2. races several workers on `claim_next`,
//! 3. dispatches an independent batch through the dispatcher,
//! 4. integrates everything in `review` with injected infrastructure faults,
//! 5. returns a share of blocked items to `ready`.
//!
//! The [`oracle`] checks claim exclusivity, acyclicity, readiness, that no
//! work is lost, and that mainline equals the replay of merged edits.
//!
//! # Conventions
//!
//! - **Errors**: `anyhow::Result` for return types.
//! - **Logging**: `tracing` macros.

pub mod campaign;
pub mod oracle;
pub mod rng;
pub mod worker;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Barrier;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use foreman_core::ForemanError;
use foreman_core::claim::{self, RetryPolicy};
use foreman_core::collab::{
    Classification, InfraError, InfraResult, ValidationReport, WorkspaceProvider,
};
use foreman_core::config::{DispatchConfig, IntegrationConfig};
use foreman_core::dispatch::{
    Assignment, Dispatcher, DrainHandle, ResourceClaims, WorkOutcome, select_independent,
};
use foreman_core::intake;
use foreman_core::integrate::{IntegrationOutcome, IntegrationPipeline};
use foreman_core::memory::MemoryRepository;
use foreman_core::model::item::MAX_PRIORITY;
use foreman_core::model::{Assignee, BlockCause, ItemId, ItemSpec, ItemType, Status, WorkItem};
use foreman_core::readiness;
use foreman_core::store::{GraphStore, ItemFilter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::oracle::{ClaimRace, MergeLedger, OracleResult};
use crate::rng::DeterministicRng;
use crate::worker::{BROKEN_MARKER, Finish, SHARED_FILE, WorkPlan};

/// Project every simulated item is classified into.
pub const PROJECT: &str = "sim";

/// Integration steps that may be made to fail transiently.
const FAULTY_OPERATIONS: [&str; 6] = ["sync", "diff", "merge", "validate", "commit", "publish"];

// ── Configuration ────────────────────────────────────────────────────────────

/// Fault and behaviour rates, all in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultProfile {
    pub worker_failure_percent: u8,
    pub cancel_percent: u8,
    /// Edits that touch the shared file instead of the item's own.
    pub shared_file_percent: u8,
    /// Edits that the validation suite rejects.
    pub validation_failure_percent: u8,
    /// Items whose integration gets a burst of transient failures.
    pub infra_fault_percent: u8,
    pub classifier_flake_percent: u8,
    /// Proposed dependencies that may point at a later item.
    pub backward_dependency_percent: u8,
    pub drain_percent: u8,
    /// Blocked items an operator returns to `ready` each round.
    pub recovery_percent: u8,
}

impl Default for FaultProfile {
    fn default() -> Self {
        Self {
            worker_failure_percent: 10,
            cancel_percent: 5,
            shared_file_percent: 25,
            validation_failure_percent: 10,
            infra_fault_percent: 15,
            classifier_flake_percent: 10,
            backward_dependency_percent: 15,
            drain_percent: 5,
            recovery_percent: 60,
        }
    }
}

impl FaultProfile {
    fn rates(&self) -> [(&'static str, u8); 9] {
        [
            ("worker_failure_percent", self.worker_failure_percent),
            ("cancel_percent", self.cancel_percent),
            ("shared_file_percent", self.shared_file_percent),
            ("validation_failure_percent", self.validation_failure_percent),
            ("infra_fault_percent", self.infra_fault_percent),
            ("classifier_flake_percent", self.classifier_flake_percent),
            ("backward_dependency_percent", self.backward_dependency_percent),
            ("drain_percent", self.drain_percent),
            ("recovery_percent", self.recovery_percent),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    pub items: usize,
    /// Workers racing on `claim_next` each round.
    pub racers: usize,
    pub rounds: u64,
    /// Upper bound on a dispatched batch.
    pub max_batch: usize,
    pub faults: FaultProfile,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            items: 24,
            racers: 4,
            rounds: 12,
            max_batch: 10,
            faults: FaultProfile::default(),
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error for zero-sized settings or a rate above 100.
    pub fn validate(&self) -> Result<()> {
        if self.items == 0 || self.items > 999 {
            bail!("items must be in 1..=999, got {}", self.items);
        }
        if self.racers == 0 {
            bail!("racers must be > 0");
        }
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        if self.max_batch == 0 {
            bail!("max_batch must be > 0");
        }
        for (name, rate) in self.faults.rates() {
            if rate > 100 {
                bail!("{name} must be <= 100, got {rate}");
            }
        }
        Ok(())
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

/// One observable step, free of thread-dependent detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceEvent {
    pub round: u64,
    pub item: ItemId,
    pub event: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationResult {
    pub seed: u64,
    pub trace: Vec<TraceEvent>,
    /// Item count per status after the last round.
    pub final_status: BTreeMap<Status, usize>,
    pub merged: usize,
    /// A merge conflict, rejected edge, or infrastructure block happened.
    pub interesting_state_reached: bool,
    pub oracle: OracleResult,
}

// ── Simulator ────────────────────────────────────────────────────────────────

pub struct Simulator {
    config: SimulationConfig,
    store: GraphStore,
    repo: MemoryRepository,
    proposals: BTreeMap<ItemId, Classification>,
    /// Latest submitted edit per item.
    writes: BTreeMap<ItemId, (String, String)>,
    ledger: MergeLedger,
    trace: Vec<TraceEvent>,
    interesting: bool,
}

impl Simulator {
    /// Build the initial graph: every item in `inbox`, with a classifier
    /// proposal drawn from the seed.
    ///
    /// # Errors
    ///
    /// Invalid config, or a store error while creating items.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let store = GraphStore::new();
        let repo = MemoryRepository::new();
        repo.seed_mainline(SHARED_FILE, "0");
        repo.set_validator(|files| {
            match files.iter().find(|(_, content)| content.contains(BROKEN_MARKER)) {
                Some((path, _)) => {
                    ValidationReport::fail("1 test failed", vec![format!("{path}: broken edit")])
                }
                None => ValidationReport::pass(),
            }
        });

        let ids: Vec<ItemId> = (0..config.items)
            .map(|n| ItemId::new_unchecked(format!("sim-{n:03}")))
            .collect();
        for (n, id) in ids.iter().enumerate() {
            store
                .create(ItemSpec::new(format!("item {n:03}")).id(id.as_str()))
                .with_context(|| format!("creating {id}"))?;
        }

        let mut rng = DeterministicRng::new(config.seed);
        let proposals = ids
            .iter()
            .enumerate()
            .map(|(n, id)| (id.clone(), propose(&mut rng, &ids, n, &config.faults)))
            .collect();

        Ok(Self {
            ledger: MergeLedger {
                base: repo.mainline(),
                ..MergeLedger::default()
            },
            config,
            store,
            repo,
            proposals,
            writes: BTreeMap::new(),
            trace: Vec::new(),
            interesting: false,
        })
    }

    /// Run every round and check the invariants after each.
    ///
    /// # Errors
    ///
    /// A core operation failed in a way the simulated protocol never
    /// expects. Invariant violations are reported in the result instead.
    pub fn run(&mut self) -> Result<SimulationResult> {
        let mut verdict = OracleResult::pass();
        for round in 0..self.config.rounds {
            self.intake(round)?;

            let race = self.claim_race()?;
            verdict = verdict.merge(oracle::check_claim_exclusivity(round, &race, &self.store));
            self.work_race(round, &race)?;

            self.dispatch(round)?;
            self.integrate(round)?;
            self.recover(round)?;

            verdict = verdict.merge(oracle::check_round(
                round,
                &self.store,
                &self.repo,
                &self.ledger,
            ));
            debug!(round, revision = self.store.revision(), "round finished");
        }

        let mut final_status: BTreeMap<Status, usize> = BTreeMap::new();
        for item in self.store.list(&ItemFilter::default()) {
            *final_status.entry(item.status).or_default() += 1;
        }
        info!(
            seed = self.config.seed,
            merged = self.ledger.merged.len(),
            violations = verdict.violations.len(),
            "simulation finished"
        );

        Ok(SimulationResult {
            seed: self.config.seed,
            trace: self.trace.clone(),
            final_status,
            merged: self.ledger.merged.len(),
            interesting_state_reached: self.interesting,
            oracle: verdict,
        })
    }

    fn record(&mut self, round: u64, mut events: Vec<(ItemId, String)>) {
        events.sort();
        self.trace.extend(events.into_iter().map(|(item, event)| TraceEvent {
            round,
            item,
            event,
        }));
    }

    fn plan(&self, item: &ItemId, round: u64) -> WorkPlan {
        worker::plan_work(self.config.seed, item, round, &self.config.faults)
    }

    // ── Phases ───────────────────────────────────────────────────────────────

    fn intake(&mut self, round: u64) -> Result<()> {
        let seed = self.config.seed;
        let flake = self.config.faults.classifier_flake_percent;
        let proposals = &self.proposals;
        let classifier = |item: &WorkItem| -> InfraResult<Classification> {
            let mut rng = DeterministicRng::for_key(seed, &format!("{}/classify", item.id), round);
            if rng.hit_rate_percent(flake) {
                return Err(InfraError::transient("classify", "simulated outage"));
            }
            proposals
                .get(&item.id)
                .cloned()
                .ok_or_else(|| InfraError::permanent("classify", "no proposal"))
        };

        let mut events = Vec::new();
        for item in self.store.list(&ItemFilter::default().status(Status::Inbox)) {
            match intake::classify(&self.store, item.id.as_str(), &classifier) {
                Ok(outcome) => {
                    if !outcome.rejected.is_empty() {
                        self.interesting = true;
                    }
                    events.push((item.id, format!("classified:{}", outcome.item.status)));
                }
                Err(err) if err.is_retryable() => {
                    events.push((item.id, "classify_retry".to_string()));
                }
                Err(err) => return Err(err).with_context(|| format!("classifying {}", item.id)),
            }
        }
        self.record(round, events);
        Ok(())
    }

    fn claim_race(&self) -> Result<ClaimRace> {
        let barrier = Barrier::new(self.config.racers);
        let store = &self.store;
        let outcomes = thread::scope(|scope| {
            let handles: Vec<_> = (0..self.config.racers)
                .map(|n| {
                    let barrier = &barrier;
                    scope.spawn(move || {
                        let worker = Assignee::worker(format!("racer-{n}"));
                        barrier.wait();
                        let claimed = claim::claim_next(store, &worker, Some(PROJECT), race_policy());
                        (worker, claimed)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().map_err(|_| anyhow!("claim racer panicked")))
                .collect::<Result<Vec<_>>>()
        })?;

        let mut race = ClaimRace::default();
        for (worker, claimed) in outcomes {
            let claimed = claimed.with_context(|| format!("{worker} claim_next"))?;
            race.results.push((worker, claimed.map(|item| item.id)));
        }
        Ok(race)
    }

    fn work_race(&mut self, round: u64, race: &ClaimRace) -> Result<()> {
        let jobs: Vec<(Assignee, ItemId, WorkPlan)> = race
            .results
            .iter()
            .filter_map(|(worker, claimed)| {
                let item = claimed.as_ref()?;
                Some((worker.clone(), item.clone(), self.plan(item, round)))
            })
            .collect();

        let (store, repo) = (&self.store, &self.repo);
        let finished = thread::scope(|scope| {
            let handles: Vec<_> = jobs
                .iter()
                .map(|(racer, item, plan)| {
                    scope.spawn(move || worker::work_claimed(store, repo, item, racer, plan))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| match handle.join() {
                    Ok(finished) => finished,
                    Err(_) => Err(anyhow!("racing worker panicked")),
                })
                .collect::<Result<Vec<Finish>>>()
        })?;

        let mut events = Vec::new();
        for ((_, item, plan), finish) in jobs.into_iter().zip(finished) {
            let event = match finish {
                Finish::Submitted => "submitted",
                Finish::Failed => "failed",
                Finish::Cancelled => "cancelled",
            };
            events.push((item.clone(), format!("raced:{event}")));
            if let (Finish::Submitted, WorkPlan::Edit { path, content }) = (finish, plan) {
                self.writes.insert(item, (path, content));
            }
        }
        self.record(round, events);
        Ok(())
    }

    fn dispatch(&mut self, round: u64) -> Result<()> {
        let mut rng = DeterministicRng::for_key(self.config.seed, "dispatch", round);
        let limit = rng.index(self.config.max_batch) + 1;

        let view = self.store.snapshot();
        let plans: BTreeMap<ItemId, WorkPlan> = readiness::ready_queue(&view, Some(PROJECT))
            .into_iter()
            .map(|entry| {
                let plan = self.plan(&entry.id, round);
                (entry.id, plan)
            })
            .collect();
        let mut resources = ResourceClaims::new();
        for (id, plan) in &plans {
            if let Some(path) = plan.path() {
                resources.claim(id, path);
            }
        }
        let batch = select_independent(&view, Some(PROJECT), &resources, limit);
        if batch.is_empty() {
            return Ok(());
        }

        let config = DispatchConfig {
            worker_prefix: format!("sim-r{round}"),
            ..DispatchConfig::default()
        };
        let dispatcher = Dispatcher::new(&self.store, &self.repo, config).with_retry(race_policy());
        let plan = dispatcher
            .dispatch(&batch, &resources)
            .with_context(|| format!("dispatching {} independent items", batch.len()))?;
        debug!(round, mode = ?plan.mode, len = plan.len(), "batch planned");

        let drain = DrainHandle::new();
        if rng.hit_rate_percent(self.config.faults.drain_percent) {
            drain.request();
        }
        let (store, repo) = (&self.store, &self.repo);
        let executor = |assignment: &Assignment| -> WorkOutcome {
            plans.get(&assignment.item_id).map_or_else(
                || WorkOutcome::Failed("no plan".to_string()),
                |plan| worker::perform(store, repo, assignment, plan),
            )
        };
        let report = dispatcher.run(plan, &executor, &drain);

        let mut events = Vec::new();
        for (bucket, ids) in [
            ("submitted", &report.submitted),
            ("failed", &report.failed),
            ("released", &report.released),
            ("interrupted", &report.interrupted),
        ] {
            events.extend(ids.iter().map(|id| (id.clone(), format!("dispatched:{bucket}"))));
        }
        for id in &report.submitted {
            if let Some(WorkPlan::Edit { path, content }) = plans.get(id) {
                self.writes.insert(id.clone(), (path.clone(), content.clone()));
            }
        }
        self.record(round, events);
        Ok(())
    }

    fn integrate(&mut self, round: u64) -> Result<()> {
        let config = IntegrationConfig {
            retry_backoff_ms: 0,
            ..IntegrationConfig::default()
        };
        let pipeline = IntegrationPipeline::new(&self.store, &self.repo, &self.repo, &self.repo, config);

        let mut events = Vec::new();
        for item in self.store.list(&ItemFilter::default().status(Status::Review)) {
            let id = item.id;
            let mut rng = DeterministicRng::for_key(self.config.seed, &format!("{id}/integrate"), round);
            let fault = rng
                .hit_rate_percent(self.config.faults.infra_fault_percent)
                .then(|| {
                    let operation = FAULTY_OPERATIONS[rng.index(FAULTY_OPERATIONS.len())];
                    let times = u32::try_from(rng.next_bounded(5)).unwrap_or(0) + 1;
                    (operation, times)
                });
            if let Some((operation, times)) = fault {
                self.repo.fail_next(operation, times);
            }

            let outcome = pipeline
                .integrate(id.as_str())
                .with_context(|| format!("integrating {id}"))?;
            if let Some((operation, _)) = fault {
                self.repo.fail_next(operation, 0);
            }

            let event = match &outcome {
                IntegrationOutcome::Merged { .. } => {
                    let (path, content) = self
                        .writes
                        .get(&id)
                        .cloned()
                        .ok_or_else(|| anyhow!("{id} merged without a recorded edit"))?;
                    self.ledger.merged.push((id.clone(), path, content));
                    "merged".to_string()
                }
                IntegrationOutcome::NoChanges => {
                    self.ledger.no_changes.insert(id.clone());
                    "no_changes".to_string()
                }
                IntegrationOutcome::AlreadyDone => "already_done".to_string(),
                IntegrationOutcome::Blocked { cause, .. } => {
                    if matches!(cause, BlockCause::MergeConflict | BlockCause::Infrastructure) {
                        self.interesting = true;
                    }
                    format!("blocked:{cause}")
                }
            };
            events.push((id, event));
        }
        self.record(round, events);
        Ok(())
    }

    /// Operator pass: discard the failed attempt's workspace and return the
    /// item to `ready`. Items whose dependencies are still open stay put.
    fn recover(&mut self, round: u64) -> Result<()> {
        let mut events = Vec::new();
        for item in self.store.list(&ItemFilter::default().status(Status::Blocked)) {
            if item.block.as_ref().is_some_and(|b| b.cause == BlockCause::Dependency) {
                continue;
            }
            let mut rng = DeterministicRng::for_key(self.config.seed, &format!("{}/recover", item.id), round);
            if !rng.hit_rate_percent(self.config.faults.recovery_percent) {
                continue;
            }
            let id = item.id.as_str();
            if let Some(workspace) = &item.workspace_ref {
                if let Err(err) = self.repo.destroy(workspace) {
                    debug!(item_id = id, error = %err, "stale workspace kept");
                }
                self.store.set_workspace_ref(id, None)?;
            }
            match self.store.update_status(id, Status::Ready, Status::Blocked) {
                Ok(_) => events.push((item.id.clone(), "recovered".to_string())),
                Err(ForemanError::InvalidTransition { .. }) => {}
                Err(err) => return Err(err).with_context(|| format!("recovering {id}")),
            }
        }
        self.record(round, events);
        Ok(())
    }
}

const fn race_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    }
}

/// Classifier proposal for item `n`: a priority, an occasional parent, and
/// up to two hard dependencies, usually on earlier items.
fn propose(
    rng: &mut DeterministicRng,
    ids: &[ItemId],
    n: usize,
    faults: &FaultProfile,
) -> Classification {
    let priority = u8::try_from(rng.next_bounded(u64::from(MAX_PRIORITY) + 1)).unwrap_or(0);
    let parent = (n > 0 && rng.hit_rate_percent(10)).then(|| ids[rng.index(n)].clone());

    let mut depends_on = BTreeSet::new();
    for _ in 0..rng.next_bounded(3) {
        let target = if rng.hit_rate_percent(faults.backward_dependency_percent) {
            rng.index(ids.len())
        } else if n > 0 {
            rng.index(n)
        } else {
            continue;
        };
        if target != n {
            depends_on.insert(ids[target].clone());
        }
    }

    Classification {
        project: PROJECT.to_string(),
        priority,
        item_type: ItemType::Task,
        parent,
        depends_on: depends_on.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            items: 12,
            rounds: 8,
            ..SimulationConfig::default()
        }
    }

    #[test]
    fn default_run_passes_the_oracle() {
        let result = Simulator::new(SimulationConfig::default()).unwrap().run().unwrap();
        assert!(result.oracle.passed, "{:#?}", result.oracle.violations);
        assert!(!result.trace.is_empty());
    }

    #[test]
    fn same_seed_same_outcome() {
        let a = Simulator::new(small(42)).unwrap().run().unwrap();
        let b = Simulator::new(small(42)).unwrap().run().unwrap();
        assert_eq!(a.trace, b.trace);
        assert_eq!(a.final_status, b.final_status);
        assert_eq!(a.merged, b.merged);
    }

    #[test]
    fn calm_run_finishes_everything() {
        let config = SimulationConfig {
            seed: 5,
            items: 10,
            rounds: 20,
            faults: FaultProfile {
                worker_failure_percent: 0,
                cancel_percent: 0,
                shared_file_percent: 0,
                validation_failure_percent: 0,
                infra_fault_percent: 0,
                classifier_flake_percent: 0,
                backward_dependency_percent: 0,
                drain_percent: 0,
                recovery_percent: 100,
            },
            ..SimulationConfig::default()
        };
        let result = Simulator::new(config).unwrap().run().unwrap();
        assert!(result.oracle.passed, "{:#?}", result.oracle.violations);
        assert_eq!(result.final_status.get(&Status::Done), Some(&10));
        assert_eq!(result.merged, 10);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = SimulationConfig {
            racers: 0,
            ..SimulationConfig::default()
        };
        assert!(Simulator::new(config).is_err());

        let mut config = SimulationConfig::default();
        config.faults.drain_percent = 101;
        assert!(Simulator::new(config).is_err());
    }
}
