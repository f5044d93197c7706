//! Plan execution.
//!
//! [`Orchestrator::execute`] spawns one task per plan. Batches run strictly in
//! order; the ready steps of a batch run concurrently on a [`JoinSet`]. Each
//! step goes scorer → circuit breaker → budget ledger → adapter stream, with
//! one retry on the next-ranked adapter.

pub mod events;
mod step;

pub use events::{
    ExecutionEvent, FailureReason, Outcome, PlanStatus, PlanSummary, StepOutcome, StepResult,
    StepStatus,
};

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::AdapterRegistry;
use crate::adapter::profile::ProfileTuning;
use crate::breaker::{BreakerPolicy, CircuitBreaker};
use crate::budget::{BudgetLedger, BudgetSummary};
use crate::config::SwitchboardConfig;
use crate::error::Error;
use crate::plan::{Condition, Plan, PlanBuilder, RateCard, Step, StepId};
use crate::scorer::{
    RankPreferences, RankedAdapter, ReasoningPolicy, Scorer, ScoringWeights, TaskRouter,
};
use crate::util::{read, write};

use self::step::{StepRun, condition_holds};

/// Finished executions whose status stays queryable, oldest dropped first.
const FINISHED_RETENTION: usize = 256;

#[derive(Debug)]
struct ExecutionEntry {
    cancel: CancellationToken,
    status: PlanStatus,
}

#[derive(Debug, Default)]
struct Executions {
    running: HashMap<Uuid, ExecutionEntry>,
    finished: VecDeque<(Uuid, PlanStatus)>,
}

impl Executions {
    fn finished_status(&self, id: Uuid) -> Option<PlanStatus> {
        self.finished
            .iter()
            .find(|(finished, _)| *finished == id)
            .map(|(_, status)| *status)
    }
}

/// Shared state behind every clone of an [`Orchestrator`].
pub(crate) struct Inner {
    registry: AdapterRegistry,
    scorer: Scorer,
    preferences: RankPreferences,
    spend_cap: Option<SpendCap>,
    breaker: CircuitBreaker,
    ledger: BudgetLedger,
    reasoning: ReasoningPolicy,
    router: TaskRouter,
    tuning: ProfileTuning,
    default_assignee: String,
    default_timeout: Duration,
    executions: RwLock<Executions>,
}

/// Per-adapter spend above which an adapter ranks as more expensive.
#[derive(Debug, Clone, Default)]
pub struct SpendCap {
    /// Spend in the current budget window, in USD.
    pub max_usd: f64,
    /// Adapters the cap never applies to.
    pub exempt: BTreeSet<String>,
}

impl Inner {
    /// Ranked adapters for `capability` whose circuit is not open.
    fn eligible(&self, capability: &str) -> Vec<RankedAdapter> {
        self.ranked(capability, &self.preferences)
            .into_iter()
            .filter(|r| self.breaker.is_eligible(r.id()))
            .collect()
    }

    fn ranked(&self, capability: &str, base: &RankPreferences) -> Vec<RankedAdapter> {
        let pool = self.registry.profiles();
        let mut prefs = base.clone();
        if let Some(cap) = &self.spend_cap {
            prefs.over_budget.extend(
                pool.iter()
                    .filter(|p| !cap.exempt.contains(&p.id))
                    .filter(|p| self.ledger.window_spend(&p.id) > cap.max_usd)
                    .map(|p| p.id.clone()),
            );
        }
        self.scorer.rank(capability, &pool, &prefs)
    }

    fn set_status(&self, id: Uuid, status: PlanStatus) {
        if let Some(entry) = write(&self.executions).running.get_mut(&id) {
            entry.status = status;
        }
    }

    /// Drop the cancellation handle of a finished execution, keeping only
    /// its final status in a bounded history.
    fn finish(&self, id: Uuid, status: PlanStatus) {
        let mut executions = write(&self.executions);
        executions.running.remove(&id);
        executions.finished.push_back((id, status));
        while executions.finished.len() > FINISHED_RETENTION {
            executions.finished.pop_front();
        }
    }
}

impl RateCard for Inner {
    fn cheapest_rate(&self, step: &Step) -> Option<f64> {
        let capability = self.router.capability_for(&step.assignee, &step.task_text);
        self.registry
            .profiles_for(&capability)
            .into_iter()
            .filter(|p| self.breaker.is_eligible(&p.id))
            .map(|p| p.cost_per_token)
            .min_by(f64::total_cmp)
    }
}

/// Routes workflow steps to adapters and drives plan executions.
///
/// Cheap to clone; clones share the registry, breaker and ledger.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("adapters", &self.inner.registry.len())
            .field("default_assignee", &self.inner.default_assignee)
            .finish()
    }
}

/// Builder for [`Orchestrator`].
pub struct OrchestratorBuilder {
    registry: AdapterRegistry,
    scorer: Scorer,
    preferences: RankPreferences,
    spend_cap: Option<SpendCap>,
    breaker: CircuitBreaker,
    ledger: BudgetLedger,
    reasoning: ReasoningPolicy,
    router: TaskRouter,
    tuning: ProfileTuning,
    default_assignee: String,
    default_timeout: Duration,
}

impl OrchestratorBuilder {
    pub fn scoring_weights(mut self, weights: ScoringWeights) -> Self {
        self.scorer = Scorer::new(weights);
        self
    }

    /// Ranking adjustments used for every step.
    pub fn preferences(mut self, preferences: RankPreferences) -> Self {
        self.preferences = preferences;
        self
    }

    pub fn spend_cap(mut self, cap: SpendCap) -> Self {
        self.spend_cap = Some(cap);
        self
    }

    pub fn breaker_policy(mut self, policy: BreakerPolicy) -> Self {
        self.breaker = CircuitBreaker::new(policy);
        self
    }

    pub fn ledger(mut self, ledger: BudgetLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn reasoning(mut self, policy: ReasoningPolicy) -> Self {
        self.reasoning = policy;
        self
    }

    pub fn router(mut self, router: TaskRouter) -> Self {
        self.router = router;
        self
    }

    pub fn tuning(mut self, tuning: ProfileTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn default_assignee(mut self, assignee: impl Into<String>) -> Self {
        self.default_assignee = assignee.into();
        self
    }

    /// Call timeout for adapters that don't set their own.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn build(self) -> Orchestrator {
        Orchestrator {
            inner: Arc::new(Inner {
                registry: self.registry,
                scorer: self.scorer,
                preferences: self.preferences,
                spend_cap: self.spend_cap,
                breaker: self.breaker,
                ledger: self.ledger,
                reasoning: self.reasoning,
                router: self.router,
                tuning: self.tuning,
                default_assignee: self.default_assignee,
                default_timeout: self.default_timeout,
                executions: RwLock::new(Executions::default()),
            }),
        }
    }
}

/// Handle to a running plan.
///
/// Events arrive on [`next_event`](Self::next_event); the final summary is
/// also sent as [`ExecutionEvent::PlanFinished`] and returned by
/// [`wait`](Self::wait).
#[derive(Debug)]
pub struct Execution {
    id: Uuid,
    events: mpsc::UnboundedReceiver<ExecutionEvent>,
    task: JoinHandle<PlanSummary>,
    plan: Arc<Plan>,
}

impl Execution {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn next_event(&mut self) -> Option<ExecutionEvent> {
        self.events.recv().await
    }

    /// Wait for the plan to finish, discarding any unread events.
    pub async fn wait(self) -> PlanSummary {
        let Execution { id, task, plan, .. } = self;
        match task.await {
            Ok(summary) => summary,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => {
                // Runtime shutting down: nothing ran to completion.
                let steps = plan
                    .steps
                    .iter()
                    .map(|s| StepOutcome::skipped(s.id.clone(), FailureReason::Cancelled))
                    .collect();
                PlanSummary {
                    execution_id: id,
                    status: PlanStatus::Cancelled,
                    reason: Some(FailureReason::Cancelled),
                    failed_step: None,
                    total_cost: 0.0,
                    steps,
                }
            }
        }
    }

    /// Consume the handle as an event stream. The stream ends after
    /// [`ExecutionEvent::PlanFinished`].
    pub fn into_stream(self) -> UnboundedReceiverStream<ExecutionEvent> {
        UnboundedReceiverStream::new(self.events)
    }

    /// Drain every event, then return them with the summary.
    pub async fn collect(mut self) -> (Vec<ExecutionEvent>, PlanSummary) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let summary = self.wait().await;
        (events, summary)
    }
}

impl Orchestrator {
    pub fn builder(registry: AdapterRegistry) -> OrchestratorBuilder {
        OrchestratorBuilder {
            registry,
            scorer: Scorer::default(),
            preferences: RankPreferences::default(),
            spend_cap: None,
            breaker: CircuitBreaker::default(),
            ledger: BudgetLedger::new(10.0, Duration::from_secs(3600)),
            reasoning: ReasoningPolicy::default(),
            router: TaskRouter::default(),
            tuning: ProfileTuning::default(),
            default_assignee: "worker".into(),
            default_timeout: Duration::from_millis(12_000),
        }
    }

    /// Wire every component from configuration.
    pub fn from_config(config: &SwitchboardConfig, registry: AdapterRegistry) -> Self {
        let mut builder = Self::builder(registry);
        if let Some(max_usd) = config.scoring.max_adapter_spend_usd {
            builder = builder.spend_cap(SpendCap {
                max_usd,
                exempt: config.scoring.preferred_under_budget.iter().cloned().collect(),
            });
        }
        builder
            .scoring_weights(ScoringWeights::from(&config.scoring))
            .preferences(RankPreferences::from_config(&config.scoring))
            .breaker_policy(BreakerPolicy::from(&config.breaker))
            .ledger(BudgetLedger::from_config(&config.budget))
            .reasoning(ReasoningPolicy::from(&config.reasoning))
            .router(TaskRouter::new(&config.workers))
            .tuning(ProfileTuning::from(&config.scoring))
            .default_assignee(config.orchestrator.default_assignee.clone())
            .default_timeout(Duration::from_millis(config.orchestrator.default_timeout_ms))
            .build()
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.inner.registry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }

    /// Preview a workflow: parse it and estimate its cost. No side effects.
    pub fn submit(&self, text: &str, default_assignee: Option<&str>) -> Result<Plan, Error> {
        let assignee = default_assignee.unwrap_or(&self.inner.default_assignee);
        PlanBuilder::new(assignee)
            .with_rates(self.inner.as_ref())
            .build(text)
    }

    /// Adapters for `capability`, best first, ignoring circuit state.
    pub fn rank(&self, capability: &str, limit: usize) -> Vec<RankedAdapter> {
        self.rank_with(capability, limit, &self.inner.preferences)
    }

    /// Like [`rank`](Self::rank) with other local and cost preferences.
    /// The spend cap still applies.
    pub fn rank_with(
        &self,
        capability: &str,
        limit: usize,
        preferences: &RankPreferences,
    ) -> Vec<RankedAdapter> {
        let mut ranked = self.inner.ranked(capability, preferences);
        ranked.truncate(limit);
        ranked
    }

    pub fn preferences(&self) -> &RankPreferences {
        &self.inner.preferences
    }

    /// Capability a step with this assignee and text would be routed to.
    pub fn capability_for(&self, assignee: &str, task_text: &str) -> String {
        self.inner.router.capability_for(assignee, task_text)
    }

    pub fn budget_summary(&self) -> BudgetSummary {
        self.inner.ledger.summary()
    }

    /// Start executing `plan` in the background.
    pub fn execute(&self, plan: Plan) -> Execution {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        write(&self.inner.executions).running.insert(
            id,
            ExecutionEntry {
                cancel: cancel.clone(),
                status: PlanStatus::Pending,
            },
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let plan = Arc::new(plan);
        let task = tokio::spawn(run_plan(
            self.inner.clone(),
            id,
            plan.clone(),
            tx,
            cancel,
        ));

        Execution {
            id,
            events: rx,
            task,
            plan,
        }
    }

    /// Cancel a running execution. Cancelling a recently finished one is a
    /// no-op.
    pub fn cancel(&self, execution_id: Uuid) -> Result<(), Error> {
        let executions = read(&self.inner.executions);
        if let Some(entry) = executions.running.get(&execution_id) {
            tracing::info!(execution_id = %execution_id, "cancelling execution");
            entry.cancel.cancel();
            return Ok(());
        }
        executions
            .finished_status(execution_id)
            .map(|_| ())
            .ok_or(Error::UnknownExecution(execution_id))
    }

    /// Status of a running or recently finished execution.
    pub fn status(&self, execution_id: Uuid) -> Result<PlanStatus, Error> {
        let executions = read(&self.inner.executions);
        executions
            .running
            .get(&execution_id)
            .map(|e| e.status)
            .or_else(|| executions.finished_status(execution_id))
            .ok_or(Error::UnknownExecution(execution_id))
    }
}

/// Whether execution continues past a failed step: only when some dependent
/// waits on it with `IF_FAILURE`. Budget and cancellation failures always
/// stop the plan. Either way the plan ends `Failed`.
fn failure_is_handled(plan: &Plan, outcome: &StepOutcome) -> bool {
    if outcome.reason.as_ref().is_some_and(FailureReason::is_fatal) {
        return false;
    }
    plan.dependents(&outcome.step_id)
        .any(|d| d.condition == Condition::OnFailure)
}

fn failure_reason(outcome: &StepOutcome) -> FailureReason {
    outcome.reason.clone().unwrap_or(FailureReason::Internal {
        message: "step failed without a reason".into(),
    })
}

/// Split a batch into steps whose condition holds, marked `Ready`, and
/// `Skipped` outcomes for the rest.
fn resolve_readiness<'p>(
    batch: Vec<&'p Step>,
    outcomes: &HashMap<StepId, StepOutcome>,
    statuses: &mut HashMap<StepId, StepStatus>,
) -> (Vec<&'p Step>, Vec<StepOutcome>) {
    let mut ready = Vec::new();
    let mut unmet = Vec::new();
    for step in batch {
        let dependencies: Vec<&StepOutcome> = step
            .depends_on
            .iter()
            .filter_map(|d| outcomes.get(d))
            .collect();
        if condition_holds(&step.condition, &dependencies) {
            statuses.insert(step.id.clone(), StepStatus::Ready);
            ready.push(step);
        } else {
            tracing::debug!(step_id = %step.id, "condition not met, skipping");
            statuses.insert(step.id.clone(), StepStatus::Skipped);
            unmet.push(StepOutcome::skipped(
                step.id.clone(),
                FailureReason::ConditionNotMet,
            ));
        }
    }
    (ready, unmet)
}

async fn run_plan(
    inner: Arc<Inner>,
    id: Uuid,
    plan: Arc<Plan>,
    tx: mpsc::UnboundedSender<ExecutionEvent>,
    cancel: CancellationToken,
) -> PlanSummary {
    let emit = |event: ExecutionEvent| {
        let _ = tx.send(event);
    };

    inner.set_status(id, PlanStatus::Running);
    tracing::info!(
        execution_id = %id,
        steps = plan.len(),
        batches = plan.batch_count,
        "plan started"
    );
    emit(ExecutionEvent::PlanStarted {
        execution_id: id,
        steps: plan.len(),
        batch_count: plan.batch_count,
    });

    let mut statuses: HashMap<StepId, StepStatus> = plan
        .steps
        .iter()
        .map(|s| (s.id.clone(), StepStatus::Waiting))
        .collect();
    let mut outcomes: HashMap<StepId, StepOutcome> = HashMap::new();
    // The failure that stopped execution, if any.
    let mut halted_by: Option<StepId> = None;

    for (batch_index, batch) in plan.batches().into_iter().enumerate() {
        if halted_by.is_some() || cancel.is_cancelled() {
            break;
        }
        tracing::info!(execution_id = %id, batch_index, steps = batch.len(), "batch started");
        emit(ExecutionEvent::BatchStarted {
            batch_index,
            steps: batch.iter().map(|s| s.id.clone()).collect(),
        });

        let (ready, unmet) = resolve_readiness(batch, &outcomes, &mut statuses);
        for outcome in unmet {
            emit(ExecutionEvent::StepFinished {
                outcome: outcome.clone(),
            });
            outcomes.insert(outcome.step_id.clone(), outcome);
        }

        let mut join_set = JoinSet::new();
        let mut running = Vec::new();
        for step in ready {
            if cancel.is_cancelled() {
                // Never started: swept up as Skipped(Cancelled) below.
                break;
            }
            statuses.insert(step.id.clone(), StepStatus::Running);
            running.push(step.id.clone());
            join_set.spawn(
                StepRun {
                    inner: inner.clone(),
                    step: step.clone(),
                    events: tx.clone(),
                    cancel: cancel.clone(),
                }
                .run(),
            );
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(outcome) => {
                    statuses.insert(outcome.step_id.clone(), outcome.status);
                    emit(ExecutionEvent::StepFinished {
                        outcome: outcome.clone(),
                    });
                    outcomes.insert(outcome.step_id.clone(), outcome);
                }
                Err(e) => tracing::error!(execution_id = %id, error = %e, "step task failed"),
            }
        }

        // A step task that died without reporting still has to end somewhere.
        for step_id in running {
            if statuses.get(&step_id).is_some_and(|s| !s.is_terminal()) {
                let error = Error::call_failed("switchboard", "step task terminated abnormally");
                let outcome = StepOutcome::failed(step_id.clone(), &error, 0, None);
                statuses.insert(step_id.clone(), StepStatus::Failed);
                emit(ExecutionEvent::StepFinished {
                    outcome: outcome.clone(),
                });
                outcomes.insert(step_id, outcome);
            }
        }

        for outcome in plan
            .steps
            .iter()
            .filter(|s| s.batch_index == batch_index)
            .filter_map(|s| outcomes.get(&s.id))
            .filter(|o| o.status == StepStatus::Failed)
        {
            if failure_is_handled(&plan, outcome) {
                tracing::info!(
                    execution_id = %id,
                    step_id = %outcome.step_id,
                    "step failed, continuing with its IF_FAILURE dependents"
                );
            } else if halted_by.is_none() {
                tracing::warn!(
                    execution_id = %id,
                    step_id = %outcome.step_id,
                    reason = ?outcome.reason,
                    "plan failed"
                );
                halted_by = Some(outcome.step_id.clone());
            }
        }
    }

    let cancelled = cancel.is_cancelled();
    let skip_reason = match &halted_by {
        _ if cancelled => FailureReason::Cancelled,
        Some(step_id) => FailureReason::PlanFailed {
            step_id: step_id.clone(),
        },
        None => FailureReason::Cancelled,
    };
    for step in &plan.steps {
        if statuses.get(&step.id).is_some_and(|s| !s.is_terminal()) {
            let outcome = StepOutcome::skipped(step.id.clone(), skip_reason.clone());
            emit(ExecutionEvent::StepFinished {
                outcome: outcome.clone(),
            });
            outcomes.insert(step.id.clone(), outcome);
        }
    }

    let steps: Vec<StepOutcome> = plan
        .steps
        .iter()
        .filter_map(|s| outcomes.remove(&s.id))
        .collect();
    let total_cost: f64 = steps.iter().map(StepOutcome::cost).sum();

    // Any failed step fails the plan, even one whose IF_FAILURE branch ran.
    let failure = steps
        .iter()
        .find(|o| o.status == StepStatus::Failed)
        .map(|o| (o.step_id.clone(), failure_reason(o)));
    let (status, reason, failed_step) = if cancelled {
        (PlanStatus::Cancelled, Some(FailureReason::Cancelled), None)
    } else if let Some((step_id, reason)) = failure {
        (PlanStatus::Failed, Some(reason), Some(step_id))
    } else {
        (PlanStatus::Completed, None, None)
    };

    inner.finish(id, status);
    tracing::info!(execution_id = %id, status = ?status, total_cost, "plan finished");

    let summary = PlanSummary {
        execution_id: id,
        status,
        reason,
        failed_step,
        total_cost,
        steps,
    };
    emit(ExecutionEvent::PlanFinished {
        summary: summary.clone(),
    });
    summary
}
