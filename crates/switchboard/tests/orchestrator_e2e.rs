//! End-to-end plan execution against scripted adapters.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use switchboard::{
    AdapterFuture, AdapterRegistry, AdapterResponse, AdapterSeed, BackendAdapter, BudgetLedger,
    CallHints, CircuitState, Condition, EchoAdapter, Error, ExecutionEvent, FailureReason,
    Orchestrator, PlanStatus, StepId, StepStatus,
};

/// Adapter whose outcome is flipped at runtime.
struct ScriptedAdapter {
    id: String,
    capabilities: Vec<String>,
    fail: AtomicBool,
    /// Fail only prompts containing this text.
    fail_on: Option<&'static str>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedAdapter {
    fn new(id: &str) -> Self {
        Self {
            id: id.into(),
            capabilities: vec!["chat".into()],
            fail: AtomicBool::new(false),
            fail_on: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    fn failing_on(mut self, text: &'static str) -> Self {
        self.fail_on = Some(text);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl BackendAdapter for ScriptedAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> Option<&str> {
        Some("scripted-1")
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    fn call<'a>(&'a self, prompt: &'a str, _hints: &'a CallHints) -> AdapterFuture<'a> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let scripted = self.fail_on.is_some_and(|text| prompt.contains(text));
            if scripted || self.fail.load(Ordering::SeqCst) {
                return Err(Error::AdapterCallFailed {
                    adapter: self.id.clone(),
                    message: "scripted failure".into(),
                });
            }
            Ok(AdapterResponse {
                text: format!("done: {prompt}"),
                token_count: 10,
                cost: 0.01,
            })
        })
    }
}

fn seed(cost_per_token: f64) -> AdapterSeed {
    AdapterSeed {
        cost_per_token,
        ..Default::default()
    }
}

fn single(adapter: Arc<dyn BackendAdapter>, cost_per_token: f64) -> AdapterRegistry {
    AdapterRegistry::builder()
        .register(adapter, seed(cost_per_token))
        .build()
        .unwrap()
}

#[tokio::test]
async fn sequential_workflow_runs_in_order() {
    let registry = single(
        Arc::new(EchoAdapter::new("echo", vec!["chat".into(), "code".into()], 0.001)),
        0.001,
    );
    let orchestrator = Orchestrator::builder(registry).build();

    let plan = orchestrator
        .submit(
            "docs-writer: document this code THEN code-writer: write a unit test",
            None,
        )
        .unwrap();
    assert_eq!(plan.len(), 2);
    assert_eq!(plan.steps[0].batch_index, 0);
    assert!(plan.steps[0].depends_on.is_empty());
    assert_eq!(plan.steps[1].batch_index, 1);
    assert_eq!(plan.steps[1].depends_on, vec![StepId::at(1)]);
    assert_eq!(plan.max_parallelism, 1);
    assert!(plan.estimated_cost.is_some());

    let (events, summary) = orchestrator.execute(plan).collect().await;
    assert_eq!(summary.status, PlanStatus::Completed);
    assert!(summary.reason.is_none());

    let finished: Vec<&StepId> = events
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::StepFinished { outcome } => Some(&outcome.step_id),
            _ => None,
        })
        .collect();
    assert_eq!(finished, vec![&StepId::at(1), &StepId::at(2)]);
    assert!(matches!(events.first(), Some(ExecutionEvent::PlanStarted { .. })));
    assert!(matches!(events.last(), Some(ExecutionEvent::PlanFinished { .. })));

    let budget = orchestrator.budget_summary();
    assert!((budget.total - summary.total_cost).abs() < 1e-12);
    assert_eq!(budget.total, budget.by_adapter.values().sum::<f64>());
}

#[tokio::test]
async fn parallel_workflow_streams_chunks_per_step() {
    let registry = single(
        Arc::new(EchoAdapter::new("echo", vec!["chat".into()], 0.001).with_chunk_chars(3)),
        0.001,
    );
    let orchestrator = Orchestrator::builder(registry).build();

    let plan = orchestrator.submit("task1 AND task2 AND task3", Some("worker")).unwrap();
    assert_eq!(plan.len(), 3);
    assert_eq!(plan.max_parallelism, 3);
    for step in &plan.steps {
        assert_eq!(step.batch_index, 0);
        assert!(step.depends_on.is_empty());
        assert_eq!(step.assignee, "worker");
    }

    let (events, summary) = orchestrator.execute(plan).collect().await;
    assert_eq!(summary.status, PlanStatus::Completed);

    let mut streamed: HashMap<StepId, String> = HashMap::new();
    for event in &events {
        if let ExecutionEvent::Chunk { step_id, text } = event {
            streamed.entry(step_id.clone()).or_default().push_str(text);
        }
    }
    for outcome in &summary.steps {
        assert_eq!(outcome.status, StepStatus::Done);
        assert_eq!(
            streamed.get(&outcome.step_id).map(String::as_str),
            outcome.text()
        );
    }
}

#[tokio::test]
async fn failed_dependency_skips_success_branch() {
    let adapter = Arc::new(ScriptedAdapter::new("scripted").failing());
    let orchestrator = Orchestrator::builder(single(adapter.clone(), 0.001)).build();

    let plan = orchestrator.submit("build THEN test IF_SUCCESS", None).unwrap();
    assert_eq!(plan.steps[1].condition, Condition::OnSuccess);
    assert_eq!(plan.steps[1].depends_on, vec![StepId::at(1)]);

    let summary = orchestrator.execute(plan).wait().await;
    assert_eq!(summary.status, PlanStatus::Failed);
    assert_eq!(summary.failed_step, Some(StepId::at(1)));
    assert!(matches!(
        summary.reason,
        Some(FailureReason::AdapterCallFailed { .. })
    ));

    let step2 = summary.step(&StepId::at(2)).unwrap();
    assert_eq!(step2.status, StepStatus::Skipped);
    assert_eq!(step2.cost(), 0.0);
    assert_eq!(adapter.calls(), 1, "step2 must not call any adapter");
    assert_eq!(summary.total_cost, 0.0);
}

#[tokio::test]
async fn contains_condition_checks_dependency_text() {
    let registry = single(
        Arc::new(EchoAdapter::new("echo", vec!["chat".into()], 0.001)),
        0.001,
    );
    let orchestrator = Orchestrator::builder(registry).build();

    let plan = orchestrator
        .submit(
            "check status THEN deploy IF_CONTAINS(\"status\") AND rollback IF_CONTAINS(\"error\")",
            None,
        )
        .unwrap();
    let summary = orchestrator.execute(plan).wait().await;

    assert_eq!(summary.status, PlanStatus::Completed);
    assert_eq!(summary.steps[1].status, StepStatus::Done);
    assert_eq!(summary.steps[2].status, StepStatus::Skipped);
    assert_eq!(summary.steps[2].reason, Some(FailureReason::ConditionNotMet));
}

#[tokio::test(start_paused = true)]
async fn repeated_failures_isolate_adapter_until_cooldown() {
    let adapter = Arc::new(ScriptedAdapter::new("scripted").failing());
    let orchestrator = Orchestrator::builder(single(adapter.clone(), 0.001)).build();

    for _ in 0..5 {
        let plan = orchestrator.submit("hello", None).unwrap();
        let summary = orchestrator.execute(plan).wait().await;
        assert_eq!(summary.steps[0].attempts, 1);
    }
    assert!(!orchestrator.breaker().is_eligible("scripted"));

    // open circuit: the step fails without touching the adapter
    let plan = orchestrator.submit("hello", None).unwrap();
    assert!(plan.estimated_cost.is_none());
    let summary = orchestrator.execute(plan).wait().await;
    assert_eq!(adapter.calls(), 5);
    assert_eq!(summary.steps[0].attempts, 0);
    assert!(matches!(
        summary.steps[0].reason,
        Some(FailureReason::AdapterUnavailable { ref capability }) if capability == "chat"
    ));

    tokio::time::advance(Duration::from_secs(29)).await;
    assert!(!orchestrator.breaker().is_eligible("scripted"));
    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(orchestrator.breaker().is_eligible("scripted"));

    adapter.fail.store(false, Ordering::SeqCst);
    let plan = orchestrator.submit("hello", None).unwrap();
    let summary = orchestrator.execute(plan).wait().await;
    assert_eq!(summary.status, PlanStatus::Completed);
    assert_eq!(orchestrator.breaker().state("scripted"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn half_open_runs_one_call_then_admits_waiting_step() {
    let adapter = Arc::new(
        ScriptedAdapter::new("scripted")
            .failing()
            .with_delay(Duration::from_millis(100)),
    );
    let orchestrator = Orchestrator::builder(single(adapter.clone(), 0.001)).build();
    for _ in 0..5 {
        orchestrator.breaker().record_outcome("scripted", false);
    }
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(orchestrator.breaker().state("scripted"), CircuitState::HalfOpen);

    adapter.fail.store(false, Ordering::SeqCst);
    let plan = orchestrator.submit("first AND second", None).unwrap();
    let summary = orchestrator.execute(plan).wait().await;

    // the second step waits for the half-open call to settle, then runs
    assert_eq!(summary.status, PlanStatus::Completed);
    for outcome in &summary.steps {
        assert_eq!(outcome.status, StepStatus::Done, "{:?}", outcome.reason);
        assert_eq!(outcome.attempts, 1);
    }
    assert_eq!(adapter.calls(), 2);
    assert_eq!(adapter.max_in_flight(), 1);
    assert_eq!(orchestrator.breaker().state("scripted"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn half_open_failure_turns_waiting_step_away() {
    let adapter = Arc::new(
        ScriptedAdapter::new("scripted")
            .failing()
            .with_delay(Duration::from_millis(100)),
    );
    let orchestrator = Orchestrator::builder(single(adapter.clone(), 0.001)).build();
    for _ in 0..5 {
        orchestrator.breaker().record_outcome("scripted", false);
    }
    tokio::time::advance(Duration::from_secs(30)).await;

    let plan = orchestrator.submit("first AND second", None).unwrap();
    let summary = orchestrator.execute(plan).wait().await;

    assert_eq!(summary.status, PlanStatus::Failed);
    assert_eq!(adapter.calls(), 1);
    let unavailable = summary
        .steps
        .iter()
        .filter(|s| matches!(s.reason, Some(FailureReason::AdapterUnavailable { .. })))
        .count();
    assert_eq!(unavailable, 1);
    assert_eq!(orchestrator.breaker().state("scripted"), CircuitState::Open);
}

#[tokio::test]
async fn unmet_branches_are_skipped_and_plan_completes() {
    let registry = single(
        Arc::new(EchoAdapter::new("echo", vec!["chat".into()], 0.001)),
        0.001,
    );
    let orchestrator = Orchestrator::builder(registry).build();

    let plan = orchestrator
        .submit("a THEN b IF_FAILURE THEN c IF_SUCCESS", None)
        .unwrap();
    assert_eq!(plan.steps[1].condition, Condition::OnFailure);
    assert_eq!(plan.steps[2].condition, Condition::OnSuccess);

    let summary = orchestrator.execute(plan).wait().await;
    assert_eq!(summary.status, PlanStatus::Completed);
    assert!(summary.failed_step.is_none());
    assert_eq!(summary.steps[0].status, StepStatus::Done);
    for outcome in &summary.steps[1..] {
        assert_eq!(outcome.status, StepStatus::Skipped);
        assert_eq!(outcome.reason, Some(FailureReason::ConditionNotMet));
    }
}

#[tokio::test]
async fn failure_branch_does_not_rescue_the_plan() {
    let adapter = Arc::new(ScriptedAdapter::new("scripted").failing_on("build"));
    let orchestrator = Orchestrator::builder(single(adapter.clone(), 0.001)).build();

    let plan = orchestrator
        .submit("build THEN report IF_FAILURE", None)
        .unwrap();
    let summary = orchestrator.execute(plan).wait().await;

    assert_eq!(adapter.calls(), 2);
    assert_eq!(summary.steps[0].status, StepStatus::Failed);
    assert_eq!(summary.steps[1].status, StepStatus::Done);
    assert_eq!(summary.steps[1].text(), Some("done: report"));
    assert_eq!(summary.status, PlanStatus::Failed);
    assert_eq!(summary.failed_step, Some(StepId::at(1)));
    assert!(matches!(
        summary.reason,
        Some(FailureReason::AdapterCallFailed { ref adapter, .. }) if adapter == "scripted"
    ));
}

#[tokio::test]
async fn budget_rejection_makes_no_adapter_call() {
    let ledger = BudgetLedger::new(10.0, Duration::from_secs(3600));
    let held = ledger.reserve(9.95).unwrap();
    ledger.commit(held, "earlier", 9.95, "scripted", Some("scripted-1"));

    let adapter = Arc::new(ScriptedAdapter::new("scripted"));
    // 26 chars → 7 input tokens → 21 estimated → $0.105
    let orchestrator = Orchestrator::builder(single(adapter.clone(), 0.005))
        .ledger(ledger)
        .build();

    let plan = orchestrator
        .submit("write the quarterly report THEN send it", None)
        .unwrap();
    let summary = orchestrator.execute(plan).wait().await;

    assert_eq!(adapter.calls(), 0);
    assert_eq!(summary.status, PlanStatus::Failed);
    match &summary.reason {
        Some(FailureReason::BudgetExceeded {
            requested,
            spent,
            limit,
        }) => {
            assert!((requested - 0.105).abs() < 1e-9);
            assert!((spent - 9.95).abs() < 1e-9);
            assert!((limit - 10.0).abs() < 1e-9);
        }
        other => panic!("expected budget rejection, got {other:?}"),
    }
    assert_eq!(summary.steps[1].status, StepStatus::Skipped);

    let budget = orchestrator.budget_summary();
    assert!((budget.total - 9.95).abs() < 1e-9);
    assert_eq!(budget.window.reserved, 0.0);
}

#[tokio::test(start_paused = true)]
async fn slow_adapter_times_out() {
    let adapter = Arc::new(ScriptedAdapter::new("slow").with_delay(Duration::from_secs(20)));
    let orchestrator = Orchestrator::builder(single(adapter.clone(), 0.001)).build();

    let plan = orchestrator.submit("hello", None).unwrap();
    let summary = orchestrator.execute(plan).wait().await;

    assert_eq!(summary.status, PlanStatus::Failed);
    match &summary.steps[0].reason {
        Some(FailureReason::AdapterCallFailed { adapter, message }) => {
            assert_eq!(adapter, "slow");
            assert!(message.contains("timed out"), "{message}");
        }
        other => panic!("expected timeout failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_running_and_pending_steps() {
    let registry = single(
        Arc::new(
            EchoAdapter::new("slow", vec!["chat".into()], 0.001)
                .with_chunk_chars(2)
                .with_chunk_delay(Duration::from_secs(1)),
        ),
        0.001,
    );
    let orchestrator = Orchestrator::builder(registry).build();
    let plan = orchestrator.submit("first THEN second", None).unwrap();
    let mut execution = orchestrator.execute(plan);
    let id = execution.id();

    loop {
        match execution.next_event().await {
            Some(ExecutionEvent::Chunk { .. }) => break,
            Some(_) => continue,
            None => panic!("execution ended before streaming"),
        }
    }
    orchestrator.cancel(id).unwrap();

    let summary = execution.wait().await;
    assert_eq!(summary.status, PlanStatus::Cancelled);
    assert_eq!(summary.reason, Some(FailureReason::Cancelled));
    assert_eq!(summary.steps[0].status, StepStatus::Failed);
    assert_eq!(summary.steps[0].reason, Some(FailureReason::Cancelled));
    assert_eq!(summary.steps[1].status, StepStatus::Skipped);
    assert_eq!(summary.steps[1].reason, Some(FailureReason::Cancelled));

    let budget = orchestrator.budget_summary();
    assert_eq!(budget.window.reserved, 0.0);
    assert_eq!(budget.total, 0.0);
    // cancellation is not held against the adapter
    assert_eq!(orchestrator.breaker().snapshot("slow").consecutive_failures, 0);
}

#[tokio::test]
async fn suppression_hint_reaches_adapter() {
    let registry = AdapterRegistry::builder()
        .register(
            Arc::new(EchoAdapter::new("echo", vec!["summary".into()], 0.001)),
            AdapterSeed {
                suppression_prompt: Some("Be direct.".into()),
                ..Default::default()
            },
        )
        .build()
        .unwrap();
    let orchestrator = Orchestrator::builder(registry).build();

    let plan = orchestrator.submit("summarize the notes", None).unwrap();
    let (events, summary) = orchestrator.execute(plan).collect().await;

    assert!(events.iter().any(|e| matches!(
        e,
        ExecutionEvent::StepStarted { suppress_reasoning: true, .. }
    )));
    assert_eq!(
        summary.steps[0].text(),
        Some("[echo] Be direct.\n\nsummarize the notes")
    );
}
