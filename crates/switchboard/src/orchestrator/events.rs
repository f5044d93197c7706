use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;
use crate::plan::StepId;

/// Lifecycle of one plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Lifecycle of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Waiting,
    Ready,
    Running,
    Done,
    Skipped,
    Failed,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Skipped | StepStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// What a step produced. Created once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub outcome: Outcome,
    /// Generated text on success, error message on failure.
    pub text: String,
    pub token_count: u64,
    /// Committed cost in USD. Zero for failures.
    pub cost: f64,
    /// Last adapter tried, if any was called.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adapter_used: Option<String>,
}

/// Machine-readable reason a step or plan did not complete normally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    BudgetExceeded {
        requested: f64,
        spent: f64,
        limit: f64,
    },
    AdapterUnavailable {
        capability: String,
    },
    AdapterCallFailed {
        adapter: String,
        message: String,
    },
    Cancelled,
    /// The step's condition evaluated false against its dependencies.
    ConditionNotMet,
    /// An earlier step failed the plan before this one could start.
    PlanFailed {
        step_id: StepId,
    },
    Internal {
        message: String,
    },
}

impl FailureReason {
    /// Failures that an `IF_FAILURE` dependent can never absorb.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FailureReason::BudgetExceeded { .. } | FailureReason::Cancelled
        )
    }
}

impl From<&Error> for FailureReason {
    fn from(e: &Error) -> Self {
        match e {
            Error::BudgetExceeded {
                requested,
                spent,
                limit,
            } => FailureReason::BudgetExceeded {
                requested: *requested,
                spent: *spent,
                limit: *limit,
            },
            Error::AdapterUnavailable { capability } => FailureReason::AdapterUnavailable {
                capability: capability.clone(),
            },
            Error::AdapterCallFailed { adapter, message } => FailureReason::AdapterCallFailed {
                adapter: adapter.clone(),
                message: message.clone(),
            },
            Error::Cancelled => FailureReason::Cancelled,
            other => FailureReason::Internal {
                message: other.to_string(),
            },
        }
    }
}

/// Terminal record of one step, as reported in events and the summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step_id: StepId,
    pub status: StepStatus,
    /// Adapter calls made for this step.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
}

impl StepOutcome {
    pub(crate) fn done(result: StepResult, attempts: u32) -> Self {
        Self {
            step_id: result.step_id.clone(),
            status: StepStatus::Done,
            attempts,
            result: Some(result),
            reason: None,
        }
    }

    pub(crate) fn failed(
        step_id: StepId,
        error: &Error,
        attempts: u32,
        adapter_used: Option<String>,
    ) -> Self {
        Self {
            step_id: step_id.clone(),
            status: StepStatus::Failed,
            attempts,
            result: Some(StepResult {
                step_id,
                outcome: Outcome::Failure,
                text: error.to_string(),
                token_count: 0,
                cost: 0.0,
                adapter_used,
            }),
            reason: Some(FailureReason::from(error)),
        }
    }

    pub(crate) fn skipped(step_id: StepId, reason: FailureReason) -> Self {
        Self {
            step_id,
            status: StepStatus::Skipped,
            attempts: 0,
            result: None,
            reason: Some(reason),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == StepStatus::Done
    }

    /// Text of a successful step.
    pub fn text(&self) -> Option<&str> {
        match (&self.status, &self.result) {
            (StepStatus::Done, Some(result)) => Some(&result.text),
            _ => None,
        }
    }

    pub fn cost(&self) -> f64 {
        self.result.as_ref().map_or(0.0, |r| r.cost)
    }
}

/// Final report of a plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub execution_id: Uuid,
    pub status: PlanStatus,
    /// Why the plan did not complete; `None` when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    /// Step that failed the plan, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<StepId>,
    pub total_cost: f64,
    /// One entry per plan step, in plan order.
    pub steps: Vec<StepOutcome>,
}

impl PlanSummary {
    pub fn step(&self, id: &StepId) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| &s.step_id == id)
    }
}

/// Progress reported while a plan runs.
///
/// Chunks of one step arrive in generation order; chunks of concurrent steps
/// may interleave and are told apart by `step_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    PlanStarted {
        execution_id: Uuid,
        steps: usize,
        batch_count: usize,
    },
    BatchStarted {
        batch_index: usize,
        steps: Vec<StepId>,
    },
    StepStarted {
        step_id: StepId,
        adapter: String,
        attempt: u32,
        /// Whether the adapter was asked to skip verbose reasoning.
        #[serde(default)]
        suppress_reasoning: bool,
    },
    Chunk {
        step_id: StepId,
        text: String,
    },
    StepRetrying {
        step_id: StepId,
        failed_adapter: String,
        next_adapter: String,
        error: String,
    },
    StepFinished {
        outcome: StepOutcome,
    },
    PlanFinished {
        summary: PlanSummary,
    },
}
