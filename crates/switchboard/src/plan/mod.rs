//! Workflow plans: steps, batches and conditions.
//!
//! A plan is built from workflow text such as
//! `docs-writer: document this code THEN code-writer: write a unit test IF_SUCCESS`
//! by [`PlanBuilder`]. Steps joined by `AND` share a batch; a step after
//! `THEN` starts the next batch and depends on every step of the previous one.

mod parser;

pub use parser::PlanBuilder;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Stable step identifier: `step1`, `step2`, … in textual order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Id of the step at 1-based `position` in the workflow text.
    pub fn at(position: usize) -> Self {
        Self(format!("step{position}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Gate evaluated against a step's dependency results before it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Condition {
    /// Run once dependencies are resolved.
    #[default]
    None,
    /// `IF_SUCCESS`: every dependency succeeded.
    OnSuccess,
    /// `IF_FAILURE`: at least one dependency failed.
    OnFailure,
    /// `IF_CONTAINS("…")`: a successful dependency's text contains the literal.
    OnContains(String),
}

/// One unit of work in a plan. Immutable once planned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    /// Logical worker name.
    pub assignee: String,
    pub task_text: String,
    /// Every step of the previous batch, in textual order. Empty in batch 0.
    pub depends_on: Vec<StepId>,
    pub batch_index: usize,
    pub condition: Condition,
}

/// Per-step rate lookup used for the up-front cost estimate.
pub trait RateCard {
    /// Cheapest `cost_per_token` among adapters that could run `step`, or
    /// `None` when no adapter is eligible.
    fn cheapest_rate(&self, step: &Step) -> Option<f64>;
}

/// A fully resolved, dependency-annotated workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Workflow text the plan was built from.
    pub source: String,
    pub default_assignee: String,
    /// Ordered by id (textual order), which is also batch order.
    pub steps: Vec<Step>,
    pub batch_count: usize,
    /// Size of the largest batch.
    pub max_parallelism: usize,
    /// Estimated USD cost; `None` when some step has no eligible adapter.
    pub estimated_cost: Option<f64>,
}

impl Plan {
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// Steps grouped by batch, in batch order.
    pub fn batches(&self) -> Vec<Vec<&Step>> {
        let mut batches: Vec<Vec<&Step>> = vec![Vec::new(); self.batch_count];
        for step in &self.steps {
            if let Some(batch) = batches.get_mut(step.batch_index) {
                batch.push(step);
            }
        }
        batches
    }

    /// Steps that list `id` among their dependencies.
    pub fn dependents<'a>(&'a self, id: &'a StepId) -> impl Iterator<Item = &'a Step> + 'a {
        self.steps.iter().filter(move |s| s.depends_on.contains(id))
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
