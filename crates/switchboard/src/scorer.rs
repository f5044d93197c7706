//! Adapter ranking, reasoning-suppression hints and capability routing.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::adapter::profile::AdapterProfile;
use crate::adapter::{AdapterSeed, CallHints};
use crate::config::{ReasoningConfig, ScoringConfig, WorkerConfig};

/// Latency floor in milliseconds before taking the reciprocal.
const MIN_LATENCY_MS: f64 = 1.0;
/// Cost floor in USD per token before taking the reciprocal.
const MIN_COST_PER_TOKEN: f64 = 1e-9;
/// Share of a local adapter's score gap that remains under `prefer_local`.
const LOCAL_GAP_FACTOR: f64 = 0.6;
/// Largest penalty `prefer_cost` applies, as a share of the total weight.
const COST_PREFERENCE_PENALTY: f64 = 0.5;
/// Cost multiplier for adapters over their spend cap.
const OVER_BUDGET_COST_FACTOR: f64 = 2.0;

/// Weights of the linear ranking formula.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoringWeights {
    pub latency: f64,
    pub cost: f64,
    pub reliability: f64,
    pub bandwidth: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            latency: 0.4,
            cost: 0.3,
            reliability: 0.2,
            bandwidth: 0.1,
        }
    }
}

impl ScoringWeights {
    fn total(&self) -> f64 {
        self.latency + self.cost + self.reliability + self.bandwidth
    }
}

impl From<&ScoringConfig> for ScoringWeights {
    fn from(c: &ScoringConfig) -> Self {
        Self {
            latency: c.latency,
            cost: c.cost,
            reliability: c.reliability,
            bandwidth: c.bandwidth,
        }
    }
}

/// Adjustments applied on top of the weighted score.
///
/// The default applies none, so ranking is the plain weighted formula.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankPreferences {
    /// Close 40% of the gap to the top score for local adapters.
    pub prefer_local: bool,
    /// Subtract up to half the total weight from the most expensive
    /// adapters, scaled by how far their cost is from the cheapest.
    pub prefer_cost: bool,
    /// Adapters ranked as if they cost twice their per-token rate.
    pub over_budget: BTreeSet<String>,
}

impl RankPreferences {
    pub fn from_config(c: &ScoringConfig) -> Self {
        Self {
            prefer_local: c.prefer_local,
            prefer_cost: c.prefer_cost,
            over_budget: BTreeSet::new(),
        }
    }
}

/// One entry of a ranking, highest score first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedAdapter {
    pub score: f64,
    pub profile: AdapterProfile,
}

impl RankedAdapter {
    pub fn id(&self) -> &str {
        &self.profile.id
    }
}

/// Min-max bounds of one metric over the candidate pool.
#[derive(Debug, Clone, Copy)]
struct Bounds {
    min: f64,
    max: f64,
}

impl Bounds {
    fn of(values: impl Iterator<Item = f64>) -> Self {
        values.fold(
            Bounds {
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            },
            |b, v| Bounds {
                min: b.min.min(v),
                max: b.max.max(v),
            },
        )
    }

    /// Scale `value` into `[0, 1]`. A degenerate range maps to 1.0.
    fn normalize(&self, value: f64) -> f64 {
        let span = self.max - self.min;
        if span <= f64::EPSILON * self.max.abs().max(1.0) {
            1.0
        } else {
            ((value - self.min) / span).clamp(0.0, 1.0)
        }
    }
}

fn inverse_latency(p: &AdapterProfile) -> f64 {
    1.0 / p.moving_avg_latency_ms.max(MIN_LATENCY_MS)
}

fn inverse_cost(p: &AdapterProfile, prefs: &RankPreferences) -> f64 {
    let rate = if prefs.over_budget.contains(&p.id) {
        p.cost_per_token * OVER_BUDGET_COST_FACTOR
    } else {
        p.cost_per_token
    };
    1.0 / rate.max(MIN_COST_PER_TOKEN)
}

/// Ranks adapter profiles for a capability.
///
/// Pure: the same pool always yields the same order. Ordering is score
/// descending, then `cost_per_token` ascending, then id ascending.
#[derive(Debug, Clone, Default)]
pub struct Scorer {
    weights: ScoringWeights,
}

impl Scorer {
    pub fn new(weights: ScoringWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ScoringWeights {
        &self.weights
    }

    /// Rank the profiles in `pool` that advertise `capability`.
    ///
    /// Normalization is relative to the filtered pool only.
    pub fn rank(
        &self,
        capability: &str,
        pool: &[AdapterProfile],
        prefs: &RankPreferences,
    ) -> Vec<RankedAdapter> {
        let candidates: Vec<&AdapterProfile> =
            pool.iter().filter(|p| p.has_capability(capability)).collect();
        if candidates.is_empty() {
            return Vec::new();
        }

        let latency = Bounds::of(candidates.iter().map(|p| inverse_latency(p)));
        let cost = Bounds::of(candidates.iter().map(|p| inverse_cost(p, prefs)));
        let w = &self.weights;
        let total = w.total();

        let mut ranked: Vec<RankedAdapter> = candidates
            .into_iter()
            .map(|p| {
                let cost_norm = cost.normalize(inverse_cost(p, prefs));
                let mut score = w.latency * latency.normalize(inverse_latency(p))
                    + w.cost * cost_norm
                    + w.reliability * p.reliability_score.clamp(0.0, 1.0)
                    + w.bandwidth * p.bandwidth_score.clamp(0.0, 1.0);
                if prefs.prefer_local && p.local {
                    score = total - (total - score) * LOCAL_GAP_FACTOR;
                }
                if prefs.prefer_cost {
                    score -= total * COST_PREFERENCE_PENALTY * (1.0 - cost_norm);
                }
                RankedAdapter {
                    score,
                    profile: p.clone(),
                }
            })
            .collect();

        ranked.sort_by(compare_ranked);
        ranked
    }

    /// The best `limit` adapters for `capability`.
    pub fn top(
        &self,
        capability: &str,
        pool: &[AdapterProfile],
        limit: usize,
        prefs: &RankPreferences,
    ) -> Vec<RankedAdapter> {
        let mut ranked = self.rank(capability, pool, prefs);
        ranked.truncate(limit);
        ranked
    }
}

fn compare_ranked(a: &RankedAdapter, b: &RankedAdapter) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.profile.cost_per_token.total_cmp(&b.profile.cost_per_token))
        .then_with(|| a.profile.id.cmp(&b.profile.id))
}

/// Decides when adapters are asked to skip verbose intermediate reasoning.
///
/// Only ever produces a call hint; ranking is unaffected.
#[derive(Debug, Clone)]
pub struct ReasoningPolicy {
    suppress_for: Vec<String>,
    force_for: Vec<String>,
    default_prompt: String,
}

impl Default for ReasoningPolicy {
    fn default() -> Self {
        Self::from(&ReasoningConfig::default())
    }
}

impl From<&ReasoningConfig> for ReasoningPolicy {
    fn from(c: &ReasoningConfig) -> Self {
        Self {
            suppress_for: c.suppress_for.clone(),
            force_for: c.force_for.clone(),
            default_prompt: c.default_prompt.clone(),
        }
    }
}

impl ReasoningPolicy {
    /// Whether `task_type` is simple enough to suppress reasoning.
    /// `force_for` wins over `suppress_for`.
    pub fn should_suppress(&self, task_type: &str) -> bool {
        if self.force_for.iter().any(|t| t == task_type) {
            return false;
        }
        self.suppress_for.iter().any(|t| t == task_type)
    }

    /// Call hints for one adapter. Adapters without reasoning control never
    /// receive the suppression flag.
    pub fn hints(&self, task_type: &str, seed: &AdapterSeed) -> CallHints {
        let mut hints = CallHints::for_task(task_type);
        if seed.supports_reasoning_control && self.should_suppress(task_type) {
            hints.suppress_reasoning = true;
            hints.suppression_prompt = Some(
                seed.suppression_prompt
                    .clone()
                    .unwrap_or_else(|| self.default_prompt.clone()),
            );
        }
        hints
    }
}

/// Keyword groups checked in order; the first hit wins.
const TASK_KEYWORDS: &[(&str, &[&str])] = &[
    ("reasoning", &["reason", "prove", "deduce", "step by step"]),
    (
        "code",
        &["code", "function", "unit test", "refactor", "debug", "implement", "compile"],
    ),
    ("summary", &["summar", "tl;dr", "recap", "digest"]),
    ("translation", &["translat"]),
    ("classification", &["classif", "categori", "label", "sentiment"]),
    ("search", &["search", "look up", "find sources"]),
    ("embedding", &["embedding", "vectorize"]),
    ("image", &["image", "picture", "draw"]),
];

/// Fallback task type when no keyword matches.
pub const DEFAULT_TASK_TYPE: &str = "chat";

/// Classify free task text into a task type by keyword.
pub fn classify_task(task_text: &str) -> &'static str {
    let lower = task_text.to_lowercase();
    TASK_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(task_type, _)| *task_type)
        .unwrap_or(DEFAULT_TASK_TYPE)
}

/// Resolves the capability a step needs.
///
/// An assignee bound in `[[workers]]` always maps to its configured
/// capability; anyone else is classified from the task text.
#[derive(Debug, Clone, Default)]
pub struct TaskRouter {
    workers: HashMap<String, String>,
}

impl TaskRouter {
    pub fn new(workers: &[WorkerConfig]) -> Self {
        Self {
            workers: workers
                .iter()
                .map(|w| (w.name.clone(), w.capability.clone()))
                .collect(),
        }
    }

    pub fn capability_for(&self, assignee: &str, task_text: &str) -> String {
        self.workers
            .get(assignee)
            .cloned()
            .unwrap_or_else(|| classify_task(task_text).to_string())
    }
}
