use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ScoringConfig;

use super::{AdapterSeed, BackendAdapter};

/// Live performance profile of one adapter, used for ranking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterProfile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub capability_tags: BTreeSet<String>,
    pub moving_avg_latency_ms: f64,
    pub cost_per_token: f64,
    /// `[0, 1]`, pulled toward 1 by successes and 0 by failures.
    pub reliability_score: f64,
    /// `[0, 1]`, observed throughput relative to the reference rate.
    pub bandwidth_score: f64,
    /// Completed calls folded into this profile.
    #[serde(default)]
    pub calls: u64,
    /// Runs on this host. Favored when ranking with `prefer_local`.
    #[serde(default)]
    pub local: bool,
}

/// Outcome of one finished adapter call.
#[derive(Debug, Clone, Copy)]
pub struct CallObservation {
    pub success: bool,
    pub latency: Duration,
    pub token_count: u64,
    pub cost: f64,
}

/// Moving-average tuning shared by all profiles.
#[derive(Debug, Clone, Copy)]
pub struct ProfileTuning {
    /// EMA smoothing factor in `(0, 1]`.
    pub alpha: f64,
    /// Tokens per second that map to a bandwidth score of 1.0.
    pub reference_tokens_per_sec: f64,
}

impl Default for ProfileTuning {
    fn default() -> Self {
        Self {
            alpha: 0.2,
            reference_tokens_per_sec: 50.0,
        }
    }
}

impl From<&ScoringConfig> for ProfileTuning {
    fn from(c: &ScoringConfig) -> Self {
        Self {
            alpha: c.ema_alpha,
            reference_tokens_per_sec: c.reference_tokens_per_sec,
        }
    }
}

fn ema(previous: f64, sample: f64, alpha: f64) -> f64 {
    previous + alpha * (sample - previous)
}

impl AdapterProfile {
    pub(crate) fn seeded(adapter: &dyn BackendAdapter, seed: &AdapterSeed) -> Self {
        Self {
            id: adapter.id().to_string(),
            model: adapter.model().map(str::to_string),
            capability_tags: adapter.capabilities().iter().cloned().collect(),
            moving_avg_latency_ms: seed.latency_ms,
            cost_per_token: seed.cost_per_token,
            reliability_score: seed.reliability.clamp(0.0, 1.0),
            bandwidth_score: seed.bandwidth.clamp(0.0, 1.0),
            calls: 0,
            local: seed.local,
        }
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capability_tags.contains(capability)
    }

    /// Fold one completed call into the moving averages.
    ///
    /// Latency and reliability move on every call. Bandwidth and the
    /// per-token rate only move on successes that report tokens, since a
    /// failed call says nothing about either.
    pub fn record(&mut self, observation: &CallObservation, tuning: &ProfileTuning) {
        let alpha = tuning.alpha;
        let latency_ms = observation.latency.as_secs_f64() * 1000.0;

        self.moving_avg_latency_ms = ema(self.moving_avg_latency_ms, latency_ms, alpha);
        let outcome = if observation.success { 1.0 } else { 0.0 };
        self.reliability_score = ema(self.reliability_score, outcome, alpha).clamp(0.0, 1.0);

        if observation.success && observation.token_count > 0 {
            let secs = observation.latency.as_secs_f64();
            if secs > 0.0 {
                let tokens_per_sec = observation.token_count as f64 / secs;
                let sample = (tokens_per_sec / tuning.reference_tokens_per_sec).min(1.0);
                self.bandwidth_score = ema(self.bandwidth_score, sample, alpha).clamp(0.0, 1.0);
            }
            let observed_rate = observation.cost / observation.token_count as f64;
            self.cost_per_token = ema(self.cost_per_token, observed_rate, alpha).max(0.0);
        }

        self.calls += 1;
    }
}
