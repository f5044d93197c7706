use std::collections::HashSet;

use serde::Deserialize;

use crate::Error;

/// Top-level configuration loaded from `switchboard.toml`.
///
/// Read once at startup. Every section is optional; an empty file yields a
/// usable (if adapter-less) configuration.
#[derive(Debug, Default, Deserialize)]
pub struct SwitchboardConfig {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    /// Execution backends. Disabled entries are ignored at registry build time.
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
    /// Logical worker names bound to a capability (task type).
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

/// Orchestrator-level settings with sensible defaults.
#[derive(Debug, Deserialize)]
pub struct OrchestratorConfig {
    /// Assignee used for steps without an explicit `name:` prefix.
    #[serde(default = "default_assignee")]
    pub default_assignee: String,
    /// Wall-clock limit for one adapter call, unless the adapter overrides it.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_assignee() -> String {
    "worker".into()
}

fn default_timeout_ms() -> u64 {
    12_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            default_assignee: default_assignee(),
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit (default: 5).
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Sliding window the failures must fall into, in seconds (default: 60).
    #[serde(default = "default_failure_window_secs")]
    pub failure_window_secs: u64,
    /// Time an open circuit waits before admitting a probe (default: 30).
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_window_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_window_secs: default_failure_window_secs(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Spend limit per rolling window.
#[derive(Debug, Deserialize)]
pub struct BudgetConfig {
    /// Maximum committed plus reserved spend per window, in USD (default: 10.0).
    #[serde(default = "default_limit_usd")]
    pub limit_usd: f64,
    /// Window length in seconds (default: 3600).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_limit_usd() -> f64 {
    10.0
}

fn default_window_secs() -> u64 {
    3600
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            limit_usd: default_limit_usd(),
            window_secs: default_window_secs(),
        }
    }
}

/// Weights of the adapter ranking formula and moving-average tuning.
#[derive(Debug, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_latency_weight")]
    pub latency: f64,
    #[serde(default = "default_cost_weight")]
    pub cost: f64,
    #[serde(default = "default_reliability_weight")]
    pub reliability: f64,
    #[serde(default = "default_bandwidth_weight")]
    pub bandwidth: f64,
    /// Smoothing factor for profile moving averages, in `(0, 1]` (default: 0.2).
    #[serde(default = "default_ema_alpha")]
    pub ema_alpha: f64,
    /// Throughput that maps to a bandwidth score of 1.0 (default: 50 tokens/s).
    #[serde(default = "default_reference_tokens_per_sec")]
    pub reference_tokens_per_sec: f64,
    /// Favor adapters served from this host.
    #[serde(default)]
    pub prefer_local: bool,
    /// Penalize expensive adapters beyond the cost weight.
    #[serde(default)]
    pub prefer_cost: bool,
    /// Per-adapter spend in the current budget window above which the
    /// adapter is ranked as if it cost twice as much. Unset disables it.
    #[serde(default)]
    pub max_adapter_spend_usd: Option<f64>,
    /// Adapters exempt from the over-spend penalty.
    #[serde(default)]
    pub preferred_under_budget: Vec<String>,
}

fn default_latency_weight() -> f64 {
    0.4
}

fn default_cost_weight() -> f64 {
    0.3
}

fn default_reliability_weight() -> f64 {
    0.2
}

fn default_bandwidth_weight() -> f64 {
    0.1
}

fn default_ema_alpha() -> f64 {
    0.2
}

fn default_reference_tokens_per_sec() -> f64 {
    50.0
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            latency: default_latency_weight(),
            cost: default_cost_weight(),
            reliability: default_reliability_weight(),
            bandwidth: default_bandwidth_weight(),
            ema_alpha: default_ema_alpha(),
            reference_tokens_per_sec: default_reference_tokens_per_sec(),
            prefer_local: false,
            prefer_cost: false,
            max_adapter_spend_usd: None,
            preferred_under_budget: Vec::new(),
        }
    }
}

/// When adapters are asked to skip verbose intermediate reasoning.
#[derive(Debug, Deserialize)]
pub struct ReasoningConfig {
    /// Task types treated as simple.
    #[serde(default = "default_suppress_for")]
    pub suppress_for: Vec<String>,
    /// Task types that always keep full reasoning. Wins over `suppress_for`.
    #[serde(default = "default_force_for")]
    pub force_for: Vec<String>,
    /// Instruction prepended when an adapter has no prompt of its own.
    #[serde(default = "default_suppression_prompt")]
    pub default_prompt: String,
}

fn default_suppress_for() -> Vec<String> {
    ["chat", "summary", "translation", "classification"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_force_for() -> Vec<String> {
    vec!["reasoning".into()]
}

fn default_suppression_prompt() -> String {
    "Answer directly without showing your reasoning.".into()
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            suppress_for: default_suppress_for(),
            force_for: default_force_for(),
            default_prompt: default_suppression_prompt(),
        }
    }
}

/// A single execution backend and its static seed values.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub id: String,
    /// Provider family, used for the pricing table (e.g. "openai", "ollama").
    #[serde(default = "default_provider")]
    pub provider: String,
    pub model: Option<String>,
    pub capabilities: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Explicit rate in USD. Falls back to the pricing table.
    pub cost_per_token: Option<f64>,
    /// Seed for the latency moving average (default: 1000 ms).
    #[serde(default = "default_seed_latency_ms")]
    pub latency_ms: f64,
    /// Seed reliability in `[0, 1]` (default: 0.9).
    #[serde(default = "default_seed_reliability")]
    pub reliability: f64,
    /// Seed bandwidth in `[0, 1]` (default: 0.5).
    #[serde(default = "default_seed_bandwidth")]
    pub bandwidth: f64,
    /// Per-adapter call timeout. Defaults to `orchestrator.default_timeout_ms`.
    pub timeout_ms: Option<u64>,
    /// Whether this backend honors the suppress-reasoning hint.
    #[serde(default = "default_true")]
    pub supports_reasoning_control: bool,
    /// Backend-specific wording of the suppress-reasoning instruction.
    pub suppression_prompt: Option<String>,
    /// Where the backend is reached. A loopback URL marks it as local.
    pub endpoint: Option<String>,
}

const LOOPBACK_PREFIXES: &[&str] = &["http://127.0.0.1", "http://localhost", "http://[::1]"];

impl AdapterConfig {
    /// Whether the backend is served from this host.
    pub fn is_local(&self) -> bool {
        self.endpoint
            .as_deref()
            .is_some_and(|e| LOOPBACK_PREFIXES.iter().any(|p| e.starts_with(p)))
    }
}

fn default_provider() -> String {
    "local".into()
}

fn default_true() -> bool {
    true
}

fn default_seed_latency_ms() -> f64 {
    1000.0
}

fn default_seed_reliability() -> f64 {
    0.9
}

fn default_seed_bandwidth() -> f64 {
    0.5
}

/// Binds a logical worker name (a plan step's assignee) to a capability.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub name: String,
    pub capability: String,
}

impl SwitchboardConfig {
    /// Parse a TOML string into a `SwitchboardConfig`.
    pub fn from_toml(content: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    /// Adapters with `enabled = true`, in declaration order.
    pub fn enabled_adapters(&self) -> impl Iterator<Item = &AdapterConfig> {
        self.adapters.iter().filter(|a| a.enabled)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.orchestrator.default_assignee.trim().is_empty() {
            return Err(Error::Config(
                "orchestrator.default_assignee must not be empty".into(),
            ));
        }
        if self.orchestrator.default_timeout_ms == 0 {
            return Err(Error::Config(
                "orchestrator.default_timeout_ms must be at least 1".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if self.breaker.failure_window_secs == 0 {
            return Err(Error::Config(
                "breaker.failure_window_secs must be at least 1".into(),
            ));
        }
        if self.breaker.cooldown_secs == 0 {
            return Err(Error::Config(
                "breaker.cooldown_secs must be at least 1".into(),
            ));
        }
        if !self.budget.limit_usd.is_finite() || self.budget.limit_usd < 0.0 {
            return Err(Error::Config(format!(
                "budget.limit_usd must be a non-negative number, got {}",
                self.budget.limit_usd
            )));
        }
        if self.budget.window_secs == 0 {
            return Err(Error::Config(
                "budget.window_secs must be at least 1".into(),
            ));
        }

        let weights = [
            ("latency", self.scoring.latency),
            ("cost", self.scoring.cost),
            ("reliability", self.scoring.reliability),
            ("bandwidth", self.scoring.bandwidth),
        ];
        for (name, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(Error::Config(format!(
                    "scoring.{name} must be a non-negative number, got {weight}"
                )));
            }
        }
        if weights.iter().map(|(_, w)| w).sum::<f64>() <= 0.0 {
            return Err(Error::Config(
                "scoring weights must not all be zero".into(),
            ));
        }
        if let Some(max) = self.scoring.max_adapter_spend_usd
            && (!max.is_finite() || max < 0.0)
        {
            return Err(Error::Config(format!(
                "scoring.max_adapter_spend_usd must be a non-negative number, got {max}"
            )));
        }
        if !(self.scoring.ema_alpha > 0.0 && self.scoring.ema_alpha <= 1.0) {
            return Err(Error::Config(format!(
                "scoring.ema_alpha must be in (0, 1], got {}",
                self.scoring.ema_alpha
            )));
        }
        if !(self.scoring.reference_tokens_per_sec > 0.0) {
            return Err(Error::Config(
                "scoring.reference_tokens_per_sec must be positive".into(),
            ));
        }

        let mut seen = HashSet::new();
        for adapter in &self.adapters {
            if adapter.id.trim().is_empty() {
                return Err(Error::Config("adapter id must not be empty".into()));
            }
            if !seen.insert(adapter.id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate adapter id: '{}'",
                    adapter.id
                )));
            }
            if adapter.capabilities.is_empty() {
                return Err(Error::Config(format!(
                    "adapter '{}': capabilities must not be empty",
                    adapter.id
                )));
            }
            if let Some(cost) = adapter.cost_per_token
                && (!cost.is_finite() || cost < 0.0)
            {
                return Err(Error::Config(format!(
                    "adapter '{}': cost_per_token must be a non-negative number",
                    adapter.id
                )));
            }
            if !(adapter.latency_ms > 0.0) {
                return Err(Error::Config(format!(
                    "adapter '{}': latency_ms must be positive",
                    adapter.id
                )));
            }
            if !(0.0..=1.0).contains(&adapter.reliability) {
                return Err(Error::Config(format!(
                    "adapter '{}': reliability must be in [0, 1]",
                    adapter.id
                )));
            }
            if !(0.0..=1.0).contains(&adapter.bandwidth) {
                return Err(Error::Config(format!(
                    "adapter '{}': bandwidth must be in [0, 1]",
                    adapter.id
                )));
            }
            if adapter.timeout_ms == Some(0) {
                return Err(Error::Config(format!(
                    "adapter '{}': timeout_ms must be at least 1",
                    adapter.id
                )));
            }
        }

        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.name.trim().is_empty() {
                return Err(Error::Config("worker name must not be empty".into()));
            }
            if worker.capability.trim().is_empty() {
                return Err(Error::Config(format!(
                    "worker '{}': capability must not be empty",
                    worker.name
                )));
            }
            if !seen.insert(worker.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate worker name: '{}'",
                    worker.name
                )));
            }
        }

        Ok(())
    }
}
