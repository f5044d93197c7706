pub mod echo;
pub mod profile;

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::config::AdapterConfig;
use crate::error::Error;
use crate::pricing;
use crate::util::lock;

use self::profile::{AdapterProfile, CallObservation, ProfileTuning};

/// Future returned by [`BackendAdapter::call`].
pub type AdapterFuture<'a> =
    Pin<Box<dyn Future<Output = Result<AdapterResponse, Error>> + Send + 'a>>;

/// Ordered chunk sequence returned by [`BackendAdapter::call_streaming`].
pub type ChunkStream<'a> = BoxStream<'a, Result<Chunk, Error>>;

/// Per-call hints passed to an adapter alongside the prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHints {
    /// Task type the adapter was selected for.
    pub task_type: String,
    /// Ask the backend to omit verbose intermediate reasoning.
    #[serde(default)]
    pub suppress_reasoning: bool,
    /// Wording of the suppression instruction, when `suppress_reasoning` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppression_prompt: Option<String>,
}

impl CallHints {
    pub fn for_task(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            ..Default::default()
        }
    }

    /// The prompt as a backend should send it: the suppression instruction,
    /// if any, goes in front of the user text.
    pub fn render_prompt(&self, prompt: &str) -> String {
        match (&self.suppression_prompt, self.suppress_reasoning) {
            (Some(instruction), true) => format!("{instruction}\n\n{prompt}"),
            _ => prompt.to_string(),
        }
    }
}

/// Complete (non-streaming) adapter result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterResponse {
    pub text: String,
    pub token_count: u64,
    /// Actual cost of the call in USD.
    pub cost: f64,
}

/// One piece of a streamed response.
///
/// Exactly one chunk per successful stream carries `done = true`, and it is
/// the last one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub token_count_delta: u64,
    pub cost_delta: f64,
    pub done: bool,
}

impl Chunk {
    pub fn partial(text: impl Into<String>, token_count_delta: u64, cost_delta: f64) -> Self {
        Self {
            text: text.into(),
            token_count_delta,
            cost_delta,
            done: false,
        }
    }

    pub fn terminal(text: impl Into<String>, token_count_delta: u64, cost_delta: f64) -> Self {
        Self {
            text: text.into(),
            token_count_delta,
            cost_delta,
            done: true,
        }
    }
}

impl From<AdapterResponse> for Chunk {
    fn from(response: AdapterResponse) -> Self {
        Chunk::terminal(response.text, response.token_count, response.cost)
    }
}

/// Uniform capability wrapping one concrete execution backend.
///
/// Uses `Pin<Box<dyn Future>>` / boxed streams so adapters can be stored as
/// `Arc<dyn BackendAdapter>` in the registry. Transport (HTTP, local process)
/// is the implementor's business.
pub trait BackendAdapter: Send + Sync {
    /// Stable identifier, unique within a registry.
    fn id(&self) -> &str;

    /// Model name reported in budget summaries, if the backend has one.
    fn model(&self) -> Option<&str> {
        None
    }

    /// Task types this backend can serve.
    fn capabilities(&self) -> &[String];

    fn call<'a>(&'a self, prompt: &'a str, hints: &'a CallHints) -> AdapterFuture<'a>;

    /// Stream the response. The default wraps [`call`](Self::call) into a
    /// single terminal chunk for backends without native streaming.
    fn call_streaming<'a>(&'a self, prompt: &'a str, hints: &'a CallHints) -> ChunkStream<'a> {
        Box::pin(futures::stream::once(async move {
            self.call(prompt, hints).await.map(Chunk::from)
        }))
    }
}

/// Static per-adapter settings supplied by configuration at startup.
#[derive(Debug, Clone)]
pub struct AdapterSeed {
    pub cost_per_token: f64,
    pub latency_ms: f64,
    pub reliability: f64,
    pub bandwidth: f64,
    /// Call timeout. `None` uses the orchestrator default.
    pub timeout: Option<Duration>,
    pub supports_reasoning_control: bool,
    pub suppression_prompt: Option<String>,
    /// Backend runs on this host.
    pub local: bool,
}

impl Default for AdapterSeed {
    fn default() -> Self {
        Self {
            cost_per_token: pricing::FALLBACK_COST_PER_TOKEN,
            latency_ms: 1000.0,
            reliability: 0.9,
            bandwidth: 0.5,
            timeout: None,
            supports_reasoning_control: true,
            suppression_prompt: None,
            local: false,
        }
    }
}

impl From<&AdapterConfig> for AdapterSeed {
    fn from(c: &AdapterConfig) -> Self {
        Self {
            cost_per_token: pricing::resolve_cost_per_token(
                c.cost_per_token,
                &c.provider,
                c.model.as_deref(),
            ),
            latency_ms: c.latency_ms,
            reliability: c.reliability,
            bandwidth: c.bandwidth,
            timeout: c.timeout_ms.map(Duration::from_millis),
            supports_reasoning_control: c.supports_reasoning_control,
            suppression_prompt: c.suppression_prompt.clone(),
            local: c.is_local(),
        }
    }
}

/// An adapter together with its live profile and static settings.
pub struct RegisteredAdapter {
    adapter: Arc<dyn BackendAdapter>,
    profile: Mutex<AdapterProfile>,
    seed: AdapterSeed,
}

impl RegisteredAdapter {
    pub fn adapter(&self) -> &Arc<dyn BackendAdapter> {
        &self.adapter
    }

    pub fn seed(&self) -> &AdapterSeed {
        &self.seed
    }

    /// Copy of the current profile.
    pub fn profile(&self) -> AdapterProfile {
        lock(&self.profile).clone()
    }

    /// Fold one completed call into the moving averages.
    ///
    /// Holds this adapter's profile lock only for the update itself.
    pub fn record(&self, observation: &CallObservation, tuning: &ProfileTuning) {
        lock(&self.profile).record(observation, tuning);
    }
}

impl std::fmt::Debug for RegisteredAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAdapter")
            .field("id", &self.adapter.id())
            .field("seed", &self.seed)
            .finish()
    }
}

/// Closed set of adapters, populated once at startup.
///
/// The map itself never changes after [`AdapterRegistryBuilder::build`]; only
/// each entry's profile is mutated, under its own lock.
#[derive(Debug, Default)]
pub struct AdapterRegistry {
    entries: BTreeMap<String, Arc<RegisteredAdapter>>,
}

impl AdapterRegistry {
    pub fn builder() -> AdapterRegistryBuilder {
        AdapterRegistryBuilder {
            entries: Vec::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Arc<RegisteredAdapter>> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Profile snapshots of every adapter, ordered by id.
    pub fn profiles(&self) -> Vec<AdapterProfile> {
        self.entries.values().map(|e| e.profile()).collect()
    }

    /// Profile snapshots of adapters advertising `capability`, ordered by id.
    pub fn profiles_for(&self, capability: &str) -> Vec<AdapterProfile> {
        self.entries
            .values()
            .map(|e| e.profile())
            .filter(|p| p.has_capability(capability))
            .collect()
    }
}

/// Builder for [`AdapterRegistry`].
pub struct AdapterRegistryBuilder {
    entries: Vec<(Arc<dyn BackendAdapter>, AdapterSeed)>,
}

impl AdapterRegistryBuilder {
    /// Register an adapter with its seed values.
    pub fn register(mut self, adapter: Arc<dyn BackendAdapter>, seed: AdapterSeed) -> Self {
        self.entries.push((adapter, seed));
        self
    }

    /// Build the registry. Adapter ids must be unique and non-empty.
    pub fn build(self) -> Result<AdapterRegistry, Error> {
        let mut entries = BTreeMap::new();
        for (adapter, seed) in self.entries {
            let id = adapter.id().to_string();
            if id.is_empty() {
                return Err(Error::Config("adapter id must not be empty".into()));
            }
            if adapter.capabilities().is_empty() {
                return Err(Error::Config(format!(
                    "adapter '{id}' advertises no capabilities"
                )));
            }
            let profile = AdapterProfile::seeded(adapter.as_ref(), &seed);
            let entry = RegisteredAdapter {
                adapter,
                profile: Mutex::new(profile),
                seed,
            };
            if entries.insert(id.clone(), Arc::new(entry)).is_some() {
                return Err(Error::Config(format!("duplicate adapter id: '{id}'")));
            }
        }
        tracing::debug!(adapters = entries.len(), "adapter registry built");
        Ok(AdapterRegistry { entries })
    }
}
