//! Task routing across interchangeable execution backends.
//!
//! Workflow text such as `"research: gather sources THEN writer: draft IF_SUCCESS"`
//! is parsed into a [`Plan`] of batched steps. The [`Orchestrator`] runs each
//! step on the best-ranked healthy adapter, gating every call through a
//! per-adapter [`CircuitBreaker`] and a windowed [`BudgetLedger`].

pub mod adapter;
pub mod breaker;
pub mod budget;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod plan;
pub mod pricing;
pub mod scorer;
mod util;

pub use adapter::echo::EchoAdapter;
pub use adapter::profile::{AdapterProfile, CallObservation, ProfileTuning};
pub use adapter::{
    AdapterFuture, AdapterRegistry, AdapterResponse, AdapterSeed, BackendAdapter, CallHints, Chunk,
    ChunkStream,
};
pub use breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use budget::{BudgetLedger, BudgetSummary, Reservation};
pub use config::SwitchboardConfig;
pub use error::Error;
pub use orchestrator::{
    Execution, ExecutionEvent, FailureReason, Orchestrator, PlanStatus, PlanSummary, SpendCap,
    StepOutcome, StepResult, StepStatus,
};
pub use plan::{Condition, Plan, PlanBuilder, RateCard, Step, StepId};
pub use scorer::{RankPreferences, RankedAdapter, ReasoningPolicy, Scorer, ScoringWeights};

/// Build a registry of [`EchoAdapter`]s from the enabled `[[adapters]]`.
///
/// Used for dry runs, where no real backend should be contacted.
pub fn echo_registry(config: &SwitchboardConfig) -> Result<AdapterRegistry, Error> {
    config
        .enabled_adapters()
        .fold(AdapterRegistry::builder(), |builder, a| {
            builder.register(
                std::sync::Arc::new(EchoAdapter::from_config(a)),
                AdapterSeed::from(a),
            )
        })
        .build()
}
