use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Plan syntax error at step {position}: {message}")]
    PlanSyntax { position: usize, message: String },

    #[error("Budget exceeded: requested ${requested:.4}, spent ${spent:.4} of ${limit:.4}")]
    BudgetExceeded {
        requested: f64,
        spent: f64,
        limit: f64,
    },

    #[error("No eligible adapter for capability '{capability}'")]
    AdapterUnavailable { capability: String },

    #[error("Adapter '{adapter}' call failed: {message}")]
    AdapterCallFailed { adapter: String, message: String },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown execution: {0}")]
    UnknownExecution(uuid::Uuid),
}

impl Error {
    pub(crate) fn syntax(position: usize, message: impl Into<String>) -> Self {
        Error::PlanSyntax {
            position,
            message: message.into(),
        }
    }

    pub(crate) fn call_failed(adapter: impl Into<String>, message: impl Into<String>) -> Self {
        Error::AdapterCallFailed {
            adapter: adapter.into(),
            message: message.into(),
        }
    }

    /// Whether the orchestrator may retry this error on another adapter.
    ///
    /// Only transient adapter failures qualify. Syntax and budget errors are
    /// deterministic, and cancellation is cooperative.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::AdapterCallFailed { .. })
    }
}
