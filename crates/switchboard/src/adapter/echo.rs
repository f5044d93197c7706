use std::time::Duration;

use futures::StreamExt;

use crate::config::AdapterConfig;
use crate::pricing;

use super::{AdapterFuture, AdapterResponse, BackendAdapter, CallHints, Chunk, ChunkStream};

/// Offline adapter that streams the (hint-rendered) prompt back.
///
/// Stands in for a real backend in dry runs: it honors capabilities, prices
/// output at its configured rate and paces chunks like a slow provider would.
#[derive(Debug, Clone)]
pub struct EchoAdapter {
    id: String,
    model: Option<String>,
    capabilities: Vec<String>,
    cost_per_token: f64,
    chunk_chars: usize,
    chunk_delay: Duration,
}

impl EchoAdapter {
    pub fn new(id: impl Into<String>, capabilities: Vec<String>, cost_per_token: f64) -> Self {
        Self {
            id: id.into(),
            model: None,
            capabilities,
            cost_per_token,
            chunk_chars: 16,
            chunk_delay: Duration::ZERO,
        }
    }

    /// Build from an `[[adapters]]` config entry.
    pub fn from_config(config: &AdapterConfig) -> Self {
        let rate = pricing::resolve_cost_per_token(
            config.cost_per_token,
            &config.provider,
            config.model.as_deref(),
        );
        let mut adapter = Self::new(config.id.clone(), config.capabilities.clone(), rate);
        adapter.model = config.model.clone();
        adapter
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Characters per streamed chunk (minimum 1).
    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }

    /// Pause before each chunk.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    fn render(&self, prompt: &str, hints: &CallHints) -> String {
        format!("[{}] {}", self.id, hints.render_prompt(prompt))
    }

    fn split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        chars
            .chunks(self.chunk_chars)
            .map(|c| c.iter().collect())
            .collect()
    }
}

impl BackendAdapter for EchoAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    fn call<'a>(&'a self, prompt: &'a str, hints: &'a CallHints) -> AdapterFuture<'a> {
        Box::pin(async move {
            let text = self.render(prompt, hints);
            let token_count = pricing::estimate_tokens(&text);
            if !self.chunk_delay.is_zero() {
                tokio::time::sleep(self.chunk_delay).await;
            }
            Ok(AdapterResponse {
                text,
                token_count,
                cost: token_count as f64 * self.cost_per_token,
            })
        })
    }

    fn call_streaming<'a>(&'a self, prompt: &'a str, hints: &'a CallHints) -> ChunkStream<'a> {
        let pieces = self.split(&self.render(prompt, hints));
        let last = pieces.len().saturating_sub(1);
        let delay = self.chunk_delay;
        let rate = self.cost_per_token;

        futures::stream::iter(pieces.into_iter().enumerate())
            .then(move |(i, piece)| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let tokens = pricing::estimate_tokens(&piece);
                let cost = tokens as f64 * rate;
                Ok(if i == last {
                    Chunk::terminal(piece, tokens, cost)
                } else {
                    Chunk::partial(piece, tokens, cost)
                })
            })
            .boxed()
    }
}
