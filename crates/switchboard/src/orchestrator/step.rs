use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::adapter::profile::CallObservation;
use crate::adapter::{AdapterResponse, CallHints, RegisteredAdapter};
use crate::breaker::{Admission, CallPermit};
use crate::error::Error;
use crate::plan::{Condition, Step};
use crate::pricing;
use crate::scorer::RankedAdapter;
use crate::util::truncate_for_log;

use super::Inner;
use super::events::{ExecutionEvent, Outcome, StepOutcome, StepResult, StepStatus};

/// Adapter attempts per step: the first choice plus one retry.
const MAX_ATTEMPTS: u32 = 2;

const LOG_PREVIEW_BYTES: usize = 200;

/// Whether `condition` holds against the outcomes of the step's dependencies.
///
/// Skipped dependencies count as resolved but never as successful.
pub(super) fn condition_holds(condition: &Condition, dependencies: &[&StepOutcome]) -> bool {
    match condition {
        Condition::None => true,
        Condition::OnSuccess => dependencies.iter().all(|d| d.succeeded()),
        Condition::OnFailure => dependencies
            .iter()
            .any(|d| d.status == StepStatus::Failed),
        Condition::OnContains(needle) => dependencies
            .iter()
            .filter_map(|d| d.text())
            .any(|text| text.contains(needle.as_str())),
    }
}

/// Everything one step task needs, owned so it can be spawned.
pub(super) struct StepRun {
    pub inner: Arc<Inner>,
    pub step: Step,
    pub events: UnboundedSender<ExecutionEvent>,
    pub cancel: CancellationToken,
}

impl StepRun {
    fn emit(&self, event: ExecutionEvent) {
        // A caller that dropped its receiver still gets the summary.
        let _ = self.events.send(event);
    }

    /// Next ranked adapter that the breaker admits.
    ///
    /// Open circuits are skipped. Adapters whose half-open probe is in
    /// flight are tried again once every other candidate has been refused,
    /// waiting for the probe to settle. `Err` only on cancellation.
    async fn next_admitted(
        &self,
        candidates: &mut VecDeque<&RankedAdapter>,
    ) -> Result<Option<(Arc<RegisteredAdapter>, CallPermit)>, Error> {
        let mut busy = Vec::new();
        while let Some(candidate) = candidates.pop_front() {
            let Some(entry) = self.inner.registry.get(candidate.id()) else {
                continue;
            };
            match self.inner.breaker.try_admit(candidate.id()) {
                Admission::Granted(permit) => {
                    for deferred in busy.into_iter().rev() {
                        candidates.push_front(deferred);
                    }
                    return Ok(Some((entry.clone(), permit)));
                }
                Admission::ProbeBusy => busy.push(candidate),
                Admission::Refused => tracing::debug!(
                    step_id = %self.step.id,
                    adapter = candidate.id(),
                    "adapter refused by circuit breaker"
                ),
            }
        }

        let mut busy = busy.into_iter();
        while let Some(candidate) = busy.next() {
            let Some(entry) = self.inner.registry.get(candidate.id()) else {
                continue;
            };
            tracing::debug!(
                step_id = %self.step.id,
                adapter = candidate.id(),
                "waiting for half-open probe to settle"
            );
            let admitted = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                permit = self.inner.breaker.admit_or_wait(candidate.id()) => permit,
            };
            if let Some(permit) = admitted {
                candidates.extend(busy);
                return Ok(Some((entry.clone(), permit)));
            }
        }
        Ok(None)
    }

    /// Drive the step to a terminal outcome.
    pub(super) async fn run(self) -> StepOutcome {
        let step_id = self.step.id.clone();
        let capability = self
            .inner
            .router
            .capability_for(&self.step.assignee, &self.step.task_text);

        let ranked = self.inner.eligible(&capability);
        let Some(cheapest) = ranked
            .iter()
            .map(|r| r.profile.cost_per_token)
            .min_by(f64::total_cmp)
        else {
            let error = Error::AdapterUnavailable { capability };
            tracing::warn!(step_id = %step_id, error = %error, "step failed");
            return StepOutcome::failed(step_id, &error, 0, None);
        };
        let estimate = pricing::estimate_step_cost(&self.step.task_text, cheapest);

        let mut candidates: VecDeque<&RankedAdapter> = ranked.iter().collect();
        let mut attempts = 0;
        let mut last: Option<(String, Error)> = None;

        while attempts < MAX_ATTEMPTS {
            if self.cancel.is_cancelled() {
                let adapter = last.map(|(a, _)| a);
                return StepOutcome::failed(step_id, &Error::Cancelled, attempts, adapter);
            }

            let reservation = match self.inner.ledger.reserve(estimate) {
                Ok(r) => r,
                Err(error) => {
                    tracing::warn!(step_id = %step_id, error = %error, "step failed");
                    let adapter = last.map(|(a, _)| a);
                    return StepOutcome::failed(step_id, &error, attempts, adapter);
                }
            };

            let (entry, permit) = match self.next_admitted(&mut candidates).await {
                Ok(Some(admitted)) => admitted,
                Ok(None) => {
                    self.inner.ledger.release(reservation);
                    break;
                }
                Err(error) => {
                    self.inner.ledger.release(reservation);
                    let adapter = last.map(|(a, _)| a);
                    return StepOutcome::failed(step_id, &error, attempts, adapter);
                }
            };
            let adapter_id = entry.adapter().id().to_string();

            if let Some((failed_adapter, error)) = &last {
                tracing::warn!(
                    step_id = %step_id,
                    failed_adapter = %failed_adapter,
                    next_adapter = %adapter_id,
                    error = %error,
                    "retrying step on next-ranked adapter"
                );
                self.emit(ExecutionEvent::StepRetrying {
                    step_id: step_id.clone(),
                    failed_adapter: failed_adapter.clone(),
                    next_adapter: adapter_id.clone(),
                    error: error.to_string(),
                });
            }

            attempts += 1;
            let hints = self.inner.reasoning.hints(&capability, entry.seed());
            self.emit(ExecutionEvent::StepStarted {
                step_id: step_id.clone(),
                adapter: adapter_id.clone(),
                attempt: attempts,
                suppress_reasoning: hints.suppress_reasoning,
            });

            let timeout = entry.seed().timeout.unwrap_or(self.inner.default_timeout);
            let started = Instant::now();
            let result = self.call(&entry, &hints, timeout).await;
            let latency = started.elapsed();

            match result {
                Ok(response) => {
                    self.inner.breaker.complete(permit, true);
                    entry.record(
                        &CallObservation {
                            success: true,
                            latency,
                            token_count: response.token_count,
                            cost: response.cost,
                        },
                        &self.inner.tuning,
                    );
                    self.inner.ledger.commit(
                        reservation,
                        step_id.as_str(),
                        response.cost,
                        &adapter_id,
                        entry.adapter().model(),
                    );
                    tracing::info!(
                        step_id = %step_id,
                        adapter = %adapter_id,
                        tokens = response.token_count,
                        cost = response.cost,
                        latency_ms = latency.as_millis() as u64,
                        preview = %truncate_for_log(&response.text, LOG_PREVIEW_BYTES),
                        "step done"
                    );
                    let result = StepResult {
                        step_id,
                        outcome: Outcome::Success,
                        text: response.text,
                        token_count: response.token_count,
                        cost: response.cost,
                        adapter_used: Some(adapter_id),
                    };
                    return StepOutcome::done(result, attempts);
                }
                Err(Error::Cancelled) => {
                    // Not the adapter's fault: the permit is dropped unrecorded.
                    drop(permit);
                    self.inner.ledger.release(reservation);
                    tracing::info!(step_id = %step_id, adapter = %adapter_id, "step cancelled");
                    return StepOutcome::failed(
                        step_id,
                        &Error::Cancelled,
                        attempts,
                        Some(adapter_id),
                    );
                }
                Err(error) => {
                    self.inner.breaker.complete(permit, false);
                    entry.record(
                        &CallObservation {
                            success: false,
                            latency,
                            token_count: 0,
                            cost: 0.0,
                        },
                        &self.inner.tuning,
                    );
                    self.inner.ledger.release(reservation);
                    let retryable = error.is_retryable();
                    last = Some((adapter_id, error));
                    if !retryable {
                        break;
                    }
                }
            }
        }

        match last {
            Some((adapter, error)) => {
                tracing::warn!(step_id = %step_id, error = %error, attempts, "step failed");
                StepOutcome::failed(step_id, &error, attempts, Some(adapter))
            }
            None => {
                let error = Error::AdapterUnavailable { capability };
                tracing::warn!(step_id = %step_id, error = %error, "step failed");
                StepOutcome::failed(step_id, &error, 0, None)
            }
        }
    }

    /// One streaming call, bounded by `timeout` and the execution's
    /// cancellation token. Chunks are forwarded as they arrive.
    async fn call(
        &self,
        entry: &RegisteredAdapter,
        hints: &CallHints,
        timeout: Duration,
    ) -> Result<AdapterResponse, Error> {
        let adapter_id = entry.adapter().id();

        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = tokio::time::timeout(timeout, self.stream(entry, hints)) => match result {
                Ok(result) => result,
                Err(_) => Err(Error::call_failed(
                    adapter_id,
                    format!("timed out after {} ms", timeout.as_millis()),
                )),
            },
        }
    }

    async fn stream(
        &self,
        entry: &RegisteredAdapter,
        hints: &CallHints,
    ) -> Result<AdapterResponse, Error> {
        let adapter = entry.adapter();
        let adapter_id = adapter.id();
        let mut stream = adapter.call_streaming(&self.step.task_text, hints);
        let mut text = String::new();
        let mut token_count = 0u64;
        let mut cost = 0.0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| as_call_failure(adapter_id, e))?;
            token_count += chunk.token_count_delta;
            cost += chunk.cost_delta;
            if !chunk.text.is_empty() {
                text.push_str(&chunk.text);
                self.emit(ExecutionEvent::Chunk {
                    step_id: self.step.id.clone(),
                    text: chunk.text,
                });
            }
            if chunk.done {
                return Ok(AdapterResponse {
                    text,
                    token_count,
                    cost,
                });
            }
        }
        Err(Error::call_failed(
            adapter_id,
            "stream ended without a terminal chunk",
        ))
    }
}

/// Any error an adapter reports counts as a failure of that adapter.
fn as_call_failure(adapter_id: &str, error: Error) -> Error {
    match error {
        Error::AdapterCallFailed { .. } => error,
        other => Error::call_failed(adapter_id, other.to_string()),
    }
}
