//! Per-adapter circuit breaking.
//!
//! Each adapter id owns an independent circuit:
//! - **Closed**: calls flow; failures inside the sliding window are counted.
//! - **Open**: calls are refused until the cool-down elapses.
//! - **HalfOpen**: exactly one probe call is admitted; its outcome closes or
//!   re-opens the circuit.
//!
//! Time is read from `tokio::time::Instant`, so tests can drive transitions
//! with a paused clock.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::util::{lock, read, write};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Thresholds shared by every circuit of a breaker.
#[derive(Debug, Clone, Copy)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

impl From<&BreakerConfig> for BreakerPolicy {
    fn from(c: &BreakerConfig) -> Self {
        Self {
            failure_threshold: c.failure_threshold,
            failure_window: Duration::from_secs(c.failure_window_secs),
            cooldown: Duration::from_secs(c.cooldown_secs),
        }
    }
}

/// Point-in-time view of one circuit.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitSnapshot {
    pub adapter_id: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    pub probe_in_flight: bool,
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    /// Timestamps of the current failure streak, oldest first.
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    /// Bumped on every state transition. Permits remember the epoch they
    /// were admitted under.
    epoch: u64,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            probe_in_flight: false,
            epoch: 0,
        }
    }

    /// Apply time-driven transitions: drop failures that slid out of the
    /// window and move Open → HalfOpen once the cool-down has elapsed.
    fn refresh(&mut self, policy: &BreakerPolicy, now: Instant, adapter_id: &str) {
        while let Some(&oldest) = self.failures.front() {
            if now.duration_since(oldest) > policy.failure_window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        if self.state == CircuitState::Open
            && let Some(opened_at) = self.opened_at
            && now.duration_since(opened_at) >= policy.cooldown
        {
            self.state = CircuitState::HalfOpen;
            self.probe_in_flight = false;
            self.epoch += 1;
            tracing::info!(adapter = adapter_id, "circuit half-open, admitting one probe");
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
        self.epoch += 1;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failures.clear();
        self.opened_at = None;
        self.probe_in_flight = false;
        self.epoch += 1;
    }
}

/// A circuit plus the signal fired whenever its half-open probe settles.
#[derive(Debug)]
struct Slot {
    circuit: Mutex<Circuit>,
    settled: Notify,
}

impl Slot {
    fn new() -> Self {
        Self {
            circuit: Mutex::new(Circuit::new()),
            settled: Notify::new(),
        }
    }
}

/// How a call was admitted by [`CircuitBreaker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionKind {
    /// Circuit closed, normal traffic.
    Normal,
    /// The single half-open probe.
    Probe,
}

/// Answer to a non-blocking admission request.
#[derive(Debug)]
pub enum Admission {
    Granted(CallPermit),
    /// Half-open with its probe already in flight. The caller may wait for
    /// the probe with [`CircuitBreaker::admit_or_wait`] or move on.
    ProbeBusy,
    /// Open.
    Refused,
}

/// Permission to call one adapter.
///
/// Hand it back through [`CircuitBreaker::complete`] with the call's
/// outcome. Dropping an unfinished probe permit (e.g. on cancellation) frees
/// the probe slot without counting as success or failure.
#[derive(Debug)]
pub struct CallPermit {
    adapter_id: String,
    kind: AdmissionKind,
    epoch: u64,
    slot: Arc<Slot>,
    settled: bool,
}

impl CallPermit {
    pub fn adapter_id(&self) -> &str {
        &self.adapter_id
    }

    pub fn kind(&self) -> AdmissionKind {
        self.kind
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.settled || self.kind != AdmissionKind::Probe {
            return;
        }
        {
            let mut c = lock(&self.slot.circuit);
            if c.state == CircuitState::HalfOpen && c.epoch == self.epoch {
                c.probe_in_flight = false;
            }
        }
        self.slot.settled.notify_waiters();
    }
}

/// Tracks adapter health and gates access to failing adapters.
///
/// Each circuit sits behind its own mutex, so bookkeeping for one adapter
/// never waits on another. No lock is held while an adapter call runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    circuits: RwLock<HashMap<String, Arc<Slot>>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerPolicy::default())
    }
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            circuits: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    fn slot(&self, adapter_id: &str) -> Arc<Slot> {
        if let Some(slot) = read(&self.circuits).get(adapter_id) {
            return slot.clone();
        }
        write(&self.circuits)
            .entry(adapter_id.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    /// `true` for Closed and HalfOpen circuits, `false` for Open ones.
    ///
    /// A HalfOpen circuit is eligible even while its probe is in flight;
    /// [`admit`](Self::admit) is what enforces the single probe.
    pub fn is_eligible(&self, adapter_id: &str) -> bool {
        let slot = self.slot(adapter_id);
        let mut c = lock(&slot.circuit);
        c.refresh(&self.policy, Instant::now(), adapter_id);
        c.state != CircuitState::Open
    }

    /// Current state, after applying time-driven transitions.
    pub fn state(&self, adapter_id: &str) -> CircuitState {
        self.snapshot(adapter_id).state
    }

    /// Try to obtain a call permit without waiting.
    pub fn try_admit(&self, adapter_id: &str) -> Admission {
        let slot = self.slot(adapter_id);
        let mut c = lock(&slot.circuit);
        c.refresh(&self.policy, Instant::now(), adapter_id);
        let (state, epoch) = (c.state, c.epoch);
        let kind = match state {
            CircuitState::Closed => AdmissionKind::Normal,
            CircuitState::HalfOpen if !c.probe_in_flight => {
                c.probe_in_flight = true;
                AdmissionKind::Probe
            }
            CircuitState::HalfOpen => return Admission::ProbeBusy,
            CircuitState::Open => return Admission::Refused,
        };
        drop(c);
        Admission::Granted(CallPermit {
            adapter_id: adapter_id.to_string(),
            kind,
            epoch,
            slot,
            settled: false,
        })
    }

    /// Like [`try_admit`](Self::try_admit), collapsing every refusal to `None`.
    pub fn admit(&self, adapter_id: &str) -> Option<CallPermit> {
        match self.try_admit(adapter_id) {
            Admission::Granted(permit) => Some(permit),
            Admission::ProbeBusy | Admission::Refused => None,
        }
    }

    /// Obtain a permit, waiting out any half-open probe in flight.
    ///
    /// Resolves to `None` only when the circuit is (or becomes) open.
    pub async fn admit_or_wait(&self, adapter_id: &str) -> Option<CallPermit> {
        let slot = self.slot(adapter_id);
        loop {
            // Registered before the check so a probe settling in between
            // still wakes us.
            let settled = slot.settled.notified();
            match self.try_admit(adapter_id) {
                Admission::Granted(permit) => return Some(permit),
                Admission::Refused => return None,
                Admission::ProbeBusy => settled.await,
            }
        }
    }

    /// Record the outcome of a call made under `permit`.
    ///
    /// Outcomes of permits admitted under an earlier circuit state are
    /// ignored: a call let through while closed says nothing about a later
    /// half-open probe.
    pub fn complete(&self, mut permit: CallPermit, success: bool) {
        permit.settled = true;
        let now = Instant::now();
        let probe_settled = {
            let mut c = lock(&permit.slot.circuit);
            c.refresh(&self.policy, now, &permit.adapter_id);
            if c.epoch != permit.epoch {
                tracing::debug!(
                    adapter = %permit.adapter_id,
                    success,
                    "ignoring outcome admitted under an earlier circuit state"
                );
                false
            } else {
                self.apply(&mut c, now, &permit.adapter_id, success)
            }
        };
        if probe_settled || permit.kind == AdmissionKind::Probe {
            permit.slot.settled.notify_waiters();
        }
    }

    /// Record a call outcome for `adapter_id` against its current state.
    pub fn record_outcome(&self, adapter_id: &str, success: bool) {
        let now = Instant::now();
        let slot = self.slot(adapter_id);
        let probe_settled = {
            let mut c = lock(&slot.circuit);
            c.refresh(&self.policy, now, adapter_id);
            self.apply(&mut c, now, adapter_id, success)
        };
        if probe_settled {
            slot.settled.notify_waiters();
        }
    }

    /// Returns `true` when the outcome settled a half-open circuit.
    fn apply(&self, c: &mut Circuit, now: Instant, adapter_id: &str, success: bool) -> bool {
        match (c.state, success) {
            (CircuitState::Closed, true) => {
                // Any success resets the streak.
                c.failures.clear();
                false
            }
            (CircuitState::Closed, false) => {
                c.failures.push_back(now);
                if c.failures.len() >= self.policy.failure_threshold as usize {
                    c.open(now);
                    tracing::warn!(
                        adapter = adapter_id,
                        failures = c.failures.len(),
                        cooldown_secs = self.policy.cooldown.as_secs(),
                        "circuit opened"
                    );
                }
                false
            }
            (CircuitState::HalfOpen, true) => {
                c.close();
                tracing::info!(adapter = adapter_id, "probe succeeded, circuit closed");
                true
            }
            (CircuitState::HalfOpen, false) => {
                c.failures.push_back(now);
                c.open(now);
                tracing::warn!(adapter = adapter_id, "probe failed, circuit re-opened");
                true
            }
            (CircuitState::Open, _) => false,
        }
    }

    /// Reset a circuit to Closed (manual recovery).
    pub fn reset(&self, adapter_id: &str) {
        let slot = self.slot(adapter_id);
        {
            let mut c = lock(&slot.circuit);
            let epoch = c.epoch + 1;
            *c = Circuit::new();
            c.epoch = epoch;
        }
        slot.settled.notify_waiters();
        tracing::info!(adapter = adapter_id, "circuit manually reset");
    }

    pub fn snapshot(&self, adapter_id: &str) -> CircuitSnapshot {
        let slot = self.slot(adapter_id);
        let mut c = lock(&slot.circuit);
        c.refresh(&self.policy, Instant::now(), adapter_id);
        CircuitSnapshot {
            adapter_id: adapter_id.to_string(),
            state: c.state,
            consecutive_failures: c.failures.len() as u32,
            opened_at: c.opened_at,
            probe_in_flight: c.probe_in_flight,
        }
    }

    /// Snapshots of every circuit seen so far, ordered by adapter id.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let mut ids: Vec<String> = read(&self.circuits).keys().cloned().collect();
        ids.sort();
        ids.iter().map(|id| self.snapshot(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::default()
    }

    fn fail_n(b: &CircuitBreaker, id: &str, n: usize) {
        for _ in 0..n {
            b.record_outcome(id, false);
        }
    }

    #[test]
    fn circuit_state_serializes_snake_case() {
        let json = serde_json::to_string(&CircuitState::HalfOpen).unwrap();
        assert_eq!(json, "\"half_open\"");
        let parsed: CircuitState = serde_json::from_str("\"open\"").unwrap();
        assert_eq!(parsed, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_adapter_starts_closed() {
        let b = breaker();
        assert!(b.is_eligible("fresh"));
        assert_eq!(b.state("fresh"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_exactly_threshold_failures() {
        let b = breaker();
        fail_n(&b, "p", 4);
        assert!(b.is_eligible("p"));
        assert_eq!(b.snapshot("p").consecutive_failures, 4);

        b.record_outcome("p", false);
        assert!(!b.is_eligible("p"));
        assert_eq!(b.state("p"), CircuitState::Open);
        assert!(b.admit("p").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_streak() {
        let b = breaker();
        fail_n(&b, "p", 4);
        b.record_outcome("p", true);
        assert_eq!(b.snapshot("p").consecutive_failures, 0);
        fail_n(&b, "p", 4);
        assert!(b.is_eligible("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_outside_window_do_not_count() {
        let b = breaker();
        fail_n(&b, "p", 4);
        tokio::time::advance(Duration::from_secs(61)).await;
        b.record_outcome("p", false);
        assert!(b.is_eligible("p"));
        assert_eq!(b.snapshot("p").consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_cooldown_admits_single_probe() {
        let b = breaker();
        fail_n(&b, "p", 5);
        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!b.is_eligible("p"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.is_eligible("p"));
        assert_eq!(b.state("p"), CircuitState::HalfOpen);

        let probe = b.admit("p").expect("first probe admitted");
        assert_eq!(probe.kind(), AdmissionKind::Probe);
        assert!(b.admit("p").is_none(), "second probe must be refused");
        drop(probe);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_success_closes_circuit() {
        let b = breaker();
        fail_n(&b, "p", 5);
        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = b.admit("p").unwrap();
        b.complete(probe, true);
        assert_eq!(b.state("p"), CircuitState::Closed);
        assert_eq!(b.snapshot("p").consecutive_failures, 0);
        assert_eq!(b.admit("p").unwrap().kind(), AdmissionKind::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_failure_reopens_and_restarts_cooldown() {
        let b = breaker();
        fail_n(&b, "p", 5);
        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = b.admit("p").unwrap();
        b.complete(probe, false);
        assert_eq!(b.state("p"), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!b.is_eligible("p"));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(b.is_eligible("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_probe_frees_slot() {
        let b = breaker();
        fail_n(&b, "p", 5);
        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = b.admit("p").unwrap();
        assert!(b.snapshot("p").probe_in_flight);
        drop(probe);
        assert!(!b.snapshot("p").probe_in_flight);
        assert!(b.admit("p").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn busy_half_open_slot_is_distinguished_from_open() {
        let b = breaker();
        fail_n(&b, "p", 5);
        assert!(matches!(b.try_admit("p"), Admission::Refused));
        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = b.admit("p").unwrap();
        assert!(matches!(b.try_admit("p"), Admission::ProbeBusy));
        drop(probe);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_admitted_once_half_open_call_succeeds() {
        let b = Arc::new(breaker());
        fail_n(&b, "p", 5);
        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = b.admit("p").unwrap();

        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.admit_or_wait("p").await.map(|p| p.kind()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        b.complete(probe, true);
        assert_eq!(waiter.await.unwrap(), Some(AdmissionKind::Normal));
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gives_up_when_half_open_call_fails() {
        let b = Arc::new(breaker());
        fail_n(&b, "p", 5);
        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = b.admit("p").unwrap();

        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.admit_or_wait("p").await.is_some() })
        };
        tokio::task::yield_now().await;
        b.complete(probe, false);
        assert!(!waiter.await.unwrap());
        assert_eq!(b.state("p"), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_takes_over_abandoned_half_open_slot() {
        let b = Arc::new(breaker());
        fail_n(&b, "p", 5);
        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = b.admit("p").unwrap();

        let waiter = {
            let b = b.clone();
            tokio::spawn(async move { b.admit_or_wait("p").await.map(|p| p.kind()) })
        };
        tokio::task::yield_now().await;
        drop(probe);
        assert_eq!(waiter.await.unwrap(), Some(AdmissionKind::Probe));
    }

    #[tokio::test(start_paused = true)]
    async fn late_normal_outcome_does_not_settle_half_open_call() {
        let b = breaker();
        let stale = b.admit("p").unwrap();
        assert_eq!(stale.kind(), AdmissionKind::Normal);

        fail_n(&b, "p", 5);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(b.state("p"), CircuitState::HalfOpen);

        b.complete(stale, true);
        assert_eq!(b.state("p"), CircuitState::HalfOpen);
        let probe = b.admit("p").expect("probe slot still free");
        assert_eq!(probe.kind(), AdmissionKind::Probe);
    }

    #[tokio::test(start_paused = true)]
    async fn circuits_are_independent() {
        let b = breaker();
        fail_n(&b, "a", 5);
        assert!(!b.is_eligible("a"));
        assert!(b.is_eligible("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_closes_open_circuit() {
        let b = breaker();
        fail_n(&b, "p", 5);
        b.reset("p");
        assert!(b.is_eligible("p"));
        assert_eq!(b.snapshot("p").consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_threshold_from_config() {
        let config = BreakerConfig {
            failure_threshold: 2,
            failure_window_secs: 10,
            cooldown_secs: 5,
        };
        let b = CircuitBreaker::new(BreakerPolicy::from(&config));
        fail_n(&b, "p", 2);
        assert!(!b.is_eligible("p"));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(b.is_eligible("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshots_are_sorted() {
        let b = breaker();
        b.record_outcome("zeta", true);
        b.record_outcome("alpha", false);
        let ids: Vec<_> = b.snapshots().into_iter().map(|s| s.adapter_id).collect();
        assert_eq!(ids, vec!["alpha", "zeta"]);
    }
}
