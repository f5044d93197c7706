//! Spend tracking against a rolling budget window.
//!
//! Every step reserves its estimated cost before any adapter is called. The
//! hold is later replaced by the actual cost ([`BudgetLedger::commit`]) or
//! dropped ([`BudgetLedger::release`]). All state sits behind one mutex, so
//! reserve / commit / release are linearizable.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::BudgetConfig;
use crate::error::Error;
use crate::util::lock;

/// Slack for float accumulation when comparing against the limit.
const LIMIT_EPSILON: f64 = 1e-9;

/// Committed charges kept for [`BudgetLedger::entries`].
const ENTRY_RETENTION: usize = 1024;

/// Key used in `by_model` for adapters that report no model.
pub const UNKNOWN_MODEL: &str = "unknown";

/// A provisional hold on the budget, granted by [`BudgetLedger::reserve`].
///
/// Hand it back through `commit` or `release`; a reservation that is simply
/// dropped keeps holding its amount until the window rolls over.
#[derive(Debug, PartialEq)]
#[must_use = "a reservation must be committed or released"]
pub struct Reservation {
    id: u64,
    amount: f64,
}

impl Reservation {
    /// Amount held, in USD.
    pub fn amount(&self) -> f64 {
        self.amount
    }
}

/// One committed charge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub step_id: String,
    pub adapter: String,
    pub model: String,
    pub cost: f64,
    pub committed_at: DateTime<Utc>,
}

/// State of the current budget window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub limit: f64,
    /// Committed spend charged to this window.
    pub spent: f64,
    /// Outstanding holds granted in this window.
    pub reserved: f64,
    pub started_at: DateTime<Utc>,
    pub duration_secs: u64,
}

impl WindowSummary {
    /// Budget still available for new reservations.
    pub fn remaining(&self) -> f64 {
        (self.limit - self.spent - self.reserved).max(0.0)
    }
}

/// Lifetime spend, broken down by adapter and model.
///
/// `total` always equals the sum of `by_adapter`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub total: f64,
    pub by_adapter: BTreeMap<String, f64>,
    pub by_model: BTreeMap<String, f64>,
    pub window: WindowSummary,
}

#[derive(Debug)]
struct Hold {
    amount: f64,
    /// Window the hold was granted in.
    epoch: u64,
}

#[derive(Debug)]
struct LedgerState {
    epoch: u64,
    window_started: Instant,
    window_started_at: DateTime<Utc>,
    spent: f64,
    /// Committed spend in this window, per adapter.
    window_by_adapter: HashMap<String, f64>,
    holds: HashMap<u64, Hold>,
    next_id: u64,
    by_adapter: BTreeMap<String, f64>,
    by_model: BTreeMap<String, f64>,
    entries: VecDeque<LedgerEntry>,
}

impl LedgerState {
    fn roll_if_due(&mut self, window: Duration) {
        let now = Instant::now();
        if now.duration_since(self.window_started) < window {
            return;
        }
        tracing::info!(
            epoch = self.epoch,
            spent = self.spent,
            "budget window rolled over"
        );
        self.epoch += 1;
        self.window_started = now;
        self.window_started_at = Utc::now();
        self.spent = 0.0;
        self.window_by_adapter.clear();
    }

    fn reserved_in_window(&self) -> f64 {
        self.holds
            .values()
            .filter(|h| h.epoch == self.epoch)
            .map(|h| h.amount)
            .sum()
    }
}

/// Tracks spend against a per-window limit.
#[derive(Debug)]
pub struct BudgetLedger {
    limit: f64,
    window: Duration,
    state: Mutex<LedgerState>,
}

impl BudgetLedger {
    pub fn new(limit: f64, window: Duration) -> Self {
        Self {
            limit: limit.max(0.0),
            window,
            state: Mutex::new(LedgerState {
                epoch: 0,
                window_started: Instant::now(),
                window_started_at: Utc::now(),
                spent: 0.0,
                window_by_adapter: HashMap::new(),
                holds: HashMap::new(),
                next_id: 0,
                by_adapter: BTreeMap::new(),
                by_model: BTreeMap::new(),
                entries: VecDeque::new(),
            }),
        }
    }

    pub fn from_config(config: &BudgetConfig) -> Self {
        Self::new(config.limit_usd, Duration::from_secs(config.window_secs))
    }

    pub fn limit(&self) -> f64 {
        self.limit
    }

    /// Hold `estimate` USD against the current window.
    ///
    /// Rejected when committed spend plus outstanding holds plus the new
    /// estimate would exceed the limit.
    pub fn reserve(&self, estimate: f64) -> Result<Reservation, Error> {
        let estimate = estimate.max(0.0);
        let mut state = lock(&self.state);
        state.roll_if_due(self.window);

        let held = state.reserved_in_window();
        if state.spent + held + estimate > self.limit + LIMIT_EPSILON {
            tracing::warn!(
                requested = estimate,
                spent = state.spent,
                reserved = held,
                limit = self.limit,
                "budget reservation rejected"
            );
            return Err(Error::BudgetExceeded {
                requested: estimate,
                spent: state.spent + held,
                limit: self.limit,
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        let epoch = state.epoch;
        state.holds.insert(
            id,
            Hold {
                amount: estimate,
                epoch,
            },
        );
        Ok(Reservation {
            id,
            amount: estimate,
        })
    }

    /// Replace a hold with the actual cost of the step.
    ///
    /// The actual cost is always recorded in the lifetime totals. It is
    /// charged to the current window only if the hold was granted in it; a
    /// hold from a window that has since closed is honored without touching
    /// the new window.
    pub fn commit(
        &self,
        reservation: Reservation,
        step_id: &str,
        actual_cost: f64,
        adapter: &str,
        model: Option<&str>,
    ) {
        let cost = actual_cost.max(0.0);
        let model = model.unwrap_or(UNKNOWN_MODEL);
        let mut state = lock(&self.state);
        state.roll_if_due(self.window);

        let granted_epoch = state
            .holds
            .remove(&reservation.id)
            .map(|h| h.epoch)
            .unwrap_or(state.epoch);
        if granted_epoch == state.epoch {
            state.spent += cost;
            *state
                .window_by_adapter
                .entry(adapter.to_string())
                .or_default() += cost;
        }

        *state.by_adapter.entry(adapter.to_string()).or_default() += cost;
        *state.by_model.entry(model.to_string()).or_default() += cost;
        state.entries.push_back(LedgerEntry {
            step_id: step_id.to_string(),
            adapter: adapter.to_string(),
            model: model.to_string(),
            cost,
            committed_at: Utc::now(),
        });
        while state.entries.len() > ENTRY_RETENTION {
            state.entries.pop_front();
        }

        tracing::debug!(
            step_id,
            adapter,
            cost,
            reserved = reservation.amount,
            "budget committed"
        );
    }

    /// Drop a hold without charging anything.
    pub fn release(&self, reservation: Reservation) {
        let mut state = lock(&self.state);
        state.holds.remove(&reservation.id);
    }

    pub fn summary(&self) -> BudgetSummary {
        let mut state = lock(&self.state);
        state.roll_if_due(self.window);
        BudgetSummary {
            total: state.by_adapter.values().sum(),
            by_adapter: state.by_adapter.clone(),
            by_model: state.by_model.clone(),
            window: WindowSummary {
                limit: self.limit,
                spent: state.spent,
                reserved: state.reserved_in_window(),
                started_at: state.window_started_at,
                duration_secs: self.window.as_secs(),
            },
        }
    }

    /// Spend charged to the current window by `adapter`.
    pub fn window_spend(&self, adapter: &str) -> f64 {
        let mut state = lock(&self.state);
        state.roll_if_due(self.window);
        state.window_by_adapter.get(adapter).copied().unwrap_or(0.0)
    }

    /// The most recent committed charges, oldest first. Totals in
    /// [`summary`](Self::summary) cover every charge, not just these.
    pub fn entries(&self) -> Vec<LedgerEntry> {
        lock(&self.state).entries.iter().cloned().collect()
    }
}
