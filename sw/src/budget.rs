//! BudgetPool - aggregate token/cost accounting against hard ceilings
//!
//! The orchestrator asks the pool before every dispatch whether the
//! projected total still fits. A slice of the token budget is reserved for
//! orchestrator-internal calls (decomposition, planning, review, judging,
//! synthesis); the reserve scales with subtask count up to 40%.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::debug;

/// Projected output floor per request
const PROJECTED_OUTPUT_MIN: u64 = 512;

/// Projected output ceiling per request
const PROJECTED_OUTPUT_MAX: u64 = 4096;

/// Reserve ratio hard cap
const MAX_RESERVE_RATIO: f64 = 0.40;

/// Serializable budget snapshot for events and checkpoints
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub tokens_used: u64,
    pub cost_used: f64,
    pub tokens_cap: u64,
    pub cost_cap: f64,
}

struct BudgetInner {
    tokens_used: u64,
    cost_used: f64,
    reserve_ratio: f64,
}

/// Aggregate token/cost pool
pub struct BudgetPool {
    tokens_cap: u64,
    cost_cap: f64,
    inner: Mutex<BudgetInner>,
}

impl BudgetPool {
    pub fn new(tokens_cap: u64, cost_cap: f64, base_reserve_ratio: f64) -> Self {
        Self {
            tokens_cap,
            cost_cap,
            inner: Mutex::new(BudgetInner {
                tokens_used: 0,
                cost_used: 0.0,
                reserve_ratio: base_reserve_ratio.clamp(0.0, MAX_RESERVE_RATIO),
            }),
        }
    }

    /// Scale the orchestrator reserve with the subtask count, capped at 40%
    pub fn set_reserve_for_subtasks(&self, base_ratio: f64, subtasks: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.reserve_ratio = (base_ratio + 0.01 * subtasks as f64).min(MAX_RESERVE_RATIO);
        debug!(reserve_ratio = inner.reserve_ratio, subtasks, "budget reserve set");
    }

    /// Record usage from any finished call or worker run
    pub fn record(&self, tokens: u64, cost: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.tokens_used += tokens;
        inner.cost_used += cost;
    }

    /// Whether anything at all is left under both ceilings
    pub fn has_capacity(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.tokens_used < self.tokens_cap && inner.cost_used < self.cost_cap
    }

    /// Tokens remaining under the cap
    pub fn remaining_tokens(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        self.tokens_cap.saturating_sub(inner.tokens_used)
    }

    /// Projected output for the next request: clamp(512, 4096, 0.1·remaining)
    pub fn projected_output(&self) -> u64 {
        (self.remaining_tokens() / 10).clamp(PROJECTED_OUTPUT_MIN, PROJECTED_OUTPUT_MAX)
    }

    /// Admission check for a worker dispatch: used + projected input +
    /// projected output must fit under the worker share of the cap
    pub fn admit(&self, projected_input: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        let worker_cap = (self.tokens_cap as f64 * (1.0 - inner.reserve_ratio)) as u64;
        let projected_out = (self.tokens_cap.saturating_sub(inner.tokens_used) / 10)
            .clamp(PROJECTED_OUTPUT_MIN, PROJECTED_OUTPUT_MAX);
        let fits = inner.tokens_used + projected_input + projected_out <= worker_cap && inner.cost_used < self.cost_cap;
        if !fits {
            debug!(
                tokens_used = inner.tokens_used,
                projected_input, projected_out, worker_cap, "budget admission refused"
            );
        }
        fits
    }

    /// Admission check for an orchestrator-internal call (the reserve does
    /// not gate these; only the hard ceilings do)
    pub fn admit_internal(&self, projected_input: u64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.tokens_used + projected_input <= self.tokens_cap && inner.cost_used < self.cost_cap
    }

    /// Hard ceilings
    pub fn limits(&self) -> (u64, f64) {
        (self.tokens_cap, self.cost_cap)
    }

    /// Snapshot for events and checkpoints
    pub fn snapshot(&self) -> BudgetSnapshot {
        let inner = self.inner.lock().unwrap();
        BudgetSnapshot {
            tokens_used: inner.tokens_used,
            cost_used: inner.cost_used,
            tokens_cap: self.tokens_cap,
            cost_cap: self.cost_cap,
        }
    }

    /// Restore usage counters from a checkpoint
    pub fn restore(&self, tokens_used: u64, cost_used: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.tokens_used = tokens_used;
        inner.cost_used = cost_used;
    }
}
