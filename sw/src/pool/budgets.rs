//! Per-task budget, iteration, timeout and prompt-tier derivation
//!
//! Budgets grow with complexity and with retries (a retry that failed for
//! lack of room should not fail the same way twice); foundation tasks get
//! the most room because everything downstream rides on them.

use std::time::Duration;

use crate::config::{SwarmConfig, WorkerSpec};
use crate::domain::Task;
use crate::prompts::PromptTier;

/// Default token budget range when no per-type override exists
const DEFAULT_TOKEN_RANGE: (u64, u64) = (20_000, 120_000);

/// Worker timeout floor in seconds
const TIMEOUT_FLOOR_SECS: u64 = 240;

/// Foundation tasks run this much longer
const FOUNDATION_TIMEOUT_FACTOR: f64 = 2.5;

/// Retry multipliers for attempts 0 / 1 / 2 / 3+
const RETRY_MULTIPLIERS: [f64; 4] = [1.0, 1.3, 1.6, 2.0];

/// What the pool derived for one dispatch
#[derive(Debug, Clone)]
pub struct DerivedBudgets {
    pub token_budget: u64,
    pub max_iterations: u32,
    /// The agent's own graceful timeout; the pool races against this plus
    /// the outer backstop
    pub timeout: Duration,
    pub tier: PromptTier,
}

fn retry_multiplier(attempts: u32) -> f64 {
    RETRY_MULTIPLIERS[(attempts as usize).min(RETRY_MULTIPLIERS.len() - 1)]
}

fn complexity_multiplier(complexity: u8) -> f64 {
    0.5 + complexity as f64 / 10.0
}

/// Derive budgets for dispatching `task` to `spec`
pub fn derive(task: &Task, spec: &WorkerSpec, config: &SwarmConfig) -> DerivedBudgets {
    let type_cfg = config.task_type(&task.task_type.to_string());
    let retry_mult = retry_multiplier(task.attempts);
    let complexity_mult = complexity_multiplier(task.complexity);

    // Token budget
    let (range_min, range_max) = type_cfg.token_budget_range.unwrap_or(DEFAULT_TOKEN_RANGE);
    let base = match type_cfg.token_budget {
        Some(fixed) => fixed,
        None if task.is_foundation => range_max,
        None => {
            let scaled = range_min as f64 + (range_max - range_min) as f64 * task.complexity as f64 / 10.0;
            (scaled as u64).clamp(range_min, range_max)
        }
    };
    let token_budget = (base as f64 * retry_mult) as u64;

    // Iteration budget
    let base_iterations = type_cfg.max_iterations.unwrap_or(config.swarm.worker_max_iterations);
    let late_retry_boost = if task.attempts >= 2 { 1.5 } else { 1.0 };
    let max_iterations = ((base_iterations as f64 * complexity_mult * retry_mult * late_retry_boost) as u32).max(1);

    // Timeout
    let base_secs = type_cfg
        .timeout_secs
        .unwrap_or_else(|| config.swarm.worker_timeout_secs.max(TIMEOUT_FLOOR_SECS));
    let base_secs = base_secs.max(TIMEOUT_FLOOR_SECS);
    let mut timeout_secs = base_secs as f64;
    if task.is_foundation {
        timeout_secs *= FOUNDATION_TIMEOUT_FACTOR;
    }
    timeout_secs *= complexity_mult * retry_mult;
    let timeout = Duration::from_secs(timeout_secs as u64);

    // Prompt tier
    let tier = match type_cfg.prompt_template.as_deref() {
        Some("minimal") => PromptTier::Minimal,
        Some("reduced") => PromptTier::Reduced,
        Some("full") => PromptTier::Full,
        _ => {
            if task.attempts >= 1 || spec.lightweight {
                PromptTier::Reduced
            } else {
                PromptTier::Full
            }
        }
    };

    DerivedBudgets {
        token_budget,
        max_iterations,
        timeout,
        tier,
    }
}
