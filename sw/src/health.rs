//! HealthTracker - per-model success/failure accounting
//!
//! The healthy bit flips false when failures outpace successes by a running
//! threshold or on an explicit mark (failed capability probe, repeated
//! hollow completions), and recovers after a streak of clean successes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Failures may exceed successes by this much before the bit flips
const FAILURE_MARGIN: u64 = 2;

/// Clean successes needed to restore an unhealthy model
const RECOVERY_STREAK: u64 = 3;

/// Kind of failure being recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// HTTP 429
    RateLimit,
    /// HTTP 402
    SpendLimit,
    /// Anything else (timeouts, hollow completions, API errors)
    Other,
}

/// Per-model health record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthRecord {
    pub successes: u64,
    pub failures: u64,
    pub rate_limits: u64,
    pub last_rate_limit: Option<DateTime<Utc>>,
    pub average_latency_ms: u64,
    pub healthy: bool,
    /// Successes since the last failure (recovery streak)
    #[serde(default)]
    pub consecutive_successes: u64,
    /// Set by an explicit mark; only a recovery streak clears it
    #[serde(default)]
    pub marked_unhealthy: bool,
}

impl HealthRecord {
    fn fresh() -> Self {
        Self {
            healthy: true,
            ..Default::default()
        }
    }

    fn reevaluate(&mut self) {
        if self.marked_unhealthy {
            self.healthy = false;
            return;
        }
        if self.failures > self.successes + FAILURE_MARGIN {
            self.healthy = false;
        } else if !self.healthy && self.consecutive_successes >= RECOVERY_STREAK {
            self.healthy = true;
        }
    }
}

/// Tracks health across all known models
pub struct HealthTracker {
    records: Mutex<HashMap<String, HealthRecord>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Record a successful call with its latency
    pub fn record_success(&self, model: &str, latency_ms: u64) {
        let mut records = self.records.lock().unwrap();
        let rec = records.entry(model.to_string()).or_insert_with(HealthRecord::fresh);
        rec.successes += 1;
        rec.consecutive_successes += 1;
        // Running average, weighted toward history
        rec.average_latency_ms = if rec.successes == 1 {
            latency_ms
        } else {
            (rec.average_latency_ms * 3 + latency_ms) / 4
        };
        if rec.consecutive_successes >= RECOVERY_STREAK {
            rec.marked_unhealthy = false;
        }
        rec.reevaluate();
    }

    /// Record a failed call
    pub fn record_failure(&self, model: &str, kind: FailureKind) {
        let mut records = self.records.lock().unwrap();
        let rec = records.entry(model.to_string()).or_insert_with(HealthRecord::fresh);
        rec.failures += 1;
        rec.consecutive_successes = 0;
        if matches!(kind, FailureKind::RateLimit | FailureKind::SpendLimit) {
            rec.rate_limits += 1;
            rec.last_rate_limit = Some(Utc::now());
        }
        rec.reevaluate();
        if !rec.healthy {
            warn!(model, failures = rec.failures, "model now unhealthy");
        }
    }

    /// Explicitly mark a model unhealthy (failed probe, repeated hollow runs)
    pub fn mark_unhealthy(&self, model: &str) {
        let mut records = self.records.lock().unwrap();
        let rec = records.entry(model.to_string()).or_insert_with(HealthRecord::fresh);
        rec.marked_unhealthy = true;
        rec.consecutive_successes = 0;
        rec.reevaluate();
        debug!(model, "model explicitly marked unhealthy");
    }

    /// Healthy bit; unknown models are presumed healthy
    pub fn is_healthy(&self, model: &str) -> bool {
        let records = self.records.lock().unwrap();
        records.get(model).map(|r| r.healthy).unwrap_or(true)
    }

    /// All records, for checkpoints and events
    pub fn get_all_records(&self) -> Vec<(String, HealthRecord)> {
        let records = self.records.lock().unwrap();
        let mut out: Vec<_> = records.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Restore from checkpointed records
    pub fn restore(&self, saved: Vec<(String, HealthRecord)>) {
        let mut records = self.records.lock().unwrap();
        records.clear();
        for (model, rec) in saved {
            records.insert(model, rec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_model_presumed_healthy() {
        let tracker = HealthTracker::new();
        assert!(tracker.is_healthy("claude-sonnet-4"));
    }

    #[test]
    fn test_failures_outpacing_successes_flip_bit() {
        let tracker = HealthTracker::new();
        tracker.record_success("m", 100);

        for _ in 0..3 {
            tracker.record_failure("m", FailureKind::Other);
        }
        assert!(tracker.is_healthy("m")); // 3 failures vs 1 success + margin 2

        tracker.record_failure("m", FailureKind::Other);
        assert!(!tracker.is_healthy("m"));
    }

    #[test]
    fn test_recovery_after_streak() {
        let tracker = HealthTracker::new();
        for _ in 0..4 {
            tracker.record_failure("m", FailureKind::Other);
        }
        assert!(!tracker.is_healthy("m"));

        tracker.record_success("m", 50);
        tracker.record_success("m", 50);
        assert!(!tracker.is_healthy("m"));

        tracker.record_success("m", 50);
        assert!(tracker.is_healthy("m"));
    }

    #[test]
    fn test_explicit_mark_sticks_until_streak() {
        let tracker = HealthTracker::new();
        tracker.mark_unhealthy("m");
        assert!(!tracker.is_healthy("m"));

        // One success is not enough to clear an explicit mark
        tracker.record_success("m", 10);
        assert!(!tracker.is_healthy("m"));

        tracker.record_success("m", 10);
        tracker.record_success("m", 10);
        assert!(tracker.is_healthy("m"));
    }

    #[test]
    fn test_rate_limits_tracked() {
        let tracker = HealthTracker::new();
        tracker.record_failure("m", FailureKind::RateLimit);
        tracker.record_failure("m", FailureKind::SpendLimit);
        tracker.record_failure("m", FailureKind::Other);

        let records = tracker.get_all_records();
        assert_eq!(records.len(), 1);
        let (_, rec) = &records[0];
        assert_eq!(rec.failures, 3);
        assert_eq!(rec.rate_limits, 2);
        assert!(rec.last_rate_limit.is_some());
    }

    #[test]
    fn test_restore_roundtrip() {
        let tracker = HealthTracker::new();
        tracker.record_success("a", 100);
        tracker.mark_unhealthy("b");

        let saved = tracker.get_all_records();

        let restored = HealthTracker::new();
        restored.restore(saved);
        assert!(restored.is_healthy("a"));
        assert!(!restored.is_healthy("b"));
    }

    #[test]
    fn test_latency_running_average() {
        let tracker = HealthTracker::new();
        tracker.record_success("m", 100);
        tracker.record_success("m", 200);

        let records = tracker.get_all_records();
        let (_, rec) = &records[0];
        // (100*3 + 200) / 4 = 125
        assert_eq!(rec.average_latency_ms, 125);
    }
}
