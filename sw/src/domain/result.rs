//! Result types crossing the worker boundary
//!
//! `SpawnResult` is what the external worker agent returns; `TaskResult` is
//! the orchestrator's enriched record of a finished attempt.

use serde::{Deserialize, Serialize};

/// Sentinel `tool_calls` value marking a timeout (distinct from a hollow
/// completion, which reports zero)
pub const TOOL_CALLS_TIMEOUT: i64 = -1;

/// Raw metrics reported by a worker run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub tokens: u64,
    pub duration_ms: u64,
    pub tool_calls: i64,
}

/// Structured wrap-up a worker may attach to its output
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructuredReport {
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(default)]
    pub actions_taken: Vec<String>,
    #[serde(default)]
    pub failures: Vec<String>,
    #[serde(default)]
    pub remaining_work: Vec<String>,
    #[serde(default)]
    pub exit_reason: String,
    #[serde(default)]
    pub suggested_next_steps: Vec<String>,
}

/// What the external worker agent returns from a spawn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnResult {
    pub success: bool,
    pub output: String,
    pub metrics: WorkerMetrics,
    #[serde(default)]
    pub structured: Option<StructuredReport>,
    #[serde(default)]
    pub files_modified: Option<Vec<String>>,
}

impl SpawnResult {
    /// Synthetic failure for a worker that blew through the outer timeout
    pub fn timed_out(elapsed_ms: u64) -> Self {
        Self {
            success: false,
            output: "worker timed out before reporting".to_string(),
            metrics: WorkerMetrics {
                tokens: 0,
                duration_ms: elapsed_ms,
                tool_calls: TOOL_CALLS_TIMEOUT,
            },
            structured: None,
            files_modified: None,
        }
    }

    /// Synthetic failure for an error surfaced by the spawn machinery itself
    pub fn spawn_error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            metrics: WorkerMetrics::default(),
            structured: None,
            files_modified: None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.metrics.tool_calls == TOOL_CALLS_TIMEOUT
    }

    /// The worker's own closing summary, preferring the structured exit
    /// reason over the raw output tail
    pub fn closure_report(&self) -> Option<String> {
        match &self.structured {
            Some(s) if !s.exit_reason.is_empty() => Some(s.exit_reason.clone()),
            _ => None,
        }
    }
}

/// The orchestrator's record of a finished attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    pub output: String,
    pub tokens_used: u64,
    pub cost_used: f64,
    pub duration_ms: u64,
    pub model: String,
    /// `-1` means the attempt timed out
    pub tool_calls: i64,
    pub files_modified: Vec<String>,
    pub findings: Vec<String>,
    pub quality_score: Option<u8>,
    pub quality_feedback: Option<String>,
    pub closure_report: Option<String>,
    /// Fraction of the derived token budget actually consumed
    pub budget_utilization: Option<f64>,
}

impl TaskResult {
    /// Build a result from a spawn return plus dispatch metadata
    pub fn from_spawn(spawn: &SpawnResult, model: &str, cost_used: f64, token_budget: u64) -> Self {
        let budget_utilization = if token_budget > 0 {
            Some(spawn.metrics.tokens as f64 / token_budget as f64)
        } else {
            None
        };
        Self {
            success: spawn.success,
            output: spawn.output.clone(),
            tokens_used: spawn.metrics.tokens,
            cost_used,
            duration_ms: spawn.metrics.duration_ms,
            model: model.to_string(),
            tool_calls: spawn.metrics.tool_calls,
            files_modified: spawn.files_modified.clone().unwrap_or_default(),
            findings: spawn.structured.as_ref().map(|s| s.findings.clone()).unwrap_or_default(),
            quality_score: None,
            quality_feedback: None,
            closure_report: spawn.closure_report(),
            budget_utilization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_sentinel() {
        let spawn = SpawnResult::timed_out(240_000);
        assert!(!spawn.success);
        assert!(spawn.is_timeout());
        assert_eq!(spawn.metrics.tool_calls, TOOL_CALLS_TIMEOUT);
    }

    #[test]
    fn test_from_spawn_carries_metrics() {
        let spawn = SpawnResult {
            success: true,
            output: "done".to_string(),
            metrics: WorkerMetrics {
                tokens: 5000,
                duration_ms: 1234,
                tool_calls: 7,
            },
            structured: Some(StructuredReport {
                findings: vec!["found a thing".to_string()],
                exit_reason: "all phases complete".to_string(),
                ..Default::default()
            }),
            files_modified: Some(vec!["src/lib.rs".to_string()]),
        };

        let result = TaskResult::from_spawn(&spawn, "claude-sonnet-4", 0.05, 10_000);
        assert!(result.success);
        assert_eq!(result.tokens_used, 5000);
        assert_eq!(result.tool_calls, 7);
        assert_eq!(result.files_modified, vec!["src/lib.rs"]);
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.closure_report.as_deref(), Some("all phases complete"));
        assert!((result.budget_utilization.unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_spawn_result_deserialize_defaults() {
        let json = r#"{
            "success": true,
            "output": "ok",
            "metrics": {"tokens": 10, "duration_ms": 20, "tool_calls": 1}
        }"#;
        let spawn: SpawnResult = serde_json::from_str(json).unwrap();
        assert!(spawn.structured.is_none());
        assert!(spawn.files_modified.is_none());
    }
}
