//! User-visible run outcome

use serde::{Deserialize, Serialize};

use crate::domain::Task;
use crate::state::SwarmStats;

/// Fraction of tasks that must complete for the run to count as a success
pub const SUCCESS_RATIO: f64 = 0.7;

/// Per-task summary row in the outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSummary {
    pub id: String,
    pub description: String,
    pub task_type: String,
    pub status: String,
    pub wave: u32,
    pub attempts: u32,
    pub quality_score: Option<u8>,
    pub model: Option<String>,
    pub tokens_used: u64,
}

impl TaskSummary {
    pub fn from_task(task: &Task) -> Self {
        let result = task.result();
        Self {
            id: task.id.clone(),
            description: task.description.clone(),
            task_type: task.task_type.to_string(),
            status: task.status_name().to_string(),
            wave: task.wave,
            attempts: task.attempts,
            quality_score: result.and_then(|r| r.quality_score),
            model: result.map(|r| r.model.clone()).or_else(|| task.assigned_model.clone()),
            tokens_used: result.map(|r| r.tokens_used).unwrap_or(0),
        }
    }
}

/// What a swarm run hands back to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmOutcome {
    pub session_id: String,
    /// completed/total reached the success ratio
    pub success: bool,
    /// Something completed, but below the success ratio
    pub partial_success: bool,
    /// Success with residual failed/skipped tasks
    pub partial_failure: bool,
    pub summary: String,
    pub synthesis_result: Option<String>,
    /// Deduplicated union of files modified by completed tasks
    pub artifact_inventory: Vec<String>,
    pub tasks: Vec<TaskSummary>,
    pub stats: SwarmStats,
    pub errors: Vec<String>,
}

impl SwarmOutcome {
    /// Classify an outcome from the terminal task census
    pub fn classify(completed: usize, total: usize) -> (bool, bool, bool) {
        if total == 0 {
            return (false, false, false);
        }
        let ratio = completed as f64 / total as f64;
        if ratio >= SUCCESS_RATIO {
            let partial_failure = completed < total;
            (true, false, partial_failure)
        } else if completed > 0 {
            (false, true, false)
        } else {
            (false, false, false)
        }
    }
}
