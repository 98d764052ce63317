//! Mid-swarm replanning
//!
//! When a run is clearly stalled, the orchestrator asks the decomposer for
//! fresh subtasks once - and only once - feeding it what has completed so
//! far. New tasks may depend only on already-completed work and join the
//! current wave.

use serde::Deserialize;
use tracing::{info, warn};

use crate::domain::{Task, TaskType, id};
use crate::llm::{ChatRequest, ProviderClient, ToolChoice, ToolSpec};

/// Outcome of a replan call
#[derive(Debug)]
pub struct ReplanResult {
    pub tasks: Vec<Task>,
    pub tokens_used: u64,
    pub cost_used: f64,
}

#[derive(Debug, Deserialize)]
struct ReplanOutput {
    subtasks: Vec<ReplanSubtask>,
}

#[derive(Debug, Deserialize)]
struct ReplanSubtask {
    description: String,
    #[serde(rename = "type")]
    task_type: String,
    complexity: i64,
    /// Ids of already-completed tasks whose outputs this one builds on
    #[serde(default, rename = "buildsOn")]
    builds_on: Vec<String>,
}

fn replan_tool() -> ToolSpec {
    ToolSpec::new(
        "submit_replan",
        "Submit replacement subtasks for the stalled remainder of the run.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "subtasks": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "description": { "type": "string" },
                            "type": { "type": "string" },
                            "complexity": { "type": "integer", "minimum": 1, "maximum": 10 },
                            "buildsOn": {
                                "type": "array",
                                "items": { "type": "string" },
                                "description": "Ids of COMPLETED tasks this subtask builds on"
                            }
                        },
                        "required": ["description", "type", "complexity"]
                    }
                }
            },
            "required": ["subtasks"]
        }),
    )
}

/// Ask for a fresh plan of the stalled remainder
pub async fn replan(
    provider: &dyn ProviderClient,
    model: Option<&str>,
    original_prompt: &str,
    completed_summary: &str,
    stuck: &[String],
) -> Option<ReplanResult> {
    let user = format!(
        "Original goal:\n{}\n\n## Completed so far\n{}\n\n## Stuck (failed or skipped)\n{}\n\n\
         Plan a different route to the goal from here. Subtasks may build on completed work only.",
        original_prompt,
        completed_summary,
        stuck.join(", ")
    );

    let mut request = ChatRequest::simple(REPLAN_SYSTEM, user, 4096)
        .with_tools(vec![replan_tool()], ToolChoice::Tool("submit_replan".to_string()));
    if let Some(model) = model {
        request = request.with_model(model);
    }

    let response = match provider.chat(request).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "replan call failed");
            return None;
        }
    };

    let tokens_used = response.usage.total();
    let cost_used = response.usage.cost_usd(model.unwrap_or(provider.default_model()));

    let output: ReplanOutput = match response
        .tool_call("submit_replan")
        .and_then(|call| serde_json::from_value(call.input.clone()).ok())
    {
        Some(o) => o,
        None => {
            warn!("replan reply unparseable");
            return None;
        }
    };

    if output.subtasks.is_empty() {
        warn!("replan produced no subtasks");
        return None;
    }

    let tasks: Vec<Task> = output
        .subtasks
        .into_iter()
        .enumerate()
        .map(|(n, sub)| {
            let task_type: TaskType = sub.task_type.into();
            Task::new(id::replan_id(n), sub.description, task_type)
                .with_complexity(sub.complexity.clamp(1, 10) as u8)
                .with_dependencies(sub.builds_on)
        })
        .collect();

    info!(count = tasks.len(), "replan produced new subtasks");
    Some(ReplanResult {
        tasks,
        tokens_used,
        cost_used,
    })
}

const REPLAN_SYSTEM: &str = "You are replanning a stalled swarm run. Much of the original plan failed; design \
    a different, smaller route to the goal that builds only on work that actually completed. Prefer 2-5 \
    concrete subtasks. Call submit_replan exactly once.";
