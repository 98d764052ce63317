//! Wave review
//!
//! At the end of a wave the manager role grades the wave's outputs against
//! the acceptance criteria and may emit fix-up tasks, which join the
//! current wave. Review failures are recovered warnings.

use serde::Deserialize;
use tracing::{info, warn};

use crate::domain::{Task, TaskType, id};
use crate::llm::{ChatRequest, ProviderClient, ToolChoice, ToolSpec};
use crate::state::ExecutionPlan;

/// Outcome of a wave review
#[derive(Debug)]
pub struct WaveReview {
    pub fixups: Vec<Task>,
    pub tokens_used: u64,
    pub cost_used: f64,
}

/// Summary of one completed task handed to the reviewer
#[derive(Debug)]
pub struct ReviewedTask {
    pub id: String,
    pub description: String,
    pub output_excerpt: String,
    pub quality_score: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct ReviewOutput {
    #[serde(default)]
    fixups: Vec<FixupOutput>,
}

#[derive(Debug, Deserialize)]
struct FixupOutput {
    #[serde(rename = "fixesTaskId")]
    fixes_task_id: String,
    description: String,
    #[serde(default)]
    instructions: String,
    #[serde(default, rename = "type")]
    task_type: Option<String>,
    #[serde(default)]
    complexity: Option<i64>,
}

fn review_tool() -> ToolSpec {
    ToolSpec::new(
        "submit_review",
        "Submit the wave review. fixups may be empty when the wave holds up.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "fixups": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "fixesTaskId": { "type": "string" },
                            "description": { "type": "string" },
                            "instructions": { "type": "string" },
                            "type": { "type": "string" },
                            "complexity": { "type": "integer" }
                        },
                        "required": ["fixesTaskId", "description"]
                    }
                }
            },
            "required": ["fixups"]
        }),
    )
}

/// Review a finished wave; returns fix-up tasks to append (possibly none)
pub async fn review_wave(
    provider: &dyn ProviderClient,
    model: Option<&str>,
    wave: u32,
    reviewed: &[ReviewedTask],
    plan: Option<&ExecutionPlan>,
) -> Option<WaveReview> {
    if reviewed.is_empty() {
        return None;
    }

    let mut body = format!("## Wave {} results\n\n", wave);
    for task in reviewed {
        body.push_str(&format!("### {} — {}\n", task.id, task.description));
        if let Some(score) = task.quality_score {
            body.push_str(&format!("Quality score: {}/5\n", score));
        }
        if let Some(criteria) = plan.and_then(|p| p.criteria.get(&task.id)) {
            body.push_str("Acceptance criteria:\n");
            for c in criteria {
                body.push_str(&format!("- {}\n", c));
            }
        }
        body.push_str(&format!("Output:\n{}\n\n", task.output_excerpt));
    }

    let mut request = ChatRequest::simple(REVIEW_SYSTEM, body, 2048)
        .with_tools(vec![review_tool()], ToolChoice::Tool("submit_review".to_string()));
    if let Some(model) = model {
        request = request.with_model(model);
    }

    let response = match provider.chat(request).await {
        Ok(r) => r,
        Err(e) => {
            warn!(wave, error = %e, "wave review call failed; skipping review");
            return None;
        }
    };

    let tokens_used = response.usage.total();
    let cost_used = response.usage.cost_usd(model.unwrap_or(provider.default_model()));

    let output: ReviewOutput = match response
        .tool_call("submit_review")
        .and_then(|call| serde_json::from_value(call.input.clone()).ok())
    {
        Some(o) => o,
        None => {
            warn!(wave, "review reply unparseable; skipping review");
            return None;
        }
    };

    let mut fixups = Vec::new();
    for (n, fix) in output.fixups.into_iter().enumerate() {
        // Fix-ups for tasks the reviewer hallucinated are dropped
        if !reviewed.iter().any(|t| t.id == fix.fixes_task_id) {
            warn!(fixes = %fix.fixes_task_id, "reviewer named an unknown task; dropping fixup");
            continue;
        }
        let task_type: TaskType = fix.task_type.unwrap_or_else(|| "implement".to_string()).into();
        let task = Task::new(id::fixup_id(&fix.fixes_task_id, n), fix.description, task_type)
            .with_complexity(fix.complexity.unwrap_or(4).clamp(1, 10) as u8)
            .as_fixup(fix.fixes_task_id, fix.instructions);
        fixups.push(task);
    }

    info!(wave, fixups = fixups.len(), "wave review complete");
    Some(WaveReview {
        fixups,
        tokens_used,
        cost_used,
    })
}

const REVIEW_SYSTEM: &str = "You are the manager reviewing one wave of work from a swarm of coding agents. \
    Compare each task's output against its acceptance criteria. Emit a fixup only for concrete, worth-fixing \
    gaps an agent could close in one sitting; do not emit fixups for style or for work that met its criteria. \
    Call submit_review exactly once.";
