//! Manager planning pass
//!
//! A manager-role LLM turns the decomposed task list into acceptance
//! criteria per task plus an integration verification plan. Planning runs
//! in the background, concurrent with the first waves; a planning failure
//! is a recovered warning, never fatal.

use serde::Deserialize;
use tracing::{info, warn};

use crate::llm::{ChatRequest, ProviderClient, ToolChoice, ToolSpec};
use crate::state::{ExecutionPlan, VerifyStep};

/// Outcome of the planning pass
#[derive(Debug)]
pub struct PlanningResult {
    pub plan: ExecutionPlan,
    pub tokens_used: u64,
    pub cost_used: f64,
}

#[derive(Debug, Deserialize)]
struct PlanOutput {
    #[serde(default)]
    criteria: Vec<CriteriaOutput>,
    #[serde(default)]
    verification: Vec<VerifyStepOutput>,
}

#[derive(Debug, Deserialize)]
struct CriteriaOutput {
    #[serde(rename = "taskId")]
    task_id: String,
    criteria: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct VerifyStepOutput {
    command: String,
    #[serde(default = "default_required")]
    required: bool,
}

fn default_required() -> bool {
    true
}

fn plan_tool() -> ToolSpec {
    ToolSpec::new(
        "submit_plan",
        "Submit acceptance criteria and the integration verification plan.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "criteria": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "taskId": { "type": "string" },
                            "criteria": { "type": "array", "items": { "type": "string" } }
                        },
                        "required": ["taskId", "criteria"]
                    }
                },
                "verification": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "command": { "type": "string", "description": "A bash command that exits 0 on success" },
                            "required": { "type": "boolean" }
                        },
                        "required": ["command"]
                    }
                }
            },
            "required": ["criteria", "verification"]
        }),
    )
}

/// Build the plan. Returns `None` on any failure (recorded as a warning).
pub async fn build_plan(
    provider: &dyn ProviderClient,
    model: Option<&str>,
    original_prompt: &str,
    tasks: &[(String, String)],
) -> Option<PlanningResult> {
    let mut task_list = String::new();
    for (id, description) in tasks {
        task_list.push_str(&format!("- {}: {}\n", id, description));
    }

    let user = format!(
        "Overall goal:\n{}\n\nSubtasks:\n{}\nProduce acceptance criteria for each subtask and a short \
         integration verification plan (runnable bash steps).",
        original_prompt, task_list
    );

    let mut request = ChatRequest::simple(PLAN_SYSTEM, user, 4096)
        .with_tools(vec![plan_tool()], ToolChoice::Tool("submit_plan".to_string()));
    if let Some(model) = model {
        request = request.with_model(model);
    }

    let response = match provider.chat(request).await {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "planning call failed; continuing without a plan");
            return None;
        }
    };

    let tokens_used = response.usage.total();
    let cost_used = response.usage.cost_usd(model.unwrap_or(provider.default_model()));

    let output: PlanOutput = match response
        .tool_call("submit_plan")
        .ok_or(())
        .and_then(|call| serde_json::from_value(call.input.clone()).map_err(|_| ()))
    {
        Ok(o) => o,
        Err(()) => {
            warn!("planner reply unparseable; continuing without a plan");
            return None;
        }
    };

    let mut plan = ExecutionPlan::default();
    for c in output.criteria {
        plan.criteria.insert(c.task_id, c.criteria);
    }
    for v in output.verification {
        plan.verification_steps.push(VerifyStep {
            command: v.command,
            required: v.required,
        });
    }

    info!(
        criteria = plan.criteria.len(),
        steps = plan.verification_steps.len(),
        "plan built"
    );

    Some(PlanningResult {
        plan,
        tokens_used,
        cost_used,
    })
}

const PLAN_SYSTEM: &str = "You are the manager of a swarm of coding agents. For each subtask, write 2-4 \
    concrete, checkable acceptance criteria (what must exist or behave for the subtask to count as done). \
    Then write an integration verification plan: a handful of bash steps that exercise the combined result, \
    each marked required or optional. Call submit_plan exactly once.";
