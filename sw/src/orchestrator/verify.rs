//! Verification phase
//!
//! After the DAG drains, the planned verification steps each run in a
//! throwaway agent spawn. Failed required steps feed an LLM fix-up round
//! executed as a mini-wave, then verification re-runs, up to the
//! configured retry count. Verification trouble never fails the run by
//! itself; it is recorded and surfaced.

use std::time::Duration;

use eyre::Result;
use serde::Deserialize;
use tracing::{info, warn};

use super::Orchestrator;
use crate::domain::{Task, TaskType, id};
use crate::events::SwarmEvent;
use crate::llm::{ChatRequest, ProviderClient, ToolChoice, ToolSpec};
use crate::pool::AgentDefinition;
use crate::state::VerifyStep;

/// Timeout for a single verification step agent
const STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// A failed required step, for the fix-up prompt
#[derive(Debug, Clone)]
struct StepFailure {
    index: usize,
    command: String,
    evidence: String,
}

impl Orchestrator {
    pub(super) async fn verification_phase(&mut self) -> Result<()> {
        // The verification plan may still be in flight
        self.join_planning(true).await;

        let steps = match &self.plan {
            Some(plan) if !plan.verification_steps.is_empty() => plan.verification_steps.clone(),
            _ => return Ok(()),
        };

        self.emit(SwarmEvent::VerifyStart { steps: steps.len() });

        let max_retries = self.config.phases.max_verification_retries;
        let mut retries = 0u32;

        loop {
            if self.cancelled() {
                return Ok(());
            }

            let failures = self.run_verification_steps(&steps, retries).await;
            if failures.is_empty() {
                info!(retries, "verification passed");
                self.emit(SwarmEvent::VerifyComplete { passed: true, retries });
                return Ok(());
            }

            if retries >= max_retries {
                warn!(failed = failures.len(), retries, "verification failed after all retries");
                self.log_decision(
                    "verification-exhausted",
                    format!("{} required steps still failing after {} fix-up rounds", failures.len(), retries),
                );
                self.emit(SwarmEvent::VerifyComplete { passed: false, retries });
                return Ok(());
            }
            retries += 1;

            let fixups = self.verification_fixups(&failures, retries).await;
            if fixups.is_empty() {
                self.log_decision("verification-no-fixups", "fix-up call produced nothing; stopping verification");
                self.emit(SwarmEvent::VerifyComplete { passed: false, retries });
                return Ok(());
            }

            for fixup in &fixups {
                self.emit(SwarmEvent::FixupSpawned {
                    task_id: fixup.id.clone(),
                    fixes: "verification".to_string(),
                });
            }
            self.queue.add_fixup_tasks(fixups)?;
            self.drain_ready().await?;
        }
    }

    /// Run every step in its own throwaway agent; collect failed required
    /// steps
    async fn run_verification_steps(&mut self, steps: &[VerifyStep], round: u32) -> Vec<StepFailure> {
        let mut failures = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            if self.cancelled() {
                break;
            }

            let agent_name = format!("verify-step-{}-{}", round, index);
            let def = AgentDefinition {
                name: agent_name.clone(),
                description: format!("verification step {}", index),
                system_prompt: "You are a verification agent. Run exactly the command you are given, then \
                                report honestly."
                    .to_string(),
                model: self
                    .manager_model()
                    .unwrap_or_else(|| self.provider.default_model().to_string()),
                max_token_budget: 10_000,
                max_iterations: 6,
                timeout: STEP_TIMEOUT,
                idle_timeout: None,
                capabilities: vec!["code".to_string()],
                task_type: "test".to_string(),
                denied_tools: self.config.tools.global_denied_tools.clone(),
                doom_loop_threshold: self.config.economics.doom_loop_threshold,
            };

            let prompt = format!(
                "Run exactly this command in the working directory and report the result:\n\n    {}\n\n\
                 Reply with a line `VERDICT: PASS` if it exited 0, or `VERDICT: FAIL` followed by the \
                 relevant error output if it did not.",
                step.command
            );

            let spawn = match self.spawner.register(def).await {
                Ok(()) => {
                    let result = tokio::time::timeout(
                        STEP_TIMEOUT + Duration::from_secs(60),
                        self.spawner.spawn(&agent_name, &prompt),
                    )
                    .await;
                    let _ = self.spawner.unregister(&agent_name).await;
                    match result {
                        Ok(Ok(spawn)) => spawn,
                        Ok(Err(e)) => crate::domain::SpawnResult::spawn_error(e.to_string()),
                        Err(_) => crate::domain::SpawnResult::timed_out(STEP_TIMEOUT.as_millis() as u64),
                    }
                }
                Err(e) => crate::domain::SpawnResult::spawn_error(e.to_string()),
            };

            self.budget.record(spawn.metrics.tokens, 0.0);
            self.stats.total_tokens += spawn.metrics.tokens;

            let passed = step_passed(&spawn);
            self.emit(SwarmEvent::VerifyStep {
                index,
                command: step.command.clone(),
                success: passed,
            });

            if !passed && step.required {
                failures.push(StepFailure {
                    index,
                    command: step.command.clone(),
                    evidence: spawn.output.chars().take(800).collect(),
                });
            }
        }

        failures
    }

    /// Ask the manager for fix-up tasks addressing the failed steps
    async fn verification_fixups(&mut self, failures: &[StepFailure], round: u32) -> Vec<Task> {
        let mut body = String::from("## Failed verification steps\n\n");
        for failure in failures {
            body.push_str(&format!(
                "### Step {}: `{}`\n{}\n\n",
                failure.index, failure.command, failure.evidence
            ));
        }

        let mut request = ChatRequest::simple(VERIFY_FIX_SYSTEM, body, 2048)
            .with_tools(vec![fixup_tool()], ToolChoice::Tool("submit_fixups".to_string()));
        if let Some(model) = self.manager_model() {
            request = request.with_model(model);
        }

        let response = match self.provider.chat(request).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "verification fix-up call failed");
                return Vec::new();
            }
        };

        let model = self.manager_model().unwrap_or_else(|| self.provider.default_model().to_string());
        let tokens = response.usage.total();
        let cost = response.usage.cost_usd(&model);
        self.record_internal_llm("verification-fixups", tokens, cost);

        let Some(output) = response
            .tool_call("submit_fixups")
            .and_then(|call| serde_json::from_value::<FixupsOutput>(call.input.clone()).ok())
        else {
            return Vec::new();
        };

        output
            .fixups
            .into_iter()
            .enumerate()
            .map(|(n, fix)| {
                let task_type: TaskType = fix.task_type.unwrap_or_else(|| "implement".to_string()).into();
                Task::new(
                    format!("{}-r{}", id::verify_fix_id(n), round),
                    fix.description,
                    task_type,
                )
                .with_complexity(fix.complexity.unwrap_or(5).clamp(1, 10) as u8)
                .as_fixup("verification", fix.instructions.unwrap_or_default())
            })
            .collect()
    }
}

fn step_passed(spawn: &crate::domain::SpawnResult) -> bool {
    if !spawn.success {
        return false;
    }
    let upper = spawn.output.to_uppercase();
    if upper.contains("VERDICT: FAIL") {
        return false;
    }
    upper.contains("VERDICT: PASS")
}

#[derive(Debug, Deserialize)]
struct FixupsOutput {
    #[serde(default)]
    fixups: Vec<FixupItem>,
}

#[derive(Debug, Deserialize)]
struct FixupItem {
    description: String,
    #[serde(default, rename = "type")]
    task_type: Option<String>,
    #[serde(default)]
    complexity: Option<i64>,
    #[serde(default)]
    instructions: Option<String>,
}

fn fixup_tool() -> ToolSpec {
    ToolSpec::new(
        "submit_fixups",
        "Submit fix-up tasks addressing the failed verification steps.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "fixups": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "description": { "type": "string" },
                            "type": { "type": "string" },
                            "complexity": { "type": "integer" },
                            "instructions": { "type": "string" }
                        },
                        "required": ["description"]
                    }
                }
            },
            "required": ["fixups"]
        }),
    )
}

const VERIFY_FIX_SYSTEM: &str = "Integration verification failed for a swarm-built change. From the failing \
    steps and their output, produce the smallest set of fix-up tasks (1-3) that would make the required steps \
    pass. Call submit_fixups exactly once.";
