//! Final synthesis
//!
//! Combines the outputs of completed tasks into one deliverable. The
//! synthesizer LLM gets first shot; if it fails, a deterministic
//! concatenation grouped by task type stands in.

use tracing::warn;

use crate::llm::{ChatRequest, ProviderClient};

/// One completed task's contribution to the synthesis
#[derive(Debug)]
pub struct SynthesisInput {
    pub id: String,
    pub task_type: String,
    pub description: String,
    pub output: String,
}

/// Synthesis outcome
#[derive(Debug)]
pub struct SynthesisResult {
    pub text: String,
    /// False when the deterministic fallback produced the text
    pub llm_generated: bool,
    pub tokens_used: u64,
    pub cost_used: f64,
}

/// Per-task output excerpt quoted into the synthesis prompt
const MAX_EXCERPT: usize = 2_000;

/// Combine completed outputs
pub async fn synthesize(
    provider: &dyn ProviderClient,
    model: Option<&str>,
    original_prompt: &str,
    inputs: &[SynthesisInput],
) -> SynthesisResult {
    if inputs.is_empty() {
        return SynthesisResult {
            text: "No tasks completed; nothing to synthesize.".to_string(),
            llm_generated: false,
            tokens_used: 0,
            cost_used: 0.0,
        };
    }

    let mut body = format!("## Original goal\n\n{}\n\n## Completed subtask outputs\n\n", original_prompt);
    for input in inputs {
        let excerpt: String = input.output.chars().take(MAX_EXCERPT).collect();
        body.push_str(&format!(
            "### {} ({}) — {}\n{}\n\n",
            input.id, input.task_type, input.description, excerpt
        ));
    }

    let mut request = ChatRequest::simple(SYNTHESIS_SYSTEM, body, 4096);
    if let Some(model) = model {
        request = request.with_model(model);
    }

    match provider.chat(request).await {
        Ok(response) if !response.text().trim().is_empty() => {
            let tokens_used = response.usage.total();
            let cost_used = response.usage.cost_usd(model.unwrap_or(provider.default_model()));
            SynthesisResult {
                text: response.text().to_string(),
                llm_generated: true,
                tokens_used,
                cost_used,
            }
        }
        Ok(_) => {
            warn!("synthesizer returned empty content; using deterministic fallback");
            SynthesisResult {
                text: fallback(inputs),
                llm_generated: false,
                tokens_used: 0,
                cost_used: 0.0,
            }
        }
        Err(e) => {
            warn!(error = %e, "synthesizer call failed; using deterministic fallback");
            SynthesisResult {
                text: fallback(inputs),
                llm_generated: false,
                tokens_used: 0,
                cost_used: 0.0,
            }
        }
    }
}

/// Deterministic concatenation grouped by task type
fn fallback(inputs: &[SynthesisInput]) -> String {
    let mut types: Vec<&str> = inputs.iter().map(|i| i.task_type.as_str()).collect();
    types.sort();
    types.dedup();

    let mut out = String::from("# Swarm result (deterministic synthesis)\n");
    for ty in types {
        out.push_str(&format!("\n## {}\n\n", ty));
        for input in inputs.iter().filter(|i| i.task_type == ty) {
            let excerpt: String = input.output.chars().take(MAX_EXCERPT).collect();
            out.push_str(&format!("### {} — {}\n{}\n\n", input.id, input.description, excerpt));
        }
    }
    out
}

const SYNTHESIS_SYSTEM: &str = "You are the synthesizer for a swarm of coding agents. Combine the completed \
    subtask outputs into one coherent final report for the user: what was built, where it lives, how the \
    pieces fit, and what (if anything) remains. Be faithful to the outputs; do not invent work.";
