//! Model capability probes
//!
//! Before execution, each distinct worker model gets a one-shot forced
//! tool call. A model that cannot emit a tool call cannot drive a worker
//! agent, so it is marked unhealthy up front instead of failing its first
//! real task slowly.

use std::time::Duration;

use tracing::{info, warn};

use crate::llm::{ChatRequest, ProviderClient, ToolChoice, ToolSpec};

/// Outcome of probing the worker roster
#[derive(Debug, Default)]
pub struct ProbeReport {
    pub passed: Vec<String>,
    pub failed: Vec<String>,
    pub tokens_used: u64,
}

impl ProbeReport {
    pub fn all_failed(&self) -> bool {
        self.passed.is_empty() && !self.failed.is_empty()
    }
}

fn probe_tool() -> ToolSpec {
    ToolSpec::new(
        "confirm_ready",
        "Confirm you can execute tool calls by echoing the given token.",
        serde_json::json!({
            "type": "object",
            "properties": {
                "token": { "type": "string" }
            },
            "required": ["token"]
        }),
    )
}

/// Probe every model with a forced tool call under its own timeout
pub async fn probe_models(provider: &dyn ProviderClient, models: &[String], timeout: Duration) -> ProbeReport {
    let mut report = ProbeReport::default();

    for model in models {
        let request = ChatRequest::simple(
            "You are being probed for tool-call capability. Call confirm_ready with token \"ok\". Do nothing else.",
            "Respond with the tool call only.",
            256,
        )
        .with_model(model.clone())
        .with_tools(vec![probe_tool()], ToolChoice::Required);

        let outcome = tokio::time::timeout(timeout, provider.chat(request)).await;
        match outcome {
            Ok(Ok(response)) => {
                report.tokens_used += response.usage.total();
                if response.tool_calls.is_empty() {
                    warn!(model, "probe returned no tool call");
                    report.failed.push(model.clone());
                } else {
                    info!(model, "probe passed");
                    report.passed.push(model.clone());
                }
            }
            Ok(Err(e)) => {
                warn!(model, error = %e, "probe call failed");
                report.failed.push(model.clone());
            }
            Err(_) => {
                warn!(model, timeout_ms = timeout.as_millis() as u64, "probe timed out");
                report.failed.push(model.clone());
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::client::mock::{MockProvider, text_response};
    use crate::llm::{ChatResponse, StopReason, TokenUsage, ToolInvocation};

    fn tool_call_response() -> ChatResponse {
        ChatResponse {
            content: None,
            tool_calls: vec![ToolInvocation {
                id: "t".to_string(),
                name: "confirm_ready".to_string(),
                input: serde_json::json!({"token": "ok"}),
            }],
            stop_reason: StopReason::ToolUse,
            usage: TokenUsage {
                input_tokens: 50,
                output_tokens: 10,
                cache_read_tokens: 0,
            },
            rate_limit_info: None,
        }
    }

    #[tokio::test]
    async fn test_probe_pass_and_fail() {
        let provider = MockProvider::new(vec![
            Ok(tool_call_response()),
            Ok(text_response("I am ready!")), // prose instead of a tool call
        ]);

        let models = vec!["model-a".to_string(), "model-b".to_string()];
        let report = probe_models(&provider, &models, Duration::from_secs(5)).await;

        assert_eq!(report.passed, vec!["model-a".to_string()]);
        assert_eq!(report.failed, vec!["model-b".to_string()]);
        assert!(!report.all_failed());
    }

    #[tokio::test]
    async fn test_probe_error_counts_as_failure() {
        let provider = MockProvider::new(vec![Err(crate::llm::ProviderError::InvalidResponse("down".to_string()))]);
        let models = vec!["model-a".to_string()];
        let report = probe_models(&provider, &models, Duration::from_secs(5)).await;
        assert!(report.all_failed());
    }
}
