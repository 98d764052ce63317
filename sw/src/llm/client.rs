//! ProviderClient trait definition

use async_trait::async_trait;

use super::{ChatRequest, ChatResponse, ProviderError};

/// Stateless provider client - each call is independent (fresh context)
///
/// This is the single abstraction every orchestrator-internal LLM call goes
/// through: decomposition, planning, wave review, judging, verification
/// fix-ups and synthesis. The throttle wraps an implementation of this trait
/// and intercepts only `chat`; the read-only accessors pass through.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Provider name for logs and events
    fn name(&self) -> &str;

    /// Model used when a request does not pin one
    fn default_model(&self) -> &str;

    /// Send a single chat request (blocking until complete)
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use crate::llm::{StopReason, TokenUsage};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock provider for unit tests: scripted responses, call counter
    pub struct MockProvider {
        responses: Mutex<Vec<Result<ChatResponse, ProviderError>>>,
        call_count: AtomicUsize,
    }

    impl MockProvider {
        pub fn new(responses: Vec<Result<ChatResponse, ProviderError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                call_count: AtomicUsize::new(0),
            }
        }

        /// Shortcut: every call answers with the same text
        pub fn with_text(text: &str) -> Self {
            Self::new(vec![Ok(text_response(text))])
        }

        pub fn call_count(&self) -> usize {
            self.call_count.load(Ordering::SeqCst)
        }
    }

    /// A plain text response with token usage attached
    pub fn text_response(text: &str) -> ChatResponse {
        ChatResponse {
            content: Some(text.to_string()),
            tool_calls: vec![],
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
                cache_read_tokens: 0,
            },
            rate_limit_info: None,
        }
    }

    #[async_trait]
    impl ProviderClient for MockProvider {
        fn name(&self) -> &str {
            "mock"
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        async fn chat(&self, _request: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.call_count.fetch_add(1, Ordering::SeqCst);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                // Repeat the shape of the last scripted answer when exhausted
                return Ok(text_response("ok"));
            }
            responses.remove(0)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn test_mock_returns_scripted_responses() {
            let provider = MockProvider::new(vec![Ok(text_response("first")), Ok(text_response("second"))]);

            let req = ChatRequest::simple("sys", "hi", 100);
            let r1 = provider.chat(req.clone()).await.unwrap();
            assert_eq!(r1.text(), "first");

            let r2 = provider.chat(req.clone()).await.unwrap();
            assert_eq!(r2.text(), "second");

            // Exhausted: falls back to a generic answer rather than erroring
            let r3 = provider.chat(req).await.unwrap();
            assert_eq!(r3.text(), "ok");
            assert_eq!(provider.call_count(), 3);
        }

        #[tokio::test]
        async fn test_mock_scripted_error() {
            let provider = MockProvider::new(vec![Err(ProviderError::RateLimited {
                retry_after: std::time::Duration::from_secs(5),
            })]);

            let err = provider.chat(ChatRequest::simple("s", "u", 10)).await.unwrap_err();
            assert!(err.is_rate_limit());
        }
    }
}
