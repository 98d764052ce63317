//! Throttled provider wrapper
//!
//! Wraps the shared provider so that every chat call acquires a throttle
//! token first. Read-only accessors pass through untouched. Successful
//! responses feed back rate-limit headroom and step the throttle toward
//! recovery; limit errors trigger backoff.

use std::sync::Arc;

use async_trait::async_trait;

use super::Throttle;
use crate::llm::{ChatRequest, ChatResponse, ProviderClient, ProviderError};

/// Provider wrapper that throttles chat calls
pub struct ThrottledProvider {
    inner: Arc<dyn ProviderClient>,
    throttle: Arc<Throttle>,
}

impl ThrottledProvider {
    pub fn new(inner: Arc<dyn ProviderClient>, throttle: Arc<Throttle>) -> Self {
        Self { inner, throttle }
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }
}

#[async_trait]
impl ProviderClient for ThrottledProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.throttle.acquire().await;

        match self.inner.chat(request).await {
            Ok(response) => {
                if let Some(info) = &response.rate_limit_info {
                    self.throttle.feed_rate_limit_info(info).await;
                }
                self.throttle.recover().await;
                Ok(response)
            }
            Err(e) => {
                if e.is_limit() {
                    self.throttle.backoff().await;
                }
                Err(e)
            }
        }
    }
}
