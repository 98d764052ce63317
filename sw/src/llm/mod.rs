//! Provider client module
//!
//! The shared provider contract consumed by every orchestrator-internal
//! LLM call. Worker agents make their own calls behind the spawn boundary.

use std::sync::Arc;

mod anthropic;
pub mod client;
mod error;
mod types;

pub use anthropic::AnthropicProvider;
pub use client::ProviderClient;
pub use error::ProviderError;
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, RateLimitInfo, Role, StopReason, TokenUsage, ToolChoice, ToolInvocation,
    ToolSpec,
};

use crate::config::ProviderConfig;

/// Create a provider client based on the provider specified in config
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn ProviderClient>, ProviderError> {
    match config.provider.as_str() {
        "anthropic" => Ok(Arc::new(AnthropicProvider::from_config(config)?)),
        other => Err(ProviderError::InvalidResponse(format!(
            "Unknown LLM provider: '{}'. Supported: anthropic",
            other
        ))),
    }
}
