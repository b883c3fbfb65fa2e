//! The provider seam: one async trait over both supported wire formats.

use std::sync::Arc;

use async_trait::async_trait;

use super::providers::{anthropic::AnthropicProvider, openai::OpenAiProvider};
use super::types::{ChatRequest, ChatResponse};
use crate::error::ProviderError;

/// An LLM endpoint capable of chat with tool use.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Run one completion.  Implementations translate to and from their
    /// vendor wire format and normalize usage counters.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Short provider name for logs and status footers.
    fn name(&self) -> &str;
}

/// Construct a provider for the given wire family.
pub fn provider_for(
    kind: &str,
    base_url: &str,
    api_key: &str,
    timeout_secs: u64,
) -> Result<Arc<dyn ChatProvider>, String> {
    match kind {
        "anthropic" => Ok(Arc::new(AnthropicProvider::new(base_url, api_key, timeout_secs))),
        "openai" => Ok(Arc::new(OpenAiProvider::new(base_url, api_key, timeout_secs))),
        other => Err(format!("unknown provider kind '{other}'")),
    }
}
