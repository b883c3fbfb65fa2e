//! Block-structured messages wire format (`tool_use` / `tool_result`
//! content blocks, system prompt as a separate field).
//!
//! Cache hints: when the request asks for caching, the system prompt is sent
//! as a content-block array with `cache_control` on its last block, and the
//! last tool definition is marked the same way.  The vendor then caches the
//! entire static prefix (system + tools); the discount shows up in the
//! `cache_read_input_tokens` counter on subsequent calls.

use serde_json::{Value, json};
use tracing::debug;

use crate::ai::provider::ChatProvider;
use crate::ai::types::{
    ChatMessage, ChatRequest, ChatResponse, Role, StopReason, ToolCall, Usage,
};
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(base_url: &str, api_key: &str, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(timeout_secs))
                .build()
                .unwrap_or_default(),
            base_url: if base_url.is_empty() {
                DEFAULT_BASE_URL.to_owned()
            } else {
                base_url.trim_end_matches('/').to_owned()
            },
            api_key: api_key.to_owned(),
        }
    }

    /// Build the request body for the messages endpoint.
    fn build_request_body(&self, request: &ChatRequest) -> Value {
        let mut api_messages: Vec<Value> = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::User => api_messages.push(json!({
                    "role": "user",
                    "content": msg.content,
                })),
                Role::Assistant => api_messages.push(json!({
                    "role": "assistant",
                    "content": msg.content,
                })),
                Role::ToolUse => {
                    // Reuse the vendor blocks when we have them so server-side
                    // tool executions replay verbatim; otherwise reconstruct.
                    let blocks = tool_use_blocks(msg);
                    api_messages.push(json!({
                        "role": "assistant",
                        "content": blocks,
                    }));
                }
                Role::ToolResult => {
                    let block = json!({
                        "type": "tool_result",
                        "tool_use_id": msg.tool_call_id.as_deref().unwrap_or(""),
                        "content": msg.content,
                    });
                    // Consecutive results for one assistant turn must share a
                    // single user message.
                    match api_messages.last_mut() {
                        Some(last)
                            if last["role"] == "user"
                                && last["content"].as_array().is_some_and(|blocks| {
                                    blocks.iter().all(|b| b["type"] == "tool_result")
                                }) =>
                        {
                            if let Some(arr) = last["content"].as_array_mut() {
                                arr.push(block);
                            }
                        }
                        _ => api_messages.push(json!({
                            "role": "user",
                            "content": [block],
                        })),
                    }
                }
            }
        }

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": api_messages,
        });

        if !request.system.is_empty() {
            if request.cache {
                // System prompt as content blocks with cache_control on the
                // last block: the vendor caches the whole prefix up to and
                // including the marked block.
                body["system"] = json!([{
                    "type": "text",
                    "text": request.system,
                    "cache_control": { "type": "ephemeral" },
                }]);
            } else {
                body["system"] = json!(request.system);
            }
        }

        if !request.tools.is_empty() {
            let mut tool_defs: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.schema,
                    })
                })
                .collect();
            if request.cache
                && let Some(last) = tool_defs.last_mut()
                && let Some(obj) = last.as_object_mut()
            {
                // Marking the trailing tool extends the cached prefix over
                // the full tool list.
                obj.insert("cache_control".into(), json!({ "type": "ephemeral" }));
            }
            body["tools"] = json!(tool_defs);
        }

        body
    }

    /// Normalize a messages-endpoint response.
    fn parse_response(&self, body: Value) -> Result<ChatResponse, ProviderError> {
        let blocks = body["content"]
            .as_array()
            .cloned()
            .ok_or_else(|| ProviderError::Malformed("missing content array".into()))?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in &blocks {
            match block["type"].as_str() {
                Some("text") => {
                    if let Some(t) = block["text"].as_str() {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    tool_calls.push(ToolCall::new(
                        block["id"].as_str().unwrap_or_default(),
                        block["name"].as_str().unwrap_or_default(),
                        block["input"].clone(),
                    ));
                }
                // Server-side tool blocks ride along in raw_blocks.
                _ => {}
            }
        }

        let stop_reason = match body["stop_reason"].as_str() {
            Some("tool_use") => StopReason::ToolUse,
            Some("max_tokens") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        };

        let usage = Usage {
            input_tokens: body["usage"]["input_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["output_tokens"].as_u64().unwrap_or(0),
            cache_read_tokens: body["usage"]["cache_read_input_tokens"]
                .as_u64()
                .unwrap_or(0),
            cache_write_tokens: body["usage"]["cache_creation_input_tokens"]
                .as_u64()
                .unwrap_or(0),
        };

        Ok(ChatResponse {
            text: if text.is_empty() { None } else { Some(text) },
            tool_calls,
            stop_reason,
            usage,
            model: body["model"].as_str().unwrap_or_default().to_owned(),
            raw_blocks: Some(blocks),
        })
    }
}

/// Content blocks for a `ToolUse` turn: prefer the preserved vendor blocks,
/// fall back to reconstructing text + tool_use blocks.
fn tool_use_blocks(msg: &ChatMessage) -> Vec<Value> {
    if let Some(raw) = &msg.raw_blocks
        && !raw.is_empty()
    {
        return raw.clone();
    }
    let mut blocks = Vec::new();
    if !msg.content.is_empty() {
        blocks.push(json!({ "type": "text", "text": msg.content }));
    }
    for call in &msg.tool_calls {
        blocks.push(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.arguments,
        }));
    }
    blocks
}

#[async_trait::async_trait]
impl ChatProvider for AnthropicProvider {
    #[tracing::instrument(name = "provider.anthropic", skip_all, fields(model = %request.model))]
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = self.build_request_body(&request);
        debug!(messages = request.messages.len(), tools = request.tools.len(), "chat request");

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::RateLimited(text));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ProviderError::Request(format!("{status}: {text}")));
        }

        let json: Value = response.json().await?;
        self.parse_response(json)
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}
