//! Function-call-structured chat wire format (tool calls as `function`
//! entries with string-encoded JSON arguments, system prompt as the first
//! message).
//!
//! This family has no explicit cache-control hints; the cache flag on the
//! request is accepted and ignored.  Cached-prefix token counts are still
//! surfaced when the vendor reports them.

use serde_json::{Value, json};
use tracing::debug;

use crate::ai::provider::ChatProvider;
use crate::ai::types::{ChatRequest, ChatResponse, Role, StopReason, ToolCall, Usage};
use crate::error::ProviderError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenAiProvider {
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

    /// Build the request body for the chat-completions endpoint.
    fn build_request_body(&self, request: &ChatRequest) -> Value {
        let mut api_messages: Vec<Value> = Vec::new();

        if !request.system.is_empty() {
            api_messages.push(json!({ "role": "system", "content": request.system }));
        }

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
                    let calls: Vec<Value> = msg
                        .tool_calls
                        .iter()
                        .map(|c| {
                            json!({
                                "id": c.id,
                                "type": "function",
                                "function": {
                                    "name": c.name,
                                    // Arguments travel as a JSON string.
                                    "arguments": c.arguments.to_string(),
                                },
                            })
                        })
                        .collect();
                    let mut m = json!({ "role": "assistant", "tool_calls": calls });
                    if !msg.content.is_empty() {
                        m["content"] = json!(msg.content);
                    }
                    api_messages.push(m);
                }
                Role::ToolResult => api_messages.push(json!({
                    "role": "tool",
                    "tool_call_id": msg.tool_call_id.as_deref().unwrap_or(""),
                    "content": msg.content,
                })),
            }
        }

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": api_messages,
        });

        if !request.tools.is_empty() {
            let tool_defs: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.schema,
                        },
                    })
                })
                .collect();
            body["tools"] = json!(tool_defs);
        }

        body
    }

    /// Normalize a chat-completions response.
    fn parse_response(&self, body: Value) -> Result<ChatResponse, ProviderError> {
        let message = body["choices"][0]
            .get("message")
            .ok_or_else(|| ProviderError::Malformed("missing choices[0].message".into()))?;

        let text = message["content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_owned);

        let mut tool_calls = Vec::new();
        if let Some(calls) = message["tool_calls"].as_array() {
            for call in calls {
                let arguments = call["function"]["arguments"]
                    .as_str()
                    .map(|s| serde_json::from_str(s).unwrap_or(Value::Null))
                    .unwrap_or(Value::Null);
                tool_calls.push(ToolCall::new(
                    call["id"].as_str().unwrap_or_default(),
                    call["function"]["name"].as_str().unwrap_or_default(),
                    arguments,
                ));
            }
        }

        let stop_reason = match body["choices"][0]["finish_reason"].as_str() {
            Some("tool_calls") => StopReason::ToolUse,
            Some("length") => StopReason::MaxTokens,
            _ => StopReason::EndTurn,
        };

        let usage = Usage {
            input_tokens: body["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            output_tokens: body["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            cache_read_tokens: body["usage"]["prompt_tokens_details"]["cached_tokens"]
                .as_u64()
                .unwrap_or(0),
            cache_write_tokens: 0,
        };

        Ok(ChatResponse {
            text,
            tool_calls,
            stop_reason,
            usage,
            model: body["model"].as_str().unwrap_or_default().to_owned(),
            raw_blocks: None,
        })
    }
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiProvider {
    #[tracing::instrument(name = "provider.openai", skip_all, fields(model = %request.model))]
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let body = self.build_request_body(&request);
        debug!(messages = request.messages.len(), tools = request.tools.len(), "chat request");

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
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
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::{ChatMessage, ToolSpec};

    fn provider() -> OpenAiProvider {
        OpenAiProvider::new("", "test-key", 30)
    }

    // ── Request building ────────────────────────────────────────────────

    #[test]
    fn system_becomes_first_message() {
        let body = provider().build_request_body(
            &ChatRequest::new("gpt-4o", vec![ChatMessage::user("hi")]).with_system("be brief"),
        );
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be brief");
        assert_eq!(body["messages"][1]["role"], "user");
    }

    #[test]
    fn tool_calls_string_encode_arguments() {
        let messages = vec![
            ChatMessage::tool_use(
                "",
                vec![ToolCall::new("c1", "view", json!({"path": "a.md"}))],
            ),
            ChatMessage::tool_result("c1", "contents"),
        ];
        let body = provider().build_request_body(&ChatRequest::new("m", messages));

        let call = &body["messages"][0]["tool_calls"][0];
        assert_eq!(call["type"], "function");
        assert_eq!(call["function"]["name"], "view");
        // Arguments are a JSON string, not an object.
        let args: Value =
            serde_json::from_str(call["function"]["arguments"].as_str().unwrap()).unwrap();
        assert_eq!(args["path"], "a.md");

        let result = &body["messages"][1];
        assert_eq!(result["role"], "tool");
        assert_eq!(result["tool_call_id"], "c1");
    }

    #[test]
    fn tools_wrapped_as_functions() {
        let body = provider().build_request_body(
            &ChatRequest::new("m", vec![]).with_tools(vec![ToolSpec {
                name: "bash".into(),
                description: "run".into(),
                schema: json!({"type": "object"}),
            }]),
        );
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["tools"][0]["function"]["name"], "bash");
    }

    // ── Response parsing ────────────────────────────────────────────────

    #[test]
    fn parses_text_response() {
        let r = provider()
            .parse_response(json!({
                "model": "gpt-4o",
                "choices": [{
                    "message": {"role": "assistant", "content": "hello"},
                    "finish_reason": "stop",
                }],
                "usage": {"prompt_tokens": 10, "completion_tokens": 2},
            }))
            .unwrap();
        assert_eq!(r.text.as_deref(), Some("hello"));
        assert_eq!(r.stop_reason, StopReason::EndTurn);
        assert_eq!(r.usage.input_tokens, 10);
    }

    #[test]
    fn parses_tool_call_response() {
        let r = provider()
            .parse_response(json!({
                "model": "gpt-4o",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_9",
                            "type": "function",
                            "function": {"name": "bash", "arguments": "{\"command\": \"ls\"}"},
                        }],
                    },
                    "finish_reason": "tool_calls",
                }],
                "usage": {
                    "prompt_tokens": 50,
                    "completion_tokens": 9,
                    "prompt_tokens_details": {"cached_tokens": 40},
                },
            }))
            .unwrap();
        assert_eq!(r.stop_reason, StopReason::ToolUse);
        assert_eq!(r.tool_calls[0].id, "call_9");
        assert_eq!(r.tool_calls[0].arguments["command"], "ls");
        assert_eq!(r.usage.cache_read_tokens, 40);
        assert!(r.text.is_none());
    }

    #[test]
    fn malformed_arguments_degrade_to_null() {
        let r = provider()
            .parse_response(json!({
                "model": "m",
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "tool_calls": [{
                            "id": "c",
                            "type": "function",
                            "function": {"name": "bash", "arguments": "{not json"},
                        }],
                    },
                    "finish_reason": "tool_calls",
                }],
                "usage": {"prompt_tokens": 1, "completion_tokens": 1},
            }))
            .unwrap();
        assert_eq!(r.tool_calls[0].arguments, Value::Null);
    }

    #[test]
    fn missing_message_is_malformed() {
        let err = provider().parse_response(json!({"choices": []})).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }
}
