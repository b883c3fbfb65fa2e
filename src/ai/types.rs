//! Provider-independent chat types.
//!
//! Both wire formats (block-structured and function-call-structured) are
//! normalized to these shapes; the adapters own the translation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Role of a message in a conversation.  `ToolUse` is an assistant turn that
/// requested tool calls; `ToolResult` carries one call's outcome back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolUse,
    ToolResult,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::ToolUse => "tool_use",
            Self::ToolResult => "tool_result",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool_use" => Some(Self::ToolUse),
            "tool_result" => Some(Self::ToolResult),
            _ => None,
        }
    }
}

/// One requested tool invocation from the model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Tool calls carried by a `ToolUse` turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// The call this `ToolResult` answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Vendor content blocks for a `ToolUse` turn, kept so server-side tool
    /// executions replay verbatim when the history is resent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_blocks: Option<Vec<Value>>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            raw_blocks: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            raw_blocks: None,
        }
    }

    pub fn tool_use(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::ToolUse,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
            raw_blocks: None,
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::ToolResult,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
            raw_blocks: None,
        }
    }
}

/// Tool definition as projected into a provider request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// Request for one chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// Static system prompt (agent prompt + injected docs).
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
    /// When true, mark the static prefix (system + last tool definition) as
    /// cacheable on providers that honor cache hints.
    pub cache: bool,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            system: String::new(),
            messages,
            tools: Vec::new(),
            max_tokens: 4096,
            cache: false,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = system.into();
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// Token accounting for one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
}

impl Usage {
    /// Accumulate another call's usage into this one.
    pub fn absorb(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Normalized chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Assistant text, if any.
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub stop_reason: StopReason,
    pub usage: Usage,
    pub model: String,
    /// Vendor-side content blocks, preserved so server-side tool executions
    /// (e.g. hosted web search) can be replayed verbatim on the next turn.
    pub raw_blocks: Option<Vec<Value>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_names_round_trip() {
        for role in [Role::User, Role::Assistant, Role::ToolUse, Role::ToolResult] {
            assert_eq!(Role::parse(role.as_str()), Some(role));
        }
        assert_eq!(Role::parse("system"), None);
    }

    #[test]
    fn message_constructors() {
        let m = ChatMessage::tool_result("call_1", "ok");
        assert_eq!(m.role, Role::ToolResult);
        assert_eq!(m.tool_call_id.as_deref(), Some("call_1"));

        let m = ChatMessage::tool_use("", vec![ToolCall::new("c1", "view", serde_json::json!({}))]);
        assert_eq!(m.tool_calls.len(), 1);
    }

    #[test]
    fn usage_absorbs() {
        let mut total = Usage::default();
        total.absorb(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_read_tokens: 8,
            cache_write_tokens: 2,
        });
        total.absorb(&Usage {
            input_tokens: 1,
            output_tokens: 1,
            ..Default::default()
        });
        assert_eq!(total.input_tokens, 11);
        assert_eq!(total.total(), 17);
        assert_eq!(total.cache_read_tokens, 8);
    }

    #[test]
    fn request_builder() {
        let r = ChatRequest::new("m", vec![ChatMessage::user("hi")])
            .with_system("be terse")
            .with_cache(true);
        assert_eq!(r.system, "be terse");
        assert!(r.cache);
        assert_eq!(r.max_tokens, 4096);
    }
}
