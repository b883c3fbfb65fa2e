pub mod models;
pub mod provider;
pub mod providers;
pub mod types;

pub use models::ModelCache;
pub use provider::ChatProvider;
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, Role, StopReason, ToolCall, ToolSpec, Usage,
};
