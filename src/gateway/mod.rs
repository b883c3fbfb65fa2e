//! The chat-service seam.
//!
//! The messaging service itself is an external collaborator; the runtime
//! only needs a small transport surface: send and edit messages, show an
//! approval prompt, and update presence.  Implementations live outside this
//! crate (or in tests, as in-memory fakes).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Inbound message delivered by the chat service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel the message was posted in.
    pub channel_id: String,
    /// Message id assigned by the service.
    pub message_id: String,
    /// Author's user id.
    pub user_id: String,
    /// Roles the author holds (used for permission-grant checks).
    #[serde(default)]
    pub user_roles: Vec<String>,
    pub content: String,
    /// The message this one replies to, if any.
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// An approval prompt bound to one invoking user.
#[derive(Debug, Clone)]
pub struct AskRequest {
    pub channel_id: String,
    pub agent: String,
    pub branch_id: i64,
    /// The action string awaiting approval.
    pub action: String,
    /// Only this user may resolve the prompt.
    pub user_id: String,
}

/// Resolution of an approval prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AskOutcome {
    Approved,
    Denied,
    /// Nobody answered within the deadline; treated as a denial.
    TimedOut,
}

/// Transport surface implemented by the chat-service adapter.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Send a message; returns the service-assigned message id.
    async fn send(&self, channel_id: &str, text: &str) -> Result<String, String>;

    /// Edit a previously sent message (status embeds).
    async fn edit(&self, channel_id: &str, message_id: &str, text: &str) -> Result<(), String>;

    /// Show an approval prompt and wait for the bound user to resolve it.
    /// The caller applies the timeout; implementations should wait
    /// indefinitely and disable the prompt's controls once resolved.
    async fn ask(&self, request: &AskRequest) -> AskOutcome;

    /// Update the aggregate activity indicator.
    async fn set_presence(&self, active_branches: usize);
}
