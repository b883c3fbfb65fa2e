//! Stable error kinds shared across subsystems.
//!
//! Tool-call-granular failures are rendered into the conversation as
//! `{"error": "<kind>", "message": "<detail>"}` so the model can adapt and
//! the loop continues.  Branch-level failures terminate the branch instead.

use serde::{Deserialize, Serialize};

/// Machine-stable failure kind.  The serialized name is part of the wire
/// contract with the model and with the audit log — do not rename variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    PermissionDenied,
    AskTimeout,
    PathTraversal,
    FileNotFoundInWorkspace,
    BinaryFile,
    AmbiguousMatch,
    StringNotFound,
    LockTimeout,
    BlocklistedCommand,
    CommandTimeout,
    ProviderError,
    ProviderRateLimit,
    MaxIterationsReached,
    UnknownTool,
    InvalidArguments,
    InvalidPermissionPattern,
    UnknownPreset,
    RecursionDepthExceeded,
    RateLimited,
    OutboundTooLong,
    Cancelled,
}

impl ErrorKind {
    /// The stable wire name (matches the serde representation).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermissionDenied => "PermissionDenied",
            Self::AskTimeout => "AskTimeout",
            Self::PathTraversal => "PathTraversal",
            Self::FileNotFoundInWorkspace => "FileNotFoundInWorkspace",
            Self::BinaryFile => "BinaryFile",
            Self::AmbiguousMatch => "AmbiguousMatch",
            Self::StringNotFound => "StringNotFound",
            Self::LockTimeout => "LockTimeout",
            Self::BlocklistedCommand => "BlocklistedCommand",
            Self::CommandTimeout => "CommandTimeout",
            Self::ProviderError => "ProviderError",
            Self::ProviderRateLimit => "ProviderRateLimit",
            Self::MaxIterationsReached => "MaxIterationsReached",
            Self::UnknownTool => "UnknownTool",
            Self::InvalidArguments => "InvalidArguments",
            Self::InvalidPermissionPattern => "InvalidPermissionPattern",
            Self::UnknownPreset => "UnknownPreset",
            Self::RecursionDepthExceeded => "RecursionDepthExceeded",
            Self::RateLimited => "RateLimited",
            Self::OutboundTooLong => "OutboundTooLong",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A kind-tagged failure from a tool handler.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Render as the JSON payload placed into a tool result.
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.kind.as_str(), "message": self.message })
    }
}

/// Failure talking to an LLM provider.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider rate limited: {0}")]
    RateLimited(String),

    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider returned malformed response: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited(_) => ErrorKind::ProviderRateLimit,
            Self::Request(_) | Self::Malformed(_) => ErrorKind::ProviderError,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        Self::Request(e.to_string())
    }
}

/// Failure in the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store initialization error: {0}")]
    Init(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),
}
