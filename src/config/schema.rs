//! TOML configuration schema.
//!
//! All sections carry `#[serde(default)]` so a partially-filled
//! `config.toml` works; missing sections fall back to their `Default` impl.
//!
//! Example `~/.chorus/config.toml`:
//! ```toml
//! [runtime]
//! home = "/home/user/.chorus"
//!
//! [provider]
//! default_kind = "anthropic"
//! default_model = "claude-sonnet-4-5"
//! summary_model = "claude-haiku-4-5"
//!
//! [hooks]
//! max_depth = 3
//! max_in_flight = 3
//!
//! [outbound]
//! message_limit = 2000
//! ```

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ─── RuntimeConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Root directory for all runtime state: agent dirs, process logs, db.
    pub home: PathBuf,
    /// Default rolling context window, in seconds, for new agents.
    pub default_window_secs: i64,
    /// Maximum loop iterations per branch run.
    pub max_iterations: usize,
    /// Seconds before an unanswered approval prompt is treated as a denial.
    pub ask_timeout_secs: u64,
    /// Seconds to wait for a contended file lock before failing the tool.
    pub lock_timeout_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            home: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".chorus"),
            default_window_secs: 86_400,
            max_iterations: 25,
            ask_timeout_secs: 120,
            lock_timeout_secs: 30,
        }
    }
}

// ─── ProviderConfig ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Wire family of the default provider: `"anthropic"` or `"openai"`.
    pub default_kind: String,
    /// Default model identifier for new agents.
    pub default_model: String,
    /// Cheap model used for snapshot summaries.
    pub summary_model: String,
    /// Base URL override (empty = the vendor default).
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            default_kind: "anthropic".to_owned(),
            default_model: "claude-sonnet-4-5".to_owned(),
            summary_model: "claude-haiku-4-5".to_owned(),
            base_url: String::new(),
            api_key_env: "ANTHROPIC_API_KEY".to_owned(),
            request_timeout_secs: 120,
        }
    }
}

// ─── HookLimits ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HookLimits {
    /// Maximum recursion depth for hook-spawned branches.
    pub max_depth: u32,
    /// Maximum hook-spawned branches in flight across all agents.
    pub max_in_flight: usize,
}

impl Default for HookLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_in_flight: 3,
        }
    }
}

// ─── OutboundConfig ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutboundConfig {
    /// Hard length limit per outbound message (characters).
    pub message_limit: usize,
    /// Messages allowed per rate window.
    pub rate_limit_count: usize,
    /// Rate window in seconds.
    pub rate_limit_secs: u64,
    /// Minimum milliseconds between status-embed edits.
    pub status_edit_interval_ms: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            message_limit: 2000,
            rate_limit_count: 5,
            rate_limit_secs: 5,
            status_edit_interval_ms: 1500,
        }
    }
}

// ─── RolesConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct RolesConfig {
    /// Role names whose holders may grant permission-profile changes.
    pub permission_granters: Vec<String>,
}

// ─── AppConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub runtime: RuntimeConfig,
    pub provider: ProviderConfig,
    pub hooks: HookLimits,
    pub outbound: OutboundConfig,
    pub roles: RolesConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = AppConfig::default();
        assert_eq!(c.runtime.max_iterations, 25);
        assert_eq!(c.runtime.ask_timeout_secs, 120);
        assert_eq!(c.runtime.lock_timeout_secs, 30);
        assert_eq!(c.hooks.max_depth, 3);
        assert_eq!(c.outbound.rate_limit_count, 5);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let c: AppConfig = toml::from_str(
            r#"
            [provider]
            default_kind = "openai"
            "#,
        )
        .unwrap();
        assert_eq!(c.provider.default_kind, "openai");
        // Untouched sections keep their defaults.
        assert_eq!(c.runtime.max_iterations, 25);
        assert_eq!(c.outbound.message_limit, 2000);
    }

    #[test]
    fn round_trips_through_toml() {
        let c = AppConfig::default();
        let s = toml::to_string(&c).unwrap();
        let back: AppConfig = toml::from_str(&s).unwrap();
        assert_eq!(c, back);
    }
}
