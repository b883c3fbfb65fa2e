//! Agent self-modification: system prompt, model, and permission profile.
//!
//! Profile changes carry an extra gate beyond the permission engine: the
//! invoking human must hold one of the configured granter roles.  Without
//! it the edit fails no matter what the profile itself would decide.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::ai::models::ModelCache;
use crate::error::{ErrorKind, ToolError};
use crate::security::ProfileSpec;
use crate::store::AgentPaths;

use super::traits::{Tool, ToolContext, ToolResult, required_str};

pub struct SelfEditTool;

#[async_trait]
impl Tool for SelfEditTool {
    fn name(&self) -> &str {
        "self_edit"
    }

    fn description(&self) -> &str {
        "Modify this agent's own configuration: kind=\"prompt\" rewrites the \
         system prompt, kind=\"model\" switches models, kind=\"permissions\" \
         changes the permission profile (requires a granting role)."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "kind": { "type": "string", "enum": ["prompt", "model", "permissions"] },
                "value": {
                    "type": "string",
                    "description": "New prompt text, model id, preset name, or inline \
                        profile JSON ({\"allow\": [...], \"ask\": [...]})."
                }
            },
            "required": ["kind", "value"]
        })
    }

    fn build_detail(&self, args: &Value) -> String {
        let kind = args.get("kind").and_then(Value::as_str).unwrap_or_default();
        match kind {
            // The target rides in the action string so profiles can gate
            // e.g. only permission escalations.
            "model" | "permissions" => {
                let value = args.get("value").and_then(Value::as_str).unwrap_or_default();
                format!("{kind}:{value}")
            }
            _ => kind.to_owned(),
        }
    }

    async fn execute(&self, ctx: &ToolContext, args: Value) -> Result<ToolResult, ToolError> {
        let kind = required_str(&args, "kind")?;
        let value = required_str(&args, "value")?;

        match kind {
            "prompt" => {
                let paths = AgentPaths::new(&ctx.home, &ctx.agent);
                paths.write_system_prompt(value).map_err(|e| {
                    ToolError::new(ErrorKind::InvalidArguments, format!("cannot save prompt: {e}"))
                })?;
                Ok(ToolResult::ok("system prompt updated; takes effect on the next branch"))
            }
            "model" => {
                let record = {
                    let mut state = ctx.agent_state.write().expect("agent state poisoned");
                    state.model = value.to_owned();
                    state.clone()
                };
                ctx.store.upsert_agent(&record).map_err(|e| {
                    ToolError::new(ErrorKind::InvalidArguments, e.to_string())
                })?;
                let note = if ModelCache::new(&ctx.home).is_known(value) {
                    String::new()
                } else {
                    " (not in the cached model list; verify the id)".to_owned()
                };
                Ok(ToolResult::ok(format!("model set to {value}{note}")))
            }
            "permissions" => {
                let authorized = ctx
                    .invoking_user
                    .roles
                    .iter()
                    .any(|r| ctx.granter_roles.contains(r));
                if !authorized {
                    return Err(ToolError::new(
                        ErrorKind::PermissionDenied,
                        format!(
                            "user {} holds no role authorized to grant permission changes",
                            ctx.invoking_user.id
                        ),
                    ));
                }

                let spec = parse_profile_value(value)?;
                // Compile now so a broken profile can never be persisted.
                spec.compile()
                    .map_err(|e| ToolError::new(e.kind(), e.to_string()))?;

                let record = {
                    let mut state = ctx.agent_state.write().expect("agent state poisoned");
                    state.permissions = spec.clone();
                    state.clone()
                };
                ctx.store.upsert_agent(&record).map_err(|e| {
                    ToolError::new(ErrorKind::InvalidArguments, e.to_string())
                })?;
                Ok(ToolResult::ok(format!("permission profile set to {}", spec.label())))
            }
            other => Err(ToolError::new(
                ErrorKind::InvalidArguments,
                format!("unknown self_edit kind '{other}'"),
            )),
        }
    }
}

/// A profile value is either a preset name or inline JSON.
fn parse_profile_value(value: &str) -> Result<ProfileSpec, ToolError> {
    let trimmed = value.trim();
    if trimmed.starts_with('{') {
        serde_json::from_str::<ProfileSpec>(trimmed).map_err(|e| {
            ToolError::new(
                ErrorKind::InvalidPermissionPattern,
                format!("malformed inline profile: {e}"),
            )
        })
    } else {
        Ok(ProfileSpec::Preset(trimmed.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{test_context, test_context_with_roles};
    use tempfile::TempDir;

    #[tokio::test]
    async fn prompt_edit_writes_agent_file() {
        let ws = TempDir::new().unwrap();
        let ctx = test_context(ws.path()).await;
        SelfEditTool
            .execute(&ctx, json!({"kind": "prompt", "value": "You are terse."}))
            .await
            .unwrap();

        let paths = AgentPaths::new(&ctx.home, &ctx.agent);
        assert_eq!(paths.read_system_prompt(), "You are terse.");
    }

    #[tokio::test]
    async fn model_edit_updates_state_and_store() {
        let ws = TempDir::new().unwrap();
        let ctx = test_context(ws.path()).await;
        ctx.store
            .upsert_agent(&ctx.agent_state.read().unwrap().clone())
            .unwrap();

        SelfEditTool
            .execute(&ctx, json!({"kind": "model", "value": "gpt-4o"}))
            .await
            .unwrap();
        assert_eq!(ctx.agent_state.read().unwrap().model, "gpt-4o");
        assert_eq!(ctx.store.get_agent("alpha").unwrap().unwrap().model, "gpt-4o");
    }

    #[tokio::test]
    async fn permission_edit_requires_granting_role() {
        let ws = TempDir::new().unwrap();
        let ctx = test_context(ws.path()).await; // no roles
        let err = SelfEditTool
            .execute(&ctx, json!({"kind": "permissions", "value": "open"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn permission_edit_with_role_succeeds() {
        let ws = TempDir::new().unwrap();
        let ctx = test_context_with_roles(ws.path(), &["admin"], &["admin"]).await;
        ctx.store
            .upsert_agent(&ctx.agent_state.read().unwrap().clone())
            .unwrap();

        SelfEditTool
            .execute(&ctx, json!({"kind": "permissions", "value": "locked"}))
            .await
            .unwrap();
        assert_eq!(
            ctx.agent_state.read().unwrap().permissions,
            ProfileSpec::Preset("locked".into())
        );
    }

    #[tokio::test]
    async fn inline_profile_is_validated() {
        let ws = TempDir::new().unwrap();
        let ctx = test_context_with_roles(ws.path(), &["admin"], &["admin"]).await;

        let err = SelfEditTool
            .execute(
                &ctx,
                json!({"kind": "permissions", "value": "{\"allow\": [\"([broken\"]}"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidPermissionPattern);

        // Unknown preset fails too.
        let err = SelfEditTool
            .execute(&ctx, json!({"kind": "permissions", "value": "yolo"}))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnknownPreset);
    }

    #[test]
    fn detail_includes_target_for_gateable_kinds() {
        assert_eq!(
            SelfEditTool.build_detail(&json!({"kind": "permissions", "value": "open"})),
            "permissions:open"
        );
        assert_eq!(
            SelfEditTool.build_detail(&json!({"kind": "model", "value": "gpt-4o"})),
            "model:gpt-4o"
        );
        assert_eq!(
            SelfEditTool.build_detail(&json!({"kind": "prompt", "value": "..."})),
            "prompt"
        );
    }
}
