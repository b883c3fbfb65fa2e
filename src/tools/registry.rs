//! Central catalog of available tools.

use std::{collections::HashMap, sync::Arc};

use crate::ai::types::ToolSpec;
use crate::security::PermissionProfile;

use super::traits::Tool;

/// Registry of tool handlers, populated once at startup.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.  Overwrites any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// All tool definitions, for inclusion in provider requests.
    pub fn list(&self) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self.tools.values().map(spec_of).collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Tool definitions visible under `profile`.
    ///
    /// A tool whose every possible action string would be denied is omitted
    /// to save input tokens.  This is an optimization only — the per-call
    /// permission check in the loop remains authoritative.
    pub fn project_for(&self, profile: &PermissionProfile) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .filter(|t| profile.prefix_may_pass(&format!("tool:{}:", t.name())))
            .map(spec_of)
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn spec_of(tool: &Arc<dyn Tool>) -> ToolSpec {
    ToolSpec {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        schema: tool.parameters_schema(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolError;
    use crate::tools::traits::{ToolContext, ToolResult};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    struct DummyTool(&'static str);

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "a test tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn build_detail(&self, _args: &Value) -> String {
            String::new()
        }
        async fn execute(&self, _ctx: &ToolContext, _args: Value) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::ok("done"))
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("view")));
        assert!(reg.get("view").is_some());
        assert!(reg.get("nonexistent").is_none());
    }

    #[test]
    fn overwrite_same_name() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("view")));
        reg.register(Arc::new(DummyTool("view")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn list_is_sorted() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("view")));
        reg.register(Arc::new(DummyTool("bash")));
        let list = reg.list();
        let names: Vec<&str> = list.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["bash", "view"]);
    }

    #[test]
    fn projection_omits_fully_denied_tools() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("view")));
        reg.register(Arc::new(DummyTool("bash")));
        reg.register(Arc::new(DummyTool("create_file")));

        let locked = PermissionProfile::preset("locked").unwrap();
        let names: Vec<String> = reg
            .project_for(&locked)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["view"]);

        // Ask-gated tools stay visible.
        let standard = PermissionProfile::preset("standard").unwrap();
        let names: Vec<String> = reg
            .project_for(&standard)
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert!(names.contains(&"bash".to_string()));
        assert!(names.contains(&"view".to_string()));
    }
}
