pub mod agent_comm;
pub mod file_ops;
pub mod process_tools;
pub mod registry;
pub mod self_edit;
pub mod shell;
pub mod traits;

pub use agent_comm::AgentCommTool;
pub use file_ops::{
    CreateFileTool, InsertAtTool, ReplaceLinesTool, StrReplaceAllTool, StrReplaceTool, ViewTool,
};
pub use process_tools::{RunBackgroundTool, RunConcurrentTool};
pub use registry::ToolRegistry;
pub use self_edit::SelfEditTool;
pub use shell::{BashTool, GitTool};
pub use traits::{InvokingUser, Tool, ToolContext, ToolResult};

use std::sync::Arc;

/// The full built-in tool set.
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(CreateFileTool));
    registry.register(Arc::new(StrReplaceTool));
    registry.register(Arc::new(StrReplaceAllTool));
    registry.register(Arc::new(InsertAtTool));
    registry.register(Arc::new(ReplaceLinesTool));
    registry.register(Arc::new(ViewTool));
    registry.register(Arc::new(BashTool));
    registry.register(Arc::new(GitTool));
    registry.register(Arc::new(RunConcurrentTool));
    registry.register(Arc::new(RunBackgroundTool));
    registry.register(Arc::new(SelfEditTool));
    registry.register(Arc::new(AgentCommTool));
    registry
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_has_the_full_surface() {
        let registry = builtin_registry();
        for name in [
            "create_file",
            "str_replace",
            "str_replace_all",
            "insert_at",
            "replace_lines",
            "view",
            "bash",
            "git",
            "run_concurrent",
            "run_background",
            "self_edit",
            "agent_comm",
        ] {
            assert!(registry.get(name).is_some(), "missing tool {name}");
        }
        assert_eq!(registry.len(), 12);
    }
}
