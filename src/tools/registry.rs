use std::{collections::HashMap, sync::Arc};

use super::{Tool, ToolInfo};

/// Central registry of available tools.
///
/// Built once per project and shared as `Arc<ToolRegistry>`; registration
/// happens only during construction.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry populated with every compiled-in tool, rooted at `workspace`
    /// for the file tools.
    pub fn builtin(workspace: impl Into<std::path::PathBuf>) -> Self {
        let workspace = workspace.into();
        let mut registry = Self::new();
        registry.register(Arc::new(super::calculator::CalculatorTool));
        registry.register(Arc::new(super::file_ops::FileReadTool::new(&workspace)));
        registry.register(Arc::new(super::file_ops::FileWriteTool::new(&workspace)));
        registry.register(Arc::new(super::file_ops::FileListTool::new(&workspace)));
        registry
    }

    /// Register a tool. Overwrites any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// List all registered tools, sorted by name.
    pub fn list(&self) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                schema: t.parameters_schema(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    struct DummyTool(&'static str);

    impl Tool for DummyTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "A test tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn execute(&self, _params: Value) -> Result<String, String> {
            Ok("done".to_string())
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("dummy")));
        assert!(reg.get("dummy").is_some());
        assert!(reg.get("nonexistent").is_none());
    }

    #[test]
    fn overwrite_same_name() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("dummy")));
        reg.register(Arc::new(DummyTool("dummy")));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn list_sorted_by_name() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("zeta")));
        reg.register(Arc::new(DummyTool("alpha")));
        let names: Vec<String> = reg.list().into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn builtin_registry_has_file_and_calc_tools() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ToolRegistry::builtin(dir.path());
        assert!(reg.contains("calculator"));
        assert!(reg.contains("file_read"));
        assert!(reg.contains("file_write"));
        assert!(reg.contains("file_list"));
    }
}
