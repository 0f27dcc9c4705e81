//! Prompt template loading.
//!
//! [`PromptLoader`] reads a YAML prompt pack (`default.yaml`) from a
//! project's prompts directory and merges it over the compiled-in defaults,
//! so a pack only needs to define the keys it wants to override. Every
//! protocol string the orchestrator emits — the tool inventory, the calling
//! format, pending-task listings, end-session warnings, security errors —
//! comes through this loader.
//!
//! Templates use `{name}` placeholders. A missing file, empty file, or YAML
//! parse error falls back to the defaults and is logged; prompt loading is
//! never fatal.

use std::collections::HashMap;
use std::path::Path;

/// Category → key → template.
type PromptMap = HashMap<String, HashMap<String, String>>;

const SYSTEM_PROMPTS: &[(&str, &str)] = &[
    (
        "available_tools_header",
        "\n\n## Available Tools\n\nYou have access to the following tools:\n\n",
    ),
    (
        "tool_description_template",
        "### {tool_name}\n{description}\n\nParameters:\n",
    ),
    ("tool_no_parameters", "  No parameters\n"),
    (
        "tool_parameter_line",
        "  - {param_name} ({param_type}){required}: {param_description}\n",
    ),
    (
        "agent_description_template",
        "### {tool_name} (Agent)\n{description}\n\nParameters:\n  - message (string) (required): Message or query to send to the agent\n\n",
    ),
    (
        "tool_calling_format",
        "\n## Tool Calling Format\n\nTo call a tool or agent, use this XML format:\n<tool_call>\n<tool_name>name_of_tool</tool_name>\n<call_mode>synchronous|asynchronous</call_mode>\n<parameters>\n{\"param1\": \"value1\"}\n</parameters>\n</tool_call>\n\n",
    ),
    (
        "execution_modes",
        "## Execution Modes\n\n**synchronous**: Tool executes immediately and you receive the result before continuing\n**asynchronous**: Tool runs in background; you receive the result later as a task completion\n\n",
    ),
    (
        "tool_call_examples",
        "EXAMPLES:\n\n<tool_call>\n<tool_name>calculator</tool_name>\n<parameters>\n{\"operation\": \"add\", \"a\": 5, \"b\": 3}\n</parameters>\n</tool_call>\n\n",
    ),
    (
        "critical_rules",
        "CRITICAL RULES:\n- Use <tool_name> tags for the callable name\n- Use <parameters> tags containing a JSON object\n- <call_mode> is optional and defaults to synchronous\n\n",
    ),
    (
        "task_management",
        "## Task Management\n\nEach asynchronous tool call gets a unique TASK ID. Do not create duplicate tasks for work that is already running.\n\n",
    ),
    (
        "end_session_rules",
        "## CRITICAL: When to Call end_session\n\nCall end_session when your work is complete, with the complete final answer in final_message. You MUST NOT call end_session while tasks are pending!\n\n",
    ),
];

const RUNTIME_MESSAGES: &[(&str, &str)] = &[
    (
        "pending_tasks_header",
        "=== CURRENTLY PENDING TASKS ===\n\nYou have {pending_count} task(s) running:\n\n",
    ),
    (
        "pending_task_item",
        "Task ID: {task_id}\n  Tool/Agent: {tool_name}\n  Parameters: {parameters}\n  Launched at: {launched_at}\n\n",
    ),
    (
        "pending_tasks_reminder",
        "REMINDER: Do not create duplicate tasks.\n================================\n",
    ),
    (
        "tasks_launched_notification",
        "SYSTEM NOTIFICATION: {task_count} task(s) launched:\n{task_list}\n\nDO NOT create duplicate tasks.\n",
    ),
    ("task_completed", "Task '{task_id}' completed:\n{result}"),
    ("tool_result", "Tool '{tool_name}' result:\n{result}"),
    (
        "no_tool_call_warning",
        "SYSTEM REMINDER: You must call end_session to terminate.\n\n<tool_call>\n<tool_name>end_session</tool_name>\n<parameters>\n{\"final_message\": \"Your response\"}\n</parameters>\n</tool_call>\n",
    ),
    (
        "end_session_with_pending_tasks_error",
        "CRITICAL ERROR: You called end_session with {pending_count} pending task(s)!\n\nPending: {task_list}\n\nThe end_session call was IGNORED. Wait for every task result before ending the session.\n",
    ),
];

const ERROR_MESSAGES: &[(&str, &str)] = &[
    (
        "tool_not_authorized",
        "SECURITY ERROR: Tool/agent '{tool_name}' is not authorized for agent '{agent_name}'. Authorized tools: {authorized_tools}. To use this tool, add it to the file: {tools_file}",
    ),
    ("tool_not_found", "Tool or agent '{tool_name}' not found"),
    (
        "tool_execution_error",
        "Error executing tool '{tool_name}': {error_details}",
    ),
    ("llm_call_error", "Error calling LLM: {error_details}"),
];

fn fallback_prompts() -> PromptMap {
    let mut map = PromptMap::new();
    for (category, entries) in [
        ("system_prompts", SYSTEM_PROMPTS),
        ("runtime_messages", RUNTIME_MESSAGES),
        ("error_messages", ERROR_MESSAGES),
    ] {
        map.insert(
            category.to_string(),
            entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }
    map
}

/// Substitute `{name}` placeholders in a template.
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Loads and serves prompt templates with fallback support.
pub struct PromptLoader {
    prompts: PromptMap,
}

impl PromptLoader {
    /// Loader backed purely by the compiled-in defaults.
    pub fn with_defaults() -> Self {
        Self {
            prompts: fallback_prompts(),
        }
    }

    /// Load `default.yaml` from `prompts_dir`, merged over the defaults.
    pub fn from_dir(prompts_dir: impl AsRef<Path>) -> Self {
        let path = prompts_dir.as_ref().join("default.yaml");
        let mut prompts = fallback_prompts();

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(_) => {
                log::debug!("prompts: no pack at {}, using defaults", path.display());
                return Self { prompts };
            }
        };

        match serde_yaml::from_str::<serde_yaml::Value>(&text) {
            Ok(serde_yaml::Value::Mapping(categories)) => {
                for (category, entries) in categories {
                    let (Some(category), serde_yaml::Value::Mapping(entries)) =
                        (category.as_str(), entries)
                    else {
                        continue;
                    };
                    let slot = prompts.entry(category.to_string()).or_default();
                    for (key, value) in entries {
                        if let (Some(key), Some(value)) = (key.as_str(), value.as_str()) {
                            slot.insert(key.to_string(), value.to_string());
                        }
                    }
                }
                log::info!("prompts: loaded pack from {}", path.display());
            }
            Ok(_) => {
                log::warn!("prompts: {} is not a mapping, using defaults", path.display());
            }
            Err(e) => {
                log::warn!("prompts: failed to parse {}: {e}, using defaults", path.display());
            }
        }
        Self { prompts }
    }

    /// Fetch and render a template. An unknown key renders as an empty
    /// string (and is logged) so a broken pack cannot panic the runtime.
    pub fn get(&self, category: &str, key: &str, vars: &[(&str, &str)]) -> String {
        match self.prompts.get(category).and_then(|c| c.get(key)) {
            Some(template) => render(template, vars),
            None => {
                log::warn!("prompts: missing template {category}.{key}");
                String::new()
            }
        }
    }

    pub fn system_prompt(&self, key: &str, vars: &[(&str, &str)]) -> String {
        self.get("system_prompts", key, vars)
    }

    pub fn runtime_message(&self, key: &str, vars: &[(&str, &str)]) -> String {
        self.get("runtime_messages", key, vars)
    }

    pub fn error_message(&self, key: &str, vars: &[(&str, &str)]) -> String {
        self.get("error_messages", key, vars)
    }

    /// Render a task-id list as indented bullet lines.
    pub fn format_task_list(&self, task_ids: &[String]) -> String {
        task_ids
            .iter()
            .map(|id| format!("  - {id}"))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_protocol_keys() {
        let loader = PromptLoader::with_defaults();
        for key in [
            "tool_calling_format",
            "execution_modes",
            "critical_rules",
            "end_session_rules",
        ] {
            assert!(!loader.system_prompt(key, &[]).is_empty(), "missing {key}");
        }
    }

    #[test]
    fn substitution_replaces_placeholders() {
        let loader = PromptLoader::with_defaults();
        let msg = loader.runtime_message(
            "tool_result",
            &[("tool_name", "calc"), ("result", "5")],
        );
        assert_eq!(msg, "Tool 'calc' result:\n5");
    }

    #[test]
    fn unknown_key_renders_empty() {
        let loader = PromptLoader::with_defaults();
        assert_eq!(loader.get("runtime_messages", "no_such_key", &[]), "");
    }

    #[test]
    fn json_braces_in_templates_survive_rendering() {
        // Templates contain literal JSON braces; only known placeholders are
        // replaced.
        let loader = PromptLoader::with_defaults();
        let text = loader.runtime_message("no_tool_call_warning", &[]);
        assert!(text.contains(r#"{"final_message": "Your response"}"#));
    }

    #[test]
    fn pack_overrides_single_key() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.yaml"),
            "runtime_messages:\n  tool_result: \"[{tool_name}] => {result}\"\n",
        )
        .unwrap();

        let loader = PromptLoader::from_dir(dir.path());
        let msg = loader.runtime_message("tool_result", &[("tool_name", "t"), ("result", "r")]);
        assert_eq!(msg, "[t] => r");
        // Untouched keys still come from the defaults.
        assert!(!loader.system_prompt("critical_rules", &[]).is_empty());
    }

    #[test]
    fn malformed_pack_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("default.yaml"), ":: not yaml ::[").unwrap();
        let loader = PromptLoader::from_dir(dir.path());
        assert!(!loader.system_prompt("critical_rules", &[]).is_empty());
    }

    #[test]
    fn format_task_list_bullets() {
        let loader = PromptLoader::with_defaults();
        let listing = loader.format_task_list(&["a_1".to_string(), "b_2".to_string()]);
        assert_eq!(listing, "  - a_1\n  - b_2");
    }
}
