pub mod calculator;
pub mod file_ops;
pub mod registry;

pub use registry::ToolRegistry;

use serde_json::Value;

/// A capability that the agent loop can invoke.
///
/// `execute` is deliberately a blocking `fn`: tools do file and process I/O,
/// and the orchestrator always dispatches them onto a bounded
/// `spawn_blocking` worker pool, never on its own control path.
///
/// Implementations must be `Send + Sync` so they can be held in a shared
/// `Arc<dyn Tool>` registry.
pub trait Tool: Send + Sync {
    /// Stable machine identifier (snake_case), e.g. `"calculator"`.
    fn name(&self) -> &str;

    /// Human-readable description included in the agent's tool inventory.
    fn description(&self) -> &str;

    /// JSON Schema object describing the tool's accepted parameters.
    /// Treated as opaque data by the runtime.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool. Errors become textual tool results fed back to the
    /// model; they never abort the run.
    fn execute(&self, params: Value) -> Result<String, String>;
}

/// Summary of a registered tool, used to build the agent's system prompt and
/// API listings.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub schema: Value,
}

/// Check the schema's `required` list against the supplied parameters.
///
/// Schemas are otherwise opaque; this is the only structural check performed
/// before dispatch.
pub fn check_required_params(schema: &Value, params: &Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return Ok(());
    };
    let missing: Vec<&str> = required
        .iter()
        .filter_map(Value::as_str)
        .filter(|key| params.get(key).is_none())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("missing required parameter(s): {}", missing.join(", ")))
    }
}
