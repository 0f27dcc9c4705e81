//! The agent execution engine: configuration loading, the wire-format
//! parser, the per-run task manager, the orchestration loop, and the
//! process-wide run registry.

pub mod config;
pub mod orchestrator;
pub mod run_log;
pub mod run_manager;
pub mod task_manager;
pub mod tool_parser;

pub use crate::store::models::{CallMode, RunState};

/// Callable names that are always authorized regardless of an agent's
/// whitelist. Kept as a single list so future built-ins do not grow
/// scattered special cases.
pub const BUILTIN_CALLABLES: &[&str] = &["end_session"];

/// Name of the built-in session-terminating tool.
pub const END_SESSION_TOOL: &str = "end_session";
