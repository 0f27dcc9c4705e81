//! Tool-call parser for LLM responses.
//!
//! The primary wire format is one or more tagged blocks inside the
//! assistant message:
//!
//! ```text
//! <tool_call>
//! <tool_name>calculator</tool_name>
//! <call_mode>synchronous</call_mode>
//! <parameters>{"operation": "add", "a": 2, "b": 3}</parameters>
//! </tool_call>
//! ```
//!
//! `<call_mode>` is optional and defaults to synchronous. A legacy variant
//! without the `<tool_call>` wrapper is accepted when no wrapped block is
//! present. Malformed parameter JSON yields a parse-error sentinel so the
//! orchestrator can diagnose the specific block while the others execute.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use super::{CallMode, END_SESSION_TOOL};

// ─── ParsedToolCall ──────────────────────────────────────────────────────────

/// A tool invocation extracted from an assistant message.
#[derive(Debug, Clone)]
pub struct ParsedToolCall {
    pub tool_name: String,
    pub call_mode: CallMode,
    pub parameters: Value,
    /// Set when the parameter JSON failed to parse; `parameters` is then an
    /// empty object.
    pub parse_error: Option<String>,
}

/// Valid calls of one turn, partitioned for execution.
#[derive(Debug, Default)]
pub struct PartitionedCalls {
    pub end_session: Option<ParsedToolCall>,
    pub synchronous: Vec<ParsedToolCall>,
    pub asynchronous: Vec<ParsedToolCall>,
}

// ─── Patterns ────────────────────────────────────────────────────────────────

fn wrapped_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?s)<tool_call>\s*<tool_name>(.*?)</tool_name>(?:\s*<call_mode>(.*?)</call_mode>)?\s*<parameters>(.*?)</parameters>\s*</tool_call>",
        )
        .expect("static regex")
    })
}

fn legacy_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"(?s)<tool_name>(.*?)</tool_name>(?:\s*<call_mode>(.*?)</call_mode>)?\s*<parameters>(.*?)</parameters>",
        )
        .expect("static regex")
    })
}

fn end_session_block_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(&format!(
            r"(?s)<tool_call>\s*<tool_name>{END_SESSION_TOOL}</tool_name>.*?</tool_call>"
        ))
        .expect("static regex")
    })
}

fn think_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?s)<think>.*?</think>").expect("static regex"))
}

fn blank_runs_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\n\s*\n\s*\n+").expect("static regex"))
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

fn call_from_captures(caps: &regex::Captures<'_>) -> ParsedToolCall {
    let tool_name = caps[1].trim().to_string();
    let call_mode = caps
        .get(2)
        .map(|m| CallMode::from_wire(m.as_str()))
        .unwrap_or_default();
    let raw_params = caps[3].trim();

    match serde_json::from_str::<Value>(raw_params) {
        Ok(parameters) => ParsedToolCall {
            tool_name,
            call_mode,
            parameters,
            parse_error: None,
        },
        Err(e) => ParsedToolCall {
            tool_name,
            call_mode,
            parameters: Value::Object(Default::default()),
            parse_error: Some(format!("Invalid JSON in parameters: {e}")),
        },
    }
}

/// Extract every tool call from an assistant message, in textual order.
///
/// Wrapped `<tool_call>` blocks take precedence; when none are present a
/// single legacy unwrapped block is accepted.
pub fn extract_tool_calls(text: &str) -> Vec<ParsedToolCall> {
    let wrapped: Vec<ParsedToolCall> = wrapped_pattern()
        .captures_iter(text)
        .map(|caps| call_from_captures(&caps))
        .collect();
    if !wrapped.is_empty() {
        return wrapped;
    }
    legacy_pattern()
        .captures(text)
        .map(|caps| vec![call_from_captures(&caps)])
        .unwrap_or_default()
}

/// Partition valid calls into the (at most one) end_session call,
/// synchronous calls, and asynchronous calls, preserving textual order
/// within each class.
pub fn partition_calls(calls: Vec<ParsedToolCall>) -> PartitionedCalls {
    let mut partitioned = PartitionedCalls::default();
    for call in calls {
        if call.tool_name == END_SESSION_TOOL {
            partitioned.end_session = Some(call);
        } else if call.call_mode == CallMode::Synchronous {
            partitioned.synchronous.push(call);
        } else {
            partitioned.asynchronous.push(call);
        }
    }
    partitioned
}

/// The message text with the end_session block removed — the fallback final
/// response when `final_message` is empty.
pub fn text_before_end_session(response: &str) -> String {
    end_session_block_pattern()
        .replace_all(response, "")
        .trim()
        .to_string()
}

/// Strip `<think>…</think>` blocks and collapse runs of blank lines.
/// Applied to child-agent results before they are fed to the parent.
pub fn clean_result(result: &str) -> String {
    let without_think = think_pattern().replace_all(result, "");
    blank_runs_pattern()
        .replace_all(&without_think, "\n\n")
        .trim()
        .to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
