//! Row types for the execution store.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

// ─── CallMode ────────────────────────────────────────────────────────────────

/// How a callable was invoked: awaited in place or launched as a background
/// task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallMode {
    #[default]
    Synchronous,
    Asynchronous,
}

impl CallMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Synchronous => "synchronous",
            Self::Asynchronous => "asynchronous",
        }
    }

    /// Parse the wire value. Anything other than `"synchronous"` is treated
    /// as asynchronous, matching the protocol's permissive reading.
    pub fn from_wire(s: &str) -> Self {
        if s.trim() == "synchronous" {
            Self::Synchronous
        } else {
            Self::Asynchronous
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "asynchronous" => Self::Asynchronous,
            _ => Self::Synchronous,
        }
    }
}

// ─── RunState ────────────────────────────────────────────────────────────────

/// Lifecycle state of an agent run. Transitions are monotone toward
/// `Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Generating,
    Waiting,
    ExecutingTool,
    Completed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generating => "generating",
            Self::Waiting => "waiting",
            Self::ExecutingTool => "executing_tool",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "waiting" => Self::Waiting,
            "executing_tool" => Self::ExecutingTool,
            "completed" => Self::Completed,
            _ => Self::Generating,
        }
    }
}

// ─── AgentRunRecord ──────────────────────────────────────────────────────────

/// One row of `agent_executions`: a single invocation of an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRunRecord {
    pub run_id: String,
    pub agent_name: String,
    pub parent_run_id: Option<String>,
    /// `"root"` when the run has no parent.
    pub parent_agent_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub current_state: RunState,
    pub call_mode: CallMode,
    pub log_file: Option<String>,
    pub project_dir: String,
}

impl AgentRunRecord {
    pub fn is_running(&self) -> bool {
        self.completed_at.is_none()
    }
}

// ─── ToolInvocationRecord ────────────────────────────────────────────────────

/// One row of `tool_executions`. `completed_at` and `result` are set
/// together, exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocationRecord {
    pub invocation_id: String,
    pub run_id: String,
    pub tool_name: String,
    pub parameters: serde_json::Value,
    pub call_mode: CallMode,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<String>,
}

impl ToolInvocationRecord {
    pub fn is_running(&self) -> bool {
        self.completed_at.is_none()
    }
}

// ─── IntervalKind ────────────────────────────────────────────────────────────

/// Unit of a schedule's repeat interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalKind {
    Minutes,
    Hours,
    Weeks,
}

impl IntervalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Weeks => "weeks",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "minutes" => Some(Self::Minutes),
            "hours" => Some(Self::Hours),
            "weeks" => Some(Self::Weeks),
            _ => None,
        }
    }

    /// The duration of `interval` units of this kind.
    pub fn delta(&self, interval: i64) -> Duration {
        match self {
            Self::Minutes => Duration::minutes(interval),
            Self::Hours => Duration::hours(interval),
            Self::Weeks => Duration::weeks(interval),
        }
    }
}

// ─── ScheduleRecord ──────────────────────────────────────────────────────────

/// A persisted recurring trigger for `(agent, message, project_dir)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRecord {
    pub schedule_id: String,
    pub name: String,
    pub project_dir: String,
    pub agent_name: String,
    pub message: String,
    pub kind: IntervalKind,
    pub interval: i64,
    pub start_from: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Field updates for a schedule; `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleUpdate {
    pub name: Option<String>,
    pub agent_name: Option<String>,
    pub message: Option<String>,
    pub kind: Option<IntervalKind>,
    pub interval: Option<i64>,
    /// `Some(None)` clears `start_from`.
    pub start_from: Option<Option<DateTime<Utc>>>,
    pub enabled: Option<bool>,
}

impl ScheduleUpdate {
    /// True when the update touches a field that changes the firing cadence.
    pub fn changes_timing(&self) -> bool {
        self.kind.is_some() || self.interval.is_some() || self.start_from.is_some()
    }
}

// ─── ProjectRecord ───────────────────────────────────────────────────────────

/// A named workspace containing its own agents (and optionally tools and
/// prompts).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub project_name: String,
    pub project_dir: String,
    pub created_at: DateTime<Utc>,
}

// ─── Next-run computation ────────────────────────────────────────────────────

/// Compute when a schedule should next fire.
///
/// With a `last_run_at`, the next fire is one interval after it. Otherwise
/// the anchor (`start_from`, falling back to `created_at`) is advanced by
/// whole intervals until it reaches `now`.
pub fn compute_next_run(
    kind: IntervalKind,
    interval: i64,
    start_from: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let delta = kind.delta(interval.max(1));

    if let Some(last) = last_run_at {
        return last + delta;
    }

    let mut next = start_from.unwrap_or(created_at);
    while next < now {
        next += delta;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn call_mode_wire_parsing_is_permissive() {
        assert_eq!(CallMode::from_wire("synchronous"), CallMode::Synchronous);
        assert_eq!(CallMode::from_wire("asynchronous"), CallMode::Asynchronous);
        // Anything else counts as asynchronous.
        assert_eq!(CallMode::from_wire("async"), CallMode::Asynchronous);
    }

    #[test]
    fn run_state_round_trips_through_str() {
        for state in [
            RunState::Generating,
            RunState::Waiting,
            RunState::ExecutingTool,
            RunState::Completed,
        ] {
            assert_eq!(RunState::parse(state.as_str()), state);
        }
    }

    #[test]
    fn next_run_from_last_run_is_one_interval_later() {
        let last = t0();
        let next = compute_next_run(
            IntervalKind::Minutes,
            5,
            None,
            Some(last),
            t0() - Duration::hours(1),
            t0() + Duration::minutes(12),
        );
        assert_eq!(next, last + Duration::minutes(5));
    }

    #[test]
    fn next_run_advances_anchor_past_now() {
        // Anchor = created_at = T0, now = T0+12min, interval = 5min.
        // First occurrence >= now is T0+15min.
        let next = compute_next_run(
            IntervalKind::Minutes,
            5,
            None,
            None,
            t0(),
            t0() + Duration::minutes(12),
        );
        assert_eq!(next, t0() + Duration::minutes(15));
    }

    #[test]
    fn next_run_anchor_in_future_is_kept() {
        let anchor = t0() + Duration::hours(2);
        let next = compute_next_run(IntervalKind::Hours, 1, Some(anchor), None, t0(), t0());
        assert_eq!(next, anchor);
    }

    #[test]
    fn interval_kind_deltas() {
        assert_eq!(IntervalKind::Minutes.delta(3), Duration::minutes(3));
        assert_eq!(IntervalKind::Hours.delta(2), Duration::hours(2));
        assert_eq!(IntervalKind::Weeks.delta(1), Duration::weeks(1));
    }
}
