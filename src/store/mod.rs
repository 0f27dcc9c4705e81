//! SQLite-backed execution store.
//!
//! [`ExecutionStore`] is the durable record of agent runs, tool invocations,
//! schedules, and projects. A [`rusqlite::Connection`] wrapped in an
//! `Arc<Mutex<…>>` keeps the store `Send + Sync` while respecting SQLite's
//! single-writer requirement; WAL mode is enabled for concurrent readers.
//!
//! # Migrations
//! The schema is created with `CREATE TABLE IF NOT EXISTS` and evolved by
//! add-column-if-missing checks on startup, so older database files upgrade
//! in place.

pub mod models;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use models::{
    AgentRunRecord, CallMode, IntervalKind, ProjectRecord, RunState, ScheduleRecord,
    ScheduleUpdate, ToolInvocationRecord, compute_next_run,
};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("store lock poisoned")]
    Lock,
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ─── Schema ──────────────────────────────────────────────────────────────────

/// DDL executed on every open. Columns added after the initial release are
/// handled by [`run_migrations`] instead of being folded into the base DDL,
/// so existing databases upgrade the same way fresh ones are created.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    project_name TEXT NOT NULL UNIQUE,
    project_dir TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agent_executions (
    run_id TEXT PRIMARY KEY,
    agent_name TEXT NOT NULL,
    parent_run_id TEXT,
    parent_agent_name TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    current_state TEXT DEFAULT 'generating',
    call_mode TEXT DEFAULT 'synchronous',
    log_file TEXT,
    project_dir TEXT DEFAULT 'default'
);

CREATE TABLE IF NOT EXISTS tool_executions (
    invocation_id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    parameters TEXT NOT NULL,
    call_mode TEXT DEFAULT 'synchronous',
    started_at TEXT NOT NULL,
    completed_at TEXT,
    result TEXT,
    FOREIGN KEY (run_id) REFERENCES agent_executions (run_id)
);

CREATE TABLE IF NOT EXISTS schedules (
    schedule_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    project_dir TEXT NOT NULL DEFAULT 'default',
    agent_name TEXT NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    schedule_kind TEXT NOT NULL,
    interval_value INTEGER NOT NULL,
    start_from TEXT,
    enabled INTEGER NOT NULL DEFAULT 1,
    last_run_at TEXT,
    next_run_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agent_executions_parent ON agent_executions (parent_run_id);
CREATE INDEX IF NOT EXISTS idx_tool_executions_run ON tool_executions (run_id);
"#;

// ─── Timestamp helpers ───────────────────────────────────────────────────────

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|v| parse_ts(&v)).transpose()
}

// ─── ExecutionStore ──────────────────────────────────────────────────────────

/// Thread-safe store handle; clone freely via `Arc`.
pub struct ExecutionStore {
    conn: Arc<Mutex<Connection>>,
}

impl ExecutionStore {
    /// Open (or create) the database at `path`, enable WAL, run migrations,
    /// and seed the `default` project.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        // PRAGMA journal_mode returns a result row, so query_row rather than
        // execute_batch.
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL")?;
        Self::bootstrap(conn)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        Self::bootstrap(Connection::open_in_memory()?)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL)?;
        run_migrations(&conn)?;
        seed_default_project(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }

    // ── Agent runs ───────────────────────────────────────────────────────────

    /// Insert a new run row and return its id. The row starts open
    /// (`completed_at = NULL`) in state `generating`.
    pub fn create_run(
        &self,
        agent_name: &str,
        parent_run_id: Option<&str>,
        parent_agent_name: &str,
        call_mode: CallMode,
        project_dir: &str,
    ) -> Result<String> {
        let run_id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO agent_executions
                (run_id, agent_name, parent_run_id, parent_agent_name, started_at,
                 completed_at, current_state, call_mode, project_dir)
            VALUES (?1, ?2, ?3, ?4, ?5, NULL, 'generating', ?6, ?7)
            "#,
            params![
                run_id,
                agent_name,
                parent_run_id,
                parent_agent_name,
                format_ts(Utc::now()),
                call_mode.as_str(),
                project_dir,
            ],
        )?;
        Ok(run_id)
    }

    /// Mark a run completed. Idempotent: a completed run keeps its original
    /// completion time.
    pub fn complete_run(&self, run_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE agent_executions
            SET completed_at = ?1, current_state = 'completed'
            WHERE run_id = ?2 AND completed_at IS NULL
            "#,
            params![format_ts(Utc::now()), run_id],
        )?;
        Ok(())
    }

    /// Update a run's live state. Completed runs are never moved back.
    pub fn set_run_state(&self, run_id: &str, state: RunState) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE agent_executions SET current_state = ?1 WHERE run_id = ?2 AND completed_at IS NULL",
            params![state.as_str(), run_id],
        )?;
        Ok(())
    }

    pub fn set_log_file(&self, run_id: &str, log_file: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE agent_executions SET log_file = ?1 WHERE run_id = ?2",
            params![log_file, run_id],
        )?;
        Ok(())
    }

    pub fn run(&self, run_id: &str) -> Result<Option<AgentRunRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM agent_executions WHERE run_id = ?1"),
            params![run_id],
            row_to_run,
        )
        .optional()
        .map_err(StoreError::from)?
        .transpose()
    }

    /// All runs, newest first, optionally filtered by project.
    pub fn runs(&self, project_dir: Option<&str>) -> Result<Vec<AgentRunRecord>> {
        let conn = self.lock()?;
        let mut out = Vec::new();
        match project_dir {
            Some(project) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM agent_executions WHERE project_dir = ?1 ORDER BY started_at DESC"
                ))?;
                let rows = stmt.query_map(params![project], row_to_run)?;
                for row in rows {
                    out.push(row??);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {RUN_COLUMNS} FROM agent_executions ORDER BY started_at DESC"
                ))?;
                let rows = stmt.query_map([], row_to_run)?;
                for row in rows {
                    out.push(row??);
                }
            }
        }
        Ok(out)
    }

    /// Direct children of a run, oldest first.
    pub fn child_runs(&self, run_id: &str) -> Result<Vec<AgentRunRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RUN_COLUMNS} FROM agent_executions WHERE parent_run_id = ?1 ORDER BY started_at ASC"
        ))?;
        let rows = stmt.query_map(params![run_id], row_to_run)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// The run ids of `root` and every transitive descendant, breadth-first.
    ///
    /// Cycles cannot occur: a child's parent row always predates the child.
    pub fn descendant_run_ids(&self, root: &str) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT run_id FROM agent_executions WHERE parent_run_id = ?1")?;

        let mut out = vec![root.to_string()];
        let mut frontier = vec![root.to_string()];
        while let Some(current) = frontier.pop() {
            let children = stmt
                .query_map(params![current], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for child in children {
                frontier.push(child.clone());
                out.push(child);
            }
        }
        Ok(out)
    }

    /// Mark every open run (optionally scoped to a project) completed.
    /// Returns the number of rows affected. Used by `stop_all` and by
    /// startup reclamation of runs orphaned by a crash.
    pub fn mark_open_runs_completed(&self, project_dir: Option<&str>) -> Result<usize> {
        let conn = self.lock()?;
        let now = format_ts(Utc::now());
        let count = match project_dir {
            Some(project) => conn.execute(
                r#"
                UPDATE agent_executions
                SET completed_at = ?1, current_state = 'completed'
                WHERE completed_at IS NULL AND project_dir = ?2
                "#,
                params![now, project],
            )?,
            None => conn.execute(
                r#"
                UPDATE agent_executions
                SET completed_at = ?1, current_state = 'completed'
                WHERE completed_at IS NULL
                "#,
                params![now],
            )?,
        };
        Ok(count)
    }

    /// Mark a specific set of runs completed. Returns rows affected.
    pub fn mark_runs_completed(&self, run_ids: &[String]) -> Result<usize> {
        let conn = self.lock()?;
        let now = format_ts(Utc::now());
        let mut count = 0;
        for run_id in run_ids {
            count += conn.execute(
                r#"
                UPDATE agent_executions
                SET completed_at = ?1, current_state = 'completed'
                WHERE run_id = ?2 AND completed_at IS NULL
                "#,
                params![now, run_id],
            )?;
        }
        Ok(count)
    }

    // ── Tool invocations ─────────────────────────────────────────────────────

    pub fn create_invocation(
        &self,
        run_id: &str,
        tool_name: &str,
        parameters: &serde_json::Value,
        call_mode: CallMode,
    ) -> Result<String> {
        let invocation_id = Uuid::new_v4().to_string();
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO tool_executions
                (invocation_id, run_id, tool_name, parameters, call_mode, started_at,
                 completed_at, result)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL)
            "#,
            params![
                invocation_id,
                run_id,
                tool_name,
                parameters.to_string(),
                call_mode.as_str(),
                format_ts(Utc::now()),
            ],
        )?;
        Ok(invocation_id)
    }

    /// Record the result of an invocation. `completed_at` and `result` are
    /// always written together.
    pub fn complete_invocation(&self, invocation_id: &str, result: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tool_executions SET completed_at = ?1, result = ?2 WHERE invocation_id = ?3",
            params![format_ts(Utc::now()), result, invocation_id],
        )?;
        Ok(())
    }

    /// All invocations for a run, oldest first.
    pub fn invocations(&self, run_id: &str) -> Result<Vec<ToolInvocationRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT invocation_id, run_id, tool_name, parameters, call_mode,
                   started_at, completed_at, result
            FROM tool_executions
            WHERE run_id = ?1
            ORDER BY started_at ASC
            "#,
        )?;
        let rows = stmt.query_map(params![run_id], row_to_invocation)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    // ── Projects ─────────────────────────────────────────────────────────────

    pub fn create_project(&self, project_name: &str, project_dir: &str) -> Result<ProjectRecord> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO projects (project_name, project_dir, created_at) VALUES (?1, ?2, ?3)",
            params![project_name, project_dir, format_ts(Utc::now())],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(format!(
                    "project '{project_name}' or directory '{project_dir}' already exists"
                ))
            }
            other => StoreError::Sqlite(other),
        })?;
        drop(conn);
        self.project_by_name(project_name)?
            .ok_or_else(|| StoreError::NotFound(format!("project '{project_name}'")))
    }

    pub fn project_by_name(&self, project_name: &str) -> Result<Option<ProjectRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT project_name, project_dir, created_at FROM projects WHERE project_name = ?1",
            params![project_name],
            row_to_project,
        )
        .optional()
        .map_err(StoreError::from)?
        .transpose()
    }

    pub fn project_by_dir(&self, project_dir: &str) -> Result<Option<ProjectRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT project_name, project_dir, created_at FROM projects WHERE project_dir = ?1",
            params![project_dir],
            row_to_project,
        )
        .optional()
        .map_err(StoreError::from)?
        .transpose()
    }

    /// All projects, oldest first.
    pub fn projects(&self) -> Result<Vec<ProjectRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT project_name, project_dir, created_at FROM projects ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_project)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Delete a project row. The `default` project is protected.
    pub fn delete_project(&self, project_name: &str) -> Result<()> {
        if project_name == "default" {
            return Err(StoreError::Conflict(
                "cannot delete the default project".to_string(),
            ));
        }
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM projects WHERE project_name = ?1",
            params![project_name],
        )?;
        if deleted == 0 {
            return Err(StoreError::NotFound(format!("project '{project_name}'")));
        }
        Ok(())
    }

    // ── Schedules ────────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_schedule(
        &self,
        name: &str,
        project_dir: &str,
        agent_name: &str,
        message: &str,
        kind: IntervalKind,
        interval: i64,
        start_from: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> Result<ScheduleRecord> {
        if interval < 1 {
            return Err(StoreError::InvalidData(format!(
                "interval must be >= 1, got {interval}"
            )));
        }
        let schedule_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        // The evaluation instant is sampled after `created_at`, so an anchor
        // equal to the creation time still lands one interval in the future.
        let next_run_at = compute_next_run(kind, interval, start_from, None, now, Utc::now());

        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO schedules
                (schedule_id, name, project_dir, agent_name, message, schedule_kind,
                 interval_value, start_from, enabled, last_run_at, next_run_at,
                 created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, ?10, ?11, ?12)
            "#,
            params![
                schedule_id,
                name,
                project_dir,
                agent_name,
                message,
                kind.as_str(),
                interval,
                start_from.map(format_ts),
                enabled as i64,
                format_ts(next_run_at),
                format_ts(now),
                format_ts(now),
            ],
        )?;
        drop(conn);
        self.schedule(&schedule_id)?
            .ok_or_else(|| StoreError::NotFound(format!("schedule '{schedule_id}'")))
    }

    pub fn schedule(&self, schedule_id: &str) -> Result<Option<ScheduleRecord>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE schedule_id = ?1"),
            params![schedule_id],
            row_to_schedule,
        )
        .optional()
        .map_err(StoreError::from)?
        .transpose()
    }

    /// All schedules, newest first, optionally filtered by project.
    pub fn schedules(&self, project_dir: Option<&str>) -> Result<Vec<ScheduleRecord>> {
        let conn = self.lock()?;
        let mut out = Vec::new();
        match project_dir {
            Some(project) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE project_dir = ?1 ORDER BY created_at DESC"
                ))?;
                let rows = stmt.query_map(params![project], row_to_schedule)?;
                for row in rows {
                    out.push(row??);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SCHEDULE_COLUMNS} FROM schedules ORDER BY created_at DESC"
                ))?;
                let rows = stmt.query_map([], row_to_schedule)?;
                for row in rows {
                    out.push(row??);
                }
            }
        }
        Ok(out)
    }

    /// Apply a partial update. Changes to kind/interval/start_from recompute
    /// `next_run_at` against the schedule's current `last_run_at`.
    pub fn update_schedule(
        &self,
        schedule_id: &str,
        update: &ScheduleUpdate,
    ) -> Result<ScheduleRecord> {
        let current = self
            .schedule(schedule_id)?
            .ok_or_else(|| StoreError::NotFound(format!("schedule '{schedule_id}'")))?;

        let name = update.name.clone().unwrap_or(current.name);
        let agent_name = update.agent_name.clone().unwrap_or(current.agent_name);
        let message = update.message.clone().unwrap_or(current.message);
        let kind = update.kind.unwrap_or(current.kind);
        let interval = update.interval.unwrap_or(current.interval);
        let start_from = update.start_from.unwrap_or(current.start_from);
        let enabled = update.enabled.unwrap_or(current.enabled);

        if interval < 1 {
            return Err(StoreError::InvalidData(format!(
                "interval must be >= 1, got {interval}"
            )));
        }

        let now = Utc::now();
        let next_run_at = if update.changes_timing() {
            compute_next_run(
                kind,
                interval,
                start_from,
                current.last_run_at,
                current.created_at,
                now,
            )
        } else {
            current.next_run_at
        };

        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE schedules
            SET name = ?1, agent_name = ?2, message = ?3, schedule_kind = ?4,
                interval_value = ?5, start_from = ?6, enabled = ?7,
                next_run_at = ?8, updated_at = ?9
            WHERE schedule_id = ?10
            "#,
            params![
                name,
                agent_name,
                message,
                kind.as_str(),
                interval,
                start_from.map(format_ts),
                enabled as i64,
                format_ts(next_run_at),
                format_ts(now),
                schedule_id,
            ],
        )?;
        drop(conn);
        self.schedule(schedule_id)?
            .ok_or_else(|| StoreError::NotFound(format!("schedule '{schedule_id}'")))
    }

    pub fn delete_schedule(&self, schedule_id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let deleted = conn.execute(
            "DELETE FROM schedules WHERE schedule_id = ?1",
            params![schedule_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn delete_schedules_for_project(&self, project_dir: &str) -> Result<usize> {
        let conn = self.lock()?;
        Ok(conn.execute(
            "DELETE FROM schedules WHERE project_dir = ?1",
            params![project_dir],
        )?)
    }

    /// Enabled schedules whose `next_run_at` has passed, soonest first.
    pub fn due_schedules(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {SCHEDULE_COLUMNS} FROM schedules
            WHERE enabled = 1 AND next_run_at <= ?1
            ORDER BY next_run_at ASC
            "#
        ))?;
        let rows = stmt.query_map(params![format_ts(now)], row_to_schedule)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    /// Record a firing: `last_run_at = now`, `next_run_at = now + Δ`.
    pub fn mark_schedule_run(&self, schedule_id: &str, now: DateTime<Utc>) -> Result<()> {
        let Some(schedule) = self.schedule(schedule_id)? else {
            return Ok(());
        };
        let next_run_at = compute_next_run(
            schedule.kind,
            schedule.interval,
            schedule.start_from,
            Some(now),
            schedule.created_at,
            now,
        );
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE schedules
            SET last_run_at = ?1, next_run_at = ?2, updated_at = ?3
            WHERE schedule_id = ?4
            "#,
            params![
                format_ts(now),
                format_ts(next_run_at),
                format_ts(now),
                schedule_id,
            ],
        )?;
        Ok(())
    }
}

// ─── Row mapping ─────────────────────────────────────────────────────────────

const RUN_COLUMNS: &str = "run_id, agent_name, parent_run_id, parent_agent_name, started_at, \
                           completed_at, current_state, call_mode, log_file, project_dir";

const SCHEDULE_COLUMNS: &str = "schedule_id, name, project_dir, agent_name, message, \
                                schedule_kind, interval_value, start_from, enabled, \
                                last_run_at, next_run_at, created_at, updated_at";

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Result<AgentRunRecord>> {
    let started_at: String = row.get(4)?;
    let completed_at: Option<String> = row.get(5)?;
    let state: Option<String> = row.get(6)?;
    let call_mode: Option<String> = row.get(7)?;
    Ok((|| {
        Ok(AgentRunRecord {
            run_id: row.get(0)?,
            agent_name: row.get(1)?,
            parent_run_id: row.get(2)?,
            parent_agent_name: row.get(3)?,
            started_at: parse_ts(&started_at)?,
            completed_at: parse_opt_ts(completed_at)?,
            current_state: RunState::parse(state.as_deref().unwrap_or("generating")),
            call_mode: CallMode::parse(call_mode.as_deref().unwrap_or("synchronous")),
            log_file: row.get(8)?,
            project_dir: row
                .get::<_, Option<String>>(9)?
                .unwrap_or_else(|| "default".to_string()),
        })
    })())
}

fn row_to_invocation(row: &Row<'_>) -> rusqlite::Result<Result<ToolInvocationRecord>> {
    let parameters: String = row.get(3)?;
    let call_mode: Option<String> = row.get(4)?;
    let started_at: String = row.get(5)?;
    let completed_at: Option<String> = row.get(6)?;
    Ok((|| {
        Ok(ToolInvocationRecord {
            invocation_id: row.get(0)?,
            run_id: row.get(1)?,
            tool_name: row.get(2)?,
            parameters: serde_json::from_str(&parameters)
                .map_err(|e| StoreError::InvalidData(format!("bad parameters JSON: {e}")))?,
            call_mode: CallMode::parse(call_mode.as_deref().unwrap_or("synchronous")),
            started_at: parse_ts(&started_at)?,
            completed_at: parse_opt_ts(completed_at)?,
            result: row.get(7)?,
        })
    })())
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Result<ProjectRecord>> {
    let created_at: String = row.get(2)?;
    Ok((|| {
        Ok(ProjectRecord {
            project_name: row.get(0)?,
            project_dir: row.get(1)?,
            created_at: parse_ts(&created_at)?,
        })
    })())
}

fn row_to_schedule(row: &Row<'_>) -> rusqlite::Result<Result<ScheduleRecord>> {
    let kind: String = row.get(5)?;
    let start_from: Option<String> = row.get(7)?;
    let last_run_at: Option<String> = row.get(9)?;
    let next_run_at: String = row.get(10)?;
    let created_at: String = row.get(11)?;
    let updated_at: String = row.get(12)?;
    Ok((|| {
        Ok(ScheduleRecord {
            schedule_id: row.get(0)?,
            name: row.get(1)?,
            project_dir: row.get(2)?,
            agent_name: row.get(3)?,
            message: row.get(4)?,
            kind: IntervalKind::parse(&kind)
                .ok_or_else(|| StoreError::InvalidData(format!("bad schedule kind '{kind}'")))?,
            interval: row.get(6)?,
            start_from: parse_opt_ts(start_from)?,
            enabled: row.get::<_, i64>(8)? != 0,
            last_run_at: parse_opt_ts(last_run_at)?,
            next_run_at: parse_ts(&next_run_at)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        })
    })())
}

// ─── Migrations & seeding ────────────────────────────────────────────────────

/// Add columns introduced after the initial schema, if missing.
fn run_migrations(conn: &Connection) -> Result<()> {
    add_column_if_missing(
        conn,
        "agent_executions",
        "current_state",
        "TEXT DEFAULT 'generating'",
    )?;
    add_column_if_missing(
        conn,
        "agent_executions",
        "call_mode",
        "TEXT DEFAULT 'synchronous'",
    )?;
    add_column_if_missing(conn, "agent_executions", "log_file", "TEXT")?;
    add_column_if_missing(
        conn,
        "agent_executions",
        "project_dir",
        "TEXT DEFAULT 'default'",
    )?;
    add_column_if_missing(
        conn,
        "tool_executions",
        "call_mode",
        "TEXT DEFAULT 'synchronous'",
    )?;
    Ok(())
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    if !existing.iter().any(|c| c == column) {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))?;
    }
    Ok(())
}

fn seed_default_project(conn: &Connection) -> Result<()> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM projects WHERE project_name = 'default'",
        [],
        |row| row.get(0),
    )?;
    if count == 0 {
        conn.execute(
            "INSERT INTO projects (project_name, project_dir, created_at) VALUES ('default', 'default', ?1)",
            params![format_ts(Utc::now())],
        )?;
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
