//! REST handlers.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::agents::orchestrator::DEFAULT_MAX_ITERATIONS;
use crate::agents::run_log::RunLogDocument;
use crate::store::StoreError;
use crate::store::models::{
    AgentRunRecord, IntervalKind, ScheduleUpdate, ToolInvocationRecord,
};

use super::GatewayState;

// ─── Error mapping ───────────────────────────────────────────────────────────

/// Map store errors onto HTTP statuses; everything else is a 500.
pub struct ApiError(StatusCode, String);

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self(StatusCode::NOT_FOUND, message.into())
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, message.into())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::InvalidData(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self(status, e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct ProjectQuery {
    #[serde(default = "default_project")]
    pub project: String,
}

fn default_project() -> String {
    "default".to_string()
}

// ─── Health ──────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "swarmhost" }))
}

// ─── Projects ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub create_tools: bool,
    #[serde(default)]
    pub create_prompts: bool,
}

#[derive(Debug, Deserialize)]
pub struct CloneProjectRequest {
    pub source_dir: String,
    pub new_name: String,
    #[serde(default)]
    pub clone_tools: bool,
    #[serde(default)]
    pub clone_prompts: bool,
}

pub async fn list_projects(State(ctx): State<GatewayState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.projects.list_projects()?))
}

pub async fn create_project(
    State(ctx): State<GatewayState>,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = ctx
        .projects
        .create_project(&req.name, req.create_tools, req.create_prompts)?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn clone_project(
    State(ctx): State<GatewayState>,
    Json(req): Json<CloneProjectRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = ctx.projects.clone_project(
        &req.source_dir,
        &req.new_name,
        req.clone_tools,
        req.clone_prompts,
    )?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn delete_project(
    State(ctx): State<GatewayState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    ctx.projects.delete_project(&name)?;
    Ok(Json(json!({ "deleted": name })))
}

// ─── Agents ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct AgentSummary {
    pub name: String,
    pub description: String,
    pub allowed_callables: Vec<String>,
}

pub async fn list_agents(
    State(ctx): State<GatewayState>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult<impl IntoResponse> {
    let loaders = ctx.loaders(&query.project);
    let agents: Vec<AgentSummary> = loaders
        .agents
        .definitions()
        .into_iter()
        .map(|d| AgentSummary {
            name: d.name.clone(),
            description: d.description.clone(),
            allowed_callables: d.allowed_callables.clone(),
        })
        .collect();
    Ok(Json(agents))
}

#[derive(Debug, Deserialize)]
pub struct RunAgentRequest {
    pub agent: String,
    pub message: String,
    #[serde(default = "default_project")]
    pub project: String,
    pub max_iterations: Option<u32>,
}

pub async fn run_agent(
    State(ctx): State<GatewayState>,
    Json(req): Json<RunAgentRequest>,
) -> ApiResult<impl IntoResponse> {
    let handle = ctx
        .spawn_agent_run(
            &req.project,
            &req.agent,
            &req.message,
            req.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS),
        )
        .map_err(|e| match e {
            crate::runtime::SpawnError::AgentNotFound(name) => {
                ApiError::not_found(format!("agent '{name}' not found"))
            }
            crate::runtime::SpawnError::Store(e) => e.into(),
        })?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "run_id": handle.run_id, "status": "started" })),
    ))
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    pub stopped_count: usize,
    pub run_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopAllQuery {
    pub project: Option<String>,
}

pub async fn stop_all(
    State(ctx): State<GatewayState>,
    Query(query): Query<StopAllQuery>,
) -> ApiResult<impl IntoResponse> {
    let stopped = ctx.run_manager.stop_all(query.project.as_deref())?;
    Ok(Json(json!({ "stopped_count": stopped })))
}

pub async fn stop_tree(
    State(ctx): State<GatewayState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if ctx.store.run(&run_id)?.is_none() {
        return Err(ApiError::not_found(format!("run '{run_id}' not found")));
    }
    let run_ids = ctx.run_manager.stop_tree(&run_id)?;
    Ok(Json(StopResponse {
        stopped_count: run_ids.len(),
        run_ids,
    }))
}

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "default_project")]
    pub project: String,
}

pub async fn create_agent(
    State(ctx): State<GatewayState>,
    Path(name): Path<String>,
    Json(req): Json<CreateAgentRequest>,
) -> ApiResult<impl IntoResponse> {
    let loaders = ctx.loaders(&req.project);
    loaders
        .agents
        .create_agent(&name, &req.description, &req.system_prompt, &req.tools)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    ctx.invalidate_loaders(&req.project);
    Ok((StatusCode::CREATED, Json(json!({ "created": name }))))
}

pub async fn delete_agent(
    State(ctx): State<GatewayState>,
    Path(name): Path<String>,
    Query(query): Query<ProjectQuery>,
) -> ApiResult<impl IntoResponse> {
    let loaders = ctx.loaders(&query.project);
    loaders
        .agents
        .delete_agent(&name)
        .map_err(|e| ApiError::not_found(e.to_string()))?;
    ctx.invalidate_loaders(&query.project);
    Ok(Json(json!({ "deleted": name })))
}

// ─── Executions ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ExecutionsQuery {
    pub project: Option<String>,
    #[serde(default)]
    pub roots_only: bool,
}

pub async fn list_executions(
    State(ctx): State<GatewayState>,
    Query(query): Query<ExecutionsQuery>,
) -> ApiResult<impl IntoResponse> {
    let mut runs = ctx.store.runs(query.project.as_deref())?;
    if query.roots_only {
        runs.retain(|r| r.parent_run_id.is_none());
    }
    Ok(Json(runs))
}

pub async fn get_execution(
    State(ctx): State<GatewayState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run = ctx
        .store
        .run(&run_id)?
        .ok_or_else(|| ApiError::not_found(format!("run '{run_id}' not found")))?;
    Ok(Json(run))
}

/// The execution tree: a run, its tool invocations, and its children,
/// recursively.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTree {
    #[serde(flatten)]
    pub run: AgentRunRecord,
    pub tools: Vec<ToolInvocationRecord>,
    pub children: Vec<ExecutionTree>,
}

fn build_tree(ctx: &GatewayState, run: AgentRunRecord) -> Result<ExecutionTree, StoreError> {
    let tools = ctx.store.invocations(&run.run_id)?;
    let mut children = Vec::new();
    for child in ctx.store.child_runs(&run.run_id)? {
        children.push(build_tree(ctx, child)?);
    }
    Ok(ExecutionTree {
        run,
        tools,
        children,
    })
}

pub async fn get_execution_tree(
    State(ctx): State<GatewayState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run = ctx
        .store
        .run(&run_id)?
        .ok_or_else(|| ApiError::not_found(format!("run '{run_id}' not found")))?;
    Ok(Json(build_tree(&ctx, run)?))
}

pub async fn get_execution_log(
    State(ctx): State<GatewayState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run = ctx
        .store
        .run(&run_id)?
        .ok_or_else(|| ApiError::not_found(format!("run '{run_id}' not found")))?;
    let log_file = run
        .log_file
        .ok_or_else(|| ApiError::not_found(format!("log for run '{run_id}' not found")))?;

    let text = tokio::fs::read_to_string(&log_file)
        .await
        .map_err(|e| ApiError::not_found(format!("log file unreadable: {e}")))?;
    let document: RunLogDocument = serde_json::from_str(&text)
        .map_err(|e| ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("corrupt log: {e}")))?;
    Ok(Json(document))
}

pub async fn get_execution_tools(
    State(ctx): State<GatewayState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if ctx.store.run(&run_id)?.is_none() {
        return Err(ApiError::not_found(format!("run '{run_id}' not found")));
    }
    Ok(Json(ctx.store.invocations(&run_id)?))
}

// ─── Schedules ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub name: String,
    #[serde(default = "default_project")]
    pub project: String,
    pub agent: String,
    #[serde(default)]
    pub message: String,
    pub kind: IntervalKind,
    pub interval: i64,
    pub start_from: Option<DateTime<Utc>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn list_schedules(
    State(ctx): State<GatewayState>,
    Query(query): Query<StopAllQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.store.schedules(query.project.as_deref())?))
}

pub async fn create_schedule(
    State(ctx): State<GatewayState>,
    Json(req): Json<CreateScheduleRequest>,
) -> ApiResult<impl IntoResponse> {
    let record = ctx.store.create_schedule(
        &req.name,
        &req.project,
        &req.agent,
        &req.message,
        req.kind,
        req.interval,
        req.start_from,
        req.enabled,
    )?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn get_schedule(
    State(ctx): State<GatewayState>,
    Path(schedule_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = ctx
        .store
        .schedule(&schedule_id)?
        .ok_or_else(|| ApiError::not_found(format!("schedule '{schedule_id}' not found")))?;
    Ok(Json(record))
}

pub async fn update_schedule(
    State(ctx): State<GatewayState>,
    Path(schedule_id): Path<String>,
    Json(update): Json<ScheduleUpdate>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(ctx.store.update_schedule(&schedule_id, &update)?))
}

pub async fn delete_schedule(
    State(ctx): State<GatewayState>,
    Path(schedule_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    if !ctx.store.delete_schedule(&schedule_id)? {
        return Err(ApiError::not_found(format!("schedule '{schedule_id}' not found")));
    }
    Ok(Json(json!({ "deleted": schedule_id })))
}
