//! HTTP/WebSocket gateway.
//!
//! A thin adapter over [`AppContext`]: REST endpoints for projects, agents,
//! executions, and schedules, plus a WebSocket channel that pushes every
//! bus event to connected clients. No orchestration logic lives here.

pub mod routes;
pub mod ws;

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::runtime::AppContext;

pub type GatewayState = Arc<AppContext>;

/// Build the full API router.
pub fn router(ctx: GatewayState) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        // Projects
        .route("/api/projects", get(routes::list_projects).post(routes::create_project))
        .route("/api/projects/clone", post(routes::clone_project))
        .route("/api/projects/:name", delete(routes::delete_project))
        // Agents
        .route("/api/agents", get(routes::list_agents))
        .route("/api/agents/run", post(routes::run_agent))
        .route("/api/agents/stop-all", post(routes::stop_all))
        .route("/api/agents/stop/:run_id", post(routes::stop_tree))
        .route(
            "/api/agents/:name",
            post(routes::create_agent).delete(routes::delete_agent),
        )
        // Executions
        .route("/api/executions", get(routes::list_executions))
        .route("/api/executions/:run_id", get(routes::get_execution))
        .route("/api/executions/:run_id/tree", get(routes::get_execution_tree))
        .route("/api/executions/:run_id/log", get(routes::get_execution_log))
        .route("/api/executions/:run_id/tools", get(routes::get_execution_tools))
        // Schedules
        .route("/api/schedules", get(routes::list_schedules).post(routes::create_schedule))
        .route(
            "/api/schedules/:schedule_id",
            get(routes::get_schedule)
                .put(routes::update_schedule)
                .delete(routes::delete_schedule),
        )
        // WebSocket
        .route("/api/ws", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Bind and serve until the process ends.
pub async fn serve(ctx: GatewayState, host: &str, port: u16) -> Result<(), String> {
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("failed to bind {addr}: {e}"))?;
    log::info!("gateway listening on http://{addr}");

    axum::serve(listener, router(ctx))
        .await
        .map_err(|e| format!("gateway server error: {e}"))
}
