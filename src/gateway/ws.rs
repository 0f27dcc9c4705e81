//! WebSocket channel.
//!
//! Clients connect at `GET /api/ws` and receive every [`AppEvent`] as a
//! JSON message. A small command set lets a client trigger runs and stops
//! over the same socket.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::agents::orchestrator::DEFAULT_MAX_ITERATIONS;

use super::GatewayState;

/// WebSocket upgrade handler at `GET /api/ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(ctx): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, ctx))
}

// ─── Incoming command types ──────────────────────────────────────────────────

/// Envelope for all WebSocket commands sent by clients.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    /// Launch an agent run.
    RunAgent {
        agent: String,
        message: String,
        #[serde(default)]
        project: Option<String>,
    },
    /// Stop a run and its subtree.
    StopRun { run_id: String },
    /// Keep-alive; answered with a pong message.
    Ping,
}

// ─── Socket handler ──────────────────────────────────────────────────────────

async fn handle_socket(mut socket: WebSocket, ctx: GatewayState) {
    let mut events = ctx.bus.subscribe();

    loop {
        tokio::select! {
            // Forward bus events to the client.
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        let payload = match serde_json::to_string(&event) {
                            Ok(payload) => payload,
                            Err(e) => {
                                log::warn!("ws: failed to serialize event: {e}");
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break; // Client disconnected.
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("ws handler lagged, missed {n} events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            // Parse and dispatch commands from the client.
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_command(&text, &ctx, &mut socket).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

async fn handle_client_command(raw: &str, ctx: &GatewayState, socket: &mut WebSocket) {
    let command: WsCommand = match serde_json::from_str(raw) {
        Ok(command) => command,
        Err(e) => {
            let reply = json!({ "type": "error", "error": format!("invalid command: {e}") });
            let _ = socket.send(Message::Text(reply.to_string())).await;
            return;
        }
    };

    let reply = match command {
        WsCommand::RunAgent {
            agent,
            message,
            project,
        } => {
            let project = project.unwrap_or_else(|| "default".to_string());
            match ctx.spawn_agent_run(&project, &agent, &message, DEFAULT_MAX_ITERATIONS) {
                Ok(handle) => json!({ "type": "run_accepted", "run_id": handle.run_id }),
                Err(e) => json!({ "type": "error", "error": e.to_string() }),
            }
        }
        WsCommand::StopRun { run_id } => match ctx.run_manager.stop_tree(&run_id) {
            Ok(stopped) => json!({ "type": "stopped", "run_ids": stopped }),
            Err(e) => json!({ "type": "error", "error": e.to_string() }),
        },
        WsCommand::Ping => json!({ "type": "pong" }),
    };

    let _ = socket.send(Message::Text(reply.to_string())).await;
}
