//! Application event bus.
//!
//! Runtime components publish [`AppEvent`]s best-effort; the WebSocket
//! gateway forwards every event to connected clients. Zero receivers is a
//! normal condition, not an error.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// All events that flow through the application event bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppEvent {
    /// A new agent run was created and is about to start.
    RunStarted {
        run_id: String,
        agent_name: String,
        project_dir: String,
    },
    /// An agent run finalized (explicit end_session, cancellation, or
    /// iteration cap).
    RunCompleted {
        run_id: String,
        agent_name: String,
        session_ended_explicitly: bool,
    },
    /// The run's live state changed (generating / waiting / executing_tool).
    RunStateChanged { run_id: String, state: String },
    ToolStarted {
        run_id: String,
        tool_name: String,
        call_mode: String,
    },
    ToolCompleted {
        run_id: String,
        tool_name: String,
        result_preview: String,
    },
    /// A schedule fired and launched an agent run.
    ScheduleFired {
        schedule_id: String,
        schedule_name: String,
        run_id: Option<String>,
    },
    SystemError { message: String },
}

/// Abstraction over the broadcast bus so components can be tested with
/// alternative implementations.
pub trait EventBus: Send + Sync {
    /// Publish an event. Returns `Err` only on internal channel failure;
    /// having no subscribers is fine.
    fn publish(&self, event: AppEvent) -> Result<(), String>;

    fn subscribe(&self) -> broadcast::Receiver<AppEvent>;
}

const DEFAULT_CAPACITY: usize = 1024;

/// [`EventBus`] implementation backed by a `tokio::sync::broadcast` channel.
pub struct TokioBroadcastBus {
    sender: broadcast::Sender<AppEvent>,
}

impl TokioBroadcastBus {
    /// Create with the default channel capacity (1024).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }
}

impl Default for TokioBroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for TokioBroadcastBus {
    fn publish(&self, event: AppEvent) -> Result<(), String> {
        // `send` errors only when there are zero receivers — that is fine.
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_receive() {
        let bus = TokioBroadcastBus::new();
        let mut rx = bus.subscribe();

        bus.publish(AppEvent::SystemError {
            message: "boom".to_string(),
        })
        .unwrap();

        let received = rx.recv().await.unwrap();
        assert!(matches!(received, AppEvent::SystemError { .. }));
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = TokioBroadcastBus::new();
        assert!(
            bus.publish(AppEvent::RunStateChanged {
                run_id: "r".to_string(),
                state: "waiting".to_string(),
            })
            .is_ok()
        );
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let event = AppEvent::RunStarted {
            run_id: "r1".to_string(),
            agent_name: "a".to_string(),
            project_dir: "default".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run_started");
    }
}
