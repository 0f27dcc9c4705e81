pub mod agents;
pub mod ai;
pub mod event_bus;
#[cfg(feature = "gateway")]
pub mod gateway;
pub mod projects;
pub mod prompts;
pub mod runtime;
pub mod scheduler;
pub mod store;
pub mod tools;

/// Convenience re-exports for the most commonly used traits and types across
/// the swarmhost codebase.
///
/// ```rust
/// use swarmhost::prelude::*;
/// ```
pub mod prelude {
    // LLM client
    pub use crate::ai::client::{LLMClient, TokenStream};
    pub use crate::ai::types::{ChatMessage, CompletionRequest, Role};

    // Tool system
    pub use crate::tools::{Tool, ToolInfo, ToolRegistry};

    // Agent engine
    pub use crate::agents::config::{AgentDefinition, AgentRegistry};
    pub use crate::agents::orchestrator::Orchestrator;
    pub use crate::agents::run_manager::RunManager;
    pub use crate::agents::{CallMode, RunState};

    // Persistence
    pub use crate::store::models::{
        AgentRunRecord, IntervalKind, ProjectRecord, ScheduleRecord, ToolInvocationRecord,
    };
    pub use crate::store::{ExecutionStore, StoreError};

    // Event bus
    pub use crate::event_bus::{AppEvent, EventBus, TokioBroadcastBus};

    // Scheduling
    pub use crate::scheduler::ScheduleRunner;

    // Wiring
    pub use crate::runtime::AppContext;
}
