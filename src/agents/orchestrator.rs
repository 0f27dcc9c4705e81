//! The per-run orchestration loop.
//!
//! # Algorithm
//!
//! ```text
//! conversation = [system message: persona + callable inventory + protocol rules]
//!       │
//!       ▼
//! iteration head: state=generating; inject pending-task listing; call LLM;
//! remove the listing (success or failure)
//!       │
//!       ▼ parse <tool_call> blocks
//! none?            → append end_session reminder, continue generating
//! parse errors     → diagnose each faulty block, execute the rest
//! synchronous      → execute in textual order, result appended after each
//! asynchronous     → allocate task ids, launch via TaskManager, notify
//! end_session      → rejected while outstanding() > 0, else terminate
//!       │
//!       ▼
//! wait phase: block on the next task result when work is pending,
//! append "Task '<id>' completed", mark processed, continue
//!       │
//!       ▼
//! stop on accepted end_session, max_iterations, or cancellation;
//! finalization always drains the TaskManager, completes the run row,
//! and flushes the JSON log
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_recursion::async_recursion;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::ai::client::LLMClient;
use crate::ai::types::{ChatMessage, CompletionRequest};
use crate::event_bus::{AppEvent, EventBus};
use crate::prompts::PromptLoader;
use crate::store::{ExecutionStore, StoreError};
use crate::tools::{ToolRegistry, check_required_params};

use super::config::{AgentDefinition, AgentRegistry};
use super::run_log::RunLog;
use super::task_manager::{PendingTask, TaskManager, preview};
use super::tool_parser::{
    ParsedToolCall, clean_result, extract_tool_calls, partition_calls, text_before_end_session,
};
use super::{BUILTIN_CALLABLES, CallMode, END_SESSION_TOOL, RunState};

/// Default iteration cap for a run.
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

/// Quick poll timeout used when no task is pending but the loop has nothing
/// else to do.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Minimum interval between streaming log flushes during generation.
const STREAM_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Sampling temperature for agent turns.
const TEMPERATURE: f32 = 0.7;

// ─── Shared capabilities ─────────────────────────────────────────────────────

/// The capabilities an orchestrator needs, threaded explicitly through
/// construction. Cloned cheaply into child orchestrators and task wrappers.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub store: Arc<ExecutionStore>,
    pub llm: Arc<dyn LLMClient>,
    pub tools: Arc<ToolRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub prompts: Arc<PromptLoader>,
    pub bus: Option<Arc<dyn EventBus>>,
    /// Process-wide run registry; every run (children included) registers
    /// its cancellation handle here for targeted stops.
    pub run_registry: Option<Arc<super::run_manager::RunManager>>,
    /// Bounded worker pool for blocking tool execution.
    pub tool_pool: Arc<Semaphore>,
    pub logs_dir: PathBuf,
    pub model: String,
    pub project_dir: String,
}

impl OrchestratorDeps {
    fn publish(&self, event: AppEvent) {
        if let Some(bus) = &self.bus {
            let _ = bus.publish(event);
        }
    }
}

// ─── Orchestrator ────────────────────────────────────────────────────────────

/// Drives one agent run: the LLM loop, tool dispatch, task accounting, and
/// finalization. Owns the conversation and the run's [`TaskManager`].
pub struct Orchestrator {
    deps: OrchestratorDeps,
    definition: AgentDefinition,
    run_id: String,
    cancel: CancellationToken,
    tasks: TaskManager,
    conversation: Vec<ChatMessage>,
    run_log: RunLog,
}

impl Orchestrator {
    /// Create a new run: inserts the run row, opens the log file, and
    /// synthesizes the system message.
    pub fn new(
        deps: OrchestratorDeps,
        definition: AgentDefinition,
        parent: Option<(String, String)>,
        call_mode: CallMode,
        cancel: CancellationToken,
    ) -> Result<Self, StoreError> {
        let (parent_run_id, parent_agent_name) = match &parent {
            Some((run_id, agent_name)) => (Some(run_id.as_str()), agent_name.as_str()),
            None => (None, "root"),
        };

        let run_id = deps.store.create_run(
            &definition.name,
            parent_run_id,
            parent_agent_name,
            call_mode,
            &deps.project_dir,
        )?;

        let run_log = RunLog::new(
            &deps.logs_dir,
            &run_id,
            &definition.name,
            parent_run_id,
            parent_agent_name,
            &deps.model,
        );
        deps.store
            .set_log_file(&run_id, &run_log.path().to_string_lossy())?;

        let system_message = build_system_message(&definition, &deps);
        let conversation = vec![ChatMessage::system(system_message)];

        Ok(Self {
            deps,
            definition,
            run_id,
            cancel,
            tasks: TaskManager::new(),
            conversation,
            run_log,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the agent against a user message until the session ends.
    ///
    /// Never fails: transport and tool failures are folded into the
    /// conversation, store failures abort the loop, and finalization always
    /// runs.
    #[async_recursion]
    pub async fn run(&mut self, user_message: &str, max_iterations: u32) -> String {
        self.conversation.push(ChatMessage::user(user_message));

        log::info!(
            "starting agent '{}' (run {}): {}",
            self.definition.name,
            self.run_id,
            preview(user_message, 200)
        );
        self.deps.publish(AppEvent::RunStarted {
            run_id: self.run_id.clone(),
            agent_name: self.definition.name.clone(),
            project_dir: self.deps.project_dir.clone(),
        });
        if let Some(registry) = &self.deps.run_registry {
            registry.register(&self.run_id, self.cancel.clone());
        }

        let mut iterations = 0u32;
        let mut final_response = String::new();
        let mut should_continue = true;
        let mut session_ended = false;

        while iterations < max_iterations && !session_ended {
            if self.cancel.is_cancelled() {
                log::info!("run {} cancelled", self.run_id);
                break;
            }

            if should_continue {
                iterations += 1;
                let outcome = self.handle_iteration(iterations, max_iterations).await;
                match outcome {
                    Ok((response, next_continue, ended)) => {
                        final_response = response;
                        should_continue = next_continue;
                        session_ended = ended;
                    }
                    Err(e) => {
                        log::error!("run {}: store failure, aborting: {e}", self.run_id);
                        final_response = format!("Run aborted: {e}");
                        break;
                    }
                }
            }

            let has_pending = self.tasks.has_pending();
            let task_result = self.wait_for_task_result(has_pending, should_continue).await;
            match task_result {
                Some((task_id, result)) => {
                    should_continue = self.process_task_result(&task_id, &result, session_ended);
                }
                None if !has_pending && !should_continue => {
                    if session_ended {
                        break;
                    }
                    log::info!("run {}: no task results pending, continuing", self.run_id);
                    should_continue = true;
                }
                None => {}
            }
        }

        // ── Finalization: always settle tasks, close the row, flush the log.
        let report = self.tasks.drain_remaining(self.cancel.is_cancelled()).await;
        if !report.is_clean() {
            log::warn!(
                "run {}: {} task result(s) drained unprocessed, {} cancelled without result",
                self.run_id,
                report.drained_unprocessed,
                report.cancelled_without_result
            );
        }

        if !session_ended && iterations >= max_iterations {
            log::warn!("run {}: max iterations reached without end_session", self.run_id);
        }

        if let Err(e) = self.deps.store.complete_run(&self.run_id) {
            log::error!("run {}: failed to mark completed: {e}", self.run_id);
        }

        if let Some(registry) = &self.deps.run_registry {
            registry.deregister(&self.run_id);
        }
        self.run_log
            .finalize(&self.conversation, &final_response, iterations, session_ended);
        log::info!(
            "agent '{}' completed after {iterations} iteration(s), explicit end: {session_ended}",
            self.definition.name
        );
        self.deps.publish(AppEvent::RunCompleted {
            run_id: self.run_id.clone(),
            agent_name: self.definition.name.clone(),
            session_ended_explicitly: session_ended,
        });

        final_response
    }

    // ── One iteration ────────────────────────────────────────────────────────

    /// Returns `(response, should_continue, session_ended)`.
    #[tracing::instrument(
        name = "agent.iteration",
        skip_all,
        fields(run_id = %self.run_id, iteration = iteration)
    )]
    async fn handle_iteration(
        &mut self,
        iteration: u32,
        max_iterations: u32,
    ) -> Result<(String, bool, bool), StoreError> {
        log::info!("run {}: iteration {iteration}/{max_iterations}", self.run_id);
        self.set_state(RunState::Generating)?;

        // Pending-task listing is visible to the model for exactly one call.
        let pending_message = self.build_pending_tasks_message();
        if let Some(message) = &pending_message {
            self.conversation.push(ChatMessage::system(message.clone()));
        }
        let response = self.call_llm().await;
        if pending_message.is_some() {
            self.conversation.pop();
        }

        let calls = extract_tool_calls(&response);
        if calls.is_empty() {
            log::warn!("run {}: no tool call in response", self.run_id);
            let reminder = self.deps.prompts.runtime_message("no_tool_call_warning", &[]);
            self.conversation.push(ChatMessage::system(reminder));
            return Ok((response, true, false));
        }

        self.process_tool_calls(response, calls).await
    }

    async fn process_tool_calls(
        &mut self,
        response: String,
        calls: Vec<ParsedToolCall>,
    ) -> Result<(String, bool, bool), StoreError> {
        log::info!("run {}: {} tool call(s) detected", self.run_id, calls.len());

        let (valid, faulty): (Vec<_>, Vec<_>) =
            calls.into_iter().partition(|c| c.parse_error.is_none());

        self.conversation.push(ChatMessage::assistant(response.clone()));
        for call in &faulty {
            let diagnostic = call.parse_error.as_deref().unwrap_or("unknown parse error");
            self.conversation.push(ChatMessage::user(format!(
                "Error parsing tool call for '{}': {diagnostic}",
                call.tool_name
            )));
        }

        let partitioned = partition_calls(valid);

        // Synchronous phase: strict textual order, result appended before the
        // next call is dispatched.
        for call in &partitioned.synchronous {
            log::info!(
                "run {}: executing (sync) {} {}",
                self.run_id,
                call.tool_name,
                call.parameters
            );
            let result = self.dispatch(call.tool_name.clone(), call.parameters.clone(), CallMode::Synchronous)
                .await?;
            log::info!("run {}:   result: {}", self.run_id, preview(&result, 200));
            let message = self.deps.prompts.runtime_message(
                "tool_result",
                &[("tool_name", call.tool_name.as_str()), ("result", result.as_str())],
            );
            self.conversation.push(ChatMessage::user(message));
            self.run_log.save(&self.conversation);
        }

        // Asynchronous phase: launch everything, then notify with the ids.
        let mut launched_ids = Vec::new();
        for call in &partitioned.asynchronous {
            let task_id = self.tasks.generate_task_id(&call.tool_name);
            log::info!(
                "run {}: launching (async) {} as {task_id}",
                self.run_id,
                call.tool_name
            );
            let ctx = DispatchCtx {
                deps: self.deps.clone(),
                definition: self.definition.clone(),
                run_id: self.run_id.clone(),
                cancel: self.cancel.clone(),
            };
            let tool_name = call.tool_name.clone();
            let parameters = call.parameters.clone();
            self.tasks.launch(
                task_id.clone(),
                &call.tool_name,
                call.parameters.clone(),
                async move {
                    match dispatch_tool_call(ctx, tool_name.clone(), parameters, CallMode::Asynchronous)
                        .await
                    {
                        Ok(result) => result,
                        Err(e) => format!("Error executing tool '{tool_name}': {e}"),
                    }
                },
            );
            launched_ids.push(task_id);
        }

        if !launched_ids.is_empty() {
            let task_list = self.deps.prompts.format_task_list(&launched_ids);
            let count = launched_ids.len().to_string();
            let notification = self.deps.prompts.runtime_message(
                "tasks_launched_notification",
                &[("task_count", count.as_str()), ("task_list", task_list.as_str())],
            );
            self.conversation.push(ChatMessage::system(notification));
        }

        if let Some(end_call) = partitioned.end_session {
            return self.handle_end_session(&end_call, &response).await;
        }

        let should_continue =
            !partitioned.synchronous.is_empty() && partitioned.asynchronous.is_empty();
        self.set_state(if should_continue {
            RunState::Generating
        } else {
            RunState::Waiting
        })?;

        Ok((response, should_continue, false))
    }

    async fn handle_end_session(
        &mut self,
        end_call: &ParsedToolCall,
        response: &str,
    ) -> Result<(String, bool, bool), StoreError> {
        // Outstanding covers results still in the queue, not just running
        // tasks: ending here would lose them.
        let outstanding = self.tasks.outstanding();
        if outstanding > 0 {
            let pending_ids = self.tasks.pending_task_ids();
            let task_list = if pending_ids.is_empty() {
                format!("({outstanding} task result(s) awaiting processing)")
            } else {
                pending_ids.join(", ")
            };
            log::warn!(
                "run {}: end_session rejected with {outstanding} outstanding task(s): {task_list}",
                self.run_id
            );

            let count = outstanding.to_string();
            let warning = self.deps.prompts.runtime_message(
                "end_session_with_pending_tasks_error",
                &[("pending_count", count.as_str()), ("task_list", task_list.as_str())],
            );
            self.conversation.push(ChatMessage::system(warning));
            self.set_state(RunState::Waiting)?;
            return Ok((response.to_string(), false, false));
        }

        log::info!("run {}: end_session accepted", self.run_id);

        let text_before = text_before_end_session(response);
        let mut final_response = if text_before.is_empty() {
            response.to_string()
        } else {
            text_before
        };

        // end_session runs through normal dispatch so it is recorded as a
        // tool invocation like everything else.
        let result = self
            .dispatch(
                END_SESSION_TOOL.to_string(),
                end_call.parameters.clone(),
                CallMode::Synchronous,
            )
            .await?;
        log::info!("run {}:   {result}", self.run_id);

        if let Some(message) = end_call
            .parameters
            .get("final_message")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
        {
            final_response = message.to_string();
        }

        log::info!("run {}: final response: {}", self.run_id, preview(&final_response, 100));
        Ok((final_response, false, true))
    }

    // ── Wait phase ───────────────────────────────────────────────────────────

    /// Fetch the next task result according to the loop's state:
    /// queued results are returned immediately; with running tasks the call
    /// blocks (cancellation-aware); otherwise a quick poll or nothing.
    async fn wait_for_task_result(
        &self,
        has_pending: bool,
        should_continue: bool,
    ) -> Option<(String, String)> {
        if let Some(result) = self.tasks.try_next_result().await {
            return Some(result);
        }

        if has_pending {
            let cancel = self.cancel.clone();
            tokio::select! {
                _ = cancel.cancelled() => None,
                result = self.tasks.wait_for_result(None) => result,
            }
        } else if !should_continue {
            self.tasks.wait_for_result(Some(POLL_TIMEOUT)).await
        } else {
            None
        }
    }

    /// Append a completed task's result to the conversation and settle the
    /// counters. Returns whether the loop should generate again.
    fn process_task_result(&mut self, task_id: &str, result: &str, session_ended: bool) -> bool {
        log::info!(
            "run {}: task {task_id} completed: {}",
            self.run_id,
            preview(result, 200)
        );

        if !session_ended {
            let message = self.deps.prompts.runtime_message(
                "task_completed",
                &[("task_id", task_id), ("result", result)],
            );
            self.conversation.push(ChatMessage::user(message));
            self.run_log.save(&self.conversation);
        }

        self.tasks.remove_task(task_id);
        self.tasks.mark_processed();

        !session_ended
    }

    // ── LLM call ─────────────────────────────────────────────────────────────

    /// Call the LLM and collect the streamed response. Transport failures
    /// become the returned content; cancellation keeps what was received.
    async fn call_llm(&mut self) -> String {
        log::info!("run {}: generating ({})", self.run_id, self.deps.model);

        let request = CompletionRequest::new(self.deps.model.clone(), self.conversation.clone())
            .with_temperature(TEMPERATURE);

        let mut stream = match self.deps.llm.stream_completion(request).await {
            Ok(stream) => stream,
            Err(e) => {
                let message = self
                    .deps
                    .prompts
                    .error_message("llm_call_error", &[("error_details", e.as_str())]);
                log::error!("run {}: {message}", self.run_id);
                self.run_log.save(&self.conversation);
                return message;
            }
        };

        let cancel = self.cancel.clone();
        let mut content = String::new();
        let mut last_flush = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("run {}: LLM streaming interrupted", self.run_id);
                    break;
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(fragment)) => {
                        content.push_str(&fragment);
                        if !content.is_empty() && last_flush.elapsed() >= STREAM_LOG_INTERVAL {
                            self.run_log.save_streaming(&self.conversation, &content);
                            last_flush = Instant::now();
                        }
                    }
                    Some(Err(e)) => {
                        if cancel.is_cancelled() {
                            log::info!("run {}: LLM streaming interrupted", self.run_id);
                            break;
                        }
                        let message = self
                            .deps
                            .prompts
                            .error_message("llm_call_error", &[("error_details", e.as_str())]);
                        log::error!("run {}: {message}", self.run_id);
                        self.run_log.save(&self.conversation);
                        return message;
                    }
                    None => break,
                }
            }
        }

        if content.is_empty() {
            log::warn!("run {}: empty response from LLM", self.run_id);
        }
        self.run_log.save(&self.conversation);
        content
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    async fn dispatch(
        &self,
        tool_name: String,
        parameters: Value,
        call_mode: CallMode,
    ) -> Result<String, StoreError> {
        let ctx = DispatchCtx {
            deps: self.deps.clone(),
            definition: self.definition.clone(),
            run_id: self.run_id.clone(),
            cancel: self.cancel.clone(),
        };
        dispatch_tool_call(ctx, tool_name, parameters, call_mode).await
    }

    fn set_state(&self, state: RunState) -> Result<(), StoreError> {
        self.deps.store.set_run_state(&self.run_id, state)?;
        self.deps.publish(AppEvent::RunStateChanged {
            run_id: self.run_id.clone(),
            state: state.as_str().to_string(),
        });
        Ok(())
    }

    /// Transient listing of pending tasks, injected for a single LLM call.
    fn build_pending_tasks_message(&self) -> Option<String> {
        let pending = self.tasks.pending_snapshot();
        if pending.is_empty() {
            return None;
        }

        let prompts = &self.deps.prompts;
        let count = pending.len().to_string();
        let mut message =
            prompts.runtime_message("pending_tasks_header", &[("pending_count", count.as_str())]);
        for PendingTask {
            task_id,
            tool_name,
            parameters,
            launched_at,
        } in &pending
        {
            let parameters = parameters.to_string();
            let launched_at = launched_at.to_rfc3339();
            message += &prompts.runtime_message(
                "pending_task_item",
                &[
                    ("task_id", task_id.as_str()),
                    ("tool_name", tool_name.as_str()),
                    ("parameters", parameters.as_str()),
                    ("launched_at", launched_at.as_str()),
                ],
            );
        }
        message += &prompts.runtime_message("pending_tasks_reminder", &[]);
        Some(message)
    }

    #[cfg(test)]
    pub(crate) fn conversation(&self) -> &[ChatMessage] {
        &self.conversation
    }

    #[cfg(test)]
    pub(crate) fn task_counters(&self) -> (u64, u64) {
        (self.tasks.launched(), self.tasks.processed())
    }
}

// ─── Tool dispatch ───────────────────────────────────────────────────────────

/// Everything a dispatch needs, detached from the orchestrator so
/// asynchronous task wrappers can own it.
#[derive(Clone)]
struct DispatchCtx {
    deps: OrchestratorDeps,
    definition: AgentDefinition,
    run_id: String,
    cancel: CancellationToken,
}

/// Authorize, record, and execute one callable; returns its textual result.
///
/// Only store failures are `Err` — every execution failure is folded into
/// the result text so the model can react to it.
#[tracing::instrument(
    name = "agent.tool",
    skip_all,
    fields(tool = %tool_name, mode = call_mode.as_str())
)]
async fn dispatch_tool_call(
    ctx: DispatchCtx,
    tool_name: String,
    parameters: Value,
    call_mode: CallMode,
) -> Result<String, StoreError> {
    let DispatchCtx {
        deps,
        definition,
        run_id,
        cancel,
    } = ctx;

    // Authorization first: an unauthorized name is reported to the model
    // without ever creating an invocation row.
    if !BUILTIN_CALLABLES.contains(&tool_name.as_str())
        && !definition.allowed_callables.iter().any(|c| c == &tool_name)
    {
        let authorized = if definition.allowed_callables.is_empty() {
            "none".to_string()
        } else {
            definition.allowed_callables.join(", ")
        };
        let tools_file = definition.tools_file().display().to_string();
        let message = deps.prompts.error_message(
            "tool_not_authorized",
            &[
                ("tool_name", tool_name.as_str()),
                ("agent_name", definition.name.as_str()),
                ("authorized_tools", authorized.as_str()),
                ("tools_file", tools_file.as_str()),
            ],
        );
        log::error!("run {run_id}: security violation: {message}");
        return Ok(message);
    }

    let invocation_id = deps
        .store
        .create_invocation(&run_id, &tool_name, &parameters, call_mode)?;
    deps.store.set_run_state(&run_id, RunState::ExecutingTool)?;
    deps.publish(AppEvent::ToolStarted {
        run_id: run_id.clone(),
        tool_name: tool_name.clone(),
        call_mode: call_mode.as_str().to_string(),
    });

    let result = if tool_name == END_SESSION_TOOL {
        execute_end_session(&parameters)
    } else if let Some(tool) = deps.tools.get(&tool_name) {
        execute_registered_tool(&deps, tool, &tool_name, parameters).await
    } else if deps.agents.has_agent(&tool_name) {
        execute_child_agent(&deps, &definition, &run_id, &cancel, &tool_name, &parameters, call_mode)
            .await?
    } else {
        deps.prompts
            .error_message("tool_not_found", &[("tool_name", tool_name.as_str())])
    };

    deps.store.complete_invocation(&invocation_id, &result)?;
    deps.publish(AppEvent::ToolCompleted {
        run_id,
        tool_name,
        result_preview: preview(&result, 200),
    });

    Ok(result)
}

/// The built-in session terminator: its effect lives in the orchestrator,
/// execution only produces the sentinel.
fn execute_end_session(parameters: &Value) -> String {
    match parameters.get("final_message").and_then(Value::as_str) {
        Some(message) if !message.is_empty() => format!("SESSION_END: {message}"),
        _ => "SESSION_END".to_string(),
    }
}

/// Run a registered tool on the bounded blocking pool.
async fn execute_registered_tool(
    deps: &OrchestratorDeps,
    tool: Arc<dyn crate::tools::Tool>,
    tool_name: &str,
    parameters: Value,
) -> String {
    if let Err(e) = check_required_params(&tool.parameters_schema(), &parameters) {
        return error_text(deps, tool_name, &e);
    }

    // A closed semaphore cannot happen here; treat it as an execution error
    // all the same.
    let permit = match deps.tool_pool.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(e) => return error_text(deps, tool_name, &e.to_string()),
    };

    let name = tool_name.to_string();
    let outcome = tokio::task::spawn_blocking(move || tool.execute(parameters)).await;
    drop(permit);

    match outcome {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => error_text(deps, &name, &e),
        Err(e) => error_text(deps, &name, &format!("tool task failed: {e}")),
    }
}

/// Run a sub-agent recursively and clean its result for the parent.
async fn execute_child_agent(
    deps: &OrchestratorDeps,
    parent: &AgentDefinition,
    parent_run_id: &str,
    cancel: &CancellationToken,
    agent_name: &str,
    parameters: &Value,
    call_mode: CallMode,
) -> Result<String, StoreError> {
    let Some(child_definition) = deps.agents.get(agent_name).cloned() else {
        return Ok(deps
            .prompts
            .error_message("tool_not_found", &[("tool_name", agent_name)]));
    };

    // `query` or `message` carries the task; otherwise the raw parameters
    // serve as the message.
    let user_message = parameters
        .get("query")
        .or_else(|| parameters.get("message"))
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| parameters.to_string());

    let mut child = Orchestrator::new(
        deps.clone(),
        child_definition,
        Some((parent_run_id.to_string(), parent.name.clone())),
        call_mode,
        cancel.child_token(),
    )?;

    let result = child.run(&user_message, DEFAULT_MAX_ITERATIONS).await;
    Ok(clean_result(&result))
}

fn error_text(deps: &OrchestratorDeps, tool_name: &str, details: &str) -> String {
    deps.prompts.error_message(
        "tool_execution_error",
        &[("tool_name", tool_name), ("error_details", details)],
    )
}

// ─── System message synthesis ────────────────────────────────────────────────

/// Compose the run's system message: the agent persona, a descriptor for
/// every allowed callable, and the protocol rules.
fn build_system_message(definition: &AgentDefinition, deps: &OrchestratorDeps) -> String {
    let prompts = &deps.prompts;
    let mut message = definition.system_prompt.clone();

    if definition.allowed_callables.is_empty() {
        return message;
    }

    message += &prompts.system_prompt("available_tools_header", &[]);

    for name in &definition.allowed_callables {
        if let Some(tool) = deps.tools.get(name) {
            message += &prompts.system_prompt(
                "tool_description_template",
                &[("tool_name", name.as_str()), ("description", tool.description())],
            );
            message += &describe_parameters(prompts, &tool.parameters_schema());
            message += "\n";
        } else if let Some(agent) = deps.agents.get(name) {
            message += &prompts.system_prompt(
                "agent_description_template",
                &[("tool_name", name.as_str()), ("description", agent.description.as_str())],
            );
        }
    }

    message += &prompts.system_prompt("tool_calling_format", &[]);
    message += &prompts.system_prompt("execution_modes", &[]);
    message += &prompts.system_prompt("tool_call_examples", &[]);
    message += &prompts.system_prompt("critical_rules", &[]);
    message += &prompts.system_prompt("task_management", &[]);
    message += &prompts.system_prompt("end_session_rules", &[]);

    message
}

/// Render a tool's parameter list from its (opaque) JSON schema.
fn describe_parameters(prompts: &PromptLoader, schema: &Value) -> String {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return prompts.system_prompt("tool_no_parameters", &[]);
    };
    if properties.is_empty() {
        return prompts.system_prompt("tool_no_parameters", &[]);
    }

    let required: Vec<&str> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let mut out = String::new();
    for (param_name, info) in properties {
        let param_type = info.get("type").and_then(Value::as_str).unwrap_or("string");
        let marker = if required.contains(&param_name.as_str()) {
            " (required)"
        } else {
            " (optional)"
        };
        let description = info
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("No description");
        out += &prompts.system_prompt(
            "tool_parameter_line",
            &[
                ("param_name", param_name.as_str()),
                ("param_type", param_type),
                ("required", marker),
                ("param_description", description),
            ],
        );
    }
    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::client::{Result as LlmResult, TokenStream};
    use crate::ai::types::Role;
    use crate::prompts::PromptLoader;
    use crate::tools::Tool;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ── Mock LLM client ───────────────────────────────────────────────────────

    struct MockLlmClient {
        responses: Vec<String>,
        index: AtomicUsize,
    }

    impl MockLlmClient {
        fn new(responses: Vec<&str>) -> Arc<Self> {
            Arc::new(Self {
                responses: responses.into_iter().map(str::to_string).collect(),
                index: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl LLMClient for MockLlmClient {
        async fn stream_completion(&self, _request: CompletionRequest) -> LlmResult<TokenStream> {
            let i = self.index.fetch_add(1, Ordering::SeqCst);
            let content = self
                .responses
                .get(i)
                .cloned()
                .unwrap_or_else(|| "No more responses".to_string());
            Ok(Box::pin(futures::stream::iter(vec![Ok(content)])) as TokenStream)
        }

        fn client_name(&self) -> &str {
            "mock"
        }
    }

    struct FailingLlmClient;

    #[async_trait]
    impl LLMClient for FailingLlmClient {
        async fn stream_completion(&self, _request: CompletionRequest) -> LlmResult<TokenStream> {
            Err("connection refused".to_string())
        }

        fn client_name(&self) -> &str {
            "failing-mock"
        }
    }

    // ── Mock tools ────────────────────────────────────────────────────────────

    struct SlowTool {
        name: &'static str,
        delay: Duration,
        output: &'static str,
    }

    impl Tool for SlowTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "sleeps then answers"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn execute(&self, _params: Value) -> Result<String, String> {
            std::thread::sleep(self.delay);
            Ok(self.output.to_string())
        }
    }

    struct FailingTool;

    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "flaky"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn execute(&self, _params: Value) -> Result<String, String> {
            Err("disk on fire".to_string())
        }
    }

    // ── Harness ───────────────────────────────────────────────────────────────

    struct Harness {
        deps: OrchestratorDeps,
        _tmp: tempfile::TempDir,
    }

    fn harness(llm: Arc<dyn LLMClient>, agent_tools: &[&str]) -> (Harness, AgentDefinition) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(ExecutionStore::in_memory().unwrap());

        let mut tools = ToolRegistry::builtin(tmp.path().join("workspace"));
        tools.register(Arc::new(SlowTool {
            name: "slow",
            delay: Duration::from_millis(50),
            output: "done",
        }));
        tools.register(Arc::new(SlowTool {
            name: "x",
            delay: Duration::from_millis(120),
            output: "x-result",
        }));
        tools.register(Arc::new(SlowTool {
            name: "y",
            delay: Duration::from_millis(10),
            output: "y-result",
        }));
        tools.register(Arc::new(FailingTool));

        // Agents directory with a child agent used by the recursion test.
        let agents_dir = tmp.path().join("agents");
        let child = agents_dir.join("summarizer");
        std::fs::create_dir_all(&child).unwrap();
        std::fs::write(child.join("description.txt"), "Summarizes things").unwrap();
        std::fs::write(child.join("system_prompt.txt"), "You summarize.").unwrap();
        std::fs::write(child.join("tools.txt"), "").unwrap();
        let agents = Arc::new(AgentRegistry::load(&agents_dir));

        let deps = OrchestratorDeps {
            store,
            llm,
            tools: Arc::new(tools),
            agents,
            prompts: Arc::new(PromptLoader::with_defaults()),
            bus: None,
            run_registry: None,
            tool_pool: Arc::new(Semaphore::new(8)),
            logs_dir: tmp.path().join("logs"),
            model: "test-model".to_string(),
            project_dir: "default".to_string(),
        };

        let definition = AgentDefinition {
            name: "tester".to_string(),
            description: "test agent".to_string(),
            system_prompt: "You are a test agent.".to_string(),
            allowed_callables: agent_tools.iter().map(|s| s.to_string()).collect(),
            agent_dir: tmp.path().join("agents").join("tester"),
        };

        (Harness { deps, _tmp: tmp }, definition)
    }

    fn make_orchestrator(h: &Harness, definition: AgentDefinition) -> Orchestrator {
        Orchestrator::new(
            h.deps.clone(),
            definition,
            None,
            CallMode::Synchronous,
            CancellationToken::new(),
        )
        .unwrap()
    }

    fn user_messages(orch: &Orchestrator) -> Vec<String> {
        orch.conversation()
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .collect()
    }

    const CALC_CALL: &str = r#"I'll add those.
<tool_call>
<tool_name>calculator</tool_name>
<parameters>{"operation": "add", "a": 2, "b": 3}</parameters>
</tool_call>"#;

    const END_WITH_5: &str = r#"<tool_call>
<tool_name>end_session</tool_name>
<parameters>{"final_message": "5"}</parameters>
</tool_call>"#;

    // ── Tests ─────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn sync_tool_then_end_session() {
        let llm = MockLlmClient::new(vec![CALC_CALL, END_WITH_5]);
        let (h, def) = harness(llm, &["calculator"]);
        let mut orch = make_orchestrator(&h, def);
        let run_id = orch.run_id().to_string();

        let result = orch.run("2+3", 50).await;
        assert_eq!(result, "5");

        // Two invocation rows: calculator and end_session.
        let invocations = h.deps.store.invocations(&run_id).unwrap();
        let names: Vec<&str> = invocations.iter().map(|i| i.tool_name.as_str()).collect();
        assert_eq!(names, vec!["calculator", "end_session"]);
        assert!(invocations.iter().all(|i| i.completed_at.is_some() && i.result.is_some()));
        assert_eq!(invocations[0].result.as_deref(), Some("Result: 5"));
        assert_eq!(invocations[1].result.as_deref(), Some("SESSION_END: 5"));

        // Run row completed.
        let run = h.deps.store.run(&run_id).unwrap().unwrap();
        assert!(!run.is_running());
        assert_eq!(run.current_state, RunState::Completed);

        // Log file reflects the explicit ending after two iterations.
        let log_path = run.log_file.unwrap();
        let doc: crate::agents::run_log::RunLogDocument =
            serde_json::from_str(&std::fs::read_to_string(log_path).unwrap()).unwrap();
        assert_eq!(doc.session_ended_explicitly, Some(true));
        assert_eq!(doc.total_iterations, Some(2));
        assert_eq!(doc.final_response.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn end_session_rejected_while_task_outstanding() {
        let turn1 = r#"<tool_call>
<tool_name>slow</tool_name>
<call_mode>asynchronous</call_mode>
<parameters>{}</parameters>
</tool_call>
<tool_call>
<tool_name>end_session</tool_name>
<parameters>{"final_message": "premature"}</parameters>
</tool_call>"#;
        let turn2 = r#"<tool_call>
<tool_name>end_session</tool_name>
<parameters>{"final_message": "all done"}</parameters>
</tool_call>"#;

        let llm = MockLlmClient::new(vec![turn1, turn2]);
        let (h, def) = harness(llm, &["slow"]);
        let mut orch = make_orchestrator(&h, def);

        let result = orch.run("do the slow thing", 50).await;
        assert_eq!(result, "all done");

        let contents: Vec<&str> = orch.conversation().iter().map(|m| m.content.as_str()).collect();
        // The rejection warning names the outstanding task.
        assert!(
            contents.iter().any(|c| c.contains("CRITICAL ERROR") && c.contains("slow_1")),
            "rejection warning should name slow_1"
        );
        // The task result reached the conversation before the second accept.
        assert!(contents.iter().any(|c| c.contains("Task 'slow_1' completed")));

        let (launched, processed) = orch.task_counters();
        assert_eq!(launched, 1);
        assert_eq!(processed, 1);
    }

    #[tokio::test]
    async fn async_completion_order_follows_finish_time() {
        // x is slow, y is fast; both launched in one turn. y's completion
        // must appear first, after the assistant message and launch notice.
        let turn1 = r#"<tool_call>
<tool_name>x</tool_name>
<call_mode>asynchronous</call_mode>
<parameters>{}</parameters>
</tool_call>
<tool_call>
<tool_name>y</tool_name>
<call_mode>asynchronous</call_mode>
<parameters>{}</parameters>
</tool_call>"#;
        let turn2 = r#"<tool_call>
<tool_name>end_session</tool_name>
<parameters>{"final_message": "collected"}</parameters>
</tool_call>"#;

        let llm = MockLlmClient::new(vec![turn1, turn2, turn2]);
        let (h, def) = harness(llm, &["x", "y"]);
        let mut orch = make_orchestrator(&h, def);

        let result = orch.run("race them", 50).await;
        assert_eq!(result, "collected");

        let contents: Vec<&str> = orch.conversation().iter().map(|m| m.content.as_str()).collect();
        let launch_idx = contents
            .iter()
            .position(|c| c.contains("task(s) launched"))
            .expect("launch notice present");
        // Launch notice lists both ids in textual order.
        assert!(contents[launch_idx].contains("x_1"));
        assert!(contents[launch_idx].contains("y_2"));

        let y_idx = contents
            .iter()
            .position(|c| c.contains("Task 'y_2' completed"))
            .expect("y completion present");
        let x_idx = contents
            .iter()
            .position(|c| c.contains("Task 'x_1' completed"))
            .expect("x completion present");
        assert!(launch_idx < y_idx, "launch notice precedes completions");
        assert!(y_idx < x_idx, "fast task's completion appears first");
    }

    #[tokio::test]
    async fn unauthorized_tool_reported_without_invocation_row() {
        let turn1 = r#"<tool_call>
<tool_name>slow</tool_name>
<parameters>{}</parameters>
</tool_call>"#;
        let llm = MockLlmClient::new(vec![turn1, END_WITH_5]);
        let (h, def) = harness(llm, &["calculator"]);
        let mut orch = make_orchestrator(&h, def);
        let run_id = orch.run_id().to_string();

        let result = orch.run("try the slow tool", 50).await;
        assert_eq!(result, "5");

        // The security error reached the model as a normal tool result.
        let users = user_messages(&orch);
        assert!(
            users.iter().any(|m| m.contains("SECURITY ERROR") && m.contains("slow")),
            "security error should be in the conversation"
        );

        // Only end_session was recorded.
        let invocations = h.deps.store.invocations(&run_id).unwrap();
        let names: Vec<&str> = invocations.iter().map(|i| i.tool_name.as_str()).collect();
        assert_eq!(names, vec!["end_session"]);
    }

    #[tokio::test]
    async fn no_tool_call_appends_reminder_and_continues() {
        let llm = MockLlmClient::new(vec!["Just chatting, no tools here.", END_WITH_5]);
        let (h, def) = harness(llm, &["calculator"]);
        let mut orch = make_orchestrator(&h, def);

        let result = orch.run("hello", 50).await;
        assert_eq!(result, "5");

        let reminders: Vec<&ChatMessage> = orch
            .conversation()
            .iter()
            .filter(|m| m.role == Role::System && m.content.contains("SYSTEM REMINDER"))
            .collect();
        assert_eq!(reminders.len(), 1);
    }

    #[tokio::test]
    async fn malformed_block_diagnosed_others_execute() {
        let turn1 = r#"<tool_call>
<tool_name>broken</tool_name>
<parameters>{oops}</parameters>
</tool_call>
<tool_call>
<tool_name>calculator</tool_name>
<parameters>{"operation": "add", "a": 1, "b": 1}</parameters>
</tool_call>"#;
        let llm = MockLlmClient::new(vec![turn1, END_WITH_5]);
        let (h, def) = harness(llm, &["calculator", "broken"]);
        let mut orch = make_orchestrator(&h, def);

        orch.run("go", 50).await;

        let users = user_messages(&orch);
        assert!(users.iter().any(|m| m.contains("Error parsing tool call for 'broken'")));
        assert!(users.iter().any(|m| m.contains("Tool 'calculator' result")));
    }

    #[tokio::test]
    async fn tool_failure_becomes_result_text() {
        let turn1 = r#"<tool_call>
<tool_name>flaky</tool_name>
<parameters>{}</parameters>
</tool_call>"#;
        let llm = MockLlmClient::new(vec![turn1, END_WITH_5]);
        let (h, def) = harness(llm, &["flaky"]);
        let mut orch = make_orchestrator(&h, def);
        let run_id = orch.run_id().to_string();

        orch.run("go", 50).await;

        let users = user_messages(&orch);
        assert!(
            users
                .iter()
                .any(|m| m.contains("Error executing tool 'flaky'") && m.contains("disk on fire"))
        );
        // The invocation row still completes, carrying the error text.
        let invocations = h.deps.store.invocations(&run_id).unwrap();
        assert!(invocations[0].result.as_deref().unwrap().contains("disk on fire"));
    }

    #[tokio::test]
    async fn llm_failure_is_fed_back_as_message() {
        let llm: Arc<dyn LLMClient> = Arc::new(FailingLlmClient);
        let (h, def) = harness(llm, &["calculator"]);
        let mut orch = make_orchestrator(&h, def);

        // Every turn errors, so the loop runs to the iteration cap.
        let result = orch.run("hello", 2).await;
        assert!(result.contains("Error calling LLM"));

        let run = h.deps.store.run(orch.run_id()).unwrap().unwrap();
        assert!(!run.is_running(), "run is finalized even when the LLM fails");
    }

    #[tokio::test]
    async fn max_iterations_finalizes_with_partial_response() {
        let responses: Vec<&str> = vec![CALC_CALL; 10];
        let llm = MockLlmClient::new(responses);
        let (h, def) = harness(llm, &["calculator"]);
        let mut orch = make_orchestrator(&h, def);
        let run_id = orch.run_id().to_string();

        orch.run("loop forever", 3).await;

        let run = h.deps.store.run(&run_id).unwrap().unwrap();
        assert_eq!(run.current_state, RunState::Completed);

        let doc: crate::agents::run_log::RunLogDocument = serde_json::from_str(
            &std::fs::read_to_string(run.log_file.unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(doc.total_iterations, Some(3));
        assert_eq!(doc.session_ended_explicitly, Some(false));
    }

    #[tokio::test]
    async fn child_agent_runs_recursively() {
        // Parent calls the summarizer agent; the child immediately ends its
        // session with a think-tagged message that must be cleaned.
        let parent_turn1 = r#"<tool_call>
<tool_name>summarizer</tool_name>
<parameters>{"message": "summarize this"}</parameters>
</tool_call>"#;
        let child_turn = r#"<think>let me think</think>Summary ready.
<tool_call>
<tool_name>end_session</tool_name>
<parameters>{"final_message": "<think>hidden</think>A fine summary."}</parameters>
</tool_call>"#;
        let parent_turn2 = r#"<tool_call>
<tool_name>end_session</tool_name>
<parameters>{"final_message": "relayed"}</parameters>
</tool_call>"#;

        let llm = MockLlmClient::new(vec![parent_turn1, child_turn, parent_turn2]);
        let (h, def) = harness(llm, &["summarizer"]);
        let mut orch = make_orchestrator(&h, def);
        let parent_run_id = orch.run_id().to_string();

        let result = orch.run("delegate", 50).await;
        assert_eq!(result, "relayed");

        // The child's cleaned result (think tags stripped) reached the parent.
        let users = user_messages(&orch);
        assert!(
            users.iter().any(|m| m.contains("A fine summary.") && !m.contains("<think>")),
            "child result should be cleaned"
        );

        // The execution tree has the parent edge.
        let children = h.deps.store.child_runs(&parent_run_id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].agent_name, "summarizer");
        assert_eq!(children[0].parent_agent_name, "tester");
        assert!(!children[0].is_running());
    }

    #[tokio::test]
    async fn cancellation_finalizes_run() {
        let turn1 = r#"<tool_call>
<tool_name>slow</tool_name>
<call_mode>asynchronous</call_mode>
<parameters>{}</parameters>
</tool_call>"#;
        let llm = MockLlmClient::new(vec![turn1]);
        let (h, def) = harness(llm, &["slow"]);
        let cancel = CancellationToken::new();
        let mut orch = Orchestrator::new(
            h.deps.clone(),
            def,
            None,
            CallMode::Synchronous,
            cancel.clone(),
        )
        .unwrap();
        let run_id = orch.run_id().to_string();

        // Cancel shortly after the run starts waiting on the async task.
        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        orch.run("start and get cancelled", 50).await;
        canceller.await.unwrap();

        let run = h.deps.store.run(&run_id).unwrap().unwrap();
        assert!(!run.is_running(), "cancelled run is marked completed");

        let (launched, processed) = orch.task_counters();
        assert_eq!(launched, processed, "drain settles the counters");
    }

    #[tokio::test]
    async fn counters_balance_after_every_run() {
        let turn1 = r#"<tool_call>
<tool_name>y</tool_name>
<call_mode>asynchronous</call_mode>
<parameters>{}</parameters>
</tool_call>"#;
        let turn2 = r#"<tool_call>
<tool_name>end_session</tool_name>
<parameters>{}</parameters>
</tool_call>"#;
        let llm = MockLlmClient::new(vec![turn1, turn2]);
        let (h, def) = harness(llm, &["y"]);
        let mut orch = make_orchestrator(&h, def);

        let result = orch.run("one async then end", 50).await;
        // No final_message: the fallback is the text before end_session,
        // which here is the whole response.
        assert!(result.contains("end_session"));

        let (launched, processed) = orch.task_counters();
        assert_eq!(launched, 1);
        assert_eq!(processed, 1);
    }

    #[tokio::test]
    async fn sync_calls_execute_in_textual_order_before_end_session() {
        // Two synchronous calls and an end_session in one turn: both execute
        // in order, each result appended before the next dispatch, then the
        // session ends in the same turn.
        let turn = r#"<tool_call>
<tool_name>calculator</tool_name>
<parameters>{"operation": "add", "a": 1, "b": 2}</parameters>
</tool_call>
<tool_call>
<tool_name>calculator</tool_name>
<parameters>{"operation": "multiply", "a": 2, "b": 2}</parameters>
</tool_call>
<tool_call>
<tool_name>end_session</tool_name>
<parameters>{"final_message": "3 and 4"}</parameters>
</tool_call>"#;
        let llm = MockLlmClient::new(vec![turn]);
        let (h, def) = harness(llm, &["calculator"]);
        let mut orch = make_orchestrator(&h, def);

        let result = orch.run("compute", 50).await;
        assert_eq!(result, "3 and 4");

        let users = user_messages(&orch);
        let add_idx = users.iter().position(|m| m.contains("Result: 3")).unwrap();
        let mul_idx = users.iter().position(|m| m.contains("Result: 4")).unwrap();
        assert!(add_idx < mul_idx, "results appear in textual call order");

        // Single-turn completion.
        let doc: crate::agents::run_log::RunLogDocument = serde_json::from_str(
            &std::fs::read_to_string(
                h.deps.store.run(orch.run_id()).unwrap().unwrap().log_file.unwrap(),
            )
            .unwrap(),
        )
        .unwrap();
        assert_eq!(doc.total_iterations, Some(1));
        assert_eq!(doc.session_ended_explicitly, Some(true));
    }

    #[tokio::test]
    async fn pending_listing_injected_and_removed() {
        // Turn 1 launches a slow async task and gets its end_session
        // rejected; whatever listings the later turns see, none may survive
        // in the conversation once the run finishes.
        let turn1 = r#"<tool_call>
<tool_name>slow</tool_name>
<call_mode>asynchronous</call_mode>
<parameters>{}</parameters>
</tool_call>
<tool_call>
<tool_name>end_session</tool_name>
<parameters>{}</parameters>
</tool_call>"#;
        let turn2 = r#"<tool_call>
<tool_name>end_session</tool_name>
<parameters>{"final_message": "ok"}</parameters>
</tool_call>"#;
        let llm = MockLlmClient::new(vec![turn1, turn2]);
        let (h, def) = harness(llm, &["slow"]);
        let mut orch = make_orchestrator(&h, def);

        let result = orch.run("go", 50).await;
        assert_eq!(result, "ok");

        // The transient pending listing never remains in the conversation.
        assert!(
            orch.conversation()
                .iter()
                .all(|m| !m.content.contains("CURRENTLY PENDING TASKS")),
            "pending-task listing must be removed after the LLM call"
        );
    }
}
