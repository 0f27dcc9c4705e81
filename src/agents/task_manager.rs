//! Tracking of outstanding asynchronous tool tasks for one agent run.
//!
//! The [`TaskManager`] owns three pieces of state that together make the
//! end-of-session protocol safe:
//!
//! * `pending` — tasks whose work is still running,
//! * the completed queue — results pushed by task wrappers, popped only by
//!   the orchestrator,
//! * the `launched` / `processed` counters.
//!
//! A task that has finished running but whose result has not yet been
//! appended to the conversation is *still outstanding*; `outstanding()`
//! (launched − processed) is therefore the authoritative check before an
//! `end_session` is honored, not the size of `pending`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Metadata of a launched, not-yet-processed task.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingTask {
    pub task_id: String,
    pub tool_name: String,
    pub parameters: Value,
    pub launched_at: DateTime<Utc>,
}

/// Outcome of [`TaskManager::drain_remaining`].
#[derive(Debug, Default)]
pub struct DrainReport {
    /// Results consumed from the queue without ever reaching the
    /// conversation.
    pub drained_unprocessed: usize,
    /// Tasks cancelled before they could queue a result.
    pub cancelled_without_result: u64,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.drained_unprocessed == 0 && self.cancelled_without_result == 0
    }
}

#[derive(Default)]
struct TaskState {
    pending: HashMap<String, JoinHandle<()>>,
    /// Launch-ordered metadata; removed when the task's work finishes.
    pending_info: Vec<PendingTask>,
    launched: u64,
    processed: u64,
    next_task_number: u64,
}

/// Per-run tracker of asynchronous tool invocations.
pub struct TaskManager {
    state: Arc<Mutex<TaskState>>,
    completed_tx: mpsc::UnboundedSender<(String, String)>,
    /// Only the orchestrator pops; the async lock keeps `wait_for_result`
    /// callers serialized.
    completed_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(String, String)>>,
}

fn lock_state(state: &Mutex<TaskState>) -> std::sync::MutexGuard<'_, TaskState> {
    // Poisoning cannot leave the counters inconsistent: every critical
    // section is a plain field update.
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl TaskManager {
    pub fn new() -> Self {
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        Self {
            state: Arc::new(Mutex::new(TaskState::default())),
            completed_tx,
            completed_rx: tokio::sync::Mutex::new(completed_rx),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TaskState> {
        lock_state(&self.state)
    }

    /// Allocate the next task id for a tool: `"<tool>_<n>"`, n starting
    /// at 1.
    pub fn generate_task_id(&self, tool_name: &str) -> String {
        let mut state = self.lock();
        state.next_task_number += 1;
        format!("{tool_name}_{}", state.next_task_number)
    }

    /// Admit and spawn an asynchronous task.
    ///
    /// `work` must resolve to the task's textual result — failures are
    /// expected to already be folded into the text by the caller. Whatever
    /// happens, the task removes itself from `pending` when its work ends;
    /// its result then waits in the completed queue until processed.
    pub fn launch<F>(&self, task_id: String, tool_name: &str, parameters: Value, work: F)
    where
        F: Future<Output = String> + Send + 'static,
    {
        let info = PendingTask {
            task_id: task_id.clone(),
            tool_name: tool_name.to_string(),
            parameters,
            launched_at: Utc::now(),
        };

        // The lock is held across the spawn so the wrapper's self-removal
        // cannot run before the handle is registered.
        let mut state = self.lock();
        state.pending_info.push(info);
        state.launched += 1;

        let tx = self.completed_tx.clone();
        let state_ref = Arc::clone(&self.state);
        let wrapper_id = task_id.clone();
        let handle = tokio::spawn(async move {
            let result = work.await;
            let _ = tx.send((wrapper_id.clone(), result));
            // Whatever happened above, the task leaves `pending`; its
            // result stays outstanding until the orchestrator processes it.
            let mut state = lock_state(&state_ref);
            state.pending.remove(&wrapper_id);
            state.pending_info.retain(|t| t.task_id != wrapper_id);
        });
        state.pending.insert(task_id, handle);
    }

    /// Drop a finished task's handle and metadata. Called by the
    /// orchestrator after a result is dequeued; also safe to call for a
    /// task that already removed itself.
    pub fn remove_task(&self, task_id: &str) {
        let mut state = self.lock();
        state.pending.remove(task_id);
        state.pending_info.retain(|t| t.task_id != task_id);
    }

    /// Block until the next `(task_id, result)` arrives, or until `timeout`
    /// elapses.
    pub async fn wait_for_result(
        &self,
        timeout: Option<std::time::Duration>,
    ) -> Option<(String, String)> {
        let mut rx = self.completed_rx.lock().await;
        match timeout {
            Some(duration) => tokio::time::timeout(duration, rx.recv()).await.ok().flatten(),
            None => rx.recv().await,
        }
    }

    /// Non-blocking pop of an already-queued result.
    pub async fn try_next_result(&self) -> Option<(String, String)> {
        self.completed_rx.lock().await.try_recv().ok()
    }

    /// Count a dequeued result as processed. Call after the result has been
    /// appended to the conversation.
    pub fn mark_processed(&self) {
        self.lock().processed += 1;
    }

    /// Launched minus processed — the authoritative end-session check.
    pub fn outstanding(&self) -> u64 {
        let state = self.lock();
        state.launched - state.processed
    }

    pub fn launched(&self) -> u64 {
        self.lock().launched
    }

    pub fn processed(&self) -> u64 {
        self.lock().processed
    }

    /// Whether any task's work is still running.
    pub fn has_pending(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    /// Ids of still-running tasks, in launch order.
    pub fn pending_task_ids(&self) -> Vec<String> {
        self.lock()
            .pending_info
            .iter()
            .map(|t| t.task_id.clone())
            .collect()
    }

    /// Launch-ordered snapshot of still-running tasks.
    pub fn pending_snapshot(&self) -> Vec<PendingTask> {
        self.lock().pending_info.clone()
    }

    /// Finalization: settle every remaining task and account for every
    /// launched result.
    ///
    /// With `abort = false` the remaining handles are awaited to completion;
    /// with `abort = true` (cancellation) they are aborted first. Afterwards
    /// the queue is emptied, `processed` incremented per drained result, and
    /// any gap left by aborted tasks is closed so that
    /// `launched == processed` holds on return.
    pub async fn drain_remaining(&self, abort: bool) -> DrainReport {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut state = self.lock();
            state.pending_info.clear();
            state.pending.drain().collect()
        };

        for (task_id, handle) in handles {
            if abort {
                handle.abort();
            }
            if let Err(e) = handle.await {
                if e.is_panic() {
                    log::error!("task {task_id} panicked: {e}");
                }
            }
        }

        let mut report = DrainReport::default();
        {
            let mut rx = self.completed_rx.lock().await;
            while let Ok((task_id, result)) = rx.try_recv() {
                self.mark_processed();
                report.drained_unprocessed += 1;
                log::warn!(
                    "drained unprocessed result for task {task_id}: {}",
                    preview(&result, 100)
                );
            }
        }

        let mut state = self.lock();
        if state.launched > state.processed {
            report.cancelled_without_result = state.launched - state.processed;
            state.processed = state.launched;
        }
        report
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncate text for preview logging.
pub fn preview(text: &str, max_len: usize) -> String {
    if text.chars().count() > max_len {
        let cut: String = text.chars().take(max_len).collect();
        format!("{cut}...")
    } else {
        text.to_string()
    }
}
