//! Process-wide registry of active agent runs.
//!
//! Every live run registers its [`CancellationToken`] here; children derive
//! their token from the parent's, so cancelling a root's token takes its
//! whole subtree down without touching siblings. Stopping also marks the
//! affected rows completed in the store so the execution tree reflects the
//! administrative stop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use crate::store::{ExecutionStore, Result};

pub struct RunManager {
    store: Arc<ExecutionStore>,
    handles: Mutex<HashMap<String, CancellationToken>>,
}

impl RunManager {
    pub fn new(store: Arc<ExecutionStore>) -> Self {
        Self {
            store,
            handles: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.handles.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Track a run's cancellation handle for the duration of its execution.
    pub fn register(&self, run_id: &str, token: CancellationToken) {
        self.lock().insert(run_id.to_string(), token);
    }

    /// Remove a finished run. Safe to call for unknown ids.
    pub fn deregister(&self, run_id: &str) {
        self.lock().remove(run_id);
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        self.lock().contains_key(run_id)
    }

    /// Cancel every registered run (optionally only those in a project) and
    /// mark every open run row in scope completed. Returns the number of
    /// rows closed. Idempotent: a second call finds nothing open.
    pub fn stop_all(&self, project_dir: Option<&str>) -> Result<usize> {
        let targets: Vec<(String, CancellationToken)> = {
            let handles = self.lock();
            handles
                .iter()
                .map(|(id, token)| (id.clone(), token.clone()))
                .collect()
        };

        for (run_id, token) in targets {
            let in_scope = match project_dir {
                Some(project) => self
                    .store
                    .run(&run_id)?
                    .map(|run| run.project_dir == project)
                    .unwrap_or(false),
                None => true,
            };
            if in_scope {
                token.cancel();
            }
        }

        self.store.mark_open_runs_completed(project_dir)
    }

    /// Cancel a run and all of its transitive descendants, marking their
    /// rows completed. Returns the affected run ids (root first).
    pub fn stop_tree(&self, root_run_id: &str) -> Result<Vec<String>> {
        let run_ids = self.store.descendant_run_ids(root_run_id)?;

        {
            let handles = self.lock();
            for run_id in &run_ids {
                if let Some(token) = handles.get(run_id) {
                    token.cancel();
                }
            }
        }

        self.store.mark_runs_completed(&run_ids)?;
        Ok(run_ids)
    }
}
