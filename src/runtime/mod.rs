//! Application wiring.
//!
//! [`AppContext`] bundles the shared capabilities — store, run manager,
//! event bus, LLM client, project layout, per-project loader cache — and is
//! threaded explicitly into everything that needs them: the CLI, the
//! gateway, and the schedule runner. There are no process-wide singletons.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::agents::config::AgentRegistry;
use crate::agents::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::agents::run_manager::RunManager;
use crate::agents::CallMode;
use crate::ai::client::LLMClient;
use crate::event_bus::{EventBus, TokioBroadcastBus};
use crate::projects::ProjectManager;
use crate::prompts::PromptLoader;
use crate::store::{ExecutionStore, StoreError};
use crate::tools::ToolRegistry;

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("agent '{0}' not found")]
    AgentNotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// Paths and limits for one runtime instance.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Root of the per-project directories.
    pub user_dir: PathBuf,
    /// Per-run JSON log directory.
    pub logs_dir: PathBuf,
    /// Model identifier passed to the LLM client.
    pub model: String,
    /// Permits in the blocking tool worker pool.
    pub tool_pool_size: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("swarmhost.db"),
            user_dir: PathBuf::from("user"),
            logs_dir: PathBuf::from("logs"),
            model: "gpt-4o".to_string(),
            tool_pool_size: 8,
        }
    }
}

impl AppConfig {
    /// Resolve the instance paths under the platform data directory
    /// (e.g. `~/.local/share/swarmhost` on Linux), falling back to the
    /// current directory when the platform reports none.
    pub fn resolve_default() -> Self {
        let base = dirs::data_dir()
            .map(|dir| dir.join("swarmhost"))
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: base.join("swarmhost.db"),
            user_dir: base.join("user"),
            logs_dir: base.join("logs"),
            ..Self::default()
        }
    }
}

// ─── Per-project loaders ─────────────────────────────────────────────────────

/// Registries and prompts of one project, loaded once and cached.
#[derive(Clone)]
pub struct ProjectLoaders {
    pub tools: Arc<ToolRegistry>,
    pub agents: Arc<AgentRegistry>,
    pub prompts: Arc<PromptLoader>,
}

/// Handle to a spawned run: the id is available immediately, the join
/// handle resolves to the final response.
#[derive(Debug)]
pub struct RunHandle {
    pub run_id: String,
    pub join: tokio::task::JoinHandle<String>,
}

// ─── AppContext ──────────────────────────────────────────────────────────────

pub struct AppContext {
    pub store: Arc<ExecutionStore>,
    pub run_manager: Arc<RunManager>,
    pub bus: Arc<dyn EventBus>,
    pub projects: ProjectManager,
    pub config: AppConfig,
    llm: Arc<dyn LLMClient>,
    tool_pool: Arc<Semaphore>,
    loaders: Mutex<HashMap<String, ProjectLoaders>>,
}

impl AppContext {
    /// Open the store, reclaim orphaned runs from a previous process, and
    /// prepare the default project layout.
    pub fn new(config: AppConfig, llm: Arc<dyn LLMClient>) -> Result<Arc<Self>, StoreError> {
        if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::InvalidData(format!("cannot create data dir: {e}")))?;
        }
        let store = Arc::new(ExecutionStore::open(&config.db_path)?);

        // Runs left open by a crash are administratively closed; nothing is
        // resumed.
        let reclaimed = store.mark_open_runs_completed(None)?;
        if reclaimed > 0 {
            log::warn!("reclaimed {reclaimed} orphaned run(s) from a previous process");
        }

        let projects = ProjectManager::new(&config.user_dir, store.clone());
        projects
            .ensure_default_layout()
            .map_err(|e| StoreError::InvalidData(format!("cannot create user dir: {e}")))?;

        let run_manager = Arc::new(RunManager::new(store.clone()));
        let tool_pool = Arc::new(Semaphore::new(config.tool_pool_size.max(1)));

        Ok(Arc::new(Self {
            store,
            run_manager,
            bus: Arc::new(TokioBroadcastBus::new()),
            projects,
            llm,
            tool_pool,
            loaders: Mutex::new(HashMap::new()),
            config,
        }))
    }

    /// Loaders for a project, built on first use and cached until
    /// invalidated.
    pub fn loaders(&self, project_dir: &str) -> ProjectLoaders {
        let mut cache = match self.loaders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(loaders) = cache.get(project_dir) {
            return loaders.clone();
        }

        let workspace = self.projects.project_base_dir(project_dir).join("workspace");
        let loaders = ProjectLoaders {
            tools: Arc::new(ToolRegistry::builtin(workspace)),
            agents: Arc::new(AgentRegistry::load(self.projects.agents_dir(project_dir))),
            prompts: Arc::new(PromptLoader::from_dir(self.projects.prompts_dir(project_dir))),
        };
        cache.insert(project_dir.to_string(), loaders.clone());
        loaders
    }

    /// Drop a project's cached loaders (after agent or prompt edits).
    pub fn invalidate_loaders(&self, project_dir: &str) {
        if let Ok(mut cache) = self.loaders.lock() {
            cache.remove(project_dir);
        }
    }

    fn orchestrator_deps(&self, project_dir: &str, loaders: &ProjectLoaders) -> OrchestratorDeps {
        OrchestratorDeps {
            store: self.store.clone(),
            llm: self.llm.clone(),
            tools: loaders.tools.clone(),
            agents: loaders.agents.clone(),
            prompts: loaders.prompts.clone(),
            bus: Some(self.bus.clone()),
            run_registry: Some(self.run_manager.clone()),
            tool_pool: self.tool_pool.clone(),
            logs_dir: self.config.logs_dir.clone(),
            model: self.config.model.clone(),
            project_dir: project_dir.to_string(),
        }
    }

    /// Create and launch a root agent run. Returns as soon as the run row
    /// exists; the run itself executes on a spawned task.
    pub fn spawn_agent_run(
        &self,
        project_dir: &str,
        agent_name: &str,
        message: &str,
        max_iterations: u32,
    ) -> Result<RunHandle, SpawnError> {
        let loaders = self.loaders(project_dir);
        let definition = loaders
            .agents
            .get(agent_name)
            .cloned()
            .ok_or_else(|| SpawnError::AgentNotFound(agent_name.to_string()))?;

        let deps = self.orchestrator_deps(project_dir, &loaders);
        let mut orchestrator = Orchestrator::new(
            deps,
            definition,
            None,
            CallMode::Synchronous,
            CancellationToken::new(),
        )?;
        let run_id = orchestrator.run_id().to_string();

        let message = message.to_string();
        let join = tokio::spawn(async move {
            orchestrator
                .run(&message, max_iterations)
                .await
        });

        Ok(RunHandle { run_id, join })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::client::{Result as LlmResult, TokenStream};
    use crate::ai::types::CompletionRequest;
    use async_trait::async_trait;

    struct CannedLlm(String);

    #[async_trait]
    impl LLMClient for CannedLlm {
        async fn stream_completion(&self, _request: CompletionRequest) -> LlmResult<TokenStream> {
            let content = self.0.clone();
            Ok(Box::pin(futures::stream::iter(vec![Ok(content)])) as TokenStream)
        }

        fn client_name(&self) -> &str {
            "canned"
        }
    }

    fn make_context(tmp: &tempfile::TempDir, response: &str) -> Arc<AppContext> {
        let config = AppConfig {
            db_path: tmp.path().join("test.db"),
            user_dir: tmp.path().join("user"),
            logs_dir: tmp.path().join("logs"),
            model: "test-model".to_string(),
            tool_pool_size: 4,
        };
        AppContext::new(config, Arc::new(CannedLlm(response.to_string()))).unwrap()
    }

    fn write_agent(ctx: &AppContext, project: &str, name: &str, tools: &str) {
        let dir = ctx.projects.agents_dir(project).join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("description.txt"), "test").unwrap();
        std::fs::write(dir.join("system_prompt.txt"), "You are a test.").unwrap();
        std::fs::write(dir.join("tools.txt"), tools).unwrap();
    }

    const END: &str = r#"<tool_call>
<tool_name>end_session</tool_name>
<parameters>{"final_message": "done"}</parameters>
</tool_call>"#;

    #[tokio::test]
    async fn spawn_runs_agent_to_completion() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = make_context(&tmp, END);
        write_agent(&ctx, "default", "worker", "calculator");

        let handle = ctx
            .spawn_agent_run("default", "worker", "go", 10)
            .unwrap();
        let result = handle.join.await.unwrap();
        assert_eq!(result, "done");

        let run = ctx.store.run(&handle.run_id).unwrap().unwrap();
        assert!(!run.is_running());
        // The run deregistered itself on completion.
        assert!(!ctx.run_manager.is_active(&handle.run_id));
    }

    #[tokio::test]
    async fn spawn_unknown_agent_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = make_context(&tmp, END);
        let err = ctx.spawn_agent_run("default", "ghost", "hi", 10).unwrap_err();
        assert!(matches!(err, SpawnError::AgentNotFound(_)));
    }

    #[tokio::test]
    async fn loader_cache_and_invalidation() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = make_context(&tmp, END);
        write_agent(&ctx, "default", "first", "");

        let loaders = ctx.loaders("default");
        assert!(loaders.agents.has_agent("first"));

        // A new agent is invisible until the cache is invalidated.
        write_agent(&ctx, "default", "second", "");
        assert!(!ctx.loaders("default").agents.has_agent("second"));
        ctx.invalidate_loaders("default");
        assert!(ctx.loaders("default").agents.has_agent("second"));
    }

    #[test]
    fn resolved_defaults_share_one_instance_directory() {
        let config = AppConfig::resolve_default();
        assert_eq!(config.db_path.file_name().unwrap(), "swarmhost.db");
        assert!(config.user_dir.ends_with("user"));
        assert!(config.logs_dir.ends_with("logs"));
        // All three live under the same base directory.
        assert_eq!(config.db_path.parent(), config.user_dir.parent());
        assert_eq!(config.user_dir.parent(), config.logs_dir.parent());
    }

    #[tokio::test]
    async fn restart_reclaims_orphaned_runs() {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("test.db");
        {
            let store = ExecutionStore::open(&db_path).unwrap();
            store
                .create_run("left_open", None, "root", CallMode::Synchronous, "default")
                .unwrap();
        }

        let config = AppConfig {
            db_path,
            user_dir: tmp.path().join("user"),
            logs_dir: tmp.path().join("logs"),
            model: "m".to_string(),
            tool_pool_size: 1,
        };
        let ctx = AppContext::new(config, Arc::new(CannedLlm(END.to_string()))).unwrap();

        let runs = ctx.store.runs(None).unwrap();
        assert!(runs.iter().all(|r| !r.is_running()), "orphans closed on boot");
    }
}
