//! swarmhost CLI — headless interface to the agent runtime.
//!
//! Subcommands cover one-shot agent runs, the gateway server (with the
//! schedule runner), and inspection of agents, executions, projects, and
//! schedules.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use swarmhost::agents::orchestrator::DEFAULT_MAX_ITERATIONS;
use swarmhost::ai::{OpenAiClient, OpenAiConfig};
use swarmhost::prelude::*;
use swarmhost::runtime::AppConfig;

// ---------------------------------------------------------------------------
// Top-level CLI struct
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "swarmhost",
    about = "Multi-agent orchestration runtime",
    version,
    long_about = "Headless interface to the swarmhost agent runtime.\n\
                  Agents, tools, and prompts are loaded from the user/ directory."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// SQLite database file (default: <data-dir>/swarmhost/swarmhost.db).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Root of the per-project directories (default: <data-dir>/swarmhost/user).
    #[arg(long, global = true)]
    user_dir: Option<PathBuf>,

    /// Per-run JSON log directory (default: <data-dir>/swarmhost/logs).
    #[arg(long, global = true)]
    logs_dir: Option<PathBuf>,

    /// Model identifier sent to the LLM endpoint.
    #[arg(long, global = true, default_value = "gpt-4o")]
    model: String,
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run an agent once and print its final response.
    Run(RunArgs),
    /// Start the HTTP/WebSocket gateway and the schedule runner.
    #[cfg(feature = "gateway")]
    Serve(ServeArgs),
    /// List the agents of a project.
    Agents(ProjectArg),
    /// List agent executions.
    Executions(ProjectArg),
    /// List projects.
    Projects,
    /// Manage schedules (list, create).
    Schedule(ScheduleArgs),
    /// Stop runs: one execution tree, or everything.
    Stop(StopArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Agent name.
    agent: String,
    /// The user message to hand to the agent.
    message: String,
    /// Project directory.
    #[arg(long, default_value = "default")]
    project: String,
    /// Iteration cap for the run.
    #[arg(long, default_value_t = DEFAULT_MAX_ITERATIONS)]
    max_iterations: u32,
}

#[cfg(feature = "gateway")]
#[derive(Parser, Debug)]
struct ServeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 8900)]
    port: u16,
}

#[derive(Parser, Debug)]
struct ProjectArg {
    /// Project directory.
    #[arg(long, default_value = "default")]
    project: String,
}

#[derive(Parser, Debug)]
struct ScheduleArgs {
    #[command(subcommand)]
    action: ScheduleAction,
}

#[derive(Subcommand, Debug)]
enum ScheduleAction {
    /// List schedules.
    List {
        #[arg(long)]
        project: Option<String>,
    },
    /// Create a schedule.
    Create {
        name: String,
        agent: String,
        /// Message handed to the agent on every fire.
        #[arg(long, default_value = "")]
        message: String,
        /// Interval unit: minutes, hours, or weeks.
        #[arg(long, default_value = "hours")]
        kind: String,
        /// Interval value (>= 1).
        #[arg(long, default_value_t = 1)]
        interval: i64,
        #[arg(long, default_value = "default")]
        project: String,
    },
    /// Delete a schedule by id.
    Delete { schedule_id: String },
}

#[derive(Parser, Debug)]
struct StopArgs {
    /// Root run id of the execution tree to stop. Omit to stop everything.
    run_id: Option<String>,
    /// Restrict a stop-all to one project.
    #[arg(long)]
    project: Option<String>,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_log::LogTracer::init();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    init_logging();

    let cli = Cli::parse();
    // Flags override the per-platform instance directory.
    let defaults = AppConfig::resolve_default();
    let config = AppConfig {
        db_path: cli.db.clone().unwrap_or(defaults.db_path),
        user_dir: cli.user_dir.clone().unwrap_or(defaults.user_dir),
        logs_dir: cli.logs_dir.clone().unwrap_or(defaults.logs_dir),
        model: cli.model.clone(),
        tool_pool_size: defaults.tool_pool_size,
    };

    if let Err(e) = dispatch(cli, config).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn dispatch(cli: Cli, config: AppConfig) -> Result<(), String> {
    let llm: Arc<dyn LLMClient> = Arc::new(OpenAiClient::new(OpenAiConfig::from_env())?);
    let ctx = AppContext::new(config, llm).map_err(|e| e.to_string())?;

    match cli.command {
        Commands::Run(args) => {
            let handle = ctx
                .spawn_agent_run(&args.project, &args.agent, &args.message, args.max_iterations)
                .map_err(|e| e.to_string())?;
            println!("run {} started", handle.run_id);
            let response = handle.join.await.map_err(|e| e.to_string())?;
            println!("{response}");
        }

        #[cfg(feature = "gateway")]
        Commands::Serve(args) => {
            let runner = ScheduleRunner::new(ctx.clone());
            runner.start();
            swarmhost::gateway::serve(ctx, &args.host, args.port).await?;
            runner.stop();
        }

        Commands::Agents(args) => {
            let loaders = ctx.loaders(&args.project);
            for definition in loaders.agents.definitions() {
                println!(
                    "{:<24} {}  [{}]",
                    definition.name,
                    definition.description,
                    definition.allowed_callables.join(", ")
                );
            }
        }

        Commands::Executions(args) => {
            for run in ctx.store.runs(Some(&args.project)).map_err(|e| e.to_string())? {
                let status = if run.is_running() { "running" } else { "completed" };
                println!(
                    "{}  {:<20} {:<10} {:<14} parent={}",
                    run.run_id,
                    run.agent_name,
                    status,
                    run.current_state.as_str(),
                    run.parent_agent_name
                );
            }
        }

        Commands::Projects => {
            for project in ctx.projects.list_projects().map_err(|e| e.to_string())? {
                println!("{:<24} dir={}", project.project_name, project.project_dir);
            }
        }

        Commands::Schedule(args) => match args.action {
            ScheduleAction::List { project } => {
                let schedules = ctx
                    .store
                    .schedules(project.as_deref())
                    .map_err(|e| e.to_string())?;
                for schedule in schedules {
                    println!(
                        "{}  {:<20} agent={:<16} every {} {}  next={}  enabled={}",
                        schedule.schedule_id,
                        schedule.name,
                        schedule.agent_name,
                        schedule.interval,
                        schedule.kind.as_str(),
                        schedule.next_run_at.to_rfc3339(),
                        schedule.enabled
                    );
                }
            }
            ScheduleAction::Create {
                name,
                agent,
                message,
                kind,
                interval,
                project,
            } => {
                let kind = IntervalKind::parse(&kind)
                    .ok_or_else(|| format!("invalid kind '{kind}' (minutes|hours|weeks)"))?;
                let record = ctx
                    .store
                    .create_schedule(&name, &project, &agent, &message, kind, interval, None, true)
                    .map_err(|e| e.to_string())?;
                println!(
                    "schedule {} created, first run at {}",
                    record.schedule_id,
                    record.next_run_at.to_rfc3339()
                );
            }
            ScheduleAction::Delete { schedule_id } => {
                if ctx.store.delete_schedule(&schedule_id).map_err(|e| e.to_string())? {
                    println!("schedule {schedule_id} deleted");
                } else {
                    return Err(format!("schedule '{schedule_id}' not found"));
                }
            }
        },

        Commands::Stop(args) => match args.run_id {
            Some(run_id) => {
                let stopped = ctx.run_manager.stop_tree(&run_id).map_err(|e| e.to_string())?;
                println!("stopped {} run(s): {}", stopped.len(), stopped.join(", "));
            }
            None => {
                let stopped = ctx
                    .run_manager
                    .stop_all(args.project.as_deref())
                    .map_err(|e| e.to_string())?;
                println!("stopped {stopped} run(s)");
            }
        },
    }

    Ok(())
}
