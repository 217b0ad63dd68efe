//! Thin CLI driver (spec §1: explicitly a collaborator, not core). Parses
//! arguments, opens the project's Store, wires up the C2-C10 runtime stack,
//! and either runs a single command to completion or serves the control
//! plane. Mirrors the teacher's `main.rs` `Cli`/`Commands` shape, narrowed
//! to the run/pause/resume/rewind/status/list surface spec §6 names.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use orc::{OrcConfig, ProjectRegistry};
use orc_api::AppState;
use orc_common::phase::Phase;
use orc_common::task::{Task, TaskStatus, Weight};
use orc_runtime::bus::EventBus;
use orc_runtime::config_applier::PhaseClaudeConfig;
use orc_runtime::gate_evaluator::GateEvaluator;
use orc_runtime::phase_runner::PhaseRunner;
use orc_runtime::supervisor::Supervisor;
use orc_runtime::task_executor::{PhaseMaterials, TaskExecutor};
use orc_runtime::turn_executor::{TurnExecutor, TurnTimeouts};
use orc_runtime::worktree_manager::WorktreeManager;
use orc_store::Store;
use uuid::Uuid;

/// Exit codes per spec §6: 0 success; 1 invalid input; 2 task blocked;
/// 3 task orphaned; 4 conflict needing resolution.
mod exit {
    pub const SUCCESS: u8 = 0;
    pub const INVALID_INPUT: u8 = 1;
    pub const TASK_BLOCKED: u8 = 2;
    pub const TASK_ORPHANED: u8 = 3;
    pub const CONFLICT: u8 = 4;
}

#[derive(Parser)]
#[command(name = "orc")]
#[command(version, about = "Local multi-project orchestrator for gated, checkpointed AI coding task pipelines")]
struct Cli {
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a task and run it to completion or its next blocking gate.
    Run {
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long, value_enum, default_value = "medium")]
        weight: CliWeight,
        #[arg(long)]
        force: bool,
    },
    /// Resume an existing task from its last incomplete phase.
    Resume {
        task_id: Uuid,
        #[arg(long)]
        force: bool,
    },
    /// Request cooperative pause of a running task.
    Pause { task_id: Uuid },
    /// Reset a task's state back to a named phase, preserving earlier history.
    Rewind { task_id: Uuid, to_phase: String },
    /// Show one task's status and current phase.
    Status { task_id: Uuid },
    /// List all tasks known to this project.
    List,
    /// Serve the HTTP/WebSocket control plane (spec §6).
    Serve {
        #[arg(long, default_value = "127.0.0.1:4170")]
        addr: String,
    },
}

#[derive(Clone, clap::ValueEnum)]
enum CliWeight {
    Trivial,
    Small,
    Medium,
    Large,
    Greenfield,
}

impl From<CliWeight> for Weight {
    fn from(w: CliWeight) -> Self {
        match w {
            CliWeight::Trivial => Weight::Trivial,
            CliWeight::Small => Weight::Small,
            CliWeight::Medium => Weight::Medium,
            CliWeight::Large => Weight::Large,
            CliWeight::Greenfield => Weight::Greenfield,
        }
    }
}

/// Loads phase prompt templates and `.claude/` layering from the project's
/// `.orc/prompts/<phase_id>.md`, falling back to a generic instruction when
/// no override file exists. Intentionally minimal: prompt authoring is a
/// collaborator concern, not part of the core engine this workspace
/// specifies.
struct FileMaterials {
    project_root: PathBuf,
}

impl PhaseMaterials for FileMaterials {
    fn prompt_template(&self, phase: &Phase) -> String {
        let path = self.project_root.join(".orc").join("prompts").join(format!("{}.md", phase.id));
        std::fs::read_to_string(&path)
            .unwrap_or_else(|_| format!("Execute the {} phase ({}).", phase.id, phase.template_id))
    }

    fn claude_config(&self, _phase: &Phase) -> PhaseClaudeConfig {
        PhaseClaudeConfig::default()
    }

    fn skill_files(&self, _phase: &Phase) -> Vec<(String, String)> {
        Vec::new()
    }

    fn source_committed_claude_dir(&self) -> Option<PathBuf> {
        let dir = self.project_root.join(".claude");
        dir.exists().then_some(dir)
    }
}

/// Logs to stdout plus a rotating file under `.orc/logs/` (SPEC_FULL §0:
/// `tracing-appender` for the persisted-log file, same as the teacher's
/// root `main.rs` init). Returns the guard that must stay alive for the
/// file writer to flush.
fn init_tracing(project_dir: &std::path::Path, verbose: bool) -> tracing_appender::non_blocking::WorkerGuard {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "orc=debug,orc_runtime=debug,orc_store=debug" } else { "orc=info,orc_runtime=info" })
    });
    use tracing_subscriber::fmt::writer::MakeWriterExt;
    let file_appender = tracing_appender::rolling::daily(project_dir.join(".orc").join("logs"), "orc.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking.and(std::io::stdout))
        .init();
    guard
}

fn build_runtime(project_root: &std::path::Path, config: &OrcConfig) -> Result<(Arc<Store>, EventBus, Arc<PhaseRunner>)> {
    let store = Arc::new(Store::open(&OrcConfig::store_path(project_root))?);
    let bus = EventBus::new(store.clone());

    let timeouts = TurnTimeouts {
        turn_max: std::time::Duration::from_secs(config.timeouts.turn_max_secs),
        idle_timeout: std::time::Duration::from_secs(config.timeouts.idle_timeout_secs),
        heartbeat_interval: std::time::Duration::from_secs(config.timeouts.heartbeat_interval_secs),
    };
    let turn_executor = TurnExecutor::new(config.claude_bin.as_str(), config.model.as_str(), timeouts);
    let gate_evaluator = Arc::new(GateEvaluator::new(turn_executor.clone(), store.clone(), bus.clone()));
    let worktree_manager = Arc::new(WorktreeManager::new(
        project_root,
        config.completion.sync.target_branch.as_str(),
    ));
    let phase_runner = Arc::new(
        PhaseRunner::new(store.clone(), bus.clone(), turn_executor, gate_evaluator, worktree_manager)
            .with_phase_max(std::time::Duration::from_secs(config.timeouts.phase_max_secs)),
    );
    Ok((store, bus, phase_runner))
}

async fn resolve_project_dir(cli: &Cli) -> Result<PathBuf> {
    let dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("failed to read current directory")?,
    };
    OrcConfig::ensure_directories(&dir)?;
    let mut registry = ProjectRegistry::load().unwrap_or_default();
    registry.remember(&dir).ok();
    Ok(dir)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    let project_dir = resolve_project_dir(&cli).await?;
    let _tracing_guard = init_tracing(&project_dir, cli.verbose);

    let config = OrcConfig::load(&project_dir)?;
    let (store, bus, phase_runner) = build_runtime(&project_dir, &config)?;
    let supervisor = Arc::new(Supervisor::new(store.clone(), config.worktree.max_parallel));
    supervisor.sweep_orphans_at_startup()?;

    let code = match cli.command {
        Commands::Run { title, description, weight, force } => {
            cmd_run(&store, &bus, &phase_runner, &supervisor, &project_dir, title, description, weight.into(), force).await?
        }
        Commands::Resume { task_id, force } => cmd_resume(&store, &bus, &phase_runner, &supervisor, &project_dir, task_id, force).await?,
        Commands::Pause { task_id } => cmd_pause(&store, task_id)?,
        Commands::Rewind { task_id, to_phase } => cmd_rewind(&store, &bus, &phase_runner, task_id, &to_phase)?,
        Commands::Status { task_id } => cmd_status(&store, task_id)?,
        Commands::List => cmd_list(&store)?,
        Commands::Serve { addr } => cmd_serve(store, bus, supervisor, phase_runner, project_dir, config, &addr).await?,
    };

    Ok(ExitCode::from(code))
}

#[allow(clippy::too_many_arguments)]
async fn cmd_run(
    store: &Arc<Store>,
    bus: &EventBus,
    phase_runner: &Arc<PhaseRunner>,
    supervisor: &Arc<Supervisor>,
    project_dir: &std::path::Path,
    title: String,
    description: Option<String>,
    weight: Weight,
    force: bool,
) -> Result<u8> {
    let task = Task::new(title, description.unwrap_or_default(), weight);
    let task = store.create_task(&task)?;
    run_task(store, bus, phase_runner, supervisor, project_dir, task, force).await
}

async fn cmd_resume(
    store: &Arc<Store>,
    bus: &EventBus,
    phase_runner: &Arc<PhaseRunner>,
    supervisor: &Arc<Supervisor>,
    project_dir: &std::path::Path,
    task_id: Uuid,
    force: bool,
) -> Result<u8> {
    let Some(task) = store.get_task(task_id)? else {
        eprintln!("orc: unknown task {task_id}");
        return Ok(exit::INVALID_INPUT);
    };
    run_task(store, bus, phase_runner, supervisor, project_dir, task, force).await
}

async fn run_task(
    store: &Arc<Store>,
    bus: &EventBus,
    phase_runner: &Arc<PhaseRunner>,
    supervisor: &Arc<Supervisor>,
    project_dir: &std::path::Path,
    mut task: Task,
    force: bool,
) -> Result<u8> {
    if let Err(e) = supervisor.check_blockers(&task, force) {
        eprintln!("orc: {e}");
        return Ok(exit::TASK_BLOCKED);
    }
    if supervisor.ensure_not_orphaned(task.id)? {
        eprintln!("orc: task {} was orphaned; interrupted and ready to resume", task.id);
        return Ok(exit::TASK_ORPHANED);
    }

    if task.worktree_path.is_none() {
        let initiative_prefix = task.initiative_id.map(|i| i.to_string());
        let created = phase_runner
            .worktree_manager()
            .create(task.id, initiative_prefix.as_deref(), "main")?;
        task.worktree_path = Some(created.path.to_string_lossy().into_owned());
        task.branch = Some(created.branch);
        task = store.update_task(&task)?;
    }
    let worktree_path = PathBuf::from(task.worktree_path.clone().expect("just created or already present"));

    let workflow = orc_api::workflow::default_workflow_for(task.weight);
    let executor = TaskExecutor::new(store.clone(), bus.clone(), phase_runner.clone());
    let materials = FileMaterials { project_root: project_dir.to_path_buf() };

    let permit = supervisor.admit(task.id, task.priority).await;
    let result = executor.run(task, &workflow, &materials, &worktree_path).await;
    drop(permit);

    let (task, finalize_handle) = result?;
    if let Some(handle) = finalize_handle {
        let _ = handle.await;
    }
    let task = store.get_task(task.id)?.unwrap_or(task);
    println!("task {} -> {:?} (phase: {:?})", task.id, task.status, task.current_phase);
    match task.status {
        TaskStatus::Blocked => Ok(exit::TASK_BLOCKED),
        TaskStatus::Failed | TaskStatus::Interrupted => Ok(exit::CONFLICT),
        _ => Ok(exit::SUCCESS),
    }
}

fn cmd_pause(store: &Arc<Store>, task_id: Uuid) -> Result<u8> {
    // Pause is cooperative and scoped to the process currently running the
    // task (spec §4.8); a CLI invocation in a fresh process has no handle
    // to that executor's cancellation token, so it can only record intent
    // via the task's own fields for the owning process to observe.
    let Some(mut task) = store.get_task(task_id)? else {
        eprintln!("orc: unknown task {task_id}");
        return Ok(exit::INVALID_INPUT);
    };
    if task.status != TaskStatus::Running {
        println!("task {task_id} is not running (status: {:?})", task.status);
        return Ok(exit::SUCCESS);
    }
    task.status = TaskStatus::Paused;
    store.update_task(&task)?;
    println!("task {task_id} marked paused; takes effect at the next phase boundary");
    Ok(exit::SUCCESS)
}

fn cmd_rewind(store: &Arc<Store>, bus: &EventBus, phase_runner: &Arc<PhaseRunner>, task_id: Uuid, to_phase: &str) -> Result<u8> {
    let Some(task) = store.get_task(task_id)? else {
        eprintln!("orc: unknown task {task_id}");
        return Ok(exit::INVALID_INPUT);
    };
    if task.status == TaskStatus::Running {
        eprintln!("orc: cannot rewind a running task; pause it first");
        return Ok(exit::CONFLICT);
    }
    let ordered = orc_api::workflow::default_workflow_for(task.weight).topological_order()?;
    let executor = TaskExecutor::new(store.clone(), bus.clone(), phase_runner.clone());
    executor.rewind(task_id, to_phase, &ordered)?;
    println!("task {task_id} rewound to phase {to_phase}");
    Ok(exit::SUCCESS)
}

fn cmd_status(store: &Arc<Store>, task_id: Uuid) -> Result<u8> {
    let Some(task) = store.get_task(task_id)? else {
        eprintln!("orc: unknown task {task_id}");
        return Ok(exit::INVALID_INPUT);
    };
    let state = store.get_task_state(task_id)?;
    println!("Task {}", task.id);
    println!("  title:         {}", task.title);
    println!("  weight:        {:?}", task.weight);
    println!("  status:        {:?}", task.status);
    println!("  current_phase: {:?}", task.current_phase);
    println!("  error:         {}", if state.error.is_empty() { "(none)" } else { &state.error });
    Ok(exit::SUCCESS)
}

fn cmd_list(store: &Arc<Store>) -> Result<u8> {
    let tasks = store.list_tasks()?;
    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(exit::SUCCESS);
    }
    println!("{:<38} {:<10} {:<12} {}", "ID", "WEIGHT", "STATUS", "TITLE");
    for task in tasks {
        println!("{:<38} {:<10?} {:<12?} {}", task.id, task.weight, task.status, task.title);
    }
    Ok(exit::SUCCESS)
}

async fn cmd_serve(
    store: Arc<Store>,
    bus: EventBus,
    supervisor: Arc<Supervisor>,
    phase_runner: Arc<PhaseRunner>,
    project_dir: PathBuf,
    config: OrcConfig,
    addr: &str,
) -> Result<u8> {
    let state = Arc::new(AppState::new(
        store,
        bus,
        supervisor,
        phase_runner,
        OrcConfig::orc_dir(&project_dir).join("worktrees"),
        config.completion.sync.target_branch.clone(),
    ));
    let router = orc_api::build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "orc control plane listening");
    axum::serve(listener, router).await.context("serving control plane")?;
    Ok(exit::SUCCESS)
}
