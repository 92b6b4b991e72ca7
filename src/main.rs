use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use swarm::config::{Config, Workspace};
use swarm::coordination::{KillSwitch, LockManager, Worker, WorkerOptions};
use swarm::core::{Intensity, Task, TaskDAG};
use swarm::orchestration::{
    build_executor, execution_plan, load_tasks, SchedulerEvent, Spawner, StartOutcome,
    WaveScheduler, DEFAULT_MAX_CONCURRENT,
};
use swarm::status::StatusReport;
use swarm::store::{ExecutionLog, TaskStore};
use swarm::Result;

/// Swarm - file-coordinated multi-worker task harness
#[derive(Parser, Debug)]
#[command(name = "swarm")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    SWARM_DEBUG=1     Enable debug logging (alternative to --debug)\n    SWARM_LOG=...     Log filter, e.g. \"swarm::coordination=debug\"\n    SWARM_API_URL=... Override the executor API endpoint")]
pub struct Cli {
    /// Workspace directory holding queue.json, execution_log.json and task_locks/
    #[arg(short = 'w', long, global = true)]
    pub workspace: Option<String>,

    /// Enable debug logging
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Create the workspace layout and a default swarm.toml
    Init,

    /// Add a task to the queue
    Add {
        /// Unique task id
        id: String,

        /// Task type
        #[arg(long = "type", default_value = swarm::core::task::DEFAULT_TASK_TYPE)]
        kind: String,

        /// Instruction handed to the executor
        #[arg(long)]
        description: Option<String>,

        /// Minimum budget in USD
        #[arg(long = "min")]
        min_budget: Option<f64>,

        /// Maximum budget in USD
        #[arg(long = "max")]
        max_budget: Option<f64>,

        #[arg(long, value_enum)]
        intensity: Option<Intensity>,

        /// Task that must complete first (repeatable)
        #[arg(long = "depends-on")]
        depends_on: Vec<String>,
    },

    /// Clear the queue, execution log, locks and stop files
    Clear,

    /// Show execution status
    Status,

    /// Launch worker processes and wait for them to finish
    Start {
        /// Number of workers
        #[arg(default_value_t = 4)]
        workers: usize,

        /// Show what would run without spawning anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Run a single worker loop in this process
    Worker {
        /// Stop after this many scans, idle ones included
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Stop after this many consecutive idle scans
        #[arg(long)]
        max_idle: Option<u32>,
    },

    /// Run a task file through the in-process wave scheduler
    Schedule {
        /// JSON file with a task list or a queue document
        file: PathBuf,

        #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT)]
        max_concurrent: usize,

        /// Infer extra dependencies from phrases like "depends on X"
        #[arg(long)]
        auto_deps: bool,

        /// Print the execution order without running anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Stop all workers after their current task
    Halt {
        reason: Option<String>,
    },

    /// Pause all workers until `resume`
    Pause {
        reason: Option<String>,
    },

    /// Remove the PAUSE file
    Resume,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let workspace = Workspace::from_arg(cli.workspace.as_deref())?;
    let _log_guard = swarm::log::init_with_debug(&workspace, cli.debug)?;
    debug!(
        workspace = %workspace.root().display(),
        log = %workspace.log_path().display(),
        "swarm starting"
    );

    let config = Config::load(&workspace)?;
    config.validate()?;

    match cli.command {
        Command::Init => run_init(&workspace, &config),
        Command::Add {
            id,
            kind,
            description,
            min_budget,
            max_budget,
            intensity,
            depends_on,
        } => {
            let mut task = Task::new(&id).with_dependencies(depends_on);
            task.kind = kind;
            task.description = description;
            task.min_budget = min_budget;
            task.max_budget = max_budget;
            task.intensity = intensity;
            run_add(&workspace, &config, task)
        }
        Command::Clear => run_clear(&workspace, &config),
        Command::Status => {
            println!("{}", StatusReport::gather(&workspace, &config)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Start { workers, dry_run } => run_start(workspace, config, workers, dry_run).await,
        Command::Worker {
            max_iterations,
            max_idle,
        } => run_worker(&workspace, &config, max_iterations, max_idle).await,
        Command::Schedule {
            file,
            max_concurrent,
            auto_deps,
            dry_run,
        } => {
            run_schedule(&workspace, &config, &file, max_concurrent, auto_deps, dry_run).await
        }
        Command::Halt { reason } => {
            let reason = reason.unwrap_or_else(|| "halted from CLI".to_string());
            KillSwitch::new(&workspace).halt(&reason)?;
            println!("HALT written: workers stop after their current task");
            Ok(ExitCode::SUCCESS)
        }
        Command::Pause { reason } => {
            let reason = reason.unwrap_or_else(|| "paused from CLI".to_string());
            KillSwitch::new(&workspace).pause(&reason)?;
            println!("PAUSE written: workers idle until 'swarm resume'");
            Ok(ExitCode::SUCCESS)
        }
        Command::Resume => {
            KillSwitch::new(&workspace).resume()?;
            println!("Resumed");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn run_init(workspace: &Workspace, config: &Config) -> Result<ExitCode> {
    workspace.ensure_dirs()?;
    if workspace.config_path().exists() {
        println!("Config already present: {}", workspace.config_path().display());
    } else {
        config.save(workspace)?;
        println!("Wrote {}", workspace.config_path().display());
    }
    ExecutionLog::new(workspace.execution_log_path()).initialize()?;
    println!("Workspace ready: {}", workspace.root().display());
    Ok(ExitCode::SUCCESS)
}

fn run_add(workspace: &Workspace, config: &Config, task: Task) -> Result<ExitCode> {
    workspace.ensure_dirs()?;
    let id = task.id.clone();
    TaskStore::new(workspace.queue_path()).add_task(task, &config.api_endpoint)?;
    println!("Added task: {}", id);
    Ok(ExitCode::SUCCESS)
}

fn run_clear(workspace: &Workspace, config: &Config) -> Result<ExitCode> {
    workspace.ensure_dirs()?;
    TaskStore::new(workspace.queue_path()).clear(&config.api_endpoint)?;
    ExecutionLog::new(workspace.execution_log_path()).reset()?;
    let removed = LockManager::new(workspace.locks_dir(), config.lock_timeout()).clear_all()?;
    let kill_switch = KillSwitch::new(workspace);
    kill_switch.clear_halt()?;
    kill_switch.resume()?;
    info!(locks_removed = removed, "workspace cleared");
    println!("Cleared queue, execution log and {} lock(s)", removed);
    Ok(ExitCode::SUCCESS)
}

async fn run_start(
    workspace: Workspace,
    config: Config,
    workers: usize,
    dry_run: bool,
) -> Result<ExitCode> {
    let spawner = Spawner::new(workspace, config)?;
    match spawner.start(workers, dry_run).await? {
        StartOutcome::DryRun {
            num_workers,
            total_tasks,
            preview,
        } => {
            println!("Dry run: {} worker(s), {} task(s) queued", num_workers, total_tasks);
            for task in &preview {
                println!("  {} [{}] {}", task.id, task.kind, task.instruction());
            }
            if total_tasks > preview.len() {
                println!("  ... and {} more", total_tasks - preview.len());
            }
            Ok(ExitCode::SUCCESS)
        }
        StartOutcome::Finished(exits) => {
            let mut all_ok = true;
            for exit in &exits {
                let code = exit
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                println!("Worker {} exited: {}", exit.worker_index, code);
                if !exit.success() {
                    all_ok = false;
                    if !exit.stderr_tail.is_empty() {
                        println!("{}", exit.stderr_tail);
                    }
                }
            }
            Ok(if all_ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
        }
    }
}

async fn run_worker(
    workspace: &Workspace,
    config: &Config,
    max_iterations: Option<u32>,
    max_idle: Option<u32>,
) -> Result<ExitCode> {
    workspace.ensure_dirs()?;
    let executor = build_executor(config, workspace)?;
    let mut options = WorkerOptions::from_config(config);
    options.max_iterations = max_iterations;
    if max_idle.is_some() {
        options.max_idle_cycles = max_idle;
    }

    let worker = Worker::new(workspace, config, executor, options);
    let cancel = cancel_on_ctrl_c();
    let report = worker.run(&cancel).await?;
    println!("{}", report);
    Ok(ExitCode::SUCCESS)
}

async fn run_schedule(
    workspace: &Workspace,
    config: &Config,
    file: &std::path::Path,
    max_concurrent: usize,
    auto_deps: bool,
    dry_run: bool,
) -> Result<ExitCode> {
    let mut dag = TaskDAG::from_tasks(load_tasks(file)?)?;
    if auto_deps {
        let added = dag.detect_dependencies();
        info!(added, "inferred dependencies from task descriptions");
    }
    if dry_run {
        println!("Execution plan ({} tasks):", dag.task_count());
        for (i, step) in execution_plan(&dag)?.iter().enumerate() {
            println!("  {:>3}. {}", i + 1, step);
        }
        return Ok(ExitCode::SUCCESS);
    }
    let executor = build_executor(config, workspace)?;

    let (tx, mut rx) = mpsc::channel(64);
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                SchedulerEvent::WaveStarted { wave, task_ids } => {
                    println!("Wave {}: {}", wave, task_ids.join(", "))
                }
                SchedulerEvent::TaskCompleted { task_id } => println!("  done    {}", task_id),
                SchedulerEvent::TaskFailed { task_id, error } => {
                    println!("  failed  {}: {}", task_id, error)
                }
                SchedulerEvent::TaskBlocked { task_id, by } => {
                    println!("  blocked {} (by {})", task_id, by)
                }
                SchedulerEvent::Finished { .. } => break,
            }
        }
    });

    let cancel = cancel_on_ctrl_c();
    let scheduler = WaveScheduler::new(max_concurrent).with_events(tx);
    let report = scheduler.run(&dag, Arc::clone(&executor), &cancel).await;
    drop(scheduler);
    if let Err(e) = printer.await {
        warn!(error = %e, "event printer stopped");
    }

    let report = report?;
    println!("{}", report);
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, finishing current work");
            token.cancel();
        }
    });
    cancel
}
