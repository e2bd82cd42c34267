use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, IsTerminal, Write};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use swarm::config::{SwarmConfig, DEFAULT_CONFIG_FILE};
use swarm::orchestrator::{NewTask, Orchestrator, ProcessLauncher, WorkerState};
use swarm::report;
use swarm::worker::Worker;

/// Swarm: a local multi-process task runner.
///
/// Tasks go into a file-backed queue; `start` launches worker processes that
/// claim eligible tasks through per-task lock files and hand them to the
/// configured execution backend.
#[derive(Parser, Debug)]
#[command(name = "swarm")]
#[command(about = "Local multi-process task runner", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file (defaults to ./swarm.yaml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Workspace directory, overriding config and SWARM_WORKSPACE
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a task to the queue
    Add {
        id: String,

        /// Free-form category label
        #[arg(value_name = "TYPE")]
        kind: String,

        /// Payload handed to the execution backend
        #[arg(long, default_value = "")]
        instruction: String,

        #[arg(long = "min", default_value_t = 0.5)]
        budget_min: f64,

        #[arg(long = "max", default_value_t = 2.0)]
        budget_max: f64,

        /// low, medium or high
        #[arg(long, default_value = "medium")]
        intensity: String,

        /// Comma-separated ids that must complete first
        #[arg(long, value_delimiter = ',')]
        depends_on: Vec<String>,
    },

    /// Launch N workers and wait for them to finish
    Start {
        workers: usize,

        /// Validate and print the plan without spawning or writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Show task counts, failures and held locks
    Status,

    /// Remove all tasks, execution records and locks
    Clear {
        /// Skip the interactive confirmation
        #[arg(long, short = 'y')]
        yes: bool,
    },

    /// Put a failed or orphaned task back to pending
    Requeue { id: String },

    /// Run a single worker in this process (used by `start`)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        id: Option<String>,

        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        max_iterations: Option<u64>,
    },
}

fn print_error_chain(err: &anyhow::Error) {
    eprintln!("Error: {err}");

    let mut n = 0;
    let mut cur = err.source();
    while let Some(cause) = cur {
        eprintln!("  {n}: {cause}");
        n += 1;
        cur = cause.source();
    }
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    if let Err(err) = real_main(cli) {
        print_error_chain(&err);
        std::process::exit(1);
    }
}

/// The config file actually in effect, made absolute so spawned workers
/// resolve the same one.
fn resolve_config_path(explicit: Option<PathBuf>) -> Result<Option<PathBuf>> {
    let path = match explicit {
        Some(p) => p,
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if !p.is_file() {
                return Ok(None);
            }
            p.to_path_buf()
        }
    };
    let abs = std::path::absolute(&path)
        .with_context(|| format!("failed to resolve config path '{}'", path.display()))?;
    Ok(Some(abs))
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush().context("failed to flush stdout")?;
    let mut answer = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn real_main(cli: Cli) -> Result<()> {
    let config_path = resolve_config_path(cli.config)?;
    let mut config = SwarmConfig::load(config_path.as_deref()).context("failed to load config")?;
    if let Some(ws) = cli.workspace {
        config.workspace = ws;
    }

    match cli.command {
        Command::Add {
            id,
            kind,
            instruction,
            budget_min,
            budget_max,
            intensity,
            depends_on,
        } => {
            let orch = Orchestrator::new(config)?;
            let task = orch.add(NewTask {
                id,
                kind,
                instruction,
                budget_min,
                budget_max,
                intensity,
                depends_on,
            })?;
            println!("Added task {} ({})", task.id, task.kind);
        }

        Command::Start { workers, dry_run } => {
            let orch = Orchestrator::new(config)?;
            if dry_run {
                let plan = orch.plan(workers)?;
                print!("{}", report::render_plan(&plan));
                return Ok(());
            }

            let mut launcher = ProcessLauncher::for_current_exe(orch.config(), config_path)?;
            launcher.debug = cli.debug;
            let outcome = orch.start(workers, &launcher)?;
            print!("{}", report::render_swarm_report(&outcome));
            if !outcome.is_success() {
                let bad = outcome
                    .workers
                    .iter()
                    .filter(|w| w.state != WorkerState::ExitedClean)
                    .count();
                bail!("{bad} of {} worker(s) did not exit cleanly", outcome.workers.len());
            }
        }

        Command::Status => {
            let orch = Orchestrator::new(config)?;
            let status = orch.status()?;
            print!("{}", report::render_status(&status));
        }

        Command::Clear { yes } => {
            let orch = Orchestrator::new(config)?;
            if !yes && std::io::stdin().is_terminal() {
                let prompt = format!(
                    "Remove every task, execution record and lock under '{}'?",
                    orch.config().workspace.display()
                );
                if !confirm(&prompt)? {
                    println!("Aborted");
                    return Ok(());
                }
            }
            let summary = orch.clear()?;
            print!("{}", report::render_clear(&summary));
        }

        Command::Requeue { id } => {
            let orch = Orchestrator::new(config)?;
            let previous = orch.requeue(&id)?;
            println!("Requeued {id} (was {previous})");
        }

        Command::Worker { id, max_iterations } => {
            if max_iterations.is_some() {
                config.max_iterations = max_iterations;
                config.validate()?;
            }
            let id = id.unwrap_or_else(|| format!("worker-{}", std::process::id()));
            let worker = Worker::from_config(&config, id)?;
            let summary = worker.run()?;
            println!(
                "{} exited ({}): completed={} failed={}",
                summary.worker_id,
                summary.exit.as_str(),
                summary.stats.completed,
                summary.stats.failed
            );
        }
    }

    Ok(())
}
