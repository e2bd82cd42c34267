//! Queue administration and worker-process supervision.
//!
//! The orchestrator never executes tasks. It edits the queue through the
//! [`Store`], launches workers through a [`WorkerLauncher`], and reports what
//! the store, the execution log and the lock directory say.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use tracing::{debug, info, warn};

use crate::config::SwarmConfig;
use crate::error::{Result, SwarmError};
use crate::lock::{HeldLock, LockManager};
use crate::store::{LogSummary, Store};
use crate::task::{Intensity, StatusCounts, Task, TaskStatus};

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 32;
/// Number of queued tasks shown by a dry run.
pub const PLAN_PREVIEW: usize = 5;

/// Operator input for `add`, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub id: String,
    pub kind: String,
    pub instruction: String,
    pub budget_min: f64,
    pub budget_max: f64,
    pub intensity: String,
    pub depends_on: Vec<String>,
}

impl NewTask {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            instruction: String::new(),
            budget_min: 0.5,
            budget_max: 2.0,
            intensity: Intensity::Medium.as_str().to_string(),
            depends_on: Vec::new(),
        }
    }
}

/// Lifecycle of one worker process as seen from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Spawned,
    Running,
    ExitedClean,
    ExitedError,
    TimedOut,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Spawned => "spawned",
            WorkerState::Running => "running",
            WorkerState::ExitedClean => "exited_clean",
            WorkerState::ExitedError => "exited_error",
            WorkerState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerState::ExitedClean | WorkerState::ExitedError | WorkerState::TimedOut
        )
    }
}

/// What a finished worker handle reports.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerExit {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Last lines of combined stdout/stderr.
    pub output_tail: Vec<String>,
}

impl WorkerExit {
    fn state(&self) -> WorkerState {
        if self.timed_out {
            WorkerState::TimedOut
        } else if self.exit_code == Some(0) {
            WorkerState::ExitedClean
        } else {
            WorkerState::ExitedError
        }
    }
}

/// A running worker that can be waited on.
pub trait WorkerHandle: Send {
    fn wait(&mut self) -> anyhow::Result<WorkerExit>;
}

/// Starts workers. Real runs spawn processes; tests substitute fakes.
pub trait WorkerLauncher: Sync {
    fn launch(&self, worker_id: &str) -> anyhow::Result<Box<dyn WorkerHandle>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOutcome {
    pub worker_id: String,
    pub state: WorkerState,
    pub exit_code: Option<i32>,
    pub output_tail: Vec<String>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwarmPlan {
    pub workers: usize,
    pub counts: StatusCounts,
    pub eligible: usize,
    /// First few non-terminal tasks in queue order.
    pub preview: Vec<Task>,
    pub backend: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwarmReport {
    pub workers: Vec<WorkerOutcome>,
    pub counts: StatusCounts,
    pub elapsed: Duration,
}

impl SwarmReport {
    /// True when every worker exited cleanly.
    pub fn is_success(&self) -> bool {
        self.workers
            .iter()
            .all(|w| w.state == WorkerState::ExitedClean)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FailedTask {
    pub id: String,
    pub worker_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub counts: StatusCounts,
    pub log: LogSummary,
    pub failed: Vec<FailedTask>,
    pub locks: Vec<HeldLock>,
    /// `in_progress` tasks whose lock is missing or stale.
    pub orphaned: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClearSummary {
    pub tasks: usize,
    pub executions: usize,
    pub locks: usize,
}

pub fn validate_worker_count(n: usize) -> Result<()> {
    if !(MIN_WORKERS..=MAX_WORKERS).contains(&n) {
        return Err(SwarmError::validation(format!(
            "worker count must be between {MIN_WORKERS} and {MAX_WORKERS}, got {n}"
        )));
    }
    Ok(())
}

pub struct Orchestrator {
    config: SwarmConfig,
    store: Store,
    locks: LockManager,
}

impl Orchestrator {
    pub fn new(config: SwarmConfig) -> Result<Self> {
        let store = Store::open(&config)?;
        let locks = LockManager::new(&config)?;
        Ok(Self {
            config,
            store,
            locks,
        })
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Validate and append a task. Nothing is written on any validation error.
    pub fn add(&self, new: NewTask) -> Result<Task> {
        let intensity: Intensity = new.intensity.parse()?;
        let task = Task {
            id: new.id,
            kind: new.kind,
            instruction: new.instruction,
            budget_min: new.budget_min,
            budget_max: new.budget_max,
            intensity,
            depends_on: new.depends_on,
            status: TaskStatus::Pending,
        };
        self.store.add_task(task.clone())?;
        info!(task_id = %task.id, kind = %task.kind, "task added");
        Ok(task)
    }

    fn preflight(&self, n: usize) -> Result<String> {
        validate_worker_count(n)?;
        let backend = self.config.backend.as_ref().ok_or_else(|| {
            SwarmError::validation("no execution backend configured (set `backend` in the config file)")
        })?;
        crate::backend::build_backend(backend)
            .map_err(|err| SwarmError::validation(format!("invalid backend config: {err:#}")))?;
        Ok(crate::report::describe_backend(backend))
    }

    /// Everything `start` checks, without launching or writing anything.
    pub fn plan(&self, n: usize) -> Result<SwarmPlan> {
        let backend = self.preflight(n)?;
        let queue = self.store.read_queue()?;
        Ok(SwarmPlan {
            workers: n,
            counts: queue.counts(),
            eligible: queue.eligible().count(),
            preview: queue
                .tasks
                .iter()
                .filter(|t| !t.status.is_terminal())
                .take(PLAN_PREVIEW)
                .cloned()
                .collect(),
            backend,
        })
    }

    /// Launch `n` workers and wait for all of them. A worker that fails to
    /// launch or exits badly is recorded; the others keep running.
    pub fn start(&self, n: usize, launcher: &dyn WorkerLauncher) -> Result<SwarmReport> {
        self.preflight(n)?;
        let started = Instant::now();
        info!(workers = n, "starting swarm");

        let mut outcomes: Vec<Option<WorkerOutcome>> = vec![None; n];
        let mut running = Vec::with_capacity(n);
        for (idx, slot) in outcomes.iter_mut().enumerate() {
            let worker_id = format!("worker-{}", idx + 1);
            match launcher.launch(&worker_id) {
                Ok(handle) => {
                    debug!(worker_id = %worker_id, state = WorkerState::Spawned.as_str(), "worker state");
                    running.push((idx, worker_id, handle));
                }
                Err(err) => {
                    let msg = format!("failed to launch: {err:#}");
                    warn!(worker_id = %worker_id, error = %msg, "worker failed");
                    *slot = Some(WorkerOutcome {
                        worker_id,
                        state: WorkerState::ExitedError,
                        exit_code: None,
                        output_tail: vec![msg],
                        elapsed: Duration::ZERO,
                    });
                }
            }
        }

        let finished: Vec<(usize, WorkerOutcome)> = thread::scope(|s| {
            let waits: Vec<_> = running
                .into_iter()
                .map(|(idx, worker_id, mut handle)| {
                    s.spawn(move || {
                        debug!(worker_id = %worker_id, state = WorkerState::Running.as_str(), "worker state");
                        let t0 = Instant::now();
                        let outcome = match handle.wait() {
                            Ok(exit) => WorkerOutcome {
                                state: exit.state(),
                                exit_code: exit.exit_code,
                                output_tail: exit.output_tail,
                                elapsed: t0.elapsed(),
                                worker_id,
                            },
                            Err(err) => WorkerOutcome {
                                state: WorkerState::ExitedError,
                                exit_code: None,
                                output_tail: vec![format!("failed waiting for worker: {err:#}")],
                                elapsed: t0.elapsed(),
                                worker_id,
                            },
                        };
                        (idx, outcome)
                    })
                })
                .collect();

            waits
                .into_iter()
                .filter_map(|h| h.join().ok())
                .collect()
        });

        for (idx, outcome) in finished {
            log_outcome(&outcome);
            outcomes[idx] = Some(outcome);
        }

        let workers = outcomes
            .into_iter()
            .enumerate()
            .map(|(idx, o)| {
                o.unwrap_or_else(|| WorkerOutcome {
                    worker_id: format!("worker-{}", idx + 1),
                    state: WorkerState::ExitedError,
                    exit_code: None,
                    output_tail: vec!["supervisor thread panicked".to_string()],
                    elapsed: Duration::ZERO,
                })
            })
            .collect();

        let counts = self.store.read_queue()?.counts();
        Ok(SwarmReport {
            workers,
            counts,
            elapsed: started.elapsed(),
        })
    }

    /// Aggregate health, recomputed from the files on every call.
    pub fn status(&self) -> Result<StatusReport> {
        let queue = self.store.read_queue()?;
        let log = self.store.read_execution_log()?;
        let locks = self.locks.list()?;

        let failed = queue
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| {
                let entry = log.get(&t.id);
                FailedTask {
                    id: t.id.clone(),
                    worker_id: entry.map(|e| e.worker_id.clone()),
                    error: entry.and_then(|e| e.error.clone()),
                }
            })
            .collect();

        let orphaned = queue
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::InProgress)
            .filter(|t| match locks.iter().find(|l| l.task_id == t.id) {
                Some(lock) => lock.stale,
                None => true,
            })
            .map(|t| t.id.clone())
            .collect();

        Ok(StatusReport {
            counts: queue.counts(),
            log: log.summary,
            failed,
            locks,
            orphaned,
        })
    }

    /// Remove every task, execution record and lock.
    pub fn clear(&self) -> Result<ClearSummary> {
        let tasks = self.store.read_queue()?.tasks.len();
        let executions = self.store.read_execution_log()?.executions.len();
        self.store.clear()?;
        let locks = self.locks.clear()?;
        info!(tasks, executions, locks, "workspace cleared");
        Ok(ClearSummary {
            tasks,
            executions,
            locks,
        })
    }

    /// Put a failed or orphaned task back to `pending`.
    ///
    /// A task whose lock is still fresh belongs to a live worker and is
    /// refused. A stale lock is left in place for the next claimer to
    /// reclaim; the execution log entry is dropped before the task becomes
    /// claimable again.
    pub fn requeue(&self, task_id: &str) -> Result<TaskStatus> {
        let locks = &self.locks;
        let store = &self.store;
        let previous = store.update_queue(|q| {
            let Some(task) = q.get(task_id) else {
                return Err(SwarmError::validation(format!("unknown task '{task_id}'")));
            };
            let previous = task.status;
            match previous {
                TaskStatus::Failed => {}
                TaskStatus::InProgress => {
                    if let Some(lock) = locks.read(task_id)? {
                        if !lock.stale {
                            return Err(SwarmError::validation(format!(
                                "task '{task_id}' is held by a live worker"
                            )));
                        }
                    }
                }
                other => {
                    return Err(SwarmError::validation(format!(
                        "task '{task_id}' is {other}; only failed or orphaned tasks can be requeued"
                    )));
                }
            }
            store.update_execution_log(|log| {
                log.executions.remove(task_id);
                Ok(())
            })?;
            q.set_status(task_id, TaskStatus::Pending);
            Ok(previous)
        })?;

        info!(task_id, from = previous.as_str(), "task requeued");
        Ok(previous)
    }
}

fn log_outcome(o: &WorkerOutcome) {
    match o.state {
        WorkerState::ExitedClean => {
            info!(worker_id = %o.worker_id, state = o.state.as_str(), "worker finished")
        }
        _ => warn!(
            worker_id = %o.worker_id,
            state = o.state.as_str(),
            exit_code = ?o.exit_code,
            "worker finished"
        ),
    }
}

/// Spawns `swarm worker` child processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    pub program: PathBuf,
    pub config_path: Option<PathBuf>,
    /// Absolute, so children agree with the parent regardless of their cwd.
    pub workspace: PathBuf,
    pub debug: bool,
    pub tail_lines: usize,
    pub timeout: Option<Duration>,
}

impl ProcessLauncher {
    /// Launcher for the running executable, overridable with `SWARM_WORKER_BIN`.
    pub fn for_current_exe(config: &SwarmConfig, config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let program = match std::env::var_os("SWARM_WORKER_BIN") {
            Some(bin) => PathBuf::from(bin),
            None => std::env::current_exe().context("failed to locate the swarm executable")?,
        };
        let workspace = std::path::absolute(&config.workspace).with_context(|| {
            format!("failed to resolve workspace '{}'", config.workspace.display())
        })?;
        Ok(Self {
            program,
            config_path,
            workspace,
            debug: false,
            tail_lines: config.output_tail_lines,
            timeout: config.worker_timeout(),
        })
    }

    fn command(&self, worker_id: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        if let Some(path) = &self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg("--workspace").arg(&self.workspace);
        if self.debug {
            cmd.arg("--debug");
        }
        cmd.args(["worker", "--id", worker_id]);
        cmd
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, worker_id: &str) -> anyhow::Result<Box<dyn WorkerHandle>> {
        let mut child = self
            .command(worker_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn worker '{}'", self.program.display()))?;

        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(self.tail_lines)));
        let stdout = child.stdout.take().context("failed to open worker stdout")?;
        let stderr = child.stderr.take().context("failed to open worker stderr")?;
        let readers = vec![
            spawn_tail_reader(stdout, Arc::clone(&tail), self.tail_lines),
            spawn_tail_reader(stderr, Arc::clone(&tail), self.tail_lines),
        ];

        Ok(Box::new(ProcessHandle {
            child,
            readers,
            tail,
            timeout: self.timeout,
        }))
    }
}

// Keeps only the last `keep` lines; the pipe is drained to EOF regardless so
// the child never blocks on a full buffer.
fn spawn_tail_reader<R: Read + Send + 'static>(
    src: R,
    tail: Arc<Mutex<VecDeque<String>>>,
    keep: usize,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(src);
        for line in reader.split(b'\n') {
            let Ok(line) = line else { break };
            let line = String::from_utf8_lossy(&line).trim_end().to_string();
            let mut tail = match tail.lock() {
                Ok(g) => g,
                Err(poisoned) => poisoned.into_inner(),
            };
            if keep == 0 {
                continue;
            }
            if tail.len() == keep {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

struct ProcessHandle {
    child: Child,
    readers: Vec<JoinHandle<()>>,
    tail: Arc<Mutex<VecDeque<String>>>,
    timeout: Option<Duration>,
}

impl WorkerHandle for ProcessHandle {
    fn wait(&mut self) -> anyhow::Result<WorkerExit> {
        let start = Instant::now();
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = self
                .child
                .try_wait()
                .context("failed waiting for worker process")?
            {
                break Some(status);
            }
            if let Some(limit) = self.timeout {
                if start.elapsed() >= limit {
                    timed_out = true;
                    let _ = self.child.kill();
                    break self.child.wait().ok();
                }
            }
            thread::sleep(Duration::from_millis(50));
        };

        for reader in self.readers.drain(..) {
            reader
                .join()
                .map_err(|_| anyhow!("worker output reader thread panicked"))?;
        }
        let output_tail = match self.tail.lock() {
            Ok(g) => g.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        };

        Ok(WorkerExit {
            exit_code: if timed_out { None } else { status.and_then(|s| s.code()) },
            timed_out,
            output_tail,
        })
    }
}
