//! The worker loop: poll the queue, claim one eligible task, execute it under
//! a wall-clock timeout, record the outcome, release the claim.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::backend::{build_backend, Backend, ExecutionOutcome, ExecutionRequest};
use crate::config::SwarmConfig;
use crate::error::{Result, SwarmError};
use crate::lock::{LockGuard, LockManager};
use crate::store::{ExecutionEntry, Store};
use crate::task::TaskStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    pub worker_id: String,
    pub poll_interval: Duration,
    /// Consecutive empty polls before the worker exits.
    pub idle_threshold: u32,
    pub task_timeout: Duration,
    pub max_iterations: Option<u64>,
}

impl WorkerOptions {
    pub fn from_config(config: &SwarmConfig, worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            poll_interval: config.poll_interval(),
            idle_threshold: config.idle_threshold,
            task_timeout: config.task_timeout(),
            max_iterations: config.max_iterations,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `idle_threshold` consecutive polls found nothing to do.
    Idle,
    /// The optional iteration bound was reached.
    MaxIterations,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::Idle => "idle",
            ExitReason::MaxIterations => "max_iterations",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStats {
    pub iterations: u64,
    pub completed: usize,
    pub failed: usize,
    pub contended: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub worker_id: String,
    pub exit: ExitReason,
    pub stats: WorkerStats,
}

/// Result of one pass through the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cycle {
    /// No pending task had its dependencies met.
    Idle,
    /// Eligible tasks existed but every claim attempt lost.
    Contended,
    /// Claimed, but the task was no longer eligible once re-read.
    Skipped(String),
    Finished { task_id: String, status: TaskStatus },
}

pub struct Worker {
    store: Store,
    locks: LockManager,
    backend: Arc<dyn Backend>,
    opts: WorkerOptions,
}

impl Worker {
    pub fn new(store: Store, locks: LockManager, backend: Arc<dyn Backend>, opts: WorkerOptions) -> Self {
        Self {
            store,
            locks,
            backend,
            opts,
        }
    }

    /// Build a worker whose store, locks and backend all come from `config`.
    pub fn from_config(config: &SwarmConfig, worker_id: impl Into<String>) -> Result<Self> {
        let spec = config.backend.as_ref().ok_or_else(|| {
            SwarmError::validation("no execution backend configured (set `backend` in the config file)")
        })?;
        let backend = build_backend(spec)
            .map_err(|err| SwarmError::validation(format!("invalid backend config: {err:#}")))?;
        Ok(Self::new(
            Store::open(config)?,
            LockManager::new(config)?,
            Arc::from(backend),
            WorkerOptions::from_config(config, worker_id),
        ))
    }

    pub fn worker_id(&self) -> &str {
        &self.opts.worker_id
    }

    /// Loop until idle or the iteration bound is hit. Store and lock errors
    /// abort the loop; task-level failures never do.
    pub fn run(&self) -> Result<WorkerSummary> {
        let mut stats = WorkerStats::default();
        let mut idle = 0u32;
        info!(worker_id = %self.opts.worker_id, "worker started");

        let exit = loop {
            if let Some(max) = self.opts.max_iterations {
                if stats.iterations >= max {
                    break ExitReason::MaxIterations;
                }
            }
            stats.iterations += 1;

            match self.run_once()? {
                Cycle::Idle => {
                    idle += 1;
                    if idle >= self.opts.idle_threshold {
                        break ExitReason::Idle;
                    }
                    debug!(worker_id = %self.opts.worker_id, idle, "no eligible task");
                    thread::sleep(self.opts.poll_interval);
                }
                Cycle::Contended => {
                    // Lost every claim: poll again straight away.
                    stats.contended += 1;
                    thread::yield_now();
                }
                Cycle::Skipped(_) => {
                    stats.contended += 1;
                }
                Cycle::Finished { status, .. } => {
                    idle = 0;
                    match status {
                        TaskStatus::Completed => stats.completed += 1,
                        _ => stats.failed += 1,
                    }
                }
            }
        };

        info!(
            worker_id = %self.opts.worker_id,
            exit = exit.as_str(),
            completed = stats.completed,
            failed = stats.failed,
            "worker exiting"
        );
        Ok(WorkerSummary {
            worker_id: self.opts.worker_id.clone(),
            exit,
            stats,
        })
    }

    /// One poll: scan eligible tasks in queue order and execute the first one
    /// this worker manages to claim.
    pub fn run_once(&self) -> Result<Cycle> {
        let queue = self.store.read_queue()?;
        let candidates: Vec<String> = queue.eligible().map(|t| t.id.clone()).collect();
        if candidates.is_empty() {
            return Ok(Cycle::Idle);
        }

        for task_id in candidates {
            match self.locks.acquire(&task_id, &self.opts.worker_id)? {
                Some(guard) => return self.execute_claimed(guard),
                None => debug!(task_id = %task_id, worker_id = %self.opts.worker_id, "claim lost"),
            }
        }
        Ok(Cycle::Contended)
    }

    fn execute_claimed(&self, guard: LockGuard<'_>) -> Result<Cycle> {
        let task_id = guard.task_id().to_string();
        let worker_id = self.opts.worker_id.as_str();
        let claimed_at = Utc::now();

        // Our queue snapshot may predate another worker finishing this task.
        let task = self.store.update_queue(|q| {
            let Some(task) = q.get(&task_id).cloned() else {
                return Ok(None);
            };
            if !q.is_eligible(&task) {
                return Ok(None);
            }
            q.set_status(&task_id, TaskStatus::InProgress);
            Ok(Some(task))
        })?;
        let Some(task) = task else {
            debug!(task_id = %task_id, worker_id, "task no longer eligible after claim");
            guard.release()?;
            return Ok(Cycle::Skipped(task_id));
        };

        let entry = ExecutionEntry::claimed(worker_id, claimed_at);
        self.store.record_execution(&task_id, entry.clone())?;
        info!(task_id = %task_id, worker_id, kind = %task.kind, "executing task");

        let req = ExecutionRequest::for_task(&task, self.opts.task_timeout);
        let (status, entry) = match execute_with_timeout(Arc::clone(&self.backend), req) {
            Ok(outcome) => {
                info!(task_id = %task_id, worker_id, cost = outcome.cost, "task completed");
                (TaskStatus::Completed, entry.complete(outcome.cost, outcome.output))
            }
            Err(err) => {
                warn!(task_id = %task_id, worker_id, error = %err, "task failed");
                (TaskStatus::Failed, entry.fail(err.to_string()))
            }
        };

        self.store.update_queue(|q| {
            q.set_status(&task_id, status);
            Ok(())
        })?;
        self.store.record_execution(&task_id, entry)?;
        guard.release()?;

        Ok(Cycle::Finished { task_id, status })
    }
}

/// Run the backend on its own thread and give up after `req.timeout`.
///
/// A backend that overruns is abandoned, not interrupted; backends that can
/// cancel their own work (like the command backend) do so on the same
/// deadline.
pub fn execute_with_timeout(
    backend: Arc<dyn Backend>,
    req: ExecutionRequest,
) -> std::result::Result<ExecutionOutcome, SwarmError> {
    let timeout = req.timeout;
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("exec-{}", req.task_id))
        .spawn(move || {
            let out = backend.execute(&req);
            let _ = tx.send(out);
        })
        .map_err(|err| SwarmError::ExecutionFailed(format!("failed to start execution thread: {err}")))?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(outcome)) if outcome.success => Ok(outcome),
        Ok(Ok(outcome)) => Err(SwarmError::ExecutionFailed(
            outcome
                .error
                .unwrap_or_else(|| "backend reported failure without detail".to_string()),
        )),
        Ok(Err(err)) => match err.downcast_ref::<SwarmError>() {
            Some(SwarmError::ExecutionTimeout(after)) => Err(SwarmError::ExecutionTimeout(*after)),
            _ => Err(SwarmError::ExecutionFailed(format!("{err:#}"))),
        },
        Err(RecvTimeoutError::Timeout) => Err(SwarmError::ExecutionTimeout(timeout)),
        Err(RecvTimeoutError::Disconnected) => {
            Err(SwarmError::ExecutionFailed("backend panicked".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::mk_task;
    use std::collections::HashMap;
    use std::sync::Mutex;

    type Hook = Box<dyn Fn(&ExecutionRequest) + Send + Sync>;

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Fail,
        Sleep(Duration),
        Panic,
    }

    #[derive(Default)]
    struct FakeBackend {
        behavior: HashMap<String, Behavior>,
        calls: Mutex<Vec<String>>,
        hook: Option<Hook>,
    }

    impl FakeBackend {
        fn with(mut self, task_id: &str, behavior: Behavior) -> Self {
            self.behavior.insert(task_id.to_string(), behavior);
            self
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Backend for FakeBackend {
        fn execute(&self, req: &ExecutionRequest) -> anyhow::Result<ExecutionOutcome> {
            self.calls.lock().unwrap().push(req.task_id.clone());
            if let Some(hook) = &self.hook {
                hook(req);
            }
            match self.behavior.get(&req.task_id).copied().unwrap_or(Behavior::Succeed) {
                Behavior::Succeed => Ok(ExecutionOutcome::ok(0.1, format!("done {}", req.task_id))),
                Behavior::Fail => Ok(ExecutionOutcome::failed("model refused")),
                Behavior::Sleep(d) => {
                    thread::sleep(d);
                    Ok(ExecutionOutcome::ok(0.0, "late"))
                }
                Behavior::Panic => panic!("backend exploded"),
            }
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Store,
        locks: LockManager,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Store::at(dir.path().join("ws")).unwrap();
            let locks =
                LockManager::at(dir.path().join("ws/locks"), Duration::from_secs(300)).unwrap();
            std::fs::create_dir_all(locks.dir()).unwrap();
            Self {
                _dir: dir,
                store,
                locks,
            }
        }

        fn worker(&self, id: &str, backend: Arc<dyn Backend>) -> Worker {
            Worker::new(
                self.store.clone(),
                self.locks.clone(),
                backend,
                WorkerOptions {
                    worker_id: id.to_string(),
                    poll_interval: Duration::from_millis(5),
                    idle_threshold: 3,
                    task_timeout: Duration::from_secs(5),
                    max_iterations: None,
                },
            )
        }

        fn status(&self, id: &str) -> TaskStatus {
            self.store.read_queue().unwrap().get(id).unwrap().status
        }
    }

    #[test]
    fn executes_in_dependency_then_queue_order() {
        let fx = Fixture::new();
        fx.store.add_task(mk_task("t1", &[])).unwrap();
        fx.store.add_task(mk_task("t2", &["t1"])).unwrap();
        fx.store.add_task(mk_task("t3", &[])).unwrap();

        let backend = Arc::new(FakeBackend::default());
        let summary = fx.worker("w1", backend.clone()).run().unwrap();

        assert_eq!(backend.calls(), vec!["t1", "t2", "t3"]);
        assert_eq!(summary.exit, ExitReason::Idle);
        assert_eq!(summary.stats.completed, 3);
        let q = fx.store.read_queue().unwrap();
        assert_eq!(q.completed, vec!["t1", "t2", "t3"]);
        assert!(fx.locks.list().unwrap().is_empty());
    }

    #[test]
    fn failure_is_terminal_and_blocks_dependents() {
        let fx = Fixture::new();
        fx.store.add_task(mk_task("t1", &[])).unwrap();
        fx.store.add_task(mk_task("t2", &["t1"])).unwrap();

        let backend = Arc::new(FakeBackend::default().with("t1", Behavior::Fail));
        let summary = fx.worker("w1", backend.clone()).run().unwrap();

        assert_eq!(backend.calls(), vec!["t1"], "failed task must not be retried");
        assert_eq!(summary.stats.failed, 1);
        assert_eq!(fx.status("t1"), TaskStatus::Failed);
        assert_eq!(fx.status("t2"), TaskStatus::Pending);

        let log = fx.store.read_execution_log().unwrap();
        let entry = log.get("t1").unwrap();
        assert_eq!(entry.status, TaskStatus::Failed);
        assert_eq!(entry.worker_id, "w1");
        assert!(entry.error.as_deref().unwrap().contains("model refused"));
        assert!(!fx.locks.is_locked("t1"));
    }

    #[test]
    fn timeout_fails_task_releases_lock_and_moves_on() {
        let fx = Fixture::new();
        fx.store.add_task(mk_task("slow", &[])).unwrap();
        fx.store.add_task(mk_task("fast", &[])).unwrap();

        let backend = Arc::new(
            FakeBackend::default().with("slow", Behavior::Sleep(Duration::from_secs(2))),
        );
        let mut worker = fx.worker("w1", backend.clone());
        worker.opts.task_timeout = Duration::from_millis(100);
        worker.run().unwrap();

        assert_eq!(fx.status("slow"), TaskStatus::Failed);
        assert_eq!(fx.status("fast"), TaskStatus::Completed);
        let log = fx.store.read_execution_log().unwrap();
        assert!(
            log.get("slow").unwrap().error.as_deref().unwrap().contains("timed out"),
            "{:?}",
            log.get("slow")
        );
        assert!(fx.locks.list().unwrap().is_empty());
    }

    #[test]
    fn panicking_backend_is_contained_to_its_task() {
        let fx = Fixture::new();
        fx.store.add_task(mk_task("boom", &[])).unwrap();
        fx.store.add_task(mk_task("ok", &[])).unwrap();

        let backend = Arc::new(FakeBackend::default().with("boom", Behavior::Panic));
        let summary = fx.worker("w1", backend).run().unwrap();

        assert_eq!(summary.stats.failed, 1);
        assert_eq!(summary.stats.completed, 1);
        assert_eq!(fx.status("boom"), TaskStatus::Failed);
        assert!(!fx.locks.is_locked("boom"));
    }

    #[test]
    fn in_progress_is_observable_while_backend_runs() {
        let fx = Fixture::new();
        fx.store.add_task(mk_task("t1", &[])).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let hook: Hook = {
            let store = fx.store.clone();
            let locks = fx.locks.clone();
            let seen = Arc::clone(&seen);
            Box::new(move |req| {
                let log = store.read_execution_log().unwrap();
                let entry = log.get(&req.task_id).cloned();
                let queue_status = store.read_queue().unwrap().get(&req.task_id).unwrap().status;
                *seen.lock().unwrap() = Some((entry, queue_status, locks.is_locked(&req.task_id)));
            })
        };
        let backend = Arc::new(FakeBackend {
            hook: Some(hook),
            ..FakeBackend::default()
        });
        fx.worker("w1", backend).run().unwrap();

        let (entry, queue_status, locked) = seen.lock().unwrap().take().expect("hook ran");
        let entry = entry.expect("log entry written before execution");
        assert_eq!(entry.status, TaskStatus::InProgress);
        assert_eq!(entry.worker_id, "w1");
        assert!(entry.completed_at.is_none());
        assert_eq!(queue_status, TaskStatus::InProgress);
        assert!(locked);
    }

    #[test]
    fn idle_worker_exits_after_threshold() {
        let fx = Fixture::new();
        let summary = fx
            .worker("w1", Arc::new(FakeBackend::default()))
            .run()
            .unwrap();
        assert_eq!(summary.exit, ExitReason::Idle);
        assert_eq!(summary.stats.iterations, 3);
    }

    #[test]
    fn iteration_bound_is_a_clean_exit() {
        let fx = Fixture::new();
        for id in ["a", "b", "c"] {
            fx.store.add_task(mk_task(id, &[])).unwrap();
        }
        let backend = Arc::new(FakeBackend::default());
        let mut worker = fx.worker("w1", backend.clone());
        worker.opts.max_iterations = Some(2);

        let summary = worker.run().unwrap();
        assert_eq!(summary.exit, ExitReason::MaxIterations);
        assert_eq!(backend.calls(), vec!["a", "b"]);
        assert_eq!(fx.status("c"), TaskStatus::Pending);
    }

    #[test]
    fn fresh_foreign_lock_is_skipped_not_stolen() {
        let fx = Fixture::new();
        fx.store.add_task(mk_task("t1", &[])).unwrap();
        fx.store.add_task(mk_task("t2", &[])).unwrap();
        assert!(fx.locks.try_acquire("t1", "someone-else").unwrap());

        let backend = Arc::new(FakeBackend::default());
        let mut worker = fx.worker("w1", backend.clone());
        worker.opts.max_iterations = Some(3);
        let summary = worker.run().unwrap();

        assert_eq!(backend.calls(), vec!["t2"]);
        assert_eq!(summary.stats.contended, 2);
        assert_eq!(fx.status("t1"), TaskStatus::Pending);
        let held = fx.locks.read("t1").unwrap().unwrap();
        assert_eq!(held.record.unwrap().worker_id, "someone-else");
    }

    #[test]
    fn lost_claims_retry_without_waiting_a_poll_interval() {
        let fx = Fixture::new();
        fx.store.add_task(mk_task("t1", &[])).unwrap();
        assert!(fx.locks.try_acquire("t1", "other").unwrap());

        let backend = Arc::new(FakeBackend::default());
        let mut worker = fx.worker("w1", backend.clone());
        worker.opts.poll_interval = Duration::from_millis(500);
        worker.opts.max_iterations = Some(3);

        let start = std::time::Instant::now();
        let summary = worker.run().unwrap();
        assert!(start.elapsed() < Duration::from_millis(500), "{:?}", start.elapsed());
        assert_eq!(summary.exit, ExitReason::MaxIterations);
        assert_eq!(summary.stats.contended, 3);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn stale_lock_on_pending_task_is_reclaimed_and_executed() {
        let fx = Fixture::new();
        fx.store.add_task(mk_task("t1", &[])).unwrap();
        let stale = format!(
            r#"{{"worker_id":"crashed","started_at":"{}"}}"#,
            (Utc::now() - chrono::Duration::seconds(400)).to_rfc3339()
        );
        std::fs::write(fx.locks.lock_path("t1"), stale).unwrap();

        let backend = Arc::new(FakeBackend::default());
        fx.worker("w2", backend.clone()).run().unwrap();

        assert_eq!(backend.calls(), vec!["t1"]);
        assert_eq!(fx.status("t1"), TaskStatus::Completed);
        let log = fx.store.read_execution_log().unwrap();
        assert_eq!(log.get("t1").unwrap().worker_id, "w2");
    }

    #[test]
    fn racing_workers_execute_a_task_exactly_once() {
        let fx = Fixture::new();
        fx.store.add_task(mk_task("t1", &[])).unwrap();

        let backend = Arc::new(
            FakeBackend::default().with("t1", Behavior::Sleep(Duration::from_millis(50))),
        );
        let a = fx.worker("wa", backend.clone());
        let b = fx.worker("wb", backend.clone());

        thread::scope(|s| {
            let ha = s.spawn(|| a.run().unwrap());
            let hb = s.spawn(|| b.run().unwrap());
            ha.join().unwrap();
            hb.join().unwrap();
        });

        assert_eq!(backend.calls(), vec!["t1"]);
        let log = fx.store.read_execution_log().unwrap();
        assert_eq!(log.executions.len(), 1);
        let holder = &log.get("t1").unwrap().worker_id;
        assert!(holder == "wa" || holder == "wb", "{holder}");
        assert_eq!(fx.status("t1"), TaskStatus::Completed);
    }

    #[test]
    fn from_config_requires_a_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = SwarmConfig {
            workspace: dir.path().join("ws"),
            ..SwarmConfig::default()
        };
        let err = Worker::from_config(&config, "w1").err().expect("no backend");
        assert!(err.is_validation(), "{err}");
    }
}
