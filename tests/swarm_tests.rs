use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::anyhow;
use swarm::backend::{Backend, ExecutionOutcome, ExecutionRequest};
use swarm::config::{BackendSpec, SwarmConfig};
use swarm::lock::LockManager;
use swarm::orchestrator::{
    NewTask, Orchestrator, WorkerExit, WorkerHandle, WorkerLauncher, WorkerState,
};
use swarm::store::Store;
use swarm::task::TaskStatus;
use swarm::worker::{Worker, WorkerOptions};

mod helpers;
use helpers::{unique_test_temp_dir, EnvVarGuard};

/// Records every execution and fails tasks whose instruction is "fail".
#[derive(Default)]
struct RecordingBackend {
    calls: Mutex<Vec<String>>,
    delay: Duration,
}

impl Backend for RecordingBackend {
    fn execute(&self, req: &ExecutionRequest) -> anyhow::Result<ExecutionOutcome> {
        self.calls.lock().unwrap().push(req.task_id.clone());
        thread::sleep(self.delay);
        if req.instruction == "fail" {
            return Ok(ExecutionOutcome::failed("instructed to fail"));
        }
        Ok(ExecutionOutcome::ok(0.1, format!("did {}", req.task_id)))
    }
}

/// Runs real workers on threads instead of processes.
struct ThreadLauncher {
    config: SwarmConfig,
    backend: Arc<RecordingBackend>,
}

struct ThreadHandle(Option<JoinHandle<swarm::error::Result<swarm::worker::WorkerSummary>>>);

impl WorkerHandle for ThreadHandle {
    fn wait(&mut self) -> anyhow::Result<WorkerExit> {
        let handle = self.0.take().ok_or_else(|| anyhow!("already waited"))?;
        let exit = match handle.join() {
            Ok(Ok(summary)) => WorkerExit {
                exit_code: Some(0),
                timed_out: false,
                output_tail: vec![format!(
                    "{} completed={} failed={}",
                    summary.worker_id, summary.stats.completed, summary.stats.failed
                )],
            },
            Ok(Err(err)) => WorkerExit {
                exit_code: Some(1),
                timed_out: false,
                output_tail: vec![err.to_string()],
            },
            Err(_) => WorkerExit {
                exit_code: Some(101),
                ..WorkerExit::default()
            },
        };
        Ok(exit)
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, worker_id: &str) -> anyhow::Result<Box<dyn WorkerHandle>> {
        let store = Store::open(&self.config)?;
        let locks = LockManager::new(&self.config)?;
        let backend: Arc<dyn Backend> = self.backend.clone();
        let opts = WorkerOptions::from_config(&self.config, worker_id);
        let worker = Worker::new(store, locks, backend, opts);
        Ok(Box::new(ThreadHandle(Some(thread::spawn(move || worker.run())))))
    }
}

fn test_config(root: &Path) -> SwarmConfig {
    SwarmConfig {
        workspace: root.join("ws"),
        poll_interval_ms: 10,
        idle_threshold: 5,
        task_timeout_secs: 10,
        backend: Some(BackendSpec::Command {
            program: "unused".into(),
            args: vec![],
        }),
        ..SwarmConfig::default()
    }
}

#[test]
fn dependent_task_runs_only_after_its_dependency_completes() {
    let root = unique_test_temp_dir("swarm-scenario-a");
    let config = test_config(&root);
    let orch = Orchestrator::new(config.clone()).unwrap();
    orch.add(NewTask::new("t1", "build")).unwrap();
    let mut t2 = NewTask::new("t2", "test");
    t2.depends_on = vec!["t1".into()];
    orch.add(t2).unwrap();

    let backend = Arc::new(RecordingBackend {
        delay: Duration::from_millis(30),
        ..RecordingBackend::default()
    });
    let launcher = ThreadLauncher {
        config,
        backend: backend.clone(),
    };
    let report = orch.start(2, &launcher).unwrap();

    assert!(report.is_success(), "{report:?}");
    assert_eq!(*backend.calls.lock().unwrap(), vec!["t1", "t2"]);
    assert_eq!(report.counts.completed, 2);

    let log = orch.store().read_execution_log().unwrap();
    let t1 = log.get("t1").unwrap();
    let t2 = log.get("t2").unwrap();
    assert!(t1.completed_at.unwrap() <= t2.claimed_at);
    assert!(orch.locks().list().unwrap().is_empty());
}

#[test]
fn many_workers_execute_every_task_exactly_once() {
    let root = unique_test_temp_dir("swarm-many");
    let config = test_config(&root);
    let orch = Orchestrator::new(config.clone()).unwrap();
    for i in 0..24 {
        let mut task = NewTask::new(format!("task-{i:02}"), "batch");
        if i % 7 == 3 {
            task.instruction = "fail".into();
        }
        if i >= 12 {
            task.depends_on = vec![format!("task-{:02}", i - 12)];
        }
        orch.add(task).unwrap();
    }

    let backend = Arc::new(RecordingBackend::default());
    let launcher = ThreadLauncher {
        config,
        backend: backend.clone(),
    };
    let report = orch.start(6, &launcher).unwrap();
    assert!(report.is_success(), "{report:?}");
    assert!(report
        .workers
        .iter()
        .all(|w| w.state == WorkerState::ExitedClean));

    let mut calls = backend.calls.lock().unwrap().clone();
    let total_calls = calls.len();
    calls.sort();
    calls.dedup();
    assert_eq!(calls.len(), total_calls, "a task was executed twice");

    let q = orch.store().read_queue().unwrap();
    for task in &q.tasks {
        let idx: usize = task.id["task-".len()..].parse().unwrap();
        let failed_dep = idx >= 12 && (idx - 12) % 7 == 3;
        let expected = if idx % 7 == 3 {
            TaskStatus::Failed
        } else if failed_dep {
            TaskStatus::Pending
        } else {
            TaskStatus::Completed
        };
        assert_eq!(task.status, expected, "{}", task.id);
    }

    let status = orch.status().unwrap();
    assert_eq!(status.log.total, total_calls);
    assert!(status.locks.is_empty());
    assert!(status.orphaned.is_empty());
}

#[test]
fn racing_claims_from_independent_managers_have_one_winner() {
    let root = unique_test_temp_dir("swarm-race");
    let dir = root.join("locks");

    for round in 0..20 {
        let task_id = format!("t{round}");
        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let winners = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let dir = dir.clone();
                let task_id = task_id.clone();
                let barrier = Arc::clone(&barrier);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    let locks = LockManager::at(dir, Duration::from_secs(300)).unwrap();
                    barrier.wait();
                    if locks.try_acquire(&task_id, &format!("w{i}")).unwrap() {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(winners.load(Ordering::SeqCst), 1, "round {round}");
    }
}

#[test]
fn racing_reclaims_of_a_stale_lock_have_one_winner() {
    let root = unique_test_temp_dir("swarm-stale-race");
    let dir = root.join("locks");
    let seed = LockManager::at(&dir, Duration::from_secs(300)).unwrap();
    fs::create_dir_all(&dir).unwrap();

    for round in 0..10 {
        let task_id = format!("t{round}");
        fs::write(
            seed.lock_path(&task_id),
            r#"{"worker_id":"dead","started_at":"2001-01-01T00:00:00Z"}"#,
        )
        .unwrap();

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let winners = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let dir = dir.clone();
                let task_id = task_id.clone();
                let barrier = Arc::clone(&barrier);
                let winners = Arc::clone(&winners);
                thread::spawn(move || {
                    let locks = LockManager::at(dir, Duration::from_secs(300)).unwrap();
                    barrier.wait();
                    let me = format!("w{i}");
                    if locks.try_acquire(&task_id, &me).unwrap() {
                        winners.lock().unwrap().push(me);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let winners = winners.lock().unwrap();
        assert_eq!(winners.len(), 1, "round {round}: {winners:?}");
        let held = seed.read(&task_id).unwrap().unwrap();
        assert_eq!(held.record.unwrap().worker_id, winners[0]);
        assert!(!held.stale);
    }
}

#[test]
fn separate_workspaces_in_one_process_do_not_interact() {
    let a = Orchestrator::new(test_config(&unique_test_temp_dir("swarm-iso-a"))).unwrap();
    let b = Orchestrator::new(test_config(&unique_test_temp_dir("swarm-iso-b"))).unwrap();

    a.add(NewTask::new("t1", "build")).unwrap();
    b.add(NewTask::new("t1", "build")).unwrap();
    assert!(a.locks().try_acquire("t1", "w1").unwrap());
    assert!(b.locks().try_acquire("t1", "w1").unwrap());

    assert_eq!(a.status().unwrap().locks.len(), 1);
    a.clear().unwrap();
    assert_eq!(b.status().unwrap().counts.pending, 1);
    assert_eq!(b.status().unwrap().locks.len(), 1);
}

#[test]
fn config_file_then_env_overrides() {
    let root = unique_test_temp_dir("swarm-config");
    let path = root.join("swarm.yaml");
    fs::write(
        &path,
        format!(
            "workspace: {}\nidle_threshold: 3\npoll_interval_ms: 100\nbackend:\n  kind: http\n  endpoint: http://127.0.0.1:9/run\n  auth_env: TOKEN\n",
            root.join("ws").display()
        ),
    )
    .unwrap();

    let _env = EnvVarGuard::set_many(&[
        ("SWARM_POLL_INTERVAL_MS", OsStr::new("25")),
        ("SWARM_TASK_TIMEOUT_SECS", OsStr::new("42")),
    ]);
    let config = SwarmConfig::load(Some(&path)).unwrap();

    assert_eq!(config.workspace, root.join("ws"));
    assert_eq!(config.idle_threshold, 3);
    assert_eq!(config.poll_interval(), Duration::from_millis(25));
    assert_eq!(config.task_timeout(), Duration::from_secs(42));
    assert_eq!(config.stale_timeout(), Duration::from_secs(300));
    match config.backend {
        Some(BackendSpec::Http { endpoint, auth_env, .. }) => {
            assert_eq!(endpoint, "http://127.0.0.1:9/run");
            assert_eq!(auth_env.as_deref(), Some("TOKEN"));
        }
        other => panic!("expected http backend, got {other:?}"),
    }
}

#[test]
fn invalid_env_override_is_a_validation_error() {
    let root = unique_test_temp_dir("swarm-config-bad");
    let path = root.join("swarm.yaml");
    fs::write(&path, "").unwrap();

    let _env = EnvVarGuard::set("SWARM_IDLE_THRESHOLD", "many");
    let err = SwarmConfig::load(Some(&path)).unwrap_err();
    assert!(err.is_validation(), "{err}");
    assert!(err.to_string().contains("SWARM_IDLE_THRESHOLD"), "{err}");
}
