//! File-backed persistence for the task queue and the execution log.
//!
//! Both records are pretty-printed JSON so an operator can inspect them by
//! hand. Writes are whole-file replaces (temp file + rename), so a concurrent
//! reader sees either the old or the new contents, never a torn file. Reads
//! tolerate a missing or unparseable file by returning an empty default and
//! logging a warning; only real I/O failures surface as
//! [`SwarmError::StoreUnavailable`].

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SwarmConfig;
use crate::error::{Result, SwarmError};
use crate::task::{QueueState, Task, TaskStatus};

pub const QUEUE_FILE: &str = "queue.json";
pub const EXECUTION_LOG_FILE: &str = "execution_log.json";

/// Longest output kept per execution log entry.
pub const MAX_OUTPUT_CHARS: usize = 4_000;

const GUARD_WAIT: Duration = Duration::from_secs(10);
const GUARD_STALE: Duration = Duration::from_secs(30);
const GUARD_RETRY: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEntry {
    pub worker_id: String,
    pub status: TaskStatus,
    pub claimed_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionEntry {
    /// Entry written at claim time, before the backend is invoked.
    pub fn claimed(worker_id: &str, claimed_at: DateTime<Utc>) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            status: TaskStatus::InProgress,
            claimed_at,
            completed_at: None,
            cost: None,
            output: None,
            error: None,
        }
    }

    pub fn complete(mut self, cost: f64, output: Option<String>) -> Self {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.cost = Some(cost);
        self.output = output.map(|o| truncate_chars(&o, MAX_OUTPUT_CHARS));
        self.error = None;
        self
    }

    pub fn fail(mut self, error: impl Into<String>) -> Self {
        self.status = TaskStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(truncate_chars(&error.into(), MAX_OUTPUT_CHARS));
        self
    }
}

/// Derived counts, regenerated on every read and write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogSummary {
    pub total: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionLog {
    #[serde(default)]
    pub executions: BTreeMap<String, ExecutionEntry>,
    #[serde(default)]
    pub summary: LogSummary,
}

impl ExecutionLog {
    pub fn get(&self, task_id: &str) -> Option<&ExecutionEntry> {
        self.executions.get(task_id)
    }

    pub fn refresh_summary(&mut self) {
        let mut summary = LogSummary {
            total: self.executions.len(),
            ..LogSummary::default()
        };
        for entry in self.executions.values() {
            match entry.status {
                TaskStatus::InProgress => summary.in_progress += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Pending => {}
            }
        }
        self.summary = summary;
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    queue_path: PathBuf,
    log_path: PathBuf,
}

impl Store {
    pub fn open(config: &SwarmConfig) -> Result<Self> {
        Self::at(&config.workspace)
    }

    /// Open a store rooted at `root`. Nothing is created on disk until the
    /// first write; a missing directory reads as an empty store.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        Ok(Self {
            queue_path: root.join(QUEUE_FILE),
            log_path: root.join(EXECUTION_LOG_FILE),
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn queue_path(&self) -> &Path {
        &self.queue_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn read_queue(&self) -> Result<QueueState> {
        let mut state: QueueState = read_json_or_default(&self.queue_path, "queue")?;
        state.reindex();
        Ok(state)
    }

    pub fn write_queue(&self, state: &QueueState) -> Result<()> {
        write_json_atomic(&self.queue_path, state)
    }

    /// Read-modify-write the queue. The closure's error aborts the write.
    pub fn update_queue<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut QueueState) -> Result<T>,
    {
        let _guard = StoreGuard::acquire(&self.guard_path(QUEUE_FILE))?;
        let mut state = self.read_queue()?;
        let out = f(&mut state)?;
        state.reindex();
        self.write_queue(&state)?;
        Ok(out)
    }

    /// Append a validated task; duplicates and unknown dependencies are
    /// validation errors and leave the file untouched.
    pub fn add_task(&self, task: Task) -> Result<()> {
        let id = task.id.clone();
        self.update_queue(|q| q.insert(task))?;
        debug!(task_id = %id, "task added to queue");
        Ok(())
    }

    pub fn read_execution_log(&self) -> Result<ExecutionLog> {
        let mut log: ExecutionLog = read_json_or_default(&self.log_path, "execution log")?;
        log.refresh_summary();
        Ok(log)
    }

    pub fn write_execution_log(&self, log: &ExecutionLog) -> Result<()> {
        let mut log = log.clone();
        log.refresh_summary();
        write_json_atomic(&self.log_path, &log)
    }

    pub fn update_execution_log<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ExecutionLog) -> Result<T>,
    {
        let _guard = StoreGuard::acquire(&self.guard_path(EXECUTION_LOG_FILE))?;
        let mut log = self.read_execution_log()?;
        let out = f(&mut log)?;
        self.write_execution_log(&log)?;
        Ok(out)
    }

    /// Insert or replace the execution log entry for one task.
    pub fn record_execution(&self, task_id: &str, entry: ExecutionEntry) -> Result<()> {
        self.update_execution_log(|log| {
            log.executions.insert(task_id.to_string(), entry);
            Ok(())
        })
    }

    /// Remove the queue and execution log files.
    pub fn clear(&self) -> Result<()> {
        for path in [&self.queue_path, &self.log_path] {
            remove_if_exists(path)?;
        }
        Ok(())
    }

    fn guard_path(&self, file: &str) -> PathBuf {
        let stem = file.trim_end_matches(".json");
        self.root.join(format!(".{stem}.guard"))
    }
}

/// Short-lived exclusive guard around a read-modify-write cycle.
struct StoreGuard {
    path: PathBuf,
}

impl StoreGuard {
    fn acquire(path: &Path) -> Result<Self> {
        ensure_parent_dir(path)?;
        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(_) => {
                    return Ok(Self {
                        path: path.to_path_buf(),
                    })
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if file_age(path).is_some_and(|age| age > GUARD_STALE) {
                        warn!(path = %path.display(), "removing abandoned store guard");
                        remove_if_exists(path)?;
                        continue;
                    }
                }
                Err(err) => return Err(SwarmError::store(path, err)),
            }

            if start.elapsed() >= GUARD_WAIT {
                return Err(SwarmError::store(
                    path,
                    std::io::Error::new(
                        ErrorKind::TimedOut,
                        format!("store guard still held after {}s", GUARD_WAIT.as_secs()),
                    ),
                ));
            }
            std::thread::sleep(GUARD_RETRY);
        }
    }
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove store guard");
            }
        }
    }
}

fn read_json_or_default<T>(path: &Path, what: &str) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(T::default()),
        Err(err) if err.kind() == ErrorKind::InvalidData => {
            warn!(path = %path.display(), "{what} file is not valid UTF-8; treating as empty");
            return Ok(T::default());
        }
        Err(err) => return Err(SwarmError::store(path, err)),
    };

    match serde_json::from_str(&text) {
        Ok(value) => Ok(value),
        Err(err) => {
            warn!(
                path = %path.display(),
                error = %err,
                "{what} file is corrupt; treating as empty"
            );
            Ok(T::default())
        }
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut body = serde_json::to_vec_pretty(value)
        .map_err(|err| SwarmError::store(path, std::io::Error::new(ErrorKind::InvalidData, err)))?;
    body.push(b'\n');
    write_atomic(path, &body)
}

/// Replace `path` with `contents` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_parent_dir(path)?;
    let tmp = temp_sibling(path);
    let result = (|| -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&tmp);
        return Err(SwarmError::store(path, err));
    }
    Ok(())
}

/// Create the directory holding `path` on first write.
pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => {
            fs::create_dir_all(dir).map_err(|err| SwarmError::store(dir, err))
        }
        _ => Ok(()),
    }
}

/// Unique hidden temp path in the same directory as `path`.
pub(crate) fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let suffix: u64 = rand::random();
    path.with_file_name(format!(".{name}.{}.{suffix:016x}.tmp", std::process::id()))
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(SwarmError::store(path, err)),
    }
}

pub(crate) fn file_age(path: &Path) -> Option<Duration> {
    fs::metadata(path).ok()?.modified().ok()?.elapsed().ok()
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
