//! Per-task mutual exclusion built only on atomic filesystem operations.
//!
//! A task is claimed while `locks/<encoded id>.lock` exists. The file's
//! contents (`worker_id`, `started_at`) are only consulted to decide
//! staleness and for diagnostics.
//!
//! Lock files are published with `hard_link` from a fully written private temp
//! file, which has `O_CREAT|O_EXCL` semantics and guarantees readers never see
//! a half-written lock. Breaking a stale lock is itself serialized by a
//! per-lock breaker file, so two workers that both judge a lock stale cannot
//! both end up holding a fresh one.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::SwarmConfig;
use crate::error::{Result, SwarmError};
use crate::store::{ensure_parent_dir, file_age, remove_if_exists, temp_sibling};

pub const LOCK_EXTENSION: &str = "lock";

/// How long an unparseable lock file is given to finish being written before
/// it counts as stale. Only the `create_new` fallback can expose one.
const UNPARSEABLE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
}

/// A lock file found on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct HeldLock {
    pub task_id: String,
    /// `None` when the contents could not be parsed.
    pub record: Option<LockRecord>,
    pub stale: bool,
}

impl HeldLock {
    pub fn age(&self) -> Option<Duration> {
        let record = self.record.as_ref()?;
        Utc::now()
            .signed_duration_since(record.started_at)
            .to_std()
            .ok()
    }
}

#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    stale_timeout: Duration,
}

impl LockManager {
    pub fn new(config: &SwarmConfig) -> Result<Self> {
        Self::at(config.locks_dir(), config.stale_timeout())
    }

    /// The lock directory is created on the first claim, not here.
    pub fn at(dir: impl Into<PathBuf>, stale_timeout: Duration) -> Result<Self> {
        Ok(Self {
            dir: dir.into(),
            stale_timeout,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stale_timeout(&self) -> Duration {
        self.stale_timeout
    }

    pub fn lock_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(lock_file_name(task_id))
    }

    fn breaker_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!(".{}.break", encode_task_id(task_id)))
    }

    /// Attempt to claim `task_id` for `worker_id`.
    ///
    /// Returns `Ok(false)` when another worker holds a fresh lock or wins a
    /// race for a stale one; that is an expected outcome, not an error.
    pub fn try_acquire(&self, task_id: &str, worker_id: &str) -> Result<bool> {
        let path = self.lock_path(task_id);
        if self.create_exclusive(&path, worker_id)? {
            info!(task_id, worker_id, "lock acquired");
            return Ok(true);
        }

        let Some(raw) = read_contents(&path)? else {
            // Released between our create attempt and the read.
            return self.create_exclusive(&path, worker_id);
        };

        if !self.is_stale_file(&path, &raw) {
            debug!(task_id, worker_id, "lock held by another worker");
            return Ok(false);
        }

        let won = self.reclaim(task_id, &path, worker_id)?;
        if won {
            info!(task_id, worker_id, "stale lock reclaimed");
        }
        Ok(won)
    }

    /// Scoped form of [`try_acquire`](Self::try_acquire): the returned guard
    /// releases the lock when dropped, on every exit path.
    pub fn acquire(&self, task_id: &str, worker_id: &str) -> Result<Option<LockGuard<'_>>> {
        if self.try_acquire(task_id, worker_id)? {
            Ok(Some(LockGuard {
                manager: self,
                task_id: task_id.to_string(),
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Delete the lock for `task_id`. Releasing an absent lock is a no-op.
    pub fn release(&self, task_id: &str) -> Result<()> {
        remove_if_exists(&self.lock_path(task_id))?;
        debug!(task_id, "lock released");
        Ok(())
    }

    /// True when `raw` lock contents are unparseable, lack a usable
    /// `started_at`, or are older than the staleness window.
    pub fn is_stale(&self, raw: &str) -> bool {
        match parse_started_at(raw) {
            Some(started) => Utc::now()
                .signed_duration_since(started)
                .to_std()
                .map(|age| age > self.stale_timeout)
                // A timestamp in the future is clock skew, not abandonment.
                .unwrap_or(false),
            None => true,
        }
    }

    /// Staleness of the lock file at `path` whose contents are `raw`. An
    /// unparseable file younger than the grace period may still be mid-write.
    fn is_stale_file(&self, path: &Path, raw: &str) -> bool {
        if parse_started_at(raw).is_some() {
            return self.is_stale(raw);
        }
        let grace = UNPARSEABLE_GRACE.min(self.stale_timeout);
        file_age(path).map_or(true, |age| age > grace)
    }

    pub fn read(&self, task_id: &str) -> Result<Option<HeldLock>> {
        let path = self.lock_path(task_id);
        let Some(raw) = read_contents(&path)? else {
            return Ok(None);
        };
        Ok(Some(HeldLock {
            task_id: task_id.to_string(),
            record: serde_json::from_str(&raw).ok(),
            stale: self.is_stale_file(&path, &raw),
        }))
    }

    pub fn is_locked(&self, task_id: &str) -> bool {
        self.lock_path(task_id).exists()
    }

    /// Every lock currently on disk, sorted by task id.
    pub fn list(&self) -> Result<Vec<HeldLock>> {
        let mut out = Vec::new();
        for name in self.lock_file_names()? {
            let Some(task_id) = decode_lock_file_name(&name) else {
                warn!(file = %name, "ignoring lock file with undecodable name");
                continue;
            };
            if let Some(lock) = self.read(&task_id)? {
                out.push(lock);
            }
        }
        out.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(out)
    }

    /// Remove every lock file plus leftover breaker/temp files. Returns the
    /// number of locks removed.
    pub fn clear(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(SwarmError::store(&self.dir, err)),
        };
        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|err| SwarmError::store(&self.dir, err))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_lock = !name.starts_with('.') && name.ends_with(".lock");
            if is_lock || name.ends_with(".break") || name.ends_with(".tmp") {
                remove_if_exists(&entry.path())?;
                if is_lock {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn lock_file_names(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(SwarmError::store(&self.dir, err)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| SwarmError::store(&self.dir, err))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with('.') && name.ends_with(".lock") {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn reclaim(&self, task_id: &str, path: &Path, worker_id: &str) -> Result<bool> {
        let breaker = self.breaker_path(task_id);
        match OpenOptions::new().write(true).create_new(true).open(&breaker) {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                // Someone else is breaking this lock. A breaker that outlived the
                // staleness window belongs to a crashed worker; clear it so a
                // later poll can proceed.
                if file_age(&breaker).is_some_and(|age| age > self.stale_timeout) {
                    warn!(task_id, "removing abandoned lock breaker");
                    remove_if_exists(&breaker)?;
                }
                return Ok(false);
            }
            Err(err) => return Err(SwarmError::store(&breaker, err)),
        }
        let _breaker = RemoveOnDrop(breaker);

        match read_contents(path)? {
            None => {}
            Some(current) if self.is_stale_file(path, &current) => {
                let holder = serde_json::from_str::<LockRecord>(&current)
                    .map(|r| r.worker_id)
                    .unwrap_or_else(|_| "<unreadable>".to_string());
                warn!(task_id, worker_id, holder = %holder, "breaking stale lock");
                remove_if_exists(path)?;
            }
            Some(_) => return Ok(false),
        }

        self.create_exclusive(path, worker_id)
    }

    fn create_exclusive(&self, path: &Path, worker_id: &str) -> Result<bool> {
        let record = LockRecord {
            worker_id: worker_id.to_string(),
            started_at: Utc::now(),
        };
        let mut body = serde_json::to_vec_pretty(&record).map_err(|err| {
            SwarmError::store(path, std::io::Error::new(ErrorKind::InvalidData, err))
        })?;
        body.push(b'\n');

        ensure_parent_dir(path)?;
        let tmp = temp_sibling(path);
        let written = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()
        })();
        if let Err(err) = written {
            let _ = fs::remove_file(&tmp);
            return Err(SwarmError::store(&tmp, err));
        }

        let result = match fs::hard_link(&tmp, path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => {
                debug!(error = %err, "hard_link unavailable; falling back to create_new");
                create_new_with(path, &body)
            }
        };
        let _ = fs::remove_file(&tmp);
        result
    }
}

/// Releases its lock when dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    manager: &'a LockManager,
    task_id: String,
    released: bool,
}

impl LockGuard<'_> {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Release now and surface any error instead of logging it on drop.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.manager.release(&self.task_id)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.manager.release(&self.task_id) {
            warn!(task_id = %self.task_id, error = %err, "failed to release lock");
        }
    }
}

struct RemoveOnDrop(PathBuf);

impl Drop for RemoveOnDrop {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.0);
    }
}

fn create_new_with(path: &Path, body: &[u8]) -> Result<bool> {
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => return Ok(false),
        Err(err) => return Err(SwarmError::store(path, err)),
    };
    if let Err(err) = file.write_all(body).and_then(|()| file.sync_all()) {
        let _ = fs::remove_file(path);
        return Err(SwarmError::store(path, err));
    }
    Ok(true)
}

fn read_contents(path: &Path) -> Result<Option<String>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(SwarmError::store(path, err)),
    }
}

/// Accepts RFC 3339 strings and Unix-epoch seconds.
fn parse_started_at(raw: &str) -> Option<DateTime<Utc>> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    match value.get("started_at")? {
        serde_json::Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        serde_json::Value::Number(n) => {
            let secs = n.as_f64()?;
            if !secs.is_finite() {
                return None;
            }
            Utc.timestamp_millis_opt((secs * 1000.0) as i64).single()
        }
        _ => None,
    }
}

/// Deterministic, reversible file name for a task id.
pub fn lock_file_name(task_id: &str) -> String {
    format!("{}.{LOCK_EXTENSION}", encode_task_id(task_id))
}

fn encode_task_id(task_id: &str) -> String {
    let mut out = String::with_capacity(task_id.len());
    for (idx, b) in task_id.bytes().enumerate() {
        let keep = b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || (b == b'.' && idx > 0);
        if keep {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

pub fn decode_lock_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".lock")?;
    let raw = stem.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'%' {
            let hex = stem.get(i + 1..i + 3)?;
            bytes.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(bytes).ok()
}
