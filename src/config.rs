//! Explicit runtime configuration.
//!
//! Every component takes a [`SwarmConfig`] (or values derived from it) at
//! construction time; nothing reads paths or timeouts from process globals, so
//! several independent queues can live side by side in one process.
//!
//! Resolution order:
//! 1. built-in defaults
//! 2. YAML file (`--config PATH`, else `./swarm.yaml` when present)
//! 3. `SWARM_*` environment overrides
//! 4. explicit CLI flags (applied by the caller)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SwarmError};

pub const DEFAULT_CONFIG_FILE: &str = "swarm.yaml";
pub const DEFAULT_WORKSPACE: &str = ".swarm";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SwarmConfig {
    /// Directory holding `queue.json`, `execution_log.json` and `locks/`.
    pub workspace: PathBuf,
    pub stale_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub idle_threshold: u32,
    pub task_timeout_secs: u64,
    pub max_iterations: Option<u64>,
    /// Orchestrator-side wall-clock bound for one worker process.
    pub worker_timeout_secs: Option<u64>,
    pub output_tail_lines: usize,
    pub backend: Option<BackendSpec>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from(DEFAULT_WORKSPACE),
            stale_timeout_secs: 300,
            poll_interval_ms: 2_000,
            idle_threshold: 10,
            task_timeout_secs: 600,
            max_iterations: None,
            worker_timeout_secs: None,
            output_tail_lines: 20,
            backend: None,
        }
    }
}

/// How workers reach the external execution backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", deny_unknown_fields)]
pub enum BackendSpec {
    /// Run a local program; the instruction is written to its stdin.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// POST the request as JSON to `endpoint`.
    Http {
        endpoint: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        /// Name of an env var holding a bearer token.
        #[serde(default)]
        auth_env: Option<String>,
    },
}

impl SwarmConfig {
    /// Load configuration, honoring the documented resolution order up to and
    /// including environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.is_file() {
                    Self::from_file(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            SwarmError::validation(format!(
                "failed to read config file '{}': {err}",
                path.display()
            ))
        })?;
        let cfg = Self::from_yaml(&text).map_err(|err| match err {
            SwarmError::Validation(msg) => {
                SwarmError::validation(format!("{msg} (in '{}')", path.display()))
            }
            other => other,
        })?;
        debug!(path = %path.display(), "loaded config file");
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        // An empty file is a valid "all defaults" document.
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
            .map_err(|err| SwarmError::validation(format!("invalid config: {err}")))
    }

    /// Apply `SWARM_*` overrides using `lookup` as the environment source.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ws) = lookup("SWARM_WORKSPACE") {
            if !ws.trim().is_empty() {
                self.workspace = PathBuf::from(ws);
            }
        }
        if let Some(v) = env_u64(&lookup, "SWARM_STALE_TIMEOUT_SECS")? {
            self.stale_timeout_secs = v;
        }
        if let Some(v) = env_u64(&lookup, "SWARM_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = v;
        }
        if let Some(v) = env_u64(&lookup, "SWARM_IDLE_THRESHOLD")? {
            self.idle_threshold = u32::try_from(v).map_err(|_| {
                SwarmError::validation(format!("invalid SWARM_IDLE_THRESHOLD: '{v}' is too large"))
            })?;
        }
        if let Some(v) = env_u64(&lookup, "SWARM_TASK_TIMEOUT_SECS")? {
            self.task_timeout_secs = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.workspace.as_os_str().is_empty() {
            return Err(SwarmError::validation("workspace must not be empty"));
        }
        let positive = [
            ("stale_timeout_secs", self.stale_timeout_secs),
            ("poll_interval_ms", self.poll_interval_ms),
            ("idle_threshold", u64::from(self.idle_threshold)),
            ("task_timeout_secs", self.task_timeout_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SwarmError::validation(format!(
                    "{name} must be a positive integer (got 0)"
                )));
            }
        }
        if self.worker_timeout_secs == Some(0) {
            return Err(SwarmError::validation(
                "worker_timeout_secs must be a positive integer when set",
            ));
        }
        if self.max_iterations == Some(0) {
            return Err(SwarmError::validation(
                "max_iterations must be a positive integer when set",
            ));
        }
        if self.task_timeout_secs > self.stale_timeout_secs {
            debug!(
                task_timeout_secs = self.task_timeout_secs,
                stale_timeout_secs = self.stale_timeout_secs,
                "task timeout exceeds lock staleness window; long tasks will show stale locks in status"
            );
        }
        Ok(())
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn worker_timeout(&self) -> Option<Duration> {
        self.worker_timeout_secs.map(Duration::from_secs)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.workspace.join("locks")
    }
}

fn env_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let parsed: u64 = raw.trim().parse().map_err(|_| {
        SwarmError::validation(format!("invalid {key}: '{raw}' (must be a positive integer)"))
    })?;
    if parsed == 0 {
        return Err(SwarmError::validation(format!(
            "invalid {key}: '{raw}' (must be a positive integer)"
        )));
    }
    Ok(Some(parsed))
}
