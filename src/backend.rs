use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::BackendSpec;
use crate::error::SwarmError;
use crate::task::{Intensity, Task};

/// What a worker hands to the execution backend for one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionRequest {
    pub task_id: String,
    pub instruction: String,
    pub budget_min: f64,
    pub budget_max: f64,
    pub intensity: Intensity,
    #[serde(skip)]
    pub timeout: Duration,
}

impl ExecutionRequest {
    pub fn for_task(task: &Task, timeout: Duration) -> Self {
        Self {
            task_id: task.id.clone(),
            instruction: task.instruction.clone(),
            budget_min: task.budget_min,
            budget_max: task.budget_max,
            intensity: task.intensity,
            timeout,
        }
    }
}

/// What the backend reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub success: bool,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn ok(cost: f64, output: impl Into<String>) -> Self {
        Self {
            success: true,
            cost,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            cost: 0.0,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// The opaque, possibly slow, possibly failing collaborator that performs
/// the work described by a task.
///
/// Implementations may honor `req.timeout` themselves; the worker enforces it
/// regardless. Returning `SwarmError::ExecutionTimeout` (wrapped in
/// `anyhow::Error`) classifies the failure as a timeout.
pub trait Backend: Send + Sync {
    fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionOutcome>;
}

pub fn build_backend(spec: &BackendSpec) -> Result<Box<dyn Backend>> {
    match spec {
        BackendSpec::Command { program, args } => {
            if program.trim().is_empty() {
                return Err(anyhow!("command backend requires a non-empty program"));
            }
            Ok(Box::new(CommandBackend::new(program.clone(), args.clone())))
        }
        BackendSpec::Http {
            endpoint,
            headers,
            auth_env,
        } => {
            if endpoint.trim().is_empty() {
                return Err(anyhow!("http backend requires a non-empty endpoint"));
            }
            Ok(Box::new(HttpBackend {
                endpoint: endpoint.clone(),
                headers: headers.clone(),
                auth_env: auth_env.clone(),
            }))
        }
    }
}

/// Runs a local program per task. The instruction goes to stdin; budget and
/// identity are exported as `SWARM_*` env vars.
#[derive(Debug, Clone)]
pub struct CommandBackend {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandBackend {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl Backend for CommandBackend {
    fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("SWARM_TASK_ID", &req.task_id)
            .env("SWARM_BUDGET_MIN", req.budget_min.to_string())
            .env("SWARM_BUDGET_MAX", req.budget_max.to_string())
            .env("SWARM_INTENSITY", req.intensity.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn backend command '{}'", self.program))?;

        let stdout = child
            .stdout
            .take()
            .context("failed to open stdout for backend command")?;
        let stderr = child
            .stderr
            .take()
            .context("failed to open stderr for backend command")?;

        // Drain stdout/stderr concurrently to avoid deadlock if the child fills pipe buffers.
        let out_handle = thread::spawn(move || -> std::io::Result<Vec<u8>> {
            let mut r = stdout;
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            Ok(buf)
        });
        let err_handle = thread::spawn(move || -> std::io::Result<Vec<u8>> {
            let mut r = stderr;
            let mut buf = Vec::new();
            r.read_to_end(&mut buf)?;
            Ok(buf)
        });

        {
            let mut stdin = child
                .stdin
                .take()
                .context("failed to open stdin for backend command")?;
            // A backend that ignores stdin may exit before reading it.
            if let Err(err) = stdin.write_all(req.instruction.as_bytes()) {
                if err.kind() != std::io::ErrorKind::BrokenPipe {
                    let _ = child.kill();
                    return Err(err).context("failed writing instruction to backend stdin");
                }
            }
        }

        let start = Instant::now();
        let status = loop {
            if let Some(status) = child
                .try_wait()
                .context("failed waiting for backend command")?
            {
                break status;
            }

            if start.elapsed() >= req.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SwarmError::ExecutionTimeout(req.timeout).into());
            }

            thread::sleep(Duration::from_millis(10));
        };

        let out_buf = out_handle
            .join()
            .map_err(|_| anyhow!("stdout reader thread panicked"))?
            .context("failed reading backend stdout")?;
        let err_buf = err_handle
            .join()
            .map_err(|_| anyhow!("stderr reader thread panicked"))?
            .context("failed reading backend stderr")?;

        if !status.success() {
            let stderr = String::from_utf8_lossy(&err_buf);
            return Ok(ExecutionOutcome::failed(format!(
                "backend command failed (exit={:?}): {}",
                status.code(),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&out_buf).into_owned();
        Ok(parse_command_output(&stdout))
    }
}

/// A JSON outcome on stdout is taken as-is; anything else is plain output.
fn parse_command_output(stdout: &str) -> ExecutionOutcome {
    let trimmed = stdout.trim();
    if trimmed.starts_with('{') {
        if let Ok(outcome) = serde_json::from_str::<ExecutionOutcome>(trimmed) {
            return outcome;
        }
    }
    ExecutionOutcome::ok(0.0, stdout.trim_end())
}

#[derive(Debug, Clone)]
pub struct HttpBackend {
    endpoint: String,
    headers: HashMap<String, String>,
    auth_env: Option<String>,
}

impl Backend for HttpBackend {
    fn execute(&self, req: &ExecutionRequest) -> Result<ExecutionOutcome> {
        let client = reqwest::blocking::Client::builder()
            .timeout(req.timeout)
            .build()
            .context("failed to build http client")?;

        let mut builder = client
            .post(&self.endpoint)
            .header("Content-Type", "application/json");

        for (k, v) in self.headers.iter() {
            builder = builder.header(k, v);
        }

        if let Some(var) = &self.auth_env {
            let token =
                env::var(var).map_err(|_| anyhow!("missing required auth env var '{var}'"))?;
            builder = builder.bearer_auth(token);
        }

        let resp = builder.json(req).send().map_err(|err| {
            if err.is_timeout() {
                anyhow::Error::from(SwarmError::ExecutionTimeout(req.timeout))
            } else {
                anyhow!("http backend request failed: {err}")
            }
        })?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().unwrap_or_default();
            let trimmed: String = text.trim().chars().take(200).collect();
            return Err(anyhow!(
                "http backend returned non-success status {status}: {trimmed}"
            ));
        }

        resp.json::<ExecutionOutcome>()
            .context("http backend response was not a valid outcome JSON")
    }
}
