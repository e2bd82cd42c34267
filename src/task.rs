use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SwarmError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Intensity {
    Low,
    #[default]
    Medium,
    High,
}

impl Intensity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Intensity::Low => "low",
            Intensity::Medium => "medium",
            Intensity::High => "high",
        }
    }
}

impl fmt::Display for Intensity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Intensity {
    type Err = SwarmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Intensity::Low),
            "medium" => Ok(Intensity::Medium),
            "high" => Ok(Intensity::High),
            other => Err(SwarmError::validation(format!(
                "invalid intensity '{other}' (expected one of: low, medium, high)"
            ))),
        }
    }
}

/// One unit of work in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    /// Free-form category label, used for routing and reporting only.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub instruction: String,
    pub budget_min: f64,
    pub budget_max: f64,
    #[serde(default)]
    pub intensity: Intensity,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    /// Field-level checks that do not need the rest of the queue.
    pub fn validate(&self) -> Result<()> {
        validate_task_id(&self.id)?;
        if self.kind.trim().is_empty() {
            return Err(SwarmError::validation(format!(
                "task '{}' has an empty type",
                self.id
            )));
        }
        if !self.budget_min.is_finite() || !self.budget_max.is_finite() {
            return Err(SwarmError::validation(format!(
                "task '{}' budget must be a finite number",
                self.id
            )));
        }
        if self.budget_min <= 0.0 {
            return Err(SwarmError::validation(format!(
                "task '{}' budget_min must be > 0 (got {})",
                self.id, self.budget_min
            )));
        }
        if self.budget_max < self.budget_min {
            return Err(SwarmError::validation(format!(
                "task '{}' budget_max ({}) must be >= budget_min ({})",
                self.id, self.budget_max, self.budget_min
            )));
        }
        if self.depends_on.iter().any(|dep| dep == &self.id) {
            return Err(SwarmError::validation(format!(
                "task '{}' cannot depend on itself",
                self.id
            )));
        }
        Ok(())
    }
}

pub fn validate_task_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(SwarmError::validation("task id must not be empty"));
    }
    if id.trim() != id || id.chars().any(char::is_control) {
        return Err(SwarmError::validation(format!(
            "task id '{}' must not contain leading/trailing whitespace or control characters",
            id.escape_debug()
        )));
    }
    Ok(())
}

/// Persisted queue contents: the ordered task list plus the completed/failed
/// id lists kept in step with it for quick filtering.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub completed: Vec<String>,
    #[serde(default)]
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed
    }
}

impl QueueState {
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Insert a new pending task after validating it against the queue.
    pub fn insert(&mut self, mut task: Task) -> Result<()> {
        task.validate()?;
        if self.contains(&task.id) {
            return Err(SwarmError::validation(format!(
                "task '{}' already exists in the queue",
                task.id
            )));
        }

        task.depends_on.sort();
        task.depends_on.dedup();
        let unknown: Vec<&str> = task
            .depends_on
            .iter()
            .filter(|dep| !self.contains(dep))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(SwarmError::validation(format!(
                "task '{}' depends on unknown task(s): {} (add them first)",
                task.id,
                unknown.join(", ")
            )));
        }

        task.status = TaskStatus::Pending;
        self.tasks.push(task);
        if let Err(err) = validate_acyclic(&self.tasks) {
            self.tasks.pop();
            return Err(err);
        }
        Ok(())
    }

    /// True when every dependency of `task` is present and `completed`.
    pub fn dependencies_met(&self, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            self.get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        })
    }

    pub fn is_eligible(&self, task: &Task) -> bool {
        task.status == TaskStatus::Pending && self.dependencies_met(task)
    }

    /// Claimable tasks in stable queue order.
    pub fn eligible(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(move |t| self.is_eligible(t))
    }

    /// Set a task's status and keep the completed/failed lists in step.
    /// Returns false when no task has that id.
    pub fn set_status(&mut self, id: &str, status: TaskStatus) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        task.status = status;
        self.reindex();
        true
    }

    /// Rebuild the completed/failed id lists from task statuses.
    pub fn reindex(&mut self) {
        self.completed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.id.clone())
            .collect();
        self.failed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.id.clone())
            .collect();
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for task in &self.tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

/// Reject dependency graphs that contain a cycle (Kahn's algorithm).
pub fn validate_acyclic(tasks: &[Task]) -> Result<()> {
    let mut indegree: HashMap<&str, usize> = HashMap::new();
    let mut outgoing: HashMap<&str, Vec<&str>> = HashMap::new();

    for task in tasks {
        indegree.entry(task.id.as_str()).or_insert(0);
        outgoing.entry(task.id.as_str()).or_default();
    }

    for task in tasks {
        for dep in &task.depends_on {
            // Dangling references are reported by insert(); they cannot form a cycle.
            if !indegree.contains_key(dep.as_str()) {
                continue;
            }
            *indegree.entry(task.id.as_str()).or_insert(0) += 1;
            outgoing
                .entry(dep.as_str())
                .or_default()
                .push(task.id.as_str());
        }
    }

    let mut queue: VecDeque<&str> = indegree
        .iter()
        .filter_map(|(id, &deg)| if deg == 0 { Some(*id) } else { None })
        .collect();

    let mut seen = 0usize;
    while let Some(id) = queue.pop_front() {
        seen += 1;
        for next in outgoing.get(id).into_iter().flatten() {
            if let Some(deg) = indegree.get_mut(next) {
                *deg -= 1;
                if *deg == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if seen != indegree.len() {
        let mut stuck: Vec<&str> = indegree
            .iter()
            .filter_map(|(id, &deg)| if deg > 0 { Some(*id) } else { None })
            .collect();
        stuck.sort();
        return Err(SwarmError::validation(format!(
            "task dependencies contain a cycle involving: {}",
            stuck.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn mk_task(id: &str, deps: &[&str]) -> Task {
    Task {
        id: id.to_string(),
        kind: "build".to_string(),
        instruction: format!("do {id}"),
        budget_min: 0.5,
        budget_max: 2.0,
        intensity: Intensity::Medium,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        status: TaskStatus::Pending,
    }
}
