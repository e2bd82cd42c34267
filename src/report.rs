//! Plain-text rendering for the CLI. Stable, line-oriented and diff-friendly,
//! so tests can match on it.

use std::fmt::Write;
use std::time::Duration;

use crate::config::BackendSpec;
use crate::orchestrator::{ClearSummary, StatusReport, SwarmPlan, SwarmReport};
use crate::task::{StatusCounts, Task};

pub fn describe_backend(spec: &BackendSpec) -> String {
    match spec {
        BackendSpec::Command { program, args } if args.is_empty() => format!("command {program}"),
        BackendSpec::Command { program, args } => format!("command {program} {}", args.join(" ")),
        BackendSpec::Http { endpoint, .. } => format!("http {endpoint}"),
    }
}

fn counts_line(counts: &StatusCounts) -> String {
    format!(
        "pending={} in_progress={} completed={} failed={} total={}",
        counts.pending,
        counts.in_progress,
        counts.completed,
        counts.failed,
        counts.total()
    )
}

fn task_line(task: &Task) -> String {
    let mut line = format!(
        "{} type={} status={} budget={:.2}..{:.2} intensity={}",
        task.id, task.kind, task.status, task.budget_min, task.budget_max, task.intensity
    );
    if !task.depends_on.is_empty() {
        let _ = write!(line, " depends_on={}", task.depends_on.join(","));
    }
    line
}

pub fn format_elapsed(d: Duration) -> String {
    format!("{:.2}s", d.as_secs_f64())
}

pub fn render_plan(plan: &SwarmPlan) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "DRY RUN: nothing will be spawned or written");
    let _ = writeln!(out, "Workers:  {}", plan.workers);
    let _ = writeln!(out, "Backend:  {}", plan.backend);
    let _ = writeln!(out, "Tasks:    {}", counts_line(&plan.counts));
    let _ = writeln!(out, "Eligible: {}", plan.eligible);
    if plan.preview.is_empty() {
        let _ = writeln!(out, "Queue:    (nothing to run)");
    } else {
        let _ = writeln!(out, "Queue (first {}):", plan.preview.len());
        for (idx, task) in plan.preview.iter().enumerate() {
            let _ = writeln!(out, "  {idx}. {}", task_line(task));
        }
    }
    out
}

pub fn render_swarm_report(report: &SwarmReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "SWARM REPORT workers={} elapsed={}",
        report.workers.len(),
        format_elapsed(report.elapsed)
    );
    for w in &report.workers {
        let code = w
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let _ = writeln!(
            out,
            "  {} state={} exit={} elapsed={}",
            w.worker_id,
            w.state.as_str(),
            code,
            format_elapsed(w.elapsed)
        );
        for line in &w.output_tail {
            let _ = writeln!(out, "    | {line}");
        }
    }
    let _ = writeln!(out, "Tasks: {}", counts_line(&report.counts));
    let verdict = if report.is_success() {
        "all workers exited cleanly"
    } else {
        "one or more workers failed"
    };
    let _ = writeln!(out, "Result: {verdict}");
    out
}

pub fn render_status(status: &StatusReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Tasks: {}", counts_line(&status.counts));
    let _ = writeln!(
        out,
        "Executions: total={} in_progress={} completed={} failed={}",
        status.log.total, status.log.in_progress, status.log.completed, status.log.failed
    );

    if !status.failed.is_empty() {
        let _ = writeln!(out, "Failed tasks:");
        for f in &status.failed {
            let _ = writeln!(
                out,
                "  {} worker={} error={}",
                f.id,
                f.worker_id.as_deref().unwrap_or("-"),
                f.error.as_deref().unwrap_or("(no detail)")
            );
        }
    }

    let _ = writeln!(out, "Active locks: {}", status.locks.len());
    for lock in &status.locks {
        let holder = lock
            .record
            .as_ref()
            .map(|r| r.worker_id.as_str())
            .unwrap_or("<corrupt>");
        let age = lock
            .age()
            .map(|d| format!("{}s", d.as_secs()))
            .unwrap_or_else(|| "?".to_string());
        let stale = if lock.stale { " STALE" } else { "" };
        let _ = writeln!(out, "  {} worker={holder} age={age}{stale}", lock.task_id);
    }

    if !status.orphaned.is_empty() {
        let _ = writeln!(
            out,
            "Orphaned (in_progress without a live lock, see `swarm requeue`): {}",
            status.orphaned.join(", ")
        );
    }
    out
}

pub fn render_clear(summary: &ClearSummary) -> String {
    format!(
        "Cleared {} task(s), {} execution record(s), {} lock(s)\n",
        summary.tasks, summary.executions, summary.locks
    )
}
