use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::{OutputMode, QuorumConfig};
use crate::events::{EventPayload, EventSubscriber};
use crate::workflow::orchestrator::Orchestrator;
use crate::workflow::types::{WorkflowId, WorkflowStatus};

pub mod control;
pub mod list;
pub mod run;
pub mod serve;
pub mod status;
pub mod workflow;

/// Root of the repository the command operates on, discovered from CWD.
pub fn repo_root() -> Result<PathBuf> {
    let repo = git2::Repository::discover(".")
        .context("not inside a git repository (quorum needs one to work in)")?;
    let root = repo
        .workdir()
        .context("bare repositories are not supported")?
        .to_path_buf();
    Ok(root)
}

/// Build the orchestrator for one CLI invocation and run the start-up zombie
/// sweep.
pub async fn bootstrap(config: QuorumConfig) -> Result<Arc<Orchestrator>> {
    let root = repo_root()?;
    let orchestrator = Orchestrator::bootstrap(&root, config).await?;
    let recovered = orchestrator.recover_zombies().await?;
    for id in &recovered {
        eprintln!("! recovered zombie workflow {id} (paused; resume to continue)");
    }
    Ok(orchestrator)
}

pub fn parse_workflow_id(raw: &str) -> Result<WorkflowId, crate::error::QuorumError> {
    WorkflowId::parse(raw)
}

/// `30s`, `45m`, `24h`, `7d`.
pub fn parse_age(raw: &str) -> Result<Duration, crate::error::QuorumError> {
    let raw = raw.trim();
    let (number, unit) = raw.split_at(raw.len().saturating_sub(1));
    let value: u64 = number.parse().map_err(|_| {
        crate::error::QuorumError::validation(format!("bad duration '{raw}' (use 30s/45m/24h/7d)"))
    })?;
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        "d" => value * 86400,
        _ => {
            return Err(crate::error::QuorumError::validation(format!(
                "bad duration unit in '{raw}' (use s, m, h or d)"
            )))
        }
    };
    Ok(Duration::from_secs(seconds))
}

/// Follow one workflow's events until it reaches a terminal event, printing
/// per the output mode. Returns the terminal status it observed.
pub async fn follow_events(
    mut subscriber: EventSubscriber,
    id: WorkflowId,
    mode: OutputMode,
) -> Option<WorkflowStatus> {
    loop {
        let envelope = subscriber.recv().await?;
        if envelope.workflow_id != id
            && !matches!(envelope.payload, EventPayload::DroppedEvents { .. })
        {
            continue;
        }
        match mode {
            OutputMode::Quiet => {}
            OutputMode::Json => {
                if let Ok(line) = serde_json::to_string(&envelope) {
                    println!("{line}");
                }
            }
            OutputMode::Plain => print_plain(&envelope.payload),
        }
        match &envelope.payload {
            EventPayload::WorkflowCompleted { .. } => return Some(WorkflowStatus::Completed),
            EventPayload::WorkflowFailed { .. } => return Some(WorkflowStatus::Failed),
            EventPayload::WorkflowStateUpdated { status, .. }
                if matches!(status, WorkflowStatus::Paused | WorkflowStatus::Cancelled) =>
            {
                return Some(*status)
            }
            _ => {}
        }
    }
}

fn print_plain(payload: &EventPayload) {
    match payload {
        EventPayload::WorkflowStarted { title } => println!("workflow started: {title}"),
        EventPayload::PhaseStarted { phase, replan } => {
            if *replan {
                println!("phase {phase} (replan)");
            } else {
                println!("phase {phase}");
            }
        }
        EventPayload::TaskCreated { task_id, name, .. } => println!("  plan: {task_id} {name}"),
        EventPayload::TaskStarted { task_id, attempt } => {
            if *attempt > 0 {
                println!("  task {task_id} started (retry {attempt})");
            } else {
                println!("  task {task_id} started");
            }
        }
        EventPayload::TaskCompleted { task_id, commit } => match commit {
            Some(commit) => println!("  task {task_id} completed ({})", &commit[..commit.len().min(8)]),
            None => println!("  task {task_id} completed (no changes)"),
        },
        EventPayload::TaskFailed { task_id, error, .. } => {
            println!("  task {task_id} FAILED: {error}")
        }
        EventPayload::TaskSkipped { task_id, reason } => {
            println!("  task {task_id} skipped ({reason})")
        }
        EventPayload::WorkflowCompleted { metrics } => println!(
            "workflow completed ({} tasks, {} tokens out)",
            metrics.tasks_completed, metrics.tokens_out
        ),
        EventPayload::WorkflowFailed { kind, message, .. } => {
            println!("workflow FAILED [{kind}]: {message}")
        }
        EventPayload::WorkflowStateUpdated { status, phase } => {
            if matches!(status, WorkflowStatus::Paused | WorkflowStatus::Cancelled) {
                println!("workflow {} (phase {phase})", status.as_str());
            }
        }
        EventPayload::DroppedEvents { count } => {
            eprintln!("! display fell behind, {count} events dropped")
        }
        EventPayload::Log { level, message } if level == "warn" || level == "error" => {
            eprintln!("  [{level}] {message}")
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn age_parsing() {
        assert_eq!(parse_age("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_age("45m").unwrap(), Duration::from_secs(2700));
        assert_eq!(parse_age("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_age("7d").unwrap(), Duration::from_secs(604800));
        assert!(parse_age("7w").is_err());
        assert!(parse_age("d").is_err());
        assert!(parse_age("").is_err());
    }
}
