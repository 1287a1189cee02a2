use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::store::write_atomic;
use crate::workflow::types::Workflow;

/// Write `.quorum/runs/<id>/report.md` for a finished (or stopped) workflow.
/// Rendering is intentionally plain markdown; richer report formats belong
/// to consumers.
pub fn write_report(runs_dir: &Path, workflow: &Workflow) -> Result<PathBuf> {
    let dir = runs_dir.join(workflow.id.as_str());
    fs::create_dir_all(&dir)?;
    let path = dir.join("report.md");
    write_atomic(&path, render(workflow).as_bytes())?;
    Ok(path)
}

fn render(wf: &Workflow) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# {}", wf.title);
    let _ = writeln!(out);
    let _ = writeln!(out, "- workflow: `{}`", wf.id);
    let _ = writeln!(out, "- status: **{}**", wf.status.as_str());
    let _ = writeln!(out, "- phase reached: {}", wf.current_phase);
    let _ = writeln!(out, "- base branch: `{}`", wf.base_branch);
    if let Some(branch) = &wf.workflow_branch {
        let _ = writeln!(out, "- workflow branch: `{branch}`");
    }
    let _ = writeln!(out, "- created: {}", wf.created_at.to_rfc3339());
    let _ = writeln!(out, "- updated: {}", wf.updated_at.to_rfc3339());
    let _ = writeln!(out, "- resumes: {}/{}", wf.resume_count, wf.max_resumes);
    if let Some(err) = &wf.last_error {
        let _ = writeln!(out, "- last error: {err}");
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Prompt");
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", wf.original_prompt);
    if let Some(optimized) = &wf.optimized_prompt {
        if optimized != &wf.original_prompt {
            let _ = writeln!(out);
            let _ = writeln!(out, "Refined:");
            let _ = writeln!(out);
            let _ = writeln!(out, "{optimized}");
        }
    }

    if !wf.tasks.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Tasks");
        let _ = writeln!(out);
        let _ = writeln!(out, "| task | status | agent | retries | commit |");
        let _ = writeln!(out, "|---|---|---|---|---|");
        for id in wf.ordered_task_ids() {
            if let Some(task) = wf.tasks.get(&id) {
                let _ = writeln!(
                    out,
                    "| {} — {} | {} | {} | {} | {} |",
                    task.id,
                    task.name,
                    task.status.as_str(),
                    task.agent,
                    task.retries,
                    task.last_commit.as_deref().unwrap_or("-"),
                );
            }
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Usage");
    let _ = writeln!(out);
    let _ = writeln!(out, "- tokens in: {}", wf.metrics.tokens_in);
    let _ = writeln!(out, "- tokens out: {}", wf.metrics.tokens_out);
    let _ = writeln!(out, "- cost: ${:.4}", wf.metrics.cost_usd);
    let _ = writeln!(
        out,
        "- tasks: {} completed, {} failed, {} skipped",
        wf.metrics.tasks_completed, wf.metrics.tasks_failed, wf.metrics.tasks_skipped
    );
    if !wf.metrics.phase_seconds.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "| phase | seconds |");
        let _ = writeln!(out, "|---|---|");
        for (phase, secs) in &wf.metrics.phase_seconds {
            let _ = writeln!(out, "| {phase} | {secs:.1} |");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Task, TaskStatus};
    use tempfile::TempDir;

    #[test]
    fn report_lands_in_runs_dir_and_lists_tasks() {
        let dir = TempDir::new().unwrap();
        let mut wf = Workflow::new("add /health endpoint", "health endpoint", "main");
        wf.workflow_branch = Some(format!("quorum/{}", wf.id));
        let mut t1 = Task::new("t1", "write handler", "claude");
        t1.status = TaskStatus::Completed;
        t1.last_commit = Some("abc1234".into());
        wf.install_plan(vec![t1], false);

        let path = write_report(dir.path(), &wf).unwrap();
        assert!(path.ends_with(format!("{}/report.md", wf.id)));
        let body = fs::read_to_string(&path).unwrap();
        assert!(body.contains("# health endpoint"));
        assert!(body.contains("| t1 — write handler | completed | claude | 0 | abc1234 |"));
        assert!(body.contains("add /health endpoint"));
    }

    #[test]
    fn rewriting_report_is_safe() {
        let dir = TempDir::new().unwrap();
        let wf = Workflow::new("p", "t", "main");
        write_report(dir.path(), &wf).unwrap();
        write_report(dir.path(), &wf).unwrap();
    }
}
