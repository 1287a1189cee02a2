use std::sync::Arc;

use crate::config::OutputMode;
use crate::error::{QuorumError, Result};
use crate::workflow::orchestrator::Orchestrator;
use crate::workflow::types::{Workflow, WorkflowBranchInfo, WorkflowStatus};

use super::parse_workflow_id;

/// `quorum status [id]`: detail for one workflow, or the latest one.
pub struct StatusCommand {
    pub id: Option<String>,
    /// Honors the configured color setting and the NO_COLOR convention.
    pub color: bool,
}

impl StatusCommand {
    pub async fn execute(self, orchestrator: Arc<Orchestrator>, mode: OutputMode) -> Result<()> {
        let color = self.color;
        let workflow = match self.id {
            Some(raw) => orchestrator.get(&parse_workflow_id(&raw)?).await?,
            None => orchestrator
                .list_all(None)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| QuorumError::not_found("no workflows yet"))?,
        };

        let branch_info = if workflow.workflow_branch.is_some() {
            orchestrator.branch_info(&workflow.id).await.ok()
        } else {
            None
        };

        match mode {
            OutputMode::Json => {
                println!("{}", serde_json::to_string_pretty(&workflow)?);
            }
            OutputMode::Quiet => {
                println!("{} {}", workflow.id, workflow.status.as_str());
            }
            OutputMode::Plain => print_detail(&workflow, branch_info.as_ref(), color),
        }
        Ok(())
    }
}

fn paint(status: WorkflowStatus, color: bool) -> String {
    if !color {
        return status.as_str().to_string();
    }
    let code = match status {
        WorkflowStatus::Completed => "32",
        WorkflowStatus::Failed => "31",
        WorkflowStatus::Running => "36",
        WorkflowStatus::Paused => "33",
        WorkflowStatus::Cancelled => "35",
        WorkflowStatus::Pending => "37",
    };
    format!("\x1b[{code}m{}\x1b[0m", status.as_str())
}

fn print_detail(wf: &Workflow, branch_info: Option<&WorkflowBranchInfo>, color: bool) {
    println!("{}  [{}]", wf.id, paint(wf.status, color));
    println!("  title:   {}", wf.title);
    println!("  phase:   {}", wf.current_phase);
    println!("  base:    {}", wf.base_branch);
    if let Some(branch) = &wf.workflow_branch {
        match branch_info {
            Some(info) => println!(
                "  branch:  {branch} [{}] {}",
                info.status.as_str(),
                info.head_commit.as_deref().unwrap_or("-")
            ),
            None => println!("  branch:  {branch}"),
        }
    }
    println!("  resumes: {}/{}", wf.resume_count, wf.max_resumes);
    if let Some(err) = &wf.last_error {
        println!("  note:    {err}");
    }
    if !wf.tasks.is_empty() {
        println!("  tasks:");
        for id in wf.ordered_task_ids() {
            if let Some(task) = wf.tasks.get(&id) {
                println!(
                    "    {:<12} {:<9} {} ({})",
                    task.id,
                    task.status.as_str(),
                    task.name,
                    task.agent
                );
            }
        }
    }
    println!(
        "  usage:   {} in / {} out tokens, ${:.4}",
        wf.metrics.tokens_in, wf.metrics.tokens_out, wf.metrics.cost_usd
    );
}
