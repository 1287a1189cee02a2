use std::sync::Arc;

use crate::config::OutputMode;
use crate::error::Result;
use crate::workflow::orchestrator::Orchestrator;
use crate::workflow::types::WorkflowStatus;

/// `quorum list [--active] [--status=...]`.
pub struct ListCommand {
    pub active: bool,
    pub status: Option<String>,
}

impl ListCommand {
    pub async fn execute(self, orchestrator: Arc<Orchestrator>, mode: OutputMode) -> Result<()> {
        let status = self
            .status
            .as_deref()
            .map(WorkflowStatus::parse)
            .transpose()?;
        let workflows = if self.active {
            orchestrator.list_active().await?
        } else {
            orchestrator.list_all(status).await?
        };

        match mode {
            OutputMode::Json => {
                let rows: Vec<serde_json::Value> = workflows
                    .iter()
                    .map(|wf| {
                        serde_json::json!({
                            "id": wf.id,
                            "title": wf.title,
                            "status": wf.status,
                            "phase": wf.current_phase,
                            "tasks": wf.tasks.len(),
                            "updated_at": wf.updated_at,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
            }
            OutputMode::Quiet => {
                for wf in &workflows {
                    println!("{}", wf.id);
                }
            }
            OutputMode::Plain => {
                if workflows.is_empty() {
                    println!("no workflows");
                    return Ok(());
                }
                for wf in &workflows {
                    println!(
                        "{}  {:<9} {:<8} {:>3} tasks  {}",
                        wf.id,
                        wf.status.as_str(),
                        wf.current_phase.as_str(),
                        wf.tasks.len(),
                        wf.title
                    );
                }
            }
        }
        Ok(())
    }
}
