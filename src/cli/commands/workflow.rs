use std::sync::Arc;

use crate::error::Result;
use crate::git::{MergeOutcome, MergeStrategy};
use crate::workflow::orchestrator::Orchestrator;

use super::{parse_age, parse_workflow_id};

/// `quorum workflow merge <id>`: fold a finished workflow's branch into its
/// base. Kept separate from run completion on purpose.
pub struct MergeCommand {
    pub id: String,
    pub strategy: String,
}

impl MergeCommand {
    pub async fn execute(self, orchestrator: Arc<Orchestrator>) -> Result<()> {
        let id = parse_workflow_id(&self.id)?;
        let strategy = MergeStrategy::parse(&self.strategy)?;
        match orchestrator.merge(&id, strategy).await? {
            MergeOutcome::FastForward(tip) => {
                println!("fast-forwarded base to {}", &tip[..tip.len().min(8)])
            }
            MergeOutcome::Merged(commit) => {
                println!("merged as {}", &commit[..commit.len().min(8)])
            }
            MergeOutcome::UpToDate => println!("base already contains the workflow branch"),
            MergeOutcome::Conflict(files) => {
                println!("merge conflicts in: {}", files.join(", "));
                return Err(crate::error::QuorumError::MergeConflict {
                    task_id: id.to_string(),
                    files,
                });
            }
        }
        Ok(())
    }
}

/// `quorum workflow cleanup [id] [--older=AGE]`.
pub struct CleanupCommand {
    pub id: Option<String>,
    pub older: Option<String>,
}

impl CleanupCommand {
    pub async fn execute(self, orchestrator: Arc<Orchestrator>) -> Result<()> {
        let mut removed: u64 = 0;
        if let Some(raw) = self.id {
            let id = parse_workflow_id(&raw)?;
            removed += orchestrator.cleanup(&id).await? as u64;
        }
        if let Some(raw) = self.older {
            let age = parse_age(&raw)?;
            removed += orchestrator.cleanup_older_than(age).await?;
        }
        println!("cleaned up {removed} item(s)");
        Ok(())
    }
}
