use std::sync::Arc;

use crate::config::OutputMode;
use crate::error::{QuorumError, Result};
use crate::workflow::orchestrator::Orchestrator;

use super::{follow_events, parse_workflow_id};

/// `quorum resume <id>`: pick a paused workflow back up and follow it.
pub struct ResumeCommand {
    pub id: String,
}

impl ResumeCommand {
    pub async fn execute(self, orchestrator: Arc<Orchestrator>, mode: OutputMode) -> Result<()> {
        let id = parse_workflow_id(&self.id)?;
        let subscriber = orchestrator.subscribe();
        let follower = tokio::spawn(follow_events(subscriber, id.clone(), mode));
        let handle = orchestrator
            .resume(&id, false)
            .await?
            .ok_or_else(|| QuorumError::fatal("background resume returned no handle"))?;
        let result = handle.wait().await;
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), follower).await;
        result
    }
}

/// `quorum pause <id>`: request a cooperative pause.
pub struct PauseCommand {
    pub id: String,
}

impl PauseCommand {
    pub async fn execute(self, orchestrator: Arc<Orchestrator>) -> Result<()> {
        let id = parse_workflow_id(&self.id)?;
        orchestrator.pause(&id).await?;
        println!("pause requested for {id}; takes effect at the next task boundary");
        Ok(())
    }
}

/// `quorum cancel <id>`: cancel, idempotently.
pub struct CancelCommand {
    pub id: String,
}

impl CancelCommand {
    pub async fn execute(self, orchestrator: Arc<Orchestrator>) -> Result<()> {
        let id = parse_workflow_id(&self.id)?;
        orchestrator.cancel(&id).await?;
        println!("cancel requested for {id}");
        Ok(())
    }
}
