use std::sync::Arc;

use tracing::debug;

use crate::config::OutputMode;
use crate::error::{QuorumError, Result};
use crate::workflow::orchestrator::{CreateOptions, Orchestrator};

use super::follow_events;

/// `quorum run <prompt>`: create a workflow and drive it to a terminal
/// state, streaming events to the terminal.
pub struct RunCommand {
    pub prompt: String,
    pub title: Option<String>,
    pub base_branch: Option<String>,
    pub agent: Option<String>,
    pub model: Option<String>,
    pub max_parallel: Option<usize>,
    pub detach: bool,
}

impl RunCommand {
    pub async fn execute(self, orchestrator: Arc<Orchestrator>, mode: OutputMode) -> Result<()> {
        let id = orchestrator
            .create(CreateOptions {
                prompt: self.prompt,
                title: self.title,
                base_branch: self.base_branch,
                max_parallel_tasks: self.max_parallel,
                agent: self.agent,
                model: self.model,
            })
            .await?;

        if self.detach {
            orchestrator.start(&id, false).await?;
            println!("{id}");
            return Ok(());
        }

        // Subscribe before starting so the first events are not missed.
        let subscriber = orchestrator.subscribe();
        let follower = tokio::spawn(follow_events(subscriber, id.clone(), mode));
        let handle = orchestrator
            .start(&id, false)
            .await?
            .ok_or_else(|| QuorumError::fatal("background start returned no handle"))?;
        let result = handle.wait().await;

        // Terminal events are published before the runner returns; give the
        // printer a moment to drain them.
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), follower).await;
        debug!(workflow_id = %id, "run finished");

        if mode == OutputMode::Quiet {
            println!("{id}");
        }
        result
    }
}
