use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::QuorumConfig;
use crate::error::Result;
use crate::http;
use crate::shutdown::ShutdownCoordinator;
use crate::workflow::orchestrator::Orchestrator;

/// `quorum serve`: host the HTTP API until SIGINT/SIGTERM.
pub struct ServeCommand {
    pub bind: Option<String>,
}

impl ServeCommand {
    pub async fn execute(self, orchestrator: Arc<Orchestrator>, config: &QuorumConfig) -> Result<()> {
        let bind = self.bind.unwrap_or_else(|| config.http.bind.clone());
        let shutdown = CancellationToken::new();

        let coordinator = ShutdownCoordinator::new(Arc::clone(&orchestrator), shutdown.clone());
        let signal_task = tokio::spawn(coordinator.wait_and_shutdown());

        http::serve(Arc::clone(&orchestrator), &bind, shutdown.clone()).await?;
        shutdown.cancel();
        let _ = signal_task.await;
        info!("http api stopped");
        Ok(())
    }
}
