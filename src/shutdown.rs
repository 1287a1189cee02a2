use std::sync::Arc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::workflow::orchestrator::Orchestrator;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Graceful shutdown for long-lived invocations (`serve`, detached runs):
/// waits for SIGINT/SIGTERM, cancels active runners, then drains with a
/// bounded timeout so a wedged agent cannot hold the process hostage.
pub struct ShutdownCoordinator {
    orchestrator: Arc<Orchestrator>,
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new(orchestrator: Arc<Orchestrator>, token: CancellationToken) -> Self {
        ShutdownCoordinator {
            orchestrator,
            token,
        }
    }

    /// Block until a termination signal (or an external cancel), then run
    /// the shutdown sequence.
    pub async fn wait_and_shutdown(self) {
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to install SIGINT handler: {e}");
                self.token.cancelled().await;
                self.drain().await;
                return;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!("failed to install SIGTERM handler: {e}");
                self.token.cancelled().await;
                self.drain().await;
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => info!("received SIGINT"),
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = self.token.cancelled() => {}
        }
        self.token.cancel();
        self.drain().await;
    }

    async fn drain(&self) {
        info!("shutting down: cancelling active workflows");
        if timeout(DRAIN_TIMEOUT, self.orchestrator.shutdown())
            .await
            .is_err()
        {
            warn!("shutdown drain timed out after {DRAIN_TIMEOUT:?}");
        }
        info!("shutdown complete");
    }
}
