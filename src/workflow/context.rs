use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agents::{AgentRegistry, RateLimiterRegistry};
use crate::events::EventBus;
use crate::git::{GitClient, WorktreeManager};
use crate::store::StateStore;

/// Cooperative control surface for one workflow run.
///
/// Cancellation propagates through the token into every blocking point; the
/// pause flag is only consulted at checkpoints (between tasks, between
/// phases) and never interrupts in-flight work.
#[derive(Debug)]
pub struct ControlPlane {
    cancel: CancellationToken,
    pause_requested: AtomicBool,
}

impl ControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(ControlPlane {
            cancel: CancellationToken::new(),
            pause_requested: AtomicBool::new(false),
        })
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    pub fn request_pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    pub fn pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    pub fn clear_pause(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }
}

/// Everything a phase runner (and the executor underneath it) may touch.
/// Handed to each phase by the runner; phases never reach around it.
#[derive(Clone)]
pub struct WorkflowContext {
    pub store: Arc<StateStore>,
    pub agents: Arc<AgentRegistry>,
    pub rate_limits: Arc<RateLimiterRegistry>,
    pub git: GitClient,
    pub worktrees: WorktreeManager,
    pub bus: Arc<EventBus>,
    pub control: Arc<ControlPlane>,
    /// Hard ceiling on per-workflow task parallelism, above any per-workflow
    /// option.
    pub max_tasks_ceiling: usize,
    /// Process-wide mutex over the primary working tree. Tasks that run
    /// without a worktree (isolation disabled or degraded) hold this across
    /// their whole checkout, agent run and commit, since they share one
    /// working directory and index.
    pub repo_lock: Arc<tokio::sync::Mutex<()>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_flag_is_sticky_until_cleared() {
        let control = ControlPlane::new();
        assert!(!control.pause_requested());
        control.request_pause();
        assert!(control.pause_requested());
        control.clear_pause();
        assert!(!control.pause_requested());
    }

    #[test]
    fn child_tokens_follow_parent_cancel() {
        let control = ControlPlane::new();
        let child = control.child_token();
        assert!(!child.is_cancelled());
        control.cancel();
        assert!(child.is_cancelled());
        assert!(control.is_cancelled());
    }
}
