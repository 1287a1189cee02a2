use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::agents::{AgentKind, AgentRegistry, CliAgent, RateLimiterRegistry};
use crate::config::QuorumConfig;
use crate::error::{QuorumError, Result};
use crate::events::{EventBus, EventPayload, EventSubscriber};
use crate::git::{GitClient, MergeOutcome, MergeStrategy, WorktreeManager};
use crate::store::StateStore;
use crate::workflow::context::{ControlPlane, WorkflowContext};
use crate::workflow::phases::PhaseRegistry;
use crate::workflow::runner::{RunnerCall, RunnerSettings, WorkflowRunner};
use crate::workflow::types::{
    BranchStatus, Workflow, WorkflowBranchInfo, WorkflowId, WorkflowOptions, WorkflowStatus,
};

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub prompt: String,
    pub title: Option<String>,
    pub base_branch: Option<String>,
    pub max_parallel_tasks: Option<usize>,
    pub agent: Option<String>,
    pub model: Option<String>,
}

/// Completion handle for a workflow started in the background.
#[derive(Debug)]
pub struct WorkflowHandle {
    pub id: WorkflowId,
    join: tokio::task::JoinHandle<Result<()>>,
}

impl WorkflowHandle {
    pub async fn wait(self) -> Result<()> {
        self.join
            .await
            .map_err(|e| QuorumError::fatal(format!("workflow runner panicked: {e}")))?
    }
}

struct ActiveRun {
    control: Arc<ControlPlane>,
}

/// Single entry point for every presentation surface.
///
/// Owns the in-memory map of active runners and the global concurrency cap;
/// everything durable is read through the store.
pub struct Orchestrator {
    store: Arc<StateStore>,
    agents: Arc<AgentRegistry>,
    rate_limits: Arc<RateLimiterRegistry>,
    git: GitClient,
    worktrees: WorktreeManager,
    bus: Arc<EventBus>,
    phases: Arc<PhaseRegistry>,
    config: QuorumConfig,
    active: Mutex<HashMap<WorkflowId, ActiveRun>>,
    repo_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Orchestrator {
    /// Wire up the whole stack rooted at a repository: store under
    /// `.quorum/`, built-in agent adapters, process-global rate limits.
    pub async fn bootstrap(repo_root: &Path, config: QuorumConfig) -> Result<Arc<Self>> {
        let agents = AgentRegistry::empty();
        let kill_grace = Duration::from_secs(config.cancel_grace_secs);
        for kind in AgentKind::BUILTIN {
            let mut agent = CliAgent::new(&kind).with_kill_grace(kill_grace);
            if let Some(model) = &config.default_model {
                agent = agent.with_model(model.clone());
            }
            if let Some(secs) = config.agent_timeouts.get(kind.name()) {
                agent = agent.with_timeout(Duration::from_secs(*secs));
            }
            agents.register(kind.name(), Arc::new(agent));
        }
        let rate_limits = RateLimiterRegistry::new(config.rate_limit_overrides());
        Self::new(
            Arc::new(StateStore::open(repo_root).await?),
            agents,
            rate_limits,
            GitClient::new(repo_root),
            WorktreeManager::new(repo_root),
            EventBus::with_default_capacity(),
            config,
        )
    }

    /// Assemble from explicit components. Tests inject scripted agents here.
    pub fn new(
        store: Arc<StateStore>,
        agents: Arc<AgentRegistry>,
        rate_limits: Arc<RateLimiterRegistry>,
        git: GitClient,
        worktrees: WorktreeManager,
        bus: Arc<EventBus>,
        config: QuorumConfig,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Orchestrator {
            store,
            agents,
            rate_limits,
            git,
            worktrees,
            bus,
            phases: PhaseRegistry::with_default_runners(),
            config,
            active: Mutex::new(HashMap::new()),
            repo_lock: Arc::new(tokio::sync::Mutex::new(())),
        }))
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn subscribe(&self) -> EventSubscriber {
        self.bus.subscribe()
    }

    pub fn config(&self) -> &QuorumConfig {
        &self.config
    }

    // ---- lifecycle ------------------------------------------------------

    pub async fn create(&self, opts: CreateOptions) -> Result<WorkflowId> {
        if opts.prompt.trim().is_empty() {
            return Err(QuorumError::validation("prompt must not be empty"));
        }
        let base_branch = match opts.base_branch.or_else(|| self.config.base_branch.clone()) {
            Some(branch) => branch,
            None => self.git.default_branch()?,
        };
        let title = opts
            .title
            .unwrap_or_else(|| derive_title(&opts.prompt));

        let mut workflow = Workflow::new(opts.prompt, title, base_branch);
        workflow.max_resumes = self.config.max_resumes;
        workflow.options = WorkflowOptions {
            max_parallel_tasks: opts
                .max_parallel_tasks
                .unwrap_or(self.config.max_parallel_tasks),
            worktrees_enabled: self.config.worktrees_enabled,
            agent: opts
                .agent
                .unwrap_or_else(|| self.config.default_agent.clone()),
            model: opts.model.or_else(|| self.config.default_model.clone()),
            auto_merge_on_success: self.config.auto_merge_on_success,
        };
        self.store.save_workflow(&workflow).await?;
        info!(workflow_id = %workflow.id, "created workflow");
        Ok(workflow.id)
    }

    /// Start a created workflow. `sync` runs inline and returns when the
    /// pipeline finishes; otherwise a completion handle comes back.
    pub async fn start(
        self: &Arc<Self>,
        id: &WorkflowId,
        sync: bool,
    ) -> Result<Option<WorkflowHandle>> {
        let handle = self.spawn_runner(id, RunnerCall::Run)?;
        if sync {
            handle.wait().await?;
            Ok(None)
        } else {
            Ok(Some(handle))
        }
    }

    pub async fn resume(
        self: &Arc<Self>,
        id: &WorkflowId,
        sync: bool,
    ) -> Result<Option<WorkflowHandle>> {
        let handle = self.spawn_runner(id, RunnerCall::Resume)?;
        if sync {
            handle.wait().await?;
            Ok(None)
        } else {
            Ok(Some(handle))
        }
    }

    /// Run the pipeline up to and including analyze, inline.
    pub async fn analyze(self: &Arc<Self>, id: &WorkflowId) -> Result<()> {
        self.spawn_runner(id, RunnerCall::Analyze)?.wait().await
    }

    /// Run the pipeline up to and including plan, inline.
    pub async fn plan(self: &Arc<Self>, id: &WorkflowId) -> Result<()> {
        self.spawn_runner(id, RunnerCall::Plan)?.wait().await
    }

    /// Force a fresh plan pass; completed tasks survive.
    pub async fn replan(self: &Arc<Self>, id: &WorkflowId) -> Result<()> {
        self.spawn_runner(id, RunnerCall::Replan)?.wait().await
    }

    /// Pause takes effect at the next task/phase boundary. Erroring on a
    /// non-running workflow is deliberate.
    pub async fn pause(&self, id: &WorkflowId) -> Result<()> {
        {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(run) = active.get(id) {
                run.control.request_pause();
                info!(workflow_id = %id, "pause requested");
                return Ok(());
            }
        }
        // Not active here: distinguish unknown from merely not running.
        let workflow = self.store.load_workflow(id).await?;
        Err(QuorumError::validation(format!(
            "workflow {id} is {}, not running",
            workflow.status.as_str()
        )))
    }

    /// Cancel is idempotent: running workflows get their context cancelled,
    /// dormant ones are marked cancelled directly, finished ones are left be.
    pub async fn cancel(&self, id: &WorkflowId) -> Result<()> {
        {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(run) = active.get(id) {
                run.control.cancel();
                info!(workflow_id = %id, "cancel requested");
                return Ok(());
            }
        }
        let mut workflow = self.store.load_workflow(id).await?;
        if workflow.status.is_terminal() {
            return Ok(());
        }
        workflow.transition(WorkflowStatus::Cancelled)?;
        self.store.save_workflow(&workflow).await?;
        self.bus
            .publish(
                id,
                EventPayload::WorkflowStateUpdated {
                    status: workflow.status,
                    phase: workflow.current_phase,
                },
            )
            .await;
        Ok(())
    }

    // ---- queries --------------------------------------------------------

    pub async fn get(&self, id: &WorkflowId) -> Result<Workflow> {
        self.store.load_workflow(id).await
    }

    /// Snapshot of workflows with a live runner in this process.
    pub async fn list_active(&self) -> Result<Vec<Workflow>> {
        let ids: Vec<WorkflowId> = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.keys().cloned().collect()
        };
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(wf) = self.store.get_workflow(&id).await? {
                out.push(wf);
            }
        }
        Ok(out)
    }

    pub async fn list_all(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>> {
        self.store.list_workflows(status).await
    }

    /// Branch bookkeeping for one workflow, resolved against the repository.
    pub async fn branch_info(&self, id: &WorkflowId) -> Result<WorkflowBranchInfo> {
        let workflow = self.store.load_workflow(id).await?;
        let (head_commit, status) = match &workflow.workflow_branch {
            Some(branch) if self.git.branch_exists(branch)? => {
                let head = self.git.branch_tip(branch)?;
                let status = if self.git.is_merged_into(branch, &workflow.base_branch)? {
                    BranchStatus::Merged
                } else if workflow.status.is_terminal() {
                    BranchStatus::Stale
                } else {
                    BranchStatus::Active
                };
                (Some(head), status)
            }
            _ => (None, BranchStatus::Stale),
        };
        Ok(crate::store::branch_info(&workflow, head_commit, status))
    }

    // ---- git integration ------------------------------------------------

    /// Merge a finished workflow's branch into its base. Deliberately a
    /// separate, explicit step; auto-merge on success is config opt-in.
    pub async fn merge(&self, id: &WorkflowId, strategy: MergeStrategy) -> Result<MergeOutcome> {
        let workflow = self.store.load_workflow(id).await?;
        if !matches!(
            workflow.status,
            WorkflowStatus::Completed | WorkflowStatus::Failed
        ) {
            return Err(QuorumError::validation(format!(
                "workflow {id} is {}, merge requires completed or failed",
                workflow.status.as_str()
            )));
        }
        let branch = workflow.workflow_branch.clone().ok_or_else(|| {
            QuorumError::validation(format!("workflow {id} never created a branch"))
        })?;
        self.git
            .merge_with_strategy(&workflow.base_branch, &branch, strategy)
    }

    /// Drop a finished workflow's worktrees and fully-merged task branches.
    pub async fn cleanup(&self, id: &WorkflowId) -> Result<usize> {
        let workflow = self.store.load_workflow(id).await?;
        if !matches!(
            workflow.status,
            WorkflowStatus::Completed | WorkflowStatus::Failed
        ) {
            return Err(QuorumError::validation(format!(
                "workflow {id} is {}, cleanup requires completed or failed",
                workflow.status.as_str()
            )));
        }
        let mut removed = self.worktrees.remove_workflow_worktrees(id)?;
        if let Some(wf_branch) = &workflow.workflow_branch {
            for task in workflow.tasks.values() {
                if let Some(branch) = &task.branch {
                    if self.git.branch_exists(branch)?
                        && self.git.is_merged_into(branch, wf_branch)?
                    {
                        self.git.delete_branch(branch)?;
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Purge terminal workflows older than `age` and sweep stale worktrees.
    pub async fn cleanup_older_than(&self, age: Duration) -> Result<u64> {
        let purged = self.store.purge_terminal_older_than(age).await?;
        let swept = self.worktrees.cleanup_stale()?;
        Ok(purged + swept as u64)
    }

    // ---- crash recovery -------------------------------------------------

    /// Start-up pass: anything marked running whose heartbeat went stale is
    /// parked as paused with a recovery hint. Never auto-resumes.
    pub async fn recover_zombies(&self) -> Result<Vec<WorkflowId>> {
        let threshold = Duration::from_secs(self.config.zombie_threshold_secs);
        let zombies = self.store.find_zombies(threshold).await?;
        let mut recovered = Vec::with_capacity(zombies.len());
        for mut workflow in zombies {
            warn!(workflow_id = %workflow.id, "recovering zombie workflow");
            workflow.last_error = Some(
                "runner heartbeat went stale; paused for manual resume".to_string(),
            );
            workflow.transition(WorkflowStatus::Paused)?;
            self.store.save_workflow(&workflow).await?;
            self.store.locks().force_release(&workflow.id)?;
            self.bus
                .publish(
                    &workflow.id,
                    EventPayload::WorkflowStateUpdated {
                        status: workflow.status,
                        phase: workflow.current_phase,
                    },
                )
                .await;
            recovered.push(workflow.id.clone());
        }
        Ok(recovered)
    }

    /// Cancel every active runner and close the store. Used by the graceful
    /// shutdown path.
    pub async fn shutdown(&self) {
        let controls: Vec<Arc<ControlPlane>> = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.values().map(|r| Arc::clone(&r.control)).collect()
        };
        for control in controls {
            control.cancel();
        }
        self.store.shutdown().await;
    }

    // ---- internals ------------------------------------------------------

    fn build_context(&self, control: Arc<ControlPlane>) -> WorkflowContext {
        WorkflowContext {
            store: Arc::clone(&self.store),
            agents: Arc::clone(&self.agents),
            rate_limits: Arc::clone(&self.rate_limits),
            git: self.git.clone(),
            worktrees: self.worktrees.clone(),
            bus: Arc::clone(&self.bus),
            control,
            max_tasks_ceiling: self.config.max_concurrent_tasks_per_workflow,
            repo_lock: Arc::clone(&self.repo_lock),
        }
    }

    fn spawn_runner(self: &Arc<Self>, id: &WorkflowId, call: RunnerCall) -> Result<WorkflowHandle> {
        let control = {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.contains_key(id) {
                return Err(QuorumError::AlreadyRunning(id.to_string()));
            }
            if active.len() >= self.config.max_concurrent_workflows {
                return Err(QuorumError::MaxConcurrent {
                    limit: self.config.max_concurrent_workflows,
                });
            }
            let control = ControlPlane::new();
            active.insert(
                id.clone(),
                ActiveRun {
                    control: Arc::clone(&control),
                },
            );
            control
        };

        let runner = WorkflowRunner::new(
            self.build_context(control),
            Arc::clone(&self.phases),
            RunnerSettings {
                heartbeat_interval: Duration::from_secs(self.config.heartbeat_interval_secs),
                ..RunnerSettings::default()
            },
        );
        let this = Arc::clone(self);
        let workflow_id = id.clone();
        let join = tokio::spawn(async move {
            let result = runner.execute(&workflow_id, call).await;
            this.active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&workflow_id);
            if let Err(e) = &result {
                warn!(workflow_id = %workflow_id, "runner call ended with error: {e}");
            }
            result
        });
        Ok(WorkflowHandle {
            id: id.clone(),
            join,
        })
    }
}

fn derive_title(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or(prompt).trim();
    let mut title: String = first_line.chars().take(60).collect();
    if first_line.chars().count() > 60 {
        title.push('…');
    }
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn titles_derive_from_first_line() {
        assert_eq!(derive_title("add /health endpoint"), "add /health endpoint");
        assert_eq!(derive_title("line one\nline two"), "line one");
        let long = "x".repeat(100);
        let title = derive_title(&long);
        assert_eq!(title.chars().count(), 61);
        assert!(title.ends_with('…'));
    }
}
