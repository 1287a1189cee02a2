pub mod graph;

use chrono::Utc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::agents::{AgentResult, InvokeRequest};
use crate::error::{QuorumError, Result};
use crate::events::EventPayload;
use crate::git::{CommitResult, MergeOutcome, WorktreeInfo};
use crate::workflow::context::WorkflowContext;
use crate::workflow::types::{Checkpoint, Phase, TaskStatus, Workflow, WorkflowId};

const STREAM_CHUNK_LIMIT: usize = 2000;

/// How an execute pass ended when no error propagated.
#[derive(Debug, PartialEq, Eq)]
pub enum ExecuteOutcome {
    Completed,
    /// A pause request took effect at a task boundary; pending work remains.
    Paused,
}

struct SuccessParts {
    usage: AgentResult,
    commit: Option<CommitResult>,
}

struct TaskRunOutput {
    task_id: String,
    worktree: Option<WorktreeInfo>,
    degraded: bool,
    outcome: Result<SuccessParts>,
}

/// Dependency-aware scheduler for the execute phase.
///
/// Scheduling rules: a task runs only when every dependency completed; up to
/// `max_parallel_tasks` run at once (capped by the per-workflow ceiling and,
/// indirectly, the per-agent rate limiter); eligible tasks drain in
/// `task_order`; each retry gets a fresh worktree; merging into the workflow
/// branch is serialized on the scheduler loop so concurrent tasks never race
/// the workflow branch ref. Tasks running without a worktree (isolation off
/// or degraded) additionally hold the repo lock for their whole
/// checkout-run-commit sequence, since they share the primary working tree.
pub struct Executor {
    ctx: WorkflowContext,
}

impl Executor {
    pub fn new(ctx: WorkflowContext) -> Self {
        Executor { ctx }
    }

    pub async fn run(&self, wf: &mut Workflow) -> Result<ExecuteOutcome> {
        graph::validate_plan(wf)?;
        let workflow_branch = wf
            .workflow_branch
            .clone()
            .ok_or_else(|| QuorumError::fatal("execute phase reached without a workflow branch"))?;
        let parallel = wf
            .options
            .max_parallel_tasks
            .clamp(1, self.ctx.max_tasks_ceiling.max(1));
        debug!(workflow_id = %wf.id, parallel, "starting task execution");

        let mut running: JoinSet<TaskRunOutput> = JoinSet::new();
        let mut first_failure: Option<QuorumError> = None;

        loop {
            loop {
                let doomed = graph::doomed_ids(wf);
                if doomed.is_empty() {
                    break;
                }
                for (id, dep) in doomed {
                    self.mark_skipped(wf, &id, &dep).await?;
                }
            }

            let cancelled = self.ctx.control.is_cancelled();
            let pausing = self.ctx.control.pause_requested();

            if !cancelled && !pausing {
                let mut eligible = graph::eligible_ids(wf);
                while running.len() < parallel && !eligible.is_empty() {
                    let id = eligible.remove(0);
                    self.start_task(wf, &id, &workflow_branch, &mut running)
                        .await?;
                }
            }

            if running.is_empty() {
                if cancelled {
                    return Err(QuorumError::Cancelled);
                }
                if !graph::has_schedulable_work(wf) {
                    break;
                }
                if pausing {
                    info!(workflow_id = %wf.id, "pause taking effect between tasks");
                    return Ok(ExecuteOutcome::Paused);
                }
                if graph::eligible_ids(wf).is_empty() && graph::doomed_ids(wf).is_empty() {
                    return Err(QuorumError::fatal(
                        "scheduler stalled: pending tasks but nothing eligible",
                    ));
                }
                continue;
            }

            if let Some(joined) = running.join_next().await {
                let output =
                    joined.map_err(|e| QuorumError::fatal(format!("task worker panicked: {e}")))?;
                self.finalize(wf, output, &workflow_branch, &mut first_failure)
                    .await?;
            }
        }

        if let Some(err) = first_failure {
            return Err(err);
        }
        Ok(ExecuteOutcome::Completed)
    }

    async fn start_task(
        &self,
        wf: &mut Workflow,
        id: &str,
        workflow_branch: &str,
        running: &mut JoinSet<TaskRunOutput>,
    ) -> Result<()> {
        let prompt_base = wf
            .optimized_prompt
            .clone()
            .unwrap_or_else(|| wf.original_prompt.clone());
        let workflow_id = wf.id.clone();
        let worktrees_enabled = wf.options.worktrees_enabled;

        let task = wf
            .tasks
            .get_mut(id)
            .ok_or_else(|| QuorumError::not_found(format!("task {id}")))?;
        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        task.error = None;
        let attempt = task.retries;
        let snapshot = task.clone();
        self.ctx.store.save_task(&workflow_id, task).await?;
        self.ctx
            .bus
            .publish(
                &workflow_id,
                EventPayload::TaskStarted {
                    task_id: id.to_string(),
                    attempt,
                },
            )
            .await;

        let ctx = self.ctx.clone();
        let workflow_branch = workflow_branch.to_string();
        running.spawn(async move {
            run_one(
                ctx,
                workflow_id,
                snapshot,
                prompt_base,
                worktrees_enabled,
                workflow_branch,
            )
            .await
        });
        Ok(())
    }

    async fn finalize(
        &self,
        wf: &mut Workflow,
        output: TaskRunOutput,
        workflow_branch: &str,
        first_failure: &mut Option<QuorumError>,
    ) -> Result<()> {
        let TaskRunOutput {
            task_id,
            worktree,
            degraded,
            outcome,
        } = output;

        if let Some(info) = &worktree {
            if let Some(task) = wf.tasks.get_mut(&task_id) {
                task.worktree_path = Some(info.path.display().to_string());
                task.branch = Some(info.branch.clone());
            }
        }

        match outcome {
            Ok(parts) => {
                self.finalize_success(wf, &task_id, parts, worktree, degraded, workflow_branch, first_failure)
                    .await
            }
            Err(QuorumError::Cancelled) => {
                // Requeue untouched; a later resume will run it again.
                if let Some(task) = wf.tasks.get_mut(&task_id) {
                    task.status = TaskStatus::Pending;
                    task.started_at = None;
                }
                self.persist(wf).await
            }
            Err(err) => self.finalize_failure(wf, &task_id, err, first_failure).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize_success(
        &self,
        wf: &mut Workflow,
        task_id: &str,
        parts: SuccessParts,
        worktree: Option<WorktreeInfo>,
        degraded: bool,
        workflow_branch: &str,
        first_failure: &mut Option<QuorumError>,
    ) -> Result<()> {
        let mut last_commit = parts.commit.as_ref().map(|c| c.commit.clone());
        let files = parts
            .commit
            .as_ref()
            .map(|c| c.files.clone())
            .unwrap_or_default();

        if let Some(info) = &worktree {
            if last_commit.is_some() {
                // Merging can move the workflow branch ref and refresh the
                // primary checkout; hold the repo lock so that never lands
                // inside a non-isolated task's checkout-commit window.
                let _repo_guard = self.ctx.repo_lock.lock().await;
                match self.ctx.git.merge_branches(workflow_branch, &info.branch)? {
                    MergeOutcome::Conflict(conflict_files) => {
                        // Task branch and worktree stay behind for inspection.
                        let err = QuorumError::MergeConflict {
                            task_id: task_id.to_string(),
                            files: conflict_files,
                        };
                        self.absorb_usage(wf, task_id, &parts.usage);
                        return self.finalize_failure(wf, task_id, err, first_failure).await;
                    }
                    MergeOutcome::FastForward(tip) | MergeOutcome::Merged(tip) => {
                        last_commit = Some(tip);
                    }
                    MergeOutcome::UpToDate => {}
                }
            }
            self.ctx.worktrees.remove(&info.name)?;
        }

        self.absorb_usage(wf, task_id, &parts.usage);
        if let Some(task) = wf.tasks.get_mut(task_id) {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.last_commit = last_commit.clone();
            task.files_modified = files;
            if degraded {
                task.resume_hint = Some("ran without worktree isolation".to_string());
            }
            wf.metrics.tasks_completed += 1;
        }
        wf.touch();
        self.persist(wf).await?;

        self.ctx
            .store
            .save_checkpoint(&Checkpoint {
                workflow_id: wf.id.clone(),
                phase: Phase::Execute,
                task_id: Some(task_id.to_string()),
                payload_digest: last_commit.clone().unwrap_or_else(|| "no-change".to_string()),
                created_at: Utc::now(),
            })
            .await?;

        self.ctx
            .bus
            .publish(
                &wf.id,
                EventPayload::TaskCompleted {
                    task_id: task_id.to_string(),
                    commit: last_commit,
                },
            )
            .await;
        self.publish_metrics(wf).await;
        Ok(())
    }

    async fn finalize_failure(
        &self,
        wf: &mut Workflow,
        task_id: &str,
        err: QuorumError,
        first_failure: &mut Option<QuorumError>,
    ) -> Result<()> {
        let retryable_class = err.is_retryable() || matches!(err, QuorumError::AgentFailure { .. });
        let terminal = match &err {
            QuorumError::MergeConflict { .. } => true,
            _ if retryable_class => !wf
                .tasks
                .get(task_id)
                .map(|t| t.retries_remaining())
                .unwrap_or(false),
            _ => true,
        };

        if let Some(task) = wf.tasks.get_mut(task_id) {
            task.error = Some(err.to_string());
            if terminal {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                wf.metrics.tasks_failed += 1;
            } else {
                task.retries += 1;
                task.status = TaskStatus::Pending;
                task.started_at = None;
                warn!(
                    workflow_id = %wf.id,
                    task_id,
                    retries = task.retries,
                    "task failed, requeued for retry: {err}"
                );
            }
        }
        wf.touch();
        self.persist(wf).await?;

        if terminal {
            let retries = wf.tasks.get(task_id).map(|t| t.retries).unwrap_or(0);
            self.ctx
                .bus
                .publish(
                    &wf.id,
                    EventPayload::TaskFailed {
                        task_id: task_id.to_string(),
                        error: err.to_string(),
                        retries,
                    },
                )
                .await;
            self.publish_metrics(wf).await;
            if first_failure.is_none() {
                *first_failure = Some(err);
            }
        } else {
            self.ctx
                .bus
                .publish(
                    &wf.id,
                    EventPayload::Log {
                        level: "warn".to_string(),
                        message: format!("task {task_id} failed, retrying: {err}"),
                    },
                )
                .await;
        }
        Ok(())
    }

    async fn mark_skipped(&self, wf: &mut Workflow, task_id: &str, dep: &str) -> Result<()> {
        let dep_status = wf
            .tasks
            .get(dep)
            .map(|d| d.status)
            .unwrap_or(TaskStatus::Failed);
        let reason = match dep_status {
            TaskStatus::Skipped => format!("dependency_skipped_{dep}"),
            _ => format!("dependency_failed_{dep}"),
        };
        if let Some(task) = wf.tasks.get_mut(task_id) {
            task.status = TaskStatus::Skipped;
            task.completed_at = Some(Utc::now());
            task.error = Some(reason.clone());
            wf.metrics.tasks_skipped += 1;
        }
        wf.touch();
        self.persist(wf).await?;
        self.ctx
            .bus
            .publish(
                &wf.id,
                EventPayload::TaskSkipped {
                    task_id: task_id.to_string(),
                    reason,
                },
            )
            .await;
        Ok(())
    }

    fn absorb_usage(&self, wf: &mut Workflow, task_id: &str, usage: &AgentResult) {
        if let Some(task) = wf.tasks.get_mut(task_id) {
            task.tokens_in += usage.tokens_in;
            task.tokens_out += usage.tokens_out;
            task.cost_usd += usage.cost_usd;
        }
        wf.metrics.tokens_in += usage.tokens_in;
        wf.metrics.tokens_out += usage.tokens_out;
        wf.metrics.cost_usd += usage.cost_usd;
    }

    async fn persist(&self, wf: &Workflow) -> Result<()> {
        self.ctx.store.save_workflow(wf).await
    }

    async fn publish_metrics(&self, wf: &Workflow) {
        self.ctx
            .bus
            .publish(
                &wf.id,
                EventPayload::MetricsUpdate {
                    metrics: wf.metrics.clone(),
                },
            )
            .await;
    }
}

/// One task attempt, off the scheduler loop: rate-limit token, worktree,
/// agent invocation, commit to the task branch. Merging happens back on the
/// loop. On failure the worktree is retained for inspection.
async fn run_one(
    ctx: WorkflowContext,
    workflow_id: WorkflowId,
    task: crate::workflow::types::Task,
    prompt_base: String,
    worktrees_enabled: bool,
    workflow_branch: String,
) -> TaskRunOutput {
    let cancel = ctx.control.child_token();
    let task_id = task.id.clone();

    if let Err(e) = ctx.rate_limits.acquire(&task.agent, &cancel).await {
        return TaskRunOutput {
            task_id,
            worktree: None,
            degraded: false,
            outcome: Err(e),
        };
    }

    let agent = match ctx.agents.get(&task.agent) {
        Ok(agent) => agent,
        Err(e) => {
            return TaskRunOutput {
                task_id,
                worktree: None,
                degraded: false,
                outcome: Err(e),
            }
        }
    };

    // Held until this attempt returns whenever the task works in the
    // primary tree; checkout, agent edits and commit must not interleave
    // with another non-isolated task.
    let mut _repo_guard = None;
    let (workdir, worktree, degraded) = if worktrees_enabled {
        match ctx
            .worktrees
            .create_task_worktree(&workflow_id, &task.id, &task.name, &workflow_branch)
            .await
        {
            Ok(info) => (info.path.clone(), Some(info), false),
            Err(QuorumError::Cancelled) => {
                return TaskRunOutput {
                    task_id,
                    worktree: None,
                    degraded: false,
                    outcome: Err(QuorumError::Cancelled),
                }
            }
            Err(e) => {
                warn!(workflow_id = %workflow_id, task_id = %task.id, "degraded isolation: {e}");
                ctx.bus
                    .publish(
                        &workflow_id,
                        EventPayload::Log {
                            level: "warn".to_string(),
                            message: format!("degraded isolation for task {}: {e}", task.id),
                        },
                    )
                    .await;
                _repo_guard = Some(ctx.repo_lock.lock().await);
                if let Err(e) = ctx.git.checkout_branch(&workflow_branch) {
                    return TaskRunOutput {
                        task_id,
                        worktree: None,
                        degraded: true,
                        outcome: Err(e),
                    };
                }
                (ctx.git.repo_root().to_path_buf(), None, true)
            }
        }
    } else {
        // No isolation requested: work on the workflow branch in place.
        _repo_guard = Some(ctx.repo_lock.lock().await);
        if let Err(e) = ctx.git.checkout_branch(&workflow_branch) {
            return TaskRunOutput {
                task_id,
                worktree: None,
                degraded: false,
                outcome: Err(e),
            };
        }
        (ctx.git.repo_root().to_path_buf(), None, false)
    };

    let request = InvokeRequest {
        prompt: compose_task_prompt(&prompt_base, &task.name),
        workdir: workdir.clone(),
        model: task.model.clone(),
    };
    let usage = match agent.invoke(&cancel, request).await {
        Ok(result) => {
            let mut chunk = result.text.clone();
            chunk.truncate(STREAM_CHUNK_LIMIT);
            ctx.bus
                .publish(
                    &workflow_id,
                    EventPayload::AgentStream {
                        task_id: Some(task.id.clone()),
                        agent: task.agent.clone(),
                        chunk,
                    },
                )
                .await;
            result
        }
        Err(e) => {
            return TaskRunOutput {
                task_id,
                worktree,
                degraded,
                outcome: Err(e),
            }
        }
    };

    let commit = match ctx
        .git
        .commit_all_in(&workdir, &format!("{}: {}", task.id, task.name))
    {
        Ok(commit) => commit,
        Err(e) => {
            return TaskRunOutput {
                task_id,
                worktree,
                degraded,
                outcome: Err(e),
            }
        }
    };

    TaskRunOutput {
        task_id,
        worktree,
        degraded,
        outcome: Ok(SuccessParts { usage, commit }),
    }
}

fn compose_task_prompt(prompt_base: &str, task_name: &str) -> String {
    format!("{prompt_base}\n\nCurrent task: {task_name}")
}
