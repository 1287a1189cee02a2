use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::error::{QuorumError, Result};
use crate::events::EventPayload;
use crate::git::operations::is_branch_exists;
use crate::report;
use crate::store::{StateStore, WorkflowLockGuard, DEFAULT_LOCK_TTL};
use crate::workflow::context::WorkflowContext;
use crate::workflow::phases::{self, PhaseOutcome, PhaseRegistry};
use crate::workflow::types::{Checkpoint, Phase, TaskStatus, Workflow, WorkflowId, WorkflowStatus};

/// The entry points the orchestrator proxies to. Analyze/Plan stop the
/// pipeline after their phase; Replan forces a fresh plan pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerCall {
    Run,
    Resume,
    Analyze,
    Plan,
    Replan,
}

impl RunnerCall {
    fn phases(&self) -> &'static [Phase] {
        match self {
            RunnerCall::Run | RunnerCall::Resume => &Phase::ALL,
            RunnerCall::Analyze => &[Phase::Refine, Phase::Analyze],
            RunnerCall::Plan | RunnerCall::Replan => &[Phase::Refine, Phase::Analyze, Phase::Plan],
        }
    }

    fn is_partial(&self) -> bool {
        !matches!(self, RunnerCall::Run | RunnerCall::Resume)
    }
}

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub heartbeat_interval: Duration,
    pub lock_ttl: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        RunnerSettings {
            heartbeat_interval: Duration::from_secs(10),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }
}

/// Background heartbeat while a runner call holds the workflow lock: bumps
/// `heartbeat_at` and re-arms the lock file expiry. Owns the lock guard so
/// release happens exactly once, on stop.
struct Heartbeat {
    handle: tokio::task::JoinHandle<()>,
    lock: Arc<Mutex<Option<WorkflowLockGuard>>>,
}

impl Heartbeat {
    fn start(
        store: Arc<StateStore>,
        id: WorkflowId,
        guard: WorkflowLockGuard,
        interval: Duration,
        ttl: Duration,
    ) -> Self {
        let lock = Arc::new(Mutex::new(Some(guard)));
        let lock_for_task = Arc::clone(&lock);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.update_heartbeat(&id).await {
                    warn!(workflow_id = %id, "heartbeat update failed: {e}");
                }
                let refresh = lock_for_task
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .as_mut()
                    .map(|g| g.refresh(ttl));
                if let Some(Err(e)) = refresh {
                    warn!(workflow_id = %id, "lock refresh failed: {e}");
                }
            }
        });
        Heartbeat { handle, lock }
    }

    async fn stop(self, store: &StateStore, id: &WorkflowId) {
        self.handle.abort();
        let guard = self
            .lock
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(guard) = guard {
            if let Err(e) = store.release_workflow_lock(id, guard).await {
                warn!(workflow_id = %id, "lock release failed: {e}");
            }
        }
    }
}

/// Drives one workflow through refine → analyze → plan → execute with
/// crash-consistent persistence: the per-workflow lock is held for the whole
/// call, state is saved on every transition, and a checkpoint marks each
/// phase crossed so resume skips finished work.
pub struct WorkflowRunner {
    ctx: WorkflowContext,
    phases: Arc<PhaseRegistry>,
    settings: RunnerSettings,
}

impl WorkflowRunner {
    pub fn new(ctx: WorkflowContext, phases: Arc<PhaseRegistry>, settings: RunnerSettings) -> Self {
        WorkflowRunner {
            ctx,
            phases,
            settings,
        }
    }

    pub fn context(&self) -> &WorkflowContext {
        &self.ctx
    }

    pub async fn execute(&self, id: &WorkflowId, call: RunnerCall) -> Result<()> {
        let guard = self.ctx.store.acquire_workflow_lock(id).await?;
        let mut workflow = match self.ctx.store.get_workflow(id).await {
            Ok(Some(wf)) => wf,
            Ok(None) => {
                let _ = self.ctx.store.release_workflow_lock(id, guard).await;
                return Err(QuorumError::not_found(format!("workflow {id}")));
            }
            Err(e) => {
                let _ = self.ctx.store.release_workflow_lock(id, guard).await;
                return Err(e);
            }
        };

        if let Err(e) = self.prepare(&mut workflow, call).await {
            let _ = self.ctx.store.release_workflow_lock(id, guard).await;
            return Err(e);
        }

        let heartbeat = Heartbeat::start(
            Arc::clone(&self.ctx.store),
            id.clone(),
            guard,
            self.settings.heartbeat_interval,
            self.settings.lock_ttl,
        );
        let result = self.drive(&mut workflow, call).await;
        heartbeat.stop(&self.ctx.store, id).await;
        result
    }

    /// Entry validation, resume accounting, branch setup, `running` status.
    async fn prepare(&self, wf: &mut Workflow, call: RunnerCall) -> Result<()> {
        match call {
            RunnerCall::Run => match wf.status {
                WorkflowStatus::Pending => {}
                WorkflowStatus::Running => {
                    return Err(QuorumError::AlreadyRunning(wf.id.to_string()))
                }
                WorkflowStatus::Paused => {
                    return Err(QuorumError::validation(format!(
                        "workflow {} is paused; resume it instead",
                        wf.id
                    )))
                }
                _ => {
                    return Err(QuorumError::validation(format!(
                        "workflow {} already finished ({})",
                        wf.id,
                        wf.status.as_str()
                    )))
                }
            },
            RunnerCall::Resume => {
                if wf.status != WorkflowStatus::Paused {
                    return Err(QuorumError::validation(format!(
                        "workflow {} is {}, only paused workflows resume",
                        wf.id,
                        wf.status.as_str()
                    )));
                }
                if wf.resume_count >= wf.max_resumes {
                    return Err(QuorumError::validation(format!(
                        "workflow {} exhausted its {} resumes",
                        wf.id, wf.max_resumes
                    )));
                }
                wf.resume_count += 1;
            }
            RunnerCall::Analyze | RunnerCall::Plan | RunnerCall::Replan => {
                if !matches!(wf.status, WorkflowStatus::Pending | WorkflowStatus::Paused) {
                    return Err(QuorumError::validation(format!(
                        "workflow {} is {}, expected pending or paused",
                        wf.id,
                        wf.status.as_str()
                    )));
                }
                if call == RunnerCall::Replan {
                    self.ctx
                        .store
                        .clear_checkpoints_from(&wf.id, Phase::Plan)
                        .await?;
                }
            }
        }

        self.ctx.control.clear_pause();
        if call == RunnerCall::Run {
            self.ctx
                .bus
                .publish(
                    &wf.id,
                    EventPayload::WorkflowStarted {
                        title: wf.title.clone(),
                    },
                )
                .await;
        }

        self.ensure_workflow_branch(wf).await?;
        wf.transition(WorkflowStatus::Running)?;
        wf.heartbeat_at = Some(Utc::now());
        self.ctx.store.save_workflow(wf).await?;
        self.publish_state(wf).await;
        Ok(())
    }

    /// Rule: create `quorum/<id>` off the base branch; on a name collision
    /// that is not ours, retry with a unique suffix and persist the result.
    async fn ensure_workflow_branch(&self, wf: &mut Workflow) -> Result<()> {
        if wf.base_branch.is_empty() {
            wf.base_branch = self.ctx.git.default_branch()?;
        }
        if let Some(branch) = &wf.workflow_branch {
            if self.ctx.git.branch_exists(branch)? {
                return Ok(());
            }
            let name = branch.clone();
            self.ctx.git.create_branch(&name, &wf.base_branch)?;
            return Ok(());
        }

        let mut attempt = 1u32;
        let name = loop {
            let candidate = if attempt == 1 {
                format!("quorum/{}", wf.id)
            } else {
                format!("quorum/{}-{attempt}", wf.id)
            };
            match self.ctx.git.create_branch(&candidate, &wf.base_branch) {
                Ok(()) => break candidate,
                Err(e) if is_branch_exists(&e) && attempt < 10 => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };
        info!(workflow_id = %wf.id, branch = %name, "created workflow branch");
        wf.workflow_branch = Some(name);
        self.ctx.store.save_workflow(wf).await?;
        Ok(())
    }

    async fn drive(&self, wf: &mut Workflow, call: RunnerCall) -> Result<()> {
        for &phase in call.phases() {
            if self.ctx.control.is_cancelled() {
                return self.finish_cancelled(wf).await;
            }
            if self.ctx.control.pause_requested() {
                return self.finish_paused(wf, "paused between phases", None).await;
            }
            if self.ctx.store.has_phase_checkpoint(&wf.id, phase).await? {
                debug!(workflow_id = %wf.id, %phase, "phase already checkpointed, skipping");
                continue;
            }

            wf.current_phase = phase;
            wf.touch();
            self.ctx.store.save_workflow(wf).await?;
            let replan = phase == Phase::Plan && phases::is_replan(wf);
            self.ctx
                .bus
                .publish(&wf.id, EventPayload::PhaseStarted { phase, replan })
                .await;
            self.publish_state(wf).await;

            let started = Instant::now();
            let runner = self.phases.get(phase)?;
            match runner.run(&self.ctx, wf).await {
                Ok(PhaseOutcome::Advanced) => {
                    wf.metrics
                        .phase_seconds
                        .insert(phase.as_str().to_string(), started.elapsed().as_secs_f64());
                    self.ctx
                        .store
                        .save_checkpoint(&Checkpoint {
                            workflow_id: wf.id.clone(),
                            phase,
                            task_id: None,
                            payload_digest: phase_digest(wf, phase),
                            created_at: Utc::now(),
                        })
                        .await?;
                    self.ctx.store.save_workflow(wf).await?;
                }
                Ok(PhaseOutcome::Paused) => {
                    return self
                        .finish_paused(wf, "paused during task execution", None)
                        .await;
                }
                Err(QuorumError::Cancelled) => return self.finish_cancelled(wf).await,
                Err(e) if e.is_retryable() => {
                    return self
                        .finish_paused(wf, &format!("transient failure in {phase}"), Some(e))
                        .await;
                }
                Err(e) => return self.finish_failed(wf, e).await,
            }
        }

        if call.is_partial() {
            let hint = format!("pipeline stopped after {}", wf.current_phase);
            return self.finish_paused(wf, &hint, None).await;
        }
        self.finish_completed(wf).await
    }

    async fn finish_completed(&self, wf: &mut Workflow) -> Result<()> {
        wf.last_error = None;
        wf.transition(WorkflowStatus::Completed)?;
        self.ctx.store.save_workflow(wf).await?;

        if wf.options.auto_merge_on_success {
            if let Some(branch) = wf.workflow_branch.clone() {
                match self.ctx.git.merge_branches(&wf.base_branch, &branch) {
                    Ok(outcome) => {
                        info!(workflow_id = %wf.id, ?outcome, "auto-merged workflow branch")
                    }
                    Err(e) => {
                        warn!(workflow_id = %wf.id, "auto-merge failed: {e}");
                        self.ctx
                            .bus
                            .publish(
                                &wf.id,
                                EventPayload::Log {
                                    level: "warn".to_string(),
                                    message: format!("auto-merge to {} failed: {e}", wf.base_branch),
                                },
                            )
                            .await;
                    }
                }
            }
        }

        if let Err(e) = report::write_report(&self.ctx.store.runs_dir(), wf) {
            warn!(workflow_id = %wf.id, "report write failed: {e}");
        }

        self.publish_state(wf).await;
        self.ctx
            .bus
            .publish(
                &wf.id,
                EventPayload::WorkflowCompleted {
                    metrics: wf.metrics.clone(),
                },
            )
            .await;
        info!(workflow_id = %wf.id, "workflow completed");
        Ok(())
    }

    async fn finish_failed(&self, wf: &mut Workflow, err: QuorumError) -> Result<()> {
        wf.last_error = Some(err.to_string());
        wf.transition(WorkflowStatus::Failed)?;
        self.ctx.store.save_workflow(wf).await?;
        if let Err(e) = report::write_report(&self.ctx.store.runs_dir(), wf) {
            warn!(workflow_id = %wf.id, "report write failed: {e}");
        }

        let task_id = match &err {
            QuorumError::MergeConflict { task_id, .. } => Some(task_id.clone()),
            _ => wf
                .ordered_task_ids()
                .into_iter()
                .find(|id| {
                    wf.tasks
                        .get(id)
                        .map(|t| t.status == TaskStatus::Failed)
                        .unwrap_or(false)
                }),
        };

        self.publish_state(wf).await;
        self.ctx
            .bus
            .publish(
                &wf.id,
                EventPayload::WorkflowFailed {
                    kind: format!("{:?}", err.kind()),
                    message: err.to_string(),
                    task_id,
                },
            )
            .await;
        Err(err)
    }

    async fn finish_paused(
        &self,
        wf: &mut Workflow,
        hint: &str,
        err: Option<QuorumError>,
    ) -> Result<()> {
        wf.last_error = Some(match &err {
            Some(e) => format!("{hint}: {e}"),
            None => hint.to_string(),
        });
        wf.transition(WorkflowStatus::Paused)?;
        self.ctx.store.save_workflow(wf).await?;
        self.publish_state(wf).await;
        info!(workflow_id = %wf.id, hint, "workflow paused");
        match err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn finish_cancelled(&self, wf: &mut Workflow) -> Result<()> {
        wf.transition(WorkflowStatus::Cancelled)?;
        self.ctx.store.save_workflow(wf).await?;
        if let Err(e) = report::write_report(&self.ctx.store.runs_dir(), wf) {
            warn!(workflow_id = %wf.id, "report write failed: {e}");
        }
        self.publish_state(wf).await;
        info!(workflow_id = %wf.id, "workflow cancelled");
        Ok(())
    }

    async fn publish_state(&self, wf: &Workflow) {
        self.ctx
            .bus
            .publish(
                &wf.id,
                EventPayload::WorkflowStateUpdated {
                    status: wf.status,
                    phase: wf.current_phase,
                },
            )
            .await;
    }
}

/// A stable fingerprint of what a phase produced, stored with its
/// checkpoint so resume diagnostics can tell runs apart.
fn phase_digest(wf: &Workflow, phase: Phase) -> String {
    match phase {
        Phase::Refine => format!(
            "prompt:{}",
            wf.optimized_prompt.as_deref().unwrap_or("").len()
        ),
        Phase::Analyze => format!("analysis:{}", wf.analysis.as_deref().unwrap_or("").len()),
        Phase::Plan => format!("tasks:{}", wf.ordered_task_ids().join(",")),
        Phase::Execute => format!(
            "completed:{}",
            wf.tasks
                .values()
                .filter(|t| t.status == TaskStatus::Completed)
                .count()
        ),
    }
}
