use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::agents::InvokeRequest;
use crate::error::{QuorumError, Result};
use crate::events::EventPayload;
use crate::executor::{graph, ExecuteOutcome, Executor};
use crate::workflow::context::WorkflowContext;
use crate::workflow::types::{Phase, Task, TaskStatus, Workflow};

/// How a phase ended. `Paused` means a cooperative pause landed mid-phase
/// (only the execute phase does this); the workflow is resumable.
#[derive(Debug, PartialEq, Eq)]
pub enum PhaseOutcome {
    Advanced,
    Paused,
}

/// One pipeline stage. The runner sequences these; their internals are free.
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    fn phase(&self) -> Phase;

    async fn run(&self, ctx: &WorkflowContext, workflow: &mut Workflow) -> Result<PhaseOutcome>;
}

/// Phase-keyed lookup of runners, preloaded with the defaults.
pub struct PhaseRegistry {
    runners: HashMap<Phase, Arc<dyn PhaseRunner>>,
}

impl PhaseRegistry {
    pub fn with_default_runners() -> Arc<Self> {
        let mut runners: HashMap<Phase, Arc<dyn PhaseRunner>> = HashMap::new();
        runners.insert(Phase::Refine, Arc::new(RefinePhase));
        runners.insert(Phase::Analyze, Arc::new(AnalyzePhase));
        runners.insert(Phase::Plan, Arc::new(PlanPhase));
        runners.insert(Phase::Execute, Arc::new(ExecutePhase));
        Arc::new(PhaseRegistry { runners })
    }

    pub fn get(&self, phase: Phase) -> Result<Arc<dyn PhaseRunner>> {
        self.runners
            .get(&phase)
            .cloned()
            .ok_or_else(|| QuorumError::fatal(format!("no runner registered for phase {phase}")))
    }
}

async fn invoke_phase_agent(
    ctx: &WorkflowContext,
    workflow: &Workflow,
    prompt: String,
) -> Result<crate::agents::AgentResult> {
    let cancel = ctx.control.child_token();
    let agent_name = workflow.options.agent.clone();
    ctx.rate_limits.acquire(&agent_name, &cancel).await?;
    let agent = ctx.agents.get(&agent_name)?;
    let result = agent
        .invoke(
            &cancel,
            InvokeRequest {
                prompt,
                workdir: ctx.git.repo_root().to_path_buf(),
                model: workflow.options.model.clone(),
            },
        )
        .await?;
    ctx.bus
        .publish(
            &workflow.id,
            EventPayload::AgentStream {
                task_id: None,
                agent: agent_name,
                chunk: result.text.chars().take(2000).collect(),
            },
        )
        .await;
    Ok(result)
}

fn absorb_phase_usage(workflow: &mut Workflow, usage: &crate::agents::AgentResult) {
    workflow.metrics.tokens_in += usage.tokens_in;
    workflow.metrics.tokens_out += usage.tokens_out;
    workflow.metrics.cost_usd += usage.cost_usd;
}

/// Rewrites the raw prompt into a sharper instruction for the later phases.
pub struct RefinePhase;

#[async_trait]
impl PhaseRunner for RefinePhase {
    fn phase(&self) -> Phase {
        Phase::Refine
    }

    async fn run(&self, ctx: &WorkflowContext, workflow: &mut Workflow) -> Result<PhaseOutcome> {
        let prompt = format!(
            "Rewrite the following request as a precise, self-contained engineering \
             instruction. Keep every constraint, drop the filler, answer with the \
             rewritten instruction only.\n\nRequest:\n{}",
            workflow.original_prompt
        );
        let result = invoke_phase_agent(ctx, workflow, prompt).await?;
        absorb_phase_usage(workflow, &result);
        let refined = result.text.trim();
        workflow.optimized_prompt = if refined.is_empty() {
            Some(workflow.original_prompt.clone())
        } else {
            Some(refined.to_string())
        };
        Ok(PhaseOutcome::Advanced)
    }
}

/// Surveys the repository and records what the plan should take into account.
pub struct AnalyzePhase;

#[async_trait]
impl PhaseRunner for AnalyzePhase {
    fn phase(&self) -> Phase {
        Phase::Analyze
    }

    async fn run(&self, ctx: &WorkflowContext, workflow: &mut Workflow) -> Result<PhaseOutcome> {
        let prompt = format!(
            "Analyze the repository in the current directory with this goal in \
             mind:\n{}\n\nSummarize the relevant modules, risks and constraints a \
             plan must respect.",
            workflow
                .optimized_prompt
                .as_deref()
                .unwrap_or(&workflow.original_prompt)
        );
        let result = invoke_phase_agent(ctx, workflow, prompt).await?;
        absorb_phase_usage(workflow, &result);
        workflow.analysis = Some(result.text.trim().to_string());
        Ok(PhaseOutcome::Advanced)
    }
}

#[derive(Debug, Deserialize)]
struct PlannedTask {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    max_retries: Option<u32>,
}

/// Asks the agent for a task breakdown, validates the DAG, installs it.
/// A replan (completed tasks already present) preserves that completed work.
pub struct PlanPhase;

#[async_trait]
impl PhaseRunner for PlanPhase {
    fn phase(&self) -> Phase {
        Phase::Plan
    }

    async fn run(&self, ctx: &WorkflowContext, workflow: &mut Workflow) -> Result<PhaseOutcome> {
        let replan = is_replan(workflow);
        let done: Vec<String> = workflow
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| format!("- {} ({})", t.id, t.name))
            .collect();
        let mut prompt = format!(
            "Break this goal into executable coding tasks.\n\nGoal:\n{}\n\nContext:\n{}\n\n\
             Answer with a JSON array only. Each element: {{\"id\": string, \"name\": string, \
             \"dependencies\": [task ids]}}. Keep ids short (t1, t2, ...). Order the array so \
             dependencies come first.",
            workflow
                .optimized_prompt
                .as_deref()
                .unwrap_or(&workflow.original_prompt),
            workflow.analysis.as_deref().unwrap_or("(no analysis)"),
        );
        if replan && !done.is_empty() {
            prompt.push_str(&format!(
                "\n\nAlready completed, do not plan again:\n{}",
                done.join("\n")
            ));
        }

        let result = invoke_phase_agent(ctx, workflow, prompt).await?;
        absorb_phase_usage(workflow, &result);
        let planned = parse_plan(&result.text)?;
        if planned.is_empty() {
            return Err(QuorumError::validation("plan produced no tasks"));
        }

        let tasks: Vec<Task> = planned
            .into_iter()
            .enumerate()
            .map(|(i, p)| {
                let mut task = Task::new(
                    p.id.unwrap_or_else(|| format!("t{}", i + 1)),
                    p.name,
                    p.agent.unwrap_or_else(|| workflow.options.agent.clone()),
                );
                task.model = p.model.or_else(|| workflow.options.model.clone());
                task.dependencies = p.dependencies;
                if let Some(max_retries) = p.max_retries {
                    task.max_retries = max_retries;
                }
                task
            })
            .collect();

        workflow.install_plan(tasks, replan);
        graph::validate_plan(workflow)?;
        info!(
            workflow_id = %workflow.id,
            tasks = workflow.tasks.len(),
            replan,
            "plan installed"
        );

        for id in workflow.ordered_task_ids() {
            let Some(task) = workflow.tasks.get(&id) else {
                continue;
            };
            if task.status != TaskStatus::Pending {
                continue;
            }
            ctx.bus
                .publish(
                    &workflow.id,
                    EventPayload::TaskCreated {
                        task_id: task.id.clone(),
                        name: task.name.clone(),
                        agent: task.agent.clone(),
                    },
                )
                .await;
        }
        Ok(PhaseOutcome::Advanced)
    }
}

/// A plan pass counts as a replan when completed tasks already exist.
pub fn is_replan(workflow: &Workflow) -> bool {
    workflow
        .tasks
        .values()
        .any(|t| t.status == TaskStatus::Completed)
}

/// Drives the task DAG through the executor.
pub struct ExecutePhase;

#[async_trait]
impl PhaseRunner for ExecutePhase {
    fn phase(&self) -> Phase {
        Phase::Execute
    }

    async fn run(&self, ctx: &WorkflowContext, workflow: &mut Workflow) -> Result<PhaseOutcome> {
        if workflow.tasks.is_empty() {
            debug!(workflow_id = %workflow.id, "nothing to execute");
            return Ok(PhaseOutcome::Advanced);
        }
        match Executor::new(ctx.clone()).run(workflow).await? {
            ExecuteOutcome::Completed => Ok(PhaseOutcome::Advanced),
            ExecuteOutcome::Paused => Ok(PhaseOutcome::Paused),
        }
    }
}

/// Accept either a bare JSON array or an array embedded in prose.
fn parse_plan(text: &str) -> Result<Vec<PlannedTask>> {
    if let Ok(tasks) = serde_json::from_str::<Vec<PlannedTask>>(text.trim()) {
        return Ok(tasks);
    }
    let start = text.find('[');
    let end = text.rfind(']');
    if let (Some(start), Some(end)) = (start, end) {
        if start < end {
            if let Ok(tasks) = serde_json::from_str::<Vec<PlannedTask>>(&text[start..=end]) {
                return Ok(tasks);
            }
        }
    }
    Err(QuorumError::validation(
        "plan output did not contain a JSON task array",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json_array() {
        let tasks = parse_plan(
            r#"[{"id": "t1", "name": "one", "dependencies": []},
                {"id": "t2", "name": "two", "dependencies": ["t1"]}]"#,
        )
        .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].dependencies, vec!["t1"]);
    }

    #[test]
    fn parses_array_embedded_in_prose() {
        let text = "Here is the plan:\n[{\"name\": \"only task\"}]\nGood luck!";
        let tasks = parse_plan(text).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].name, "only task");
        assert!(tasks[0].id.is_none());
    }

    #[test]
    fn rejects_non_json_output() {
        assert!(matches!(
            parse_plan("I could not produce a plan."),
            Err(QuorumError::Validation(_))
        ));
    }

    #[test]
    fn replan_detection_keys_on_completed_tasks() {
        let mut wf = Workflow::new("p", "t", "main");
        assert!(!is_replan(&wf));
        wf.install_plan(vec![Task::new("t1", "one", "claude")], false);
        assert!(!is_replan(&wf));
        wf.tasks.get_mut("t1").unwrap().status = TaskStatus::Completed;
        assert!(is_replan(&wf));
    }

    #[test]
    fn registry_serves_all_phases() {
        let registry = PhaseRegistry::with_default_runners();
        for phase in Phase::ALL {
            assert_eq!(registry.get(phase).unwrap().phase(), phase);
        }
    }
}
