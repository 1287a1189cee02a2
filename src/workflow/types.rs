use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QuorumError, Result};

/// Process-unique workflow identifier, `wf-<UTC-timestamp>-<random>`.
///
/// Stable for the life of the workflow; primary key in the store and prefix
/// of the workflow's git branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    pub fn generate() -> Self {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let nonce = &Uuid::new_v4().simple().to_string()[..6];
        WorkflowId(format!("wf-{stamp}-{nonce}"))
    }

    pub fn parse(s: &str) -> Result<Self> {
        if !s.starts_with("wf-") || s.len() < 6 {
            return Err(QuorumError::validation(format!(
                "'{s}' is not a workflow id"
            )));
        }
        Ok(WorkflowId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Sentinel id carried by bus-synthetic events that span workflows.
    pub(crate) fn bus_synthetic() -> Self {
        WorkflowId("wf-bus-synthetic".to_string())
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(WorkflowStatus::Pending),
            "running" => Ok(WorkflowStatus::Running),
            "paused" => Ok(WorkflowStatus::Paused),
            "completed" => Ok(WorkflowStatus::Completed),
            "failed" => Ok(WorkflowStatus::Failed),
            "cancelled" => Ok(WorkflowStatus::Cancelled),
            other => Err(QuorumError::validation(format!(
                "unknown workflow status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    /// Legal transitions of the workflow lifecycle. `Cancelled` is reachable
    /// from any non-terminal state so `Cancel` stays idempotent at the edges.
    pub fn can_transition_to(&self, next: WorkflowStatus) -> bool {
        use WorkflowStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Cancelled) => true,
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) => {
                true
            }
            (Paused, Running) | (Paused, Failed) | (Paused, Cancelled) => true,
            _ => false,
        }
    }
}

/// The four fixed pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Refine,
    Analyze,
    Plan,
    Execute,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Refine, Phase::Analyze, Phase::Plan, Phase::Execute];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Refine => "refine",
            Phase::Analyze => "analyze",
            Phase::Plan => "plan",
            Phase::Execute => "execute",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "refine" => Ok(Phase::Refine),
            "analyze" => Ok(Phase::Analyze),
            "plan" => Ok(Phase::Plan),
            "execute" => Ok(Phase::Execute),
            other => Err(QuorumError::validation(format!("unknown phase '{other}'"))),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "skipped" => Ok(TaskStatus::Skipped),
            other => Err(QuorumError::validation(format!(
                "unknown task status '{other}'"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// A unit of work produced by the plan phase and driven by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub phase: Phase,
    pub name: String,
    pub status: TaskStatus,
    pub agent: String,
    pub model: Option<String>,
    pub dependencies: Vec<String>,
    pub worktree_path: Option<String>,
    pub branch: Option<String>,
    pub last_commit: Option<String>,
    pub files_modified: Vec<String>,
    pub retries: u32,
    pub max_retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub error: Option<String>,
    pub resume_hint: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, name: impl Into<String>, agent: impl Into<String>) -> Self {
        Task {
            id: id.into(),
            phase: Phase::Execute,
            name: name.into(),
            status: TaskStatus::Pending,
            agent: agent.into(),
            model: None,
            dependencies: Vec::new(),
            worktree_path: None,
            branch: None,
            last_commit: None,
            files_modified: Vec::new(),
            retries: 0,
            max_retries: 2,
            started_at: None,
            completed_at: None,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            error: None,
            resume_hint: None,
        }
    }

    pub fn with_dependencies(mut self, deps: Vec<String>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn retries_remaining(&self) -> bool {
        self.retries < self.max_retries
    }
}

/// Aggregated usage and timing for one workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub tasks_skipped: u32,
    /// Seconds spent in each completed phase.
    pub phase_seconds: BTreeMap<String, f64>,
}

/// Per-workflow execution options, persisted alongside the workflow so a
/// resume sees the same knobs the run started with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOptions {
    pub max_parallel_tasks: usize,
    pub worktrees_enabled: bool,
    pub agent: String,
    pub model: Option<String>,
    pub auto_merge_on_success: bool,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        WorkflowOptions {
            max_parallel_tasks: 4,
            worktrees_enabled: true,
            agent: "claude".to_string(),
            model: None,
            auto_merge_on_success: false,
        }
    }
}

/// The root aggregate: one prompt driven through refine/analyze/plan/execute.
///
/// Tasks live in a `BTreeMap` keyed by task id plus an ordered `task_order`
/// list. Every id in `task_order` must exist in the map; ids present only in
/// the map (older plans) are iterated after the ordered ones, in map order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub title: String,
    pub status: WorkflowStatus,
    pub current_phase: Phase,
    pub original_prompt: String,
    pub optimized_prompt: Option<String>,
    pub analysis: Option<String>,
    pub base_branch: String,
    pub workflow_branch: Option<String>,
    pub tasks: BTreeMap<String, Task>,
    pub task_order: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub resume_count: u32,
    pub max_resumes: u32,
    pub last_error: Option<String>,
    pub metrics: WorkflowMetrics,
    pub options: WorkflowOptions,
}

impl Workflow {
    pub fn new(prompt: impl Into<String>, title: impl Into<String>, base_branch: impl Into<String>) -> Self {
        let now = Utc::now();
        Workflow {
            id: WorkflowId::generate(),
            title: title.into(),
            status: WorkflowStatus::Pending,
            current_phase: Phase::Refine,
            original_prompt: prompt.into(),
            optimized_prompt: None,
            analysis: None,
            base_branch: base_branch.into(),
            workflow_branch: None,
            tasks: BTreeMap::new(),
            task_order: Vec::new(),
            created_at: now,
            updated_at: now,
            heartbeat_at: None,
            resume_count: 0,
            max_resumes: 3,
            last_error: None,
            metrics: WorkflowMetrics::default(),
            options: WorkflowOptions::default(),
        }
    }

    pub fn transition(&mut self, next: WorkflowStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(QuorumError::fatal(format!(
                "illegal workflow transition {} -> {} for {}",
                self.status.as_str(),
                next.as_str(),
                self.id
            )));
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Task ids in deterministic scheduling order: `task_order` first, then
    /// any orphaned map entries in map (id) order.
    pub fn ordered_task_ids(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .task_order
            .iter()
            .filter(|id| self.tasks.contains_key(*id))
            .cloned()
            .collect();
        for id in self.tasks.keys() {
            if !self.task_order.contains(id) {
                out.push(id.clone());
            }
        }
        out
    }

    /// Replace the plan. Completed tasks survive a replan; everything else is
    /// discarded and re-seeded from the new task list.
    pub fn install_plan(&mut self, tasks: Vec<Task>, replan: bool) {
        if replan {
            self.tasks
                .retain(|_, t| t.status == TaskStatus::Completed);
            self.task_order
                .retain(|id| self.tasks.contains_key(id));
        } else {
            self.tasks.clear();
            self.task_order.clear();
        }
        for task in tasks {
            if self.tasks.contains_key(&task.id) {
                continue;
            }
            self.task_order.push(task.id.clone());
            self.tasks.insert(task.id.clone(), task);
        }
        self.touch();
    }
}

/// Durable marker that a phase (or a task within one) finished, consulted on
/// resume to decide what to skip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub workflow_id: WorkflowId,
    pub phase: Phase,
    pub task_id: Option<String>,
    pub payload_digest: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchStatus {
    Active,
    Merged,
    Stale,
    Conflicted,
}

impl BranchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BranchStatus::Active => "active",
            BranchStatus::Merged => "merged",
            BranchStatus::Stale => "stale",
            BranchStatus::Conflicted => "conflicted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(BranchStatus::Active),
            "merged" => Ok(BranchStatus::Merged),
            "stale" => Ok(BranchStatus::Stale),
            "conflicted" => Ok(BranchStatus::Conflicted),
            other => Err(QuorumError::validation(format!(
                "unknown branch status '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowBranchInfo {
    pub workflow_id: WorkflowId,
    pub branch_name: String,
    pub base_branch: String,
    pub created_at: DateTime<Utc>,
    pub head_commit: Option<String>,
    pub status: BranchStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_ids_are_prefixed_and_unique() {
        let a = WorkflowId::generate();
        let b = WorkflowId::generate();
        assert!(a.as_str().starts_with("wf-"));
        assert_ne!(a, b);
    }

    #[test]
    fn workflow_id_parse_rejects_garbage() {
        assert!(WorkflowId::parse("wf-20260101000000-abc123").is_ok());
        assert!(WorkflowId::parse("not-an-id").is_err());
        assert!(WorkflowId::parse("").is_err());
    }

    #[test]
    fn status_transitions() {
        use WorkflowStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Running));
        assert!(Paused.can_transition_to(Cancelled));
    }

    #[test]
    fn transition_rejects_illegal_moves() {
        let mut wf = Workflow::new("prompt", "title", "main");
        wf.transition(WorkflowStatus::Running).unwrap();
        wf.transition(WorkflowStatus::Completed).unwrap();
        assert!(wf.transition(WorkflowStatus::Running).is_err());
    }

    #[test]
    fn ordered_task_ids_appends_orphans_in_map_order() {
        let mut wf = Workflow::new("p", "t", "main");
        wf.tasks.insert("t2".into(), Task::new("t2", "two", "claude"));
        wf.tasks.insert("t1".into(), Task::new("t1", "one", "claude"));
        wf.tasks.insert("t9".into(), Task::new("t9", "nine", "claude"));
        wf.tasks.insert("t0".into(), Task::new("t0", "zero", "claude"));
        wf.task_order = vec!["t2".into(), "t1".into()];

        let order = wf.ordered_task_ids();
        assert_eq!(order, vec!["t2", "t1", "t0", "t9"]);
    }

    #[test]
    fn ordered_task_ids_skips_dangling_order_entries() {
        let mut wf = Workflow::new("p", "t", "main");
        wf.tasks.insert("t1".into(), Task::new("t1", "one", "claude"));
        wf.task_order = vec!["ghost".into(), "t1".into()];
        assert_eq!(wf.ordered_task_ids(), vec!["t1"]);
    }

    #[test]
    fn replan_preserves_completed_tasks() {
        let mut wf = Workflow::new("p", "t", "main");
        let mut done = Task::new("t1", "one", "claude");
        done.status = TaskStatus::Completed;
        wf.install_plan(vec![done, Task::new("t2", "two", "claude")], false);

        wf.install_plan(
            vec![Task::new("t1", "one again", "claude"), Task::new("t3", "three", "claude")],
            true,
        );
        assert_eq!(wf.tasks.len(), 2);
        assert_eq!(wf.tasks["t1"].status, TaskStatus::Completed);
        assert_eq!(wf.tasks["t1"].name, "one");
        assert!(wf.tasks.contains_key("t3"));
        assert!(!wf.tasks.contains_key("t2"));
    }
}
