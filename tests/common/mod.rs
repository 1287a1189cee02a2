//! Shared harness: a scratch git repository, a scripted agent, and an
//! orchestrator wired the way the binary wires one.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use git2::{Repository, Signature};
use tempfile::TempDir;

use quorum::{
    AgentRegistry, CreateOptions, EventBus, EventEnvelope, EventPayload, EventSubscriber,
    GitClient, Orchestrator, QuorumConfig, RateLimiterRegistry, ScriptedAgent, ScriptedOutcome,
    StateStore, WorkflowId, WorktreeManager,
};

pub const STUB: &str = "stub";

pub struct Harness {
    pub dir: TempDir,
    pub orchestrator: Arc<Orchestrator>,
    pub agent: Arc<ScriptedAgent>,
    pub store: Arc<StateStore>,
    pub git: GitClient,
}

pub fn test_config() -> QuorumConfig {
    let mut config = QuorumConfig::default();
    config.default_agent = STUB.to_string();
    config.max_parallel_tasks = 1;
    config.heartbeat_interval_secs = 1;
    config.rate_limits.insert(
        STUB.to_string(),
        quorum::config::RateLimitOverride {
            capacity: 1000,
            refill_per_second: 1000.0,
        },
    );
    config
}

pub async fn harness() -> Harness {
    harness_with_config(test_config()).await
}

pub async fn harness_with_config(config: QuorumConfig) -> Harness {
    harness_with_agent(config, ScriptedAgent::new(STUB)).await
}

pub async fn harness_with_agent(config: QuorumConfig, agent: ScriptedAgent) -> Harness {
    let dir = TempDir::new().unwrap();
    init_git_repo(dir.path());

    let agent = Arc::new(agent);
    let registry = AgentRegistry::empty();
    registry.register(STUB, Arc::clone(&agent) as Arc<dyn quorum::Agent>);

    let store = Arc::new(StateStore::open(dir.path()).await.unwrap());
    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        registry,
        RateLimiterRegistry::new(config.rate_limit_overrides()),
        GitClient::new(dir.path()),
        WorktreeManager::new(dir.path()),
        EventBus::with_default_capacity(),
        config,
    )
    .unwrap();

    Harness {
        git: GitClient::new(dir.path()),
        dir,
        orchestrator,
        agent,
        store,
    }
}

pub fn init_git_repo(path: &std::path::Path) {
    let repo = Repository::init(path).unwrap();
    let sig = Signature::now("tester", "tester@example.com").unwrap();
    let tree_id = repo.index().unwrap().write_tree().unwrap();
    let tree = repo.find_tree(tree_id).unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
        .unwrap();
}

/// JSON plan body in the shape the plan phase parses.
pub fn plan_json(tasks: &[(&str, &[&str])]) -> String {
    let entries: Vec<serde_json::Value> = tasks
        .iter()
        .map(|(id, deps)| {
            serde_json::json!({
                "id": id,
                "name": format!("task {id}"),
                "dependencies": deps,
            })
        })
        .collect();
    serde_json::to_string(&entries).unwrap()
}

/// Queue the refine/analyze/plan responses that precede execution.
pub fn push_pipeline(agent: &ScriptedAgent, plan: &str) {
    agent.push(ScriptedOutcome::Succeed {
        text: "refined prompt".into(),
    });
    agent.push(ScriptedOutcome::Succeed {
        text: "analysis of the repository".into(),
    });
    agent.push(ScriptedOutcome::Succeed { text: plan.into() });
}

/// Queue a successful task attempt that writes one file.
pub fn push_task_success(agent: &ScriptedAgent, file: &str) {
    agent.push(ScriptedOutcome::WriteFile {
        path: file.to_string(),
        contents: format!("contents of {file}\n"),
    });
}

pub async fn create_workflow(h: &Harness, prompt: &str) -> WorkflowId {
    h.orchestrator
        .create(CreateOptions {
            prompt: prompt.to_string(),
            ..CreateOptions::default()
        })
        .await
        .unwrap()
}

/// Drain a subscriber until the workflow hits a terminal event, collecting
/// everything it published along the way.
pub async fn collect_until_terminal(
    subscriber: &mut EventSubscriber,
    id: &WorkflowId,
) -> Vec<EventEnvelope> {
    let mut events = Vec::new();
    loop {
        let envelope = tokio::time::timeout(Duration::from_secs(30), subscriber.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event bus closed unexpectedly");
        if envelope.workflow_id != *id {
            continue;
        }
        let terminal = matches!(
            envelope.payload,
            EventPayload::WorkflowCompleted { .. } | EventPayload::WorkflowFailed { .. }
        );
        events.push(envelope);
        if terminal {
            return events;
        }
    }
}

/// Event-type names in arrival order, filtered to the lifecycle events the
/// scenarios in the test suites assert on.
pub fn lifecycle_trace(events: &[EventEnvelope]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::WorkflowStarted { .. } => Some("started".to_string()),
            EventPayload::PhaseStarted { phase, .. } => Some(format!("phase:{phase}")),
            EventPayload::TaskStarted { task_id, .. } => Some(format!("task_started:{task_id}")),
            EventPayload::TaskCompleted { task_id, .. } => {
                Some(format!("task_completed:{task_id}"))
            }
            EventPayload::TaskFailed { task_id, .. } => Some(format!("task_failed:{task_id}")),
            EventPayload::TaskSkipped { task_id, .. } => Some(format!("task_skipped:{task_id}")),
            EventPayload::WorkflowCompleted { .. } => Some("completed".to_string()),
            EventPayload::WorkflowFailed { kind, .. } => Some(format!("failed:{kind}")),
            _ => None,
        })
        .collect()
}
