// Quorum library - multi-agent workflow orchestration core.
// Exposes the components for the CLI binary, the HTTP surface and the tests.

pub mod agents;
pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod git;
pub mod http;
pub mod report;
pub mod shutdown;
pub mod store;
pub mod telemetry;
pub mod workflow;

// Re-export key types for easy access
pub use agents::{
    Agent, AgentDescriptor, AgentKind, AgentRegistry, AgentResult, CliAgent, InvokeRequest,
    RateLimitSettings, RateLimiterRegistry, ScriptedAgent, ScriptedOutcome,
};
pub use config::{OutputMode, QuorumConfig};
pub use error::{ErrorKind, QuorumError, Result};
pub use events::{EventBus, EventEnvelope, EventPayload, EventSubscriber};
pub use executor::{ExecuteOutcome, Executor};
pub use git::{CommitResult, GitClient, MergeOutcome, MergeStrategy, WorktreeInfo, WorktreeManager};
pub use report::write_report;
pub use shutdown::ShutdownCoordinator;
pub use store::{LockManager, LockRecord, StateStore, WorkflowLockGuard};
pub use telemetry::init_telemetry;
pub use workflow::{
    BranchStatus, Checkpoint, ControlPlane, CreateOptions, Orchestrator, Phase, PhaseOutcome,
    PhaseRegistry, PhaseRunner, RunnerCall, RunnerSettings, Task, TaskStatus, Workflow,
    WorkflowBranchInfo, WorkflowContext, WorkflowHandle, WorkflowId, WorkflowMetrics,
    WorkflowOptions, WorkflowRunner, WorkflowStatus,
};
