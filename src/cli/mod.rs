use clap::{Parser, Subcommand};

pub mod commands;

#[derive(Parser)]
#[command(name = "quorum")]
#[command(about = "Multi-agent workflow orchestrator for CLI coding assistants")]
#[command(long_about = "Quorum drives external coding assistants (claude, gemini, codex, \
                       copilot, opencode) through a refine → analyze → plan → execute \
                       pipeline, executing planned tasks concurrently in isolated git \
                       worktrees on a per-workflow branch.")]
pub struct Cli {
    /// Output mode override: plain, json or quiet
    #[arg(long, global = true, help = "Override the configured output mode")]
    pub output: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a prompt through the full pipeline and wait for completion
    Run {
        /// The natural-language request to implement
        prompt: String,
        /// Workflow title (derived from the prompt when omitted)
        #[arg(long)]
        title: Option<String>,
        /// Base branch for the workflow branch (repository default when omitted)
        #[arg(long)]
        base_branch: Option<String>,
        /// Agent driving the phases and any tasks that name none
        #[arg(long)]
        agent: Option<String>,
        /// Model override passed to the agent
        #[arg(long)]
        model: Option<String>,
        /// Maximum tasks executing concurrently
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Return immediately instead of waiting for the pipeline
        #[arg(long, help = "Start in the background and print the workflow id")]
        detach: bool,
    },
    /// Resume a paused workflow
    Resume {
        /// Workflow id (wf-...)
        id: String,
    },
    /// Pause a running workflow at its next task boundary
    Pause {
        /// Workflow id (wf-...)
        id: String,
    },
    /// Cancel a workflow (idempotent)
    Cancel {
        /// Workflow id (wf-...)
        id: String,
    },
    /// Show one workflow in detail, or a one-line summary of the latest
    Status {
        /// Workflow id (wf-...); latest workflow when omitted
        id: Option<String>,
    },
    /// List workflows
    List {
        /// Only workflows with a live runner in this process
        #[arg(long)]
        active: bool,
        /// Filter by status (pending, running, paused, completed, failed, cancelled)
        #[arg(long)]
        status: Option<String>,
    },
    /// Branch-level operations on finished workflows
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
    /// Serve the HTTP API
    Serve {
        /// Bind address (host:port)
        #[arg(long)]
        bind: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum WorkflowCommands {
    /// Merge a finished workflow's branch into its base branch
    Merge {
        /// Workflow id (wf-...)
        id: String,
        /// Merge strategy: ff or merge
        #[arg(long, default_value = "merge")]
        strategy: String,
    },
    /// Remove worktrees and merged task branches of finished workflows
    Cleanup {
        /// Limit cleanup to one workflow id
        id: Option<String>,
        /// Also purge terminal workflows older than this age (e.g. 7d, 24h)
        #[arg(long)]
        older: Option<String>,
    },
}
