use clap::Parser;

use quorum::cli::commands::{
    bootstrap,
    control::{CancelCommand, PauseCommand, ResumeCommand},
    list::ListCommand,
    run::RunCommand,
    serve::ServeCommand,
    status::StatusCommand,
    workflow::{CleanupCommand, MergeCommand},
};
use quorum::cli::{Cli, Commands, WorkflowCommands};
use quorum::{init_telemetry, OutputMode, QuorumConfig, QuorumError};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = QuorumConfig::load_env_file() {
        eprintln!("warning: failed to load .env: {e}");
    }
    let config = match QuorumConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("warning: failed to load configuration, using defaults: {e}");
            QuorumConfig::default()
        }
    };

    let mode = match cli.output.as_deref() {
        Some("json") => OutputMode::Json,
        Some("quiet") => OutputMode::Quiet,
        Some(_) => OutputMode::Plain,
        None => config.resolved_output_mode(),
    };

    if let Err(e) = init_telemetry(mode) {
        eprintln!("warning: failed to initialize telemetry: {e}");
    }

    let code = match dispatch(cli.command, config, mode).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn dispatch(
    command: Commands,
    config: QuorumConfig,
    mode: OutputMode,
) -> Result<(), QuorumError> {
    let orchestrator = bootstrap(config.clone())
        .await
        .map_err(|e| QuorumError::fatal(format!("{e:#}")))?;

    match command {
        Commands::Run {
            prompt,
            title,
            base_branch,
            agent,
            model,
            max_parallel,
            detach,
        } => {
            RunCommand {
                prompt,
                title,
                base_branch,
                agent,
                model,
                max_parallel,
                detach,
            }
            .execute(orchestrator, mode)
            .await
        }
        Commands::Resume { id } => ResumeCommand { id }.execute(orchestrator, mode).await,
        Commands::Pause { id } => PauseCommand { id }.execute(orchestrator).await,
        Commands::Cancel { id } => CancelCommand { id }.execute(orchestrator).await,
        Commands::Status { id } => {
            StatusCommand {
                id,
                color: config.color_enabled(),
            }
            .execute(orchestrator, mode)
            .await
        }
        Commands::List { active, status } => {
            ListCommand { active, status }.execute(orchestrator, mode).await
        }
        Commands::Workflow { command } => match command {
            WorkflowCommands::Merge { id, strategy } => {
                MergeCommand { id, strategy }.execute(orchestrator).await
            }
            WorkflowCommands::Cleanup { id, older } => {
                CleanupCommand { id, older }.execute(orchestrator).await
            }
        },
        Commands::Serve { bind } => ServeCommand { bind }.execute(orchestrator, &config).await,
    }
}
