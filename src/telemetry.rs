use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::OutputMode;

/// Initialize structured logging. Log lines go to stderr so they never mix
/// with command output; `RUST_LOG` filters as usual, default `warn` so the
/// CLI stays quiet unless asked.
pub fn init_telemetry(mode: OutputMode) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    if mode == OutputMode::Json {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true),
            )
            .with(filter)
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .try_init()
            .ok();
    }
    Ok(())
}
