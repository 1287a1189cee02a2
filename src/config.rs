use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::agents::RateLimitSettings;

/// Main configuration structure for Quorum.
///
/// Precedence: built-in defaults, then `.quorum/config.yaml` / `quorum.yaml`,
/// then `QUORUM_*` environment variables (`__` separates nesting).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuorumConfig {
    /// Cap on simultaneously running workflows.
    pub max_concurrent_workflows: usize,
    /// Default per-workflow task parallelism.
    pub max_parallel_tasks: usize,
    /// Hard per-workflow ceiling no option may exceed.
    pub max_concurrent_tasks_per_workflow: usize,
    /// Seconds between heartbeat updates while a runner holds its lock.
    pub heartbeat_interval_secs: u64,
    /// Heartbeat staleness after which a running workflow counts as a zombie.
    pub zombie_threshold_secs: u64,
    /// Maximum resumes per workflow.
    pub max_resumes: u32,
    /// Grace period between SIGTERM and a hard kill of agent subprocesses.
    pub cancel_grace_secs: u64,
    /// Agent used for phases and for tasks that name none.
    pub default_agent: String,
    pub default_model: Option<String>,
    /// Run tasks in per-task worktrees (degrades gracefully when off or
    /// when creation fails).
    pub worktrees_enabled: bool,
    /// Opt-in: merge the workflow branch to base when a run completes.
    pub auto_merge_on_success: bool,
    /// Base branch for workflow branches; repository default when unset.
    pub base_branch: Option<String>,
    /// Per-agent rate-limit overrides.
    pub rate_limits: HashMap<String, RateLimitOverride>,
    /// Per-agent invocation timeouts in seconds; agents keep their built-in
    /// default when absent.
    pub agent_timeouts: HashMap<String, u64>,
    pub output: OutputConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RateLimitOverride {
    pub capacity: u32,
    pub refill_per_second: f64,
}

impl From<RateLimitOverride> for RateLimitSettings {
    fn from(o: RateLimitOverride) -> Self {
        RateLimitSettings::new(o.capacity, o.refill_per_second)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OutputConfig {
    /// `tui`, `plain`, `json` or `quiet`. TUI rendering itself lives in a
    /// consumer; this crate treats `tui` as `plain`.
    pub mode: String,
    pub color: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            mode: "plain".to_string(),
            color: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            bind: "127.0.0.1:8423".to_string(),
        }
    }
}

impl Default for QuorumConfig {
    fn default() -> Self {
        QuorumConfig {
            max_concurrent_workflows: 4,
            max_parallel_tasks: 4,
            max_concurrent_tasks_per_workflow: 8,
            heartbeat_interval_secs: 10,
            zombie_threshold_secs: 30,
            max_resumes: 3,
            cancel_grace_secs: 10,
            default_agent: "claude".to_string(),
            default_model: None,
            worktrees_enabled: true,
            auto_merge_on_success: false,
            base_branch: None,
            rate_limits: HashMap::new(),
            agent_timeouts: HashMap::new(),
            output: OutputConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

/// Resolved output mode after environment conventions are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Plain,
    Json,
    Quiet,
}

impl QuorumConfig {
    /// Load configuration with file and environment layering.
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        if Path::new(".quorum/config.yaml").exists() {
            builder = builder
                .add_source(File::new(".quorum/config.yaml", FileFormat::Yaml).required(false));
        }
        if Path::new("quorum.yaml").exists() {
            builder = builder.add_source(File::new("quorum.yaml", FileFormat::Yaml).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("QUORUM")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let quorum_config: QuorumConfig = config.try_deserialize()?;
        Ok(quorum_config)
    }

    /// Load `.env` if present.
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
        }
        Ok(())
    }

    /// The §-style conventions: a CI variable forces plain, `NO_COLOR`
    /// strips color, `tui` is a consumer concern and falls back to plain.
    pub fn resolved_output_mode(&self) -> OutputMode {
        if std::env::var_os("CI").is_some() {
            return OutputMode::Plain;
        }
        match self.output.mode.as_str() {
            "json" => OutputMode::Json,
            "quiet" => OutputMode::Quiet,
            _ => OutputMode::Plain,
        }
    }

    pub fn color_enabled(&self) -> bool {
        self.output.color && std::env::var_os("NO_COLOR").is_none()
    }

    pub fn rate_limit_overrides(&self) -> HashMap<String, RateLimitSettings> {
        self.rate_limits
            .iter()
            .map(|(name, o)| (name.clone(), RateLimitSettings::from(*o)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = QuorumConfig::default();
        assert_eq!(cfg.max_concurrent_workflows, 4);
        assert_eq!(cfg.max_parallel_tasks, 4);
        assert_eq!(cfg.heartbeat_interval_secs, 10);
        assert_eq!(cfg.zombie_threshold_secs, 30);
        assert_eq!(cfg.max_resumes, 3);
        assert_eq!(cfg.cancel_grace_secs, 10);
        assert_eq!(cfg.default_agent, "claude");
        assert!(cfg.worktrees_enabled);
        assert!(!cfg.auto_merge_on_success);
    }

    #[test]
    fn rate_limit_overrides_convert() {
        let mut cfg = QuorumConfig::default();
        cfg.rate_limits.insert(
            "claude".to_string(),
            RateLimitOverride {
                capacity: 20,
                refill_per_second: 2.0,
            },
        );
        let overrides = cfg.rate_limit_overrides();
        assert_eq!(overrides["claude"], RateLimitSettings::new(20, 2.0));
    }

    #[test]
    fn output_mode_resolution() {
        let mut cfg = QuorumConfig::default();
        cfg.output.mode = "json".to_string();
        // Unless CI forces plain, json stays json.
        if std::env::var_os("CI").is_none() {
            assert_eq!(cfg.resolved_output_mode(), OutputMode::Json);
        }
        cfg.output.mode = "tui".to_string();
        if std::env::var_os("CI").is_none() {
            assert_eq!(cfg.resolved_output_mode(), OutputMode::Plain);
        }
    }
}
