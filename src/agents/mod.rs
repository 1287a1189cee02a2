// Agent adapters and the capability surface the executor programs against.
// The core never names a concrete CLI; it asks the registry for an Agent.

pub mod rate_limiter;

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{QuorumError, Result};

pub use rate_limiter::{default_settings, RateLimitSettings, RateLimiterRegistry};

pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(10);

/// The supported assistants, plus an escape hatch for arbitrary commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Gemini,
    Codex,
    Copilot,
    OpenCode,
    Custom { name: String, command: String },
}

impl AgentKind {
    pub const BUILTIN: [AgentKind; 5] = [
        AgentKind::Claude,
        AgentKind::Gemini,
        AgentKind::Codex,
        AgentKind::Copilot,
        AgentKind::OpenCode,
    ];

    pub fn name(&self) -> &str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Gemini => "gemini",
            AgentKind::Codex => "codex",
            AgentKind::Copilot => "copilot",
            AgentKind::OpenCode => "opencode",
            AgentKind::Custom { name, .. } => name,
        }
    }

    pub fn command(&self) -> &str {
        match self {
            AgentKind::Custom { command, .. } => command,
            other => other.name(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentResult {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub name: String,
    pub command: String,
    pub default_model: Option<String>,
}

/// Capability set the executor programs against.
#[async_trait]
pub trait Agent: Send + Sync {
    async fn invoke(&self, cancel: &CancellationToken, request: InvokeRequest)
        -> Result<AgentResult>;

    fn describe(&self) -> AgentDescriptor;
}

/// Subprocess-backed adapter: spawns the assistant's CLI with the prompt as
/// its final argument, the task directory as CWD, and a per-agent timeout.
/// Cancellation sends SIGTERM, then a hard kill after the grace period.
pub struct CliAgent {
    name: String,
    command: String,
    extra_args: Vec<String>,
    default_model: Option<String>,
    timeout: Duration,
    kill_grace: Duration,
}

impl CliAgent {
    pub fn new(kind: &AgentKind) -> Self {
        CliAgent {
            name: kind.name().to_string(),
            command: kind.command().to_string(),
            extra_args: Vec::new(),
            default_model: None,
            timeout: DEFAULT_AGENT_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    async fn terminate(&self, child: &mut Child) {
        if let Some(pid) = child.id() {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(self.kill_grace, child.wait())
                .await
                .is_ok()
            {
                return;
            }
            warn!(agent = %self.name, "agent ignored SIGTERM, killing");
        }
        let _ = child.kill().await;
    }
}

#[async_trait]
impl Agent for CliAgent {
    async fn invoke(
        &self,
        cancel: &CancellationToken,
        request: InvokeRequest,
    ) -> Result<AgentResult> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.extra_args);
        if let Some(model) = request.model.as_ref().or(self.default_model.as_ref()) {
            cmd.arg("--model").arg(model);
        }
        cmd.arg(&request.prompt)
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(agent = %self.name, workdir = %request.workdir.display(), "invoking agent");
        let mut child = cmd.spawn().map_err(|e| QuorumError::AgentFailure {
            agent: self.name.clone(),
            message: format!("failed to spawn '{}': {e}", self.command),
        })?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();
        let reader = tokio::spawn(async move {
            let mut stdout = String::new();
            let mut stderr = String::new();
            if let Some(pipe) = stdout_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut stdout).await;
            }
            if let Some(pipe) = stderr_pipe.as_mut() {
                let _ = pipe.read_to_string(&mut stderr).await;
            }
            (stdout, stderr)
        });

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                self.terminate(&mut child).await;
                reader.abort();
                return Err(QuorumError::Cancelled);
            }
            _ = tokio::time::sleep(self.timeout) => {
                self.terminate(&mut child).await;
                reader.abort();
                return Err(QuorumError::retryable(format!(
                    "agent '{}' timed out after {:?}", self.name, self.timeout
                )));
            }
        };

        let (stdout, stderr) = reader
            .await
            .map_err(|e| QuorumError::fatal(format!("agent output reader died: {e}")))?;

        if !status.success() {
            return Err(QuorumError::AgentFailure {
                agent: self.name.clone(),
                message: format!(
                    "exit status {}: {}",
                    status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }

        // The adapters own exact token accounting; estimate when the CLI
        // reports nothing machine-readable.
        let tokens_in = (request.prompt.len() / 4) as u64;
        let tokens_out = (stdout.len() / 4) as u64;
        Ok(AgentResult {
            text: stdout,
            tokens_in,
            tokens_out,
            cost_usd: 0.0,
        })
    }

    fn describe(&self) -> AgentDescriptor {
        AgentDescriptor {
            name: self.name.clone(),
            command: self.command.clone(),
            default_model: self.default_model.clone(),
        }
    }
}

/// One step of a scripted run.
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Succeed { text: String },
    /// Write a file into the task workdir, then succeed.
    WriteFile { path: String, contents: String },
    Fail { message: String },
    FailRetryable { message: String },
    /// Hold the invocation open briefly, then succeed.
    Sleep { ms: u64, text: String },
    /// Hold the invocation open, then write a file and succeed. Lets tests
    /// keep several tasks in flight while controlling what each one edits.
    SleepThenWrite {
        ms: u64,
        path: String,
        contents: String,
    },
}

/// Deterministic in-process agent used by the test suites and offline smoke
/// runs: consumes a queue of outcomes, falls back to a fixed response.
pub struct ScriptedAgent {
    name: String,
    steps: Mutex<VecDeque<ScriptedOutcome>>,
    fallback: ScriptedOutcome,
    invocations: Mutex<Vec<InvokeRequest>>,
}

impl ScriptedAgent {
    pub fn new(name: impl Into<String>) -> Self {
        ScriptedAgent {
            name: name.into(),
            steps: Mutex::new(VecDeque::new()),
            fallback: ScriptedOutcome::Succeed { text: "ok".into() },
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, outcome: ScriptedOutcome) -> &Self {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(outcome);
        self
    }

    pub fn with_fallback(mut self, outcome: ScriptedOutcome) -> Self {
        self.fallback = outcome;
        self
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn invocations(&self) -> Vec<InvokeRequest> {
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn result(text: String) -> AgentResult {
        AgentResult {
            tokens_in: 10,
            tokens_out: 20,
            cost_usd: 0.001,
            text,
        }
    }
}

#[async_trait]
impl Agent for ScriptedAgent {
    async fn invoke(
        &self,
        cancel: &CancellationToken,
        request: InvokeRequest,
    ) -> Result<AgentResult> {
        if cancel.is_cancelled() {
            return Err(QuorumError::Cancelled);
        }
        let step = self
            .steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        self.invocations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());

        match step {
            ScriptedOutcome::Succeed { text } => Ok(Self::result(text)),
            ScriptedOutcome::WriteFile { path, contents } => {
                let full = request.workdir.join(&path);
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&full, contents)?;
                Ok(Self::result(format!("wrote {path}")))
            }
            ScriptedOutcome::Fail { message } => Err(QuorumError::AgentFailure {
                agent: self.name.clone(),
                message,
            }),
            ScriptedOutcome::FailRetryable { message } => Err(QuorumError::retryable(message)),
            ScriptedOutcome::Sleep { ms, text } => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(Self::result(text)),
                    _ = cancel.cancelled() => Err(QuorumError::Cancelled),
                }
            }
            ScriptedOutcome::SleepThenWrite { ms, path, contents } => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        let full = request.workdir.join(&path);
                        if let Some(parent) = full.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(&full, contents)?;
                        Ok(Self::result(format!("wrote {path}")))
                    }
                    _ = cancel.cancelled() => Err(QuorumError::Cancelled),
                }
            }
        }
    }

    fn describe(&self) -> AgentDescriptor {
        AgentDescriptor {
            name: self.name.clone(),
            command: "<scripted>".to_string(),
            default_model: None,
        }
    }
}

/// Name-keyed registry the core consumes. Yields whatever `Agent` was
/// registered for a name; unknown names are a validation error.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Arc<dyn Agent>>>,
}

impl AgentRegistry {
    pub fn empty() -> Arc<Self> {
        Arc::new(AgentRegistry {
            agents: RwLock::new(HashMap::new()),
        })
    }

    /// Registry preloaded with a subprocess adapter per built-in assistant.
    pub fn with_builtin_agents() -> Arc<Self> {
        let registry = Self::empty();
        for kind in AgentKind::BUILTIN {
            registry.register(kind.name(), Arc::new(CliAgent::new(&kind)));
        }
        registry
    }

    pub fn register(&self, name: &str, agent: Arc<dyn Agent>) {
        self.agents
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Agent>> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| QuorumError::validation(format!("unknown agent '{name}'")))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(dir: &TempDir) -> InvokeRequest {
        InvokeRequest {
            prompt: "do the thing".into(),
            workdir: dir.path().to_path_buf(),
            model: None,
        }
    }

    #[test]
    fn registry_knows_builtin_agents() {
        let registry = AgentRegistry::with_builtin_agents();
        assert_eq!(
            registry.names(),
            vec!["claude", "codex", "copilot", "gemini", "opencode"]
        );
        assert!(registry.get("claude").is_ok());
        let err = match registry.get("cursor") {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, QuorumError::Validation(_)));
    }

    #[test]
    fn custom_kind_carries_its_command() {
        let kind = AgentKind::Custom {
            name: "localmodel".into(),
            command: "/usr/local/bin/lm".into(),
        };
        assert_eq!(kind.name(), "localmodel");
        assert_eq!(kind.command(), "/usr/local/bin/lm");
        let descriptor = CliAgent::new(&kind).describe();
        assert_eq!(descriptor.command, "/usr/local/bin/lm");
    }

    #[tokio::test]
    async fn scripted_agent_consumes_queue_then_fallback() {
        let dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new("stub");
        agent.push(ScriptedOutcome::Succeed {
            text: "first".into(),
        });
        agent.push(ScriptedOutcome::Fail {
            message: "second".into(),
        });
        let cancel = CancellationToken::new();

        let one = agent.invoke(&cancel, request(&dir)).await.unwrap();
        assert_eq!(one.text, "first");
        let two = agent.invoke(&cancel, request(&dir)).await.unwrap_err();
        assert!(matches!(two, QuorumError::AgentFailure { .. }));
        let three = agent.invoke(&cancel, request(&dir)).await.unwrap();
        assert_eq!(three.text, "ok");
        assert_eq!(agent.invocation_count(), 3);
    }

    #[tokio::test]
    async fn scripted_write_file_lands_in_workdir() {
        let dir = TempDir::new().unwrap();
        let agent = ScriptedAgent::new("stub");
        agent.push(ScriptedOutcome::WriteFile {
            path: "src/health.rs".into(),
            contents: "pub fn health() {}".into(),
        });
        let cancel = CancellationToken::new();
        agent.invoke(&cancel, request(&dir)).await.unwrap();
        assert!(dir.path().join("src/health.rs").exists());
    }

    #[tokio::test]
    async fn cli_agent_captures_stdout() {
        let dir = TempDir::new().unwrap();
        let kind = AgentKind::Custom {
            name: "echo".into(),
            command: "echo".into(),
        };
        let agent = CliAgent::new(&kind);
        let cancel = CancellationToken::new();
        let result = agent.invoke(&cancel, request(&dir)).await.unwrap();
        assert!(result.text.contains("do the thing"));
        assert!(result.tokens_out > 0);
    }

    #[tokio::test]
    async fn cli_agent_failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let kind = AgentKind::Custom {
            name: "false".into(),
            command: "false".into(),
        };
        let agent = CliAgent::new(&kind);
        let cancel = CancellationToken::new();
        let err = agent.invoke(&cancel, request(&dir)).await.unwrap_err();
        assert!(matches!(err, QuorumError::AgentFailure { .. }));
    }

    #[tokio::test]
    async fn cli_agent_times_out_as_retryable() {
        let dir = TempDir::new().unwrap();
        let kind = AgentKind::Custom {
            name: "sleepy".into(),
            command: "sh".into(),
        };
        let agent = CliAgent::new(&kind)
            .with_args(vec!["-c".into(), "sleep 5".into()])
            .with_timeout(Duration::from_millis(100))
            .with_kill_grace(Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let err = agent.invoke(&cancel, request(&dir)).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn cli_agent_cancellation_terminates_child() {
        let dir = TempDir::new().unwrap();
        let kind = AgentKind::Custom {
            name: "sleepy".into(),
            command: "sh".into(),
        };
        let agent = CliAgent::new(&kind)
            .with_args(vec!["-c".into(), "sleep 5".into()])
            .with_kill_grace(Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel_clone.cancel();
        });
        let err = agent.invoke(&cancel, request(&dir)).await.unwrap_err();
        assert!(matches!(err, QuorumError::Cancelled));
    }
}
