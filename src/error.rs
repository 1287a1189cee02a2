use thiserror::Error;

/// Classification of an error independent of the concrete variant.
///
/// The executor retries `Retryable` failures, the runner pauses instead of
/// failing when a phase error is `Retryable`, and the CLI maps kinds to exit
/// codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    LockBusy,
    Retryable,
    AgentFailure,
    MergeConflict,
    Degraded,
    Cancelled,
    Fatal,
}

/// Crate-wide error type for the orchestration core.
#[derive(Debug, Error)]
pub enum QuorumError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("workflow lock busy: {0}")]
    LockBusy(String),

    #[error("workflow {0} is already running")]
    AlreadyRunning(String),

    #[error("concurrent workflow limit of {limit} reached")]
    MaxConcurrent { limit: usize },

    #[error("plan contains a dependency cycle: {0}")]
    CyclicPlan(String),

    #[error("transient failure: {0}")]
    Retryable(String),

    #[error("agent '{agent}' failed: {message}")]
    AgentFailure { agent: String, message: String },

    #[error("merge conflict finalizing task {task_id}: {files:?}")]
    MergeConflict {
        task_id: String,
        files: Vec<String>,
    },

    #[error("degraded isolation: {0}")]
    Degraded(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl QuorumError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            QuorumError::Validation(_) | QuorumError::CyclicPlan(_) => ErrorKind::Validation,
            QuorumError::NotFound(_) => ErrorKind::NotFound,
            QuorumError::LockBusy(_)
            | QuorumError::AlreadyRunning(_)
            | QuorumError::MaxConcurrent { .. } => ErrorKind::LockBusy,
            QuorumError::Retryable(_) => ErrorKind::Retryable,
            QuorumError::AgentFailure { .. } => ErrorKind::AgentFailure,
            QuorumError::MergeConflict { .. } => ErrorKind::MergeConflict,
            QuorumError::Degraded(_) => ErrorKind::Degraded,
            QuorumError::Cancelled => ErrorKind::Cancelled,
            QuorumError::Fatal(_) => ErrorKind::Fatal,
            QuorumError::Store(e) => {
                if is_busy_sqlx(e) {
                    ErrorKind::Retryable
                } else {
                    ErrorKind::Fatal
                }
            }
            QuorumError::Git(e) => {
                if e.code() == git2::ErrorCode::Locked {
                    ErrorKind::Retryable
                } else {
                    ErrorKind::Fatal
                }
            }
            QuorumError::Io(_) => ErrorKind::Retryable,
            QuorumError::Serde(_) => ErrorKind::Validation,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    /// Exit code for the CLI surface: 0 success, 2 usage (clap), 3 validation,
    /// 4 not-found, 5 busy/locked, 6 agent/external failure, 1 unexpected.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Validation => 3,
            ErrorKind::NotFound => 4,
            ErrorKind::LockBusy => 5,
            ErrorKind::AgentFailure | ErrorKind::MergeConflict => 6,
            _ => 1,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        QuorumError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        QuorumError::NotFound(msg.into())
    }

    pub fn retryable(msg: impl Into<String>) -> Self {
        QuorumError::Retryable(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        QuorumError::Fatal(msg.into())
    }
}

/// SQLITE_BUSY surfaces as database error code 5; under contention sqlx can
/// also report a pool timeout before the busy handler fires.
pub(crate) fn is_busy_sqlx(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            let code = db.code();
            code.as_deref() == Some("5")
                || code.as_deref() == Some("517")
                || db.message().contains("database is locked")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

pub type Result<T> = std::result::Result<T, QuorumError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_exit_codes() {
        assert_eq!(QuorumError::validation("x").exit_code(), 3);
        assert_eq!(QuorumError::not_found("x").exit_code(), 4);
        assert_eq!(QuorumError::LockBusy("x".into()).exit_code(), 5);
        assert_eq!(QuorumError::AlreadyRunning("wf".into()).exit_code(), 5);
        assert_eq!(QuorumError::MaxConcurrent { limit: 2 }.exit_code(), 5);
        assert_eq!(
            QuorumError::AgentFailure {
                agent: "claude".into(),
                message: "boom".into()
            }
            .exit_code(),
            6
        );
        assert_eq!(QuorumError::fatal("x").exit_code(), 1);
    }

    #[test]
    fn cyclic_plan_is_validation() {
        assert_eq!(
            QuorumError::CyclicPlan("t1 -> t2 -> t1".into()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn git_index_lock_is_retryable() {
        let e = git2::Error::new(
            git2::ErrorCode::Locked,
            git2::ErrorClass::Index,
            "index.lock exists",
        );
        assert!(QuorumError::Git(e).is_retryable());
    }

    #[test]
    fn merge_conflict_is_not_retryable() {
        let e = QuorumError::MergeConflict {
            task_id: "t1".into(),
            files: vec!["src/lib.rs".into()],
        };
        assert!(!e.is_retryable());
        assert_eq!(e.kind(), ErrorKind::MergeConflict);
    }
}
