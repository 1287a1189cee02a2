pub mod locks;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::Rng;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Connection, Row, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use crate::error::{is_busy_sqlx, QuorumError, Result};
use crate::workflow::types::{
    BranchStatus, Checkpoint, Phase, Task, TaskStatus, Workflow, WorkflowBranchInfo, WorkflowId,
    WorkflowMetrics, WorkflowOptions, WorkflowStatus,
};

pub use locks::{write_atomic, LockManager, LockRecord, WorkflowLockGuard, DEFAULT_LOCK_TTL};

const WRITE_RETRIES: u32 = 5;
const WRITE_BACKOFF_START: Duration = Duration::from_millis(100);
const READ_POOL_SIZE: u32 = 4;

/// Ordered, idempotent schema migrations recorded in `schema_migrations`.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    r#"
    CREATE TABLE IF NOT EXISTS workflows (
        id               TEXT PRIMARY KEY,
        title            TEXT NOT NULL,
        status           TEXT NOT NULL,
        current_phase    TEXT NOT NULL,
        original_prompt  TEXT NOT NULL,
        optimized_prompt TEXT,
        analysis         TEXT,
        base_branch      TEXT NOT NULL,
        workflow_branch  TEXT,
        created_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL,
        heartbeat_at     TEXT,
        resume_count     INTEGER NOT NULL DEFAULT 0,
        max_resumes      INTEGER NOT NULL DEFAULT 3,
        last_error       TEXT,
        metrics          TEXT NOT NULL DEFAULT '{}',
        options          TEXT NOT NULL DEFAULT '{}'
    );

    CREATE TABLE IF NOT EXISTS tasks (
        workflow_id    TEXT NOT NULL,
        id             TEXT NOT NULL,
        phase          TEXT NOT NULL,
        name           TEXT NOT NULL,
        status         TEXT NOT NULL,
        agent          TEXT NOT NULL,
        model          TEXT,
        dependencies   TEXT NOT NULL DEFAULT '[]',
        worktree_path  TEXT,
        branch         TEXT,
        last_commit    TEXT,
        files_modified TEXT NOT NULL DEFAULT '[]',
        retries        INTEGER NOT NULL DEFAULT 0,
        max_retries    INTEGER NOT NULL DEFAULT 2,
        started_at     TEXT,
        completed_at   TEXT,
        tokens_in      INTEGER NOT NULL DEFAULT 0,
        tokens_out     INTEGER NOT NULL DEFAULT 0,
        cost_usd       REAL NOT NULL DEFAULT 0,
        error          TEXT,
        resume_hint    TEXT,
        PRIMARY KEY (workflow_id, id)
    );

    CREATE TABLE IF NOT EXISTS task_order (
        workflow_id TEXT NOT NULL,
        position    INTEGER NOT NULL,
        task_id     TEXT NOT NULL,
        PRIMARY KEY (workflow_id, position)
    );

    CREATE TABLE IF NOT EXISTS checkpoints (
        workflow_id    TEXT NOT NULL,
        phase          TEXT NOT NULL,
        task_id        TEXT NOT NULL DEFAULT '',
        payload_digest TEXT NOT NULL,
        created_at     TEXT NOT NULL,
        PRIMARY KEY (workflow_id, phase, task_id)
    );

    CREATE TABLE IF NOT EXISTS running_workflows (
        workflow_id  TEXT PRIMARY KEY,
        holder_pid   INTEGER NOT NULL,
        holder_host  TEXT NOT NULL,
        heartbeat_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS workflow_locks (
        workflow_id TEXT PRIMARY KEY,
        pid         INTEGER NOT NULL,
        host        TEXT NOT NULL,
        acquired_at TEXT NOT NULL,
        expires_at  TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows (status);
    CREATE INDEX IF NOT EXISTS idx_tasks_workflow ON tasks (workflow_id);
    "#,
)];

/// Crash-consistent store of workflows, tasks, checkpoints and lock records.
///
/// Single SQLite file in WAL mode under `.quorum/state.db`. One serialized
/// writer connection with a long busy timeout; a small read pool with a short
/// one so readers never queue behind a wedged writer. Every write retries
/// `SQLITE_BUSY` with exponential backoff and jitter.
pub struct StateStore {
    root: PathBuf,
    db_path: PathBuf,
    backup_path: PathBuf,
    writer: SqlitePool,
    readers: SqlitePool,
    locks: LockManager,
}

impl StateStore {
    /// Open (creating if needed) the store under `<repo_root>/.quorum/`.
    /// Restores from the rotating backup when the primary file fails its
    /// integrity check.
    pub async fn open(repo_root: &Path) -> Result<Self> {
        let root = repo_root.join(".quorum");
        fs::create_dir_all(root.join("runs"))?;
        // Keep orchestration state out of the repository's own history.
        let gitignore = root.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, "*\n")?;
        }
        let db_path = root.join("state.db");
        let backup_path = root.join("state.db-backup");

        if db_path.exists() && !integrity_ok(&db_path).await {
            warn!(db = %db_path.display(), "state db failed integrity check");
            restore_file(&backup_path, &db_path)?;
        }

        let writer_opts = SqliteConnectOptions::new()
            .filename(&db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(writer_opts.clone())
            .await?;

        let reader_opts = writer_opts
            .create_if_missing(false)
            .busy_timeout(Duration::from_millis(500))
            .read_only(true);

        let store = StateStore {
            locks: LockManager::new(root.join("locks"))?,
            root,
            db_path,
            backup_path,
            readers: SqlitePoolOptions::new()
                .max_connections(READ_POOL_SIZE)
                .connect_with(reader_opts)
                .await?,
            writer,
        };
        store.migrate().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub async fn shutdown(&self) {
        self.writer.close().await;
        self.readers.close().await;
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
        )
        .execute(&self.writer)
        .await?;

        for &(version, sql) in MIGRATIONS {
            let applied: Option<i64> =
                sqlx::query("SELECT version FROM schema_migrations WHERE version = ?1")
                    .bind(version)
                    .fetch_optional(&self.writer)
                    .await?
                    .map(|row| row.get(0));
            if applied.is_some() {
                continue;
            }
            let mut tx = self.writer.begin().await?;
            sqlx::raw_sql(sql).execute(&mut *tx).await?;
            sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)")
                .bind(version)
                .bind(Utc::now().to_rfc3339())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            info!(version, "applied schema migration");
        }
        Ok(())
    }

    // ---- workflows ------------------------------------------------------

    /// Persist the whole workflow aggregate (row, tasks, order) in one
    /// transaction, then rotate the backup copy.
    pub async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        with_busy_retry(|| Box::pin(self.save_workflow_once(workflow))).await?;
        if let Err(e) = self.rotate_backup().await {
            warn!("backup rotation failed: {e}");
        }
        Ok(())
    }

    async fn save_workflow_once(&self, wf: &Workflow) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.writer.begin().await?;

        sqlx::query(
            "INSERT INTO workflows (id, title, status, current_phase, original_prompt,
                 optimized_prompt, analysis, base_branch, workflow_branch, created_at,
                 updated_at, heartbeat_at, resume_count, max_resumes, last_error, metrics, options)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(id) DO UPDATE SET
                 title = excluded.title,
                 status = excluded.status,
                 current_phase = excluded.current_phase,
                 original_prompt = excluded.original_prompt,
                 optimized_prompt = excluded.optimized_prompt,
                 analysis = excluded.analysis,
                 base_branch = excluded.base_branch,
                 workflow_branch = excluded.workflow_branch,
                 updated_at = excluded.updated_at,
                 heartbeat_at = excluded.heartbeat_at,
                 resume_count = excluded.resume_count,
                 max_resumes = excluded.max_resumes,
                 last_error = excluded.last_error,
                 metrics = excluded.metrics,
                 options = excluded.options",
        )
        .bind(wf.id.as_str())
        .bind(&wf.title)
        .bind(wf.status.as_str())
        .bind(wf.current_phase.as_str())
        .bind(&wf.original_prompt)
        .bind(&wf.optimized_prompt)
        .bind(&wf.analysis)
        .bind(&wf.base_branch)
        .bind(&wf.workflow_branch)
        .bind(wf.created_at.to_rfc3339())
        .bind(wf.updated_at.to_rfc3339())
        .bind(wf.heartbeat_at.map(|t| t.to_rfc3339()))
        .bind(wf.resume_count as i64)
        .bind(wf.max_resumes as i64)
        .bind(&wf.last_error)
        .bind(serde_json::to_string(&wf.metrics).unwrap_or_else(|_| "{}".to_string()))
        .bind(serde_json::to_string(&wf.options).unwrap_or_else(|_| "{}".to_string()))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tasks WHERE workflow_id = ?1")
            .bind(wf.id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM task_order WHERE workflow_id = ?1")
            .bind(wf.id.as_str())
            .execute(&mut *tx)
            .await?;

        for task in wf.tasks.values() {
            bind_task_insert(wf.id.as_str(), task).execute(&mut *tx).await?;
        }
        for (position, task_id) in wf.task_order.iter().enumerate() {
            sqlx::query(
                "INSERT INTO task_order (workflow_id, position, task_id) VALUES (?1, ?2, ?3)",
            )
            .bind(wf.id.as_str())
            .bind(position as i64)
            .bind(task_id)
            .execute(&mut *tx)
            .await?;
        }

        if wf.status == WorkflowStatus::Running {
            sqlx::query(
                "INSERT INTO running_workflows (workflow_id, holder_pid, holder_host, heartbeat_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(workflow_id) DO UPDATE SET heartbeat_at = excluded.heartbeat_at",
            )
            .bind(wf.id.as_str())
            .bind(std::process::id() as i64)
            .bind(local_host())
            .bind(Utc::now().to_rfc3339())
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query("DELETE FROM running_workflows WHERE workflow_id = ?1")
                .bind(wf.id.as_str())
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await
    }

    /// Upsert one task row without rewriting the whole aggregate. Used by the
    /// executor on every task state change.
    pub async fn save_task(&self, workflow_id: &WorkflowId, task: &Task) -> Result<()> {
        with_busy_retry(|| {
            Box::pin(async {
                bind_task_insert(workflow_id.as_str(), task)
                    .execute(&self.writer)
                    .await
                    .map(|_| ())
            })
        })
        .await
    }

    pub async fn load_workflow(&self, id: &WorkflowId) -> Result<Workflow> {
        self.get_workflow(id)
            .await?
            .ok_or_else(|| QuorumError::not_found(format!("workflow {id}")))
    }

    pub async fn get_workflow(&self, id: &WorkflowId) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(&self.readers)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let mut wf = workflow_from_row(&row)?;
        self.attach_tasks(&mut wf).await?;
        Ok(Some(wf))
    }

    async fn attach_tasks(&self, wf: &mut Workflow) -> Result<()> {
        let task_rows = sqlx::query("SELECT * FROM tasks WHERE workflow_id = ?1")
            .bind(wf.id.as_str())
            .fetch_all(&self.readers)
            .await?;
        let mut tasks = BTreeMap::new();
        for row in &task_rows {
            let task = task_from_row(row)?;
            tasks.insert(task.id.clone(), task);
        }
        wf.tasks = tasks;

        let order_rows = sqlx::query(
            "SELECT task_id FROM task_order WHERE workflow_id = ?1 ORDER BY position ASC",
        )
        .bind(wf.id.as_str())
        .fetch_all(&self.readers)
        .await?;
        wf.task_order = order_rows.iter().map(|r| r.get::<String, _>(0)).collect();
        Ok(())
    }

    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>> {
        let rows = match status {
            Some(s) => {
                sqlx::query("SELECT * FROM workflows WHERE status = ?1 ORDER BY created_at DESC")
                    .bind(s.as_str())
                    .fetch_all(&self.readers)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM workflows ORDER BY created_at DESC")
                    .fetch_all(&self.readers)
                    .await?
            }
        };
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut wf = workflow_from_row(row)?;
            self.attach_tasks(&mut wf).await?;
            out.push(wf);
        }
        Ok(out)
    }

    pub async fn update_heartbeat(&self, id: &WorkflowId) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        with_busy_retry(|| {
            let now = now.clone();
            Box::pin(async move {
                sqlx::query("UPDATE workflows SET heartbeat_at = ?1 WHERE id = ?2")
                    .bind(&now)
                    .bind(id.as_str())
                    .execute(&self.writer)
                    .await?;
                sqlx::query("UPDATE running_workflows SET heartbeat_at = ?1 WHERE workflow_id = ?2")
                    .bind(&now)
                    .bind(id.as_str())
                    .execute(&self.writer)
                    .await
                    .map(|_| ())
            })
        })
        .await
    }

    /// Workflows marked running whose heartbeat is stale or absent. Consulted
    /// only at orchestrator start-up.
    pub async fn find_zombies(&self, threshold: Duration) -> Result<Vec<Workflow>> {
        let cutoff = (Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::seconds(30)))
        .to_rfc3339();
        let rows = sqlx::query(
            "SELECT * FROM workflows
             WHERE status = 'running' AND (heartbeat_at IS NULL OR heartbeat_at < ?1)",
        )
        .bind(&cutoff)
        .fetch_all(&self.readers)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut wf = workflow_from_row(row)?;
            self.attach_tasks(&mut wf).await?;
            out.push(wf);
        }
        Ok(out)
    }

    /// Delete terminal workflows older than `age`, returning how many went.
    pub async fn purge_terminal_older_than(&self, age: Duration) -> Result<u64> {
        let cutoff = (Utc::now()
            - chrono::Duration::from_std(age).unwrap_or(chrono::Duration::days(30)))
        .to_rfc3339();
        with_busy_retry(|| {
            let cutoff = cutoff.clone();
            Box::pin(async move {
                let mut tx = self.writer.begin().await?;
                let ids: Vec<String> = sqlx::query(
                    "SELECT id FROM workflows
                     WHERE status IN ('completed', 'failed', 'cancelled') AND updated_at < ?1",
                )
                .bind(&cutoff)
                .fetch_all(&mut *tx)
                .await?
                .iter()
                .map(|r| r.get::<String, _>(0))
                .collect();
                for id in &ids {
                    for table in ["tasks", "task_order", "checkpoints", "workflow_locks"] {
                        sqlx::query(&format!("DELETE FROM {table} WHERE workflow_id = ?1"))
                            .bind(id)
                            .execute(&mut *tx)
                            .await?;
                    }
                    sqlx::query("DELETE FROM workflows WHERE id = ?1")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok(ids.len() as u64)
            })
        })
        .await
    }

    // ---- checkpoints ----------------------------------------------------

    pub async fn save_checkpoint(&self, cp: &Checkpoint) -> Result<()> {
        with_busy_retry(|| {
            Box::pin(async {
                sqlx::query(
                    "INSERT INTO checkpoints (workflow_id, phase, task_id, payload_digest, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(workflow_id, phase, task_id) DO UPDATE SET
                         payload_digest = excluded.payload_digest,
                         created_at = excluded.created_at",
                )
                .bind(cp.workflow_id.as_str())
                .bind(cp.phase.as_str())
                .bind(cp.task_id.clone().unwrap_or_default())
                .bind(&cp.payload_digest)
                .bind(cp.created_at.to_rfc3339())
                .execute(&self.writer)
                .await
                .map(|_| ())
            })
        })
        .await
    }

    pub async fn checkpoints(&self, id: &WorkflowId) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query(
            "SELECT workflow_id, phase, task_id, payload_digest, created_at
             FROM checkpoints WHERE workflow_id = ?1 ORDER BY created_at ASC",
        )
        .bind(id.as_str())
        .fetch_all(&self.readers)
        .await?;
        rows.iter()
            .map(|row| {
                let task_id: String = row.get("task_id");
                Ok(Checkpoint {
                    workflow_id: WorkflowId::parse(row.get::<String, _>("workflow_id").as_str())?,
                    phase: Phase::parse(row.get::<String, _>("phase").as_str())?,
                    task_id: if task_id.is_empty() { None } else { Some(task_id) },
                    payload_digest: row.get("payload_digest"),
                    created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
                })
            })
            .collect()
    }

    pub async fn has_phase_checkpoint(&self, id: &WorkflowId, phase: Phase) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM checkpoints WHERE workflow_id = ?1 AND phase = ?2 AND task_id = ''",
        )
        .bind(id.as_str())
        .bind(phase.as_str())
        .fetch_optional(&self.readers)
        .await?;
        Ok(row.is_some())
    }

    /// Drop phase checkpoints at and after `from`, used by replan to force
    /// those phases to run again.
    pub async fn clear_checkpoints_from(&self, id: &WorkflowId, from: Phase) -> Result<()> {
        let doomed: Vec<&str> = Phase::ALL
            .iter()
            .skip_while(|p| **p != from)
            .map(|p| p.as_str())
            .collect();
        with_busy_retry(|| {
            let doomed = doomed.clone();
            Box::pin(async move {
                for phase in doomed {
                    sqlx::query("DELETE FROM checkpoints WHERE workflow_id = ?1 AND phase = ?2")
                        .bind(id.as_str())
                        .bind(phase)
                        .execute(&self.writer)
                        .await?;
                }
                Ok(())
            })
        })
        .await
    }

    // ---- locks ----------------------------------------------------------

    /// File lock plus a mirror row in `workflow_locks` for observability.
    pub async fn acquire_workflow_lock(&self, id: &WorkflowId) -> Result<WorkflowLockGuard> {
        let guard = self.locks.acquire(id, DEFAULT_LOCK_TTL)?;
        let record = guard.record().clone();
        with_busy_retry(|| {
            let record = record.clone();
            Box::pin(async move {
                sqlx::query(
                    "INSERT INTO workflow_locks (workflow_id, pid, host, acquired_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(workflow_id) DO UPDATE SET
                         pid = excluded.pid,
                         host = excluded.host,
                         acquired_at = excluded.acquired_at,
                         expires_at = excluded.expires_at",
                )
                .bind(&record.workflow_id)
                .bind(record.pid as i64)
                .bind(&record.host)
                .bind(record.acquired_at.to_rfc3339())
                .bind(record.expires_at.to_rfc3339())
                .execute(&self.writer)
                .await
                .map(|_| ())
            })
        })
        .await?;
        Ok(guard)
    }

    /// Idempotent: releasing an already-released lock is a no-op.
    pub async fn release_workflow_lock(&self, id: &WorkflowId, mut guard: WorkflowLockGuard) -> Result<()> {
        guard.release();
        with_busy_retry(|| {
            Box::pin(async {
                sqlx::query("DELETE FROM workflow_locks WHERE workflow_id = ?1")
                    .bind(id.as_str())
                    .execute(&self.writer)
                    .await
                    .map(|_| ())
            })
        })
        .await
    }

    // ---- backup / restore ----------------------------------------------

    /// Rotate `.quorum/state.db-backup` from the live database. Uses
    /// `VACUUM INTO` so the copy is consistent while WAL traffic continues;
    /// an fd-lock serializes rotation across processes.
    pub async fn rotate_backup(&self) -> Result<()> {
        let lock_path = self.root.join("state.db.backup-lock");
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        let mut flock = fd_lock::RwLock::new(lock_file);
        let _held = flock.write()?;

        let tmp = self.root.join("state.db-backup.tmp");
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        sqlx::query("VACUUM INTO ?1")
            .bind(tmp.to_string_lossy().into_owned())
            .execute(&self.writer)
            .await?;
        fs::rename(&tmp, &self.backup_path)?;
        debug!(backup = %self.backup_path.display(), "rotated state backup");
        Ok(())
    }

    pub fn backup_exists(&self) -> bool {
        self.backup_path.exists()
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

/// `PRAGMA integrity_check` on a throwaway connection; unreadable means
/// corrupt.
async fn integrity_ok(db_path: &Path) -> bool {
    let opts = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(false);
    let Ok(mut conn) = SqliteConnection::connect_with(&opts).await else {
        return false;
    };
    let verdict: std::result::Result<String, sqlx::Error> =
        sqlx::query("PRAGMA integrity_check")
            .fetch_one(&mut conn)
            .await
            .map(|row: SqliteRow| row.get(0));
    let _ = conn.close().await;
    matches!(verdict.as_deref(), Ok("ok"))
}

fn restore_file(backup: &Path, db: &Path) -> Result<()> {
    if !backup.exists() {
        return Err(QuorumError::fatal(format!(
            "state db corrupt and no backup at {}",
            backup.display()
        )));
    }
    // Stale WAL/SHM siblings would shadow the restored image.
    for suffix in ["-wal", "-shm"] {
        let sibling = PathBuf::from(format!("{}{suffix}", db.display()));
        if sibling.exists() {
            fs::remove_file(&sibling)?;
        }
    }
    let bytes = fs::read(backup)?;
    write_atomic(db, &bytes)?;
    info!(from = %backup.display(), "restored state db from backup");
    Ok(())
}

/// Retry SQLITE_BUSY up to 5 attempts, exponential backoff from 100 ms with
/// jitter. Non-busy errors surface immediately.
async fn with_busy_retry<'a, T>(
    mut op: impl FnMut() -> BoxFuture<'a, std::result::Result<T, sqlx::Error>>,
) -> Result<T> {
    let mut delay = WRITE_BACKOFF_START;
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_busy_sqlx(&e) && attempt + 1 < WRITE_RETRIES => {
                attempt += 1;
                let jitter = Duration::from_millis(rand::rng().random_range(0..50));
                debug!(attempt, "store busy, backing off {:?}", delay + jitter);
                tokio::time::sleep(delay + jitter).await;
                delay *= 2;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn bind_task_insert<'q>(
    workflow_id: &'q str,
    task: &'q Task,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    sqlx::query(
        "INSERT INTO tasks (workflow_id, id, phase, name, status, agent, model, dependencies,
             worktree_path, branch, last_commit, files_modified, retries, max_retries,
             started_at, completed_at, tokens_in, tokens_out, cost_usd, error, resume_hint)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
         ON CONFLICT(workflow_id, id) DO UPDATE SET
             phase = excluded.phase,
             name = excluded.name,
             status = excluded.status,
             agent = excluded.agent,
             model = excluded.model,
             dependencies = excluded.dependencies,
             worktree_path = excluded.worktree_path,
             branch = excluded.branch,
             last_commit = excluded.last_commit,
             files_modified = excluded.files_modified,
             retries = excluded.retries,
             max_retries = excluded.max_retries,
             started_at = excluded.started_at,
             completed_at = excluded.completed_at,
             tokens_in = excluded.tokens_in,
             tokens_out = excluded.tokens_out,
             cost_usd = excluded.cost_usd,
             error = excluded.error,
             resume_hint = excluded.resume_hint",
    )
    .bind(workflow_id)
    .bind(&task.id)
    .bind(task.phase.as_str())
    .bind(&task.name)
    .bind(task.status.as_str())
    .bind(&task.agent)
    .bind(&task.model)
    .bind(serde_json::to_string(&task.dependencies).unwrap_or_else(|_| "[]".to_string()))
    .bind(&task.worktree_path)
    .bind(&task.branch)
    .bind(&task.last_commit)
    .bind(serde_json::to_string(&task.files_modified).unwrap_or_else(|_| "[]".to_string()))
    .bind(task.retries as i64)
    .bind(task.max_retries as i64)
    .bind(task.started_at.map(|t| t.to_rfc3339()))
    .bind(task.completed_at.map(|t| t.to_rfc3339()))
    .bind(task.tokens_in as i64)
    .bind(task.tokens_out as i64)
    .bind(task.cost_usd)
    .bind(&task.error)
    .bind(&task.resume_hint)
}

fn workflow_from_row(row: &SqliteRow) -> Result<Workflow> {
    let metrics: WorkflowMetrics =
        serde_json::from_str(row.get::<String, _>("metrics").as_str()).unwrap_or_default();
    let options: WorkflowOptions =
        serde_json::from_str(row.get::<String, _>("options").as_str()).unwrap_or_default();
    Ok(Workflow {
        id: WorkflowId::parse(row.get::<String, _>("id").as_str())?,
        title: row.get("title"),
        status: WorkflowStatus::parse(row.get::<String, _>("status").as_str())?,
        current_phase: Phase::parse(row.get::<String, _>("current_phase").as_str())?,
        original_prompt: row.get("original_prompt"),
        optimized_prompt: row.get("optimized_prompt"),
        analysis: row.get("analysis"),
        base_branch: row.get("base_branch"),
        workflow_branch: row.get("workflow_branch"),
        tasks: BTreeMap::new(),
        task_order: Vec::new(),
        created_at: parse_ts(row.get::<String, _>("created_at").as_str())?,
        updated_at: parse_ts(row.get::<String, _>("updated_at").as_str())?,
        heartbeat_at: parse_opt_ts(row.get::<Option<String>, _>("heartbeat_at"))?,
        resume_count: row.get::<i64, _>("resume_count") as u32,
        max_resumes: row.get::<i64, _>("max_resumes") as u32,
        last_error: row.get("last_error"),
        metrics,
        options,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<Task> {
    Ok(Task {
        id: row.get("id"),
        phase: Phase::parse(row.get::<String, _>("phase").as_str())?,
        name: row.get("name"),
        status: TaskStatus::parse(row.get::<String, _>("status").as_str())?,
        agent: row.get("agent"),
        model: row.get("model"),
        dependencies: serde_json::from_str(row.get::<String, _>("dependencies").as_str())
            .unwrap_or_default(),
        worktree_path: row.get("worktree_path"),
        branch: row.get("branch"),
        last_commit: row.get("last_commit"),
        files_modified: serde_json::from_str(row.get::<String, _>("files_modified").as_str())
            .unwrap_or_default(),
        retries: row.get::<i64, _>("retries") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        started_at: parse_opt_ts(row.get::<Option<String>, _>("started_at"))?,
        completed_at: parse_opt_ts(row.get::<Option<String>, _>("completed_at"))?,
        tokens_in: row.get::<i64, _>("tokens_in") as u64,
        tokens_out: row.get::<i64, _>("tokens_out") as u64,
        cost_usd: row.get::<f64, _>("cost_usd"),
        error: row.get("error"),
        resume_hint: row.get("resume_hint"),
    })
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| QuorumError::fatal(format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn local_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Branch bookkeeping derived from the workflow row.
pub fn branch_info(wf: &Workflow, head_commit: Option<String>, status: BranchStatus) -> WorkflowBranchInfo {
    WorkflowBranchInfo {
        workflow_id: wf.id.clone(),
        branch_name: wf
            .workflow_branch
            .clone()
            .unwrap_or_else(|| format!("quorum/{}", wf.id)),
        base_branch: wf.base_branch.clone(),
        created_at: wf.created_at,
        head_commit,
        status,
    }
}
