use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{QuorumError, Result};
use crate::workflow::types::WorkflowId;

pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(300);

/// Contents of `.quorum/locks/<workflow-id>.lock`, one JSON object created
/// with exclusive-open semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: i32,
    pub host: String,
    pub workflow_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    fn new(workflow_id: &WorkflowId, ttl: Duration) -> Result<Self> {
        let now = Utc::now();
        let host = hostname::get()
            .map_err(QuorumError::Io)?
            .to_string_lossy()
            .into_owned();
        Ok(LockRecord {
            pid: std::process::id() as i32,
            host,
            workflow_id: workflow_id.as_str().to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300)),
        })
    }

    /// A lock is stale when it expired, or when its holder died on this host.
    /// A live pid on a *different* host cannot be probed, so only expiry
    /// reclaims those.
    fn is_stale(&self, local_host: &str) -> bool {
        if self.expires_at < Utc::now() {
            return true;
        }
        self.host == local_host && !pid_alive(self.pid)
    }
}

fn pid_alive(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        // Signal 0 to a live process we don't own.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Handle on a held per-workflow lock file. Dropping releases best-effort;
/// release is idempotent either way.
#[derive(Debug)]
pub struct WorkflowLockGuard {
    path: PathBuf,
    record: LockRecord,
    released: bool,
}

impl WorkflowLockGuard {
    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    /// Rewrite the lock file with a fresh expiry. Called from the runner's
    /// heartbeat so a long phase does not expire its own lock.
    pub fn refresh(&mut self, ttl: Duration) -> Result<()> {
        self.record.expires_at =
            Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300));
        write_atomic(&self.path, &serde_json::to_vec_pretty(&self.record)?)?;
        Ok(())
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != IoErrorKind::NotFound {
                warn!(path = %self.path.display(), "failed to remove lock file: {e}");
            }
        }
    }
}

impl Drop for WorkflowLockGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Per-workflow file locks under `.quorum/locks/`. One file per id, so
/// multiple workflows can hold locks concurrently.
#[derive(Debug, Clone)]
pub struct LockManager {
    dir: PathBuf,
    local_host: String,
}

impl LockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let local_host = hostname::get()
            .map_err(QuorumError::Io)?
            .to_string_lossy()
            .into_owned();
        Ok(LockManager { dir, local_host })
    }

    fn lock_path(&self, id: &WorkflowId) -> PathBuf {
        self.dir.join(format!("{}.lock", id.as_str()))
    }

    /// Acquire the lock for `id` with exclusive-create semantics. An existing
    /// file is reclaimed only when its holder is provably gone (dead pid on
    /// this host) or its expiry has passed; otherwise `LockBusy`.
    pub fn acquire(&self, id: &WorkflowId, ttl: Duration) -> Result<WorkflowLockGuard> {
        let path = self.lock_path(id);
        let record = LockRecord::new(id, ttl)?;
        let payload = serde_json::to_vec_pretty(&record)?;

        // Two attempts: the second runs after reclaiming a stale file. If a
        // competitor wins the re-create race we report busy rather than spin.
        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(&payload)?;
                    file.sync_all()?;
                    debug!(workflow_id = %id, path = %path.display(), "acquired workflow lock");
                    return Ok(WorkflowLockGuard {
                        path,
                        record,
                        released: false,
                    });
                }
                Err(e) if e.kind() == IoErrorKind::AlreadyExists && attempt == 0 => {
                    match self.read_record(&path) {
                        Ok(existing) if existing.is_stale(&self.local_host) => {
                            debug!(
                                workflow_id = %id,
                                holder_pid = existing.pid,
                                "reclaiming stale workflow lock"
                            );
                            match fs::remove_file(&path) {
                                Ok(()) => continue,
                                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                                Err(e) => return Err(e.into()),
                            }
                        }
                        Ok(existing) => {
                            return Err(QuorumError::LockBusy(format!(
                                "{} held by pid {} on {} until {}",
                                id, existing.pid, existing.host, existing.expires_at
                            )));
                        }
                        // Unreadable lock file counts as held; it may be
                        // mid-write by a competitor.
                        Err(_) => {
                            return Err(QuorumError::LockBusy(format!(
                                "{id} lock file unreadable, assuming held"
                            )));
                        }
                    }
                }
                Err(e) if e.kind() == IoErrorKind::AlreadyExists => {
                    return Err(QuorumError::LockBusy(format!(
                        "{id} lock re-created by a competitor"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(QuorumError::LockBusy(id.to_string()))
    }

    /// Remove the lock file for `id` regardless of holder. Idempotent.
    pub fn force_release(&self, id: &WorkflowId) -> Result<()> {
        match fs::remove_file(self.lock_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn inspect(&self, id: &WorkflowId) -> Result<Option<LockRecord>> {
        let path = self.lock_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(self.read_record(&path)?))
    }

    fn read_record(&self, path: &Path) -> Result<LockRecord> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Durable writes go through a temp file in the same directory, then rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| QuorumError::fatal(format!("{} has no parent", path.display())))?;
    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string()),
        std::process::id()
    ));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager() -> (TempDir, LockManager) {
        let dir = TempDir::new().unwrap();
        let mgr = LockManager::new(dir.path().join("locks")).unwrap();
        (dir, mgr)
    }

    fn wf(n: u32) -> WorkflowId {
        WorkflowId::parse(&format!("wf-20260101000000-{n:06}")).unwrap()
    }

    #[test]
    fn acquire_then_conflict_then_release() {
        let (_dir, mgr) = manager();
        let id = wf(1);

        let mut guard = mgr.acquire(&id, DEFAULT_LOCK_TTL).unwrap();
        let err = mgr.acquire(&id, DEFAULT_LOCK_TTL).unwrap_err();
        assert!(matches!(err, QuorumError::LockBusy(_)));

        guard.release();
        // Released lock can be re-acquired, and release is idempotent.
        guard.release();
        let _guard2 = mgr.acquire(&id, DEFAULT_LOCK_TTL).unwrap();
    }

    #[test]
    fn different_ids_lock_independently() {
        let (_dir, mgr) = manager();
        let _a = mgr.acquire(&wf(1), DEFAULT_LOCK_TTL).unwrap();
        let _b = mgr.acquire(&wf(2), DEFAULT_LOCK_TTL).unwrap();
    }

    #[test]
    fn expired_lock_is_reclaimed() {
        let (_dir, mgr) = manager();
        let id = wf(3);
        {
            let mut guard = mgr.acquire(&id, Duration::from_secs(60)).unwrap();
            // Forge an already-expired record from a live pid; expiry alone
            // must be enough to reclaim.
            guard.record.expires_at = Utc::now() - chrono::Duration::seconds(1);
            write_atomic(
                &mgr.lock_path(&id),
                &serde_json::to_vec(&guard.record).unwrap(),
            )
            .unwrap();
            std::mem::forget(guard);
        }
        let _reclaimed = mgr.acquire(&id, DEFAULT_LOCK_TTL).unwrap();
    }

    #[test]
    fn dead_pid_on_this_host_is_reclaimed() {
        let (_dir, mgr) = manager();
        let id = wf(4);
        let record = LockRecord {
            // Max pid is bounded well below this on Linux.
            pid: i32::MAX - 1,
            host: hostname::get().unwrap().to_string_lossy().into_owned(),
            workflow_id: id.to_string(),
            acquired_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(300),
        };
        write_atomic(&mgr.lock_path(&id), &serde_json::to_vec(&record).unwrap()).unwrap();

        let _guard = mgr.acquire(&id, DEFAULT_LOCK_TTL).unwrap();
    }

    #[test]
    fn live_lock_on_other_host_is_not_reclaimed() {
        let (_dir, mgr) = manager();
        let id = wf(5);
        let record = LockRecord {
            pid: 1,
            host: "some-other-host".to_string(),
            workflow_id: id.to_string(),
            acquired_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(300),
        };
        write_atomic(&mgr.lock_path(&id), &serde_json::to_vec(&record).unwrap()).unwrap();

        assert!(matches!(
            mgr.acquire(&id, DEFAULT_LOCK_TTL),
            Err(QuorumError::LockBusy(_))
        ));
    }

    #[test]
    fn refresh_extends_expiry() {
        let (_dir, mgr) = manager();
        let id = wf(6);
        let mut guard = mgr.acquire(&id, Duration::from_secs(1)).unwrap();
        let before = guard.record().expires_at;
        guard.refresh(Duration::from_secs(600)).unwrap();
        assert!(guard.record().expires_at > before);

        let on_disk = mgr.inspect(&id).unwrap().unwrap();
        assert_eq!(on_disk.expires_at, guard.record().expires_at);
    }
}
