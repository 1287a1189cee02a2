use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use git2::{BranchType, Repository, WorktreeAddOptions, WorktreePruneOptions};
use tracing::{debug, warn};

use crate::error::{QuorumError, Result};
use crate::workflow::types::WorkflowId;

const MAX_LABEL_LEN: usize = 32;
const CREATE_RETRIES: u32 = 5;
const SUFFIX_ATTEMPTS: u32 = 5;

/// `non-alnum -> '-'`, lowercased, runs collapsed, length capped. Used for
/// both branch names and worktree directory names.
pub fn normalize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut last_dash = true;
    for c in label.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("task");
    }
    out.truncate(MAX_LABEL_LEN);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    /// Registered worktree name (unique, no path separators).
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
}

/// Creates and destroys per-task worktrees under `.worktrees/<workflow-id>/`.
///
/// Branch naming: `quorum/<workflow-id>/<task-id>__<normalized-label>`, with
/// a numeric suffix when a collision survives from an earlier attempt.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    base_dir: PathBuf,
}

impl WorktreeManager {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        let repo_root = repo_root.into();
        let base_dir = repo_root.join(".worktrees");
        WorktreeManager {
            repo_root,
            base_dir,
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn task_branch(workflow_id: &WorkflowId, task_id: &str, label: &str) -> String {
        format!(
            "quorum/{}/{}__{}",
            workflow_id,
            task_id,
            normalize_label(label)
        )
    }

    /// Create a worktree for a task, off the workflow branch. Picks the first
    /// non-colliding `__label[-N]` variant, so a retained worktree from a
    /// failed attempt never blocks a retry.
    pub async fn create_task_worktree(
        &self,
        workflow_id: &WorkflowId,
        task_id: &str,
        label: &str,
        base_branch: &str,
    ) -> Result<WorktreeInfo> {
        let normalized = normalize_label(label);
        for attempt in 0..SUFFIX_ATTEMPTS {
            let suffix = if attempt == 0 {
                normalized.clone()
            } else {
                format!("{normalized}-{}", attempt + 1)
            };
            let leaf = format!("{task_id}__{suffix}");
            let name = format!("{workflow_id}--{leaf}");
            let path = self.base_dir.join(workflow_id.as_str()).join(&leaf);
            let branch = format!("quorum/{workflow_id}/{leaf}");

            match self
                .create_from_branch(&name, &path, &branch, base_branch)
                .await
            {
                Ok(info) => return Ok(info),
                Err(e) if is_collision(&e) => {
                    debug!(branch, "worktree name collision, retrying with suffix");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(QuorumError::fatal(format!(
            "could not find a free worktree name for task {task_id}"
        )))
    }

    /// `CreateFromBranch`: create `branch` off `base` and attach a worktree
    /// at `path`. Retries transient `index.lock` contention; the repository
    /// serializes concurrent worktree creation internally.
    pub async fn create_from_branch(
        &self,
        name: &str,
        path: &Path,
        branch: &str,
        base: &str,
    ) -> Result<WorktreeInfo> {
        let mut delay = Duration::from_millis(50);
        let mut attempt = 0;
        loop {
            match self.try_create(name, path, branch, base) {
                Ok(info) => return Ok(info),
                Err(QuorumError::Git(e))
                    if e.code() == git2::ErrorCode::Locked && attempt + 1 < CREATE_RETRIES =>
                {
                    attempt += 1;
                    debug!(attempt, "repository locked during worktree add, backing off");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn try_create(&self, name: &str, path: &Path, branch: &str, base: &str) -> Result<WorktreeInfo> {
        let repo = Repository::open(&self.repo_root)?;
        let base_commit = repo
            .find_branch(base, BranchType::Local)
            .map_err(|_| QuorumError::not_found(format!("base branch '{base}'")))?
            .get()
            .peel_to_commit()?;

        let branch_ref = repo.branch(branch, &base_commit, false)?;
        let reference = branch_ref.into_reference();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Checkout directories must never end up staged from the main tree.
        let gitignore = self.base_dir.join(".gitignore");
        if !gitignore.exists() {
            fs::write(&gitignore, "*\n")?;
        }
        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        let created = repo.worktree(name, path, Some(&opts));
        match created {
            Ok(_) => {
                debug!(name, branch, path = %path.display(), "created worktree");
                Ok(WorktreeInfo {
                    name: name.to_string(),
                    path: path.to_path_buf(),
                    branch: branch.to_string(),
                })
            }
            Err(e) => {
                // The branch was ours; do not leave it behind on failure.
                if let Ok(mut b) = repo.find_branch(branch, BranchType::Local) {
                    let _ = b.delete();
                }
                Err(e.into())
            }
        }
    }

    /// Remove a worktree by registered name, pruning its administrative
    /// files and deleting the directory. Idempotent.
    pub fn remove(&self, name: &str) -> Result<()> {
        let repo = Repository::open(&self.repo_root)?;
        if let Ok(wt) = repo.find_worktree(name) {
            let wt_path = wt.path().to_path_buf();
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).working_tree(true);
            if let Err(e) = wt.prune(Some(&mut opts)) {
                warn!(name, "worktree prune failed: {e}");
            }
            if wt_path.exists() {
                fs::remove_dir_all(&wt_path)?;
            }
        }
        Ok(())
    }

    /// Prune registrations whose directories are gone and sweep orphaned
    /// directories under `.worktrees/` that git no longer knows about.
    pub fn cleanup_stale(&self) -> Result<usize> {
        let repo = Repository::open(&self.repo_root)?;
        let mut cleaned = 0usize;

        let mut registered_paths = Vec::new();
        for name in repo.worktrees()?.iter().flatten() {
            let wt = match repo.find_worktree(name) {
                Ok(wt) => wt,
                Err(_) => continue,
            };
            if wt.path().exists() {
                registered_paths.push(wt.path().to_path_buf());
            } else {
                let mut opts = WorktreePruneOptions::new();
                opts.valid(true);
                if wt.prune(Some(&mut opts)).is_ok() {
                    cleaned += 1;
                }
            }
        }

        if self.base_dir.exists() {
            for workflow_dir in fs::read_dir(&self.base_dir)? {
                let workflow_dir = workflow_dir?.path();
                if !workflow_dir.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(&workflow_dir)? {
                    let path = entry?.path();
                    if path.is_dir() && !registered_paths.contains(&path) {
                        fs::remove_dir_all(&path)?;
                        cleaned += 1;
                    }
                }
                if fs::read_dir(&workflow_dir)?.next().is_none() {
                    fs::remove_dir(&workflow_dir)?;
                }
            }
        }

        Ok(cleaned)
    }

    /// Remove every worktree and directory belonging to one workflow.
    pub fn remove_workflow_worktrees(&self, workflow_id: &WorkflowId) -> Result<usize> {
        let repo = Repository::open(&self.repo_root)?;
        let prefix = format!("{workflow_id}--");
        let mut removed = 0usize;
        for name in repo.worktrees()?.iter().flatten() {
            if name.starts_with(&prefix) {
                self.remove(name)?;
                removed += 1;
            }
        }
        let dir = self.base_dir.join(workflow_id.as_str());
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(removed)
    }
}

fn is_collision(err: &QuorumError) -> bool {
    matches!(err, QuorumError::Git(e) if e.code() == git2::ErrorCode::Exists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::operations::tests::init_repo;

    fn wf() -> WorkflowId {
        WorkflowId::parse("wf-20260101000000-abc123").unwrap()
    }

    #[test]
    fn labels_normalize_to_branch_safe_slugs() {
        assert_eq!(normalize_label("Add /health endpoint"), "add-health-endpoint");
        assert_eq!(normalize_label("fix: bug #42!"), "fix-bug-42");
        assert_eq!(normalize_label("___"), "task");
        assert_eq!(normalize_label(""), "task");
        let long = normalize_label(&"x".repeat(100));
        assert!(long.len() <= 32);
    }

    #[test]
    fn task_branch_names_follow_convention() {
        assert_eq!(
            WorktreeManager::task_branch(&wf(), "t1", "Add Health"),
            "quorum/wf-20260101000000-abc123/t1__add-health"
        );
    }

    #[tokio::test]
    async fn create_commits_are_isolated_until_merged() {
        let (dir, client) = init_repo();
        let base = client.default_branch().unwrap();
        let workflow_branch = format!("quorum/{}", wf());
        client.create_branch(&workflow_branch, &base).unwrap();

        let mgr = WorktreeManager::new(dir.path());
        let info = mgr
            .create_task_worktree(&wf(), "t1", "add health", &workflow_branch)
            .await
            .unwrap();
        assert!(info.path.exists());
        assert_eq!(
            info.branch,
            "quorum/wf-20260101000000-abc123/t1__add-health"
        );

        std::fs::write(info.path.join("new.txt"), "task output").unwrap();
        let commit = client
            .commit_all_in(&info.path, "task t1")
            .unwrap()
            .unwrap();

        // The workflow branch does not see the change until finalization.
        assert_ne!(client.branch_tip(&workflow_branch).unwrap(), commit.commit);
        let outcome = client.merge_branches(&workflow_branch, &info.branch).unwrap();
        assert!(matches!(outcome, super::super::MergeOutcome::FastForward(_)));
        assert_eq!(client.branch_tip(&workflow_branch).unwrap(), commit.commit);
    }

    #[tokio::test]
    async fn collision_gets_a_suffix() {
        let (dir, client) = init_repo();
        let base = client.default_branch().unwrap();
        let workflow_branch = format!("quorum/{}", wf());
        client.create_branch(&workflow_branch, &base).unwrap();

        let mgr = WorktreeManager::new(dir.path());
        let first = mgr
            .create_task_worktree(&wf(), "t1", "label", &workflow_branch)
            .await
            .unwrap();
        let second = mgr
            .create_task_worktree(&wf(), "t1", "label", &workflow_branch)
            .await
            .unwrap();
        assert_ne!(first.branch, second.branch);
        assert!(second.branch.ends_with("-2"));
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let (dir, client) = init_repo();
        let base = client.default_branch().unwrap();
        let workflow_branch = format!("quorum/{}", wf());
        client.create_branch(&workflow_branch, &base).unwrap();

        let mgr = WorktreeManager::new(dir.path());
        let info = mgr
            .create_task_worktree(&wf(), "t1", "x", &workflow_branch)
            .await
            .unwrap();
        mgr.remove(&info.name).unwrap();
        assert!(!info.path.exists());
        mgr.remove(&info.name).unwrap();
        mgr.remove("never-existed").unwrap();
    }

    #[tokio::test]
    async fn missing_base_branch_is_not_found() {
        let (dir, _client) = init_repo();
        let mgr = WorktreeManager::new(dir.path());
        let err = mgr
            .create_task_worktree(&wf(), "t1", "x", "quorum/missing")
            .await
            .unwrap_err();
        assert!(matches!(err, QuorumError::NotFound(_)));
    }

    #[tokio::test]
    async fn cleanup_sweeps_orphan_directories() {
        let (dir, client) = init_repo();
        let base = client.default_branch().unwrap();
        let workflow_branch = format!("quorum/{}", wf());
        client.create_branch(&workflow_branch, &base).unwrap();

        let mgr = WorktreeManager::new(dir.path());
        let _info = mgr
            .create_task_worktree(&wf(), "t1", "keep", &workflow_branch)
            .await
            .unwrap();
        let orphan = mgr.base_dir().join(wf().as_str()).join("t9__orphan");
        fs::create_dir_all(&orphan).unwrap();

        let cleaned = mgr.cleanup_stale().unwrap();
        assert_eq!(cleaned, 1);
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn remove_workflow_worktrees_clears_everything() {
        let (dir, client) = init_repo();
        let base = client.default_branch().unwrap();
        let workflow_branch = format!("quorum/{}", wf());
        client.create_branch(&workflow_branch, &base).unwrap();

        let mgr = WorktreeManager::new(dir.path());
        mgr.create_task_worktree(&wf(), "t1", "a", &workflow_branch)
            .await
            .unwrap();
        mgr.create_task_worktree(&wf(), "t2", "b", &workflow_branch)
            .await
            .unwrap();

        let removed = mgr.remove_workflow_worktrees(&wf()).unwrap();
        assert_eq!(removed, 2);
        assert!(!mgr.base_dir().join(wf().as_str()).exists());
    }
}
