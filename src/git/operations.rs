use std::path::{Path, PathBuf};

use git2::{BranchType, IndexAddOption, Repository, Signature, StatusOptions};
use tracing::debug;

use crate::error::{QuorumError, Result};

/// Outcome of merging one branch into another without touching a working
/// directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Target ref moved forward to the source tip.
    FastForward(String),
    /// A two-parent merge commit was created on the target.
    Merged(String),
    /// Overlapping edits; nothing was written.
    Conflict(Vec<String>),
    /// Source had nothing the target lacks.
    UpToDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Refuse anything that is not a fast-forward.
    FastForwardOnly,
    /// Fast-forward when possible, merge commit otherwise.
    Merge,
}

impl MergeStrategy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "ff" | "fast-forward" => Ok(MergeStrategy::FastForwardOnly),
            "merge" => Ok(MergeStrategy::Merge),
            other => Err(QuorumError::validation(format!(
                "unknown merge strategy '{other}' (expected 'ff' or 'merge')"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommitResult {
    pub commit: String,
    pub files: Vec<String>,
}

/// Thin handle over a repository path. Each operation opens its own
/// `Repository`, so the client is freely shareable across executor tasks.
#[derive(Debug, Clone)]
pub struct GitClient {
    repo_root: PathBuf,
}

impl GitClient {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        GitClient {
            repo_root: repo_root.into(),
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn open(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_root)?)
    }

    fn signature(repo: &Repository) -> Result<Signature<'static>> {
        match repo.signature() {
            Ok(sig) => Ok(sig),
            Err(_) => Ok(Signature::now("quorum", "noreply@quorum.dev")?),
        }
    }

    /// The branch HEAD points at, or `main` when HEAD is detached/unborn.
    pub fn default_branch(&self) -> Result<String> {
        let repo = self.open()?;
        let result = match repo.head() {
            Ok(head) if head.is_branch() => Ok(head.shorthand().unwrap_or("main").to_string()),
            _ => Ok("main".to_string()),
        };
        result
    }

    pub fn branch_exists(&self, name: &str) -> Result<bool> {
        let repo = self.open()?;
        let result = Ok(repo.find_branch(name, BranchType::Local).is_ok());
        result
    }

    /// Create `name` off `from` (a local branch name). An existing `name`
    /// surfaces git2's exists code for the caller to disambiguate.
    pub fn create_branch(&self, name: &str, from: &str) -> Result<()> {
        let repo = self.open()?;
        let from_commit = repo
            .find_branch(from, BranchType::Local)
            .map_err(|_| QuorumError::not_found(format!("base branch '{from}'")))?
            .get()
            .peel_to_commit()?;
        repo.branch(name, &from_commit, false)?;
        debug!(branch = name, from, "created branch");
        Ok(())
    }

    pub fn branch_tip(&self, name: &str) -> Result<String> {
        let repo = self.open()?;
        let commit = repo
            .find_branch(name, BranchType::Local)
            .map_err(|_| QuorumError::not_found(format!("branch '{name}'")))?
            .get()
            .peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn delete_branch(&self, name: &str) -> Result<()> {
        let repo = self.open()?;
        let result = match repo.find_branch(name, BranchType::Local) {
            Ok(mut branch) => {
                branch.delete()?;
                Ok(())
            }
            Err(_) => Ok(()),
        };
        result
    }

    /// True when every commit on `branch` is reachable from `base`.
    pub fn is_merged_into(&self, branch: &str, base: &str) -> Result<bool> {
        let repo = self.open()?;
        let branch_tip = repo
            .find_branch(branch, BranchType::Local)?
            .get()
            .peel_to_commit()?
            .id();
        let base_tip = repo
            .find_branch(base, BranchType::Local)?
            .get()
            .peel_to_commit()?
            .id();
        if branch_tip == base_tip {
            return Ok(true);
        }
        Ok(repo.graph_descendant_of(base_tip, branch_tip)?)
    }

    /// Stage everything in `dir` (a checkout of some branch) and commit to
    /// its HEAD. Returns `None` when the tree is unchanged.
    pub fn commit_all_in(&self, dir: &Path, message: &str) -> Result<Option<CommitResult>> {
        let repo = Repository::open(dir)?;

        let mut status_opts = StatusOptions::new();
        status_opts
            .include_untracked(true)
            .recurse_untracked_dirs(true);
        let statuses = repo.statuses(Some(&mut status_opts))?;
        let files: Vec<String> = statuses
            .iter()
            .filter(|e| !e.status().is_empty())
            .filter_map(|e| e.path().map(str::to_string))
            .collect();
        if files.is_empty() {
            return Ok(None);
        }

        let mut index = repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let parent = repo.head()?.peel_to_commit()?;
        let sig = Self::signature(&repo)?;
        let oid = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;

        Ok(Some(CommitResult {
            commit: oid.to_string(),
            files,
        }))
    }

    /// Merge `source` into `target` by ref manipulation only: fast-forward
    /// when possible, otherwise an in-memory merge committed with two
    /// parents. Conflicts write nothing and report the overlapping paths.
    pub fn merge_branches(&self, target: &str, source: &str) -> Result<MergeOutcome> {
        let repo = self.open()?;
        let target_commit = repo
            .find_branch(target, BranchType::Local)
            .map_err(|_| QuorumError::not_found(format!("branch '{target}'")))?
            .get()
            .peel_to_commit()?;
        let source_commit = repo
            .find_branch(source, BranchType::Local)
            .map_err(|_| QuorumError::not_found(format!("branch '{source}'")))?
            .get()
            .peel_to_commit()?;
        let target_ref = format!("refs/heads/{target}");

        if source_commit.id() == target_commit.id()
            || repo.graph_descendant_of(target_commit.id(), source_commit.id())?
        {
            return Ok(MergeOutcome::UpToDate);
        }

        if repo.graph_descendant_of(source_commit.id(), target_commit.id())? {
            repo.reference(
                &target_ref,
                source_commit.id(),
                true,
                &format!("fast-forward {target} to {source}"),
            )?;
            self.refresh_head_checkout(&repo, target)?;
            return Ok(MergeOutcome::FastForward(source_commit.id().to_string()));
        }

        let mut index = repo.merge_commits(&target_commit, &source_commit, None)?;
        if index.has_conflicts() {
            let mut files = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                if let Some(entry) = conflict.our.or(conflict.their) {
                    if let Ok(path) = std::str::from_utf8(&entry.path) {
                        files.push(path.to_string());
                    }
                }
            }
            return Ok(MergeOutcome::Conflict(files));
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Self::signature(&repo)?;
        let oid = repo.commit(
            Some(&target_ref),
            &sig,
            &sig,
            &format!("Merge {source} into {target}"),
            &tree,
            &[&target_commit, &source_commit],
        )?;
        self.refresh_head_checkout(&repo, target)?;
        Ok(MergeOutcome::Merged(oid.to_string()))
    }

    /// Merge under an explicit strategy; `FastForwardOnly` refuses merges
    /// that would need a commit.
    pub fn merge_with_strategy(
        &self,
        target: &str,
        source: &str,
        strategy: MergeStrategy,
    ) -> Result<MergeOutcome> {
        if strategy == MergeStrategy::FastForwardOnly {
            let repo = self.open()?;
            let target_tip = repo
                .find_branch(target, BranchType::Local)?
                .get()
                .peel_to_commit()?
                .id();
            let source_tip = repo
                .find_branch(source, BranchType::Local)?
                .get()
                .peel_to_commit()?
                .id();
            let ff_possible = source_tip == target_tip
                || repo.graph_descendant_of(source_tip, target_tip)?
                || repo.graph_descendant_of(target_tip, source_tip)?;
            if !ff_possible {
                return Err(QuorumError::validation(format!(
                    "'{source}' does not fast-forward onto '{target}'"
                )));
            }
        }
        self.merge_branches(target, source)
    }

    /// When HEAD points at the branch we just moved, sync the working tree
    /// so the user's checkout matches the new tip.
    fn refresh_head_checkout(&self, repo: &Repository, branch: &str) -> Result<()> {
        let head_matches = repo
            .head()
            .ok()
            .and_then(|h| h.shorthand().map(|s| s == branch))
            .unwrap_or(false);
        if head_matches {
            let tree = repo
                .find_branch(branch, BranchType::Local)?
                .get()
                .peel_to_commit()?
                .tree()?;
            let mut checkout = git2::build::CheckoutBuilder::new();
            checkout.force();
            repo.checkout_tree(tree.as_object(), Some(&mut checkout))?;
        }
        Ok(())
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.open()?;
        let result = Ok(repo.head()?.peel_to_commit()?.id().to_string());
        result
    }

    /// Check out a local branch in the primary working directory. Used only
    /// by the degraded (no-worktree) execution path.
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        let repo = self.open()?;
        let reference = repo
            .find_branch(branch, BranchType::Local)
            .map_err(|_| QuorumError::not_found(format!("branch '{branch}'")))?
            .into_reference();
        let tree = reference.peel_to_commit()?.tree()?;
        repo.checkout_tree(tree.as_object(), None)?;
        let name = reference
            .name()
            .ok_or_else(|| QuorumError::fatal(format!("branch '{branch}' has a non-utf8 ref")))?;
        repo.set_head(name)?;
        Ok(())
    }
}

/// Recognizes git2's already-exists error, used by the unique-suffix retry
/// when ensuring the workflow branch.
pub fn is_branch_exists(err: &QuorumError) -> bool {
    matches!(err, QuorumError::Git(e) if e.code() == git2::ErrorCode::Exists)
}
