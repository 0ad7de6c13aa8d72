use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use git2::{BranchType, Repository, Worktree, WorktreeAddOptions, WorktreePruneOptions};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::errors::{Result, WorktreeError};
use crate::lock::repo_lock;
use crate::naming::{branch_name, slug_from_worktree_name, slugify, RESERVED_PREFIX};

/// A session's working copy as git sees it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    /// git worktree name, always carrying [`RESERVED_PREFIX`].
    pub name: String,
    pub path: PathBuf,
    pub branch: String,
}

/// Creates and removes per-session working copies of one repository.
///
/// Holds paths only; the repository is reopened for each operation so the
/// manager can be shared across threads.
#[derive(Clone, Debug)]
pub struct WorktreeManager {
    repo_root: PathBuf,
    worktrees_root: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl WorktreeManager {
    /// Open the repository at `repo_path`.
    pub fn open(repo_path: impl AsRef<Path>) -> Result<Self> {
        let repo_path = repo_path.as_ref();
        let repo = Repository::open(repo_path)
            .map_err(|_| WorktreeError::RepoNotFound(repo_path.to_path_buf()))?;
        let repo_root = repo
            .workdir()
            .ok_or_else(|| WorktreeError::RepoNotFound(repo_path.to_path_buf()))?
            .to_path_buf();
        let worktrees_root = default_worktrees_root(&repo_root);
        let lock = repo_lock(repo.commondir());

        debug!(repo = %repo_root.display(), worktrees = %worktrees_root.display(), "opened repository");
        Ok(Self {
            repo_root,
            worktrees_root,
            lock,
        })
    }

    /// Place working copies under `root` instead of the sibling default.
    pub fn with_worktrees_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.worktrees_root = root.into();
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn worktrees_root(&self) -> &Path {
        &self.worktrees_root
    }

    /// Branch from the current head and check it out into a fresh directory.
    #[instrument(skip(self), fields(repo = %self.repo_root.display()))]
    pub fn create(&self, session_name: &str) -> Result<WorktreeInfo> {
        let slug = slugify(session_name)?;
        let name = format!("{RESERVED_PREFIX}{slug}");
        let branch = branch_name(session_name)?;
        let path = self.worktrees_root.join(&slug);

        let _guard = self.lock.lock();
        let repo = self.repo()?;

        if path.exists() {
            return Err(WorktreeError::Conflict(format!(
                "path {} already exists",
                path.display()
            )));
        }
        if repo.find_branch(&branch, BranchType::Local).is_ok() {
            return Err(WorktreeError::Conflict(format!("branch {branch} already exists")));
        }
        if has_worktree(&repo, &name)? {
            return Err(WorktreeError::Conflict(format!("worktree {name} already exists")));
        }

        let head = repo
            .head()
            .and_then(|head| head.peel_to_commit())
            .map_err(|e| WorktreeError::NoHead(e.message().to_string()))?;
        let mut new_branch = repo.branch(&branch, &head, false)?;

        let added = fs::create_dir_all(&self.worktrees_root)
            .map_err(WorktreeError::from)
            .and_then(|()| {
                let mut opts = WorktreeAddOptions::new();
                opts.reference(Some(new_branch.get()));
                repo.worktree(&name, &path, Some(&opts))
                    .map_err(WorktreeError::from)
            });

        if let Err(e) = added {
            warn!(worktree = %name, error = %e, "worktree checkout failed, rolling back");
            if let Ok(wt) = repo.find_worktree(&name) {
                let mut opts = WorktreePruneOptions::new();
                opts.valid(true);
                if let Err(prune_err) = wt.prune(Some(&mut opts)) {
                    warn!(worktree = %name, error = %prune_err, "failed to discard partial worktree metadata");
                }
            }
            if path.exists() {
                if let Err(rm_err) = fs::remove_dir_all(&path) {
                    warn!(path = %path.display(), error = %rm_err, "failed to remove partial worktree directory");
                }
            }
            if let Err(del_err) = new_branch.delete() {
                warn!(branch = %branch, error = %del_err, "failed to delete branch during rollback");
            }
            return Err(e);
        }

        info!(worktree = %name, branch = %branch, path = %path.display(), "worktree created");
        Ok(WorktreeInfo { name, path, branch })
    }

    /// Working copies created by this crate, in git's listing order.
    #[instrument(skip(self), fields(repo = %self.repo_root.display()))]
    pub fn list(&self) -> Result<Vec<WorktreeInfo>> {
        let repo = self.repo()?;
        let names = repo.worktrees()?;
        let mut results = Vec::new();
        for name in names.iter().flatten() {
            let Some(slug) = slug_from_worktree_name(name) else {
                continue;
            };
            let wt = match repo.find_worktree(name) {
                Ok(wt) => wt,
                Err(e) => {
                    warn!(worktree = name, error = %e, "skipping unreadable worktree");
                    continue;
                }
            };
            let branch =
                checked_out_branch(&wt).unwrap_or_else(|| format!("conclave/{slug}"));
            results.push(WorktreeInfo {
                name: name.to_string(),
                path: wt.path().to_path_buf(),
                branch,
            });
        }
        Ok(results)
    }

    pub fn find(&self, session_name: &str) -> Result<Option<WorktreeInfo>> {
        let name = format!("{RESERVED_PREFIX}{}", slugify(session_name)?);
        Ok(self.list()?.into_iter().find(|wt| wt.name == name))
    }

    /// Delete the working copy and its branch. Already-missing pieces are skipped.
    #[instrument(skip(self), fields(repo = %self.repo_root.display()))]
    pub fn remove(&self, session_name: &str) -> Result<()> {
        let slug = slugify(session_name)?;
        let name = format!("{RESERVED_PREFIX}{slug}");
        let branch = branch_name(session_name)?;
        let default_path = self.worktrees_root.join(&slug);

        let _guard = self.lock.lock();
        let repo = self.repo()?;

        let mut path = default_path;
        if has_worktree(&repo, &name)? {
            let wt = repo.find_worktree(&name)?;
            path = wt.path().to_path_buf();
            let mut opts = WorktreePruneOptions::new();
            opts.valid(true).locked(true).working_tree(path.exists());
            wt.prune(Some(&mut opts))?;
        } else {
            info!(worktree = %name, "worktree not registered, nothing to prune");
        }

        if path.exists() {
            fs::remove_dir_all(&path)?;
        }

        match repo.find_branch(&branch, BranchType::Local) {
            Ok(mut b) => b.delete()?,
            Err(_) => debug!(branch = %branch, "branch already gone"),
        }

        info!(worktree = %name, path = %path.display(), "worktree removed");
        Ok(())
    }

    /// Discard metadata for working copies whose directories vanished.
    /// Branches are kept. Returns the number of entries discarded.
    #[instrument(skip(self), fields(repo = %self.repo_root.display()))]
    pub fn prune(&self) -> Result<usize> {
        let _guard = self.lock.lock();
        let repo = self.repo()?;
        let names = repo.worktrees()?;

        let mut pruned = 0;
        for name in names.iter().flatten() {
            if slug_from_worktree_name(name).is_none() {
                continue;
            }
            let wt = repo.find_worktree(name)?;
            if wt.validate().is_ok() || !wt.is_prunable(None)? {
                continue;
            }
            wt.prune(None)?;
            debug!(worktree = name, "pruned stale worktree metadata");
            pruned += 1;
        }
        if pruned > 0 {
            info!(pruned, "pruned stale worktrees");
        }
        Ok(pruned)
    }

    fn repo(&self) -> Result<Repository> {
        Repository::open(&self.repo_root)
            .map_err(|_| WorktreeError::RepoNotFound(self.repo_root.clone()))
    }
}

fn default_worktrees_root(repo_root: &Path) -> PathBuf {
    match (repo_root.parent(), repo_root.file_name()) {
        (Some(parent), Some(name)) => {
            parent.join(format!(".{}-worktrees", name.to_string_lossy()))
        }
        _ => repo_root.join(".conclave-worktrees"),
    }
}

fn has_worktree(repo: &Repository, name: &str) -> Result<bool> {
    let names = repo.worktrees()?;
    let found = names.iter().flatten().any(|n| n == name);
    Ok(found)
}

fn checked_out_branch(wt: &Worktree) -> Option<String> {
    let repo = Repository::open_from_worktree(wt).ok()?;
    let head = repo.head().ok()?;
    let branch = head.shorthand().map(str::to_string);
    branch
}
