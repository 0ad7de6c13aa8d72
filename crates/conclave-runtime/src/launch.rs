use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use conclave_worktree::{WorktreeInfo, WorktreeManager};

use crate::errors::{Result, RuntimeError};

#[derive(Debug, PartialEq, Eq)]
enum Handoff {
    Pending,
    Delivered,
    Abandoned,
}

/// Run blocking `work` with a deadline.
///
/// If the deadline passes first the caller gets `StartTimeout`, and whatever
/// `work` eventually produces is passed to `undo` instead of being leaked.
pub(crate) async fn blocking_with_deadline<T, F, U>(work: F, undo: U, deadline: Duration) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
    U: FnOnce(T) + Send + 'static,
{
    let handoff = Arc::new(Mutex::new(Handoff::Pending));
    let mut task = tokio::task::spawn_blocking({
        let handoff = Arc::clone(&handoff);
        move || {
            let result = work();
            let mut state = handoff.lock();
            if *state == Handoff::Abandoned {
                if let Ok(value) = result {
                    undo(value);
                }
                return Err(RuntimeError::StartTimeout(deadline));
            }
            *state = Handoff::Delivered;
            result
        }
    });

    match tokio::time::timeout(deadline, &mut task).await {
        Ok(joined) => joined.map_err(|e| RuntimeError::Internal(format!("blocking task failed: {e}")))?,
        Err(_) => {
            let delivered = {
                let mut state = handoff.lock();
                if *state == Handoff::Delivered {
                    true
                } else {
                    *state = Handoff::Abandoned;
                    false
                }
            };
            if delivered {
                // Finished right at the deadline; the result is already there.
                return task
                    .await
                    .map_err(|e| RuntimeError::Internal(format!("blocking task failed: {e}")))?;
            }
            Err(RuntimeError::StartTimeout(deadline))
        }
    }
}

/// Open the project's repository, placing working copies under `root` when
/// one is configured.
pub(crate) fn open_manager(repo_path: &Path, root: Option<&Path>) -> Result<WorktreeManager> {
    let manager = WorktreeManager::open(repo_path)?;
    Ok(match root {
        Some(root) => manager.with_worktrees_root(root),
        None => manager,
    })
}

struct Prepared {
    manager: WorktreeManager,
    info: WorktreeInfo,
    created: bool,
}

/// Find or create the session's working copy. Every git step runs off the
/// async thread under `deadline`; a copy created after the deadline passed
/// is removed again, an existing one is left alone.
pub(crate) async fn prepare_worktree(
    repo_path: PathBuf,
    worktrees_root: Option<PathBuf>,
    session_name: String,
    deadline: Duration,
) -> Result<WorktreeInfo> {
    let name = session_name.clone();
    let prepared = blocking_with_deadline(
        move || {
            let manager = open_manager(&repo_path, worktrees_root.as_deref())?;
            if let Some(existing) = manager.find(&session_name)? {
                if existing.path.is_dir() {
                    return Ok(Prepared {
                        manager,
                        info: existing,
                        created: false,
                    });
                }
            }
            manager.prune()?;
            let info = manager.create(&session_name)?;
            Ok(Prepared {
                manager,
                info,
                created: true,
            })
        },
        move |late: Prepared| {
            if !late.created {
                return;
            }
            warn!(path = %late.info.path.display(), "worktree finished after deadline, removing");
            if let Err(e) = late.manager.remove(&name) {
                warn!(error = %e, "failed to remove abandoned worktree");
            }
        },
        deadline,
    )
    .await?;
    Ok(prepared.info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    #[tokio::test]
    async fn returns_result_within_deadline() {
        let value = blocking_with_deadline(|| Ok(7), |_| {}, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn propagates_work_errors() {
        let result: Result<()> = blocking_with_deadline(
            || Err(RuntimeError::Internal("boom".into())),
            |_| {},
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(RuntimeError::Internal(m)) if m == "boom"));
    }

    #[tokio::test]
    async fn late_result_is_undone() {
        let undone = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&undone);

        let result = blocking_with_deadline(
            || {
                std::thread::sleep(Duration::from_millis(300));
                Ok("worktree")
            },
            move |_| flag.store(true, Ordering::SeqCst),
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(RuntimeError::StartTimeout(_))));

        let deadline = Instant::now() + Duration::from_secs(5);
        while !undone.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "late result was never undone");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn init_repo(path: &Path) -> PathBuf {
        let repo = git2::Repository::init(path).unwrap();
        std::fs::write(path.join("README.md"), "demo\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();
        path.canonicalize().unwrap()
    }

    #[tokio::test]
    async fn existing_worktree_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(&dir.path().join("repo"));
        let root = dir.path().join("trees");

        let first = prepare_worktree(repo.clone(), Some(root.clone()), "fix bug".into(), Duration::from_secs(10))
            .await
            .unwrap();
        let second = prepare_worktree(repo, Some(root.clone()), "fix bug".into(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(first.path, root.join("fix-bug"));
    }

    #[tokio::test]
    async fn repository_checks_count_against_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(&dir.path().join("repo"));
        let root = dir.path().join("trees");
        prepare_worktree(repo.clone(), Some(root.clone()), "kept".into(), Duration::from_secs(10))
            .await
            .unwrap();

        // Even the lookup of an existing copy is bounded, and a late lookup
        // must not remove the copy it found.
        let result = prepare_worktree(repo, Some(root.clone()), "kept".into(), Duration::ZERO).await;
        assert!(matches!(result, Err(RuntimeError::StartTimeout(_))));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(root.join("kept").is_dir());
    }

    #[tokio::test]
    async fn missing_repository_is_reported_from_the_blocking_task() {
        let dir = tempfile::tempdir().unwrap();
        let result = prepare_worktree(
            dir.path().join("nope"),
            None,
            "s".into(),
            Duration::from_secs(10),
        )
        .await;
        assert!(matches!(
            result,
            Err(RuntimeError::Worktree(conclave_worktree::WorktreeError::RepoNotFound(_)))
        ));
    }
}
