use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

/// One lock per repository, shared by every manager opened on it.
static REPO_LOCKS: LazyLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Lock for the repository whose common git directory is `commondir`.
///
/// Keyed by the canonical path so `repo/.git` and `repo/./.git` share a lock.
pub(crate) fn repo_lock(commondir: &Path) -> Arc<Mutex<()>> {
    let key = commondir
        .canonicalize()
        .unwrap_or_else(|_| commondir.to_path_buf());
    let mut locks = REPO_LOCKS.lock();
    Arc::clone(locks.entry(key).or_default())
}
