//! One isolated git working copy per session.
//!
//! Every working copy this crate creates carries the [`RESERVED_PREFIX`] in
//! its git worktree name, so [`WorktreeManager::list`] never reports copies
//! made by hand or by other tools.

mod errors;
mod lock;
mod manager;
mod naming;

pub use errors::{Result, WorktreeError};
pub use manager::{WorktreeInfo, WorktreeManager};
pub use naming::{branch_name, slugify, worktree_name, RESERVED_PREFIX};
