//! Deterministic names derived from a session name.

use crate::errors::{Result, WorktreeError};

/// Prefix on every git worktree name this crate owns.
pub const RESERVED_PREFIX: &str = "conclave-";

const BRANCH_NAMESPACE: &str = "conclave/";

/// Lowercase ASCII alphanumerics; every other run of characters becomes one `-`.
pub fn slugify(session_name: &str) -> Result<String> {
    let mut slug = String::with_capacity(session_name.len());
    let mut pending_dash = false;
    for c in session_name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        return Err(WorktreeError::InvalidName(session_name.to_string()));
    }
    Ok(slug)
}

/// git-internal worktree name (`.git/worktrees/<name>`).
pub fn worktree_name(session_name: &str) -> Result<String> {
    Ok(format!("{RESERVED_PREFIX}{}", slugify(session_name)?))
}

pub fn branch_name(session_name: &str) -> Result<String> {
    Ok(format!("{BRANCH_NAMESPACE}{}", slugify(session_name)?))
}

/// Inverse of [`worktree_name`]; `None` for worktrees this crate did not create.
pub(crate) fn slug_from_worktree_name(name: &str) -> Option<&str> {
    name.strip_prefix(RESERVED_PREFIX).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("s1").unwrap(), "s1");
        assert_eq!(slugify("Fix the  Parser!").unwrap(), "fix-the-parser");
        assert_eq!(slugify("--lead/trail--").unwrap(), "lead-trail");
        assert_eq!(slugify("naïve café").unwrap(), "na-ve-caf");
    }

    #[test]
    fn slugify_rejects_empty() {
        assert!(matches!(slugify(""), Err(WorktreeError::InvalidName(_))));
        assert!(matches!(slugify("  ///  "), Err(WorktreeError::InvalidName(_))));
    }

    #[test]
    fn names_are_deterministic() {
        assert_eq!(worktree_name("My Session").unwrap(), "conclave-my-session");
        assert_eq!(branch_name("My Session").unwrap(), "conclave/my-session");
        assert_eq!(worktree_name("my session").unwrap(), worktree_name("MY-SESSION").unwrap());
    }

    #[test]
    fn reserved_prefix_filter() {
        assert_eq!(slug_from_worktree_name("conclave-s1"), Some("s1"));
        assert_eq!(slug_from_worktree_name("conclave-"), None);
        assert_eq!(slug_from_worktree_name("feature-x"), None);
    }
}
