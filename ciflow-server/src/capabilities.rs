//! Collaborator capabilities the event handlers depend on.
//!
//! `GitHubClient` implements both traits; tests substitute the fakes in
//! `crate::testing`.

use anyhow::Result;
use async_trait::async_trait;
use ciflow_core::RepoContext;

/// Repository permission levels that may trigger CI workflows.
pub const WORKFLOW_PERMISSION_LEVELS: &[&str] = &["admin", "maintain", "write"];

/// Whether a collaborator permission level (as reported by GitHub) is
/// enough to run workflows.
pub fn permission_allows_workflows(level: &str) -> bool {
    WORKFLOW_PERMISSION_LEVELS.contains(&level)
}

#[async_trait]
pub trait PermissionChecker: Send + Sync {
    /// True if `login` may run workflows in `repo`.
    async fn has_workflow_running_permissions(&self, repo: &RepoContext, login: &str)
        -> Result<bool>;
}

#[async_trait]
pub trait CommentPoster: Send + Sync {
    /// Post `body` as a comment on issue or pull request `issue_number`.
    async fn create_comment(&self, repo: &RepoContext, issue_number: u64, body: &str)
        -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_levels() {
        assert!(permission_allows_workflows("admin"));
        assert!(permission_allows_workflows("maintain"));
        assert!(permission_allows_workflows("write"));
        assert!(!permission_allows_workflows("triage"));
        assert!(!permission_allows_workflows("read"));
        assert!(!permission_allows_workflows("none"));
        assert!(!permission_allows_workflows("Write"));
    }
}
