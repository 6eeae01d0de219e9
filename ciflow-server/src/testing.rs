//! In-memory collaborators for exercising the handlers without GitHub.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use ciflow_core::RepoContext;

use crate::capabilities::{CommentPoster, PermissionChecker};
use crate::repo_config::{ConfigLoader, RepoCiflowConfig};

/// Serves fixed configurations keyed by `owner/name`.
#[derive(Default)]
pub struct StaticConfigLoader {
    configs: HashMap<String, RepoCiflowConfig>,
}

impl StaticConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repo<I, S>(mut self, full_name: &str, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.configs
            .insert(full_name.to_string(), RepoCiflowConfig::new(labels));
        self
    }
}

#[async_trait]
impl ConfigLoader for StaticConfigLoader {
    async fn load_config(&self, repo: &RepoContext) -> Result<Option<RepoCiflowConfig>> {
        Ok(self.configs.get(&repo.full_name()).cloned())
    }
}

/// Grants workflow permissions to a fixed set of logins.
#[derive(Default)]
pub struct StaticPermissions {
    privileged: HashSet<String>,
}

impl StaticPermissions {
    pub fn new<I, S>(logins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            privileged: logins.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PermissionChecker for StaticPermissions {
    async fn has_workflow_running_permissions(
        &self,
        _repo: &RepoContext,
        login: &str,
    ) -> Result<bool> {
        Ok(self.privileged.contains(login))
    }
}

/// A comment captured by `CommentLog`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedComment {
    pub repo: String,
    pub issue_number: u64,
    pub body: String,
}

/// Collects posted comments instead of sending them.
#[derive(Default)]
pub struct CommentLog {
    comments: Mutex<Vec<PostedComment>>,
}

impl CommentLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn comments(&self) -> Vec<PostedComment> {
        self.comments
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl CommentPoster for CommentLog {
    async fn create_comment(
        &self,
        repo: &RepoContext,
        issue_number: u64,
        body: &str,
    ) -> Result<()> {
        let comment = PostedComment {
            repo: repo.full_name(),
            issue_number,
            body: body.to_string(),
        };
        self.comments
            .lock()
            .map_err(|_| anyhow::anyhow!("comment log poisoned"))?
            .push(comment);
        Ok(())
    }
}
