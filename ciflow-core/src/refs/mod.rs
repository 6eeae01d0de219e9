//! Reference store abstraction.
//!
//! This module defines the `RefStore` trait that the tag reconciler uses to
//! read and write git references. The production implementation talks to
//! the GitHub REST API; `InMemoryRefStore` backs tests and dry runs.

mod memory;

pub use memory::InMemoryRefStore;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The repository an operation applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoContext {
    pub owner: String,
    pub name: String,
    /// GitHub App installation, when acting as an app.
    pub installation_id: Option<u64>,
}

impl RepoContext {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            installation_id: None,
        }
    }

    pub fn with_installation(mut self, installation_id: u64) -> Self {
        self.installation_id = Some(installation_id);
        self
    }

    /// `owner/name`
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

/// A reference as returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitRef {
    /// Fully-qualified path, e.g. `refs/tags/ciflow/trunk/123`.
    pub ref_path: String,
    /// Commit the reference points at.
    pub sha: String,
}

impl GitRef {
    pub fn new(ref_path: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            ref_path: ref_path.into(),
            sha: sha.into(),
        }
    }
}

/// Read/write access to a repository's references.
///
/// Errors are transport or API failures; implementations must not retry.
#[async_trait]
pub trait RefStore: Send + Sync {
    /// List references whose path starts with `refs/<ref_query>`.
    ///
    /// `ref_query` is the short form, e.g. `tags/ciflow/trunk/123`. As with
    /// GitHub's matching-refs endpoint this is a prefix match, so longer
    /// names such as `tags/ciflow/trunk/1234` are returned as well.
    async fn list_matching_refs(&self, repo: &RepoContext, ref_query: &str)
        -> Result<Vec<GitRef>>;

    /// Delete `refs/<ref_query>`. Fails if the reference does not exist.
    async fn delete_ref(&self, repo: &RepoContext, ref_query: &str) -> Result<()>;

    /// Create `ref_path` (fully-qualified) at `sha`. Fails if it already exists.
    async fn create_ref(&self, repo: &RepoContext, ref_path: &str, sha: &str) -> Result<()>;
}
