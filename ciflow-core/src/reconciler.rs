//! Tag reconciliation against a `RefStore`.
//!
//! `sync` makes a tag point at a commit, `remove` makes it go away. Both are
//! idempotent: running them again after success issues no writes, so rapid
//! or out-of-order webhook deliveries converge without any locking. Errors
//! from the store are propagated unchanged (with context); nothing here
//! retries.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use futures_util::future::join_all;
use tracing::{error, info};

use crate::labels::{tag_ref_path, tag_ref_query};
use crate::refs::{GitRef, RefStore, RepoContext};

/// What `sync` had to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The tag already pointed at the desired commit; nothing was written.
    AlreadyCurrent,
    /// No tag existed; it was created.
    Created,
    /// The tag pointed elsewhere; it was deleted and recreated.
    Moved { stale: Vec<String> },
}

/// What `remove` had to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoveOutcome {
    Deleted { sha: String },
    Absent,
}

pub struct TagReconciler {
    store: Arc<dyn RefStore>,
}

impl TagReconciler {
    pub fn new(store: Arc<dyn RefStore>) -> Self {
        Self { store }
    }

    /// Make `tag` point at `sha`, deleting out-of-date values first.
    pub async fn sync(&self, repo: &RepoContext, tag: &str, sha: &str) -> Result<SyncOutcome> {
        info!("Synchronizing tag {} to head sha {} in {}", tag, sha, repo);

        let matching = self.exact_matches(repo, tag).await?;
        if matching.is_empty() {
            info!("No matching tags for {}", tag);
        } else {
            info!("Found {} matching tag(s) for {}", matching.len(), tag);
        }

        if matching.iter().any(|r| r.sha == sha) {
            info!("Tag {} already points to {}", tag, sha);
            return Ok(SyncOutcome::AlreadyCurrent);
        }

        // Delete before create: a tag name must never resolve to two commits.
        // Every exact match shares one path, so one delete clears them all.
        let stale: Vec<String> = matching.into_iter().map(|r| r.sha).collect();
        if !stale.is_empty() {
            info!("Deleting out of date tag {} on sha {}", tag, stale.join(", "));
            self.store
                .delete_ref(repo, &tag_ref_query(tag))
                .await
                .with_context(|| format!("Failed to delete stale tag {} in {}", tag, repo))?;
        }

        info!("Creating tag {} on head sha {}", tag, sha);
        self.store
            .create_ref(repo, &tag_ref_path(tag), sha)
            .await
            .with_context(|| format!("Failed to create tag {} at {} in {}", tag, sha, repo))?;

        Ok(if stale.is_empty() {
            SyncOutcome::Created
        } else {
            SyncOutcome::Moved { stale }
        })
    }

    /// Delete `tag` if it exists.
    ///
    /// Only the first exact match is deleted; a ref path is unique in the
    /// store, so any further entry would be a listing artifact.
    pub async fn remove(&self, repo: &RepoContext, tag: &str) -> Result<RemoveOutcome> {
        info!("Cleaning up tag {} in {}", tag, repo);

        let ref_path = tag_ref_path(tag);
        let listed = self
            .store
            .list_matching_refs(repo, &tag_ref_query(tag))
            .await
            .with_context(|| format!("Failed to list refs for tag {} in {}", tag, repo))?;

        if let Some(found) = listed.into_iter().find(|r| r.ref_path == ref_path) {
            info!("Deleting tag {} on sha {}", tag, found.sha);
            self.store
                .delete_ref(repo, &tag_ref_query(tag))
                .await
                .with_context(|| format!("Failed to delete tag {} in {}", tag, repo))?;
            return Ok(RemoveOutcome::Deleted { sha: found.sha });
        }

        info!("No matching tags for {}", tag);
        Ok(RemoveOutcome::Absent)
    }

    /// `sync` every tag concurrently and wait for all of them.
    ///
    /// A failure does not cancel the other operations; once all have
    /// finished, any failures are reported together.
    pub async fn sync_all(
        &self,
        repo: &RepoContext,
        tags: &[String],
        sha: &str,
    ) -> Result<Vec<SyncOutcome>> {
        let results = join_all(tags.iter().map(|tag| self.sync(repo, tag, sha))).await;
        join_results("sync", tags, results)
    }

    /// `remove` every tag concurrently and wait for all of them.
    pub async fn remove_all(
        &self,
        repo: &RepoContext,
        tags: &[String],
    ) -> Result<Vec<RemoveOutcome>> {
        let results = join_all(tags.iter().map(|tag| self.remove(repo, tag))).await;
        join_results("remove", tags, results)
    }

    /// Listing filtered down to refs whose path is exactly this tag's.
    async fn exact_matches(&self, repo: &RepoContext, tag: &str) -> Result<Vec<GitRef>> {
        let ref_path = tag_ref_path(tag);
        let listed = self
            .store
            .list_matching_refs(repo, &tag_ref_query(tag))
            .await
            .with_context(|| format!("Failed to list refs for tag {} in {}", tag, repo))?;
        Ok(listed
            .into_iter()
            .filter(|r| r.ref_path == ref_path)
            .collect())
    }
}

fn join_results<T>(operation: &str, tags: &[String], results: Vec<Result<T>>) -> Result<Vec<T>> {
    let total = results.len();
    let mut outcomes = Vec::with_capacity(total);
    let mut failed = Vec::new();

    for (tag, result) in tags.iter().zip(results) {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                error!("Failed to {} tag {}: {:#}", operation, tag, e);
                failed.push(tag.as_str());
            }
        }
    }

    if failed.is_empty() {
        Ok(outcomes)
    } else {
        Err(anyhow!(
            "{} of {} tag {} operation(s) failed: {}",
            failed.len(),
            total,
            operation,
            failed.join(", ")
        ))
    }
}
