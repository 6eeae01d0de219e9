//! In-memory implementation of `RefStore`.
//!
//! Mirrors the failure semantics of the GitHub refs API: deleting a missing
//! ref and creating an existing one are errors. Every call is counted so
//! tests can assert on exactly which operations the reconciler issued.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{GitRef, RefStore, RepoContext};

/// In-memory reference store keyed by repository and ref path.
#[derive(Default)]
pub struct InMemoryRefStore {
    refs: RwLock<BTreeMap<(String, String), String>>,
    list_calls: AtomicUsize,
    delete_calls: AtomicUsize,
    create_calls: AtomicUsize,
}

impl InMemoryRefStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a ref directly, without counting it as a `create_ref` call.
    pub async fn seed(&self, repo: &RepoContext, ref_path: &str, sha: &str) {
        let mut refs = self.refs.write().await;
        refs.insert((repo.full_name(), ref_path.to_string()), sha.to_string());
    }

    /// Current value of `ref_path`, if present.
    pub async fn get(&self, repo: &RepoContext, ref_path: &str) -> Option<String> {
        let refs = self.refs.read().await;
        refs.get(&(repo.full_name(), ref_path.to_string())).cloned()
    }

    /// All refs in `repo`, ordered by path.
    pub async fn refs_in(&self, repo: &RepoContext) -> Vec<GitRef> {
        let full_name = repo.full_name();
        let refs = self.refs.read().await;
        refs.iter()
            .filter(|((r, _), _)| *r == full_name)
            .map(|((_, path), sha)| GitRef::new(path.clone(), sha.clone()))
            .collect()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    pub fn create_calls(&self) -> usize {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Number of mutating calls (deletes plus creates).
    pub fn write_calls(&self) -> usize {
        self.delete_calls() + self.create_calls()
    }
}

#[async_trait]
impl RefStore for InMemoryRefStore {
    async fn list_matching_refs(
        &self,
        repo: &RepoContext,
        ref_query: &str,
    ) -> Result<Vec<GitRef>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let prefix = format!("refs/{}", ref_query);
        Ok(self
            .refs_in(repo)
            .await
            .into_iter()
            .filter(|r| r.ref_path.starts_with(&prefix))
            .collect())
    }

    async fn delete_ref(&self, repo: &RepoContext, ref_query: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let key = (repo.full_name(), format!("refs/{}", ref_query));
        let mut refs = self.refs.write().await;
        match refs.remove(&key) {
            Some(_) => Ok(()),
            None => Err(anyhow!("Reference does not exist: refs/{}", ref_query)),
        }
    }

    async fn create_ref(&self, repo: &RepoContext, ref_path: &str, sha: &str) -> Result<()> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let key = (repo.full_name(), ref_path.to_string());
        let mut refs = self.refs.write().await;
        if refs.contains_key(&key) {
            return Err(anyhow!("Reference already exists: {}", ref_path));
        }
        refs.insert(key, sha.to_string());
        Ok(())
    }
}
