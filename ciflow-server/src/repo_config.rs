//! Per-repository ciflow configuration.
//!
//! Repositories opt in by listing their trigger labels under
//! `ciflow_push_tags` in `.github/pytorch-probot.yml` on the default branch.
//! Loading goes through the GitHub API, so `CachedConfigTracker` keeps the
//! parsed result per repository until it expires or a push changes the file.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use ciflow_core::RepoContext;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Path of the bot configuration file within a repository.
pub const CONFIG_PATH: &str = ".github/pytorch-probot.yml";

/// Default lifetime of a cached configuration entry.
pub const DEFAULT_CONFIG_TTL: Duration = Duration::from_secs(300);

/// Trigger labels a repository accepts.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RepoCiflowConfig {
    pub trigger_labels: BTreeSet<String>,
}

impl RepoCiflowConfig {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            trigger_labels: labels.into_iter().map(Into::into).collect(),
        }
    }

    pub fn allows(&self, label: &str) -> bool {
        self.trigger_labels.contains(label)
    }

    /// Parse the YAML configuration file.
    ///
    /// Returns `None` when the file is empty or has no `ciflow_push_tags`;
    /// the repository has not opted in. Other keys are ignored.
    pub fn from_yaml(text: &str) -> Result<Option<Self>> {
        #[derive(Deserialize)]
        struct ProbotFile {
            ciflow_push_tags: Option<Vec<String>>,
        }

        if text.trim().is_empty() {
            return Ok(None);
        }

        let file: Option<ProbotFile> =
            serde_yaml::from_str(text).context("Failed to parse pytorch-probot.yml")?;
        Ok(file
            .and_then(|f| f.ciflow_push_tags)
            .map(RepoCiflowConfig::new))
    }
}

/// Source of repository configuration.
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    /// Load the configuration for `repo`, or `None` if it has not opted in.
    async fn load_config(&self, repo: &RepoContext) -> Result<Option<RepoCiflowConfig>>;
}

struct CacheEntry {
    config: Option<RepoCiflowConfig>,
    loaded_at: Instant,
}

/// Caches another loader's results per repository.
///
/// Negative results (no configuration) are cached too. Load errors are not.
pub struct CachedConfigTracker {
    inner: Arc<dyn ConfigLoader>,
    ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl CachedConfigTracker {
    pub fn new(inner: Arc<dyn ConfigLoader>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Drop the cached entry for `repo` so the next load refetches it.
    pub async fn invalidate(&self, repo: &RepoContext) {
        let mut cache = self.cache.write().await;
        if cache.remove(&repo.full_name()).is_some() {
            info!("Invalidated cached ciflow config for {}", repo);
        }
    }
}

#[async_trait]
impl ConfigLoader for CachedConfigTracker {
    async fn load_config(&self, repo: &RepoContext) -> Result<Option<RepoCiflowConfig>> {
        let key = repo.full_name();
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(&key) {
                if entry.loaded_at.elapsed() < self.ttl {
                    debug!("Using cached ciflow config for {}", repo);
                    return Ok(entry.config.clone());
                }
            }
        }

        let config = self.inner.load_config(repo).await?;

        {
            let mut cache = self.cache.write().await;
            cache.insert(
                key,
                CacheEntry {
                    config: config.clone(),
                    loaded_at: Instant::now(),
                },
            );
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_from_yaml_reads_push_tags() {
        let yaml = r#"
ciflow_push_tags:
- ciflow/trunk
- ciflow/slow
- ciflow/trunk
labeler_config: something
"#;
        let config = RepoCiflowConfig::from_yaml(yaml).unwrap().unwrap();
        assert_eq!(config.trigger_labels.len(), 2);
        assert!(config.allows("ciflow/trunk"));
        assert!(config.allows("ciflow/slow"));
        assert!(!config.allows("ciflow/periodic"));
    }

    #[test]
    fn test_from_yaml_without_push_tags_is_not_configured() {
        assert_eq!(
            RepoCiflowConfig::from_yaml("tracking_issue: 24422\n").unwrap(),
            None
        );
        assert_eq!(RepoCiflowConfig::from_yaml("").unwrap(), None);
        assert_eq!(RepoCiflowConfig::from_yaml("   \n").unwrap(), None);
        assert_eq!(
            RepoCiflowConfig::from_yaml("ciflow_push_tags:\n").unwrap(),
            None
        );
    }

    #[test]
    fn test_from_yaml_empty_list_is_configured() {
        let config = RepoCiflowConfig::from_yaml("ciflow_push_tags: []\n")
            .unwrap()
            .unwrap();
        assert!(config.trigger_labels.is_empty());
    }

    #[test]
    fn test_from_yaml_rejects_malformed_file() {
        assert!(RepoCiflowConfig::from_yaml("ciflow_push_tags: [unclosed\n").is_err());
        assert!(RepoCiflowConfig::from_yaml("ciflow_push_tags: 5\n").is_err());
    }

    struct CountingLoader {
        calls: AtomicUsize,
        config: Option<RepoCiflowConfig>,
    }

    #[async_trait]
    impl ConfigLoader for CountingLoader {
        async fn load_config(&self, _repo: &RepoContext) -> Result<Option<RepoCiflowConfig>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.config.clone())
        }
    }

    fn counting(config: Option<RepoCiflowConfig>) -> Arc<CountingLoader> {
        Arc::new(CountingLoader {
            calls: AtomicUsize::new(0),
            config,
        })
    }

    #[tokio::test]
    async fn test_tracker_caches_per_repo() {
        let loader = counting(Some(RepoCiflowConfig::new(["ciflow/trunk"])));
        let tracker = CachedConfigTracker::new(loader.clone(), DEFAULT_CONFIG_TTL);
        let repo = RepoContext::new("pytorch", "pytorch");
        let other = RepoContext::new("pytorch", "vision");

        tracker.load_config(&repo).await.unwrap();
        tracker.load_config(&repo).await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        tracker.load_config(&other).await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_tracker_caches_missing_config() {
        let loader = counting(None);
        let tracker = CachedConfigTracker::new(loader.clone(), DEFAULT_CONFIG_TTL);
        let repo = RepoContext::new("owner", "repo");

        assert_eq!(tracker.load_config(&repo).await.unwrap(), None);
        assert_eq!(tracker.load_config(&repo).await.unwrap(), None);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tracker_invalidate_and_expiry() {
        let loader = counting(None);
        let tracker = CachedConfigTracker::new(loader.clone(), DEFAULT_CONFIG_TTL);
        let repo = RepoContext::new("owner", "repo");

        tracker.load_config(&repo).await.unwrap();
        tracker.invalidate(&repo).await;
        tracker.load_config(&repo).await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);

        let expiring = CachedConfigTracker::new(loader.clone(), Duration::ZERO);
        expiring.load_config(&repo).await.unwrap();
        expiring.load_config(&repo).await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 4);
    }
}
