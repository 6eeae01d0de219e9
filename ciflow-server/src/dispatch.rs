//! Routing of webhook deliveries to handlers.
//!
//! The `Dispatcher` is built once at startup with every dependency the
//! handlers need; there is no global registration.

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::handlers::CiflowHandlers;
use crate::repo_config::{CachedConfigTracker, CONFIG_PATH};
use crate::webhook::GitHubWebhookPayload;

/// Pull request actions the bot reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PullRequestAction {
    Labeled,
    Unlabeled,
    Opened,
    Reopened,
    Synchronize,
    Closed,
}

const PULL_REQUEST_ACTIONS: &[(&str, PullRequestAction)] = &[
    ("labeled", PullRequestAction::Labeled),
    ("unlabeled", PullRequestAction::Unlabeled),
    ("opened", PullRequestAction::Opened),
    ("reopened", PullRequestAction::Reopened),
    ("synchronize", PullRequestAction::Synchronize),
    ("closed", PullRequestAction::Closed),
];

impl PullRequestAction {
    pub fn parse(action: &str) -> Option<Self> {
        PULL_REQUEST_ACTIONS
            .iter()
            .find(|(name, _)| *name == action)
            .map(|(_, parsed)| *parsed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Ignored,
}

pub struct Dispatcher {
    handlers: CiflowHandlers,
    config_tracker: Arc<CachedConfigTracker>,
}

impl Dispatcher {
    pub fn new(handlers: CiflowHandlers, config_tracker: Arc<CachedConfigTracker>) -> Self {
        Self {
            handlers,
            config_tracker,
        }
    }

    /// Route one delivery by its `X-GitHub-Event` name and payload.
    pub async fn dispatch(
        &self,
        event_name: &str,
        payload: &GitHubWebhookPayload,
    ) -> Result<DispatchOutcome> {
        match event_name {
            "pull_request" => self.dispatch_pull_request(payload).await,
            "push" => self.dispatch_push(payload).await,
            _ => Ok(DispatchOutcome::Ignored),
        }
    }

    async fn dispatch_pull_request(
        &self,
        payload: &GitHubWebhookPayload,
    ) -> Result<DispatchOutcome> {
        let Some(action) = payload.action.as_deref().and_then(PullRequestAction::parse) else {
            return Ok(DispatchOutcome::Ignored);
        };
        let (Some(pr), Some(repo)) = (&payload.pull_request, payload.repo_context()) else {
            warn!("pull_request event without pull request or repository, ignoring");
            return Ok(DispatchOutcome::Ignored);
        };

        let sender = payload.sender.as_ref().map_or("unknown", |s| s.login.as_str());
        info!(
            "Processing {:?} for PR #{} in {} from {}",
            action, pr.number, repo, sender
        );

        match action {
            PullRequestAction::Labeled | PullRequestAction::Unlabeled => {
                let Some(label) = &payload.label else {
                    warn!("{:?} event without label, ignoring", action);
                    return Ok(DispatchOutcome::Ignored);
                };
                if action == PullRequestAction::Labeled {
                    let outcome = self.handlers.handle_labeled(&repo, pr, &label.name).await?;
                    info!("Label {} on PR #{}: {:?}", label.name, pr.number, outcome);
                } else {
                    self.handlers
                        .handle_unlabeled(&repo, pr, &label.name)
                        .await?;
                }
            }
            PullRequestAction::Opened
            | PullRequestAction::Reopened
            | PullRequestAction::Synchronize => {
                self.handlers.handle_sync(&repo, pr).await?;
            }
            PullRequestAction::Closed => {
                self.handlers.handle_closed(&repo, pr).await?;
            }
        }

        Ok(DispatchOutcome::Handled)
    }

    async fn dispatch_push(&self, payload: &GitHubWebhookPayload) -> Result<DispatchOutcome> {
        if !push_touches_config(payload) {
            return Ok(DispatchOutcome::Ignored);
        }
        let Some(repo) = payload.repo_context() else {
            return Ok(DispatchOutcome::Ignored);
        };
        info!("{} changed in {}", CONFIG_PATH, repo);
        self.config_tracker.invalidate(&repo).await;
        Ok(DispatchOutcome::Handled)
    }
}

/// True if a push to the default branch added, changed, or removed the
/// configuration file.
pub fn push_touches_config(payload: &GitHubWebhookPayload) -> bool {
    let Some(repo) = &payload.repository else {
        return false;
    };
    let default_branch = repo.default_branch.as_deref().unwrap_or("main");
    let to_default_branch =
        payload.git_ref.as_deref() == Some(format!("refs/heads/{}", default_branch).as_str());

    to_default_branch
        && payload.commits.iter().any(|commit| {
            commit
                .added
                .iter()
                .chain(&commit.modified)
                .chain(&commit.removed)
                .any(|path| path == CONFIG_PATH)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_pull_request_actions() {
        assert_eq!(
            PullRequestAction::parse("labeled"),
            Some(PullRequestAction::Labeled)
        );
        assert_eq!(
            PullRequestAction::parse("synchronize"),
            Some(PullRequestAction::Synchronize)
        );
        assert_eq!(PullRequestAction::parse("edited"), None);
        assert_eq!(PullRequestAction::parse("review_requested"), None);
        assert_eq!(PullRequestAction::parse(""), None);
    }

    fn push_payload(git_ref: &str, modified: &[&str]) -> GitHubWebhookPayload {
        serde_json::from_value(json!({
            "ref": git_ref,
            "commits": [{ "added": [], "modified": modified, "removed": [] }],
            "repository": {
                "name": "pytorch",
                "full_name": "pytorch/pytorch",
                "owner": { "id": 1, "login": "pytorch" },
                "default_branch": "main"
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_push_touches_config() {
        assert!(push_touches_config(&push_payload(
            "refs/heads/main",
            &[".github/pytorch-probot.yml"]
        )));
        assert!(!push_touches_config(&push_payload(
            "refs/heads/main",
            &["README.md"]
        )));
        assert!(!push_touches_config(&push_payload(
            "refs/heads/feature",
            &[".github/pytorch-probot.yml"]
        )));
        assert!(!push_touches_config(&push_payload(
            "refs/tags/ciflow/trunk/1",
            &[".github/pytorch-probot.yml"]
        )));
    }
}
