//! Pull request event handlers.
//!
//! Each handler recomputes everything it needs from the event payload;
//! nothing is remembered between deliveries. Tag state lives only in the
//! repository's refs and the PR's labels.

use std::sync::Arc;

use anyhow::Result;
use ciflow_core::{
    desired_tags, is_trigger_label, tag_name, RemoveOutcome, RepoContext, SyncOutcome,
    TagReconciler,
};
use tracing::{debug, info, warn};

use crate::capabilities::{CommentPoster, PermissionChecker};
use crate::repo_config::{ConfigLoader, RepoCiflowConfig, CONFIG_PATH};
use crate::webhook::PullRequest;

/// Pull requests that must never receive ciflow tags, as (owner, repo, number).
///
/// pytorch/pytorch#26921 is a long-lived PR used for other purposes.
pub const EXCLUDED_PULL_REQUESTS: &[(&str, &str, u64)] = &[("pytorch", "pytorch", 26921)];

pub fn is_excluded_pull_request(repo: &RepoContext, pr_number: u64) -> bool {
    EXCLUDED_PULL_REQUESTS
        .iter()
        .any(|(owner, name, number)| {
            repo.owner == *owner && repo.name == *name && pr_number == *number
        })
}

const WIKI_URL: &str = "https://github.com/pytorch/test-infra/wiki/PyTorch-bot#ciflow-bot";

pub fn no_config_comment() -> String {
    format!(
        "No ciflow labels are configured for this repo.\n\
         For information on how to enable CIFlow bot see this [wiki]( {})",
        WIKI_URL
    )
}

pub fn unknown_label_comment(
    label: &str,
    config: &RepoCiflowConfig,
    has_workflow_permissions: bool,
) -> String {
    let mut body = format!(
        "Unknown label `{}`.\n Currently recognized labels are\n",
        label
    );
    for recognized in &config.trigger_labels {
        body.push_str(&format!(" - `{}`\n", recognized));
    }
    if has_workflow_permissions {
        body = format!(
            "Warning: {}\n Please add the new label to {}",
            body, CONFIG_PATH
        );
    }
    body
}

/// What happened to a label-added event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelOutcome {
    /// Closed PRs get their tags back via the reopened event.
    PrClosed,
    NotTriggerLabel,
    /// The repository has no ciflow configuration; an explanatory comment was posted.
    NotConfigured,
    /// The label is not recognized and the author may not run workflows.
    UnknownLabel,
    Excluded,
    Synced(SyncOutcome),
}

pub struct CiflowHandlers {
    reconciler: Arc<TagReconciler>,
    config: Arc<dyn ConfigLoader>,
    permissions: Arc<dyn PermissionChecker>,
    comments: Arc<dyn CommentPoster>,
}

impl CiflowHandlers {
    pub fn new(
        reconciler: Arc<TagReconciler>,
        config: Arc<dyn ConfigLoader>,
        permissions: Arc<dyn PermissionChecker>,
        comments: Arc<dyn CommentPoster>,
    ) -> Self {
        Self {
            reconciler,
            config,
            permissions,
            comments,
        }
    }

    /// Add the tag for a newly attached label, after validating it against
    /// the repository's configuration.
    pub async fn handle_labeled(
        &self,
        repo: &RepoContext,
        pr: &PullRequest,
        label: &str,
    ) -> Result<LabelOutcome> {
        debug!("START Processing label event");

        if pr.is_closed() {
            info!("Ignoring label {} on closed PR #{}", label, pr.number);
            return Ok(LabelOutcome::PrClosed);
        }
        if !is_trigger_label(label) {
            return Ok(LabelOutcome::NotTriggerLabel);
        }

        let Some(config) = self.config.load_config(repo).await? else {
            info!("No ciflow config in {}, explaining on PR #{}", repo, pr.number);
            self.comments
                .create_comment(repo, pr.number, &no_config_comment())
                .await?;
            return Ok(LabelOutcome::NotConfigured);
        };

        if !config.allows(label) {
            let has_permissions = self
                .permissions
                .has_workflow_running_permissions(repo, &pr.user.login)
                .await?;
            let body = unknown_label_comment(label, &config, has_permissions);
            self.comments.create_comment(repo, pr.number, &body).await?;
            if !has_permissions {
                info!(
                    "Unknown label {} on PR #{} from {} without workflow permissions",
                    label, pr.number, pr.user.login
                );
                return Ok(LabelOutcome::UnknownLabel);
            }
            warn!(
                "Unknown label {} on PR #{}, proceeding since {} can run workflows",
                label, pr.number, pr.user.login
            );
        }

        if is_excluded_pull_request(repo, pr.number) {
            info!("PR #{} in {} never gets ciflow tags", pr.number, repo);
            return Ok(LabelOutcome::Excluded);
        }

        let tag = tag_name(label, pr.number);
        let outcome = self.reconciler.sync(repo, &tag, &pr.head.sha).await?;
        Ok(LabelOutcome::Synced(outcome))
    }

    /// Remove the tag corresponding to a removed label.
    pub async fn handle_unlabeled(
        &self,
        repo: &RepoContext,
        pr: &PullRequest,
        label: &str,
    ) -> Result<Option<RemoveOutcome>> {
        debug!("START Processing unlabeled event");

        if !is_trigger_label(label) {
            return Ok(None);
        }
        let tag = tag_name(label, pr.number);
        let outcome = self.reconciler.remove(repo, &tag).await?;
        Ok(Some(outcome))
    }

    /// Point every ciflow tag of the PR at its current head.
    pub async fn handle_sync(
        &self,
        repo: &RepoContext,
        pr: &PullRequest,
    ) -> Result<Vec<SyncOutcome>> {
        debug!("START Processing sync event");

        let tags = self.pr_tags(pr);
        info!(
            "Moving {} tag(s) of PR #{} to {} at {}",
            tags.len(),
            pr.number,
            pr.head.ref_name,
            pr.head.sha
        );
        let outcomes = self
            .reconciler
            .sync_all(repo, &tags, &pr.head.sha)
            .await?;

        info!("END Processing sync event");
        Ok(outcomes)
    }

    /// Remove every ciflow tag of a closed PR.
    pub async fn handle_closed(
        &self,
        repo: &RepoContext,
        pr: &PullRequest,
    ) -> Result<Vec<RemoveOutcome>> {
        debug!("START Processing closed event");

        let tags = self.pr_tags(pr);
        self.reconciler.remove_all(repo, &tags).await
    }

    fn pr_tags(&self, pr: &PullRequest) -> Vec<String> {
        let labels: Vec<&str> = pr.label_names().filter(|l| is_trigger_label(l)).collect();
        info!("Found labels on PR #{}: {:?}", pr.number, labels);
        desired_tags(labels, pr.number).into_iter().collect()
    }
}
