pub mod capabilities;
pub mod config;
pub mod dispatch;
pub mod github;
pub mod handlers;
pub mod recording;
pub mod repo_config;
pub mod testing;
pub mod webhook;

use std::sync::Arc;
use std::time::Duration;

use ciflow_core::{RefStore, TagReconciler};

pub use capabilities::{CommentPoster, PermissionChecker};
pub use dispatch::{DispatchOutcome, Dispatcher, PullRequestAction};
pub use github::GitHubClient;
pub use handlers::{CiflowHandlers, LabelOutcome};
pub use recording::RecordingLogger;
pub use repo_config::{CachedConfigTracker, ConfigLoader, RepoCiflowConfig};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub fn get_bot_version() -> String {
    let hash = option_env!("CIFLOW_GIT_HASH").or(built_info::GIT_COMMIT_HASH);
    match hash {
        Some(git_hash) => git_hash.chars().take(8).collect(),
        None => built_info::PKG_VERSION.to_string(),
    }
}

pub struct AppState {
    pub dispatcher: Dispatcher,
    pub webhook_secret: String,
    pub recording_logger: Option<RecordingLogger>,
}

/// Wire the handlers and dispatch table from their collaborators.
///
/// `config_source` is wrapped in a `CachedConfigTracker` whose entries push
/// events can invalidate.
pub fn build_dispatcher(
    refs: Arc<dyn RefStore>,
    config_source: Arc<dyn ConfigLoader>,
    permissions: Arc<dyn PermissionChecker>,
    comments: Arc<dyn CommentPoster>,
    config_ttl: Duration,
) -> Dispatcher {
    let config_tracker = Arc::new(CachedConfigTracker::new(config_source, config_ttl));
    let handlers = CiflowHandlers::new(
        Arc::new(TagReconciler::new(refs)),
        config_tracker.clone(),
        permissions,
        comments,
    );
    Dispatcher::new(handlers, config_tracker)
}
