use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use ciflow_core::{
    CorrelationId, Direction, EventType, RecordedEvent, RepoContext, Sanitizer,
    DELIVERY_ID_HEADER,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::dispatch::DispatchOutcome;
use crate::recording::{recordable_headers, CURRENT_CORRELATION_ID};
use crate::AppState;

pub const EVENT_HEADER: &str = "x-github-event";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// GitHub caps webhook payloads at 25 MB; larger bodies are rejected unread.
pub const MAX_WEBHOOK_BODY_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Deserialize, Clone)]
pub struct GitHubWebhookPayload {
    pub action: Option<String>,
    pub pull_request: Option<PullRequest>,
    pub label: Option<Label>,
    pub repository: Option<Repository>,
    pub sender: Option<User>,
    pub installation: Option<Installation>,
    /// Pushed ref, e.g. `refs/heads/main` (push events only).
    #[serde(rename = "ref")]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub commits: Vec<PushCommit>,
}

impl GitHubWebhookPayload {
    /// The repository this delivery is about, with its installation.
    pub fn repo_context(&self) -> Option<RepoContext> {
        let repo = self.repository.as_ref()?;
        let context = RepoContext::new(repo.owner.login.clone(), repo.name.clone());
        Some(match &self.installation {
            Some(installation) => context.with_installation(installation.id),
            None => context,
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Installation {
    pub id: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequest {
    pub number: u64,
    /// `open` or `closed`
    pub state: String,
    pub head: PullRequestRef,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub user: User,
}

impl PullRequest {
    pub fn is_closed(&self) -> bool {
        self.state == "closed"
    }

    pub fn label_names(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(|l| l.name.as_str())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestRef {
    pub sha: String,
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub owner: User,
    pub default_branch: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct User {
    pub id: u64,
    pub login: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PushCommit {
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub modified: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

type HmacSha256 = Hmac<Sha256>;

pub fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);

    // Constant-time comparison
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_WEBHOOK_BODY_BYTES)
        .await
        .map_err(|e| {
            error!("Failed to read webhook body: {}", e);
            StatusCode::PAYLOAD_TOO_LARGE
        })?;

    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !verify_github_signature(&state.webhook_secret, &bytes, signature) {
        error!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let correlation_id = CorrelationId::from_delivery(
        header_str(&parts.headers, DELIVERY_ID_HEADER),
        || Uuid::new_v4().to_string(),
    );

    if let Some(ref logger) = state.recording_logger {
        let event_name = header_str(&parts.headers, EVENT_HEADER).unwrap_or("unknown");
        let body = serde_json::from_slice::<serde_json::Value>(&bytes)
            .map(|v| Sanitizer::sanitize_json(&v))
            .unwrap_or(serde_json::Value::Null);
        let operation = match body.get("action").and_then(|a| a.as_str()) {
            Some(action) => format!("{}.{}", event_name, action),
            None => event_name.to_string(),
        };
        let sender = body
            .pointer("/sender/login")
            .and_then(|login| login.as_str())
            .unwrap_or("unknown")
            .to_string();
        let event = RecordedEvent::new(
            chrono::Utc::now().to_rfc3339(),
            &correlation_id,
            EventType::WebhookReceived,
            Direction::Request,
            operation,
            serde_json::json!({
                "headers": recordable_headers(&parts.headers),
                "body": body,
            }),
        )
        .with_metadata("event", event_name)
        .with_metadata("sender", sender);
        logger.record(event);
    }

    let mut new_request = Request::from_parts(parts, axum::body::Body::from(bytes));
    new_request.extensions_mut().insert(correlation_id);

    Ok(next.run(new_request).await)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|h| h.to_str().ok())
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .cloned()
        .unwrap_or_else(|| CorrelationId(Uuid::new_v4().to_string()));

    let (parts, body) = request.into_parts();
    let event_name = header_str(&parts.headers, EVENT_HEADER)
        .unwrap_or_default()
        .to_string();
    let bytes = axum::body::to_bytes(body, MAX_WEBHOOK_BODY_BYTES)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let payload: GitHubWebhookPayload = serde_json::from_slice(&bytes).map_err(|e| {
        error!("Failed to parse {} webhook payload: {}", event_name, e);
        StatusCode::BAD_REQUEST
    })?;

    let span = info_span!(
        "delivery",
        delivery = %correlation_id.0,
        event = %event_name,
        action = payload.action.as_deref().unwrap_or(""),
        repo = payload.repository.as_ref().map(|r| r.full_name.as_str()).unwrap_or(""),
        pr = payload.pull_request.as_ref().map(|pr| pr.number).unwrap_or(0),
    );

    let result = CURRENT_CORRELATION_ID
        .scope(
            correlation_id,
            state
                .dispatcher
                .dispatch(&event_name, &payload)
                .instrument(span),
        )
        .await;

    match result {
        Ok(DispatchOutcome::Handled) => Ok(Json(WebhookResponse {
            message: "processed".to_string(),
        })),
        Ok(DispatchOutcome::Ignored) => {
            info!(
                "Ignoring {} event with action {:?}",
                event_name, payload.action
            );
            Ok(Json(WebhookResponse {
                message: "ignored".to_string(),
            }))
        }
        Err(e) => {
            error!("Failed to process {} event: {:#}", event_name, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sign(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_verify_github_signature_accepts_valid_signature() {
        let payload = br#"{"action":"labeled"}"#;
        let signature = sign("s3cret", payload);
        assert!(verify_github_signature("s3cret", payload, &signature));
    }

    #[test]
    fn test_verify_github_signature_rejects_bad_signatures() {
        let payload = br#"{"action":"labeled"}"#;
        let signature = sign("s3cret", payload);

        // Wrong secret
        assert!(!verify_github_signature("other", payload, &signature));
        // Tampered body
        assert!(!verify_github_signature(
            "s3cret",
            br#"{"action":"closed"}"#,
            &signature
        ));
        // Missing prefix, bad hex, sha1 scheme
        assert!(!verify_github_signature(
            "s3cret",
            payload,
            signature.trim_start_matches("sha256=")
        ));
        assert!(!verify_github_signature("s3cret", payload, "sha256=zz"));
        assert!(!verify_github_signature("s3cret", payload, "sha1=abcd"));
    }

    #[test]
    fn test_labeled_payload_deserialization() {
        let json_payload = json!({
            "action": "labeled",
            "number": 100,
            "label": { "id": 1, "name": "ciflow/trunk", "color": "ededed" },
            "pull_request": {
                "number": 100,
                "state": "open",
                "head": { "sha": "abc123", "ref": "feature" },
                "labels": [
                    { "id": 1, "name": "ciflow/trunk" },
                    { "id": 2, "name": "module: nn" }
                ],
                "user": { "id": 7, "login": "contributor" }
            },
            "repository": {
                "name": "pytorch",
                "full_name": "pytorch/pytorch",
                "owner": { "id": 21003710, "login": "pytorch" },
                "default_branch": "main"
            },
            "sender": { "id": 8, "login": "maintainer" },
            "installation": { "id": 999 }
        });

        let payload: GitHubWebhookPayload = serde_json::from_value(json_payload).unwrap();
        assert_eq!(payload.action.as_deref(), Some("labeled"));
        assert_eq!(payload.label.as_ref().unwrap().name, "ciflow/trunk");
        assert!(payload.commits.is_empty());

        let pr = payload.pull_request.as_ref().unwrap();
        assert!(!pr.is_closed());
        assert_eq!(
            pr.label_names().collect::<Vec<_>>(),
            vec!["ciflow/trunk", "module: nn"]
        );
        assert_eq!(pr.user.login, "contributor");

        let repo = payload.repo_context().unwrap();
        assert_eq!(repo.full_name(), "pytorch/pytorch");
        assert_eq!(repo.installation_id, Some(999));
    }

    #[test]
    fn test_push_payload_deserialization() {
        let json_payload = json!({
            "ref": "refs/heads/main",
            "commits": [
                { "id": "c1", "added": [], "modified": [".github/pytorch-probot.yml"], "removed": [] },
                { "id": "c2" }
            ],
            "repository": {
                "name": "pytorch",
                "full_name": "pytorch/pytorch",
                "owner": { "id": 1, "login": "pytorch" },
                "default_branch": "main"
            }
        });

        let payload: GitHubWebhookPayload = serde_json::from_value(json_payload).unwrap();
        assert_eq!(payload.git_ref.as_deref(), Some("refs/heads/main"));
        assert_eq!(payload.commits.len(), 2);
        assert!(payload.commits[1].modified.is_empty());
        assert_eq!(payload.repo_context().unwrap().installation_id, None);
    }

    proptest::proptest! {
        #[test]
        fn signature_rejects_any_other_body(
            body in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..256),
            flip in 0usize..256,
        ) {
            let signature = sign("s3cret", &body);
            proptest::prop_assert!(verify_github_signature("s3cret", &body, &signature));

            let mut tampered = body.clone();
            if tampered.is_empty() {
                tampered.push(0);
            } else {
                let i = flip % tampered.len();
                tampered[i] ^= 0x01;
            }
            proptest::prop_assert!(!verify_github_signature("s3cret", &tampered, &signature));
        }
    }
}
