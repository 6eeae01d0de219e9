use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use ciflow_core::{GitRef, RefStore, RepoContext, CORRELATION_ID_HEADER};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, Method, StatusCode};
use reqwest_middleware::{ClientWithMiddleware, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::capabilities::{permission_allows_workflows, CommentPoster, PermissionChecker};
use crate::recording::{current_correlation_id, RecordingLogger, RecordingMiddleware};
use crate::repo_config::{ConfigLoader, RepoCiflowConfig, CONFIG_PATH};
use crate::webhook::PullRequest;

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Refresh installation tokens this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(300);

#[derive(Clone)]
enum Credentials {
    /// GitHub App: JWT signed with the app key, exchanged per installation.
    App { app_id: u64, private_key: String },
    /// Personal access token or pre-minted installation token.
    Token(String),
}

#[derive(Clone)]
pub struct GitHubClient {
    client: ClientWithMiddleware,
    api_url: String,
    credentials: Credentials,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
}

#[derive(Debug, Serialize)]
struct CreateRefRequest<'a> {
    #[serde(rename = "ref")]
    ref_path: &'a str,
    sha: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    #[serde(rename = "ref")]
    ref_path: String,
    object: RefObject,
}

#[derive(Debug, Deserialize)]
struct RefObject {
    sha: String,
}

#[derive(Debug, Serialize)]
struct CreateCommentRequest<'a> {
    body: &'a str,
}

#[derive(Debug, Deserialize)]
struct CommentResponse {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct FileContentsResponse {
    content: String,
}

#[derive(Debug, Deserialize)]
struct PermissionResponse {
    permission: String,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

impl GitHubClient {
    /// Client authenticating as a GitHub App.
    pub fn new_app(
        app_id: u64,
        private_key: String,
        recording_logger: Option<RecordingLogger>,
    ) -> Result<Self> {
        Ok(Self {
            client: create_github_client(recording_logger)?,
            api_url: DEFAULT_API_URL.to_string(),
            credentials: Credentials::App {
                app_id,
                private_key,
            },
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Client authenticating with a fixed token.
    pub fn with_token(token: String) -> Result<Self> {
        Ok(Self {
            client: create_github_client(None)?,
            api_url: DEFAULT_API_URL.to_string(),
            credentials: Credentials::Token(token),
            token_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Point at a different API root, e.g. a GitHub Enterprise server.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    fn repo_url(&self, repo: &RepoContext, path: &str) -> String {
        format!(
            "{}/repos/{}/{}/{}",
            self.api_url, repo.owner, repo.name, path
        )
    }

    /// URL of a git refs endpoint for `ref_query`. Each `/`-separated part is
    /// percent-encoded, so `#`, `?` and `%` in a tag name stay in the path.
    fn ref_url(&self, repo: &RepoContext, endpoint: &str, ref_query: &str) -> Result<String> {
        let mut url = url::Url::parse(&self.repo_url(repo, endpoint))
            .with_context(|| format!("Invalid GitHub API URL {}", self.api_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("GitHub API URL {} cannot take a path", self.api_url))?
            .pop_if_empty()
            .extend(ref_query.split('/'));
        Ok(url.into())
    }

    fn generate_jwt(app_id: u64, private_key: &str) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: app_id,
            iat: now - 60,  // Allow for clock skew
            exp: now + 600, // GitHub's maximum is 10 minutes
        };

        let encoding_key = EncodingKey::from_rsa_pem(private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .context("Failed to encode JWT")
    }

    async fn get_installation_token(
        &self,
        app_id: u64,
        private_key: &str,
        installation_id: u64,
    ) -> Result<String> {
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                let remaining = expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default();
                if remaining > TOKEN_REFRESH_MARGIN {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = Self::generate_jwt(app_id, private_key)?;
        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, installation_id
        );

        info!("Requesting new installation access token for {}", installation_id);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", jwt))
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .context("Failed to send installation token request")?;
        let response = check_status(response, "requesting installation token").await?;

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        let expires_at = chrono::DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);
        let expires_at_system =
            UNIX_EPOCH + Duration::from_secs(expires_at.timestamp().max(0) as u64);

        {
            let mut cache = self.token_cache.write().await;
            cache.insert(
                installation_id,
                (token_response.token.clone(), expires_at_system),
            );
        }

        info!("Successfully obtained installation access token");
        Ok(token_response.token)
    }

    async fn auth_token(&self, repo: &RepoContext) -> Result<String> {
        match &self.credentials {
            Credentials::Token(token) => Ok(token.clone()),
            Credentials::App {
                app_id,
                private_key,
            } => {
                let installation_id = repo.installation_id.ok_or_else(|| {
                    anyhow!("No installation ID for {}; cannot authenticate as app", repo)
                })?;
                self.get_installation_token(*app_id, private_key, installation_id)
                    .await
            }
        }
    }

    /// Authenticated request builder for a repository endpoint.
    async fn request(
        &self,
        method: Method,
        url: &str,
        repo: &RepoContext,
    ) -> Result<RequestBuilder> {
        let token = self.auth_token(repo).await?;
        let mut request_builder = self
            .client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");

        if let Some(cid) = current_correlation_id() {
            request_builder = request_builder.header(CORRELATION_ID_HEADER, cid);
        }

        Ok(request_builder)
    }

    /// Fetch a pull request's current labels, head and state.
    pub async fn get_pull_request(
        &self,
        repo: &RepoContext,
        pr_number: u64,
    ) -> Result<PullRequest> {
        let url = self.repo_url(repo, &format!("pulls/{}", pr_number));
        info!("Fetching PR #{} from {}", pr_number, repo);

        let response = self
            .request(Method::GET, &url, repo)
            .await?
            .send()
            .await
            .context("Failed to send get pull request request")?;
        let response = check_status(response, "fetching PR").await?;

        response
            .json()
            .await
            .context("Failed to parse pull request response")
    }

    /// Raw contents of a file on the default branch, or `None` if absent.
    async fn get_file_contents(&self, repo: &RepoContext, path: &str) -> Result<Option<String>> {
        let url = self.repo_url(repo, &format!("contents/{}", path));
        info!("Fetching {} from {}", path, repo);

        let response = self
            .request(Method::GET, &url, repo)
            .await?
            .send()
            .await
            .context("Failed to send file contents request")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_status(response, "fetching file").await?;

        let file_response: FileContentsResponse = response
            .json()
            .await
            .context("Failed to parse file contents response")?;
        let decoded = general_purpose::STANDARD
            .decode(file_response.content.replace('\n', ""))
            .context("Failed to decode base64 file content")?;
        let content = String::from_utf8(decoded).context("File content is not valid UTF-8")?;
        Ok(Some(content))
    }
}

#[async_trait]
impl RefStore for GitHubClient {
    async fn list_matching_refs(
        &self,
        repo: &RepoContext,
        ref_query: &str,
    ) -> Result<Vec<GitRef>> {
        let url = self.ref_url(repo, "git/matching-refs", ref_query)?;

        let response = self
            .request(Method::GET, &url, repo)
            .await?
            .send()
            .await
            .context("Failed to send matching refs request")?;
        let response = check_status(response, "listing matching refs").await?;

        let refs: Vec<RefResponse> = response
            .json()
            .await
            .context("Failed to parse matching refs response")?;
        Ok(refs
            .into_iter()
            .map(|r| GitRef::new(r.ref_path, r.object.sha))
            .collect())
    }

    async fn delete_ref(&self, repo: &RepoContext, ref_query: &str) -> Result<()> {
        let url = self.ref_url(repo, "git/refs", ref_query)?;

        let response = self
            .request(Method::DELETE, &url, repo)
            .await?
            .send()
            .await
            .context("Failed to send delete ref request")?;
        check_status(response, "deleting ref").await?;
        Ok(())
    }

    async fn create_ref(&self, repo: &RepoContext, ref_path: &str, sha: &str) -> Result<()> {
        let url = self.repo_url(repo, "git/refs");
        let request_body = CreateRefRequest { ref_path, sha };

        let response = self
            .request(Method::POST, &url, repo)
            .await?
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(&request_body)?)
            .send()
            .await
            .context("Failed to send create ref request")?;
        check_status(response, "creating ref").await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigLoader for GitHubClient {
    async fn load_config(&self, repo: &RepoContext) -> Result<Option<RepoCiflowConfig>> {
        match self.get_file_contents(repo, CONFIG_PATH).await? {
            Some(text) => RepoCiflowConfig::from_yaml(&text)
                .with_context(|| format!("Invalid {} in {}", CONFIG_PATH, repo)),
            None => {
                info!("No {} in {}", CONFIG_PATH, repo);
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl PermissionChecker for GitHubClient {
    async fn has_workflow_running_permissions(
        &self,
        repo: &RepoContext,
        login: &str,
    ) -> Result<bool> {
        let url = self.repo_url(repo, &format!("collaborators/{}/permission", login));

        let response = self
            .request(Method::GET, &url, repo)
            .await?
            .send()
            .await
            .context("Failed to send collaborator permission request")?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let response = check_status(response, "fetching collaborator permission").await?;

        let permission: PermissionResponse = response
            .json()
            .await
            .context("Failed to parse collaborator permission response")?;
        info!(
            "{} has {} permission on {}",
            login, permission.permission, repo
        );
        Ok(permission_allows_workflows(&permission.permission))
    }
}

#[async_trait]
impl CommentPoster for GitHubClient {
    async fn create_comment(
        &self,
        repo: &RepoContext,
        issue_number: u64,
        body: &str,
    ) -> Result<()> {
        let url = self.repo_url(repo, &format!("issues/{}/comments", issue_number));
        info!("Posting comment to PR #{} in {}", issue_number, repo);

        let response = self
            .request(Method::POST, &url, repo)
            .await?
            .header("Content-Type", "application/json")
            .body(serde_json::to_string(&CreateCommentRequest { body })?)
            .send()
            .await
            .context("Failed to send PR comment request")?;
        let response = check_status(response, "posting comment").await?;

        let comment: CommentResponse = response
            .json()
            .await
            .context("Failed to parse comment response")?;
        info!("Successfully posted comment with ID: {}", comment.id);
        Ok(())
    }
}

/// Turn a non-2xx response into an error carrying status and body.
async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let error_text = response
        .text()
        .await
        .context("Failed to read error response body")?;
    error!("GitHub API error {}: {} - {}", what, status, error_text);
    Err(anyhow!("GitHub API error {}: {} - {}", what, status, error_text))
}

pub fn create_github_client(
    recording_logger: Option<RecordingLogger>,
) -> Result<ClientWithMiddleware> {
    use reqwest_middleware::ClientBuilder;

    let client = Client::builder()
        .user_agent(concat!("ciflow-bot/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(30))
        .build()
        .context("Failed to create HTTP client")?;

    let mut builder = ClientBuilder::new(client);

    if let Some(logger) = recording_logger {
        builder = builder.with(RecordingMiddleware::new(logger));
    }

    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_url() {
        let client = GitHubClient::with_token("t".to_string())
            .unwrap()
            .with_api_url("https://github.example.com/api/v3/");
        let repo = RepoContext::new("pytorch", "pytorch");
        assert_eq!(
            client.repo_url(&repo, "git/matching-refs/tags/ciflow/trunk/1"),
            "https://github.example.com/api/v3/repos/pytorch/pytorch/git/matching-refs/tags/ciflow/trunk/1"
        );
    }

    #[test]
    fn test_ref_url_encodes_each_segment() {
        let client = GitHubClient::with_token("t".to_string()).unwrap();
        let repo = RepoContext::new("pytorch", "pytorch");
        assert_eq!(
            client
                .ref_url(&repo, "git/refs", "tags/ciflow/trunk/1")
                .unwrap(),
            "https://api.github.com/repos/pytorch/pytorch/git/refs/tags/ciflow/trunk/1"
        );
        assert_eq!(
            client
                .ref_url(&repo, "git/matching-refs", "tags/ciflow/a#b?c%d/1")
                .unwrap(),
            "https://api.github.com/repos/pytorch/pytorch/git/matching-refs/tags/ciflow/a%23b%3Fc%25d/1"
        );
    }

    #[test]
    fn test_ref_response_deserialization() {
        let json = r#"[{
            "ref": "refs/tags/ciflow/trunk/100",
            "node_id": "MDM6UmVmcmVmcy9oZWFkcy9mZWF0dXJlQQ==",
            "url": "https://api.github.com/repos/o/r/git/refs/tags/ciflow/trunk/100",
            "object": { "type": "commit", "sha": "aa218f56b14c9653891f9e74264a383fa43fefbd" }
        }]"#;
        let refs: Vec<RefResponse> = serde_json::from_str(json).unwrap();
        assert_eq!(refs[0].ref_path, "refs/tags/ciflow/trunk/100");
        assert_eq!(refs[0].object.sha, "aa218f56b14c9653891f9e74264a383fa43fefbd");
    }

    #[test]
    fn test_create_ref_request_serialization() {
        let body = serde_json::to_value(CreateRefRequest {
            ref_path: "refs/tags/ciflow/trunk/100",
            sha: "abc",
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({ "ref": "refs/tags/ciflow/trunk/100", "sha": "abc" })
        );
    }

    #[tokio::test]
    async fn test_app_credentials_require_installation() {
        let client = GitHubClient::new_app(1, "not a key".to_string(), None).unwrap();
        let err = client
            .auth_token(&RepoContext::new("o", "r"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No installation ID"));
    }

    #[tokio::test]
    async fn test_token_credentials_ignore_installation() {
        let client = GitHubClient::with_token("ghp_abc".to_string()).unwrap();
        let token = client
            .auth_token(&RepoContext::new("o", "r").with_installation(5))
            .await
            .unwrap();
        assert_eq!(token, "ghp_abc");
    }
}
