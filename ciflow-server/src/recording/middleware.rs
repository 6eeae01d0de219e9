use super::{current_correlation_id, recordable_headers, RecordingLogger};
use ciflow_core::{
    CorrelationId, Direction, EventType, RecordedEvent, Sanitizer, CORRELATION_ID_HEADER,
};
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Records every outgoing GitHub API request and its response.
pub struct RecordingMiddleware {
    logger: RecordingLogger,
}

impl RecordingMiddleware {
    pub fn new(logger: RecordingLogger) -> Self {
        Self { logger }
    }
}

#[async_trait::async_trait]
impl Middleware for RecordingMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut axum::http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        // Header first, then the delivery being handled, then a fresh ID
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .map(str::to_string)
            .or_else(current_correlation_id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if !req.headers().contains_key(CORRELATION_ID_HEADER) {
            if let Ok(value) = correlation_id.parse() {
                req.headers_mut().insert(CORRELATION_ID_HEADER, value);
            }
        }
        let correlation_id = CorrelationId(correlation_id);

        let operation = format!("{} {}", req.method(), extract_path(req.url().as_str()));
        let request_data = RequestData {
            method: req.method().to_string(),
            url: req.url().to_string(),
            headers: recordable_headers(req.headers()),
            body: describe_body(&req),
        };
        self.logger.record(RecordedEvent::new(
            chrono::Utc::now().to_rfc3339(),
            &correlation_id,
            EventType::GitHubApiCall,
            Direction::Request,
            operation.clone(),
            serde_json::to_value(&request_data).unwrap_or(serde_json::Value::Null),
        ));

        let response = next.run(req, extensions).await;

        let data = match &response {
            Ok(resp) => serde_json::to_value(ResponseData {
                status_code: resp.status().as_u16(),
                headers: recordable_headers(resp.headers()),
                body_size: resp.content_length().unwrap_or(0),
            })
            .unwrap_or(serde_json::Value::Null),
            Err(err) => serde_json::json!({ "error": err.to_string() }),
        };
        self.logger.record(RecordedEvent::new(
            chrono::Utc::now().to_rfc3339(),
            &correlation_id,
            EventType::GitHubApiCall,
            Direction::Response,
            operation,
            data,
        ));

        response
    }
}

#[derive(Debug, serde::Serialize)]
struct RequestData {
    method: String,
    url: String,
    headers: BTreeMap<String, String>,
    body: String,
}

#[derive(Debug, serde::Serialize)]
struct ResponseData {
    status_code: u16,
    headers: BTreeMap<String, String>,
    body_size: u64,
}

fn describe_body(request: &Request) -> String {
    match request.body().map(|b| b.as_bytes()) {
        None => "[NO_BODY]".to_string(),
        Some(None) => "[STREAM_BODY]".to_string(),
        Some(Some(bytes)) if bytes.len() > 10_000 => format!("[LARGE_BODY_{}b]", bytes.len()),
        Some(Some(bytes)) => match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(json) => Sanitizer::sanitize_json(&json).to_string(),
            Err(_) => String::from_utf8_lossy(bytes).into_owned(),
        },
    }
}

fn extract_path(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_path() {
        assert_eq!(
            extract_path("https://api.github.com/repos/o/r/git/matching-refs/tags/ciflow/trunk/1"),
            "/repos/o/r/git/matching-refs/tags/ciflow/trunk/1"
        );
        assert_eq!(extract_path("not a url"), "not a url");
    }

    #[test]
    fn test_describe_body_redacts_json() {
        let request = reqwest::Client::new()
            .post("https://api.github.com/app/installations/1/access_tokens")
            .body(r#"{"token":"ghs_secret","ref":"refs/tags/ci/x/1"}"#)
            .build()
            .unwrap();
        let body = describe_body(&request);
        assert!(body.contains("[REDACTED]"));
        assert!(!body.contains("ghs_secret"));
        assert!(body.contains("refs/tags/ci/x/1"));
    }
}
