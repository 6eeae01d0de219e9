//! Recording of webhook deliveries and GitHub API traffic to a JSONL file.

pub mod logger;
pub mod middleware;

pub use logger::RecordingLogger;
pub use middleware::RecordingMiddleware;

use axum::http::HeaderMap;
use ciflow_core::{CorrelationId, Sanitizer};
use std::collections::BTreeMap;

tokio::task_local! {
    /// Correlation ID of the delivery the current task is handling.
    pub static CURRENT_CORRELATION_ID: CorrelationId;
}

/// The current delivery's correlation ID, if running inside one.
pub fn current_correlation_id() -> Option<String> {
    CURRENT_CORRELATION_ID.try_with(|id| id.0.clone()).ok()
}

/// Printable headers with credentials redacted. Non-UTF-8 values are skipped.
pub fn recordable_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    Sanitizer::sanitize_headers(
        headers
            .iter()
            .filter_map(|(name, value)| Some((name.as_str(), value.to_str().ok()?))),
    )
}
