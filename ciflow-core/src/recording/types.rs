use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordedEvent {
    pub timestamp: String,      // RFC 3339
    pub correlation_id: String, // Webhook delivery ID shared by every event it causes
    pub event_type: EventType,
    pub direction: Direction,
    pub operation: String,       // e.g. "pull_request.labeled", "POST /repos/o/r/git/refs"
    pub data: serde_json::Value, // Sanitized request/response data
    pub metadata: HashMap<String, String>,
}

impl RecordedEvent {
    pub fn new(
        timestamp: impl Into<String>,
        correlation_id: &CorrelationId,
        event_type: EventType,
        direction: Direction,
        operation: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            timestamp: timestamp.into(),
            correlation_id: correlation_id.0.clone(),
            event_type,
            direction,
            operation: operation.into(),
            data,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum EventType {
    WebhookReceived,
    GitHubApiCall,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Direction {
    Request,
    Response,
}

/// Ties a webhook delivery to the API calls made while handling it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    /// Use GitHub's delivery GUID when present so recordings line up with
    /// the app's "Recent Deliveries" page; otherwise mint a fresh one.
    pub fn from_delivery(delivery_id: Option<&str>, fallback: impl FnOnce() -> String) -> Self {
        match delivery_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => Self(id.to_string()),
            None => Self(fallback()),
        }
    }
}

// Header carrying the correlation ID on outgoing requests
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

// Header GitHub sets on every webhook delivery
pub const DELIVERY_ID_HEADER: &str = "X-GitHub-Delivery";
