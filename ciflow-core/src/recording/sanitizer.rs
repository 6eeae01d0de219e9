use serde_json::Value;
use std::collections::BTreeMap;

/// Headers that carry credentials and must be redacted before recording.
pub const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-github-token",
    "x-hub-signature",
    "x-hub-signature-256",
];

/// JSON keys redacted on their own or as a `_`-separated suffix
/// (`access_token`, `client_secret`).
const SENSITIVE_KEYS: &[&str] = &["token", "private_key", "secret", "password"];

const REDACTED: &str = "[REDACTED]";

pub struct Sanitizer;

impl Sanitizer {
    pub fn is_sensitive_header(header_name: &str) -> bool {
        SENSITIVE_HEADERS
            .iter()
            .any(|sensitive| header_name.eq_ignore_ascii_case(sensitive))
    }

    pub fn is_sensitive_key(key: &str) -> bool {
        let key = key.to_ascii_lowercase();
        SENSITIVE_KEYS.iter().any(|sensitive| {
            key == *sensitive
                || key
                    .strip_suffix(sensitive)
                    .is_some_and(|prefix| prefix.ends_with('_'))
        })
    }

    /// Header names and values ready to record, credentials replaced.
    pub fn sanitize_headers<'a, I>(headers: I) -> BTreeMap<String, String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        headers
            .into_iter()
            .map(|(name, value)| {
                let value = if Self::is_sensitive_header(name) {
                    REDACTED
                } else {
                    value
                };
                (name.to_string(), value.to_string())
            })
            .collect()
    }

    /// Redact credential-looking keys anywhere in a JSON document.
    pub fn sanitize_json(value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, val)| {
                        let val = if Self::is_sensitive_key(key) {
                            Value::String(REDACTED.to_string())
                        } else {
                            Self::sanitize_json(val)
                        };
                        (key.clone(), val)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(Self::sanitize_json).collect()),
            _ => value.clone(),
        }
    }
}
