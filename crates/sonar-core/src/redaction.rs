//! Redaction applied to events before they are persisted
//!
//! A [`RedactionPolicy`] masks sensitive values in place:
//! - headers, matched by exact name (case-insensitive) or by pattern
//! - URL query items, matched by name
//! - JSON and form-encoded body fields, matched by key at any depth
//!
//! Masked values are replaced with [`REDACTED_PLACEHOLDER`].

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;
use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::error::ModelError;
use crate::event::Event;
use crate::network::{NetworkRequest, NetworkResponse};

/// Replacement written over every redacted value
pub const REDACTED_PLACEHOLDER: &str = "<private>";

const FORM_URLENCODED_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Rules describing which parts of an event must never be persisted
#[derive(Debug, Clone, Default)]
pub struct RedactionPolicy {
    header_names: HashSet<String>,
    header_patterns: Vec<Regex>,
    query_items: HashSet<String>,
    body_fields: HashSet<String>,
}

impl RedactionPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Redact a header by name (case-insensitive)
    pub fn redact_header(mut self, name: impl AsRef<str>) -> Self {
        self.header_names.insert(name.as_ref().to_ascii_lowercase());
        self
    }

    /// Redact every header whose name matches `pattern` (case-insensitive)
    pub fn redact_header_pattern(mut self, pattern: &str) -> Result<Self, ModelError> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ModelError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })?;
        self.header_patterns.push(regex);
        Ok(self)
    }

    /// Redact a URL query item by name
    pub fn redact_query_item(mut self, name: impl Into<String>) -> Self {
        self.query_items.insert(name.into());
        self
    }

    /// Redact a JSON or form body field by key
    pub fn redact_body_field(mut self, key: impl Into<String>) -> Self {
        self.body_fields.insert(key.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.header_names.is_empty()
            && self.header_patterns.is_empty()
            && self.query_items.is_empty()
            && self.body_fields.is_empty()
    }

    /// Apply the policy to every request, response, URL and body the
    /// event carries
    pub fn apply(&self, event: Event) -> Event {
        if self.is_empty() {
            return event;
        }
        match event {
            Event::MessageStored(message) => Event::MessageStored(message),
            Event::NetworkTaskCreated(mut created) => {
                self.scrub_request(&mut created.original_request);
                if let Some(request) = created.current_request.as_mut() {
                    self.scrub_request(request);
                }
                Event::NetworkTaskCreated(created)
            }
            Event::NetworkTaskProgressUpdated(mut progress) => {
                if let Some(url) = progress.url.as_mut() {
                    self.scrub_url(url);
                }
                Event::NetworkTaskProgressUpdated(progress)
            }
            Event::NetworkTaskCompleted(mut completed) => {
                self.scrub_request(&mut completed.original_request);
                if let Some(request) = completed.current_request.as_mut() {
                    self.scrub_request(request);
                }
                if let Some(response) = completed.response.as_mut() {
                    self.scrub_response(response);
                }
                if let Some(metrics) = completed.metrics.as_mut() {
                    for transaction in &mut metrics.transactions {
                        self.scrub_request(&mut transaction.request);
                        if let Some(response) = transaction.response.as_mut() {
                            self.scrub_response(response);
                        }
                    }
                }

                let request_headers = completed.effective_request().headers.clone();
                if let Some(body) = completed.request_body.take() {
                    completed.request_body = Some(self.scrub_body(body, &request_headers));
                }
                let response_headers = completed
                    .response
                    .as_ref()
                    .map(|r| r.headers.clone())
                    .unwrap_or_default();
                if let Some(body) = completed.response_body.take() {
                    completed.response_body = Some(self.scrub_body(body, &response_headers));
                }
                Event::NetworkTaskCompleted(completed)
            }
        }
    }

    fn is_sensitive_header(&self, name: &str) -> bool {
        self.header_names.contains(&name.to_ascii_lowercase())
            || self.header_patterns.iter().any(|p| p.is_match(name))
    }

    fn scrub_headers(&self, headers: &mut BTreeMap<String, String>) {
        for (name, value) in headers.iter_mut() {
            if self.is_sensitive_header(name) {
                *value = REDACTED_PLACEHOLDER.to_string();
            }
        }
    }

    fn scrub_request(&self, request: &mut NetworkRequest) {
        self.scrub_headers(&mut request.headers);
        if let Some(url) = request.url.as_mut() {
            self.scrub_url(url);
        }
    }

    fn scrub_response(&self, response: &mut NetworkResponse) {
        self.scrub_headers(&mut response.headers);
        if let Some(url) = response.url.as_mut() {
            self.scrub_url(url);
        }
    }

    fn scrub_url(&self, raw: &mut String) {
        if self.query_items.is_empty() {
            return;
        }
        match url::Url::parse(raw) {
            Ok(mut url) => {
                let Some(query) = url.query().and_then(|q| self.scrub_query(q)) else {
                    return;
                };
                url.set_query(Some(&query));
                *raw = url.to_string();
            }
            // Relative references such as `/login?token=...`
            Err(_) => {
                let Some((path, rest)) = raw.split_once('?') else {
                    return;
                };
                let (query, fragment) = match rest.split_once('#') {
                    Some((query, fragment)) => (query, Some(fragment)),
                    None => (rest, None),
                };
                let Some(query) = self.scrub_query(query) else {
                    return;
                };
                let mut scrubbed = format!("{path}?{query}");
                if let Some(fragment) = fragment {
                    scrubbed.push('#');
                    scrubbed.push_str(fragment);
                }
                *raw = scrubbed;
            }
        }
    }

    /// Rewritten query string, or `None` when nothing matched
    fn scrub_query(&self, query: &str) -> Option<String> {
        let mut changed = false;
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if self.query_items.contains(key.as_ref()) {
                changed = true;
                serializer.append_pair(&key, REDACTED_PLACEHOLDER);
            } else {
                serializer.append_pair(&key, &value);
            }
        }
        changed.then(|| serializer.finish())
    }

    fn scrub_body(&self, body: Bytes, headers: &BTreeMap<String, String>) -> Bytes {
        if self.body_fields.is_empty() {
            return body;
        }
        if let Some(redacted) = self.scrub_json_body(&body) {
            return Bytes::from(redacted);
        }
        if is_form_urlencoded(headers)
            && let Some(redacted) = self.scrub_form_body(&body)
        {
            return Bytes::from(redacted);
        }
        body
    }

    fn scrub_json_body(&self, body: &[u8]) -> Option<Vec<u8>> {
        let mut parsed: Value = serde_json::from_slice(body).ok()?;
        if !self.scrub_json_value(&mut parsed) {
            return None;
        }
        serde_json::to_vec(&parsed).ok()
    }

    fn scrub_json_value(&self, value: &mut Value) -> bool {
        match value {
            Value::Object(map) => {
                let mut changed = false;
                for (key, nested) in map.iter_mut() {
                    if self.body_fields.contains(key) {
                        *nested = Value::String(REDACTED_PLACEHOLDER.to_owned());
                        changed = true;
                        continue;
                    }
                    changed |= self.scrub_json_value(nested);
                }
                changed
            }
            Value::Array(values) => {
                let mut changed = false;
                for nested in values {
                    changed |= self.scrub_json_value(nested);
                }
                changed
            }
            _ => false,
        }
    }

    fn scrub_form_body(&self, body: &[u8]) -> Option<Vec<u8>> {
        let mut changed = false;
        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(body)
            .map(|(key, value)| {
                if self.body_fields.contains(key.as_ref()) {
                    changed = true;
                    (key.into_owned(), REDACTED_PLACEHOLDER.to_string())
                } else {
                    (key.into_owned(), value.into_owned())
                }
            })
            .collect();
        if !changed {
            return None;
        }
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        Some(encoded.into_bytes())
    }
}

fn is_form_urlencoded(headers: &BTreeMap<String, String>) -> bool {
    headers.iter().any(|(name, value)| {
        name.eq_ignore_ascii_case("content-type")
            && value
                .split(';')
                .next()
                .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(FORM_URLENCODED_CONTENT_TYPE))
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::event::{MessageStored, NetworkTaskCompleted, NetworkTaskProgressUpdated};
    use crate::ids::{SessionId, TaskId};
    use crate::level::Level;
    use crate::network::TaskType;

    fn completed(request: NetworkRequest) -> NetworkTaskCompleted {
        NetworkTaskCompleted::new(
            SessionId::generate(),
            TaskId::generate(),
            TaskType::Data,
            request,
            Utc::now(),
        )
    }

    fn unwrap_completed(event: Event) -> NetworkTaskCompleted {
        match event {
            Event::NetworkTaskCompleted(completed) => completed,
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_header_redaction_by_name() {
        let policy = RedactionPolicy::new().redact_header("Authorization");
        let request = NetworkRequest::new("https://example.com")
            .with_header("authorization", "Bearer secret")
            .with_header("Accept", "*/*");

        let event = policy.apply(Event::NetworkTaskCompleted(completed(request)));
        let completed = unwrap_completed(event);
        assert_eq!(
            completed.original_request.header("Authorization"),
            Some(REDACTED_PLACEHOLDER)
        );
        assert_eq!(completed.original_request.header("Accept"), Some("*/*"));
    }

    #[test]
    fn test_header_redaction_by_pattern() {
        let policy = RedactionPolicy::new().redact_header_pattern("^x-api-.*").unwrap();
        let response = NetworkResponse::new(200).with_header("X-Api-Key", "k-123");
        let event = completed(NetworkRequest::new("https://example.com")).with_response(response);

        let completed = unwrap_completed(policy.apply(Event::NetworkTaskCompleted(event)));
        assert_eq!(
            completed.response.unwrap().header("x-api-key"),
            Some(REDACTED_PLACEHOLDER)
        );
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(RedactionPolicy::new().redact_header_pattern("(").is_err());
    }

    #[test]
    fn test_query_item_redaction() {
        let policy = RedactionPolicy::new().redact_query_item("token");
        let progress = Event::NetworkTaskProgressUpdated(NetworkTaskProgressUpdated {
            task_id: TaskId::generate(),
            url: Some("https://example.com/a?token=abc123&page=2".into()),
            completed_unit_count: 1,
            total_unit_count: 2,
        });

        let Event::NetworkTaskProgressUpdated(progress) = policy.apply(progress) else {
            panic!("variant changed");
        };
        let url = progress.url.unwrap();
        assert!(!url.contains("abc123"));
        assert!(url.contains("page=2"));
    }

    #[test]
    fn test_query_item_redaction_in_relative_url() {
        let policy = RedactionPolicy::new().redact_query_item("token");
        let mut url = "/login?token=secret123&next=%2Fhome#top".to_string();
        policy.scrub_url(&mut url);

        assert!(!url.contains("secret123"));
        assert!(url.starts_with("/login?token="));
        assert!(url.contains("next=%2Fhome"));
        assert!(url.ends_with("#top"));

        let mut untouched = "/login?page=2".to_string();
        policy.scrub_url(&mut untouched);
        assert_eq!(untouched, "/login?page=2");
    }

    #[test]
    fn test_json_body_redaction_is_recursive() {
        let policy = RedactionPolicy::new().redact_body_field("password");
        let body = br#"{"user":"ann","auth":{"password":"hunter2"},"list":[{"password":"x"}]}"#;
        let event = completed(NetworkRequest::new("https://example.com/login")).with_request_body(body.to_vec());

        let completed = unwrap_completed(policy.apply(Event::NetworkTaskCompleted(event)));
        let stored = completed.request_body.unwrap();
        let text = std::str::from_utf8(&stored).unwrap();
        assert!(!text.contains("hunter2"));
        assert!(text.contains("\"user\":\"ann\""));
        assert_eq!(text.matches(REDACTED_PLACEHOLDER).count(), 2);
    }

    #[test]
    fn test_form_body_redaction() {
        let policy = RedactionPolicy::new().redact_body_field("secret");
        let request = NetworkRequest::new("https://example.com/form")
            .with_header("Content-Type", "application/x-www-form-urlencoded; charset=utf-8");
        let event = completed(request).with_request_body(b"secret=s3cr3t&name=bo".to_vec());

        let completed = unwrap_completed(policy.apply(Event::NetworkTaskCompleted(event)));
        let body = completed.request_body.unwrap();
        let text = std::str::from_utf8(&body).unwrap();
        assert!(!text.contains("s3cr3t"));
        assert!(text.contains("name=bo"));
    }

    #[test]
    fn test_non_json_body_untouched() {
        let policy = RedactionPolicy::new().redact_body_field("password");
        let event = completed(NetworkRequest::new("https://example.com")).with_response_body(b"password".to_vec());
        let completed = unwrap_completed(policy.apply(Event::NetworkTaskCompleted(event)));
        assert_eq!(completed.response_body.unwrap().as_ref(), b"password");
    }

    #[test]
    fn test_messages_pass_through() {
        let policy = RedactionPolicy::new().redact_header("Authorization");
        let message = Event::MessageStored(MessageStored::new(
            SessionId::generate(),
            Level::Info,
            "auth",
            "Authorization refreshed",
            Utc::now(),
        ));
        assert_eq!(policy.apply(message.clone()), message);
    }
}
