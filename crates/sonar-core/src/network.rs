//! Network task payloads
//!
//! Plain data describing one network operation as observed by the
//! instrumentation layer: the request that was sent, the response that
//! came back, the failure if any, and per-transaction metrics.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of network task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Data,
    Download,
    Upload,
    Stream,
    WebSocket,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskType::Data => "data",
            TaskType::Download => "download",
            TaskType::Upload => "upload",
            TaskType::Stream => "stream",
            TaskType::WebSocket => "websocket",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a network task
///
/// Transitions exactly once, from `Pending` to one of the terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Success,
    Failure,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskState::Pending)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Success => "success",
            TaskState::Failure => "failure",
        };
        f.write_str(name)
    }
}

/// An outgoing request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkRequest {
    pub url: Option<String>,
    pub http_method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Timeout interval in seconds
    pub timeout: Option<f64>,
}

impl NetworkRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            http_method: Some("GET".to_string()),
            ..Default::default()
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.http_method = Some(method.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Look up a header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Host component of the URL, if it parses
    pub fn host(&self) -> Option<String> {
        let url = url::Url::parse(self.url.as_deref()?).ok()?;
        url.host_str().map(str::to_string)
    }
}

/// A received response
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkResponse {
    pub url: Option<String>,
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl NetworkResponse {
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code: Some(status_code),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn content_type(&self) -> Option<ContentType> {
        self.header("Content-Type").map(ContentType::parse)
    }

    /// Whether the status code counts as success
    ///
    /// A missing or zero status is treated as success; only the error
    /// field marks such tasks as failed.
    pub fn is_success(&self) -> bool {
        match self.status_code {
            None | Some(0) => true,
            Some(code) => (200..400).contains(&code),
        }
    }
}

fn find_header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// A failure reported for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkError {
    pub code: i64,
    pub domain: String,
    pub debug_description: String,
}

impl NetworkError {
    pub fn new(code: i64, domain: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            code,
            domain: domain.into(),
            debug_description: description.into(),
        }
    }
}

/// Collected metrics for a completed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMetrics {
    pub task_interval: DateInterval,
    pub redirect_count: u32,
    #[serde(default)]
    pub transactions: Vec<TransactionMetrics>,
}

/// A start date plus a duration in seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateInterval {
    pub start: DateTime<Utc>,
    pub duration: f64,
}

impl DateInterval {
    pub fn new(start: DateTime<Utc>, duration: f64) -> Self {
        Self { start, duration }
    }
}

/// How a transaction's resource was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchType {
    #[default]
    Unknown,
    NetworkLoad,
    ServerPush,
    LocalCache,
}

/// Metrics for one request/response exchange within a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionMetrics {
    pub fetch_type: FetchType,
    pub request: NetworkRequest,
    pub response: Option<NetworkResponse>,
    #[serde(default)]
    pub timing: TransactionTiming,
    pub network_protocol: Option<String>,
    #[serde(default)]
    pub transfer_size: TransferSize,
    #[serde(default)]
    pub conditions: ConnectionConditions,
    pub local_address: Option<String>,
    pub remote_address: Option<String>,
    pub local_port: Option<u16>,
    pub remote_port: Option<u16>,
    pub tls_protocol_version: Option<u16>,
    pub tls_cipher_suite: Option<u16>,
}

impl TransactionMetrics {
    pub fn new(fetch_type: FetchType, request: NetworkRequest) -> Self {
        Self {
            fetch_type,
            request,
            response: None,
            timing: TransactionTiming::default(),
            network_protocol: None,
            transfer_size: TransferSize::default(),
            conditions: ConnectionConditions::default(),
            local_address: None,
            remote_address: None,
            local_port: None,
            remote_port: None,
            tls_protocol_version: None,
            tls_cipher_suite: None,
        }
    }

    pub fn with_response(mut self, response: NetworkResponse) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_transfer_size(mut self, transfer_size: TransferSize) -> Self {
        self.transfer_size = transfer_size;
        self
    }
}

/// Timestamps of the phases of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TransactionTiming {
    pub fetch_start: Option<DateTime<Utc>>,
    pub domain_lookup_start: Option<DateTime<Utc>>,
    pub domain_lookup_end: Option<DateTime<Utc>>,
    pub connect_start: Option<DateTime<Utc>>,
    pub secure_connection_start: Option<DateTime<Utc>>,
    pub secure_connection_end: Option<DateTime<Utc>>,
    pub connect_end: Option<DateTime<Utc>>,
    pub request_start: Option<DateTime<Utc>>,
    pub request_end: Option<DateTime<Utc>>,
    pub response_start: Option<DateTime<Utc>>,
    pub response_end: Option<DateTime<Utc>>,
}

/// Byte counters of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransferSize {
    pub request_header_bytes_sent: i64,
    pub request_body_bytes_before_encoding: i64,
    pub request_body_bytes_sent: i64,
    pub response_header_bytes_received: i64,
    pub response_body_bytes_after_decoding: i64,
    pub response_body_bytes_received: i64,
}

/// Connection properties of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionConditions {
    pub is_proxy_connection: bool,
    pub is_reused_connection: bool,
    pub is_cellular: bool,
    pub is_expensive: bool,
    pub is_constrained: bool,
    pub is_multipath: bool,
}

/// A parsed `Content-Type` header value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// Lowercased `type/subtype`
    pub mime: String,
    pub parameters: BTreeMap<String, String>,
}

impl ContentType {
    /// Parse a header value such as `text/html; charset=utf-8`
    pub fn parse(raw: &str) -> Self {
        let mut parts = raw.split(';');
        let mime = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        let parameters = parts
            .filter_map(|part| {
                let (key, value) = part.split_once('=')?;
                Some((
                    key.trim().to_ascii_lowercase(),
                    value.trim().trim_matches('"').to_string(),
                ))
            })
            .collect();
        Self { mime, parameters }
    }

    pub fn is_image(&self) -> bool {
        self.mime.starts_with("image/")
    }

    pub fn is_json(&self) -> bool {
        self.mime == "application/json" || self.mime.ends_with("+json")
    }

    pub fn is_html(&self) -> bool {
        self.mime == "text/html"
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.mime)?;
        for (key, value) in &self.parameters {
            write!(f, "; {}={}", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_parse() {
        let ct = ContentType::parse("Text/HTML; charset=\"UTF-8\"; q=1");
        assert_eq!(ct.mime, "text/html");
        assert_eq!(ct.parameters.get("charset").map(String::as_str), Some("UTF-8"));
        assert!(ct.is_html());
        assert!(!ct.is_image());
        assert_eq!(ct.to_string(), "text/html; charset=UTF-8; q=1");
    }

    #[test]
    fn test_content_type_kinds() {
        assert!(ContentType::parse("image/png").is_image());
        assert!(ContentType::parse("application/problem+json").is_json());
        assert!(!ContentType::parse("").is_json());
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let response = NetworkResponse::new(200).with_header("content-type", "image/jpeg");
        assert_eq!(response.header("Content-Type"), Some("image/jpeg"));
        assert!(response.content_type().unwrap().is_image());
    }

    #[test]
    fn test_response_success_range() {
        assert!(NetworkResponse::new(200).is_success());
        assert!(NetworkResponse::new(304).is_success());
        assert!(NetworkResponse::new(0).is_success());
        assert!(!NetworkResponse::new(404).is_success());
        assert!(!NetworkResponse::new(500).is_success());
        assert!(!NetworkResponse::new(101).is_success());
    }

    #[test]
    fn test_request_host() {
        let request = NetworkRequest::new("https://api.example.com:8443/v1/users?id=1");
        assert_eq!(request.host().as_deref(), Some("api.example.com"));
        assert_eq!(NetworkRequest::default().host(), None);
    }

    #[test]
    fn test_task_state_terminal() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(TaskState::Success.is_terminal());
        assert!(TaskState::Failure.is_terminal());
    }
}
