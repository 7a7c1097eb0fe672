//! Persisted record types
//!
//! Records reference each other by id only. A task points at its
//! summary message and its body blobs; a message points back at its task.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sonar_core::{
    Level, NetworkError, NetworkRequest, NetworkResponse, SessionId, TaskId, TaskState, TaskType,
    TransactionMetrics,
};

use crate::blobs::ContentKey;

pub(crate) fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}

/// Record of one recording session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub created_at_millis: i64,
    pub version: Option<String>,
    pub build: Option<String>,
}

impl SessionRecord {
    pub fn new(id: SessionId, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at_millis: created_at.timestamp_millis(),
            version: None,
            build: None,
        }
    }

    pub fn with_version(mut self, version: Option<String>, build: Option<String>) -> Self {
        self.version = version;
        self.build = build;
        self
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.created_at_millis)
    }
}

/// Identifier of a stored message, assigned in insertion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Placeholder for a message that has not been inserted yet
    pub const NEW: MessageId = MessageId(0);

    pub fn to_key(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored log message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: MessageId,
    pub created_at_millis: i64,
    pub level: Level,
    pub label: String,
    pub text: String,
    pub file: String,
    pub function: String,
    pub line: u32,
    pub session_id: SessionId,
    pub pinned: bool,
    pub metadata: Option<BTreeMap<String, String>>,
    /// Set when this message summarizes a network task
    pub task_id: Option<TaskId>,
}

impl MessageRecord {
    pub fn new(
        session_id: SessionId,
        level: Level,
        label: impl Into<String>,
        text: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::NEW,
            created_at_millis: created_at.timestamp_millis(),
            level,
            label: label.into(),
            text: text.into(),
            file: String::new(),
            function: String::new(),
            line: 0,
            session_id,
            pinned: false,
            metadata: None,
            task_id: None,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.created_at_millis)
    }
}

/// Transfer progress of a pending task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub completed_unit_count: i64,
    pub total_unit_count: i64,
}

/// The structured record of one network operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub message_id: MessageId,
    pub created_at_millis: i64,
    pub task_type: TaskType,
    pub state: TaskState,
    pub label: String,

    // Denormalized for filtering
    pub url: Option<String>,
    pub host: Option<String>,
    pub http_method: Option<String>,
    pub status_code: Option<u16>,
    pub error_code: Option<i64>,
    pub error_domain: Option<String>,
    pub response_content_type: Option<String>,
    pub is_from_cache: bool,

    pub original_request: NetworkRequest,
    pub current_request: Option<NetworkRequest>,
    pub response: Option<NetworkResponse>,
    pub error: Option<NetworkError>,

    pub request_body: Option<ContentKey>,
    pub response_body: Option<ContentKey>,
    /// Size of the original request body, -1 when unknown
    pub request_body_size: i64,
    /// Size of the original response body, -1 when unknown
    pub response_body_size: i64,

    pub start_date_millis: Option<i64>,
    /// Duration in seconds
    pub duration: Option<f64>,
    pub redirect_count: u32,
    pub transaction_count: u32,

    pub progress: Option<TaskProgress>,
    pub metadata: BTreeMap<String, String>,
}

impl TaskRecord {
    pub fn created_at(&self) -> DateTime<Utc> {
        millis_to_datetime(self.created_at_millis)
    }

    pub fn has_bodies(&self) -> bool {
        self.request_body.is_some() || self.response_body.is_some()
    }

    /// Every blob this task references
    pub fn blob_refs(&self) -> impl Iterator<Item = ContentKey> + '_ {
        self.request_body.iter().chain(self.response_body.iter()).copied()
    }
}

/// One transaction of a completed task, immutable once written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub task_id: TaskId,
    pub index: u32,
    pub metrics: TransactionMetrics,
}

impl TransactionRecord {
    pub fn key(&self) -> Vec<u8> {
        transaction_key(&self.task_id, self.index)
    }
}

pub(crate) fn transaction_key(task_id: &TaskId, index: u32) -> Vec<u8> {
    let mut key = Vec::with_capacity(20);
    key.extend_from_slice(task_id.as_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_record_serialization() {
        let message = MessageRecord::new(SessionId::generate(), Level::Info, "app", "hi", Utc::now());
        let bytes = postcard::to_allocvec(&message).unwrap();
        let decoded: MessageRecord = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.id, MessageId::NEW);
    }

    #[test]
    fn test_millis_conversion() {
        let now = Utc::now();
        let session = SessionRecord::new(SessionId::generate(), now);
        assert_eq!(session.created_at().timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn test_transaction_keys_sort_by_index() {
        let task = TaskId::generate();
        assert!(transaction_key(&task, 1) < transaction_key(&task, 2));
        assert!(transaction_key(&task, 9) < transaction_key(&task, 256));
        assert_eq!(transaction_key(&task, 0).len(), 20);
    }
}
