//! Events fed into the store by instrumentation producers
//!
//! [`Event`] is both the in-process ingestion format and the wire format
//! used to forward events across process boundaries (JSON or postcard).

use std::collections::BTreeMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::ids::{SessionId, TaskId};
use crate::level::Level;
use crate::network::{NetworkError, NetworkMetrics, NetworkRequest, NetworkResponse, TaskType};

/// An externally produced record describing a log message or a step in
/// a network task's lifecycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    /// A free-form log message
    MessageStored(MessageStored),

    /// A network task started
    NetworkTaskCreated(NetworkTaskCreated),

    /// A network task reported transfer progress
    NetworkTaskProgressUpdated(NetworkTaskProgressUpdated),

    /// A network task finished, successfully or not
    NetworkTaskCompleted(NetworkTaskCompleted),
}

impl Event {
    /// Creation timestamp, if the event carries one
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Event::MessageStored(e) => Some(e.created_at),
            Event::NetworkTaskCreated(e) => Some(e.created_at),
            Event::NetworkTaskProgressUpdated(_) => None,
            Event::NetworkTaskCompleted(e) => Some(e.created_at),
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Event::MessageStored(e) => Some(e.session_id),
            Event::NetworkTaskCreated(e) => Some(e.session_id),
            Event::NetworkTaskProgressUpdated(_) => None,
            Event::NetworkTaskCompleted(e) => Some(e.session_id),
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Event::MessageStored(_) => None,
            Event::NetworkTaskCreated(e) => Some(e.task_id),
            Event::NetworkTaskProgressUpdated(e) => Some(e.task_id),
            Event::NetworkTaskCompleted(e) => Some(e.task_id),
        }
    }

    /// Short name of the variant, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Event::MessageStored(_) => "message_stored",
            Event::NetworkTaskCreated(_) => "network_task_created",
            Event::NetworkTaskProgressUpdated(_) => "network_task_progress_updated",
            Event::NetworkTaskCompleted(_) => "network_task_completed",
        }
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Compact binary encoding for forwarding
    pub fn to_bytes(&self) -> Result<Vec<u8>, ModelError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ModelError> {
        postcard::from_bytes(bytes).map_err(|e| ModelError::Deserialization(e.to_string()))
    }
}

/// Payload of [`Event::MessageStored`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStored {
    pub created_at: DateTime<Utc>,
    pub label: String,
    pub level: Level,
    pub message: String,
    pub metadata: Option<BTreeMap<String, String>>,
    pub session_id: SessionId,
    pub file: String,
    pub function: String,
    pub line: u32,
}

impl MessageStored {
    pub fn new(
        session_id: SessionId,
        level: Level,
        label: impl Into<String>,
        message: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            created_at,
            label: label.into(),
            level,
            message: message.into(),
            metadata: None,
            session_id,
            file: String::new(),
            function: String::new(),
            line: 0,
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_location(mut self, file: impl Into<String>, function: impl Into<String>, line: u32) -> Self {
        self.file = file.into();
        self.function = function.into();
        self.line = line;
        self
    }
}

/// Payload of [`Event::NetworkTaskCreated`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTaskCreated {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub created_at: DateTime<Utc>,
    pub original_request: NetworkRequest,
    pub current_request: Option<NetworkRequest>,
    pub label: Option<String>,
    pub session_id: SessionId,
}

impl NetworkTaskCreated {
    pub fn new(
        session_id: SessionId,
        task_id: TaskId,
        task_type: TaskType,
        original_request: NetworkRequest,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            task_type,
            created_at,
            original_request,
            current_request: None,
            label: None,
            session_id,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// Payload of [`Event::NetworkTaskProgressUpdated`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTaskProgressUpdated {
    pub task_id: TaskId,
    pub url: Option<String>,
    pub completed_unit_count: i64,
    pub total_unit_count: i64,
}

/// Payload of [`Event::NetworkTaskCompleted`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkTaskCompleted {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub created_at: DateTime<Utc>,
    pub original_request: NetworkRequest,
    pub current_request: Option<NetworkRequest>,
    pub response: Option<NetworkResponse>,
    pub error: Option<NetworkError>,
    pub request_body: Option<Bytes>,
    pub response_body: Option<Bytes>,
    pub metrics: Option<NetworkMetrics>,
    pub label: Option<String>,
    pub session_id: SessionId,
}

impl NetworkTaskCompleted {
    pub fn new(
        session_id: SessionId,
        task_id: TaskId,
        task_type: TaskType,
        original_request: NetworkRequest,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            task_type,
            created_at,
            original_request,
            current_request: None,
            response: None,
            error: None,
            request_body: None,
            response_body: None,
            metrics: None,
            label: None,
            session_id,
        }
    }

    pub fn with_response(mut self, response: NetworkResponse) -> Self {
        self.response = Some(response);
        self
    }

    pub fn with_error(mut self, error: NetworkError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_request_body(mut self, body: impl Into<Bytes>) -> Self {
        self.request_body = Some(body.into());
        self
    }

    pub fn with_response_body(mut self, body: impl Into<Bytes>) -> Self {
        self.response_body = Some(body.into());
        self
    }

    pub fn with_metrics(mut self, metrics: NetworkMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Whether this completion marks the task as failed
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.response.as_ref().is_some_and(|r| !r.is_success())
    }

    /// The request as last sent, falling back to the original
    pub fn effective_request(&self) -> &NetworkRequest {
        self.current_request.as_ref().unwrap_or(&self.original_request)
    }
}
