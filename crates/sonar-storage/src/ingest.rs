//! Event ingestion
//!
//! Translates each accepted [`Event`] into record and blob mutations on
//! the writer's open batch. Redaction and the veto hook have already run
//! by the time an event gets here.

use sonar_core::{
    ContentType, Event, FetchType, Level, MessageStored, NetworkTaskCompleted, NetworkTaskCreated,
    NetworkTaskProgressUpdated, TaskState, TaskType, TransactionMetrics,
};
use tracing::{debug, instrument};

use crate::blobs::{BlobStore, image_dimensions};
use crate::error::StoreError;
use crate::structured::{
    MISSING_URL, MessageRecord, NewTask, RecordWriter, TaskProgress, TransactionRecord,
};

/// Metadata key for the pixel width of an image response
pub const RESPONSE_PIXEL_WIDTH: &str = "ResponsePixelWidth";
/// Metadata key for the pixel height of an image response
pub const RESPONSE_PIXEL_HEIGHT: &str = "ResponsePixelHeight";

/// HTTP status of a conditional request answered from cache
const NOT_MODIFIED: u16 = 304;

/// Applies events to the store
#[derive(Debug, Clone)]
pub struct Ingestor {
    blobs: BlobStore,
}

impl Ingestor {
    pub fn new(blobs: BlobStore) -> Self {
        Self { blobs }
    }

    /// Apply one event to the open batch
    pub async fn apply(&self, writer: &mut RecordWriter, event: &Event) -> Result<(), StoreError> {
        match event {
            Event::MessageStored(event) => self.apply_message(writer, event),
            Event::NetworkTaskCreated(event) => self.apply_created(writer, event),
            Event::NetworkTaskProgressUpdated(event) => self.apply_progress(writer, event),
            Event::NetworkTaskCompleted(event) => self.apply_completed(writer, event).await,
        }
    }

    fn apply_message(&self, writer: &mut RecordWriter, event: &MessageStored) -> Result<(), StoreError> {
        writer.ensure_session(event.session_id, event.created_at)?;

        let mut message = MessageRecord::new(
            event.session_id,
            event.level,
            event.label.clone(),
            event.message.clone(),
            event.created_at,
        );
        message.file = event.file.clone();
        message.function = event.function.clone();
        message.line = event.line;
        message.metadata = event.metadata.clone().filter(|m| !m.is_empty());

        writer.upsert_message(message)?;
        Ok(())
    }

    fn apply_created(&self, writer: &mut RecordWriter, event: &NetworkTaskCreated) -> Result<(), StoreError> {
        writer.ensure_session(event.session_id, event.created_at)?;

        let (task, _) = writer.find_or_create_task(NewTask {
            task_id: event.task_id,
            session_id: event.session_id,
            task_type: event.task_type,
            created_at: event.created_at,
            label: event.label.clone(),
            request: event.original_request.clone(),
        })?;

        if task.state == TaskState::Pending && event.current_request.is_some() {
            let current = event.current_request.clone();
            writer.update_task(&event.task_id, |task| task.current_request = current)?;
        }
        Ok(())
    }

    fn apply_progress(
        &self,
        writer: &mut RecordWriter,
        event: &NetworkTaskProgressUpdated,
    ) -> Result<(), StoreError> {
        writer.update_task(&event.task_id, |task| {
            if task.state != TaskState::Pending {
                return;
            }
            task.progress = Some(TaskProgress {
                completed_unit_count: event.completed_unit_count,
                total_unit_count: event.total_unit_count,
            });
            if task.url.is_none() {
                task.url = event.url.clone();
            }
        })?;
        Ok(())
    }

    #[instrument(skip(self, writer, event), fields(task = %event.task_id.short()))]
    async fn apply_completed(
        &self,
        writer: &mut RecordWriter,
        event: &NetworkTaskCompleted,
    ) -> Result<(), StoreError> {
        writer.ensure_session(event.session_id, event.created_at)?;

        let (task, _) = writer.find_or_create_task(NewTask {
            task_id: event.task_id,
            session_id: event.session_id,
            task_type: event.task_type,
            created_at: event.created_at,
            label: event.label.clone(),
            request: event.original_request.clone(),
        })?;

        // A settled task only accepts replays with the same outcome
        let failed = event.is_failure();
        if task.state != TaskState::Pending && (task.state == TaskState::Failure) != failed {
            debug!(state = ?task.state, "Ignoring completion that contradicts the settled task");
            return Ok(());
        }

        // Release the previous bodies before linking new ones
        for key in task.blob_refs() {
            self.blobs.unlink(writer, &key)?;
        }

        let request_content_type = event.original_request.header("Content-Type").map(str::to_string);
        let response_content_type = event
            .response
            .as_ref()
            .and_then(|r| r.header("Content-Type"))
            .map(str::to_string);

        let request_blob = match &event.request_body {
            Some(body) => {
                self.blobs
                    .store(writer, body, request_content_type.as_deref(), event.created_at)
                    .await
            }
            None => None,
        };
        let response_blob = match &event.response_body {
            Some(body) => {
                self.blobs
                    .store(writer, body, response_content_type.as_deref(), event.created_at)
                    .await
            }
            None => None,
        };

        let response_is_image = response_content_type
            .as_deref()
            .is_some_and(|ct| ContentType::parse(ct).is_image());
        let pixel_size = if response_is_image {
            response_blob
                .as_ref()
                .and_then(|b| b.original_dimensions)
                .or_else(|| event.response_body.as_deref().and_then(image_dimensions))
        } else {
            None
        };

        let transactions = event
            .metrics
            .as_ref()
            .map(|m| m.transactions.as_slice())
            .unwrap_or_default();
        if task.transaction_count == 0 {
            for (index, metrics) in transactions.iter().enumerate() {
                writer.put_transaction(&TransactionRecord {
                    task_id: event.task_id,
                    index: index as u32,
                    metrics: metrics.clone(),
                })?;
            }
        }

        let url = event.original_request.url.clone();

        writer.update_task(&event.task_id, |task| {
            if task.state == TaskState::Pending {
                task.state = if failed { TaskState::Failure } else { TaskState::Success };
            }

            task.url = url.clone();
            task.host = event.original_request.host();
            task.http_method = event.original_request.http_method.clone();
            task.status_code = event.response.as_ref().and_then(|r| r.status_code);
            task.error_code = event.error.as_ref().map(|e| e.code);
            task.error_domain = event.error.as_ref().map(|e| e.domain.clone());
            task.response_content_type = response_content_type.clone();

            task.current_request = event.current_request.clone();
            task.response = event.response.clone();
            task.error = event.error.clone();

            task.request_body = request_blob.as_ref().map(|b| b.handle.key);
            task.response_body = response_blob.as_ref().map(|b| b.handle.key);
            let (request_size, response_size) = body_sizes(event, task.progress, transactions);
            if let Some(size) = request_size {
                task.request_body_size = size;
            }
            if let Some(size) = response_size {
                task.response_body_size = size;
            }

            if let Some(metrics) = &event.metrics {
                task.start_date_millis = Some(metrics.task_interval.start.timestamp_millis());
                task.duration = Some(metrics.task_interval.duration);
                task.redirect_count = metrics.redirect_count;
            }
            if task.transaction_count == 0 {
                task.transaction_count = transactions.len() as u32;
            }
            task.is_from_cache = is_from_cache(transactions);

            if let Some((width, height)) = pixel_size {
                task.metadata.insert(RESPONSE_PIXEL_WIDTH.to_string(), width.to_string());
                task.metadata.insert(RESPONSE_PIXEL_HEIGHT.to_string(), height.to_string());
            }

            task.progress = None;
        })?;

        writer.update_message(task.message_id, |message| {
            message.text = url.clone().unwrap_or_else(|| MISSING_URL.to_string());
            if failed {
                message.level = Level::Error;
            }
        })?;

        debug!(failed, "Completed task");
        Ok(())
    }
}

/// Last transaction that went to the network
fn last_network_load(transactions: &[TransactionMetrics]) -> Option<&TransactionMetrics> {
    transactions
        .iter()
        .rev()
        .find(|t| t.fetch_type == FetchType::NetworkLoad)
}

/// Request and response body sizes, `None` where the task type leaves the
/// stored value alone
fn body_sizes(
    event: &NetworkTaskCompleted,
    progress: Option<TaskProgress>,
    transactions: &[TransactionMetrics],
) -> (Option<i64>, Option<i64>) {
    let length = |body: &Option<bytes::Bytes>| body.as_ref().map(|b| b.len() as i64);
    match event.task_type {
        TaskType::Data => (
            Some(length(&event.request_body).unwrap_or(0)),
            Some(length(&event.response_body).unwrap_or(0)),
        ),
        TaskType::Download => {
            let received = last_network_load(transactions)
                .map(|t| t.transfer_size.response_body_bytes_received)
                .or(progress.map(|p| p.completed_unit_count))
                .unwrap_or(-1);
            (None, Some(received))
        }
        TaskType::Upload => {
            let sent = last_network_load(transactions)
                .map(|t| t.transfer_size.request_body_bytes_sent)
                .or(length(&event.request_body))
                .unwrap_or(-1);
            (Some(sent), None)
        }
        TaskType::Stream | TaskType::WebSocket => (None, None),
    }
}

fn is_from_cache(transactions: &[TransactionMetrics]) -> bool {
    match transactions.last() {
        Some(last) => match last.fetch_type {
            FetchType::LocalCache => true,
            FetchType::NetworkLoad => last
                .response
                .as_ref()
                .is_some_and(|r| r.status_code == Some(NOT_MODIFIED)),
            _ => false,
        },
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use sonar_core::{
        DateInterval, NetworkError, NetworkMetrics, NetworkRequest, NetworkResponse, SessionId,
        TaskId, TransferSize,
    };

    use super::*;
    use crate::blobs::BlobStoreConfig;
    use crate::structured::RecordStore;

    async fn fixture() -> (RecordStore, Ingestor) {
        let records = RecordStore::in_memory().unwrap();
        let blobs = BlobStore::new(BlobStoreConfig::default()).await.unwrap();
        (records, Ingestor::new(blobs))
    }

    async fn apply_all(records: &RecordStore, ingestor: &Ingestor, events: &[Event]) {
        let mut writer = records.begin_write().unwrap();
        for event in events {
            ingestor.apply(&mut writer, event).await.unwrap();
        }
        writer.commit().unwrap();
    }

    fn created(session: SessionId, task: TaskId) -> Event {
        Event::NetworkTaskCreated(NetworkTaskCreated::new(
            session,
            task,
            TaskType::Data,
            NetworkRequest::new("https://example.com/user"),
            Utc::now(),
        ))
    }

    fn completed(session: SessionId, task: TaskId, status: u16) -> NetworkTaskCompleted {
        NetworkTaskCompleted::new(
            session,
            task,
            TaskType::Data,
            NetworkRequest::new("https://example.com/user"),
            Utc::now(),
        )
        .with_response(NetworkResponse::new(status))
    }

    #[tokio::test]
    async fn test_message_stored() {
        let (records, ingestor) = fixture().await;
        let session = SessionId::generate();
        let event = MessageStored::new(session, Level::Info, "app", "hi", Utc::now())
            .with_location("main.rs", "main", 12);
        apply_all(&records, &ingestor, &[Event::MessageStored(event)]).await;

        let sizes = records.sizes().unwrap();
        assert_eq!(sizes.message_count, 1);
        assert_eq!(sizes.session_count, 1);
        let message = records.message(crate::structured::MessageId(1)).unwrap().unwrap();
        assert_eq!(message.text, "hi");
        assert_eq!(message.line, 12);
    }

    #[tokio::test]
    async fn test_created_then_completed() {
        let (records, ingestor) = fixture().await;
        let session = SessionId::generate();
        let task = TaskId::generate();
        apply_all(
            &records,
            &ingestor,
            &[
                created(session, task),
                created(session, task),
                Event::NetworkTaskCompleted(completed(session, task, 200)),
            ],
        )
        .await;

        assert_eq!(records.sizes().unwrap().task_count, 1);
        let record = records.task(&task).unwrap().unwrap();
        assert_eq!(record.state, TaskState::Success);
        assert_eq!(record.status_code, Some(200));
        assert_eq!(record.request_body_size, 0);
    }

    #[tokio::test]
    async fn test_failure_is_terminal() {
        let (records, ingestor) = fixture().await;
        let session = SessionId::generate();
        let task = TaskId::generate();
        apply_all(
            &records,
            &ingestor,
            &[
                Event::NetworkTaskCompleted(completed(session, task, 500)),
                Event::NetworkTaskCompleted(completed(session, task, 200)),
            ],
        )
        .await;

        let record = records.task(&task).unwrap().unwrap();
        assert_eq!(record.state, TaskState::Failure);
        let message = records.message(record.message_id).unwrap().unwrap();
        assert_eq!(message.level, Level::Error);
        assert_eq!(message.text, "https://example.com/user");
    }

    #[tokio::test]
    async fn test_contradicting_completion_is_ignored() {
        let (records, ingestor) = fixture().await;
        let session = SessionId::generate();
        let task = TaskId::generate();
        apply_all(
            &records,
            &ingestor,
            &[
                created(session, task),
                Event::NetworkTaskCompleted(completed(session, task, 200)),
                Event::NetworkTaskCompleted(
                    completed(session, task, 500).with_response_body(&b"oops"[..]),
                ),
            ],
        )
        .await;

        let record = records.task(&task).unwrap().unwrap();
        assert_eq!(record.state, TaskState::Success);
        assert_eq!(record.status_code, Some(200));
        assert!(record.response_body.is_none());
        assert!(records.blob_handles().unwrap().is_empty());
        let message = records.message(record.message_id).unwrap().unwrap();
        assert_eq!(message.level, Level::Debug);
    }

    #[tokio::test]
    async fn test_error_without_response_fails() {
        let (records, ingestor) = fixture().await;
        let session = SessionId::generate();
        let task = TaskId::generate();
        let event = NetworkTaskCompleted::new(
            session,
            task,
            TaskType::Data,
            NetworkRequest::new("https://example.com"),
            Utc::now(),
        )
        .with_error(NetworkError::new(-1001, "NSURLErrorDomain", "timed out"));
        apply_all(&records, &ingestor, &[Event::NetworkTaskCompleted(event)]).await;

        let record = records.task(&task).unwrap().unwrap();
        assert_eq!(record.state, TaskState::Failure);
        assert_eq!(record.error_code, Some(-1001));
    }

    #[tokio::test]
    async fn test_progress_only_while_pending() {
        let (records, ingestor) = fixture().await;
        let session = SessionId::generate();
        let task = TaskId::generate();
        let progress = |done| {
            Event::NetworkTaskProgressUpdated(NetworkTaskProgressUpdated {
                task_id: task,
                url: None,
                completed_unit_count: done,
                total_unit_count: 100,
            })
        };

        apply_all(&records, &ingestor, &[created(session, task), progress(40)]).await;
        let record = records.task(&task).unwrap().unwrap();
        assert_eq!(record.progress.unwrap().completed_unit_count, 40);

        apply_all(
            &records,
            &ingestor,
            &[Event::NetworkTaskCompleted(completed(session, task, 200)), progress(90)],
        )
        .await;
        let record = records.task(&task).unwrap().unwrap();
        assert!(record.progress.is_none());
    }

    #[tokio::test]
    async fn test_progress_for_unknown_task_is_ignored() {
        let (records, ingestor) = fixture().await;
        apply_all(
            &records,
            &ingestor,
            &[Event::NetworkTaskProgressUpdated(NetworkTaskProgressUpdated {
                task_id: TaskId::generate(),
                url: Some("https://example.com".into()),
                completed_unit_count: 1,
                total_unit_count: 2,
            })],
        )
        .await;
        assert_eq!(records.sizes().unwrap().task_count, 0);
    }

    #[tokio::test]
    async fn test_bodies_dedup_across_tasks() {
        let (records, ingestor) = fixture().await;
        let session = SessionId::generate();
        let body = vec![7u8; 2048];
        let events: Vec<Event> = (0..2)
            .map(|_| {
                Event::NetworkTaskCompleted(
                    completed(session, TaskId::generate(), 200).with_response_body(body.clone()),
                )
            })
            .collect();
        apply_all(&records, &ingestor, &events).await;

        let handles = records.blob_handles().unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].ref_count, 2);
    }

    #[tokio::test]
    async fn test_replayed_completion_replaces_bodies() {
        let (records, ingestor) = fixture().await;
        let session = SessionId::generate();
        let task = TaskId::generate();
        apply_all(
            &records,
            &ingestor,
            &[
                Event::NetworkTaskCompleted(completed(session, task, 200).with_response_body(&b"first"[..])),
                Event::NetworkTaskCompleted(completed(session, task, 200).with_response_body(&b"second"[..])),
            ],
        )
        .await;

        let handles = records.blob_handles().unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].ref_count, 1);
        assert_eq!(records.task(&task).unwrap().unwrap().response_body_size, 6);
    }

    #[tokio::test]
    async fn test_download_size_and_cache_flag() {
        let (records, ingestor) = fixture().await;
        let session = SessionId::generate();
        let task = TaskId::generate();
        let request = NetworkRequest::new("https://example.com/file.zip");
        let transaction = TransactionMetrics::new(FetchType::NetworkLoad, request.clone())
            .with_response(NetworkResponse::new(304))
            .with_transfer_size(TransferSize {
                response_body_bytes_received: 4096,
                ..Default::default()
            });
        let event = NetworkTaskCompleted::new(session, task, TaskType::Download, request, Utc::now())
            .with_response(NetworkResponse::new(304))
            .with_metrics(NetworkMetrics {
                task_interval: DateInterval::new(Utc::now() - Duration::seconds(2), 2.0),
                redirect_count: 1,
                transactions: vec![transaction],
            });
        apply_all(&records, &ingestor, &[Event::NetworkTaskCompleted(event)]).await;

        let record = records.task(&task).unwrap().unwrap();
        assert_eq!(record.response_body_size, 4096);
        assert_eq!(record.request_body_size, -1);
        assert!(record.is_from_cache);
        assert_eq!(record.redirect_count, 1);
        assert_eq!(record.transaction_count, 1);
        assert_eq!(records.transactions(&task).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_image_response_records_pixel_size() {
        let (records, ingestor) = fixture().await;
        let session = SessionId::generate();
        let task = TaskId::generate();
        let png = crate::blobs::noisy_png(640, 480);
        let event = NetworkTaskCompleted::new(
            session,
            task,
            TaskType::Data,
            NetworkRequest::new("https://example.com/cat.png"),
            Utc::now(),
        )
        .with_response(NetworkResponse::new(200).with_header("Content-Type", "image/png"))
        .with_response_body(png.clone());
        apply_all(&records, &ingestor, &[Event::NetworkTaskCompleted(event)]).await;

        let record = records.task(&task).unwrap().unwrap();
        assert_eq!(record.metadata.get(RESPONSE_PIXEL_WIDTH).map(String::as_str), Some("640"));
        assert_eq!(record.metadata.get(RESPONSE_PIXEL_HEIGHT).map(String::as_str), Some("480"));
        assert_eq!(record.response_body_size, png.len() as i64);
    }
}
