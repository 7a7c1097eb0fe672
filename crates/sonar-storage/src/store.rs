//! The public store handle
//!
//! [`EventStore`] ties the pieces together: it resolves the on-disk
//! document, starts the writer thread and exposes ingestion, queries and
//! maintenance. Handles are cheap to clone; the writer stops when the
//! store is closed or the last handle is dropped.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use sonar_core::{
    Event, Level, MessageStored, NetworkError, NetworkMetrics, NetworkRequest, NetworkResponse,
    NetworkTaskCompleted, SessionId, TaskId, TaskType,
};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::archive::{
    Document, DocumentKind, ExportOptions, Manifest, StoreInfo, directory_size,
};
use crate::blobs::{BlobHandle, BlobStore, BlobStoreConfig, ContentKey};
use crate::config::{OpenOptions, StoreConfig};
use crate::error::StoreError;
use crate::structured::{
    MessageId, MessageRecord, Query, RecordStore, SessionRecord, TaskRecord, TransactionRecord,
};
use crate::sweep::SweepReport;
use crate::worker::{Ack, Command, CommandSender, Mutation, Shared, Worker, on_writer_thread};

/// Capacity of the live event channel
const SUBSCRIBER_CAPACITY: usize = 1024;

/// A log message submitted through [`EventStore::store_message`]
#[derive(Debug, Clone)]
pub struct StoreMessage {
    pub label: String,
    pub level: Level,
    pub message: String,
    pub metadata: Option<BTreeMap<String, String>>,
    pub file: String,
    pub function: String,
    pub line: u32,
}

impl StoreMessage {
    pub fn new(level: Level, label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            level,
            message: message.into(),
            metadata: None,
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

/// A finished network request submitted through [`EventStore::store_request`]
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub task_type: TaskType,
    pub request: NetworkRequest,
    pub response: Option<NetworkResponse>,
    pub error: Option<NetworkError>,
    pub request_body: Option<Bytes>,
    pub response_body: Option<Bytes>,
    pub metrics: Option<NetworkMetrics>,
    pub label: Option<String>,
}

impl StoreRequest {
    pub fn new(request: NetworkRequest) -> Self {
        Self {
            task_type: TaskType::Data,
            request,
            response: None,
            error: None,
            request_body: None,
            response_body: None,
            metrics: None,
            label: None,
        }
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
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
}

struct StoreInner {
    shared: Arc<Shared>,
    tx: CommandSender,
    events: broadcast::Sender<Event>,
    closed: AtomicBool,
    options: OpenOptions,
    /// The session opened together with this store
    session: SessionRecord,
    /// Package directory or archive file the store was opened from
    path: Option<PathBuf>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// An embedded store of log messages and network tasks
///
/// All mutations are serialized through a single writer thread. Reads run
/// against the last flushed state and never wait for the writer.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("path", &self.inner.path)
            .field("session", &self.inner.session.id)
            .field("readonly", &self.inner.shared.readonly)
            .finish()
    }
}

impl EventStore {
    /// Open the package or archive at `path`
    #[instrument(skip(path, options, config), fields(path = %path.as_ref().display(), options = ?options))]
    pub async fn open(
        path: impl AsRef<Path>,
        options: OpenOptions,
        config: StoreConfig,
    ) -> Result<Self, StoreError> {
        if options.contains(OpenOptions::IN_MEMORY) {
            return Self::start_in_memory(options, config).await;
        }

        let path = path.as_ref();
        let document = Document::prepare(path, options, config.clock.now_utc()).await?;
        let readonly = document.kind == DocumentKind::Archive || options.contains(OpenOptions::READONLY);

        let records = RecordStore::open(&document.layout.records_path())?;
        let blobs = BlobStore::new(BlobStoreConfig::from_store_config(
            &config,
            Some(document.layout.blobs_dir()),
        ))
        .await?;

        let shared = Shared {
            records,
            blobs,
            config,
            layout: Some(document.layout),
            kind: Some(document.kind),
            manifest: RwLock::new(document.manifest),
            archive_info: document.info,
            readonly,
            extracted: document.extracted,
        };
        let store = Self::start(shared, options, Some(document.path))?;
        info!(
            store_id = %store.store_id(),
            kind = ?document.kind,
            readonly,
            session = %store.session_id(),
            "Opened store"
        );
        Ok(store)
    }

    /// A store that keeps everything in memory
    pub async fn in_memory(config: StoreConfig) -> Result<Self, StoreError> {
        Self::start_in_memory(OpenOptions::IN_MEMORY, config).await
    }

    async fn start_in_memory(options: OpenOptions, config: StoreConfig) -> Result<Self, StoreError> {
        let records = RecordStore::in_memory()?;
        let blobs = BlobStore::new(BlobStoreConfig::from_store_config(&config, None)).await?;
        let manifest = Manifest::new(config.clock.now_utc());
        let shared = Shared {
            records,
            blobs,
            config,
            layout: None,
            kind: None,
            manifest: RwLock::new(manifest),
            archive_info: None,
            readonly: options.contains(OpenOptions::READONLY),
            extracted: None,
        };
        Self::start(shared, options, None)
    }

    fn start(shared: Shared, options: OpenOptions, path: Option<PathBuf>) -> Result<Self, StoreError> {
        let app = shared.config.metadata.app_info();
        let session = SessionRecord::new(SessionId::generate(), shared.config.clock.now_utc())
            .with_version(app.version, app.build);

        let shared = Arc::new(shared);
        let (tx, rx) = mpsc::unbounded_channel();
        let sweep = options.contains(OpenOptions::SWEEP) && !shared.readonly;
        let handle = Worker::spawn(Arc::clone(&shared), rx, sweep)?;

        if !shared.readonly {
            let mutation = Mutation::CreateSession(session.clone());
            if tx.send(Command::Mutate { mutation, ack: Ack::None }).is_err() {
                warn!("Writer stopped before the session was recorded");
            }
        }

        let (events, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Ok(Self {
            inner: Arc::new(StoreInner {
                shared,
                tx,
                events,
                closed: AtomicBool::new(false),
                options,
                session,
                path,
                worker: Mutex::new(Some(handle)),
            }),
        })
    }

    // ========================================================================
    // Ingestion
    // ========================================================================

    /// Feed one event into the store
    ///
    /// The event is redacted and offered to the event filter first. In
    /// synchronous mode the call returns once the event is on disk;
    /// otherwise it returns immediately. Failures are logged, never
    /// returned. Events handed to a closed store are dropped.
    pub fn handle(&self, event: Event) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return;
        }

        let config = &inner.shared.config;
        let event = if config.redaction.is_empty() {
            event
        } else {
            config.redaction.apply(event)
        };
        let event = match &config.event_filter {
            Some(filter) => match filter.apply(event) {
                Some(event) => event,
                None => {
                    debug!("Event rejected by filter");
                    return;
                }
            },
            None => event,
        };

        let subscribed = inner.events.receiver_count() > 0;
        let published = subscribed.then(|| event.clone());

        if !inner.shared.readonly {
            let mutation = Mutation::Event(event);
            if inner.options.contains(OpenOptions::SYNCHRONOUS) && !on_writer_thread() {
                let (done_tx, done_rx) = std::sync::mpsc::sync_channel(1);
                if self.send(mutation, Ack::Blocking(done_tx)) {
                    let _ = done_rx.recv();
                }
            } else {
                self.send(mutation, Ack::None);
            }
        }

        if let Some(event) = published {
            let _ = inner.events.send(event);
        }
    }

    /// Record a log message in the current session
    pub fn store_message(&self, message: StoreMessage) {
        let mut event = MessageStored::new(
            self.session_id(),
            message.level,
            message.label,
            message.message,
            self.now(),
        )
        .with_location(message.file, message.function, message.line);
        event.metadata = message.metadata;
        self.handle(Event::MessageStored(event));
    }

    /// Record a completed network request in the current session
    pub fn store_request(&self, request: StoreRequest) {
        let mut event = NetworkTaskCompleted::new(
            self.session_id(),
            TaskId::generate(),
            request.task_type,
            request.request,
            self.now(),
        );
        event.response = request.response;
        event.error = request.error;
        event.request_body = request.request_body;
        event.response_body = request.response_body;
        event.metrics = request.metrics;
        event.label = request.label;
        self.handle(Event::NetworkTaskCompleted(event));
    }

    /// Receive every accepted event, after redaction
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn messages(&self, query: &Query<MessageRecord>) -> Result<Vec<MessageRecord>, StoreError> {
        self.records().query(query)
    }

    pub fn message(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError> {
        self.records().message(id)
    }

    pub fn tasks(&self, query: &Query<TaskRecord>) -> Result<Vec<TaskRecord>, StoreError> {
        self.records().query(query)
    }

    pub fn task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.records().task(id)
    }

    pub fn sessions(&self, query: &Query<SessionRecord>) -> Result<Vec<SessionRecord>, StoreError> {
        self.records().query(query)
    }

    /// Transactions of a task, in the order they happened
    pub fn transactions(&self, task_id: &TaskId) -> Result<Vec<TransactionRecord>, StoreError> {
        self.records().transactions(task_id)
    }

    pub fn blob(&self, key: &ContentKey) -> Result<Option<BlobHandle>, StoreError> {
        self.inner.shared.blobs.handle(self.records(), key)
    }

    /// Decompressed, verified contents of a blob
    pub async fn blob_data(&self, key: &ContentKey) -> Result<Option<Bytes>, StoreError> {
        let shared = &self.inner.shared;
        match shared.blobs.handle(&shared.records, key)? {
            Some(handle) => Ok(Some(shared.blobs.read(&shared.records, &handle).await?)),
            None => Ok(None),
        }
    }

    /// Counts, sizes and provenance of the store
    pub async fn info(&self) -> Result<StoreInfo, StoreError> {
        let shared = &self.inner.shared;
        if let Some(info) = &shared.archive_info {
            return Ok(info.clone());
        }

        let sizes = shared.records.sizes()?;
        let manifest = shared.manifest.read().clone();
        let now = self.now();
        let (total_store_size, modified_date) = match &shared.layout {
            Some(layout) => {
                let modified = tokio::fs::metadata(layout.records_path())
                    .await
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or(now);
                (directory_size(layout.root()).await?, modified)
            }
            None => (sizes.records_size + sizes.blobs_size, now),
        };

        Ok(StoreInfo {
            store_id: manifest.store_id,
            store_version: manifest.version,
            creation_date: manifest.created_date,
            modified_date,
            archived_date: None,
            message_count: sizes.message_count.saturating_sub(sizes.task_count),
            task_count: sizes.task_count,
            blob_count: sizes.blob_count,
            total_store_size,
            blobs_size: sizes.blobs_size,
            blobs_decompressed_size: sizes.blobs_decompressed_size,
            app_info: shared.config.metadata.app_info(),
            device_info: shared.config.metadata.device_info(),
        })
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Write buffered changes to disk now
    pub async fn flush(&self) -> Result<(), StoreError> {
        let (reply, rx) = oneshot::channel();
        if !self.command(Command::Flush(reply)) {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Run the sweep now instead of waiting for the schedule
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        self.ensure_writable()?;
        let (reply, rx) = oneshot::channel();
        if !self.command(Command::Sweep(reply)) {
            return Ok(SweepReport::default());
        }
        rx.await.unwrap_or_else(|_| Ok(SweepReport::default()))
    }

    pub async fn set_pinned(&self, id: MessageId, pinned: bool) -> Result<(), StoreError> {
        self.mutate(Mutation::SetPinned { id, pinned: Some(pinned) }).await
    }

    pub async fn toggle_pin(&self, id: MessageId) -> Result<(), StoreError> {
        self.mutate(Mutation::SetPinned { id, pinned: None }).await
    }

    pub async fn remove_all_pins(&self) -> Result<(), StoreError> {
        self.mutate(Mutation::RemoveAllPins).await
    }

    /// Delete sessions with their messages, tasks and blobs
    pub async fn remove_sessions(&self, ids: impl IntoIterator<Item = SessionId>) -> Result<(), StoreError> {
        self.mutate(Mutation::RemoveSessions(ids.into_iter().collect())).await
    }

    /// Delete every record and blob; the current session is kept
    pub async fn remove_all(&self) -> Result<(), StoreError> {
        let current = self.inner.session.clone();
        self.mutate(Mutation::RemoveAll { current }).await
    }

    /// Write a filtered snapshot to `target`
    pub async fn export(
        &self,
        target: impl AsRef<Path>,
        options: ExportOptions,
    ) -> Result<StoreInfo, StoreError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Export {
            target: target.as_ref().to_path_buf(),
            options,
            reply,
        };
        if !self.command(command) {
            return Err(StoreError::Closed);
        }
        rx.await.unwrap_or(Err(StoreError::Closed))
    }

    /// Flush and stop the writer
    ///
    /// Later mutations are ignored. Safe to call more than once.
    #[instrument(skip(self), fields(session = %self.session_id()))]
    pub async fn close(&self) -> Result<(), StoreError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let (done, rx) = oneshot::channel();
        if self.inner.tx.send(Command::Close(done)).is_ok() {
            let _ = rx.await;
        }

        let handle = self.inner.worker.lock().take();
        if let Some(handle) = handle {
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| StoreError::Unknown(format!("failed to join writer: {e}")))?
                .map_err(|_| StoreError::Unknown("writer thread panicked".to_string()))?;
        }
        info!("Closed store");
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Session opened together with this store
    pub fn session_id(&self) -> SessionId {
        self.inner.session.id
    }

    pub fn store_id(&self) -> Uuid {
        self.inner.shared.manifest.read().store_id
    }

    pub fn is_readonly(&self) -> bool {
        self.inner.shared.readonly
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether the store is a package or an archive; `None` in memory
    pub fn kind(&self) -> Option<DocumentKind> {
        self.inner.shared.kind
    }

    /// Path the store was opened from; `None` in memory
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.shared.config
    }

    /// Manifest as last written
    pub fn manifest(&self) -> Manifest {
        self.inner.shared.manifest.read().clone()
    }

    fn records(&self) -> &RecordStore {
        &self.inner.shared.records
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.shared.config.clock.now_utc()
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.inner.shared.readonly {
            return Err(StoreError::DocumentReadonly);
        }
        Ok(())
    }

    /// Queue a command; `false` once the store is closed
    fn command(&self, command: Command) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        self.inner.tx.send(command).is_ok()
    }

    fn send(&self, mutation: Mutation, ack: Ack) -> bool {
        self.command(Command::Mutate { mutation, ack })
    }

    /// Apply a mutation and wait until it is on disk
    async fn mutate(&self, mutation: Mutation) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let (reply, rx) = oneshot::channel();
        if !self.send(mutation, Ack::Reply(reply)) {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}
