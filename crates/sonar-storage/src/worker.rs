//! The single writer
//!
//! Every mutation of a store runs on one dedicated thread. Mutations are
//! applied to an open write transaction and committed when the save
//! interval elapses, so bursts of events share one disk write. Sweeps and
//! exports are queued on the same channel and therefore never interleave
//! with ingestion.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::RwLock;
use sonar_core::{Event, SessionId};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant, sleep_until};
use tracing::{debug, error, info, instrument, warn};

use crate::archive::{self, DocumentKind, ExportOptions, ExportSource, Manifest, StoreInfo, StoreLayout};
use crate::blobs::{BlobStore, remove_file_if_exists};
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::ingest::Ingestor;
use crate::structured::{MessageId, RecordStore, RecordWriter, SessionRecord};
use crate::sweep::{SweepConfig, SweepReport, Sweeper};

/// Name of the writer thread
pub(crate) const WRITER_THREAD_NAME: &str = "sonar-writer";

/// Far enough away to never fire
const IDLE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// State shared by the store handle and the writer
pub(crate) struct Shared {
    pub records: RecordStore,
    pub blobs: BlobStore,
    pub config: StoreConfig,
    /// `None` for in-memory stores
    pub layout: Option<StoreLayout>,
    pub kind: Option<DocumentKind>,
    pub manifest: RwLock<Manifest>,
    /// Summary embedded in an opened archive
    pub archive_info: Option<StoreInfo>,
    pub readonly: bool,
    /// Extracted archive contents; declared last so the database closes first
    pub extracted: Option<tempfile::TempDir>,
}

/// A change to the store's contents
#[derive(Debug)]
pub(crate) enum Mutation {
    Event(Event),
    CreateSession(SessionRecord),
    /// `None` toggles
    SetPinned { id: MessageId, pinned: Option<bool> },
    RemoveAllPins,
    RemoveSessions(Vec<SessionId>),
    /// Delete everything, then recreate the current session
    RemoveAll { current: SessionRecord },
}

/// How the submitter learns that a mutation is on disk
#[derive(Debug)]
pub(crate) enum Ack {
    /// Fire and forget, flushed by the debounce timer
    None,
    /// Flush now and wake a blocked synchronous caller
    Blocking(std::sync::mpsc::SyncSender<()>),
    /// Flush now and report the outcome
    Reply(oneshot::Sender<Result<(), StoreError>>),
}

#[derive(Debug)]
pub(crate) enum Command {
    Mutate { mutation: Mutation, ack: Ack },
    Flush(oneshot::Sender<Result<(), StoreError>>),
    Sweep(oneshot::Sender<Result<SweepReport, StoreError>>),
    Export {
        target: PathBuf,
        options: ExportOptions,
        reply: oneshot::Sender<Result<StoreInfo, StoreError>>,
    },
    Close(oneshot::Sender<()>),
}

/// Sending half of the writer's queue
pub(crate) type CommandSender = UnboundedSender<Command>;

/// Whether the calling code runs on a store writer thread
pub(crate) fn on_writer_thread() -> bool {
    std::thread::current().name() == Some(WRITER_THREAD_NAME)
}

pub(crate) struct Worker {
    shared: Arc<Shared>,
    ingestor: Ingestor,
    sweeper: Sweeper,
    rx: UnboundedReceiver<Command>,
    pending: Option<RecordWriter>,
    flush_at: Option<Instant>,
    sweep_at: Option<Instant>,
}

impl Worker {
    fn new(shared: Arc<Shared>, rx: UnboundedReceiver<Command>, sweep: bool) -> Self {
        let ingestor = Ingestor::new(shared.blobs.clone());
        let sweeper = Sweeper::new(
            SweepConfig::from_store_config(&shared.config),
            shared.blobs.clone(),
        );
        let sweep_at = sweep.then(|| Instant::now() + shared.config.initial_sweep_delay);
        Self {
            shared,
            ingestor,
            sweeper,
            rx,
            pending: None,
            flush_at: None,
            sweep_at,
        }
    }

    /// Start the writer thread with its own single-threaded runtime
    ///
    /// The worker is built on the thread itself, so the open write
    /// transaction never crosses threads.
    pub fn spawn(
        shared: Arc<Shared>,
        rx: UnboundedReceiver<Command>,
        sweep: bool,
    ) -> Result<JoinHandle<()>, StoreError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let handle = std::thread::Builder::new()
            .name(WRITER_THREAD_NAME.to_string())
            .spawn(move || runtime.block_on(Worker::new(shared, rx, sweep).run()))?;
        Ok(handle)
    }

    async fn run(mut self) {
        debug!(
            save_interval_ms = self.shared.config.save_interval.as_millis() as u64,
            sweep = self.sweep_at.is_some(),
            "Writer started"
        );

        loop {
            let flush_at = self.flush_at.unwrap_or_else(|| Instant::now() + IDLE);
            let sweep_at = self.sweep_at.unwrap_or_else(|| Instant::now() + IDLE);

            tokio::select! {
                command = self.rx.recv() => {
                    let Some(command) = command else {
                        // Every handle is gone
                        self.flush_logged().await;
                        break;
                    };
                    if let Some(done) = self.handle_command(command).await {
                        self.flush_logged().await;
                        let _ = done.send(());
                        break;
                    }
                }
                _ = sleep_until(flush_at), if self.flush_at.is_some() => {
                    self.flush_logged().await;
                }
                _ = sleep_until(sweep_at), if self.sweep_at.is_some() => {
                    self.sweep_at = Some(Instant::now() + self.shared.config.sweep_interval);
                    if let Err(e) = self.sweep().await {
                        error!(error = %e, "Scheduled sweep failed");
                    }
                }
            }
        }

        info!("Writer stopped");
    }

    /// Handle one command; returns the close acknowledgement when the
    /// writer should stop
    async fn handle_command(&mut self, command: Command) -> Option<oneshot::Sender<()>> {
        match command {
            Command::Mutate { mutation, ack } => {
                let result = self.apply(mutation).await;
                match ack {
                    Ack::None => {
                        if let Err(e) = result {
                            warn!(error = %e, "Mutation failed");
                        }
                        self.schedule_flush();
                    }
                    Ack::Blocking(done) => {
                        if let Err(e) = result {
                            warn!(error = %e, "Mutation failed");
                        }
                        self.flush_logged().await;
                        let _ = done.send(());
                    }
                    Ack::Reply(reply) => {
                        let result = match result {
                            Ok(()) => self.flush().await,
                            Err(e) => Err(e),
                        };
                        let _ = reply.send(result);
                    }
                }
            }
            Command::Flush(reply) => {
                let _ = reply.send(self.flush().await);
            }
            Command::Sweep(reply) => {
                let _ = reply.send(self.sweep().await);
            }
            Command::Export { target, options, reply } => {
                let _ = reply.send(self.export(target, options).await);
            }
            Command::Close(done) => return Some(done),
        }
        None
    }

    fn schedule_flush(&mut self) {
        if self.flush_at.is_none() {
            self.flush_at = Some(Instant::now() + self.shared.config.save_interval);
        }
    }

    /// Take the open batch, starting one if needed
    fn take_writer(&mut self) -> Result<RecordWriter, StoreError> {
        match self.pending.take() {
            Some(writer) => Ok(writer),
            None => self.shared.records.begin_write(),
        }
    }

    async fn apply(&mut self, mutation: Mutation) -> Result<(), StoreError> {
        let mut writer = self.take_writer()?;
        let result = self.apply_to(&mut writer, mutation).await;
        self.pending = Some(writer);
        result
    }

    async fn apply_to(&self, writer: &mut RecordWriter, mutation: Mutation) -> Result<(), StoreError> {
        match mutation {
            Mutation::Event(event) => {
                // Ingestion failures never reach the producer
                if let Err(e) = self.ingestor.apply(writer, &event).await {
                    warn!(kind = event.kind(), error = %e, "Failed to store event");
                }
            }
            Mutation::CreateSession(session) => {
                writer.create_session(session)?;
            }
            Mutation::SetPinned { id, pinned } => {
                if !writer.set_pinned(id, pinned)? {
                    debug!(message = %id, "Pin change for unknown message ignored");
                }
            }
            Mutation::RemoveAllPins => {
                let unpinned = writer.clear_pins()?;
                debug!(unpinned, "Removed all pins");
            }
            Mutation::RemoveSessions(ids) => {
                let deleted = writer.delete_sessions_where(|s| ids.contains(&s.id))?;
                for key in &deleted.blob_refs {
                    self.shared.blobs.unlink(writer, key)?;
                }
                info!(
                    sessions = deleted.sessions,
                    messages = deleted.messages,
                    tasks = deleted.tasks,
                    "Removed sessions"
                );
            }
            Mutation::RemoveAll { current } => {
                let freed = self.shared.blobs.remove_all(writer)?;
                writer.clear()?;
                writer.create_session(current)?;
                info!(freed_blob_bytes = freed, "Removed all records");
            }
        }
        Ok(())
    }

    /// Commit the open batch and remove the blob files it released
    #[instrument(skip(self))]
    async fn flush(&mut self) -> Result<(), StoreError> {
        self.flush_at = None;
        let Some(writer) = self.pending.take() else {
            return Ok(());
        };

        if let Some(layout) = &self.shared.layout {
            if !layout.root().exists() {
                warn!(path = %layout.root().display(), "Store directory is gone, dropping buffered writes");
                return writer.abort();
            }
        }

        let mutations = writer.mutation_count();
        let removals = writer.commit()?;
        for path in &removals {
            if let Err(e) = remove_file_if_exists(path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove blob file");
            }
        }
        debug!(mutations, removed_files = removals.len(), "Flushed");
        Ok(())
    }

    async fn flush_logged(&mut self) {
        if let Err(e) = self.flush().await {
            error!(error = %e, "Flush failed");
        }
    }

    #[instrument(skip(self))]
    async fn sweep(&mut self) -> Result<SweepReport, StoreError> {
        self.flush().await?;

        let now = self.shared.config.clock.now_utc();
        let mut writer = self.shared.records.begin_write()?;
        let report = self.sweeper.run(&mut writer, now);
        self.pending = Some(writer);
        self.flush().await?;

        if let Err(e) = self.shared.blobs.remove_orphans(&self.shared.records).await {
            warn!(error = %e, "Failed to remove orphaned blob files");
        }

        let manifest = {
            let mut manifest = self.shared.manifest.write();
            manifest.last_sweep_date = Some(now);
            manifest.clone()
        };
        if let Some(layout) = &self.shared.layout {
            manifest.save(&layout.manifest_path()).await?;
        }
        Ok(report)
    }

    async fn export(&mut self, target: PathBuf, options: ExportOptions) -> Result<StoreInfo, StoreError> {
        self.flush().await?;
        let source = ExportSource {
            records: &self.shared.records,
            blobs: &self.shared.blobs,
            metadata: &*self.shared.config.metadata,
            created_date: self.shared.manifest.read().created_date,
        };
        archive::export(source, &target, &options, self.shared.config.clock.now_utc()).await
    }
}
