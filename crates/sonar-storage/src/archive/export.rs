//! Filtered snapshot export
//!
//! Export copies the record database into a working directory, deletes
//! everything the filter rejects through the same deletion path the sweep
//! uses, compacts the copy and brings along only the blob files the kept
//! tasks still reference.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sonar_core::{MetadataProvider, SessionId};
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use super::document::{StoreLayout, copy_dir_all, directory_size, pack_archive};
use super::manifest::{Manifest, StoreInfo, Version};
use crate::blobs::{BlobStore, BlobStoreConfig};
use crate::error::StoreError;
use crate::structured::{MessageRecord, RecordStore, StoreSizes};

/// Output form of an export
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    /// A writable package directory
    #[default]
    Package,
    /// A read-only zip archive
    Archive,
}

type MessagePredicate = Arc<dyn Fn(&MessageRecord) -> bool + Send + Sync>;

/// Which records an export keeps and how it is written
#[derive(Clone, Default)]
pub struct ExportOptions {
    predicate: Option<MessagePredicate>,
    sessions: Option<HashSet<SessionId>>,
    format: ExportFormat,
}

impl ExportOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep only messages (and the tasks they summarize) matching `predicate`
    pub fn with_predicate(mut self, predicate: impl Fn(&MessageRecord) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Keep only these sessions
    pub fn with_sessions(mut self, sessions: impl IntoIterator<Item = SessionId>) -> Self {
        self.sessions = Some(sessions.into_iter().collect());
        self
    }

    pub fn with_format(mut self, format: ExportFormat) -> Self {
        self.format = format;
        self
    }

    pub fn archive(self) -> Self {
        self.with_format(ExportFormat::Archive)
    }

    pub fn format(&self) -> ExportFormat {
        self.format
    }
}

impl fmt::Debug for ExportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportOptions")
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .field("sessions", &self.sessions)
            .field("format", &self.format)
            .finish()
    }
}

/// Everything an export reads from the live store
pub struct ExportSource<'a> {
    pub records: &'a RecordStore,
    pub blobs: &'a BlobStore,
    pub metadata: &'a dyn MetadataProvider,
    /// Creation date of the source store
    pub created_date: DateTime<Utc>,
}

/// Write a filtered snapshot of `source` to `target`
#[instrument(skip(source, options), fields(target = %target.display(), format = ?options.format))]
pub async fn export(
    source: ExportSource<'_>,
    target: &Path,
    options: &ExportOptions,
    now: DateTime<Utc>,
) -> Result<StoreInfo, StoreError> {
    if fs::metadata(target).await.is_ok() {
        return Err(StoreError::FileAlreadyExists(target.to_path_buf()));
    }

    let parent = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let work = tempfile::Builder::new()
        .prefix(".sonar-export-")
        .tempdir_in(&parent)?;
    let layout = StoreLayout::new(work.path());

    let sizes = build_copy(&source, &layout, options).await?;

    let manifest = Manifest::new(now);
    manifest.save(&layout.manifest_path()).await?;

    let metadata_size = directory_size(layout.root()).await?;
    let info = StoreInfo {
        store_id: manifest.store_id,
        store_version: Version::CURRENT,
        creation_date: source.created_date,
        modified_date: now,
        archived_date: (options.format == ExportFormat::Archive).then_some(now),
        message_count: sizes.message_count.saturating_sub(sizes.task_count),
        task_count: sizes.task_count,
        blob_count: sizes.blob_count,
        total_store_size: metadata_size,
        blobs_size: sizes.blobs_size,
        blobs_decompressed_size: sizes.blobs_decompressed_size,
        app_info: source.metadata.app_info(),
        device_info: source.metadata.device_info(),
    };

    match options.format {
        ExportFormat::Archive => {
            info.save(&layout.info_path()).await?;
            pack_archive(layout.root(), target).await?;
        }
        ExportFormat::Package => {
            if let Err(e) = fs::rename(layout.root(), target).await {
                debug!(error = %e, "Rename failed, copying package");
                copy_dir_all(layout.root(), target).await?;
            }
        }
    }

    info!(
        store_id = %info.store_id,
        messages = info.message_count,
        tasks = info.task_count,
        blobs = info.blob_count,
        "Export complete"
    );
    Ok(info)
}

/// Fill `layout` with the filtered, compacted records and their blobs
async fn build_copy(
    source: &ExportSource<'_>,
    layout: &StoreLayout,
    options: &ExportOptions,
) -> Result<StoreSizes, StoreError> {
    let mut copy = RecordStore::open(&layout.records_path())?;
    source.records.copy_into(&copy)?;

    // File blobs are copied later, so the copy never removes files
    let copy_blobs = BlobStore::new(BlobStoreConfig::default()).await?;

    let mut writer = copy.begin_write()?;
    let mut blob_refs = Vec::new();

    if let Some(allowed) = &options.sessions {
        let deleted = writer.delete_sessions_where(|s| !allowed.contains(&s.id))?;
        blob_refs.extend(deleted.blob_refs);
        let deleted = writer.delete_messages_where(|m| !allowed.contains(&m.session_id))?;
        blob_refs.extend(deleted.blob_refs);
    }

    if let Some(predicate) = &options.predicate {
        let deleted = writer.delete_messages_where(|m| !predicate(m))?;
        blob_refs.extend(deleted.blob_refs);

        if options.sessions.is_none() {
            let remaining: HashSet<SessionId> =
                writer.messages()?.into_iter().map(|m| m.session_id).collect();
            let deleted = writer.delete_sessions_where(|s| !remaining.contains(&s.id))?;
            blob_refs.extend(deleted.blob_refs);
        }
    }

    for key in &blob_refs {
        copy_blobs.unlink(&mut writer, key)?;
    }
    writer.commit()?;

    if copy.compact()? {
        debug!("Compacted exported records");
    }

    let blobs_dir = layout.blobs_dir();
    fs::create_dir_all(&blobs_dir).await?;
    for handle in copy.blob_handles()?.into_iter().filter(|h| h.is_file()) {
        let Some(from) = source.blobs.blob_path(&handle.key) else {
            continue;
        };
        if let Err(e) = fs::copy(&from, blobs_dir.join(handle.key.to_hex())).await {
            warn!(hash = %handle.key.short(), error = %e, "Blob file missing from source");
        }
    }

    copy.sizes()
}
