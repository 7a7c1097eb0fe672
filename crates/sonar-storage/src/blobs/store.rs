//! Blob store implementation
//!
//! Content-addressed, reference-counted storage of request and response
//! bodies. Handles live in the record database so reference counts change
//! in the same transaction as the tasks that hold them. Small payloads are
//! stored inline in the database, larger ones as files named by their hex
//! content key.

use std::borrow::Cow;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use sonar_core::ContentType;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::content_key::ContentKey;
use super::handle::{BlobHandle, StorageMode};
use super::thumbnail::make_thumbnail;
use crate::config::{StoreConfig, ThumbnailPolicy};
use crate::error::StoreError;
use crate::structured::{RecordStore, RecordWriter};

/// Configuration for the blob store
#[derive(Debug, Clone)]
pub struct BlobStoreConfig {
    /// Directory for file blobs, `None` keeps every blob inline
    pub blobs_dir: Option<PathBuf>,
    /// Blobs up to this many stored bytes stay in the database
    pub inline_limit: usize,
    /// Bodies larger than this are not stored
    pub body_size_limit: usize,
    pub compression: bool,
    pub thumbnails: ThumbnailPolicy,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            blobs_dir: None,
            inline_limit: 16 * 1024,
            body_size_limit: 8 * 1024 * 1024,
            compression: true,
            thumbnails: ThumbnailPolicy::default(),
        }
    }
}

impl BlobStoreConfig {
    pub fn from_store_config(config: &StoreConfig, blobs_dir: Option<PathBuf>) -> Self {
        Self {
            blobs_dir,
            inline_limit: config.inline_limit,
            body_size_limit: config.body_size_limit,
            compression: config.blob_compression,
            thumbnails: config.thumbnails,
        }
    }
}

/// Bytes ready to be hashed, after the thumbnail policy ran
#[derive(Debug)]
pub struct Preprocessed<'a> {
    pub data: Cow<'a, [u8]>,
    pub content_type: Option<String>,
    /// Pixel size of the original image when it was downscaled
    pub original_dimensions: Option<(u32, u32)>,
}

/// Outcome of a successful [`BlobStore::store`]
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub handle: BlobHandle,
    pub original_dimensions: Option<(u32, u32)>,
}

/// Content-addressed blob store
#[derive(Debug, Clone)]
pub struct BlobStore {
    config: BlobStoreConfig,
}

impl BlobStore {
    /// Create a new blob store
    pub async fn new(config: BlobStoreConfig) -> Result<Self, StoreError> {
        if let Some(dir) = &config.blobs_dir {
            fs::create_dir_all(dir).await?;
            info!(path = %dir.display(), "Blob store initialized");
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &BlobStoreConfig {
        &self.config
    }

    /// Apply the thumbnail policy to an image body
    ///
    /// Bodies that are not images, are small, or fail to decode pass
    /// through unchanged.
    pub fn preprocess<'a>(&self, data: &'a [u8], content_type: Option<&str>) -> Preprocessed<'a> {
        let unchanged = Preprocessed {
            data: Cow::Borrowed(data),
            content_type: content_type.map(str::to_string),
            original_dimensions: None,
        };

        let policy = self.config.thumbnails;
        let is_image = content_type.is_some_and(|ct| ContentType::parse(ct).is_image());
        if !policy.enabled || !is_image || data.len() <= policy.min_size {
            return unchanged;
        }

        match make_thumbnail(data, policy.max_dimension) {
            Ok(thumbnail) => match thumbnail.data {
                Some(encoded) => Preprocessed {
                    data: Cow::Owned(encoded),
                    content_type: Some("image/png".to_string()),
                    original_dimensions: Some((thumbnail.width, thumbnail.height)),
                },
                None => unchanged,
            },
            Err(e) => {
                debug!(error = %e, "Keeping image body as is");
                unchanged
            }
        }
    }

    /// Store a body and take one reference to it
    ///
    /// Failures are logged and reported as `None`; the caller treats the
    /// body as unavailable.
    #[instrument(skip(self, writer, data, content_type, created_at), fields(size = data.len()))]
    pub async fn store(
        &self,
        writer: &mut RecordWriter,
        data: &[u8],
        content_type: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Option<StoredBlob> {
        match self.try_store(writer, data, content_type, created_at).await {
            Ok(stored) => stored,
            Err(e) => {
                warn!(error = %e, "Failed to store blob");
                None
            }
        }
    }

    async fn try_store(
        &self,
        writer: &mut RecordWriter,
        data: &[u8],
        content_type: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> Result<Option<StoredBlob>, StoreError> {
        let processed = self.preprocess(data, content_type);
        let original_dimensions = processed.original_dimensions;

        if processed.data.is_empty() {
            return Ok(None);
        }
        if processed.data.len() > self.config.body_size_limit {
            debug!(
                size = processed.data.len(),
                limit = self.config.body_size_limit,
                "Body exceeds size limit"
            );
            return Ok(None);
        }

        let key = ContentKey::from_data(&processed.data);

        if let Some(mut handle) = writer.blob_handle(&key)? {
            handle.ref_count += 1;
            writer.put_blob_handle(&handle)?;
            debug!(hash = %key.short(), ref_count = handle.ref_count, "Blob already exists");
            return Ok(Some(StoredBlob {
                handle,
                original_dimensions,
            }));
        }

        let (bytes, compressed) = self.maybe_compress(&processed.data);
        let storage = match &self.config.blobs_dir {
            Some(_) if bytes.len() > self.config.inline_limit => StorageMode::File,
            _ => StorageMode::Inline,
        };

        match storage {
            StorageMode::Inline => writer.put_inline_blob(&key, &bytes)?,
            StorageMode::File => {
                let path = self.blob_path(&key).ok_or_else(|| StoreError::blob("no blob directory"))?;
                write_atomic(&path, &bytes).await?;
                // The same content may have been released earlier in this batch
                writer.cancel_removal(&path);
            }
        }

        let handle = BlobHandle {
            key,
            size: bytes.len() as u64,
            decompressed_size: processed.data.len() as u64,
            ref_count: 1,
            storage,
            compressed,
            content_type: processed.content_type,
            created_at_millis: created_at.timestamp_millis(),
        };
        writer.put_blob_handle(&handle)?;

        debug!(
            hash = %key.short(),
            size = handle.size,
            compressed,
            storage = ?storage,
            "Stored blob"
        );
        Ok(Some(StoredBlob {
            handle,
            original_dimensions,
        }))
    }

    /// Compressed form of `data`, if compression is on and it is strictly
    /// smaller
    fn maybe_compress<'a>(&self, data: &'a [u8]) -> (Cow<'a, [u8]>, bool) {
        if self.config.compression {
            let compressed = lz4_flex::compress_prepend_size(data);
            if compressed.len() < data.len() {
                return (Cow::Owned(compressed), true);
            }
        }
        (Cow::Borrowed(data), false)
    }

    /// Drop one reference to a blob
    ///
    /// The last reference removes the handle and the inline bytes; a
    /// backing file is removed once the batch commits. Returns the stored
    /// bytes freed, zero while other references remain.
    pub fn unlink(&self, writer: &mut RecordWriter, key: &ContentKey) -> Result<u64, StoreError> {
        let Some(mut handle) = writer.blob_handle(key)? else {
            warn!(hash = %key.short(), "Unlink of unknown blob");
            return Ok(0);
        };

        if handle.ref_count > 1 {
            handle.ref_count -= 1;
            writer.put_blob_handle(&handle)?;
            return Ok(0);
        }

        writer.remove_blob_handle(key)?;
        match handle.storage {
            StorageMode::Inline => {
                writer.remove_inline_blob(key)?;
            }
            StorageMode::File => {
                if let Some(path) = self.blob_path(key) {
                    writer.defer_removal(path);
                }
            }
        }
        debug!(hash = %key.short(), size = handle.size, "Released blob");
        Ok(handle.size)
    }

    /// Release every blob at once
    pub fn remove_all(&self, writer: &mut RecordWriter) -> Result<u64, StoreError> {
        let mut freed = 0;
        for handle in writer.blob_handles()? {
            writer.remove_blob_handle(&handle.key)?;
            match handle.storage {
                StorageMode::Inline => {
                    writer.remove_inline_blob(&handle.key)?;
                }
                StorageMode::File => {
                    if let Some(path) = self.blob_path(&handle.key) {
                        writer.defer_removal(path);
                    }
                }
            }
            freed += handle.size;
        }
        Ok(freed)
    }

    /// Committed handle for a key
    pub fn handle(&self, records: &RecordStore, key: &ContentKey) -> Result<Option<BlobHandle>, StoreError> {
        records.blob_handle(key)
    }

    /// Stored bytes of all committed blobs
    pub fn total_size(&self, records: &RecordStore) -> Result<u64, StoreError> {
        Ok(records.blob_handles()?.iter().map(|h| h.size).sum())
    }

    /// Read and verify a blob's original bytes
    #[instrument(skip(self, records, handle), fields(hash = %handle.key.short()))]
    pub async fn read(&self, records: &RecordStore, handle: &BlobHandle) -> Result<Bytes, StoreError> {
        let stored = match handle.storage {
            StorageMode::Inline => records
                .inline_blob(&handle.key)?
                .ok_or_else(|| StoreError::not_found(handle.key.to_hex()))?,
            StorageMode::File => {
                let path = self
                    .blob_path(&handle.key)
                    .ok_or_else(|| StoreError::blob("no blob directory"))?;
                fs::read(&path).await.map_err(|e| {
                    if e.kind() == ErrorKind::NotFound {
                        StoreError::not_found(handle.key.to_hex())
                    } else {
                        StoreError::from(e)
                    }
                })?
            }
        };

        let data = if handle.compressed {
            lz4_flex::decompress_size_prepended(&stored)
                .map_err(|e| StoreError::blob(format!("decompression failed: {e}")))?
        } else {
            stored
        };

        // Verify hash
        let actual = ContentKey::from_data(&data);
        if actual != handle.key {
            warn!(
                expected = %handle.key.to_hex(),
                actual = %actual.to_hex(),
                "Blob hash mismatch"
            );
            return Err(StoreError::blob("hash mismatch"));
        }

        Ok(Bytes::from(data))
    }

    /// Get the file path for a content key
    pub fn blob_path(&self, key: &ContentKey) -> Option<PathBuf> {
        self.config.blobs_dir.as_ref().map(|dir| dir.join(key.to_hex()))
    }

    /// Delete files in the blob directory that no committed handle refers to
    ///
    /// These are left behind when a batch is discarded after its files
    /// were written.
    pub async fn remove_orphans(&self, records: &RecordStore) -> Result<usize, StoreError> {
        let Some(dir) = &self.config.blobs_dir else {
            return Ok(0);
        };

        let mut removed = 0;
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let orphaned = match ContentKey::from_hex(name) {
                Some(key) => records.blob_handle(&key)?.is_none_or(|h| !h.is_file()),
                None => name.ends_with(".tmp"),
            };
            if orphaned {
                remove_file_if_exists(&path).await?;
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "Removed orphaned blob files");
        }
        Ok(removed)
    }
}

/// Write to a temp file, then rename over the target
async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    fs::rename(&temp_path, path).await?;
    Ok(())
}

/// Remove a file, treating an already missing file as success
pub(crate) async fn remove_file_if_exists(path: &Path) -> Result<bool, StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use rand::RngCore;
    use tempfile::TempDir;

    use super::*;
    use crate::blobs::thumbnail::tests::noisy_png;

    struct Fixture {
        records: RecordStore,
        blobs: BlobStore,
        _dir: TempDir,
    }

    async fn create_test_store(config: BlobStoreConfig) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let records = RecordStore::open(&temp_dir.path().join("records.redb")).unwrap();
        let blobs = BlobStore::new(BlobStoreConfig {
            blobs_dir: Some(temp_dir.path().join("blobs")),
            ..config
        })
        .await
        .unwrap();
        Fixture {
            records,
            blobs,
            _dir: temp_dir,
        }
    }

    fn random_bytes(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        rand::rng().fill_bytes(&mut data);
        data
    }

    #[tokio::test]
    async fn test_store_and_read_inline() {
        let f = create_test_store(BlobStoreConfig::default()).await;
        let data = b"Hello, blob storage!";

        let mut writer = f.records.begin_write().unwrap();
        let stored = f.blobs.store(&mut writer, data, None, Utc::now()).await.unwrap();
        writer.commit().unwrap();

        assert_eq!(stored.handle.storage, StorageMode::Inline);
        assert_eq!(stored.handle.ref_count, 1);
        let read = f.blobs.read(&f.records, &stored.handle).await.unwrap();
        assert_eq!(&read[..], data);
    }

    #[tokio::test]
    async fn test_dedup_and_refcount() {
        let f = create_test_store(BlobStoreConfig::default()).await;
        let data = random_bytes(20 * 1024);

        let mut writer = f.records.begin_write().unwrap();
        let first = f.blobs.store(&mut writer, &data, None, Utc::now()).await.unwrap();
        let second = f.blobs.store(&mut writer, &data, None, Utc::now()).await.unwrap();
        writer.commit().unwrap();

        assert_eq!(first.handle.key, second.handle.key);
        assert_eq!(second.handle.ref_count, 2);
        assert_eq!(f.records.blob_handles().unwrap().len(), 1);
        let path = f.blobs.blob_path(&first.handle.key).unwrap();
        assert!(path.exists());

        let mut writer = f.records.begin_write().unwrap();
        assert_eq!(f.blobs.unlink(&mut writer, &first.handle.key).unwrap(), 0);
        assert!(writer.commit().unwrap().is_empty());
        assert_eq!(
            f.blobs.handle(&f.records, &first.handle.key).unwrap().unwrap().ref_count,
            1
        );
        assert!(path.exists());

        let mut writer = f.records.begin_write().unwrap();
        let freed = f.blobs.unlink(&mut writer, &first.handle.key).unwrap();
        assert_eq!(freed, first.handle.size);
        let removals = writer.commit().unwrap();
        assert_eq!(removals, vec![path.clone()]);
        for removal in removals {
            remove_file_if_exists(&removal).await.unwrap();
        }
        assert!(!path.exists());
        assert!(f.blobs.handle(&f.records, &first.handle.key).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compression_only_when_smaller() {
        let f = create_test_store(BlobStoreConfig::default()).await;
        let repetitive = vec![b'a'; 4096];
        let noise = random_bytes(4096);

        let mut writer = f.records.begin_write().unwrap();
        let small = f.blobs.store(&mut writer, &repetitive, None, Utc::now()).await.unwrap();
        let same = f.blobs.store(&mut writer, &noise, None, Utc::now()).await.unwrap();
        writer.commit().unwrap();

        assert!(small.handle.compressed);
        assert!(small.handle.size < small.handle.decompressed_size);
        assert!(!same.handle.compressed);
        assert_eq!(same.handle.size, 4096);

        let read = f.blobs.read(&f.records, &small.handle).await.unwrap();
        assert_eq!(&read[..], &repetitive[..]);
    }

    #[tokio::test]
    async fn test_rejects_empty_and_oversized() {
        let f = create_test_store(BlobStoreConfig {
            body_size_limit: 100,
            ..Default::default()
        })
        .await;
        let mut writer = f.records.begin_write().unwrap();
        assert!(f.blobs.store(&mut writer, b"", None, Utc::now()).await.is_none());
        assert!(f.blobs.store(&mut writer, &[1u8; 101], None, Utc::now()).await.is_none());
        assert!(f.blobs.store(&mut writer, &[1u8; 100], None, Utc::now()).await.is_some());
    }

    #[tokio::test]
    async fn test_in_memory_keeps_large_blobs_inline() {
        let records = RecordStore::in_memory().unwrap();
        let blobs = BlobStore::new(BlobStoreConfig::default()).await.unwrap();
        let data = random_bytes(64 * 1024);

        let mut writer = records.begin_write().unwrap();
        let stored = blobs.store(&mut writer, &data, None, Utc::now()).await.unwrap();
        writer.commit().unwrap();

        assert_eq!(stored.handle.storage, StorageMode::Inline);
        assert!(blobs.blob_path(&stored.handle.key).is_none());
        assert_eq!(&blobs.read(&records, &stored.handle).await.unwrap()[..], &data[..]);
        assert_eq!(blobs.total_size(&records).unwrap(), stored.handle.size);
    }

    #[tokio::test]
    async fn test_hash_verification() {
        let f = create_test_store(BlobStoreConfig {
            compression: false,
            ..Default::default()
        })
        .await;
        let data = random_bytes(32 * 1024);

        let mut writer = f.records.begin_write().unwrap();
        let stored = f.blobs.store(&mut writer, &data, None, Utc::now()).await.unwrap();
        writer.commit().unwrap();

        // Corrupt the file
        let path = f.blobs.blob_path(&stored.handle.key).unwrap();
        fs::write(&path, b"Corrupted!").await.unwrap();

        let result = f.blobs.read(&f.records, &stored.handle).await;
        assert!(matches!(result, Err(StoreError::Blob(_))));
    }

    #[tokio::test]
    async fn test_image_bodies_become_thumbnails() {
        let f = create_test_store(BlobStoreConfig::default()).await;
        let png = noisy_png(800, 400);
        assert!(png.len() > 5000);

        let mut writer = f.records.begin_write().unwrap();
        let stored = f
            .blobs
            .store(&mut writer, &png, Some("image/png"), Utc::now())
            .await
            .unwrap();
        writer.commit().unwrap();

        assert_eq!(stored.original_dimensions, Some((800, 400)));
        assert_ne!(stored.handle.key, ContentKey::from_data(&png));
        let data = f.blobs.read(&f.records, &stored.handle).await.unwrap();
        let thumbnail = image::load_from_memory(&data).unwrap();
        assert!(thumbnail.width() <= 256 && thumbnail.height() <= 256);
    }

    #[tokio::test]
    async fn test_thumbnails_disabled_keeps_original() {
        let f = create_test_store(BlobStoreConfig {
            thumbnails: ThumbnailPolicy::disabled(),
            ..Default::default()
        })
        .await;
        let png = noisy_png(800, 400);
        let processed = f.blobs.preprocess(&png, Some("image/png"));
        assert!(matches!(processed.data, Cow::Borrowed(_)));
        assert!(processed.original_dimensions.is_none());
    }

    #[tokio::test]
    async fn test_remove_orphans() {
        let f = create_test_store(BlobStoreConfig::default()).await;
        let data = random_bytes(32 * 1024);

        let mut writer = f.records.begin_write().unwrap();
        let stored = f.blobs.store(&mut writer, &data, None, Utc::now()).await.unwrap();
        writer.abort().unwrap();

        let path = f.blobs.blob_path(&stored.handle.key).unwrap();
        assert!(path.exists());
        assert_eq!(f.blobs.remove_orphans(&f.records).await.unwrap(), 1);
        assert!(!path.exists());
    }
}
