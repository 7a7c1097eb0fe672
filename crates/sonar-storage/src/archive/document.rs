//! On-disk documents
//!
//! A store lives either in a package directory (writable) or in a zip
//! archive (read-only). Both hold the same files:
//!
//! ```text
//! manifest.json
//! info.json        (archives only)
//! records.redb
//! blobs/<hex content key>
//! ```
//!
//! Archives are extracted into a private temporary directory that lives
//! as long as the opened store.

use std::fs::File;
use std::future::Future;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, info, instrument, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::manifest::{Manifest, StoreInfo, Version};
use crate::config::OpenOptions;
use crate::error::StoreError;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const INFO_FILE: &str = "info.json";
pub const RECORDS_FILE: &str = "records.redb";
pub const BLOBS_DIR: &str = "blobs";

/// Whether a document is a live package or an exported archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Package,
    Archive,
}

/// Paths of the files making up a store document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    root: PathBuf,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn info_path(&self) -> PathBuf {
        self.root.join(INFO_FILE)
    }

    pub fn records_path(&self) -> PathBuf {
        self.root.join(RECORDS_FILE)
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join(BLOBS_DIR)
    }
}

/// A document ready for its record database to be opened
#[derive(Debug)]
pub struct Document {
    pub kind: DocumentKind,
    /// Where the user pointed us: the package directory or archive file
    pub path: PathBuf,
    pub layout: StoreLayout,
    pub manifest: Manifest,
    /// Embedded summary of an archive
    pub info: Option<StoreInfo>,
    /// Extraction directory of an archive, removed on drop
    pub extracted: Option<TempDir>,
}

impl Document {
    /// Resolve `path` into a package or archive document
    ///
    /// Regular files are archives. Directories, and missing paths when
    /// `CREATE` is set, are packages.
    #[instrument(skip(path, options), fields(path = %path.display()))]
    pub async fn prepare(
        path: &Path,
        options: OpenOptions,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Self, StoreError> {
        match fs::metadata(path).await {
            Ok(metadata) if metadata.is_file() => Self::prepare_archive(path).await,
            Ok(_) => Self::prepare_package(path, options, now).await,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !options.contains(OpenOptions::CREATE) {
                    return Err(StoreError::FileMissing(path.to_path_buf()));
                }
                Self::prepare_package(path, options, now).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn prepare_package(
        path: &Path,
        options: OpenOptions,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<Self, StoreError> {
        let layout = StoreLayout::new(path);
        fs::create_dir_all(layout.root()).await?;

        let existing = match Manifest::load(&layout.manifest_path()).await {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!(error = %e, "Unreadable manifest, resetting store");
                reset_package(&layout).await?;
                None
            }
        };

        let manifest = match existing {
            Some(manifest) if manifest.version == Version::CURRENT => {
                if !options.contains(OpenOptions::CREATE) && !layout.records_path().exists() {
                    return Err(StoreError::store_invalid(format!(
                        "{} is missing",
                        layout.records_path().display()
                    )));
                }
                manifest
            }
            Some(manifest) => {
                info!(
                    found = %manifest.version,
                    current = %Version::CURRENT,
                    "Store version changed, resetting store"
                );
                reset_package(&layout).await?;
                Manifest::new(now)
            }
            None => {
                if !options.contains(OpenOptions::CREATE) && !layout.records_path().exists() {
                    return Err(StoreError::store_invalid(format!(
                        "{} is missing",
                        layout.records_path().display()
                    )));
                }
                Manifest::new(now)
            }
        };

        if !options.contains(OpenOptions::READONLY) {
            manifest.save(&layout.manifest_path()).await?;
        }
        fs::create_dir_all(layout.blobs_dir()).await?;

        debug!(store_id = %manifest.store_id, "Prepared package");
        Ok(Self {
            kind: DocumentKind::Package,
            path: path.to_path_buf(),
            layout,
            manifest,
            info: None,
            extracted: None,
        })
    }

    async fn prepare_archive(path: &Path) -> Result<Self, StoreError> {
        let archive_path = path.to_path_buf();
        let manifest: Manifest = run_blocking(move || {
            let mut archive = ZipArchive::new(File::open(&archive_path)?)?;
            let mut entry = archive
                .by_name(MANIFEST_FILE)
                .map_err(|_| StoreError::store_invalid("archive has no manifest"))?;
            let mut json = Vec::new();
            entry.read_to_end(&mut json)?;
            Ok(serde_json::from_slice(&json)?)
        })
        .await?;

        if manifest.version < Version::MINIMUM_SUPPORTED {
            return Err(StoreError::UnsupportedVersion {
                found: manifest.version.to_string(),
                minimum: Version::MINIMUM_SUPPORTED.to_string(),
            });
        }

        let extracted = tempfile::Builder::new()
            .prefix(&format!("sonar-{}-", manifest.store_id))
            .tempdir()?;
        unpack_archive(path, extracted.path()).await?;

        let layout = StoreLayout::new(extracted.path());
        if !layout.records_path().exists() {
            return Err(StoreError::store_invalid("archive has no record store"));
        }
        let info = StoreInfo::load(&layout.info_path()).await?;

        info!(store_id = %manifest.store_id, "Opened archive");
        Ok(Self {
            kind: DocumentKind::Archive,
            path: path.to_path_buf(),
            layout,
            manifest,
            info,
            extracted: Some(extracted),
        })
    }
}

/// Remove the record store and all blobs of a package
async fn reset_package(layout: &StoreLayout) -> Result<(), StoreError> {
    for path in [layout.records_path(), layout.manifest_path(), layout.info_path()] {
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    match fs::remove_dir_all(layout.blobs_dir()).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Run blocking zip work off the async thread
async fn run_blocking<T, F>(work: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| StoreError::archive(format!("archive task failed: {e}")))?
}

/// Zip the contents of `source` into a new file at `target`
#[instrument(skip_all, fields(target = %target.display()))]
pub async fn pack_archive(source: &Path, target: &Path) -> Result<(), StoreError> {
    let source = source.to_path_buf();
    let target = target.to_path_buf();
    let entries = run_blocking(move || {
        let file = File::create_new(&target).map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                StoreError::FileAlreadyExists(target.clone())
            } else {
                e.into()
            }
        })?;
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        let entries = add_dir_to_zip(&mut zip, &source, "", &options)?;
        zip.finish()?;
        Ok(entries)
    })
    .await?;
    debug!(entries, "Packed archive");
    Ok(())
}

fn add_dir_to_zip(
    zip: &mut ZipWriter<File>,
    dir: &Path,
    prefix: &str,
    options: &SimpleFileOptions,
) -> Result<usize, StoreError> {
    let mut entries = 0;
    let mut children: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let name = child.file_name().to_string_lossy().into_owned();
        let entry_name = format!("{prefix}{name}");
        let path = child.path();
        if child.file_type()?.is_dir() {
            zip.add_directory(format!("{entry_name}/"), options.clone())?;
            entries += add_dir_to_zip(zip, &path, &format!("{entry_name}/"), options)?;
        } else {
            zip.start_file(entry_name, options.clone())?;
            io::copy(&mut File::open(&path)?, zip)?;
            entries += 1;
        }
    }
    Ok(entries)
}

/// Extract an archive into `destination`
pub async fn unpack_archive(archive: &Path, destination: &Path) -> Result<(), StoreError> {
    let archive = archive.to_path_buf();
    let destination = destination.to_path_buf();
    run_blocking(move || {
        let mut zip = ZipArchive::new(File::open(&archive)?)?;
        zip.extract(&destination)?;
        Ok(())
    })
    .await
}

/// Total bytes of all files below `dir`
pub fn directory_size(dir: &Path) -> Pin<Box<dyn Future<Output = Result<u64, StoreError>> + Send + '_>> {
    Box::pin(async move {
        let mut total = 0;
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_dir() {
                total += directory_size(&entry.path()).await?;
            } else {
                total += metadata.len();
            }
        }
        Ok(total)
    })
}

/// Copy a directory tree, used when a rename crosses file systems
pub fn copy_dir_all<'a>(
    source: &'a Path,
    target: &'a Path,
) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + 'a>> {
    Box::pin(async move {
        fs::create_dir_all(target).await?;
        let mut entries = fs::read_dir(source).await?;
        while let Some(entry) = entries.next_entry().await? {
            let destination = target.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                copy_dir_all(&entry.path(), &destination).await?;
            } else {
                fs::copy(entry.path(), &destination).await?;
            }
        }
        Ok(())
    })
}
