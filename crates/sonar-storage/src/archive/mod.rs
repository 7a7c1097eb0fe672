//! Store documents, manifests and export

mod document;
mod export;
mod manifest;

pub use document::{
    BLOBS_DIR, Document, DocumentKind, INFO_FILE, MANIFEST_FILE, RECORDS_FILE, StoreLayout,
    directory_size,
};
pub use export::{ExportFormat, ExportOptions, ExportSource, export};
pub use manifest::{Manifest, StoreInfo, Version};
