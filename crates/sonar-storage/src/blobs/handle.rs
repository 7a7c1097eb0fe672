//! Blob handle records

use serde::{Deserialize, Serialize};

use super::content_key::ContentKey;

/// Where a blob's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    /// Inside the structured store
    Inline,
    /// In a file named by the content key under the blobs directory
    File,
}

/// Reference-counted record of one stored payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHandle {
    pub key: ContentKey,
    /// Bytes actually stored (after compression)
    pub size: u64,
    /// Bytes returned by a read
    pub decompressed_size: u64,
    /// Number of live task body references
    pub ref_count: u32,
    pub storage: StorageMode,
    pub compressed: bool,
    pub content_type: Option<String>,
    pub created_at_millis: i64,
}

impl BlobHandle {
    pub fn is_file(&self) -> bool {
        self.storage == StorageMode::File
    }
}
