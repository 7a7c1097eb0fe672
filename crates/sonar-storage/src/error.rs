//! Error types for sonar-storage
//!
//! [`StoreError`] carries the store's user-facing taxonomy (missing file,
//! invalid store, unsupported version, read-only document, export target
//! collision) alongside the lower-level failures it wraps.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Opened without the create option on a path that does not exist
    #[error("File missing: {0}")]
    FileMissing(PathBuf),

    /// The structured store file is missing or corrupt
    #[error("Store invalid: {0}")]
    StoreInvalid(String),

    /// The archive was written with a schema older than we can read
    #[error("Unsupported version {found}, minimum supported is {minimum}")]
    UnsupportedVersion { found: String, minimum: String },

    /// Mutation attempted on a read-only document
    #[error("Document is read-only")]
    DocumentReadonly,

    /// Export target already exists
    #[error("File already exists: {0}")]
    FileAlreadyExists(PathBuf),

    #[error("Unknown error: {0}")]
    Unknown(String),

    /// I/O error during storage operations
    #[error("I/O error: {0}")]
    Io(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Requested item was not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Blob bytes are missing or fail verification
    #[error("Blob error: {0}")]
    Blob(String),

    /// Archive packing or unpacking failed
    #[error("Archive error: {0}")]
    Archive(String),

    /// Error during serialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Error during deserialization
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// The store has been closed
    #[error("Store is closed")]
    Closed,
}

impl StoreError {
    pub fn not_found(item: impl Into<String>) -> Self {
        Self::NotFound(item.into())
    }

    pub fn store_invalid(message: impl Into<String>) -> Self {
        Self::StoreInvalid(message.into())
    }

    pub fn blob(message: impl Into<String>) -> Self {
        Self::Blob(message.into())
    }

    pub fn archive(message: impl Into<String>) -> Self {
        Self::Archive(message.into())
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization(message.into())
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::Io(message.into())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

/// Convert from postcard Error to StoreError
impl From<postcard::Error> for StoreError {
    fn from(err: postcard::Error) -> Self {
        StoreError::Deserialization(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Deserialization(err.to_string())
    }
}

impl From<zip::result::ZipError> for StoreError {
    fn from(err: zip::result::ZipError) -> Self {
        StoreError::Archive(err.to_string())
    }
}

macro_rules! database_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(err: $ty) -> Self {
                    StoreError::Database(err.to_string())
                }
            }
        )*
    };
}

database_error!(
    redb::Error,
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
    redb::CompactionError,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_display() {
        let err = StoreError::FileMissing(PathBuf::from("/tmp/missing.sonar"));
        assert!(err.to_string().contains("missing.sonar"));

        let err = StoreError::UnsupportedVersion {
            found: "0.9.0".into(),
            minimum: "1.0.0".into(),
        };
        assert_eq!(
            err.to_string(),
            "Unsupported version 0.9.0, minimum supported is 1.0.0"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let store_err: StoreError = io_err.into();
        assert!(matches!(store_err, StoreError::Io(_)));
    }

    #[test]
    fn test_helper_constructors() {
        assert!(matches!(StoreError::not_found("x"), StoreError::NotFound(_)));
        assert!(matches!(StoreError::blob("hash mismatch"), StoreError::Blob(_)));
        assert!(matches!(
            StoreError::store_invalid("no database"),
            StoreError::StoreInvalid(_)
        ));
    }

    #[test]
    fn test_json_error_conversion() {
        let err: StoreError = serde_json::from_str::<u8>("nope").unwrap_err().into();
        assert!(matches!(err, StoreError::Deserialization(_)));
    }
}
