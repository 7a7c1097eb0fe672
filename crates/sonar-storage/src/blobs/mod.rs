//! Content-addressed blob storage
//!
//! Request and response bodies are stored once per distinct content and
//! shared by reference count. Uses BLAKE3 for hashing, LZ4 for optional
//! compression and the `image` crate for thumbnails.

mod content_key;
mod handle;
mod store;
mod thumbnail;

pub use content_key::ContentKey;
pub use handle::{BlobHandle, StorageMode};
pub(crate) use store::remove_file_if_exists;
pub(crate) use thumbnail::image_dimensions;
#[cfg(test)]
pub(crate) use thumbnail::tests::noisy_png;
pub use store::{BlobStore, BlobStoreConfig, Preprocessed, StoredBlob};
