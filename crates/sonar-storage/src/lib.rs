//! # Sonar Storage
//!
//! An embedded, append-heavy store for diagnostic events: log messages and
//! network tasks with their request and response bodies.
//!
//! ## Features
//!
//! - **RecordStore**: Sessions, messages, tasks and transactions in redb
//! - **BlobStore**: Content-addressed, deduplicated and reference-counted bodies
//! - **Ingestor**: Translates [`sonar_core::Event`] values into record mutations
//! - **Sweeper**: Age and size budgets, enforced on a schedule
//! - **Export**: Filtered, compacted package or zip archive snapshots
//!
//! All writes go through a single writer thread; reads use MVCC read
//! transactions and never block it.
//!
//! ## Example
//!
//! ```rust,ignore
//! use sonar_core::Level;
//! use sonar_storage::{EventStore, OpenOptions, Query, StoreConfig, StoreMessage};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = EventStore::open(
//!         "logs.sonar",
//!         OpenOptions::CREATE | OpenOptions::SWEEP,
//!         StoreConfig::default(),
//!     )
//!     .await
//!     .unwrap();
//!
//!     store.store_message(StoreMessage::new(Level::Info, "app", "Started"));
//!     store.flush().await.unwrap();
//!
//!     let messages = store.messages(&Query::new().descending().limit(10)).unwrap();
//!     assert_eq!(messages.len(), 1);
//!
//!     store.close().await.unwrap();
//! }
//! ```

pub mod archive;
pub mod blobs;
pub mod config;
pub mod error;
pub mod ingest;
pub mod store;
pub mod structured;
pub mod sweep;
mod worker;

// Re-exports
pub use archive::{DocumentKind, ExportFormat, ExportOptions, Manifest, StoreInfo, Version};
pub use blobs::{BlobHandle, BlobStore, BlobStoreConfig, ContentKey, StorageMode};
pub use config::{EventFilter, OpenOptions, StoreConfig, ThumbnailPolicy};
pub use error::StoreError;
pub use ingest::{Ingestor, RESPONSE_PIXEL_HEIGHT, RESPONSE_PIXEL_WIDTH};
pub use store::{EventStore, StoreMessage, StoreRequest};
pub use structured::{
    MessageId, MessageRecord, Query, Record, RecordStore, SessionRecord, SortOrder, StoreSizes,
    TaskProgress, TaskRecord, TransactionRecord,
};
pub use sweep::{SweepConfig, SweepReport, Sweeper};
