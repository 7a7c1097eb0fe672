//! redb table definitions and the read side of the record store
//!
//! Defines all tables used for structured storage.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use redb::backends::InMemoryBackend;
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition};
use serde::de::DeserializeOwned;
use sonar_core::{SessionId, TaskId};
use tracing::{debug, info, instrument};

use super::records::{MessageId, MessageRecord, SessionRecord, TaskRecord, TransactionRecord};
use super::writer::RecordWriter;
use crate::blobs::{BlobHandle, ContentKey};
use crate::error::StoreError;

/// Type alias for scan results to simplify complex type
pub type ScanResults = Vec<(Vec<u8>, Vec<u8>)>;

/// Every table stores postcard-encoded values under byte keys
pub type RecordTable = TableDefinition<'static, &'static [u8], &'static [u8]>;

// Key: session id bytes, Value: serialized SessionRecord
pub const SESSIONS: RecordTable = TableDefinition::new("sessions");

// Key: message id (u64 big-endian), Value: serialized MessageRecord
pub const MESSAGES: RecordTable = TableDefinition::new("messages");

// Key: task id bytes, Value: serialized TaskRecord
pub const TASKS: RecordTable = TableDefinition::new("tasks");

// Key: (task id, index u32 big-endian) concatenated, Value: serialized TransactionRecord
pub const TRANSACTIONS: RecordTable = TableDefinition::new("transactions");

// Key: content key bytes, Value: serialized BlobHandle
pub const BLOB_HANDLES: RecordTable = TableDefinition::new("blob_handles");

// Key: content key bytes, Value: raw (possibly compressed) blob bytes
pub const INLINE_BLOBS: RecordTable = TableDefinition::new("inline_blobs");

// Key: static name, Value: counter bytes
pub const META: RecordTable = TableDefinition::new("meta");

pub(crate) const ALL_TABLES: [RecordTable; 7] = [
    SESSIONS,
    MESSAGES,
    TASKS,
    TRANSACTIONS,
    BLOB_HANDLES,
    INLINE_BLOBS,
    META,
];

/// Tables whose bytes count against the structured-record budget
pub(crate) const RECORD_TABLES: [RecordTable; 4] = [SESSIONS, MESSAGES, TASKS, TRANSACTIONS];

pub(crate) const NEXT_MESSAGE_ID: &[u8] = b"next_message_id";

/// Row counts and byte totals of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreSizes {
    pub session_count: u64,
    pub message_count: u64,
    pub task_count: u64,
    pub blob_count: u64,
    /// Encoded bytes of sessions, messages, tasks and transactions
    pub records_size: u64,
    /// Stored bytes of all blobs, inline and file
    pub blobs_size: u64,
    pub blobs_decompressed_size: u64,
}

/// Row count and encoded bytes of one table
fn table_totals(read_txn: &ReadTransaction, definition: RecordTable) -> Result<(u64, u64), StoreError> {
    let table = read_txn.open_table(definition)?;
    let mut rows = 0u64;
    let mut bytes = 0u64;
    for entry in table.iter()? {
        let (key, value) = entry?;
        rows += 1;
        bytes += (key.value().len() + value.value().len()) as u64;
    }
    Ok((rows, bytes))
}

/// Durable structured storage for sessions, messages, tasks and
/// transactions, plus the blob handle table
///
/// Reads go through short-lived read transactions and see the last
/// committed state. All mutation happens through a [`RecordWriter`].
pub struct RecordStore {
    db: Arc<Database>,
    path: Option<PathBuf>,
}

impl RecordStore {
    /// Open or create the database file
    #[instrument(skip(path), fields(path = %path.display()))]
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(|e| StoreError::store_invalid(e.to_string()))?;

        info!("Opened record store");

        let store = Self {
            db: Arc::new(db),
            path: Some(path.to_path_buf()),
        };
        store.init_tables()?;
        Ok(store)
    }

    /// Create a store that lives only in memory
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        let store = Self {
            db: Arc::new(db),
            path: None,
        };
        store.init_tables()?;
        Ok(store)
    }

    /// Initialize all tables
    fn init_tables(&self) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        for table in ALL_TABLES {
            write_txn.open_table(table)?;
        }
        write_txn.commit()?;

        debug!("Initialized record tables");
        Ok(())
    }

    /// Path of the database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Start a batch of mutations
    pub fn begin_write(&self) -> Result<RecordWriter, StoreError> {
        Ok(RecordWriter::new(self.db.begin_write()?))
    }

    /// Get a value from a table
    pub(crate) fn get(&self, table: RecordTable, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;
        let value = table.get(key)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    /// Get and decode a value from a table
    pub(crate) fn get_record<T: DeserializeOwned>(
        &self,
        table: RecordTable,
        key: &[u8],
    ) -> Result<Option<T>, StoreError> {
        match self.get(table, key)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Iterate over all entries in a table with a prefix
    pub(crate) fn scan_prefix(
        &self,
        table: RecordTable,
        prefix: &[u8],
    ) -> Result<ScanResults, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(table)?;

        let mut results = Vec::new();

        // Use range to get all keys >= prefix
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            let key_bytes = key.value();

            // Stop when we're past the prefix
            if !key_bytes.starts_with(prefix) {
                break;
            }

            results.push((key_bytes.to_vec(), value.value().to_vec()));
        }

        Ok(results)
    }

    /// Every entry of a table
    pub(crate) fn scan(&self, table: RecordTable) -> Result<ScanResults, StoreError> {
        self.scan_prefix(table, &[])
    }

    pub fn session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.get_record(SESSIONS, id.as_bytes())
    }

    pub fn message(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError> {
        self.get_record(MESSAGES, &id.to_key())
    }

    pub fn task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.get_record(TASKS, id.as_bytes())
    }

    /// Transactions of a task in index order
    pub fn transactions(&self, task_id: &TaskId) -> Result<Vec<TransactionRecord>, StoreError> {
        self.scan_prefix(TRANSACTIONS, task_id.as_bytes())?
            .into_iter()
            .map(|(_, value)| Ok(postcard::from_bytes(&value)?))
            .collect()
    }

    pub fn blob_handle(&self, key: &ContentKey) -> Result<Option<BlobHandle>, StoreError> {
        self.get_record(BLOB_HANDLES, key.as_bytes())
    }

    pub fn blob_handles(&self) -> Result<Vec<BlobHandle>, StoreError> {
        self.scan(BLOB_HANDLES)?
            .into_iter()
            .map(|(_, value)| Ok(postcard::from_bytes(&value)?))
            .collect()
    }

    pub(crate) fn inline_blob(&self, key: &ContentKey) -> Result<Option<Vec<u8>>, StoreError> {
        self.get(INLINE_BLOBS, key.as_bytes())
    }

    /// Row counts and byte totals as of the last commit
    pub fn sizes(&self) -> Result<StoreSizes, StoreError> {
        let read_txn = self.db.begin_read()?;
        let mut sizes = StoreSizes::default();

        let (rows, bytes) = table_totals(&read_txn, SESSIONS)?;
        sizes.session_count = rows;
        sizes.records_size += bytes;
        let (rows, bytes) = table_totals(&read_txn, MESSAGES)?;
        sizes.message_count = rows;
        sizes.records_size += bytes;
        let (rows, bytes) = table_totals(&read_txn, TASKS)?;
        sizes.task_count = rows;
        sizes.records_size += bytes;
        let (_, bytes) = table_totals(&read_txn, TRANSACTIONS)?;
        sizes.records_size += bytes;

        let handles = read_txn.open_table(BLOB_HANDLES)?;
        for entry in handles.iter()? {
            let (_, value) = entry?;
            let handle: BlobHandle = postcard::from_bytes(value.value())?;
            sizes.blob_count += 1;
            sizes.blobs_size += handle.size;
            sizes.blobs_decompressed_size += handle.decompressed_size;
        }

        Ok(sizes)
    }

    /// Copy every row of every table into `target`
    #[instrument(skip(self, target))]
    pub fn copy_into(&self, target: &RecordStore) -> Result<(), StoreError> {
        let read_txn = self.db.begin_read()?;
        let write_txn = target.db.begin_write()?;
        let mut rows = 0usize;
        for definition in ALL_TABLES {
            let source = read_txn.open_table(definition)?;
            let mut destination = write_txn.open_table(definition)?;
            for entry in source.iter()? {
                let (key, value) = entry?;
                destination.insert(key.value(), value.value())?;
                rows += 1;
            }
        }
        write_txn.commit()?;
        debug!(rows, "Copied record store");
        Ok(())
    }

    /// Rewrite the database file to drop space left by deletions
    ///
    /// Only possible while this is the sole handle to the database.
    pub fn compact(&mut self) -> Result<bool, StoreError> {
        match Arc::get_mut(&mut self.db) {
            Some(db) => Ok(db.compact()?),
            None => {
                debug!("Skipping compaction, database is shared");
                Ok(false)
            }
        }
    }
}
