//! Mutation side of the record store
//!
//! A [`RecordWriter`] wraps one open write transaction. The store's
//! single writer keeps at most one of these alive, applies every queued
//! mutation to it and commits it when the debounce timer fires.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use redb::{ReadableTable, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sonar_core::{Level, NetworkRequest, SessionId, TaskId, TaskState, TaskType};
use tracing::{debug, warn};

use super::records::{
    MessageId, MessageRecord, SessionRecord, TaskRecord, TransactionRecord,
};
use super::tables::{
    ALL_TABLES, BLOB_HANDLES, INLINE_BLOBS, MESSAGES, META, NEXT_MESSAGE_ID, RECORD_TABLES,
    RecordTable, SESSIONS, TASKS, TRANSACTIONS,
};
use crate::blobs::{BlobHandle, ContentKey};
use crate::error::StoreError;

/// Label given to task summary messages when the producer supplies none
pub const NETWORK_LABEL: &str = "network";

/// Summary text of a task without a URL
pub const MISSING_URL: &str = "–";

/// Fields needed to create a task the first time it is referenced
#[derive(Debug, Clone)]
pub struct NewTask {
    pub task_id: TaskId,
    pub session_id: SessionId,
    pub task_type: TaskType,
    pub created_at: DateTime<Utc>,
    pub label: Option<String>,
    pub request: NetworkRequest,
}

/// What a batch delete removed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deleted {
    pub sessions: usize,
    pub messages: usize,
    pub tasks: usize,
    /// Blob references held by deleted tasks; the caller must unlink each
    pub blob_refs: Vec<ContentKey>,
}

impl Deleted {
    fn absorb(&mut self, other: Deleted) {
        self.sessions += other.sessions;
        self.messages += other.messages;
        self.tasks += other.tasks;
        self.blob_refs.extend(other.blob_refs);
    }
}

/// An open batch of mutations against the record store
pub struct RecordWriter {
    txn: WriteTransaction,
    pending_removals: Vec<PathBuf>,
    mutations: usize,
}

impl RecordWriter {
    pub(crate) fn new(txn: WriteTransaction) -> Self {
        Self {
            txn,
            pending_removals: Vec::new(),
            mutations: 0,
        }
    }

    /// Number of mutating calls applied to this batch
    pub fn mutation_count(&self) -> usize {
        self.mutations
    }

    fn put<T: Serialize>(&mut self, table: RecordTable, key: &[u8], value: &T) -> Result<(), StoreError> {
        let bytes = postcard::to_allocvec(value).map_err(|e| StoreError::serialization(e.to_string()))?;
        self.put_raw(table, key, &bytes)
    }

    fn put_raw(&mut self, table: RecordTable, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        {
            let mut table = self.txn.open_table(table)?;
            table.insert(key, value)?;
        }
        self.mutations += 1;
        Ok(())
    }

    fn get_raw(&self, table: RecordTable, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let table = self.txn.open_table(table)?;
        let value = table.get(key)?.map(|v| v.value().to_vec());
        Ok(value)
    }

    fn get<T: DeserializeOwned>(&self, table: RecordTable, key: &[u8]) -> Result<Option<T>, StoreError> {
        match self.get_raw(table, key)? {
            Some(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn remove(&mut self, table: RecordTable, key: &[u8]) -> Result<bool, StoreError> {
        let removed = {
            let mut table = self.txn.open_table(table)?;
            table.remove(key)?.is_some()
        };
        if removed {
            self.mutations += 1;
        }
        Ok(removed)
    }

    fn keys_with_prefix(&self, table: RecordTable, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let table = self.txn.open_table(table)?;
        let mut keys = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, _) = entry?;
            if !key.value().starts_with(prefix) {
                break;
            }
            keys.push(key.value().to_vec());
        }
        Ok(keys)
    }

    fn all<T: DeserializeOwned>(&self, table: RecordTable) -> Result<Vec<T>, StoreError> {
        let table = self.txn.open_table(table)?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            records.push(postcard::from_bytes(value.value())?);
        }
        Ok(records)
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Insert a session unless one with the same id exists
    pub fn create_session(&mut self, session: SessionRecord) -> Result<SessionRecord, StoreError> {
        if let Some(existing) = self.session(&session.id)? {
            return Ok(existing);
        }
        self.put(SESSIONS, session.id.as_bytes(), &session)?;
        debug!(session = %session.id, "Created session");
        Ok(session)
    }

    /// Make sure a session row exists for records that reference it
    pub fn ensure_session(&mut self, id: SessionId, created_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.create_session(SessionRecord::new(id, created_at))?;
        Ok(())
    }

    pub fn session(&self, id: &SessionId) -> Result<Option<SessionRecord>, StoreError> {
        self.get(SESSIONS, id.as_bytes())
    }

    pub fn sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        self.all(SESSIONS)
    }

    // ========================================================================
    // Messages
    // ========================================================================

    fn next_message_id(&mut self) -> Result<MessageId, StoreError> {
        let next = match self.get_raw(META, NEXT_MESSAGE_ID)? {
            Some(bytes) => <[u8; 8]>::try_from(bytes.as_slice())
                .map(u64::from_be_bytes)
                .map_err(|_| StoreError::deserialization("corrupt message counter"))?,
            None => 1,
        };
        self.put_raw(META, NEXT_MESSAGE_ID, &(next + 1).to_be_bytes())?;
        Ok(MessageId(next))
    }

    /// Insert a new message (id [`MessageId::NEW`]) or replace an existing one
    pub fn upsert_message(&mut self, mut message: MessageRecord) -> Result<MessageId, StoreError> {
        if message.id == MessageId::NEW {
            message.id = self.next_message_id()?;
        }
        self.put(MESSAGES, &message.id.to_key(), &message)?;
        Ok(message.id)
    }

    pub fn message(&self, id: MessageId) -> Result<Option<MessageRecord>, StoreError> {
        self.get(MESSAGES, &id.to_key())
    }

    pub fn messages(&self) -> Result<Vec<MessageRecord>, StoreError> {
        self.all(MESSAGES)
    }

    /// Apply `mutate` to a stored message; `false` if it does not exist
    pub fn update_message(
        &mut self,
        id: MessageId,
        mutate: impl FnOnce(&mut MessageRecord),
    ) -> Result<bool, StoreError> {
        let Some(mut message) = self.message(id)? else {
            return Ok(false);
        };
        mutate(&mut message);
        self.put(MESSAGES, &id.to_key(), &message)?;
        Ok(true)
    }

    /// Set or, with `None`, toggle the pinned flag of a message
    pub fn set_pinned(&mut self, id: MessageId, pinned: Option<bool>) -> Result<bool, StoreError> {
        self.update_message(id, |message| {
            message.pinned = pinned.unwrap_or(!message.pinned);
        })
    }

    /// Unpin every message, returning how many changed
    pub fn clear_pins(&mut self) -> Result<usize, StoreError> {
        let pinned: Vec<MessageId> = self
            .messages()?
            .into_iter()
            .filter(|m| m.pinned)
            .map(|m| m.id)
            .collect();
        for id in &pinned {
            self.set_pinned(*id, Some(false))?;
        }
        Ok(pinned.len())
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Look a task up by id and create it, with its summary message, only
    /// if absent
    ///
    /// Returns the task and whether it was created by this call.
    pub fn find_or_create_task(&mut self, new: NewTask) -> Result<(TaskRecord, bool), StoreError> {
        if let Some(task) = self.task(&new.task_id)? {
            return Ok((task, false));
        }

        let label = new.label.unwrap_or_else(|| NETWORK_LABEL.to_string());
        let url = new.request.url.clone();
        let mut message = MessageRecord::new(
            new.session_id,
            Level::Debug,
            label.clone(),
            url.clone().unwrap_or_else(|| MISSING_URL.to_string()),
            new.created_at,
        );
        message.task_id = Some(new.task_id);
        let message_id = self.upsert_message(message)?;

        let task = TaskRecord {
            task_id: new.task_id,
            session_id: new.session_id,
            message_id,
            created_at_millis: new.created_at.timestamp_millis(),
            task_type: new.task_type,
            state: TaskState::Pending,
            label,
            host: new.request.host(),
            url,
            http_method: new.request.http_method.clone(),
            status_code: None,
            error_code: None,
            error_domain: None,
            response_content_type: None,
            is_from_cache: false,
            original_request: new.request,
            current_request: None,
            response: None,
            error: None,
            request_body: None,
            response_body: None,
            request_body_size: -1,
            response_body_size: -1,
            start_date_millis: None,
            duration: None,
            redirect_count: 0,
            transaction_count: 0,
            progress: None,
            metadata: BTreeMap::new(),
        };
        self.put(TASKS, task.task_id.as_bytes(), &task)?;
        debug!(task = %task.task_id.short(), "Created task");
        Ok((task, true))
    }

    pub fn task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.get(TASKS, id.as_bytes())
    }

    pub fn tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.all(TASKS)
    }

    /// Apply `mutate` to a stored task
    ///
    /// An unknown id is logged and reported as `None`, not as an error.
    pub fn update_task(
        &mut self,
        id: &TaskId,
        mutate: impl FnOnce(&mut TaskRecord),
    ) -> Result<Option<TaskRecord>, StoreError> {
        let Some(mut task) = self.task(id)? else {
            debug!(task = %id.short(), "Update for unknown task ignored");
            return Ok(None);
        };
        mutate(&mut task);
        self.put(TASKS, id.as_bytes(), &task)?;
        Ok(Some(task))
    }

    /// Store one transaction; existing rows are never overwritten
    pub fn put_transaction(&mut self, transaction: &TransactionRecord) -> Result<bool, StoreError> {
        let key = transaction.key();
        if self.get_raw(TRANSACTIONS, &key)?.is_some() {
            return Ok(false);
        }
        self.put(TRANSACTIONS, &key, transaction)?;
        Ok(true)
    }

    /// Remove a task and its transactions, returning the removed task
    fn take_task(&mut self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let Some(task) = self.task(id)? else {
            return Ok(None);
        };
        self.remove(TASKS, id.as_bytes())?;
        for key in self.keys_with_prefix(TRANSACTIONS, id.as_bytes())? {
            self.remove(TRANSACTIONS, &key)?;
        }
        Ok(Some(task))
    }

    // ========================================================================
    // Batch deletes
    // ========================================================================

    /// Delete every message matching `predicate`, along with the task each
    /// task-summary message belongs to
    pub fn delete_messages_where(
        &mut self,
        predicate: impl Fn(&MessageRecord) -> bool,
    ) -> Result<Deleted, StoreError> {
        let doomed: Vec<MessageRecord> = self
            .messages()?
            .into_iter()
            .filter(|m| predicate(m))
            .collect();

        let mut deleted = Deleted::default();
        for message in doomed {
            self.remove(MESSAGES, &message.id.to_key())?;
            deleted.messages += 1;

            if let Some(task_id) = message.task_id {
                if let Some(task) = self.take_task(&task_id)? {
                    deleted.tasks += 1;
                    deleted.blob_refs.extend(task.blob_refs());
                }
            }
        }
        Ok(deleted)
    }

    /// Delete every session matching `predicate` together with all of its
    /// messages and tasks
    pub fn delete_sessions_where(
        &mut self,
        predicate: impl Fn(&SessionRecord) -> bool,
    ) -> Result<Deleted, StoreError> {
        let doomed: HashSet<SessionId> = self
            .sessions()?
            .into_iter()
            .filter(|s| predicate(s))
            .map(|s| s.id)
            .collect();
        if doomed.is_empty() {
            return Ok(Deleted::default());
        }

        let mut deleted = self.delete_messages_where(|m| doomed.contains(&m.session_id))?;

        // Tasks whose summary message went missing
        let orphans: Vec<TaskId> = self
            .tasks()?
            .into_iter()
            .filter(|t| doomed.contains(&t.session_id))
            .map(|t| t.task_id)
            .collect();
        let mut orphaned = Deleted::default();
        for task_id in orphans {
            if let Some(task) = self.take_task(&task_id)? {
                warn!(task = %task_id.short(), "Removed task without summary message");
                orphaned.tasks += 1;
                orphaned.blob_refs.extend(task.blob_refs());
            }
        }
        deleted.absorb(orphaned);

        for id in &doomed {
            self.remove(SESSIONS, id.as_bytes())?;
        }
        deleted.sessions = doomed.len();
        Ok(deleted)
    }

    /// Remove every row of every table
    pub fn clear(&mut self) -> Result<(), StoreError> {
        for table in ALL_TABLES {
            for key in self.keys_with_prefix(table, &[])? {
                self.remove(table, &key)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Blob handles
    // ========================================================================

    pub fn blob_handle(&self, key: &ContentKey) -> Result<Option<BlobHandle>, StoreError> {
        self.get(BLOB_HANDLES, key.as_bytes())
    }

    pub fn blob_handles(&self) -> Result<Vec<BlobHandle>, StoreError> {
        self.all(BLOB_HANDLES)
    }

    pub fn put_blob_handle(&mut self, handle: &BlobHandle) -> Result<(), StoreError> {
        self.put(BLOB_HANDLES, handle.key.as_bytes(), handle)
    }

    pub fn remove_blob_handle(&mut self, key: &ContentKey) -> Result<bool, StoreError> {
        self.remove(BLOB_HANDLES, key.as_bytes())
    }

    pub fn put_inline_blob(&mut self, key: &ContentKey, bytes: &[u8]) -> Result<(), StoreError> {
        self.put_raw(INLINE_BLOBS, key.as_bytes(), bytes)
    }

    pub fn remove_inline_blob(&mut self, key: &ContentKey) -> Result<bool, StoreError> {
        self.remove(INLINE_BLOBS, key.as_bytes())
    }

    /// Remove `path` once this batch commits
    pub fn defer_removal(&mut self, path: PathBuf) {
        self.pending_removals.push(path);
    }

    /// Keep a file that was scheduled for removal earlier in this batch
    pub fn cancel_removal(&mut self, path: &Path) {
        self.pending_removals.retain(|pending| pending != path);
    }

    // ========================================================================
    // Sizes
    // ========================================================================

    /// Encoded bytes of sessions, messages, tasks and transactions,
    /// including uncommitted changes
    pub fn records_size(&self) -> Result<u64, StoreError> {
        let mut total = 0u64;
        for definition in RECORD_TABLES {
            let table = self.txn.open_table(definition)?;
            for entry in table.iter()? {
                let (key, value) = entry?;
                total += (key.value().len() + value.value().len()) as u64;
            }
        }
        Ok(total)
    }

    /// Stored bytes of all blobs, including uncommitted changes
    pub fn blobs_size(&self) -> Result<u64, StoreError> {
        Ok(self.blob_handles()?.iter().map(|h| h.size).sum())
    }

    // ========================================================================
    // Completion
    // ========================================================================

    /// Commit the batch, returning the files that may now be removed
    pub fn commit(self) -> Result<Vec<PathBuf>, StoreError> {
        self.txn.commit()?;
        Ok(self.pending_removals)
    }

    /// Discard the batch
    pub fn abort(self) -> Result<(), StoreError> {
        self.txn.abort()?;
        Ok(())
    }
}
