//! Structured record storage
//!
//! Sessions, messages, tasks and transactions live in a single redb
//! database next to the blob handle table, so one write transaction can
//! change records and blob reference counts together.

mod query;
mod records;
mod tables;
mod writer;

pub use query::{Query, Record, SortOrder};
pub use records::{
    MessageId, MessageRecord, SessionRecord, TaskProgress, TaskRecord, TransactionRecord,
};
pub use tables::{RecordStore, StoreSizes};
pub use writer::{Deleted, MISSING_URL, NETWORK_LABEL, NewTask, RecordWriter};
