//! Ordered, filtered reads over the record tables

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use sonar_core::SessionId;

use super::records::{MessageRecord, SessionRecord, TaskRecord};
use super::tables::{MESSAGES, RecordStore, RecordTable, SESSIONS, TASKS};
use crate::error::StoreError;

/// A record kind that can be listed with a [`Query`]
pub trait Record: DeserializeOwned {
    /// Table holding records of this kind
    const TABLE: RecordTable;

    fn created_at_millis(&self) -> i64;

    fn session_id(&self) -> SessionId;
}

impl Record for SessionRecord {
    const TABLE: RecordTable = SESSIONS;

    fn created_at_millis(&self) -> i64 {
        self.created_at_millis
    }

    fn session_id(&self) -> SessionId {
        self.id
    }
}

impl Record for MessageRecord {
    const TABLE: RecordTable = MESSAGES;

    fn created_at_millis(&self) -> i64 {
        self.created_at_millis
    }

    fn session_id(&self) -> SessionId {
        self.session_id
    }
}

impl Record for TaskRecord {
    const TABLE: RecordTable = TASKS;

    fn created_at_millis(&self) -> i64 {
        self.created_at_millis
    }

    fn session_id(&self) -> SessionId {
        self.session_id
    }
}

/// Direction of the creation-time ordering
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

type Predicate<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

/// Filter, ordering and limit for listing records
///
/// Records are ordered by creation time. Records created in the same
/// millisecond keep their insertion order.
pub struct Query<R> {
    session: Option<SessionId>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    filter: Option<Predicate<R>>,
    order: SortOrder,
    limit: Option<usize>,
}

impl<R> Default for Query<R> {
    fn default() -> Self {
        Self {
            session: None,
            since: None,
            until: None,
            filter: None,
            order: SortOrder::Ascending,
            limit: None,
        }
    }
}

impl<R> Clone for Query<R> {
    fn clone(&self) -> Self {
        Self {
            session: self.session,
            since: self.since,
            until: self.until,
            filter: self.filter.clone(),
            order: self.order,
            limit: self.limit,
        }
    }
}

impl<R> fmt::Debug for Query<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("session", &self.session)
            .field("since", &self.since)
            .field("until", &self.until)
            .field("filter", &self.filter.as_ref().map(|_| ".."))
            .field("order", &self.order)
            .field("limit", &self.limit)
            .finish()
    }
}

impl<R: Record> Query<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only records of one session
    pub fn session(mut self, session: SessionId) -> Self {
        self.session = Some(session);
        self
    }

    /// Only records created at or after `since`
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Only records created before `until`
    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    /// Only records matching `predicate`
    pub fn filter(mut self, predicate: impl Fn(&R) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(predicate));
        self
    }

    pub fn descending(mut self) -> Self {
        self.order = SortOrder::Descending;
        self
    }

    pub fn order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `record` passes every filter of this query
    pub fn matches(&self, record: &R) -> bool {
        let created = record.created_at_millis();
        if self.session.is_some_and(|s| s != record.session_id()) {
            return false;
        }
        if self.since.is_some_and(|since| created < since.timestamp_millis()) {
            return false;
        }
        if self.until.is_some_and(|until| created >= until.timestamp_millis()) {
            return false;
        }
        self.filter.as_ref().is_none_or(|filter| filter(record))
    }

    /// Order and truncate already filtered records
    pub(crate) fn finish(&self, mut records: Vec<R>) -> Vec<R> {
        // Stable, so equal timestamps stay in key order
        records.sort_by_key(|r| r.created_at_millis());
        if self.order == SortOrder::Descending {
            records.reverse();
        }
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
        records
    }
}

impl RecordStore {
    /// List records of one kind as of the last commit
    pub fn query<R: Record>(&self, query: &Query<R>) -> Result<Vec<R>, StoreError> {
        let mut records = Vec::new();
        for (_, value) in self.scan(R::TABLE)? {
            let record: R = postcard::from_bytes(&value)?;
            if query.matches(&record) {
                records.push(record);
            }
        }
        Ok(query.finish(records))
    }
}
