//! Size and age bound eviction
//!
//! A sweep runs three independent steps on one batch: expire old
//! sessions and messages, trim the oldest messages when the store is over
//! its size limit, and release the oldest task bodies when blobs are over
//! their share of the limit. A failing step is logged and the next one
//! still runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::blobs::BlobStore;
use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::structured::{Deleted, RecordWriter};

/// Budgets enforced by a sweep
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepConfig {
    /// Total size budget in bytes
    pub size_limit: u64,
    /// Share of `size_limit` available to blobs
    pub blob_ratio: f64,
    /// Fraction of a budget kept when trimming
    pub trim_ratio: f64,
    pub max_age: chrono::Duration,
}

impl SweepConfig {
    pub fn from_store_config(config: &StoreConfig) -> Self {
        Self {
            size_limit: config.size_limit,
            blob_ratio: config.blob_ratio,
            trim_ratio: config.trim_ratio,
            max_age: chrono::Duration::from_std(config.max_age).unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Bytes blobs may occupy before the blob step trims them
    pub fn blob_size_limit(&self) -> u64 {
        (self.size_limit as f64 * self.blob_ratio).round() as u64
    }

    /// Bytes the blob step trims down to
    pub fn blob_target(&self) -> u64 {
        (self.blob_size_limit() as f64 * self.trim_ratio).round() as u64
    }
}

/// What a sweep removed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired_sessions: usize,
    pub expired_messages: usize,
    pub trimmed_messages: usize,
    pub removed_tasks: usize,
    /// Tasks whose bodies were dropped to bring blobs under budget
    pub stripped_tasks: usize,
    /// Stored blob bytes released
    pub freed_blob_bytes: u64,
    pub records_size: u64,
    pub blobs_size: u64,
    /// Steps that failed, by name
    pub failed_steps: Vec<String>,
    pub swept_at_millis: i64,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.failed_steps.is_empty()
    }

    fn record_deleted(&mut self, deleted: &Deleted) {
        self.removed_tasks += deleted.tasks;
    }
}

/// Runs sweeps against the writer's open batch
#[derive(Debug, Clone)]
pub struct Sweeper {
    config: SweepConfig,
    blobs: BlobStore,
}

impl Sweeper {
    pub fn new(config: SweepConfig, blobs: BlobStore) -> Self {
        Self { config, blobs }
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Run every step once
    #[instrument(skip(self, writer), fields(size_limit = self.config.size_limit))]
    pub fn run(&self, writer: &mut RecordWriter, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport {
            swept_at_millis: now.timestamp_millis(),
            ..Default::default()
        };

        if let Err(e) = self.expire(writer, now, &mut report) {
            warn!(error = %e, "Age expiration failed");
            report.failed_steps.push("expire".to_string());
        }
        if let Err(e) = self.trim_records(writer, &mut report) {
            warn!(error = %e, "Record trimming failed");
            report.failed_steps.push("trim_records".to_string());
        }
        if let Err(e) = self.trim_blobs(writer, &mut report) {
            warn!(error = %e, "Blob trimming failed");
            report.failed_steps.push("trim_blobs".to_string());
        }

        match (writer.records_size(), writer.blobs_size()) {
            (Ok(records), Ok(blobs)) => {
                report.records_size = records;
                report.blobs_size = blobs;
            }
            (Err(e), _) | (_, Err(e)) => warn!(error = %e, "Could not measure store after sweep"),
        }

        info!(
            expired_sessions = report.expired_sessions,
            expired_messages = report.expired_messages,
            trimmed_messages = report.trimmed_messages,
            stripped_tasks = report.stripped_tasks,
            freed_blob_bytes = report.freed_blob_bytes,
            records_size = report.records_size,
            blobs_size = report.blobs_size,
            "Sweep complete"
        );
        report
    }

    fn unlink_all(&self, writer: &mut RecordWriter, deleted: &Deleted, report: &mut SweepReport) -> Result<(), StoreError> {
        for key in &deleted.blob_refs {
            report.freed_blob_bytes += self.blobs.unlink(writer, key)?;
        }
        report.record_deleted(deleted);
        Ok(())
    }

    /// Remove sessions and messages created at or before `now - max_age`
    fn expire(&self, writer: &mut RecordWriter, now: DateTime<Utc>, report: &mut SweepReport) -> Result<(), StoreError> {
        let cutoff = now
            .checked_sub_signed(self.config.max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
            .timestamp_millis();

        let sessions = writer.delete_sessions_where(|s| s.created_at_millis <= cutoff)?;
        self.unlink_all(writer, &sessions, report)?;
        report.expired_sessions = sessions.sessions;

        // Messages of long running sessions
        let messages = writer.delete_messages_where(|m| m.created_at_millis <= cutoff)?;
        self.unlink_all(writer, &messages, report)?;
        report.expired_messages = sessions.messages + messages.messages;

        debug!(
            sessions = report.expired_sessions,
            messages = report.expired_messages,
            "Expired old records"
        );
        Ok(())
    }

    /// Keep the newest `trim_ratio` of messages when over the size limit
    fn trim_records(&self, writer: &mut RecordWriter, report: &mut SweepReport) -> Result<(), StoreError> {
        let total = writer.records_size()? + writer.blobs_size()?;
        if total <= self.config.size_limit {
            return Ok(());
        }

        let mut created: Vec<i64> = writer.messages()?.iter().map(|m| m.created_at_millis).collect();
        created.sort_unstable_by(|a, b| b.cmp(a));
        let index = (created.len() as f64 * self.config.trim_ratio).floor() as usize;
        let Some(&cutoff) = created.get(index) else {
            return Ok(());
        };

        let deleted = writer.delete_messages_where(|m| m.created_at_millis < cutoff)?;
        self.unlink_all(writer, &deleted, report)?;
        report.trimmed_messages = deleted.messages;

        debug!(total, cutoff, trimmed = deleted.messages, "Trimmed records over size limit");
        Ok(())
    }

    /// Release the bodies of the oldest tasks while blobs are over budget
    fn trim_blobs(&self, writer: &mut RecordWriter, report: &mut SweepReport) -> Result<(), StoreError> {
        let mut current = writer.blobs_size()?;
        if current <= self.config.blob_size_limit() {
            return Ok(());
        }
        let target = self.config.blob_target();

        let mut tasks = writer.tasks()?;
        tasks.retain(|t| t.has_bodies());
        tasks.sort_by_key(|t| t.created_at_millis);

        for task in tasks {
            if current <= target {
                break;
            }
            for key in task.blob_refs() {
                let freed = self.blobs.unlink(writer, &key)?;
                current = current.saturating_sub(freed);
                report.freed_blob_bytes += freed;
            }
            writer.update_task(&task.task_id, |t| {
                t.request_body = None;
                t.response_body = None;
            })?;
            report.stripped_tasks += 1;
        }

        debug!(blobs_size = current, target, "Trimmed blobs over budget");
        Ok(())
    }
}
