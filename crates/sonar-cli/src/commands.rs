//! Subcommand implementations
//!
//! Every command opens the store, does its work and closes it again.
//! Output goes to the writer passed in so commands can be tested.

use std::io::Write;
use std::path::Path;

use anyhow::Context;
use sonar_core::Level;
use sonar_storage::{
    EventStore, ExportFormat, ExportOptions, MessageRecord, OpenOptions, Query, StoreConfig,
};

use crate::cli::Command;

/// Run one subcommand
pub async fn run(command: Command, out: &mut impl Write) -> anyhow::Result<()> {
    match command {
        Command::Info { path } => {
            let store = open(&path, OpenOptions::READONLY).await?;
            let info = store.info().await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&info)?)?;
            store.close().await?;
        }

        Command::Export {
            path,
            target,
            archive,
            sessions,
            min_level,
        } => {
            let store = open(&path, OpenOptions::READONLY).await?;
            let mut options = ExportOptions::new();
            if archive {
                options = options.with_format(ExportFormat::Archive);
            }
            if !sessions.is_empty() {
                options = options.with_sessions(sessions);
            }
            if let Some(min_level) = min_level {
                options = options.with_predicate(move |m| m.level >= min_level);
            }

            let info = store
                .export(&target, options)
                .await
                .with_context(|| format!("Failed to export to {}", target.display()))?;
            writeln!(
                out,
                "Exported {} messages, {} tasks and {} blobs to {}",
                info.message_count,
                info.task_count,
                info.blob_count,
                target.display()
            )?;
            store.close().await?;
        }

        Command::Sweep { path } => {
            let store = open(&path, OpenOptions::empty()).await?;
            let report = store.sweep().await?;
            writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
            store.close().await?;
        }

        Command::Messages { path, limit, level } => {
            let store = open(&path, OpenOptions::READONLY).await?;
            let min_level = level.unwrap_or(Level::Trace);
            let query = Query::<MessageRecord>::new()
                .descending()
                .limit(limit)
                .filter(move |m| m.level >= min_level);
            for message in store.messages(&query)? {
                writeln!(
                    out,
                    "{} {:<8} {:<16} {}",
                    message.created_at().format("%Y-%m-%d %H:%M:%S%.3f"),
                    message.level,
                    message.label,
                    message.text
                )?;
            }
            store.close().await?;
        }

        Command::Tasks { path, limit } => {
            let store = open(&path, OpenOptions::READONLY).await?;
            for task in store.tasks(&Query::new().descending().limit(limit))? {
                let status = task
                    .status_code
                    .map(|code| code.to_string())
                    .unwrap_or_else(|| "-".to_string());
                writeln!(
                    out,
                    "{} {:<8} {:>3} {:<6} {}",
                    task.created_at().format("%Y-%m-%d %H:%M:%S%.3f"),
                    task.state,
                    status,
                    task.http_method.as_deref().unwrap_or("-"),
                    task.url.as_deref().unwrap_or("-")
                )?;
            }
            store.close().await?;
        }
    }

    Ok(())
}

async fn open(path: &Path, options: OpenOptions) -> anyhow::Result<EventStore> {
    EventStore::open(path, options, StoreConfig::default())
        .await
        .with_context(|| format!("Failed to open {}", path.display()))
}
