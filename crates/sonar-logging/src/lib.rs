//! Console, rolling file and JSONL logging for Sonar
//!
//! This crate wires `tracing` output for applications that embed a Sonar
//! event store, and can capture the application's own log events into
//! that store.
//!
//! # Features
//!
//! - **JSONL Output**: Structured JSON lines format for log aggregation (default)
//! - **Pretty Console**: Human-readable output for development
//! - **File Rotation**: Daily/hourly log rotation via tracing-appender
//! - **Store Capture**: [`StoreLayer`] records events as store messages
//!
//! # Quick Start
//!
//! ```ignore
//! use sonar_logging::{LogConfig, SonarSubscriberBuilder};
//!
//! // JSONL to console
//! SonarSubscriberBuilder::new().init()?;
//!
//! // Pretty console output, with every event also kept in the store
//! let _guard = SonarSubscriberBuilder::new()
//!     .with_config(LogConfig::development())
//!     .with_store(store.clone())
//!     .init()?;
//! ```

pub mod config;
pub mod layers;

pub use config::{
    ConsoleConfig, FileConfig, FilterConfig, JsonlConfig, LogConfig, RotationStrategy,
    StoreCaptureConfig,
};
pub use layers::{IGNORED_TARGETS, StoreLayer, jsonl_file_layer, map_level};

use std::fs::{self, File};
use std::str::FromStr;

use sonar_storage::EventStore;
use thiserror::Error;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};

/// Errors raised while installing the subscriber
#[derive(Debug, Error)]
pub enum LogError {
    #[error("Failed to open log file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid store capture level: {0}")]
    InvalidLevel(String),

    #[error("A global subscriber is already set: {0}")]
    AlreadyInitialized(String),
}

/// Builder for configuring and initializing the Sonar logging subscriber
///
/// By default, console output uses JSONL format. Use `LogConfig::development()`
/// for human-readable pretty output during development.
pub struct SonarSubscriberBuilder {
    config: LogConfig,
    store: Option<EventStore>,
}

impl SonarSubscriberBuilder {
    /// Create a new subscriber builder with default configuration
    pub fn new() -> Self {
        Self {
            config: LogConfig::default(),
            store: None,
        }
    }

    /// Use a specific configuration
    pub fn with_config(mut self, config: LogConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the default log level
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.config.default_level = level.into();
        self
    }

    /// Enable or disable console output
    pub fn with_console(mut self, enabled: bool) -> Self {
        self.config.console.enabled = enabled;
        self
    }

    /// Configure file output
    pub fn with_file_output(mut self, config: FileConfig) -> Self {
        self.config.file = Some(config);
        self
    }

    /// Record events into `store`
    pub fn with_store(mut self, store: EventStore) -> Self {
        self.store = Some(store);
        self
    }

    fn store_layer(&self) -> Result<Option<StoreLayer>, LogError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let level = tracing::Level::from_str(&self.config.store.level)
            .map_err(|_| LogError::InvalidLevel(self.config.store.level.clone()))?;
        Ok(Some(
            StoreLayer::new(store.clone())
                .with_max_level(level)
                .with_capture_fields(self.config.store.capture_fields),
        ))
    }

    /// Install the subscriber globally
    ///
    /// Returns a guard that must be kept alive for the duration of the
    /// program when file output is enabled.
    pub fn init(self) -> Result<Option<WorkerGuard>, LogError> {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.config.filter_directives()));

        let store_layer = self.store_layer()?;
        let (file_writer, guard) = match &self.config.file {
            Some(file_config) => {
                let (writer, guard) = create_file_writer(file_config)?;
                (Some(writer), Some(guard))
            }
            None => (None, None),
        };

        let console = &self.config.console;
        let jsonl = &self.config.jsonl;

        // Separate optional layers for pretty and JSONL console to satisfy the type system
        let pretty_console = (console.enabled && console.pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .with_ansi(console.ansi)
                .with_target(true)
        });
        let jsonl_console = (console.enabled && !console.pretty).then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(jsonl.include_spans)
                .flatten_event(jsonl.flatten_events)
                .with_file(jsonl.include_location)
                .with_line_number(jsonl.include_location)
        });
        let file_layer = file_writer.map(|writer| jsonl_file_layer(writer, jsonl));

        Registry::default()
            .with(env_filter)
            .with(pretty_console)
            .with(jsonl_console)
            .with(file_layer)
            .with(store_layer)
            .try_init()
            .map_err(|e| LogError::AlreadyInitialized(e.to_string()))?;

        Ok(guard)
    }
}

impl Default for SonarSubscriberBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Create the file writer; `Never` truncates a single file, the others append
fn create_file_writer(file_config: &FileConfig) -> Result<(NonBlocking, WorkerGuard), LogError> {
    let rotation = match file_config.rotation {
        RotationStrategy::Never => {
            fs::create_dir_all(&file_config.directory)?;
            let file_path = file_config.directory.join(format!("{}.log", file_config.prefix));
            let file = File::create(&file_path)?;
            return Ok(tracing_appender::non_blocking(file));
        }
        RotationStrategy::Daily => Rotation::DAILY,
        RotationStrategy::Hourly => Rotation::HOURLY,
    };
    let appender = RollingFileAppender::new(rotation, &file_config.directory, &file_config.prefix);
    Ok(tracing_appender::non_blocking(appender))
}
