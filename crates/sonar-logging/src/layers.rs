//! Custom tracing layers for Sonar
//!
//! [`StoreLayer`] records `tracing` events into an [`EventStore`] as log
//! messages. [`jsonl_file_layer`] configures the JSON formatter for file
//! output.

use std::collections::BTreeMap;
use std::fmt;

use sonar_core::Level;
use sonar_storage::{EventStore, StoreMessage};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use crate::config::JsonlConfig;

/// Targets whose events are never recorded, so the store does not
/// capture its own diagnostics
pub const IGNORED_TARGETS: &[&str] = &["sonar_storage", "redb"];

/// Map a `tracing` level onto a message level
pub fn map_level(level: &tracing::Level) -> Level {
    match *level {
        tracing::Level::TRACE => Level::Trace,
        tracing::Level::DEBUG => Level::Debug,
        tracing::Level::INFO => Level::Info,
        tracing::Level::WARN => Level::Warning,
        tracing::Level::ERROR => Level::Error,
    }
}

fn is_ignored(target: &str) -> bool {
    IGNORED_TARGETS.iter().any(|ignored| {
        target == *ignored
            || target
                .strip_prefix(ignored)
                .is_some_and(|rest| rest.starts_with("::"))
    })
}

/// Layer that stores every event as a message in the current session
///
/// The label is the event target; the `message` field becomes the text
/// and, when enabled, the remaining fields become message metadata.
pub struct StoreLayer {
    store: EventStore,
    max_level: tracing::Level,
    capture_fields: bool,
}

impl StoreLayer {
    /// Record events at `INFO` and above
    pub fn new(store: EventStore) -> Self {
        Self {
            store,
            max_level: tracing::Level::INFO,
            capture_fields: true,
        }
    }

    /// Most verbose level recorded
    pub fn with_max_level(mut self, level: tracing::Level) -> Self {
        self.max_level = level;
        self
    }

    pub fn with_capture_fields(mut self, enabled: bool) -> Self {
        self.capture_fields = enabled;
        self
    }
}

impl<S> Layer<S> for StoreLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        // More verbose levels compare greater
        if *metadata.level() > self.max_level || is_ignored(metadata.target()) {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let mut message = StoreMessage::new(
            map_level(metadata.level()),
            metadata.target(),
            visitor.message,
        )
        .with_location(
            metadata.file().unwrap_or_default(),
            metadata.module_path().unwrap_or_default(),
            metadata.line().unwrap_or_default(),
        );
        if self.capture_fields && !visitor.fields.is_empty() {
            message = message.with_metadata(visitor.fields);
        }
        self.store.store_message(message);
    }
}

/// Collects the message and the other fields of an event
#[derive(Debug, Default)]
struct MessageVisitor {
    message: String,
    fields: BTreeMap<String, String>,
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields.insert(field.name().to_string(), format!("{value:?}"));
        }
    }
}

/// Create a JSONL formatting layer for file output
///
/// Span, location and thread details follow `config`.
pub fn jsonl_file_layer<S, W>(
    writer: W,
    config: &JsonlConfig,
) -> tracing_subscriber::fmt::Layer<
    S,
    tracing_subscriber::fmt::format::JsonFields,
    tracing_subscriber::fmt::format::Format<tracing_subscriber::fmt::format::Json>,
    W,
>
where
    S: Subscriber + for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
    W: for<'writer> tracing_subscriber::fmt::MakeWriter<'writer> + 'static,
{
    tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(config.include_spans)
        .flatten_event(config.flatten_events)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_thread_ids(config.include_thread_info)
        .with_thread_names(config.include_thread_info)
        .with_writer(writer)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use sonar_storage::{Query, SortOrder, StoreConfig};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;

    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(map_level(&tracing::Level::TRACE), Level::Trace);
        assert_eq!(map_level(&tracing::Level::WARN), Level::Warning);
        assert_eq!(map_level(&tracing::Level::ERROR), Level::Error);
    }

    #[test]
    fn test_ignored_targets() {
        assert!(is_ignored("sonar_storage"));
        assert!(is_ignored("sonar_storage::worker"));
        assert!(is_ignored("redb::tree_store"));
        assert!(!is_ignored("sonar_storage_ext"));
        assert!(!is_ignored("checkout"));
    }

    #[tokio::test]
    async fn test_store_layer_records_events() {
        let store = sonar_storage::EventStore::in_memory(StoreConfig::default())
            .await
            .unwrap();
        let subscriber = Registry::default().with(StoreLayer::new(store.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "checkout", order_id = 42, "Order placed");
            tracing::warn!(target: "checkout", "Payment slow");
            tracing::debug!(target: "checkout", "Too verbose");
            tracing::error!(target: "sonar_storage::worker", "Own diagnostics");
        });
        store.flush().await.unwrap();

        let messages = store.messages(&Query::new().order(SortOrder::Ascending)).unwrap();
        assert_eq!(messages.len(), 2);

        assert_eq!(messages[0].text, "Order placed");
        assert_eq!(messages[0].label, "checkout");
        assert_eq!(messages[0].level, Level::Info);
        let fields = messages[0].metadata.as_ref().unwrap();
        assert_eq!(fields.get("order_id").map(String::as_str), Some("42"));
        assert!(messages[0].line > 0);

        assert_eq!(messages[1].level, Level::Warning);
        assert!(messages[1].metadata.is_none());

        store.close().await.unwrap();
    }

    #[test]
    fn test_jsonl_layer_writes_one_object_per_line() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("events.jsonl");
        let file = std::fs::File::create(&path).unwrap();
        let subscriber = Registry::default().with(jsonl_file_layer(Mutex::new(file), &JsonlConfig::default()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(attempt = 1, "first");
            tracing::info!(attempt = 2, "second");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["message"], "first");
        assert_eq!(lines[1]["attempt"], 2);
        assert!(lines[0]["filename"].is_string());
    }

    #[test]
    fn test_jsonl_layer_follows_config() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("events.jsonl");
        let file = std::fs::File::create(&path).unwrap();
        let config = JsonlConfig {
            flatten_events: false,
            include_location: false,
            ..JsonlConfig::default()
        };
        let subscriber = Registry::default().with(jsonl_file_layer(Mutex::new(file), &config));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(attempt = 3, "nested");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        let line: serde_json::Value = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(line["fields"]["message"], "nested");
        assert_eq!(line["fields"]["attempt"], 3);
        assert!(line.get("filename").is_none());
    }
}
