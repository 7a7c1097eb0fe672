//! Store configuration
//!
//! [`StoreConfig`] holds the size and age budgets, write batching, blob
//! policy and the injected collaborators. [`OpenOptions`] selects how a
//! store is opened.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Duration;

use sonar_core::{
    Clock, Event, HostMetadata, MetadataProvider, RedactionPolicy, SystemClock,
};

/// How a store is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenOptions(u8);

impl OpenOptions {
    /// Create the store if it does not exist
    pub const CREATE: Self = Self(1 << 0);
    /// Run the sweep shortly after opening and periodically afterwards
    pub const SWEEP: Self = Self(1 << 1);
    /// Apply and flush every mutation before the call returns
    pub const SYNCHRONOUS: Self = Self(1 << 2);
    /// Reject mutations
    pub const READONLY: Self = Self(1 << 3);
    /// Keep everything in memory, nothing touches disk
    pub const IN_MEMORY: Self = Self(1 << 4);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self::CREATE | Self::SWEEP
    }
}

impl BitOr for OpenOptions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for OpenOptions {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Image bodies larger than `min_size` are replaced by a thumbnail no
/// larger than `max_dimension` on either side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThumbnailPolicy {
    pub enabled: bool,
    pub min_size: usize,
    pub max_dimension: u32,
}

impl Default for ThumbnailPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size: 5000,
            max_dimension: 256,
        }
    }
}

impl ThumbnailPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Hook run on every event after redaction
///
/// Returning `None` vetoes the event: it is neither persisted nor
/// republished.
#[derive(Clone)]
pub struct EventFilter(Arc<dyn Fn(Event) -> Option<Event> + Send + Sync>);

impl EventFilter {
    pub fn new(filter: impl Fn(Event) -> Option<Event> + Send + Sync + 'static) -> Self {
        Self(Arc::new(filter))
    }

    pub fn apply(&self, event: Event) -> Option<Event> {
        (self.0)(event)
    }
}

impl fmt::Debug for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventFilter(..)")
    }
}

/// Configuration for an event store
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Total size budget in bytes
    pub size_limit: u64,
    /// Share of `size_limit` available to blobs
    pub blob_ratio: f64,
    /// Fraction of a budget kept when trimming
    pub trim_ratio: f64,
    /// Interval between scheduled sweeps
    pub sweep_interval: Duration,
    /// Delay before the first sweep after opening
    pub initial_sweep_delay: Duration,
    /// Records older than this are expired by the sweep
    pub max_age: Duration,
    /// Debounce interval for flushing buffered writes
    pub save_interval: Duration,
    pub blob_compression: bool,
    /// Bodies larger than this are not stored
    pub body_size_limit: usize,
    /// Blobs up to this size are stored inside the structured store
    pub inline_limit: usize,
    pub thumbnails: ThumbnailPolicy,
    pub redaction: RedactionPolicy,
    pub event_filter: Option<EventFilter>,
    pub clock: Arc<dyn Clock>,
    pub metadata: Arc<dyn MetadataProvider>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            size_limit: 256_000_000,
            blob_ratio: 0.7,
            trim_ratio: 0.7,
            sweep_interval: Duration::from_secs(60 * 60),
            initial_sweep_delay: Duration::from_secs(15),
            max_age: Duration::from_secs(14 * 24 * 60 * 60),
            save_interval: Duration::from_millis(300),
            blob_compression: true,
            body_size_limit: 8 * 1024 * 1024,
            inline_limit: 16 * 1024,
            thumbnails: ThumbnailPolicy::default(),
            redaction: RedactionPolicy::default(),
            event_filter: None,
            clock: Arc::new(SystemClock),
            metadata: Arc::new(HostMetadata::default()),
        }
    }
}

impl StoreConfig {
    pub fn with_size_limit(mut self, bytes: u64) -> Self {
        self.size_limit = bytes;
        self
    }

    pub fn with_blob_ratio(mut self, ratio: f64) -> Self {
        self.blob_ratio = ratio;
        self
    }

    pub fn with_trim_ratio(mut self, ratio: f64) -> Self {
        self.trim_ratio = ratio;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_initial_sweep_delay(mut self, delay: Duration) -> Self {
        self.initial_sweep_delay = delay;
        self
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    pub fn with_blob_compression(mut self, enabled: bool) -> Self {
        self.blob_compression = enabled;
        self
    }

    pub fn with_body_size_limit(mut self, bytes: usize) -> Self {
        self.body_size_limit = bytes;
        self
    }

    pub fn with_inline_limit(mut self, bytes: usize) -> Self {
        self.inline_limit = bytes;
        self
    }

    pub fn with_thumbnails(mut self, policy: ThumbnailPolicy) -> Self {
        self.thumbnails = policy;
        self
    }

    pub fn with_redaction(mut self, policy: RedactionPolicy) -> Self {
        self.redaction = policy;
        self
    }

    pub fn with_event_filter(
        mut self,
        filter: impl Fn(Event) -> Option<Event> + Send + Sync + 'static,
    ) -> Self {
        self.event_filter = Some(EventFilter::new(filter));
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metadata(mut self, metadata: Arc<dyn MetadataProvider>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Byte budget for blobs
    pub fn blob_size_limit(&self) -> u64 {
        (self.size_limit as f64 * self.blob_ratio).round() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.size_limit, 256_000_000);
        assert_eq!(config.save_interval, Duration::from_millis(300));
        assert_eq!(config.inline_limit, 16384);
        assert_eq!(config.body_size_limit, 8 * 1024 * 1024);
        assert_eq!(config.max_age, Duration::from_secs(1_209_600));
        assert_eq!(config.blob_size_limit(), 179_200_000);
    }

    #[test]
    fn test_open_options_bitset() {
        let mut options = OpenOptions::CREATE | OpenOptions::SYNCHRONOUS;
        assert!(options.contains(OpenOptions::CREATE));
        assert!(!options.contains(OpenOptions::SWEEP));

        options |= OpenOptions::SWEEP;
        assert!(options.contains(OpenOptions::SWEEP | OpenOptions::CREATE));

        options.remove(OpenOptions::CREATE);
        assert!(!options.contains(OpenOptions::CREATE));
        assert!(OpenOptions::default().contains(OpenOptions::CREATE));
    }

    #[test]
    fn test_event_filter_veto() {
        let config = StoreConfig::default().with_event_filter(|_| None);
        let filter = config.event_filter.unwrap();
        let event = sonar_core::Event::NetworkTaskProgressUpdated(
            sonar_core::NetworkTaskProgressUpdated {
                task_id: sonar_core::TaskId::generate(),
                url: None,
                completed_unit_count: 0,
                total_unit_count: 0,
            },
        );
        assert!(filter.apply(event).is_none());
    }
}
