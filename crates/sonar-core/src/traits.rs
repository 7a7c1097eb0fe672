//! Collaborator traits
//!
//! The store depends on two things it does not own: the current time and
//! a description of the host application and device. Both are injected so
//! tests can control them.
//!
//! ## Key Traits
//!
//! - [`Clock`]: Time abstraction for testability
//! - [`MetadataProvider`]: App and device information for exports

use std::fmt::Debug;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Time abstraction for testability
///
/// This trait allows tests to control time, enabling deterministic
/// testing of age-based expiration.
pub trait Clock: Send + Sync + Debug {
    /// Get the current UTC datetime
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Real clock implementation using system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.write() {
            *now += by;
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        if let Ok(mut now) = self.now.write() {
            *now = to;
        }
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        self.now.read().map(|now| *now).unwrap_or_else(|e| *e.into_inner())
    }
}

/// Information about the instrumented application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub bundle_identifier: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub build: Option<String>,
}

impl AppInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            bundle_identifier: None,
            name: Some(name.into()),
            version: Some(version.into()),
            build: None,
        }
    }

    pub fn with_build(mut self, build: impl Into<String>) -> Self {
        self.build = Some(build.into());
        self
    }

    pub fn with_bundle_identifier(mut self, id: impl Into<String>) -> Self {
        self.bundle_identifier = Some(id.into());
        self
    }
}

/// Information about the device the store was recorded on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub model: String,
    pub system_name: String,
    pub system_version: String,
}

/// Supplies app and device metadata embedded in sessions and exports
pub trait MetadataProvider: Send + Sync + Debug {
    fn app_info(&self) -> AppInfo;

    fn device_info(&self) -> DeviceInfo;
}

/// Metadata describing the current host, with app info supplied by the
/// embedding application
#[derive(Debug, Clone, Default)]
pub struct HostMetadata {
    app: AppInfo,
}

impl HostMetadata {
    pub fn new(app: AppInfo) -> Self {
        Self { app }
    }
}

impl MetadataProvider for HostMetadata {
    fn app_info(&self) -> AppInfo {
        self.app.clone()
    }

    fn device_info(&self) -> DeviceInfo {
        let name = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        DeviceInfo {
            name,
            model: std::env::consts::ARCH.to_string(),
            system_name: std::env::consts::OS.to_string(),
            system_version: std::env::consts::FAMILY.to_string(),
        }
    }
}
