//! Manifest and info records of a store document

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sonar_core::{AppInfo, DeviceInfo, ModelError};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;

/// Schema version of a store document
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    /// Version written by this build
    pub const CURRENT: Version = Version::new(1, 0, 0);

    /// Oldest archive version this build can read
    pub const MINIMUM_SUPPORTED: Version = Version::new(1, 0, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ModelError::InvalidVersion(s.to_string());
        let mut parts = s.trim().split('.');
        let mut next = || -> Result<u32, ModelError> {
            parts.next().ok_or_else(invalid)?.parse().map_err(|_| invalid())
        };
        let version = Version::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Contents of `manifest.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub store_id: Uuid,
    pub version: Version,
    pub created_date: DateTime<Utc>,
    pub last_sweep_date: Option<DateTime<Utc>>,
}

impl Manifest {
    /// A manifest for a brand new store
    pub fn new(created_date: DateTime<Utc>) -> Self {
        Self {
            store_id: Uuid::new_v4(),
            version: Version::CURRENT,
            created_date,
            last_sweep_date: None,
        }
    }

    /// Read a manifest, `None` if the file does not exist
    pub async fn load(path: &Path) -> Result<Option<Self>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the manifest atomically
    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        write_json(path, self).await?;
        debug!(store_id = %self.store_id, "Saved manifest");
        Ok(())
    }
}

/// Summary of a store, also written as `info.json` into archives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreInfo {
    pub store_id: Uuid,
    pub store_version: Version,
    pub creation_date: DateTime<Utc>,
    pub modified_date: DateTime<Utc>,
    pub archived_date: Option<DateTime<Utc>>,
    /// Messages that are not network task summaries
    pub message_count: u64,
    pub task_count: u64,
    pub blob_count: u64,
    /// Bytes the store occupies on disk
    pub total_store_size: u64,
    pub blobs_size: u64,
    pub blobs_decompressed_size: u64,
    pub app_info: AppInfo,
    pub device_info: DeviceInfo,
}

impl StoreInfo {
    pub async fn load(path: &Path) -> Result<Option<Self>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), StoreError> {
        write_json(path, self).await
    }
}

/// Pretty-print `value` to a temp file and rename it over `path`
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(value)?;
    let temp_path = path.with_extension("json.tmp");
    tokio::fs::write(&temp_path, json).await?;
    tokio::fs::rename(&temp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_version_parse_and_order() {
        let version: Version = "2.10.3".parse().unwrap();
        assert_eq!(version, Version::new(2, 10, 3));
        assert_eq!(version.to_string(), "2.10.3");
        assert!(Version::new(1, 2, 0) > Version::new(1, 1, 9));
        assert!("1.0".parse::<Version>().is_err());
        assert!("1.0.0.0".parse::<Version>().is_err());
        assert!("a.b.c".parse::<Version>().is_err());
    }

    #[test]
    fn test_manifest_json_shape() {
        let manifest = Manifest::new(Utc::now());
        let json = serde_json::to_value(&manifest).unwrap();
        assert_eq!(json["version"], "1.0.0");
        assert!(json.get("storeId").is_some());
        assert!(json.get("createdDate").is_some());
        assert!(json["lastSweepDate"].is_null());
    }

    #[tokio::test]
    async fn test_manifest_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        assert!(Manifest::load(&path).await.unwrap().is_none());

        let manifest = Manifest::new(Utc::now());
        manifest.save(&path).await.unwrap();
        assert_eq!(Manifest::load(&path).await.unwrap(), Some(manifest));
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("manifest.json");
        tokio::fs::write(&path, b"{ not json").await.unwrap();
        assert!(Manifest::load(&path).await.is_err());
    }
}
