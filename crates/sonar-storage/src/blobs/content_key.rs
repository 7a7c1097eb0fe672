//! Content keys

use std::fmt;

use serde::{Deserialize, Serialize};

/// BLAKE3 digest identifying a stored payload
///
/// Two payloads share a key exactly when their (processed) bytes are
/// identical, which is what makes deduplication work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContentKey(pub [u8; 32]);

impl ContentKey {
    /// Compute the key of some data
    pub fn from_data(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create from a slice (must be 32 bytes)
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(slice).ok().map(Self)
    }

    /// Parse the 64-character hex form used for blob file names
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        Self::from_slice(&bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get a short hash for display (first 8 chars)
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let a = ContentKey::from_data(b"hello world");
        let b = ContentKey::from_data(b"hello world");
        let c = ContentKey::from_data(b"hello world!");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hex_round_trip() {
        let key = ContentKey::from_data(b"payload");
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ContentKey::from_hex(&hex), Some(key));
        assert_eq!(ContentKey::from_hex("abc"), None);
        assert_eq!(key.short(), &hex[..8]);
    }
}
