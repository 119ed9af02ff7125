pub mod config;
pub mod error;
pub mod types;

pub use config::{protocol, BootstrapPeer, ConfigError, NodeConfig, TunnelSettings};
pub use error::{Result, TunnelError};
pub use types::ByteCount;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub const INFO_HASH_LEN: usize = 20;

/// Domain separator mixed into the anonymised info hash.
const ANONYMOUS_DOWNLOAD_TAG: &[u8] = b"tribler anonymous download";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid info hash length: expected {expected}, got {actual}")]
    InvalidInfoHash { expected: usize, actual: usize },
    #[error("invalid info hash hex: {0}")]
    InvalidInfoHashHex(String),
}

/// Opaque 20-byte resource identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InfoHash([u8; INFO_HASH_LEN]);

impl InfoHash {
    pub fn from_bytes(bytes: [u8; INFO_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DomainError> {
        if bytes.len() != INFO_HASH_LEN {
            return Err(DomainError::InvalidInfoHash {
                expected: INFO_HASH_LEN,
                actual: bytes.len(),
            });
        }

        let mut array = [0u8; INFO_HASH_LEN];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; INFO_HASH_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(hex_str: &str) -> Result<Self, DomainError> {
        let decoded = hex::decode(hex_str)
            .map_err(|err| DomainError::InvalidInfoHashHex(err.to_string()))?;
        Self::from_slice(&decoded)
    }

    /// The identifier used on the tunnel and hidden-service plane, and for
    /// DHT lookups and announces of anonymous downloads.
    ///
    /// `SHA1("tribler anonymous download" ∥ hex(info_hash))`
    pub fn anonymized(&self) -> InfoHash {
        let mut hasher = Sha1::new();
        hasher.update(ANONYMOUS_DOWNLOAD_TAG);
        hasher.update(self.to_hex().as_bytes());
        InfoHash(hasher.finalize().into())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; INFO_HASH_LEN]> for InfoHash {
    fn from(value: [u8; INFO_HASH_LEN]) -> Self {
        Self::from_bytes(value)
    }
}

impl TryFrom<&[u8]> for InfoHash {
    type Error = DomainError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::from_slice(value)
    }
}

impl FromStr for InfoHash {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_hash_rejects_wrong_length() {
        let err = InfoHash::try_from(&[1u8; 16][..]).unwrap_err();
        assert!(matches!(err, DomainError::InvalidInfoHash { .. }));
    }

    #[test]
    fn info_hash_parses_hex() {
        let hex_id = "ab".repeat(INFO_HASH_LEN);
        let parsed = InfoHash::from_hex(&hex_id).expect("should parse valid hex");
        assert_eq!(parsed.to_string(), hex_id);
    }

    #[test]
    fn info_hash_rejects_bad_hex() {
        let err = InfoHash::from_hex("not-hex").unwrap_err();
        assert!(matches!(err, DomainError::InvalidInfoHashHex(_)));
    }

    #[test]
    fn anonymized_hash_matches_manual_digest() {
        let real = InfoHash::from([0x11; INFO_HASH_LEN]);

        let mut hasher = Sha1::new();
        hasher.update(b"tribler anonymous download");
        hasher.update("11".repeat(INFO_HASH_LEN).as_bytes());
        let expected: [u8; INFO_HASH_LEN] = hasher.finalize().into();

        assert_eq!(real.anonymized().as_bytes(), &expected);
        assert_ne!(real.anonymized(), real);
    }

    #[test]
    fn info_hash_serializes_transparently() {
        let hash = InfoHash::from([7u8; INFO_HASH_LEN]);
        let encoded = serde_json::to_string(&hash).unwrap();
        let decoded: InfoHash = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, hash);
    }
}
