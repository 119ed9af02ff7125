use super::PublicKey;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;

pub const NODE_ID_LEN: usize = 20;

/// Identifier of a node in the overlay
///
/// Derived from the node's public key using SHA1, so a create message can name
/// its target without repeating the full key check.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Create a NodeId from a public key
    pub fn from_public_key(public_key: &PublicKey) -> Self {
        Self(Sha1::digest(public_key.as_bytes()).into())
    }

    pub fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, NodeIdError> {
        let bytes = hex::decode(s).map_err(|_| NodeIdError::InvalidHex)?;
        let array: [u8; NODE_ID_LEN] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| NodeIdError::InvalidLength)?;
        Ok(Self(array))
    }

    /// Get a shortened display version (first 8 bytes as hex)
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({}...)", &self.short_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_hex())
    }
}

/// Errors related to NodeId operations
#[derive(Debug, thiserror::Error)]
pub enum NodeIdError {
    #[error("Invalid hexadecimal string")]
    InvalidHex,

    #[error("Invalid length (expected 20 bytes)")]
    InvalidLength,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::KeyPair;

    #[test]
    fn test_node_id_is_sha1_of_key() {
        let keypair = KeyPair::generate();
        let node_id = NodeId::from_public_key(&keypair.public_key());

        let expected: [u8; NODE_ID_LEN] = Sha1::digest(keypair.public_bytes()).into();
        assert_eq!(node_id.as_bytes(), &expected);
    }

    #[test]
    fn test_node_id_hex() {
        let keypair = KeyPair::generate();
        let node_id = NodeId::from_public_key(&keypair.public_key());

        let restored = NodeId::from_hex(&node_id.to_hex()).unwrap();
        assert_eq!(node_id, restored);
        assert!(matches!(NodeId::from_hex("abcd"), Err(NodeIdError::InvalidLength)));
    }
}
