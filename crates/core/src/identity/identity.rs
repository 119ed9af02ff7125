use super::{KeyPair, KeyPairError, NodeId, PublicKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Complete identity for a node in the overlay
///
/// Contains the keypair and the derived NodeId
#[derive(Clone)]
pub struct Identity {
    keypair: KeyPair,
    node_id: NodeId,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self::from_keypair(KeyPair::generate())
    }

    pub fn from_keypair(keypair: KeyPair) -> Self {
        let node_id = NodeId::from_public_key(&keypair.public_key());
        Self { keypair, node_id }
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Export to a saveable format
    pub fn to_exportable(&self) -> ExportableIdentity {
        ExportableIdentity {
            secret_key: hex::encode(self.keypair.secret_bytes()),
        }
    }

    /// Import from a saved format
    pub fn from_exportable(exportable: &ExportableIdentity) -> Result<Self, KeyPairError> {
        let bytes = hex::decode(&exportable.secret_key).map_err(|_| KeyPairError::InvalidSecretKey)?;
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyPairError::InvalidSecretKey)?;
        Ok(Self::from_keypair(KeyPair::from_secret_bytes(&secret)))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("node_id", &self.node_id)
            .field("public_key", &self.public_key())
            .finish()
    }
}

/// Exportable/serializable format for saving identity to disk
#[derive(Serialize, Deserialize)]
pub struct ExportableIdentity {
    secret_key: String,
}

impl ExportableIdentity {
    /// Save to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_json_roundtrip() {
        let identity = Identity::generate();
        let json = identity.to_exportable().to_json().unwrap();
        let restored = ExportableIdentity::from_json(&json).unwrap();

        let identity2 = Identity::from_exportable(&restored).unwrap();
        assert_eq!(identity.node_id(), identity2.node_id());
        assert_eq!(identity.public_key(), identity2.public_key());
    }

    #[test]
    fn test_identity_rejects_bad_secret() {
        let exportable = ExportableIdentity::from_json(r#"{"secret_key":"zz"}"#).unwrap();
        assert!(Identity::from_exportable(&exportable).is_err());
    }
}
