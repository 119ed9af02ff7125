use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Length of a Curve25519 public key on the wire
pub const PUBLIC_KEY_LEN: usize = 32;

/// Long-term Curve25519 keypair used as node identity and for circuit handshakes
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: X25519PublicKey,
}

impl KeyPair {
    /// Generate a new random keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create a keypair from a secret key
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the secret key bytes
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        *self.public.as_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.public_bytes())
    }

    /// Raw X25519 agreement between our secret and a peer's public key
    pub fn diffie_hellman(&self, their_public: &PublicKey) -> [u8; 32] {
        *self
            .secret
            .diffie_hellman(&X25519PublicKey::from(their_public.0))
            .as_bytes()
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &hex::encode(self.public_bytes()))
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// A peer's Curve25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a key of unknown length, as found on the wire
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyPairError> {
        let array: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyPairError::InvalidPublicKey)?;
        Ok(Self(array))
    }

    pub fn from_hex(s: &str) -> Result<Self, KeyPairError> {
        let bytes = hex::decode(s).map_err(|_| KeyPairError::InvalidPublicKey)?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}...)", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Errors related to keypair operations
#[derive(Debug, thiserror::Error)]
pub enum KeyPairError {
    #[error("Invalid secret key")]
    InvalidSecretKey,

    #[error("Invalid public key")]
    InvalidPublicKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_from_bytes() {
        let keypair1 = KeyPair::generate();
        let secret = keypair1.secret_bytes();

        let keypair2 = KeyPair::from_secret_bytes(&secret);
        assert_eq!(keypair1.public_bytes(), keypair2.public_bytes());
    }

    #[test]
    fn test_diffie_hellman_agrees() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();

        assert_eq!(
            alice.diffie_hellman(&bob.public_key()),
            bob.diffie_hellman(&alice.public_key())
        );
    }

    #[test]
    fn test_public_key_from_slice_checks_length() {
        assert!(PublicKey::from_slice(&[1u8; 31]).is_err());
        assert!(PublicKey::from_slice(&[1u8; 33]).is_err());

        let key = PublicKey::from_slice(&[9u8; 32]).unwrap();
        assert_eq!(PublicKey::from_hex(&key.to_hex()).unwrap(), key);
    }
}
