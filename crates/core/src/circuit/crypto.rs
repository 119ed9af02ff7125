use crate::identity::{KeyPair, PublicKey};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Nonce,
};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

type HmacSha256 = Hmac<Sha256>;

/// Length of the handshake authenticator
pub const AUTH_LEN: usize = 32;

/// Bytes HKDF expands the shared secret into
pub const SESSION_KEY_MATERIAL_LEN: usize = 40;

const KEY_LEN: usize = 16;
const SALT_LEN: usize = 4;
const COUNTER_LEN: usize = 8;
const TAG_LEN: usize = 16;

/// Bytes one encryption layer adds to a payload (counter + GCM tag)
pub const LAYER_OVERHEAD: usize = COUNTER_LEN + TAG_LEN;

/// Which half of a session key pair to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyDirection {
    /// Originator towards exit
    Forward,

    /// Exit towards originator
    Backward,
}

/// Ephemeral secret an originator keeps while a hop is being added
#[derive(Clone)]
pub struct DhSecret {
    secret: StaticSecret,
    public: PublicKey,
}

impl DhSecret {
    /// Fresh ephemeral keypair; `public()` is the `X` that goes on the wire
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from_bytes(*X25519PublicKey::from(&secret).as_bytes());
        Self { secret, public }
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    fn agree(&self, their_public: &PublicKey) -> [u8; 32] {
        *self
            .secret
            .diffie_hellman(&X25519PublicKey::from(*their_public.as_bytes()))
            .as_bytes()
    }

    /// Originator side of the handshake
    ///
    /// Computes `S = DH(Y, x) ∥ DH(B, x)`, checks the responder's
    /// authenticator and derives the hop's session keys.
    pub fn verify_and_derive(
        &self,
        their_ephemeral: &PublicKey,
        auth: &[u8],
        their_identity: &PublicKey,
    ) -> Result<SessionKeys, CryptoError> {
        let mut shared = [0u8; 64];
        shared[..32].copy_from_slice(&self.agree(their_ephemeral));
        shared[32..].copy_from_slice(&self.agree(their_identity));

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&shared).expect("HMAC can take key of any size");
        mac.update(their_ephemeral.as_bytes());
        mac.verify_slice(auth)
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        SessionKeys::derive(&shared)
    }
}

impl std::fmt::Debug for DhSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhSecret")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// What a responding hop sends back and keeps after a handshake
#[derive(Debug)]
pub struct DhResponse {
    /// `Y`, the responder's ephemeral public key
    pub public: PublicKey,

    /// `HMAC-SHA256(S, Y)`
    pub auth: [u8; AUTH_LEN],

    pub keys: SessionKeys,
}

/// Responder side of the handshake
///
/// Generates a fresh `(y, Y)`, computes `S = DH(X, y) ∥ DH(X, b)` with our
/// long-term secret `b`, and authenticates `Y` under `S`.
pub fn respond_to_handshake(
    their_ephemeral: &PublicKey,
    identity: &KeyPair,
) -> Result<DhResponse, CryptoError> {
    let ephemeral = DhSecret::generate();

    let mut shared = [0u8; 64];
    shared[..32].copy_from_slice(&ephemeral.agree(their_ephemeral));
    shared[32..].copy_from_slice(&identity.diffie_hellman(their_ephemeral));

    let mut mac = <HmacSha256 as Mac>::new_from_slice(&shared).expect("HMAC can take key of any size");
    mac.update(ephemeral.public.as_bytes());
    let auth: [u8; AUTH_LEN] = mac.finalize().into_bytes().into();

    Ok(DhResponse {
        public: ephemeral.public,
        auth,
        keys: SessionKeys::derive(&shared)?,
    })
}

/// One direction of a session: AES-128-GCM key, salt and explicit counter
#[derive(Clone)]
struct DirectionKey {
    cipher: Aes128Gcm,
    salt: [u8; SALT_LEN],
    /// Last counter used when sending, or last counter accepted when receiving.
    /// A party only ever does one of the two on a given direction.
    counter: u64,
}

impl DirectionKey {
    fn new(key: &[u8], salt: &[u8]) -> Result<Self, CryptoError> {
        let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
        let mut salt_bytes = [0u8; SALT_LEN];
        salt_bytes.copy_from_slice(salt);
        Ok(Self {
            cipher,
            salt: salt_bytes,
            counter: 1,
        })
    }

    fn nonce(&self, counter: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..SALT_LEN].copy_from_slice(&self.salt);
        nonce[SALT_LEN..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let counter = self
            .counter
            .checked_add(1)
            .ok_or(CryptoError::CounterExhausted)?;
        self.counter = counter;

        let nonce = self.nonce(counter);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        // aes-gcm appends the tag; the wire form puts it in front
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);
        let mut out = Vec::with_capacity(LAYER_OVERHEAD + ciphertext.len());
        out.extend_from_slice(&counter.to_be_bytes());
        out.extend_from_slice(tag);
        out.extend_from_slice(ciphertext);
        Ok(out)
    }

    fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < LAYER_OVERHEAD {
            return Err(CryptoError::Truncated);
        }

        let mut counter_bytes = [0u8; COUNTER_LEN];
        counter_bytes.copy_from_slice(&data[..COUNTER_LEN]);
        let counter = u64::from_be_bytes(counter_bytes);
        if counter <= self.counter {
            return Err(CryptoError::ReplayedCounter(counter));
        }

        let tag = &data[COUNTER_LEN..LAYER_OVERHEAD];
        let mut sealed = Vec::with_capacity(data.len() - COUNTER_LEN);
        sealed.extend_from_slice(&data[LAYER_OVERHEAD..]);
        sealed.extend_from_slice(tag);

        let nonce = self.nonce(counter);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed.as_slice())
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        self.counter = counter;
        Ok(plaintext)
    }
}

/// Session keys shared between an originator and one hop (or between the two
/// ends of a hidden-service connection)
#[derive(Clone)]
pub struct SessionKeys {
    forward: DirectionKey,
    backward: DirectionKey,
}

impl SessionKeys {
    /// Expand a handshake secret into both directions' keys
    ///
    /// Layout of the 40 HKDF-SHA256 bytes: forward key, backward key (16
    /// each), forward salt, backward salt (4 each).
    pub fn derive(shared_secret: &[u8]) -> Result<Self, CryptoError> {
        let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
        let mut okm = [0u8; SESSION_KEY_MATERIAL_LEN];
        hkdf.expand(&[], &mut okm)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        let forward_key = &okm[..KEY_LEN];
        let backward_key = &okm[KEY_LEN..2 * KEY_LEN];
        let forward_salt = &okm[2 * KEY_LEN..2 * KEY_LEN + SALT_LEN];
        let backward_salt = &okm[2 * KEY_LEN + SALT_LEN..];

        Ok(Self {
            forward: DirectionKey::new(forward_key, forward_salt)?,
            backward: DirectionKey::new(backward_key, backward_salt)?,
        })
    }

    fn half(&mut self, direction: KeyDirection) -> &mut DirectionKey {
        match direction {
            KeyDirection::Forward => &mut self.forward,
            KeyDirection::Backward => &mut self.backward,
        }
    }

    /// Add one layer; output is `counter ∥ tag ∥ ciphertext`
    pub fn encrypt(&mut self, direction: KeyDirection, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.half(direction).encrypt(plaintext)
    }

    /// Remove one layer, rejecting counters at or below the last accepted one
    pub fn decrypt(&mut self, direction: KeyDirection, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.half(direction).decrypt(data)
    }

    /// Current counter of a direction (for monitoring)
    pub fn counter(&self, direction: KeyDirection) -> u64 {
        match direction {
            KeyDirection::Forward => self.forward.counter,
            KeyDirection::Backward => self.backward.counter,
        }
    }
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKeys")
            .field("forward_counter", &self.forward.counter)
            .field("backward_counter", &self.backward.counter)
            .field("cipher", &"<Aes128Gcm>")
            .finish()
    }
}

/// Cryptographic errors
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Counter exhausted - circuit must be rebuilt")]
    CounterExhausted,

    #[error("Counter {0} already seen")]
    ReplayedCounter(u64),

    #[error("Ciphertext too short")]
    Truncated,

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("No session keys for this circuit")]
    MissingKeys,
}

impl From<CryptoError> for anontunnel_common::TunnelError {
    fn from(err: CryptoError) -> Self {
        Self::crypto(err.to_string())
    }
}
