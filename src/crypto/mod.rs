//! Commutative encryption
//!
//! A [`Message`] encrypted several times with different keys can be decrypted with the same keys
//! in any order. Every key that was applied and not yet removed is recorded in the message's nonce
//! map, so a key holder can always tell whether its layer is still in place
//! ([`can_decrypt`](CommutativeKey::can_decrypt)).
//!
//! Two realizations are provided:
//! * [`KeystreamKey`] XORs the message with an AES-128-CTR keystream, one random nonce per
//!   key/message pair
//! * [`SraKey`] raises the message, read as a big-endian integer, to a secret exponent modulo a
//!   fixed public prime (Shamir, Rivest and Adleman, "Mental Poker", 1981)
//!
//! ```rust
//! use fair_order::crypto::{CommutativeKey, KeystreamKey, Message};
//! # fn main() -> Result<(), fair_order::crypto::CipherError> {
//! let mut rng = rand::rngs::OsRng;
//! let (alice, bob) = (KeystreamKey::generate(&mut rng), KeystreamKey::generate(&mut rng));
//!
//! let mut msg = Message::new(b"tile".to_vec());
//! alice.encrypt(&mut msg, &mut rng)?;
//! bob.encrypt(&mut msg, &mut rng)?;
//!
//! alice.decrypt(&mut msg)?;
//! bob.decrypt(&mut msg)?;
//! assert_eq!(msg.bytes(), b"tile");
//! # Ok(()) }
//! ```

use std::collections::BTreeMap;
use std::fmt;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod keystream;
mod sra;

pub use keystream::KeystreamKey;
pub use sra::{modulus, SraKey};

/// Size of a [`KeyId`] in bytes
pub const KEY_ID_SIZE: usize = 32;
/// Size of a [`Nonce`] in bytes
pub const NONCE_SIZE: usize = 16;

/// Per-encryption nonce stored in [`Message`]
pub type Nonce = [u8; NONCE_SIZE];

/// Stable identifier of a key: BLAKE2b-256 digest of its encoded secret
///
/// Identifies a key without exposing it. During the reveal phase the identifier works as a
/// commitment: a disclosed secret must hash to the identifier observed earlier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyId([u8; KEY_ID_SIZE]);

impl KeyId {
    /// Computes the identifier of an encoded secret
    pub fn digest(secret: &[u8]) -> Self {
        let hash = Blake2b::<U32>::digest(secret);
        let mut id = [0u8; KEY_ID_SIZE];
        id.copy_from_slice(&hash);
        Self(id)
    }

    /// Raw bytes of the identifier
    pub fn as_bytes(&self) -> &[u8; KEY_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({}..)", hex::encode(&self.0[..6]))
    }
}

/// Bytes to be encrypted and/or decrypted, together with nonces of every applied key
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    bytes: Vec<u8>,
    nonces: BTreeMap<KeyId, Nonce>,
}

impl Message {
    /// Constructs a plaintext message
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            nonces: BTreeMap::new(),
        }
    }

    /// Current content: plaintext if no layers are applied, ciphertext otherwise
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Mutable access to the content
    ///
    /// Altering ciphertext makes it decrypt into garbage, it's exposed for corruption tests.
    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        &mut self.bytes
    }

    /// Takes the content out
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Identifiers of keys currently applied to the message
    pub fn layers(&self) -> impl Iterator<Item = &KeyId> + '_ {
        self.nonces.keys()
    }

    /// Number of keys currently applied to the message
    pub fn layer_count(&self) -> usize {
        self.nonces.len()
    }

    /// Indicates that no key is applied
    pub fn is_plaintext(&self) -> bool {
        self.nonces.is_empty()
    }

    /// Checks whether a key with given identifier is applied
    pub fn has_layer(&self, id: &KeyId) -> bool {
        self.nonces.contains_key(id)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("bytes", &hex::encode(&self.bytes))
            .field("layers", &self.nonces.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Key of a commutative encryption scheme
///
/// Encrypting with keys `K1..Kn` in any order and then decrypting with the same keys in any other
/// order recovers the original bytes.
///
/// Methods taking `&mut Message` never modify the message if they return an error.
pub trait CommutativeKey: Sized + Send + Sync + 'static {
    /// Generates a fresh random key
    fn generate<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Self;

    /// Identifier of the key
    fn id(&self) -> KeyId;

    /// Applies this key to the message in place
    ///
    /// Returns [`CipherError::AlreadyEncrypted`] if the key is already applied: encrypting twice
    /// with the same key is forbidden.
    fn encrypt<'m, R: RngCore + CryptoRng + ?Sized>(
        &self,
        msg: &'m mut Message,
        rng: &mut R,
    ) -> Result<&'m mut Message, CipherError>;

    /// Removes this key from the message in place
    ///
    /// Returns [`CipherError::NotEncrypted`] if the key isn't applied.
    fn decrypt<'m>(&self, msg: &'m mut Message) -> Result<&'m mut Message, CipherError>;

    /// Reports whether this key is applied to the message
    fn can_decrypt(&self, msg: &Message) -> bool {
        msg.has_layer(&self.id())
    }

    /// Checks that the message holds well-formed ciphertext for this scheme
    ///
    /// Lets a receiver reject malformed ciphertext as soon as it arrives instead of failing at
    /// decryption time.
    fn check_ciphertext(msg: &Message) -> Result<(), CipherError> {
        let _ = msg;
        Ok(())
    }

    /// Encodes the full secret
    fn to_bytes(&self) -> Vec<u8>;

    /// Decodes and validates a secret produced by [`to_bytes`](Self::to_bytes)
    fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError>;
}

/// Misuse of [`CommutativeKey`] API or malformed input
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    #[error("attempt to encrypt twice with key {0}")]
    AlreadyEncrypted(KeyId),
    #[error("attempt to decrypt before encrypt with key {0}")]
    NotEncrypted(KeyId),
    #[error("plaintext is too long")]
    InputTooLong,
    #[error("ciphertext is invalid")]
    InvalidCiphertext,
    #[error("malformed key: {0}")]
    MalformedKey(&'static str),
}
