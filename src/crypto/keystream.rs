use std::fmt;

use aes::Aes128;
use ctr::cipher::generic_array::GenericArray;
use ctr::cipher::{KeyIvInit, StreamCipher};
use rand::{CryptoRng, RngCore};
use zeroize::Zeroizing;

use super::{CipherError, CommutativeKey, KeyId, Message, Nonce, NONCE_SIZE};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

const SECRET_SIZE: usize = 16;

/// AES-128 key applied as a CTR-mode keystream
///
/// XOR commutes, so layers can be removed in any order as long as each layer's nonce is known.
/// Nonces travel inside the [`Message`].
pub struct KeystreamKey {
    secret: Zeroizing<[u8; SECRET_SIZE]>,
    id: KeyId,
}

impl KeystreamKey {
    fn from_secret(secret: [u8; SECRET_SIZE]) -> Self {
        Self {
            id: KeyId::digest(&secret),
            secret: Zeroizing::new(secret),
        }
    }

    fn apply_keystream(&self, nonce: &Nonce, bytes: &mut [u8]) {
        let mut cipher = Aes128Ctr::new(
            GenericArray::from_slice(&self.secret[..]),
            GenericArray::from_slice(nonce),
        );
        cipher.apply_keystream(bytes);
    }
}

impl CommutativeKey for KeystreamKey {
    fn generate<R: RngCore + CryptoRng + ?Sized>(rng: &mut R) -> Self {
        let mut secret = [0u8; SECRET_SIZE];
        rng.fill_bytes(&mut secret);
        Self::from_secret(secret)
    }

    fn id(&self) -> KeyId {
        self.id
    }

    fn encrypt<'m, R: RngCore + CryptoRng + ?Sized>(
        &self,
        msg: &'m mut Message,
        rng: &mut R,
    ) -> Result<&'m mut Message, CipherError> {
        if msg.nonces.contains_key(&self.id) {
            return Err(CipherError::AlreadyEncrypted(self.id));
        }
        let mut nonce = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut nonce);
        self.apply_keystream(&nonce, &mut msg.bytes);
        msg.nonces.insert(self.id, nonce);
        Ok(msg)
    }

    fn decrypt<'m>(&self, msg: &'m mut Message) -> Result<&'m mut Message, CipherError> {
        let nonce = msg
            .nonces
            .remove(&self.id)
            .ok_or(CipherError::NotEncrypted(self.id))?;
        self.apply_keystream(&nonce, &mut msg.bytes);
        Ok(msg)
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.secret.to_vec()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, CipherError> {
        let secret: [u8; SECRET_SIZE] = bytes
            .try_into()
            .map_err(|_| CipherError::MalformedKey("keystream secret must be 16 bytes long"))?;
        Ok(Self::from_secret(secret))
    }
}

impl fmt::Debug for KeystreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeystreamKey").field("id", &self.id).finish()
    }
}
