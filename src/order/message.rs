use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::CommutativeKey;

use super::Deck;

/// Body of every message exchanged by [OrderConsensus](super::OrderConsensus)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// Re-shuffled deck with one more encryption layer
    Shuffled(Deck),
    /// Disclosed key secret
    Revealed(RevealedKey),
}

impl ProtocolMessage {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::Shuffled(_) => "shuffled deck",
            Self::Revealed(_) => "revealed key",
        }
    }
}

/// Encoded key secret, see [CommutativeKey::to_bytes]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealedKey(Vec<u8>);

impl RevealedKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn from_key<K: CommutativeKey>(key: &K) -> Self {
        Self(key.to_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for RevealedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevealedKey({} bytes)", self.0.len())
    }
}
