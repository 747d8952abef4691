use std::fmt;

use rand::seq::SliceRandom;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::crypto::Message;

/// Size of card plaintext in bytes
///
/// Layout: 7 bytes of random salt followed by the rank byte. The top bit of the salt is always
/// set, so plaintext never has leading zeros and is never a trivial fixed point of modular
/// exponentiation (`0` or `1`).
pub const CARD_SIZE: usize = 8;

/// Sequence of independently encrypted cards circulated between parties
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deck {
    cards: Vec<Message>,
}

impl Deck {
    /// Number of cards
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    pub fn cards(&self) -> &[Message] {
        &self.cards
    }

    pub fn cards_mut(&mut self) -> &mut [Message] {
        &mut self.cards
    }

    pub fn into_cards(self) -> Vec<Message> {
        self.cards
    }

    /// Builds a plaintext deck of cards ranked `0..n`
    pub(crate) fn fresh<R: RngCore + CryptoRng>(n: u16, rng: &mut R) -> Option<Self> {
        let cards = (0..n)
            .map(|rank| u8::try_from(rank).ok().map(|rank| seal(rank, rng)))
            .collect::<Option<Vec<_>>>()?;
        Some(Self { cards })
    }

    pub(crate) fn shuffle<R: RngCore + CryptoRng>(&mut self, rng: &mut R) {
        self.cards.shuffle(rng)
    }
}

impl From<Vec<Message>> for Deck {
    fn from(cards: Vec<Message>) -> Self {
        Self { cards }
    }
}

impl fmt::Debug for Deck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let layers = self.cards.first().map(Message::layer_count).unwrap_or(0);
        write!(f, "Deck({} cards, {} layers)", self.cards.len(), layers)
    }
}

/// Wraps the rank into card plaintext
pub(crate) fn seal<R: RngCore>(rank: u8, rng: &mut R) -> Message {
    let mut bytes = [0u8; CARD_SIZE];
    rng.fill_bytes(&mut bytes[..CARD_SIZE - 1]);
    bytes[0] |= 0x80;
    bytes[CARD_SIZE - 1] = rank;
    Message::new(bytes.to_vec())
}

/// Checks that ranks are `0..ranks.len()` in some order
pub(crate) fn is_full_set(ranks: &[u8]) -> bool {
    let mut sorted = ranks.to_vec();
    sorted.sort_unstable();
    sorted.iter().copied().eq((0..=u8::MAX).take(ranks.len()))
}

/// Extracts the rank from fully decrypted card
pub(crate) fn open(card: &Message) -> Option<u8> {
    let bytes = card.bytes();
    if !card.is_plaintext() || bytes.len() != CARD_SIZE || bytes[0] & 0x80 == 0 {
        return None;
    }
    Some(bytes[CARD_SIZE - 1])
}
