use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};

use crate::crypto::{CommutativeKey, Message};

/// Size of a draw in bytes
pub const DRAW_SIZE: usize = 32;

/// Digest of a party's decrypted card and all disclosed secrets, places the party in the order
pub type Draw = [u8; DRAW_SIZE];

/// Agreed turn order: party indexes, first mover first
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GameplayOrder(Vec<u16>);

impl GameplayOrder {
    /// Sorts parties by their draws, `draws[i]` belongs to party `i + 1`
    ///
    /// Equal draws are ordered by party index.
    pub fn from_draws<D: Ord>(draws: &[D]) -> Self {
        let mut parties = (1u16..).zip(draws).collect::<Vec<_>>();
        parties.sort_by(|(a, draw_a), (b, draw_b)| draw_a.cmp(draw_b).then(a.cmp(b)));
        Self(parties.into_iter().map(|(party, _)| party).collect())
    }

    /// Party indexes in playing order
    pub fn parties(&self) -> &[u16] {
        &self.0
    }

    /// Party that moves first
    pub fn first(&self) -> Option<u16> {
        self.0.first().copied()
    }

    /// Zero-based position of the party in the playing order
    pub fn position_of(&self, party_i: u16) -> Option<usize> {
        self.0.iter().position(|&p| p == party_i)
    }

    pub fn into_vec(self) -> Vec<u16> {
        self.0
    }
}

/// Computes a draw for every decrypted card
///
/// Draw of a card is `BLAKE2b-256(len(s_1) || s_1 || ... || len(s_n) || s_n || card)` where
/// `s_i` is the secret of party `i` and lengths are u64 big-endian. `keys` must be in party index
/// order.
pub(crate) fn draws<K: CommutativeKey>(cards: &[Message], keys: &[K]) -> Vec<Draw> {
    let mut secrets = Blake2b::<U32>::new();
    for key in keys {
        let secret = key.to_bytes();
        secrets.update((secret.len() as u64).to_be_bytes());
        secrets.update(&secret);
    }

    cards
        .iter()
        .map(|card| {
            let mut hasher = secrets.clone();
            hasher.update(card.bytes());
            let mut draw = [0u8; DRAW_SIZE];
            draw.copy_from_slice(&hasher.finalize());
            draw
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use crate::crypto::KeystreamKey;

    use super::*;

    #[test]
    fn parties_are_sorted_by_draw() {
        let order = GameplayOrder::from_draws(&[30, 10, 20]);
        assert_eq!(order.parties(), &[2, 3, 1]);
        assert_eq!(order.first(), Some(2));
        assert_eq!(order.position_of(1), Some(2));
    }

    #[test]
    fn equal_draws_keep_index_order() {
        assert_eq!(GameplayOrder::from_draws(&[5, 5, 1]).into_vec(), vec![3, 1, 2]);
    }

    #[test]
    fn draws_depend_on_every_secret() {
        let mut rng = ChaCha20Rng::seed_from_u64(4);
        let keys = (0..3)
            .map(|_| KeystreamKey::generate(&mut rng))
            .collect::<Vec<_>>();
        let cards = vec![Message::new(vec![0x80, 1]), Message::new(vec![0x80, 2])];

        let original = draws(&cards, &keys);
        assert_ne!(original[0], original[1]);
        for i in 0..keys.len() {
            let mut replaced = (0..3)
                .map(|j| KeystreamKey::from_bytes(&keys[j].to_bytes()).unwrap())
                .collect::<Vec<_>>();
            replaced[i] = KeystreamKey::generate(&mut rng);
            assert_ne!(draws(&cards, &replaced), original);
        }
    }
}
