use std::collections::BTreeSet;
use std::fmt;

use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::crypto::{CommutativeKey, KeyId};
use crate::{Msg, StateMachine};

use super::deck::{self, Deck};
use super::error::{ConfigError, ProtocolError};
use super::gameplay::{self, GameplayOrder};
use super::message::{ProtocolMessage, RevealedKey};
use super::reveal::RevealStore;
use super::{check_party_set, INITIATOR};

type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Order consensus among `n` parties
///
/// Party 1 deals a deck of `n` ranked cards. Parties `1..=n` take turns: each one shuffles the
/// deck received from the previous party, encrypts every card with a fresh key and broadcasts the
/// result. Once the deck comes back to party 1, everyone discloses its key and decrypts the deck.
/// Party `i` draws card `i - 1`; its draw is the BLAKE2b digest of the card together with every
/// disclosed secret. Parties sorted by draw form the gameplay order.
///
/// Each key is committed to (by its [KeyId]) before any secret is disclosed, so draws are fixed
/// before anyone can compute them, and a single honest party's secret makes them unpredictable.
/// Card ranks only prove that the deck went around intact: the dealer knows them and, with
/// [KeystreamKey](crate::crypto::KeystreamKey), can trace cards through shuffles by their nonces.
/// Any misbehaviour detected on the way fails the protocol naming the offender.
pub struct OrderConsensus<K, R = OsRng> {
    state: State,

    party_i: u16,
    party_n: u16,
    turn: u16,
    shuffles: u16,

    key: Option<K>,
    sent: Option<Deck>,
    deck: Option<Deck>,
    commitments: Vec<Option<KeyId>>,
    reveals: RevealStore<K>,
    early_decks: Vec<Msg<Deck>>,
    early_reveals: Vec<Msg<RevealedKey>>,
    own_echo_seen: bool,

    msgs_queue: Vec<Msg<ProtocolMessage>>,
    rng: R,
}

enum State {
    Init,
    AwaitRound,
    Reveal,
    Done(GameplayOrder),
    Failed(ProtocolError),
    Gone,
}

/// Stage of [OrderConsensus], observable for debugging
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Init,
    AwaitRound,
    Reveal,
    Done,
    Failed,
    Gone,
}

impl<K: CommutativeKey> OrderConsensus<K, OsRng> {
    /// Constructs a party with index `party_i` (1-based) out of `party_n` parties
    pub fn new(party_i: u16, party_n: u16) -> Result<Self, ConfigError> {
        Self::with_rng(party_i, party_n, OsRng)
    }
}

impl<K, R> OrderConsensus<K, R>
where
    K: CommutativeKey,
    R: RngCore + CryptoRng,
{
    /// Constructs a party drawing randomness from `rng`
    pub fn with_rng(party_i: u16, party_n: u16, rng: R) -> Result<Self, ConfigError> {
        check_party_set(party_i, party_n)?;
        Ok(Self {
            state: State::Init,
            party_i,
            party_n,
            turn: INITIATOR,
            shuffles: 0,
            key: None,
            sent: None,
            deck: None,
            commitments: vec![None; usize::from(party_n)],
            reveals: RevealStore::new(party_n),
            early_decks: vec![],
            early_reveals: vec![],
            own_echo_seen: false,
            msgs_queue: vec![],
            rng,
        })
    }

    /// Current stage
    pub fn phase(&self) -> Phase {
        match self.state {
            State::Init => Phase::Init,
            State::AwaitRound => Phase::AwaitRound,
            State::Reveal => Phase::Reveal,
            State::Done(_) => Phase::Done,
            State::Failed(_) => Phase::Failed,
            State::Gone => Phase::Gone,
        }
    }

    /// Party expected to broadcast the next deck
    pub fn turn(&self) -> u16 {
        self.turn
    }

    /// Number of accepted shuffle rounds
    pub fn completed_shuffles(&self) -> u16 {
        self.shuffles
    }

    /// Error the protocol failed with, if any
    pub fn error(&self) -> Option<&ProtocolError> {
        match &self.state {
            State::Failed(err) => Some(err),
            _ => None,
        }
    }

    fn holds_turn(&self) -> bool {
        matches!(self.state, State::AwaitRound)
            && self.turn == self.party_i
            && self.key.is_none()
            && self.deck.is_some()
    }

    fn fail_on_error<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            tracing::warn!(party = self.party_i, %err, "order consensus failed");
            self.state = State::Failed(err.clone());
        }
        result
    }

    fn handle_deck(&mut self, sender: u16, deck: Deck) -> Result<()> {
        if !matches!(self.state, State::AwaitRound) {
            return Err(ProtocolError::UnexpectedMessage {
                sender,
                kind: "shuffled deck",
                phase: self.phase(),
            });
        }
        if sender != self.turn {
            return self.buffer_deck(sender, deck);
        }
        self.accept_deck(sender, deck)?;

        if matches!(self.state, State::AwaitRound) {
            let turn = self.turn;
            if let Some(pos) = self.early_decks.iter().position(|m| m.sender == turn) {
                let msg = self.early_decks.remove(pos);
                tracing::trace!(party = self.party_i, sender = turn, "replaying buffered deck");
                return self.handle_deck(msg.sender, msg.body);
            }
        }
        Ok(())
    }

    /// Keeps a deck of a party whose turn is yet to come
    ///
    /// Messages of different senders may be reordered in transit, so the deck of party `k + 1`
    /// can arrive before the one of party `k`. Only one deck per party is kept.
    fn buffer_deck(&mut self, sender: u16, deck: Deck) -> Result<()> {
        let already_shuffled = self.commitments[usize::from(sender) - 1].is_some();
        if already_shuffled
            || sender == self.party_i
            || self.early_decks.iter().any(|m| m.sender == sender)
        {
            return Err(ProtocolError::OutOfTurn {
                sender,
                expected: self.turn,
            });
        }
        tracing::trace!(
            party = self.party_i,
            sender,
            turn = self.turn,
            "deck arrived ahead of turn"
        );
        self.early_decks.push(Msg { sender, body: deck });
        Ok(())
    }

    fn accept_deck(&mut self, sender: u16, deck: Deck) -> Result<()> {
        if deck.len() != usize::from(self.party_n) {
            return Err(ProtocolError::WrongDeckSize {
                sender,
                expected: usize::from(self.party_n),
                actual: deck.len(),
            });
        }
        if let Some(key) = &self.key {
            if !deck.cards().iter().all(|card| key.can_decrypt(card)) {
                return Err(ProtocolError::CorruptedEcho { sender });
            }
        }
        if sender == self.party_i && self.sent.take().as_ref() != Some(&deck) {
            return Err(ProtocolError::CorruptedEcho { sender });
        }
        let new_layer = self.check_layers(sender, &deck)?;
        if deck.cards().iter().any(|card| K::check_ciphertext(card).is_err()) {
            return Err(ProtocolError::InvalidCiphertext { sender });
        }

        tracing::trace!(party = self.party_i, sender, layer = %new_layer, "deck accepted");
        self.commitments[usize::from(sender) - 1] = Some(new_layer);
        self.shuffles += 1;
        self.deck = Some(deck);
        self.turn = self.turn % self.party_n + 1;

        if self.turn == INITIATOR {
            self.enter_reveal()?;
        }
        Ok(())
    }

    /// Returns the layer added by `sender`
    ///
    /// Every card must carry all layers accepted so far plus exactly one new layer, the same on
    /// every card.
    fn check_layers(&self, sender: u16, deck: &Deck) -> Result<KeyId> {
        let previous = self
            .commitments
            .iter()
            .flatten()
            .copied()
            .collect::<BTreeSet<_>>();
        let mut new_layer = None;
        for card in deck.cards() {
            if card.layer_count() != previous.len() + 1 {
                return Err(ProtocolError::MalformedLayers { sender });
            }
            let mut fresh = card.layers().filter(|id| !previous.contains(*id));
            let (Some(&id), None) = (fresh.next(), fresh.next()) else {
                return Err(ProtocolError::MalformedLayers { sender });
            };
            match new_layer {
                None => new_layer = Some(id),
                Some(expected) if expected != id => {
                    return Err(ProtocolError::MalformedLayers { sender })
                }
                Some(_) => (),
            }
        }
        new_layer.ok_or(ProtocolError::MalformedLayers { sender })
    }

    fn enter_reveal(&mut self) -> Result<()> {
        let key = self
            .key
            .take()
            .ok_or(ProtocolError::Internal("entered reveal phase without own key"))?;
        tracing::debug!(party = self.party_i, "full circle observed, revealing key");

        self.msgs_queue.push(Msg {
            sender: self.party_i,
            body: ProtocolMessage::Revealed(RevealedKey::from_key(&key)),
        });
        self.reveals
            .insert(self.party_i, key)
            .map_err(|_| ProtocolError::Internal("own key slot is already taken"))?;
        self.state = State::Reveal;

        for msg in std::mem::take(&mut self.early_reveals) {
            self.accept_reveal(msg)?;
        }
        Ok(())
    }

    fn handle_reveal(&mut self, msg: Msg<RevealedKey>) -> Result<()> {
        let sender = msg.sender;
        match self.state {
            State::Reveal => self.accept_reveal(msg),
            // Party that completed its circle earlier may already disclose its key
            State::AwaitRound if sender != self.party_i => {
                if self.early_reveals.iter().any(|m| m.sender == sender) {
                    return Err(ProtocolError::DuplicateReveal { sender });
                }
                self.early_reveals.push(msg);
                Ok(())
            }
            _ => Err(ProtocolError::UnexpectedMessage {
                sender,
                kind: "revealed key",
                phase: self.phase(),
            }),
        }
    }

    fn accept_reveal(&mut self, msg: Msg<RevealedKey>) -> Result<()> {
        let sender = msg.sender;
        if sender == self.party_i {
            let own = self
                .reveals
                .get(sender)
                .ok_or(ProtocolError::Internal("own key is missing in reveal phase"))?;
            if self.own_echo_seen {
                return Err(ProtocolError::DuplicateReveal { sender });
            }
            if own.to_bytes() != msg.body.as_bytes() {
                return Err(ProtocolError::CorruptedEcho { sender });
            }
            self.own_echo_seen = true;
            return Ok(());
        }
        if self.reveals.contains(sender) {
            return Err(ProtocolError::DuplicateReveal { sender });
        }

        let key = K::from_bytes(msg.body.as_bytes())
            .map_err(|reason| ProtocolError::MalformedKey { sender, reason })?;
        let commitment = self.commitments[usize::from(sender) - 1]
            .ok_or(ProtocolError::Internal("revealing party has no recorded layer"))?;
        if key.id() != commitment {
            return Err(ProtocolError::CommitmentMismatch { sender });
        }
        self.reveals
            .insert(sender, key)
            .map_err(|_| ProtocolError::DuplicateReveal { sender })
    }

    fn start(&mut self) -> Result<()> {
        if self.party_i == INITIATOR {
            let deck = Deck::fresh(self.party_n, &mut self.rng)
                .ok_or(ProtocolError::Internal("party set exceeds number of ranks"))?;
            self.shuffle_and_encrypt(deck)?;
        }
        self.state = State::AwaitRound;
        Ok(())
    }

    fn shuffle(&mut self) -> Result<()> {
        let deck = self
            .deck
            .clone()
            .ok_or(ProtocolError::Internal("holding turn without a deck"))?;
        self.shuffle_and_encrypt(deck)
    }

    fn shuffle_and_encrypt(&mut self, mut deck: Deck) -> Result<()> {
        deck.shuffle(&mut self.rng);
        let key = K::generate(&mut self.rng);
        for card in deck.cards_mut() {
            key.encrypt(card, &mut self.rng)
                .map_err(ProtocolError::Cipher)?;
        }
        tracing::debug!(party = self.party_i, layer = %key.id(), "deck shuffled and encrypted");

        self.key = Some(key);
        self.sent = Some(deck.clone());
        self.msgs_queue.push(Msg {
            sender: self.party_i,
            body: ProtocolMessage::Shuffled(deck),
        });
        Ok(())
    }

    fn compute_order(&mut self) -> Result<()> {
        let keys = self
            .reveals
            .take_all()
            .ok_or(ProtocolError::Internal("not all keys are disclosed"))?;
        let mut deck = self
            .deck
            .take()
            .ok_or(ProtocolError::Internal("reveal phase without a deck"))?;

        for card in deck.cards_mut() {
            for key in keys.iter().rev() {
                key.decrypt(card).map_err(ProtocolError::Cipher)?;
            }
        }
        let ranks = deck
            .cards()
            .iter()
            .map(deck::open)
            .collect::<Option<Vec<_>>>()
            .ok_or(ProtocolError::UndecodableDeck)?;
        if !deck::is_full_set(&ranks) {
            return Err(ProtocolError::UndecodableDeck);
        }
        let draws = gameplay::draws(deck.cards(), &keys);
        let order = GameplayOrder::from_draws(&draws);

        tracing::info!(party = self.party_i, order = ?order.parties(), "gameplay order agreed");
        self.state = State::Done(order);
        Ok(())
    }
}

impl<K, R> StateMachine for OrderConsensus<K, R>
where
    K: CommutativeKey,
    R: RngCore + CryptoRng,
{
    type MessageBody = ProtocolMessage;
    type Err = ProtocolError;
    type Output = GameplayOrder;

    fn handle_incoming(&mut self, msg: Msg<ProtocolMessage>) -> Result<()> {
        match &self.state {
            State::Failed(err) => return Err(err.clone()),
            State::Gone => return Err(ProtocolError::OutputPicked),
            State::Done(_) => {
                tracing::trace!(
                    party = self.party_i,
                    sender = msg.sender,
                    kind = msg.body.kind(),
                    "ignoring message after protocol is done"
                );
                return Ok(());
            }
            State::Init | State::AwaitRound | State::Reveal => (),
        }

        let sender = msg.sender;
        let result = if sender == 0 || sender > self.party_n {
            Err(ProtocolError::UnknownSender {
                sender,
                parties: self.party_n,
            })
        } else {
            match msg.body {
                ProtocolMessage::Shuffled(deck) => self.handle_deck(sender, deck),
                ProtocolMessage::Revealed(key) => self.handle_reveal(Msg { sender, body: key }),
            }
        };
        self.fail_on_error(result)
    }

    fn message_queue(&mut self) -> &mut Vec<Msg<ProtocolMessage>> {
        &mut self.msgs_queue
    }

    fn wants_to_proceed(&self) -> bool {
        match self.state {
            State::Init => true,
            State::AwaitRound => self.holds_turn(),
            State::Reveal => self.reveals.is_complete(),
            State::Done(_) | State::Failed(_) | State::Gone => false,
        }
    }

    fn proceed(&mut self) -> Result<()> {
        let result = match self.state {
            State::Init => self.start(),
            State::AwaitRound if self.holds_turn() => self.shuffle(),
            State::Reveal if self.reveals.is_complete() => self.compute_order(),
            _ => Ok(()),
        };
        self.fail_on_error(result)
    }

    fn deadline_reached(&mut self) -> ProtocolError {
        let missing = match self.state {
            State::Init | State::AwaitRound => vec![self.turn],
            State::Reveal => self.reveals.missing(),
            State::Done(_) | State::Failed(_) | State::Gone => vec![],
        };
        let err = ProtocolError::Timeout { missing };
        tracing::warn!(party = self.party_i, %err, "order consensus timed out");
        self.state = State::Failed(err.clone());
        err
    }

    fn is_finished(&self) -> bool {
        matches!(
            self.state,
            State::Done(_) | State::Failed(_) | State::Gone
        )
    }

    fn pick_output(&mut self) -> Option<Result<GameplayOrder, ProtocolError>> {
        match std::mem::replace(&mut self.state, State::Gone) {
            State::Done(order) => Some(Ok(order)),
            State::Failed(err) => {
                self.state = State::Failed(err.clone());
                Some(Err(err))
            }
            State::Gone => Some(Err(ProtocolError::OutputPicked)),
            state => {
                self.state = state;
                None
            }
        }
    }

    /// `0` before dealing, `1..=n` while waiting for `n`-th shuffle, `n + 1` in reveal phase,
    /// `n + 2` once finished
    fn current_round(&self) -> u16 {
        match self.state {
            State::Init => 0,
            State::AwaitRound => self.shuffles + 1,
            State::Reveal => self.party_n + 1,
            State::Done(_) | State::Failed(_) | State::Gone => self.party_n + 2,
        }
    }

    fn party_ind(&self) -> u16 {
        self.party_i
    }

    fn parties(&self) -> u16 {
        self.party_n
    }
}

impl<K, R> fmt::Debug for OrderConsensus<K, R>
where
    K: CommutativeKey,
    R: RngCore + CryptoRng,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderConsensus")
            .field("party_i", &self.party_i)
            .field("party_n", &self.party_n)
            .field("phase", &self.phase())
            .field("turn", &self.turn)
            .field("shuffles", &self.shuffles)
            .field("keys_revealed", &self.reveals.keys_received())
            .field("early_decks", &self.early_decks.len())
            .field("early_reveals", &self.early_reveals.len())
            .field("msgs_queue", &self.msgs_queue.len())
            .finish()
    }
}
