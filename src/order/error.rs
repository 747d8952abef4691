use thiserror::Error;

use crate::crypto::CipherError;

use super::{MAX_PARTIES, MIN_PARTIES};

/// Invalid party set, detected before anything is sent
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("too few parties: got {parties}, want at least {}", MIN_PARTIES)]
    TooFewParties { parties: u16 },
    #[error("too many parties: got {parties}, at most {} supported", MAX_PARTIES)]
    TooManyParties { parties: u16 },
    #[error("invalid party index: {index} not in range [1; {parties}]")]
    IndexOutOfRange { index: u16, parties: u16 },
}

/// Reason why the order consensus failed
///
/// Apart from [Cipher](Self::Cipher), [Internal](Self::Internal) and
/// [UndecodableDeck](Self::UndecodableDeck), every variant names the party whose message caused
/// the failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    #[error("message from party {sender} doesn't fit party set of size {parties}")]
    UnknownSender { sender: u16, parties: u16 },
    #[error("out of turn message: got deck from party {sender}, want party {expected}")]
    OutOfTurn { sender: u16, expected: u16 },
    #[error("party {sender} sent {kind} message while this party is in {phase:?} phase")]
    UnexpectedMessage {
        sender: u16,
        kind: &'static str,
        phase: super::Phase,
    },
    #[error("party {sender} sent deck of {actual} cards, want {expected}")]
    WrongDeckSize {
        sender: u16,
        expected: usize,
        actual: usize,
    },
    #[error("party {sender} sent deck with malformed encryption layers")]
    MalformedLayers { sender: u16 },
    #[error("party {sender} sent invalid ciphertext")]
    InvalidCiphertext { sender: u16 },
    #[error("message from party {sender} is corrupted: own encryption is altered or missing")]
    CorruptedEcho { sender: u16 },
    #[error("party {sender} revealed its key twice")]
    DuplicateReveal { sender: u16 },
    #[error("party {sender} revealed malformed key")]
    MalformedKey {
        sender: u16,
        #[source]
        reason: CipherError,
    },
    #[error("key revealed by party {sender} doesn't match its encryption layer")]
    CommitmentMismatch { sender: u16 },
    #[error("decrypted deck is not a permutation of ranks")]
    UndecodableDeck,
    #[error("deadline reached while waiting for parties {missing:?}")]
    Timeout { missing: Vec<u16> },
    #[error("cipher misuse (bug)")]
    Cipher(#[source] CipherError),
    #[error("internal error (bug): {0}")]
    Internal(&'static str),
    #[error("protocol output has already been picked")]
    OutputPicked,
}

impl ProtocolError {
    /// Index of the party whose message caused the failure, if attributable
    pub fn offender(&self) -> Option<u16> {
        match self {
            Self::UnknownSender { sender, .. }
            | Self::OutOfTurn { sender, .. }
            | Self::UnexpectedMessage { sender, .. }
            | Self::WrongDeckSize { sender, .. }
            | Self::MalformedLayers { sender }
            | Self::InvalidCiphertext { sender }
            | Self::CorruptedEcho { sender }
            | Self::DuplicateReveal { sender }
            | Self::MalformedKey { sender, .. }
            | Self::CommitmentMismatch { sender } => Some(*sender),
            Self::Timeout { .. }
            | Self::UndecodableDeck
            | Self::Cipher(_)
            | Self::Internal(_)
            | Self::OutputPicked => None,
        }
    }

    /// Indicates that the error was caused by deadline expiry rather than misbehaviour
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
