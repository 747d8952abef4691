//! Fair turn order among mutually distrusting parties
//!
//! Every party contributes a shuffle and a committed encryption key to a shared deck of ranked
//! cards, see [OrderConsensus] for protocol description. The resulting [GameplayOrder] depends on
//! the disclosed secrets of all parties, so it can't be chosen or predicted by any strict subset
//! of them. Any detected misbehaviour aborts the protocol with [ProtocolError] naming the
//! offender.
//!
//! [run] executes the protocol over any [Delivery]:
//! ```no_run
//! # async fn doc() -> Result<(), Box<dyn std::error::Error>> {
//! use fair_order::crypto::SraKey;
//! use fair_order::order::{self, Config};
//! use fair_order::router::TcpRouter;
//!
//! let config = Config::new(2, 3).with_deadline(std::time::Duration::from_secs(60));
//! let delivery = TcpRouter::new("127.0.0.1:7000".parse()?, config.party_index)
//!     .connect::<order::ProtocolMessage>()
//!     .await?;
//! let order = order::run::<SraKey, _>(&config, delivery).await?;
//! println!("first to move: party {:?}", order.first());
//! # Ok(()) }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::async_runtime::watcher::TracingWatcher;
use crate::async_runtime::{self, AsyncProtocol};
use crate::crypto::CommutativeKey;
use crate::Delivery;

mod deck;
mod error;
mod gameplay;
mod message;
mod reveal;
mod state;

pub use deck::{Deck, CARD_SIZE};
pub use error::{ConfigError, ProtocolError};
pub use gameplay::{Draw, GameplayOrder, DRAW_SIZE};
pub use message::{ProtocolMessage, RevealedKey};
pub use state::{OrderConsensus, Phase};

/// Minimal number of parties
pub const MIN_PARTIES: u16 = 2;
/// Maximal number of parties, limited by one-byte card ranks
pub const MAX_PARTIES: u16 = 256;
/// Party that deals the deck and starts every shuffle circle
pub const INITIATOR: u16 = 1;

fn check_party_set(party_i: u16, party_n: u16) -> Result<(), ConfigError> {
    if party_n < MIN_PARTIES {
        return Err(ConfigError::TooFewParties { parties: party_n });
    }
    if party_n > MAX_PARTIES {
        return Err(ConfigError::TooManyParties { parties: party_n });
    }
    if party_i == 0 || party_i > party_n {
        return Err(ConfigError::IndexOutOfRange {
            index: party_i,
            parties: party_n,
        });
    }
    Ok(())
}

/// Party configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Number of parties
    pub parties: u16,
    /// Index of this party, `1..=parties`
    pub party_index: u16,
    /// Log every received message and state change
    #[serde(default)]
    pub debug: bool,
    /// Time limit for the whole run
    #[serde(default)]
    pub deadline: Option<Duration>,
}

impl Config {
    pub fn new(party_index: u16, parties: u16) -> Self {
        Self {
            parties,
            party_index,
            debug: false,
            deadline: None,
        }
    }

    pub fn with_debug(self, debug: bool) -> Self {
        Self { debug, ..self }
    }

    pub fn with_deadline(self, deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            ..self
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_party_set(self.party_index, self.parties)
    }
}

/// Error of [run]
#[derive(Debug, Error)]
pub enum RunError<RE, SE>
where
    RE: std::error::Error + 'static,
    SE: std::error::Error + 'static,
{
    #[error("invalid config")]
    Config(#[source] ConfigError),
    #[error("protocol execution failed")]
    Execution(#[source] async_runtime::Error<ProtocolError, RE, SE>),
}

impl<RE, SE> RunError<RE, SE>
where
    RE: std::error::Error + 'static,
    SE: std::error::Error + 'static,
{
    /// Protocol violation or timeout reported by the state machine, if that's what failed
    pub fn protocol_error(&self) -> Option<&ProtocolError> {
        match self {
            Self::Execution(err) => err.protocol_error(),
            Self::Config(_) => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Execution(async_runtime::Error::Timeout(_)))
    }
}

/// Runs order consensus as party `config.party_index` using encryption scheme `K`
///
/// The config is validated before anything is sent. With `config.debug` set, every received
/// message and state change is logged through [TracingWatcher].
pub async fn run<K, D>(
    config: &Config,
    delivery: D,
) -> Result<GameplayOrder, RunError<D::ReceiveError, D::SendError>>
where
    K: CommutativeKey,
    D: Delivery<ProtocolMessage>,
{
    let party = OrderConsensus::<K>::new(config.party_index, config.parties)
        .map_err(RunError::Config)?;
    let (incoming, outgoing) = delivery.split();

    let mut protocol = AsyncProtocol::new(party, incoming, outgoing);
    if let Some(deadline) = config.deadline {
        protocol = protocol.set_timeout(deadline);
    }
    tracing::debug!(
        party = config.party_index,
        parties = config.parties,
        "starting order consensus"
    );

    let result = if config.debug {
        protocol.set_watcher(TracingWatcher).run().await
    } else {
        protocol.run().await
    };
    result.map_err(RunError::Execution)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_bad_party_sets() {
        assert_eq!(
            Config::new(1, 1).validate(),
            Err(ConfigError::TooFewParties { parties: 1 })
        );
        assert_eq!(
            Config::new(0, 3).validate(),
            Err(ConfigError::IndexOutOfRange { index: 0, parties: 3 })
        );
        assert_eq!(
            Config::new(4, 3).validate(),
            Err(ConfigError::IndexOutOfRange { index: 4, parties: 3 })
        );
        assert!(Config::new(256, 256).validate().is_ok());
    }
}
