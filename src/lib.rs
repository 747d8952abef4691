//! # Fair turn order among distrusting peers
//!
//! `n` parties, none of which trusts the others, agree on the order in which they will act (e.g.
//! who moves first in a game). Every party shuffles a deck of `n` cards in turn under commutative
//! encryption, committing to its key on the way. The order is derived from the decrypted cards and
//! all disclosed secrets, so no coalition short of everyone can bias or predict the outcome.
//!
//! ## Protocol
//! 1. Party `1` deals a fresh deck: card `r` carries rank `r` behind a random salt. It shuffles
//!    the deck, encrypts every card under its own key and broadcasts the result.
//! 2. Parties `2..=n` take turns: once the deck of the previous party arrives, the party shuffles
//!    it, adds its own encryption layer on top of the existing ones and broadcasts it.
//! 3. After the deck of party `n` is received, every party reveals its key. Keys are checked
//!    against commitments seen in shuffled decks, then everyone peels all layers off and checks
//!    that the ranks are intact. Party `i` takes the card at position `i - 1` and hashes it with
//!    all disclosed secrets. Parties are ordered by that digest.
//!
//! Any misbehavior observed (a message out of turn, a deck that doesn't extend the previous one,
//! a key that doesn't match its commitment) aborts the protocol for the observer.
//!
//! ## Crate layout
//! * [crypto] provides commutative ciphers: [KeystreamKey](crypto::KeystreamKey) (AES-CTR
//!   keystream, fast) and [SraKey](crypto::SraKey) (modular exponentiation)
//! * [order] implements the protocol as a [StateMachine] and wires it to a network
//! * [router] connects parties: [LocalRouter](router::LocalRouter) in-process, and
//!   [TcpHub](router::TcpHub) / [TcpRouter](router::TcpRouter) over TCP
//! * [AsyncProtocol] executes any [StateMachine] over a [Delivery]
//!
//! ## Example
//! ```no_run
//! # use fair_order::crypto::KeystreamKey;
//! # use fair_order::order::{self, Config};
//! # use fair_order::router::{LocalRouter, Router};
//! # async fn play() -> Result<(), Box<dyn std::error::Error>> {
//! let router = LocalRouter::new();
//! let mut deliveries = vec![];
//! for _ in 0..3 {
//!     deliveries.push(router.register().await?);
//! }
//!
//! let mut parties = vec![];
//! for (i, delivery) in (1..).zip(deliveries) {
//!     let config = Config::new(i, 3);
//!     parties.push(tokio::spawn(async move {
//!         order::run::<KeystreamKey, _>(&config, delivery).await
//!     }));
//! }
//! for party in parties {
//!     println!("order: {:?}", party.await??);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! For development purposes, you can also find useful [Simulation](dev::Simulation) and
//! [AsyncSimulation](dev::AsyncSimulation) simulators which can run protocols locally
//! (require `dev` feature).

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod async_runtime;
pub mod crypto;
mod delivery;
pub mod order;
pub mod router;
mod sm;

#[cfg(feature = "dev")]
#[cfg_attr(docsrs, doc(cfg(feature = "dev")))]
pub mod dev;

pub use async_runtime::AsyncProtocol;
pub use delivery::*;
pub use sm::*;
