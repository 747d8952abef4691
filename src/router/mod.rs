//! Routers connecting parties to each other
//!
//! A router hands out a [Delivery] per registered party. Everything sent through any delivery is
//! broadcast to all registered parties, the sender included, keeping per-sender order.
//!
//! * [LocalRouter] keeps all parties in one process and may simulate network latency
//! * [TcpHub] relays frames between [TcpRouter] clients over TCP

use std::future::Future;

use crate::Delivery;

pub mod local;
pub mod tcp;

pub use local::{Latency, LocalDelivery, LocalRouter, LocalRouterError};
pub use tcp::{TcpDelivery, TcpHub, TcpRouter, TcpRouterError};

/// Registers parties within a shared message space
pub trait Router<M> {
    /// Channels of a registered party
    type Delivery: Delivery<M>;
    /// Registration error
    type Error: std::error::Error + Send + Sync + 'static;

    /// Registers a new party
    ///
    /// Each party must register before protocol starts, messages broadcast prior to registration
    /// are not delivered to it.
    fn register(&self) -> impl Future<Output = Result<Self::Delivery, Self::Error>> + Send;
}
