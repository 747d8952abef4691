//! Mechanism for tracking protocol execution

use std::fmt::Debug;

use crate::{Msg, StateMachine};

/// Looks after protocol execution in [AsyncProtocol](super::AsyncProtocol)
pub trait ProtocolWatcher<SM: StateMachine> {
    /// Party `party` is about to handle a received message
    fn message_received(&mut self, party: u16, msg: &Msg<SM::MessageBody>);
    /// State machine moved to another round
    fn round_changed(&mut self, state: &SM);
}

/// Watcher that doesn't do anything when event happens
pub struct BlindWatcher;

impl<SM> ProtocolWatcher<SM> for BlindWatcher
where
    SM: StateMachine,
{
    fn message_received(&mut self, _party: u16, _msg: &Msg<SM::MessageBody>) {}
    fn round_changed(&mut self, _state: &SM) {}
}

/// Watcher that emits every event as a `tracing` debug record
pub struct TracingWatcher;

impl<SM> ProtocolWatcher<SM> for TracingWatcher
where
    SM: StateMachine + Debug,
    SM::MessageBody: Debug,
{
    fn message_received(&mut self, party: u16, msg: &Msg<SM::MessageBody>) {
        tracing::debug!(party, sender = msg.sender, body = ?msg.body, "received message");
    }

    fn round_changed(&mut self, state: &SM) {
        tracing::debug!(
            party = state.party_ind(),
            round = state.current_round(),
            ?state,
            "moved to next round"
        );
    }
}
