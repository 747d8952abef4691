use std::error::Error;

use futures::{Sink, Stream};

use crate::Msg;

/// Networking abstraction
///
/// Basically, it's pair of channels: [`Stream`] for receiving messages, and [`Sink`] for
/// broadcasting messages to all parties (including the sender itself).
///
/// Within a single sender, messages are delivered in the order they were sent. No ordering is
/// guaranteed across different senders.
pub trait Delivery<M> {
    /// Outgoing delivery channel
    type Send: Sink<Msg<M>, Error = Self::SendError> + Unpin;
    /// Incoming delivery channel
    type Receive: Stream<Item = Result<Msg<M>, Self::ReceiveError>> + Unpin;
    /// Error of outgoing delivery channel
    type SendError: Error + Send + Sync + 'static;
    /// Error of incoming delivery channel
    type ReceiveError: Error + Send + Sync + 'static;
    /// Returns a pair of incoming and outgoing delivery channels
    fn split(self) -> (Self::Receive, Self::Send);
}

impl<M, I, O, IErr, OErr> Delivery<M> for (I, O)
where
    I: Stream<Item = Result<Msg<M>, IErr>> + Unpin,
    O: Sink<Msg<M>, Error = OErr> + Unpin,
    IErr: Error + Send + Sync + 'static,
    OErr: Error + Send + Sync + 'static,
{
    type Send = O;
    type Receive = I;
    type SendError = OErr;
    type ReceiveError = IErr;

    fn split(self) -> (Self::Receive, Self::Send) {
        (self.0, self.1)
    }
}
