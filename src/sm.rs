use serde::{Deserialize, Serialize};

/// State machine of a party involved in a message-driven protocol
///
/// Any error returned by [handle_incoming](Self::handle_incoming) or [proceed](Self::proceed)
/// is fatal: the state machine is expected to move into a terminal state and the executor stops
/// without sending anything else.
pub trait StateMachine {
    /// Body of transmitting messages
    ///
    /// Actual type of transmitting messages will be `Msg<SM::MessageBody>` (see [Msg struct](Msg))
    type MessageBody;
    /// Error type used by StateMachine
    type Err;
    /// Output of the protocol if it successfully terminates
    type Output;

    /// Process received message
    ///
    /// Every party receives its own messages back, the state machine must be ready to handle them.
    ///
    /// ## Blocking
    /// This method should not block or perform expensive computation. E.g. it might do
    /// cheap validity checks, but not decryption.
    fn handle_incoming(&mut self, msg: Msg<Self::MessageBody>) -> Result<(), Self::Err>;

    /// Queue of messages to be sent
    ///
    /// New messages can be appended to queue only as result of calling
    /// [proceed](StateMachine::proceed) or [handle_incoming](StateMachine::handle_incoming) methods.
    ///
    /// Messages must be sent in queue order. After message is sent, it should be deleted from
    /// the queue.
    fn message_queue(&mut self) -> &mut Vec<Msg<Self::MessageBody>>;

    /// Indicates whether StateMachine wants to perform some expensive computation
    fn wants_to_proceed(&self) -> bool;

    /// Performs some expensive computation
    ///
    /// If [`StateMachine`] is executed at green thread (in async environment), it will be typically
    /// moved to dedicated thread at thread pool before calling `.proceed()` method.
    ///
    /// Returns `Ok(())` if either computation successfully completes or computation was not
    /// required (i.e. `self.wants_to_proceed() == false`).
    fn proceed(&mut self) -> Result<(), Self::Err>;

    /// Method is triggered when executor's deadline elapsed before the protocol finished
    ///
    /// Returned error describes what the party was waiting for. Reaching deadline always aborts
    /// computation.
    fn deadline_reached(&mut self) -> Self::Err;

    /// Indicates whether protocol is finished and output can be obtained by calling
    /// [pick_output](Self::pick_output) method.
    fn is_finished(&self) -> bool;

    /// Obtains protocol output
    ///
    /// ## Returns
    /// * `None`, if protocol is not finished yet
    ///   i.e. `protocol.is_finished() == false`
    /// * `Some(Err(_))`, if protocol terminated with error
    /// * `Some(Ok(_))`, if protocol successfully terminated
    fn pick_output(&mut self) -> Option<Result<Self::Output, Self::Err>>;

    /// Sequential number of current round
    ///
    /// Can only grow, and only as result of calling either [proceed](StateMachine::proceed) or
    /// [handle_incoming](StateMachine::handle_incoming) methods.
    fn current_round(&self) -> u16;

    /// Index of this party
    ///
    /// Must be in interval `[1; n]` where `n = self.parties()`
    fn party_ind(&self) -> u16;
    /// Number of parties involved in computation
    fn parties(&self) -> u16;
}

/// Represent a message transmitting between parties on wire
///
/// Every message is broadcast: it's delivered to all registered parties, sender included.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Msg<B> {
    /// Index of the sender
    ///
    /// Lies in range `[1; n]` where `n` is number of parties involved in computation
    pub sender: u16,
    /// Message body
    pub body: B,
}

impl<B> Msg<B> {
    /// Applies closure to message body
    pub fn map_body<T, F>(self, f: F) -> Msg<T>
    where
        F: FnOnce(B) -> T,
    {
        Msg {
            sender: self.sender,
            body: f(self.body),
        }
    }
}
