//! Instruments for executing protocol in async environment

use std::fmt;
use std::future::Future;
use std::time::Duration;

use futures::future::{Either, FutureExt};
use futures::sink::Sink;
use futures::stream::{self, Stream, StreamExt};
use futures::SinkExt;
use tokio::time::{self, timeout_at};

use crate::{Msg, StateMachine};
use watcher::{BlindWatcher, ProtocolWatcher};

pub mod watcher;

/// Executes protocol in async environment using [tokio] backend
///
/// Provide protocol initial state, stream of incoming messages, and sink for outgoing messages:
/// ```no_run
/// # use fair_order::{AsyncProtocol, Delivery};
/// # use fair_order::crypto::KeystreamKey;
/// # use fair_order::order::OrderConsensus;
/// # use fair_order::router::LocalRouter;
/// # async fn execute() -> Result<(), Box<dyn std::error::Error>> {
/// let router = LocalRouter::new();
/// let (incoming, outgoing) = router.register_now()?.split();
/// let party = OrderConsensus::<KeystreamKey>::new(1, 2)?;
///
/// let order = AsyncProtocol::new(party, incoming, outgoing)
///     .set_timeout(std::time::Duration::from_secs(30))
///     .run()
///     .await?;
/// # let _ = order; Ok(())
/// # }
/// ```
///
/// Once the deadline (if set) is reached, execution aborts with [Error::Timeout] and nothing else
/// is sent.
pub struct AsyncProtocol<SM, I, O, W = BlindWatcher> {
    state: Option<SM>,
    incoming: I,
    outgoing: O,
    deadline: Option<time::Instant>,
    current_round: Option<u16>,
    exhausted: bool,
    watcher: W,
}

impl<SM, I, O> AsyncProtocol<SM, I, O, BlindWatcher> {
    /// Constructs new protocol executor from initial state, channels of incoming and outgoing
    /// messages
    pub fn new(state: SM, incoming: I, outgoing: O) -> Self {
        Self {
            state: Some(state),
            incoming,
            outgoing,
            deadline: None,
            current_round: None,
            exhausted: false,
            watcher: BlindWatcher,
        }
    }
}

impl<SM, I, O, W> AsyncProtocol<SM, I, O, W> {
    /// Sets new protocol watcher
    ///
    /// Protocol watcher looks after protocol execution. See list of observable events in
    /// [ProtocolWatcher] trait.
    ///
    /// Default watcher: [BlindWatcher] that does nothing with received events. For development
    /// purposes it's convenient to pick [TracingWatcher](watcher::TracingWatcher).
    pub fn set_watcher<WR>(self, watcher: WR) -> AsyncProtocol<SM, I, O, WR> {
        AsyncProtocol {
            state: self.state,
            incoming: self.incoming,
            outgoing: self.outgoing,
            deadline: self.deadline,
            current_round: self.current_round,
            exhausted: self.exhausted,
            watcher,
        }
    }

    /// Sets a deadline for the whole protocol execution
    pub fn set_deadline(self, deadline: Option<time::Instant>) -> Self {
        Self { deadline, ..self }
    }

    /// Sets a deadline at `timeout` from now
    pub fn set_timeout(self, timeout: Duration) -> Self {
        self.set_deadline(Some(time::Instant::now() + timeout))
    }
}

impl<SM, I, O, IErr, W> AsyncProtocol<SM, I, O, W>
where
    SM: StateMachine,
    SM::Err: Send,
    SM: Send + 'static,
    I: Stream<Item = Result<Msg<SM::MessageBody>, IErr>> + Unpin,
    O: Sink<Msg<SM::MessageBody>> + Unpin,
    W: ProtocolWatcher<SM>,
{
    /// Get a reference to the inner state machine.
    ///
    /// Returns an error if the state machine is missing, that could only happen if the
    /// task/thread that is running the proceed call panicked.
    pub fn state_machine_ref(&self) -> Result<&SM, Error<SM::Err, IErr, O::Error>> {
        self.state
            .as_ref()
            .ok_or_else(|| BadStateMachineReason::MissingStateMachine.into())
    }

    /// Converts the executor back into the inner state machine
    pub fn into_state_machine(self) -> Result<SM, Error<SM::Err, IErr, O::Error>> {
        self.state
            .ok_or_else(|| BadStateMachineReason::MissingStateMachine.into())
    }

    /// Executes the protocol
    ///
    /// Returns protocol output or first occurred error
    pub async fn run(&mut self) -> Result<SM::Output, Error<SM::Err, IErr, O::Error>> {
        if self.exhausted {
            return Err(Error::Exhausted);
        }
        self.exhausted = true;

        self.proceed_if_needed().await?;
        self.send_outgoing().await?;
        self.track_round()?;

        if let Some(result) = self.finish_if_possible() {
            return result;
        }

        loop {
            self.handle_incoming().await?;
            self.send_outgoing().await?;
            self.track_round()?;

            self.proceed_if_needed().await?;
            self.send_outgoing().await?;
            self.track_round()?;

            if let Some(result) = self.finish_if_possible() {
                return result;
            }
        }
    }

    async fn handle_incoming(&mut self) -> Result<(), Error<SM::Err, IErr, O::Error>> {
        let state = self
            .state
            .as_mut()
            .ok_or(BadStateMachineReason::MissingStateMachine)?;
        match Self::enforce_deadline(self.deadline, self.incoming.next()).await {
            Ok(Some(Ok(msg))) => {
                self.watcher.message_received(state.party_ind(), &msg);
                state.handle_incoming(msg).map_err(Error::HandleIncoming)?;
            }
            Ok(Some(Err(err))) => return Err(Error::Recv(err)),
            Ok(None) => return Err(Error::RecvEof),
            Err(_) => return Err(Error::Timeout(state.deadline_reached())),
        }
        Ok(())
    }

    async fn proceed_if_needed(&mut self) -> Result<(), Error<SM::Err, IErr, O::Error>> {
        let mut state = self
            .state
            .take()
            .ok_or(BadStateMachineReason::MissingStateMachine)?;
        if state.wants_to_proceed() {
            let (result, s) = tokio::task::spawn_blocking(move || (state.proceed(), state))
                .await
                .map_err(Error::ProceedPanicked)?;
            state = s;
            self.state = Some(state);
            result.map_err(Error::Proceed)
        } else {
            self.state = Some(state);
            Ok(())
        }
    }

    async fn send_outgoing(&mut self) -> Result<(), Error<SM::Err, IErr, O::Error>> {
        let state = self
            .state
            .as_mut()
            .ok_or(BadStateMachineReason::MissingStateMachine)?;

        if !state.message_queue().is_empty() {
            if self.deadline.map_or(false, |d| time::Instant::now() >= d) {
                return Err(Error::Timeout(state.deadline_reached()));
            }
            let mut msgs = stream::iter(state.message_queue().drain(..).map(Ok));
            self.outgoing
                .send_all(&mut msgs)
                .await
                .map_err(Error::Send)?;
        }

        Ok(())
    }

    fn finish_if_possible(&mut self) -> Option<Result<SM::Output, Error<SM::Err, IErr, O::Error>>> {
        let state = match self.state.as_mut() {
            Some(s) => s,
            None => return Some(Err(BadStateMachineReason::MissingStateMachine.into())),
        };
        if !state.is_finished() {
            None
        } else {
            match state.pick_output() {
                Some(Ok(result)) => Some(Ok(result)),
                Some(Err(err)) => Some(Err(Error::Finish(err))),
                None => Some(Err(
                    BadStateMachineReason::ProtocolFinishedButNoResult.into()
                )),
            }
        }
    }

    fn track_round(&mut self) -> Result<(), Error<SM::Err, IErr, O::Error>> {
        let state = self
            .state
            .as_ref()
            .ok_or(BadStateMachineReason::MissingStateMachine)?;
        let round_n = state.current_round();
        if self.current_round != Some(round_n) {
            self.current_round = Some(round_n);
            self.watcher.round_changed(state);
        }
        Ok(())
    }

    fn enforce_deadline<F>(
        deadline: Option<time::Instant>,
        f: F,
    ) -> impl Future<Output = Result<F::Output, time::error::Elapsed>>
    where
        F: Future,
    {
        match deadline {
            Some(deadline) => Either::Right(timeout_at(deadline, f)),
            None => Either::Left(f.map(Ok)),
        }
    }
}

/// Represents error that can occur while executing protocol
#[derive(Debug)]
#[non_exhaustive]
pub enum Error<E, RE, SE> {
    /// Receiving next incoming message returned error
    Recv(RE),
    /// Incoming channel closed (got EOF)
    RecvEof,
    /// Sending outgoing message resulted in error
    Send(SE),
    /// [Handling incoming](crate::StateMachine::handle_incoming) message produced an error
    HandleIncoming(E),
    /// Deadline reached before the protocol finished
    Timeout(E),
    /// [Proceed method](crate::StateMachine::proceed) panicked
    ProceedPanicked(tokio::task::JoinError),
    /// State machine [proceeding](crate::StateMachine::proceed) produced an error
    Proceed(E),
    /// StateMachine's [pick_output](crate::StateMachine::pick_output) method return error
    Finish(E),
    /// AsyncProtocol already executed protocol (or at least, tried to). You need to
    /// construct new executor!
    Exhausted,
    /// Buggy StateMachine implementation
    BadStateMachine(BadStateMachineReason),
}

impl<E, RE, SE> Error<E, RE, SE> {
    /// Error produced by the state machine, if any
    pub fn protocol_error(&self) -> Option<&E> {
        match self {
            Self::HandleIncoming(err)
            | Self::Timeout(err)
            | Self::Proceed(err)
            | Self::Finish(err) => Some(err),
            _ => None,
        }
    }
}

impl<E, RE, SE> From<BadStateMachineReason> for Error<E, RE, SE> {
    fn from(reason: BadStateMachineReason) -> Self {
        Error::BadStateMachine(reason)
    }
}

impl<E, RE, SE> fmt::Display for Error<E, RE, SE>
where
    E: fmt::Display,
    RE: fmt::Display,
    SE: fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Recv(err) => {
                write!(f, "receive next message: {}", err)
            }
            Self::RecvEof => {
                write!(f, "receive next message: unexpected eof")
            }
            Self::Send(err) => {
                write!(f, "send a message: {}", err)
            }
            Self::HandleIncoming(err) => {
                write!(f, "handle received message: {}", err)
            }
            Self::Timeout(err) => {
                write!(f, "deadline reached: {}", err)
            }
            Self::ProceedPanicked(err) => {
                write!(f, "proceed panicked: {}", err)
            }
            Self::Proceed(err) => {
                write!(f, "proceed error: {}", err)
            }
            Self::Finish(err) => {
                write!(f, "couldn't finish protocol: {}", err)
            }
            Self::Exhausted => {
                write!(f, "async runtime is exhausted")
            }
            Self::BadStateMachine(err) => {
                write!(f, "buggy state machine implementation: {}", err)
            }
        }
    }
}

impl<E, RE, SE> std::error::Error for Error<E, RE, SE>
where
    E: std::error::Error + 'static,
    RE: std::error::Error + 'static,
    SE: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Recv(err) => Some(err),
            Self::Send(err) => Some(err),
            Self::HandleIncoming(err) => Some(err),
            Self::Timeout(err) => Some(err),
            Self::ProceedPanicked(err) => Some(err),
            Self::Proceed(err) => Some(err),
            Self::Finish(err) => Some(err),
            Self::RecvEof => None,
            Self::Exhausted => None,
            Self::BadStateMachine(_) => None,
        }
    }
}

/// Reason why StateMachine implementation looks buggy
#[derive(Debug)]
#[non_exhaustive]
pub enum BadStateMachineReason {
    /// [StateMachine::is_finished](crate::StateMachine::is_finished) returned `true`,
    /// but [StateMachine::pick_output](crate::StateMachine::pick_output) returned `None`
    ProtocolFinishedButNoResult,
    /// StateMachine is missing, probably because the Proceed method panicked.
    MissingStateMachine,
}

impl fmt::Display for BadStateMachineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolFinishedButNoResult => write!(
                f,
                "couldn't obtain protocol output although it is completed"
            ),
            Self::MissingStateMachine => write!(f, "state machine is missing"),
        }
    }
}
