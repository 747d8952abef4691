use std::fmt::Debug;
use std::iter;
use std::time::Duration;

use crate::async_runtime::{self, watcher::TracingWatcher, AsyncProtocol};
use crate::router::{Latency, LocalDelivery, LocalRouter, LocalRouterError};
use crate::{Delivery, StateMachine};

/// Emulates running protocol between local parties using [AsyncProtocol](crate::AsyncProtocol)
///
/// Every party is registered at a shared [LocalRouter] and runs as a separate tokio task, so
/// messages of different senders arrive in arbitrary interleaving. Optionally, the router
/// simulates network [Latency].
///
/// Compared to [Simulation], AsyncSimulation requires [tokio] runtime and introduces parallelism,
/// so it's closer to real network conditions.
///
/// [Simulation]: super::Simulation
///
/// ## Example
/// ```no_run
/// # use std::time::Duration;
/// # use fair_order::dev::AsyncSimulation;
/// # use fair_order::crypto::SraKey;
/// # use fair_order::order::OrderConsensus;
/// # use fair_order::router::Latency;
/// # async fn simulate() -> Result<(), Box<dyn std::error::Error>> {
/// let results = AsyncSimulation::with_latency(Latency::new(
///         Duration::from_millis(20),
///         Duration::from_millis(10),
///     ))
///     .add_party(OrderConsensus::<SraKey>::new(1, 3)?)
///     .add_party(OrderConsensus::<SraKey>::new(2, 3)?)
///     .add_party(OrderConsensus::<SraKey>::new(3, 3)?)
///     .run()
///     .await;
/// # let _ = results; Ok(())
/// # }
/// ```
pub struct AsyncSimulation<SM: StateMachine> {
    router: LocalRouter<SM::MessageBody>,
    parties: Vec<SM>,
    timeout: Option<Duration>,
    exhausted: bool,
}

impl<SM> AsyncSimulation<SM>
where
    SM: StateMachine + Debug + Send + 'static,
    SM::MessageBody: Debug + Clone + Send + 'static,
    SM::Err: Send + Debug,
    SM::Output: Send,
{
    /// Creates new simulation with instant delivery
    pub fn new() -> Self {
        Self::with_latency(Latency::default())
    }

    /// Creates new simulation delaying every delivery
    pub fn with_latency(latency: Latency) -> Self {
        Self {
            router: LocalRouter::with_latency(latency),
            parties: vec![],
            timeout: None,
            exhausted: false,
        }
    }

    /// Limits execution time of every party
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Adds protocol participant
    pub fn add_party(&mut self, party: SM) -> &mut Self {
        self.parties.push(party);
        self
    }

    /// Runs a simulation
    ///
    /// ## Returns
    /// Returns Vec of execution results. Every party is executed independently, simulation
    /// will continue until each party finish protocol (either with success or error).
    ///
    /// It's an error to call this method twice. In this case,
    /// `vec![Err(AsyncSimulationError::SimulationExhausted); n]` is returned
    pub async fn run(&mut self) -> Vec<Result<SM::Output, AsyncSimulationError<SM>>> {
        if self.exhausted {
            return iter::repeat_with(|| Err(AsyncSimulationError::SimulationExhausted))
                .take(self.parties.len())
                .collect();
        }
        self.exhausted = true;

        // All parties register before anyone starts sending
        let mut deliveries = vec![];
        for _ in &self.parties {
            match self.router.register_now() {
                Ok(delivery) => deliveries.push(delivery),
                Err(err) => {
                    return iter::repeat_with(|| Err(AsyncSimulationError::Registration(err.to_string())))
                        .take(self.parties.len())
                        .collect()
                }
            }
        }

        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut handles = vec![];
        for (party, delivery) in self.parties.drain(..).zip(deliveries) {
            let (incoming, outgoing) = LocalDelivery::split(delivery);
            let mut protocol = AsyncProtocol::new(party, incoming, outgoing)
                .set_deadline(deadline)
                .set_watcher(TracingWatcher);
            handles.push(tokio::spawn(async move { protocol.run().await }));
        }

        let mut results = vec![];
        for handle in handles {
            results.push(match handle.await {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(err)) => Err(AsyncSimulationError::ProtocolExecution(err)),
                Err(err) => Err(AsyncSimulationError::ProtocolExecutionPanicked(err)),
            });
        }
        results
    }
}

impl<SM> Default for AsyncSimulation<SM>
where
    SM: StateMachine + Debug + Send + 'static,
    SM::MessageBody: Debug + Clone + Send + 'static,
    SM::Err: Send + Debug,
    SM::Output: Send,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Possible errors that async simulation can be resulted in
#[non_exhaustive]
#[derive(Debug)]
pub enum AsyncSimulationError<SM: StateMachine> {
    /// Protocol execution error
    ProtocolExecution(async_runtime::Error<SM::Err, LocalRouterError, LocalRouterError>),
    /// Protocol execution produced a panic
    ProtocolExecutionPanicked(tokio::task::JoinError),
    /// Party couldn't be registered at the router
    Registration(String),
    /// Simulation ran twice
    SimulationExhausted,
}

impl<SM: StateMachine> AsyncSimulationError<SM> {
    /// Error produced by the state machine, if any
    pub fn protocol_error(&self) -> Option<&SM::Err> {
        match self {
            Self::ProtocolExecution(err) => err.protocol_error(),
            _ => None,
        }
    }
}
