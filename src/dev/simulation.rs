use std::fmt::Debug;

use crate::sm::*;

/// Emulates running protocol between local parties
///
/// Takes parties (every party is instance of [StateMachine](crate::sm::StateMachine)) and
/// executes protocol between them in lockstep: at every step each party proceeds if it wants to,
/// then every message sent at this step is delivered to every party, the sender included. The
/// whole process (proceeding, receiving messages) is logged via `tracing`.
///
/// Compared to [AsyncSimulation](super::AsyncSimulation), it doesn't require async runtime and
/// executes everything sequentially, so a run is fully reproducible given deterministic parties.
///
/// ## Example
/// ```no_run
/// # use fair_order::dev::Simulation;
/// # use fair_order::crypto::KeystreamKey;
/// # use fair_order::order::OrderConsensus;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let results = Simulation::new()
///     .add_party(OrderConsensus::<KeystreamKey>::new(1, 3)?)
///     .add_party(OrderConsensus::<KeystreamKey>::new(2, 3)?)
///     .add_party(OrderConsensus::<KeystreamKey>::new(3, 3)?)
///     .run()?;
/// assert!(results.windows(2).all(|w| w[0] == w[1]));
/// # Ok(())
/// # }
/// ```
pub struct Simulation<P: StateMachine> {
    /// Parties who run a protocol
    ///
    /// Field is exposed mainly to allow examining parties state after simulation is completed.
    pub parties: Vec<P>,
    /// Every message sent during simulation, in order of sending
    pub transcript: Vec<Msg<P::MessageBody>>,
}

impl<P: StateMachine> Simulation<P> {
    /// Creates new simulation
    pub fn new() -> Self {
        Self {
            parties: vec![],
            transcript: vec![],
        }
    }

    /// Adds protocol participant
    pub fn add_party(&mut self, party: P) -> &mut Self {
        self.parties.push(party);
        self
    }
}

impl<P: StateMachine> Default for Simulation<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Simulation<P>
where
    P: StateMachine,
    // Needed for logging:
    P: Debug,
    P::MessageBody: Debug,
    // Needed to transmit a single broadcast message to every party:
    P::MessageBody: Clone,
{
    /// Runs a simulation
    ///
    /// ## Returns
    /// Returns either Vec of protocol outputs (one output for each one party) or first
    /// occurred error. If no party can make progress while some of them haven't finished,
    /// the first unfinished party is told its deadline is reached, and its error is returned.
    ///
    /// ## Panics
    /// * Number of parties is less than 2
    /// * Party reports it's finished, but has no output
    pub fn run(&mut self) -> Result<Vec<P::Output>, P::Err> {
        assert!(self.parties.len() >= 2, "at least two parties required");

        tracing::debug!(parties = self.parties.len(), "simulation starts");
        loop {
            let mut msgs: Vec<Msg<P::MessageBody>> = vec![];
            let mut progressed = false;
            for party in &mut self.parties {
                if party.wants_to_proceed() {
                    tracing::debug!(party = party.party_ind(), before = ?party, "proceeding");
                    party.proceed()?;
                    tracing::debug!(party = party.party_ind(), after = ?party, "proceeded");
                    progressed = true;
                }

                if !party.message_queue().is_empty() {
                    tracing::debug!(
                        party = party.party_ind(),
                        msgs = party.message_queue().len(),
                        "sending messages"
                    );
                }
                msgs.append(party.message_queue())
            }

            // Messages queued while handling these are sent at the next step
            for party in &mut self.parties {
                if party.is_finished() {
                    continue;
                }
                for msg in &msgs {
                    tracing::trace!(party = party.party_ind(), ?msg, "delivering message");
                    party.handle_incoming(msg.clone())?;
                    progressed = true;
                }
            }
            self.transcript.extend(msgs);

            if self.parties.iter().all(|p| p.is_finished()) {
                let mut results = vec![];
                for party in &mut self.parties {
                    results.push(
                        party
                            .pick_output()
                            .expect("is_finished == true, but pick_output == None")?,
                    )
                }
                tracing::debug!("simulation finished");
                break Ok(results);
            }

            if !progressed && self.parties.iter_mut().all(|p| p.message_queue().is_empty()) {
                let stuck = self
                    .parties
                    .iter_mut()
                    .find(|p| !p.is_finished())
                    .expect("at least one party is not finished");
                tracing::warn!(party = stuck.party_ind(), "simulation stalled");
                break Err(stuck.deadline_reached());
            }
        }
    }
}
