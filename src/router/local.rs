//! In-process router

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Sink, Stream};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::{Delivery, Msg};

use super::Router;

type Inbox<M> = mpsc::UnboundedSender<Msg<M>>;

/// Routes messages between parties living in the same process
///
/// Cloning a router gives another handle to the same message space. With non-zero [Latency],
/// every message is held back for a random delay before it reaches its recipient. Each
/// sender/recipient pair gets its own link task, so a delayed message never holds back messages
/// to other recipients, and messages of one sender reach a recipient in order.
///
/// Simulated latency requires a [tokio] runtime.
pub struct LocalRouter<M> {
    peers: Arc<RwLock<Vec<Inbox<M>>>>,
    latency: Latency,
}

impl<M> LocalRouter<M>
where
    M: Clone + Send + 'static,
{
    /// Router without simulated latency
    pub fn new() -> Self {
        Self::with_latency(Latency::default())
    }

    pub fn with_latency(latency: Latency) -> Self {
        Self {
            peers: Default::default(),
            latency,
        }
    }

    /// Registers a new party
    pub fn register_now(&self) -> Result<LocalDelivery<M>, LocalRouterError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut peers = self.peers.write().map_err(|_| LocalRouterError::Poisoned)?;
        peers.push(tx);
        tracing::trace!(peers = peers.len(), "party registered at local router");

        Ok(LocalDelivery {
            incoming: LocalIncoming {
                inbox: UnboundedReceiverStream::new(rx),
            },
            outgoing: LocalOutgoing {
                peers: self.peers.clone(),
                links: vec![],
                latency: self.latency,
            },
        })
    }

    /// Number of registered parties
    pub fn peers(&self) -> usize {
        self.peers.read().map(|peers| peers.len()).unwrap_or(0)
    }
}

impl<M> Default for LocalRouter<M>
where
    M: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Clone for LocalRouter<M> {
    fn clone(&self) -> Self {
        Self {
            peers: self.peers.clone(),
            latency: self.latency,
        }
    }
}

impl<M> Router<M> for LocalRouter<M>
where
    M: Clone + Send + 'static,
{
    type Delivery = LocalDelivery<M>;
    type Error = LocalRouterError;

    fn register(&self) -> impl Future<Output = Result<Self::Delivery, Self::Error>> + Send {
        futures::future::ready(self.register_now())
    }
}

/// Simulated delivery delay: normally distributed, negative samples clipped to zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Latency {
    pub mean: Duration,
    pub std_dev: Duration,
}

impl Latency {
    pub fn new(mean: Duration, std_dev: Duration) -> Self {
        Self { mean, std_dev }
    }

    pub fn is_zero(&self) -> bool {
        self.mean.is_zero() && self.std_dev.is_zero()
    }

    /// Samples a delay of a single delivery
    pub fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        if self.std_dev.is_zero() {
            return self.mean;
        }
        match Normal::new(self.mean.as_secs_f64(), self.std_dev.as_secs_f64()) {
            Ok(normal) => Duration::from_secs_f64(normal.sample(rng).max(0.0)),
            Err(_) => self.mean,
        }
    }
}

/// Channels of a party registered at [LocalRouter]
pub struct LocalDelivery<M> {
    incoming: LocalIncoming<M>,
    outgoing: LocalOutgoing<M>,
}

impl<M> Delivery<M> for LocalDelivery<M>
where
    M: Clone + Send + 'static,
{
    type Send = LocalOutgoing<M>;
    type Receive = LocalIncoming<M>;
    type SendError = LocalRouterError;
    type ReceiveError = LocalRouterError;

    fn split(self) -> (Self::Receive, Self::Send) {
        (self.incoming, self.outgoing)
    }
}

/// Messages received by a party
pub struct LocalIncoming<M> {
    inbox: UnboundedReceiverStream<Msg<M>>,
}

impl<M> Stream for LocalIncoming<M> {
    type Item = Result<Msg<M>, LocalRouterError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inbox)
            .poll_next(cx)
            .map(|msg| msg.map(Ok))
    }
}

/// Broadcasts messages of a party
pub struct LocalOutgoing<M> {
    peers: Arc<RwLock<Vec<Inbox<M>>>>,
    /// Delaying links to every recipient, indexed by registration order
    links: Vec<Option<mpsc::UnboundedSender<(Instant, Msg<M>)>>>,
    latency: Latency,
}

impl<M> LocalOutgoing<M>
where
    M: Clone + Send + 'static,
{
    fn broadcast(&mut self, msg: Msg<M>) -> Result<(), LocalRouterError> {
        let peers = self.peers.read().map_err(|_| LocalRouterError::Poisoned)?;
        let now = Instant::now();
        let mut rng = rand::thread_rng();

        for (recipient, inbox) in peers.iter().enumerate() {
            if self.latency.is_zero() {
                // Recipient might have left already
                let _ = inbox.send(msg.clone());
                continue;
            }
            if self.links.len() <= recipient {
                self.links.resize_with(recipient + 1, || None);
            }
            let link = self.links[recipient].get_or_insert_with(|| spawn_link(inbox.clone()));
            let deliver_at = now + self.latency.sample(&mut rng);
            let _ = link.send((deliver_at, msg.clone()));
        }
        Ok(())
    }
}

/// Spawns a task forwarding messages to `inbox` once their delivery time comes
fn spawn_link<M: Send + 'static>(inbox: Inbox<M>) -> mpsc::UnboundedSender<(Instant, Msg<M>)> {
    let (tx, mut rx) = mpsc::unbounded_channel::<(Instant, Msg<M>)>();
    tokio::spawn(async move {
        while let Some((deliver_at, msg)) = rx.recv().await {
            time::sleep_until(deliver_at).await;
            if inbox.send(msg).is_err() {
                break;
            }
        }
    });
    tx
}

impl<M> Sink<Msg<M>> for LocalOutgoing<M>
where
    M: Clone + Send + 'static,
{
    type Error = LocalRouterError;

    fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(self: Pin<&mut Self>, msg: Msg<M>) -> Result<(), Self::Error> {
        self.get_mut().broadcast(msg)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }
}

#[derive(Debug, Error)]
pub enum LocalRouterError {
    #[error("registry of parties is poisoned")]
    Poisoned,
}
