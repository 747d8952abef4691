//! Router over TCP
//!
//! [TcpHub] is a relay server: every frame received from a connected party is stamped with the
//! party's index and forwarded to all connected parties, the sender included. [TcpRouter] is the
//! client side, producing a [TcpDelivery] per connection.
//!
//! Wire format: every frame is prefixed with its length as u32 big-endian. After connecting, a
//! client sends a hello frame with its party index (u16 big-endian) and waits for a one-byte ack.
//! Relayed frames carry the sender index (u16 big-endian) followed by the `bincode`-encoded
//! message body.
//!
//! __*Warning:*__ frames are neither encrypted nor authenticated, and the hub trusts the index a
//! client claims in hello. Use it for development or inside a trusted network.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{BufMut, Bytes, BytesMut};
use futures::{ready, Sink, SinkExt, Stream, StreamExt};
use phantom_type::PhantomType;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, RwLock};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::{Delivery, Msg};

use super::Router;

/// Default limit of a single frame
pub const DEFAULT_FRAME_LIMIT: usize = 8 * 1024 * 1024;

const ACCEPTED: u8 = 1;
const REJECTED: u8 = 0;

type Peers = Arc<RwLock<HashMap<u16, mpsc::UnboundedSender<Bytes>>>>;

fn codec(frame_limit: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(frame_limit)
        .new_codec()
}

/// Relay server that parties connect to
pub struct TcpHub {
    listener: TcpListener,
    frame_limit: usize,
    peers: Peers,
}

impl TcpHub {
    /// Binds a hub to given address
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        TcpListener::bind(addr).await.map(Self::new)
    }

    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            frame_limit: DEFAULT_FRAME_LIMIT,
            peers: Default::default(),
        }
    }

    /// Limits size of frames accepted from parties
    pub fn set_frame_limit(self, frame_limit: usize) -> Self {
        Self {
            frame_limit,
            ..self
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until an I/O error occurs on the listener
    ///
    /// Every connection is served by its own task. Failure of a single connection is logged and
    /// doesn't affect others.
    pub async fn run(self) -> io::Result<()> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let peers = self.peers.clone();
            let frame_limit = self.frame_limit;
            tokio::spawn(async move {
                if let Err(err) = serve(stream, peers, frame_limit).await {
                    tracing::warn!(%addr, %err, "hub connection failed");
                }
            });
        }
    }
}

async fn serve(stream: TcpStream, peers: Peers, frame_limit: usize) -> Result<(), TcpRouterError> {
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    let mut frames_in = FramedRead::new(read, codec(frame_limit));
    let mut frames_out = FramedWrite::new(write, codec(frame_limit));

    let hello = frames_in
        .next()
        .await
        .ok_or(TcpRouterError::HandshakeEof)??;
    let party_i = match &hello[..] {
        [hi, lo] => u16::from_be_bytes([*hi, *lo]),
        _ => return Err(TcpRouterError::MalformedHello),
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    {
        let mut peers = peers.write().await;
        if peers.contains_key(&party_i) {
            drop(peers);
            frames_out.send(Bytes::from_static(&[REJECTED])).await?;
            return Err(TcpRouterError::Rejected { party_i });
        }
        peers.insert(party_i, tx);
    }
    frames_out.send(Bytes::from_static(&[ACCEPTED])).await?;
    tracing::debug!(party = party_i, "party joined the hub");

    // Writer exits once the party is removed from `peers` and its queue is drained
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(err) = frames_out.send(frame).await {
                tracing::debug!(party = party_i, %err, "couldn't relay frame");
                break;
            }
        }
    });

    let result = relay(party_i, &mut frames_in, &peers).await;
    peers.write().await.remove(&party_i);
    tracing::debug!(party = party_i, "party left the hub");
    result
}

async fn relay(
    party_i: u16,
    frames_in: &mut FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    peers: &Peers,
) -> Result<(), TcpRouterError> {
    while let Some(frame) = frames_in.next().await {
        let frame = frame?;
        let mut stamped = BytesMut::with_capacity(2 + frame.len());
        stamped.put_u16(party_i);
        stamped.extend_from_slice(&frame);
        let stamped = stamped.freeze();

        for tx in peers.read().await.values() {
            let _ = tx.send(stamped.clone());
        }
    }
    Ok(())
}

/// Connects parties to a [TcpHub]
#[derive(Debug, Clone)]
pub struct TcpRouter {
    hub: SocketAddr,
    party_i: u16,
    frame_limit: usize,
}

impl TcpRouter {
    pub fn new(hub: SocketAddr, party_i: u16) -> Self {
        Self {
            hub,
            party_i,
            frame_limit: DEFAULT_FRAME_LIMIT,
        }
    }

    /// Limits size of sent and received frames
    pub fn set_frame_limit(self, frame_limit: usize) -> Self {
        Self {
            frame_limit,
            ..self
        }
    }

    /// Connects to the hub and registers as party `party_i`
    pub async fn connect<M>(&self) -> Result<TcpDelivery<M>, TcpRouterError> {
        let stream = TcpStream::connect(self.hub).await?;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        let mut frames_in = FramedRead::new(read, codec(self.frame_limit));
        let mut frames_out = FramedWrite::new(write, codec(self.frame_limit));

        frames_out
            .send(Bytes::copy_from_slice(&self.party_i.to_be_bytes()))
            .await?;
        let ack = frames_in
            .next()
            .await
            .ok_or(TcpRouterError::HandshakeEof)??;
        if ack[..] != [ACCEPTED] {
            return Err(TcpRouterError::Rejected {
                party_i: self.party_i,
            });
        }
        tracing::debug!(party = self.party_i, hub = %self.hub, "connected to hub");

        Ok(TcpDelivery {
            incoming: TcpIncoming {
                frames: frames_in,
                _msg: PhantomType::new(),
            },
            outgoing: TcpOutgoing {
                frames: frames_out,
                party_i: self.party_i,
                _msg: PhantomType::new(),
            },
        })
    }
}

impl<M> Router<M> for TcpRouter
where
    M: Serialize + DeserializeOwned + Send + 'static,
{
    type Delivery = TcpDelivery<M>;
    type Error = TcpRouterError;

    fn register(&self) -> impl Future<Output = Result<Self::Delivery, Self::Error>> + Send {
        self.connect()
    }
}

/// Connection to a [TcpHub]
pub struct TcpDelivery<M> {
    incoming: TcpIncoming<M>,
    outgoing: TcpOutgoing<M>,
}

impl<M> Delivery<M> for TcpDelivery<M>
where
    M: Serialize + DeserializeOwned,
{
    type Send = TcpOutgoing<M>;
    type Receive = TcpIncoming<M>;
    type SendError = TcpRouterError;
    type ReceiveError = TcpRouterError;

    fn split(self) -> (Self::Receive, Self::Send) {
        (self.incoming, self.outgoing)
    }
}

/// Messages relayed by the hub
pub struct TcpIncoming<M> {
    frames: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    _msg: PhantomType<M>,
}

impl<M: DeserializeOwned> Stream for TcpIncoming<M> {
    type Item = Result<Msg<M>, TcpRouterError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let frame = match ready!(Pin::new(&mut self.frames).poll_next(cx)) {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => return Poll::Ready(Some(Err(err.into()))),
            None => return Poll::Ready(None),
        };
        Poll::Ready(Some(decode_frame(&frame)))
    }
}

fn decode_frame<M: DeserializeOwned>(frame: &[u8]) -> Result<Msg<M>, TcpRouterError> {
    match frame {
        [hi, lo, body @ ..] => Ok(Msg {
            sender: u16::from_be_bytes([*hi, *lo]),
            body: bincode::deserialize(body).map_err(TcpRouterError::Deserialize)?,
        }),
        _ => Err(TcpRouterError::ShortFrame { len: frame.len() }),
    }
}

/// Sends messages to the hub
pub struct TcpOutgoing<M> {
    frames: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
    party_i: u16,
    _msg: PhantomType<M>,
}

impl<M: Serialize> Sink<Msg<M>> for TcpOutgoing<M> {
    type Error = TcpRouterError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Sink::<Bytes>::poll_ready(Pin::new(&mut self.frames), cx).map_err(Into::into)
    }

    fn start_send(mut self: Pin<&mut Self>, msg: Msg<M>) -> Result<(), Self::Error> {
        if msg.sender != self.party_i {
            return Err(TcpRouterError::SenderMismatch {
                expected: self.party_i,
                actual: msg.sender,
            });
        }
        let body = bincode::serialize(&msg.body).map_err(TcpRouterError::Serialize)?;
        Pin::new(&mut self.frames)
            .start_send(Bytes::from(body))
            .map_err(Into::into)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Sink::<Bytes>::poll_flush(Pin::new(&mut self.frames), cx).map_err(Into::into)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Sink::<Bytes>::poll_close(Pin::new(&mut self.frames), cx).map_err(Into::into)
    }
}

#[derive(Debug, Error)]
pub enum TcpRouterError {
    #[error("i/o error")]
    Io(#[from] io::Error),
    #[error("connection closed during handshake")]
    HandshakeEof,
    #[error("malformed hello frame")]
    MalformedHello,
    #[error("hub rejected party {party_i}: index is already taken")]
    Rejected { party_i: u16 },
    #[error("frame of {len} bytes is too short to carry sender index")]
    ShortFrame { len: usize },
    #[error("message claims sender {actual}, but connection belongs to party {expected}")]
    SenderMismatch { expected: u16, actual: u16 },
    #[error("serialize message")]
    Serialize(#[source] bincode::Error),
    #[error("deserialize message")]
    Deserialize(#[source] bincode::Error),
}
