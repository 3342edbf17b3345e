//! Transport seam between the session logic and the client-facing socket.
//!
//! The application layer never names a WebSocket type.  The infrastructure
//! layer adapts its stream halves into these two shapes:
//!
//! - inbound: any `Stream<Item = Inbound>` (text frames or a disconnect)
//! - outbound: a [`FrameSink`] that accepts [`ServerMessage`]s
//!
//! Tests drive the session handler with in-memory channels through the same
//! seam (see [`ChannelSink`]).

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::stream::{self, Stream};
use termgate_core::ServerMessage;
use tokio::sync::mpsc;

/// One inbound event from the client transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A text frame, still undecoded.
    Text(String),
    /// The client closed the connection or the transport failed.
    Disconnected,
}

/// The receiving half of a client connection, as consumed by the session
/// handler.
pub type InboundStream = Pin<Box<dyn Stream<Item = Inbound> + Send>>;

/// Creates an in-memory inbound stream fed by the returned sender.
///
/// Dropping the sender ends the stream, which the handler treats like a
/// disconnect.
pub fn inbound_channel() -> (mpsc::UnboundedSender<Inbound>, InboundStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stream = stream::unfold(rx, |mut rx| async move {
        let item = rx.recv().await?;
        Some((item, rx))
    });
    (tx, Box::pin(stream))
}

/// The client went away while a frame was being sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client transport closed")]
pub struct SinkClosed;

/// The sending half of a client connection.
///
/// Implementations are only ever called from the Tokio runtime that owns the
/// connection; blocking threads hand their data to the outbound dispatcher
/// instead.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Sends one message as one frame.
    async fn send(&mut self, msg: ServerMessage) -> Result<(), SinkClosed>;

    /// Closes the connection.  Best effort; errors are ignored.
    async fn close(&mut self);
}

/// A [`FrameSink`] that forwards into an in-memory channel.
///
/// Used by tests and by embedders that want to observe the outbound stream.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send(&mut self, msg: ServerMessage) -> Result<(), SinkClosed> {
        self.tx.send(msg).map_err(|_| SinkClosed)
    }

    async fn close(&mut self) {}
}
