//! Outbound dispatcher: the only path by which terminal output reaches a
//! browser.
//!
//! # Two execution contexts, one FIFO
//!
//! ```text
//!  reader thread (blocking SSH reads)          Tokio runtime (WebSocket I/O)
//!  ─────────────────────────────────           ─────────────────────────────
//!  OutboundQueue::push(chunk) ──► [ mpsc, 128 chunks ] ──► OutboundDrain::next()
//!  OutboundQueue::finish(reason) ─► closure slot ──┘         │
//!                                                            ▼
//!                                                run_dispatcher: sink.send(Output)
//! ```
//!
//! The reader thread never touches the WebSocket.  It only pushes onto the
//! queue from a plain OS thread.  The drain half lives on the Tokio runtime
//! and owns every call into the transport.
//!
//! # Backpressure
//!
//! The queue holds at most [`OUTBOUND_CAPACITY`] chunks.  When a client stops
//! reading, the dispatcher blocks in `sink.send`, the queue fills, and
//! [`OutboundQueue::push`] blocks the reader thread.  The reader then stops
//! reading the remote channel, so the SSH window closes and the remote
//! program is throttled.  A blocked push still gives up as soon as the
//! session stops running, so close is never held up by a stalled client.
//!
//! The closure reason does not travel through the queue: [`OutboundQueue::finish`]
//! stores it and drops the sender, so finishing never waits for space.  The
//! drain reports it after the last queued chunk.
//!
//! # Ordering
//!
//! The channel is FIFO and has exactly one producer per session, so chunks
//! leave in the order they were read.  The drain may merge adjacent chunks
//! into one frame (up to `max_frame` bytes) but never reorders or drops them.
//!
//! # UTF-8 framing
//!
//! Frames carry text.  A multi-byte character split across two reads is held
//! back by [`Utf8Carry`] until its remaining bytes arrive, so concatenating
//! frame payloads reproduces the remote byte stream exactly for valid UTF-8.

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::thread;
use std::time::Duration;

use termgate_core::{SessionId, ServerMessage};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use super::transport::FrameSink;

/// Chunks one session may have queued before its reader blocks.
pub const OUTBOUND_CAPACITY: usize = 128;

/// How long a blocked push sleeps before retrying.
const FULL_BACKOFF: Duration = Duration::from_millis(5);

// ── Queue events ──────────────────────────────────────────────────────────────

/// Why a remote stream stopped producing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteClosed {
    /// The remote side closed the stream (zero-length read).
    Eof,
    /// A read failed, or the reader stopped without saying why.
    Error(String),
    /// The session asked the reader to stop.
    Cancelled,
}

impl fmt::Display for RemoteClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteClosed::Eof => f.write_str("remote end of stream"),
            RemoteClosed::Error(e) => write!(f, "remote stream error: {e}"),
            RemoteClosed::Cancelled => f.write_str("reader cancelled"),
        }
    }
}

type ClosureSlot = Arc<StdMutex<Option<RemoteClosed>>>;

/// Returned by [`OutboundQueue::push`] once the drain half has been dropped
/// or the caller gave up waiting for space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

/// Creates the producer/consumer pair for one session.
///
/// `max_frame` bounds how many queued bytes the drain merges into one frame.
pub fn channel(max_frame: usize) -> (OutboundQueue, OutboundDrain) {
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let closure = ClosureSlot::default();
    (
        OutboundQueue {
            tx,
            closure: Arc::clone(&closure),
        },
        OutboundDrain {
            rx,
            closure,
            decoder: Utf8Carry::default(),
            max_frame: max_frame.max(1),
            pending_close: None,
            finished: false,
        },
    )
}

// ── Producer half ─────────────────────────────────────────────────────────────

/// Producer half, owned by the session's reader thread.
#[derive(Debug)]
pub struct OutboundQueue {
    tx: mpsc::Sender<Vec<u8>>,
    closure: ClosureSlot,
}

impl OutboundQueue {
    /// Enqueues one chunk read from the remote stream.
    ///
    /// Blocks the calling thread while the queue is full, re-checking
    /// `keep_going` every few milliseconds.  Must not be called from async
    /// code.
    ///
    /// # Errors
    ///
    /// Returns [`QueueClosed`] if the consumer is gone or `keep_going`
    /// returned `false` while waiting; the reader should stop.
    pub fn push(&self, chunk: Vec<u8>, keep_going: impl Fn() -> bool) -> Result<(), QueueClosed> {
        let mut chunk = chunk;
        loop {
            match self.tx.try_send(chunk) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(QueueClosed),
                Err(mpsc::error::TrySendError::Full(back)) => {
                    if !keep_going() {
                        return Err(QueueClosed);
                    }
                    chunk = back;
                    thread::sleep(FULL_BACKOFF);
                }
            }
        }
    }

    /// Records why the stream ended and consumes the producer.  Never blocks.
    pub fn finish(self, reason: RemoteClosed) {
        *self.closure.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
        // Dropping `tx` here wakes the drain once it has taken every chunk.
    }
}

// ── Consumer half ─────────────────────────────────────────────────────────────

/// One unit handed to the transport by [`OutboundDrain::next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Drained {
    /// Terminal output for one `output` frame.
    Frame(String),
    /// The remote stream ended.  Always the last item.
    Closed(RemoteClosed),
}

/// Consumer half, polled on the Tokio runtime.
#[derive(Debug)]
pub struct OutboundDrain {
    rx: mpsc::Receiver<Vec<u8>>,
    closure: ClosureSlot,
    decoder: Utf8Carry,
    max_frame: usize,
    pending_close: Option<RemoteClosed>,
    finished: bool,
}

impl OutboundDrain {
    /// Waits for the next frame or the closure signal.
    ///
    /// Returns `None` after [`Drained::Closed`] has been yielded.  A producer
    /// that disappears without calling `finish` (for example because its
    /// thread panicked) is reported as [`RemoteClosed::Error`].
    pub async fn next(&mut self) -> Option<Drained> {
        if self.finished {
            return None;
        }

        loop {
            if let Some(reason) = self.pending_close.take() {
                let tail = self.decoder.finish();
                if !tail.is_empty() {
                    self.pending_close = Some(reason);
                    return Some(Drained::Frame(tail));
                }
                self.finished = true;
                return Some(Drained::Closed(reason));
            }

            let mut batch = match self.rx.recv().await {
                Some(bytes) => bytes,
                None => {
                    self.pending_close = Some(self.closure_reason());
                    continue;
                }
            };

            // Coalesce whatever else is already queued, without waiting.
            while batch.len() < self.max_frame {
                match self.rx.try_recv() {
                    Ok(more) => batch.extend_from_slice(&more),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.pending_close = Some(self.closure_reason());
                        break;
                    }
                }
            }

            let text = self.decoder.decode(&batch);
            if !text.is_empty() {
                return Some(Drained::Frame(text));
            }
        }
    }
}

impl OutboundDrain {
    fn closure_reason(&self) -> RemoteClosed {
        self.closure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| RemoteClosed::Error("remote reader stopped unexpectedly".to_string()))
    }
}

/// Drains `drain` into `sink` until the remote stream closes.
///
/// This is the consumer loop of the dispatcher and runs as a Tokio task on
/// the transport's runtime.  The closure reason is reported on `closed_tx`,
/// which drives the session handler into CLOSING.
pub async fn run_dispatcher<S: FrameSink>(
    session_id: SessionId,
    mut drain: OutboundDrain,
    sink: Arc<Mutex<S>>,
    closed_tx: oneshot::Sender<RemoteClosed>,
) {
    while let Some(item) = drain.next().await {
        match item {
            Drained::Frame(data) => {
                let mut sink = sink.lock().await;
                if sink.send(ServerMessage::Output { data }).await.is_err() {
                    debug!("session {session_id}: output send failed (client disconnected)");
                    return;
                }
            }
            Drained::Closed(reason) => {
                debug!("session {session_id}: dispatcher drained ({reason})");
                // The handler may already be closing and no longer listening.
                let _ = closed_tx.send(reason);
                return;
            }
        }
    }
}

// ── Incremental UTF-8 decoding ────────────────────────────────────────────────

/// Incremental UTF-8 decoder that carries an incomplete trailing sequence
/// over to the next call.
#[derive(Debug, Default)]
pub struct Utf8Carry {
    pending: Vec<u8>,
}

impl Utf8Carry {
    /// Decodes as much of `pending ++ bytes` as possible.
    ///
    /// Invalid sequences become U+FFFD.  An incomplete sequence at the end is
    /// kept for the next call.
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(s) => {
                    out.push_str(s);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                    }
                }
            }
        }
    }

    /// Flushes any held-back bytes (lossily) at end of stream.
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
