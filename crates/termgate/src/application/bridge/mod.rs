//! Remote session bridge: one authenticated remote shell and its PTY.
//!
//! # Threading model
//!
//! The remote login protocol is driven through blocking calls.  Blocking
//! calls must never run on the Tokio runtime that multiplexes all browser
//! connections, so each live bridge owns two dedicated OS threads:
//!
//! ```text
//!                    ┌──────────── reader thread ────────────┐
//!  remote shell ───► │ loop { if !running break;             │ ──► OutboundQueue
//!                    │        read(buf) /* ≤ poll timeout */ }│
//!                    └───────────────────────────────────────┘
//!                    ┌──────────── writer thread ────────────┐
//!  Bridge::write ──► │ for cmd in commands { write | resize } │ ──► remote shell
//!  Bridge::resize    └───────────────────────────────────────┘
//! ```
//!
//! [`Bridge::write`] and [`Bridge::resize`] only push onto a channel, so they
//! are safe to call from async code.  The connect step itself is blocking and
//! is run by the session handler on Tokio's blocking pool.
//!
//! # Cancellation
//!
//! [`Bridge::close`] clears the shared `running` flag and drops the command
//! channel.  The writer thread wakes immediately, releases the remote shell
//! and exits; the reader thread notices within one read timeout, or within
//! a few milliseconds if it is blocked on a full outbound queue.  Release
//! happens exactly once no matter which thread, or how many triggers, get
//! there first.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use termgate_core::{Credentials, RemoteTarget, SessionId, TermGeometry};
use thiserror::Error;
use tracing::{debug, warn};

use super::outbound::{OutboundQueue, RemoteClosed};

pub mod mock;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Why a remote connect attempt failed.
///
/// The three classes are reported to the browser with distinct messages.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
    /// The remote host rejected the credentials.
    #[error("authentication failed")]
    Auth,

    /// The host could not be reached: timeout, refused, unresolved.
    #[error("network error: {0}")]
    Network(String),

    /// Connected, but session negotiation failed (handshake, channel, PTY).
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Returned by [`Bridge::write`] / [`Bridge::resize`] after close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("bridge is closed")]
pub struct BridgeClosed;

// ── Connector seam ────────────────────────────────────────────────────────────

/// Everything a connector needs besides the password.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub target: RemoteTarget,
    /// PTY size to allocate.
    pub geometry: TermGeometry,
    /// `TERM` value for the PTY.
    pub term_type: String,
    /// Upper bound on the whole connect call.
    pub connect_timeout: Duration,
    /// Timeout applied to each read once the shell is open.
    pub read_timeout: Duration,
}

/// Opens remote shells.  Implementations block; callers run them off the
/// async runtime.
#[cfg_attr(test, mockall::automock)]
pub trait ShellConnector: Send + Sync + 'static {
    /// Connects, authenticates and opens a shell on a PTY.
    ///
    /// `credentials` is consumed: it is dropped when this call returns.
    fn connect(
        &self,
        request: &ConnectRequest,
        credentials: Credentials,
    ) -> Result<Box<dyn RemoteShell>, ConnectError>;
}

/// An open remote shell.
///
/// All methods take `&self` so the reader and writer threads can share one
/// instance; implementations provide their own interior synchronisation.
pub trait RemoteShell: Send + Sync {
    /// Blocking read bounded by the shell's read timeout.
    ///
    /// `Ok(0)` means end of stream.  An error of kind `TimedOut` or
    /// `WouldBlock` means no data arrived within the timeout.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes all of `data` to the remote stdin.
    fn write_all(&self, data: &[u8]) -> io::Result<()>;

    /// Changes the remote PTY size.
    fn resize(&self, geometry: TermGeometry) -> io::Result<()>;

    /// Releases the remote connection.  Must be idempotent.
    fn close(&self);
}

// ── Bridge ────────────────────────────────────────────────────────────────────

enum Command {
    Write(Vec<u8>),
    Resize(TermGeometry),
}

struct Shared {
    shell: Box<dyn RemoteShell>,
    running: AtomicBool,
    released: AtomicBool,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Closes the remote shell exactly once.
    fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.stop();
        self.shell.close();
        true
    }
}

/// A cloneable handle that can stop a bridge from outside its session.
///
/// Used by the registry to force-release stragglers at shutdown.  Stopping
/// is signal-only (no blocking call), so it is safe from async code.
#[derive(Clone)]
pub struct BridgeStopper {
    shared: Arc<Shared>,
}

impl BridgeStopper {
    pub fn stop(&self) {
        self.shared.stop();
    }
}

impl std::fmt::Debug for BridgeStopper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeStopper")
            .field("running", &self.shared.is_running())
            .finish()
    }
}

/// Reader tuning.
#[derive(Debug, Clone, Copy)]
pub struct ReaderSettings {
    /// Size of each blocking read.
    pub chunk_size: usize,
}

/// A live bridge between one session and one remote shell.
pub struct Bridge {
    session_id: SessionId,
    shared: Arc<Shared>,
    commands: Option<mpsc::Sender<Command>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Starts the reader and writer threads for an already-connected shell.
    ///
    /// Every chunk the reader gets is pushed onto `queue`; when the remote
    /// stream ends (or the bridge is closed) the reader finishes the queue
    /// with the reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to spawn a thread.  The shell is
    /// released before returning.
    pub fn start(
        session_id: SessionId,
        shell: Box<dyn RemoteShell>,
        queue: OutboundQueue,
        settings: ReaderSettings,
    ) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            shell,
            running: AtomicBool::new(true),
            released: AtomicBool::new(false),
        });

        let reader_shared = Arc::clone(&shared);
        let reader = thread::Builder::new()
            .name(format!("termgate-rd-{session_id}"))
            .spawn(move || reader_loop(session_id, reader_shared, queue, settings));
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                shared.release();
                return Err(e);
            }
        };

        let (tx, rx) = mpsc::channel();
        let writer_shared = Arc::clone(&shared);
        let writer = thread::Builder::new()
            .name(format!("termgate-wr-{session_id}"))
            .spawn(move || writer_loop(session_id, writer_shared, rx));
        let writer = match writer {
            Ok(handle) => handle,
            Err(e) => {
                // The reader sees the flag and exits on its own.
                shared.release();
                return Err(e);
            }
        };

        Ok(Self {
            session_id,
            shared,
            commands: Some(tx),
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// Forwards input bytes to the remote shell.  Never blocks.
    pub fn write(&self, data: Vec<u8>) -> Result<(), BridgeClosed> {
        self.send(Command::Write(data))
    }

    /// Requests a PTY resize.  Never blocks.
    pub fn resize(&self, geometry: TermGeometry) -> Result<(), BridgeClosed> {
        self.send(Command::Resize(geometry))
    }

    fn send(&self, cmd: Command) -> Result<(), BridgeClosed> {
        if !self.shared.is_running() {
            return Err(BridgeClosed);
        }
        self.commands
            .as_ref()
            .ok_or(BridgeClosed)?
            .send(cmd)
            .map_err(|_| BridgeClosed)
    }

    /// Returns a handle that can stop this bridge from another task.
    pub fn stopper(&self) -> BridgeStopper {
        BridgeStopper {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stops both threads and schedules release of the remote shell.
    ///
    /// Idempotent.  Does not block: the writer thread performs the release.
    pub fn close(&mut self) {
        self.shared.stop();
        if self.commands.take().is_some() {
            debug!("session {}: bridge close requested", self.session_id);
        }
        // Detach: both threads exit on their own within one read timeout.
        self.reader.take();
        self.writer.take();
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.close();
    }
}

// ── Threads ───────────────────────────────────────────────────────────────────

fn reader_loop(
    session_id: SessionId,
    shared: Arc<Shared>,
    queue: OutboundQueue,
    settings: ReaderSettings,
) {
    let mut buf = vec![0u8; settings.chunk_size.max(1)];

    let reason = loop {
        if !shared.is_running() {
            break RemoteClosed::Cancelled;
        }
        match shared.shell.read(&mut buf) {
            Ok(0) => break RemoteClosed::Eof,
            Ok(n) => {
                // Blocks while the client is behind; the remote is not read meanwhile.
                if queue.push(buf[..n].to_vec(), || shared.is_running()).is_err() {
                    break RemoteClosed::Cancelled;
                }
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => {
                if shared.is_running() {
                    break RemoteClosed::Error(e.to_string());
                }
                // A read interrupted by our own close is a cancellation.
                break RemoteClosed::Cancelled;
            }
        }
    };

    debug!("session {session_id}: reader stopped ({reason})");
    queue.finish(reason);
    shared.release();
}

fn writer_loop(session_id: SessionId, shared: Arc<Shared>, commands: mpsc::Receiver<Command>) {
    while let Ok(cmd) = commands.recv() {
        if !shared.is_running() {
            break;
        }
        match cmd {
            Command::Write(data) => {
                if let Err(e) = shared.shell.write_all(&data) {
                    warn!("session {session_id}: remote write failed: {e}");
                    shared.stop();
                    break;
                }
            }
            Command::Resize(geometry) => {
                if let Err(e) = shared.shell.resize(geometry) {
                    warn!(
                        "session {session_id}: remote resize to {}x{} failed: {e}",
                        geometry.cols, geometry.rows
                    );
                }
            }
        }
    }

    if shared.release() {
        debug!("session {session_id}: remote shell released");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
