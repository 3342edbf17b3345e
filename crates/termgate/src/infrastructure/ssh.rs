//! SSH implementation of the [`ShellConnector`] seam, built on `ssh2`
//! (libssh2 bindings).
//!
//! # Blocking model
//!
//! Each remote shell runs on its own OS threads (see `application::bridge`).
//! Connecting uses blocking libssh2 calls bounded by the connect timeout.
//! Once the shell is open the session switches to non-blocking mode, because
//! the reader and writer threads share one channel behind one lock:
//!
//! - a read that finds no data releases the lock and then sleeps briefly,
//!   so a keystroke never waits behind an idle read;
//! - writes, flushes and resizes retry `WouldBlock` with the lock released
//!   between attempts, bounded by the connect timeout.
//!
//! Close switches back to blocking mode for the final EOF and disconnect.
//!
//! # Connect sequence
//!
//! ```text
//! resolve host (default port 22)
//!   → TCP connect_timeout           NetworkError on failure
//!   → SSH handshake                 ProtocolError (NetworkError on timeout)
//!   → userauth_password             AuthError when rejected
//!   → channel + PTY + shell         ProtocolError
//!   → switch to non-blocking mode
//! ```
//!
//! Host keys are not verified.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use ssh2::{Channel, ErrorCode, Session};
use termgate_core::{Credentials, TermGeometry};
use tracing::{debug, info};

use crate::application::bridge::{ConnectError, ConnectRequest, RemoteShell, ShellConnector};

/// Port used when the host string carries none.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Longest an idle read sleeps before the reader polls again.
const IDLE_WAIT_CAP: Duration = Duration::from_millis(10);

/// Pause between retries of a write or resize that would block.
const RETRY_BACKOFF: Duration = Duration::from_millis(1);

// libssh2 session error codes the connector classifies.
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;

/// Opens interactive shells over SSH with password authentication.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }
}

impl ShellConnector for SshConnector {
    fn connect(
        &self,
        request: &ConnectRequest,
        credentials: Credentials,
    ) -> Result<Box<dyn RemoteShell>, ConnectError> {
        let started = Instant::now();
        let host = &request.target.host;
        let tcp = connect_tcp(host, request.connect_timeout)?;

        let mut session = Session::new().map_err(|e| classify("session init", &e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(millis(remaining(started, request.connect_timeout)));
        session.handshake().map_err(|e| classify("handshake", &e))?;

        session
            .userauth_password(&request.target.username, credentials.expose())
            .map_err(|e| classify("authentication", &e))?;
        if !session.authenticated() {
            return Err(ConnectError::Auth);
        }
        // The secret is not needed past this point.
        drop(credentials);

        session.set_timeout(millis(remaining(started, request.connect_timeout)));
        let mut channel = session
            .channel_session()
            .map_err(|e| classify("channel open", &e))?;
        let TermGeometry { cols, rows } = request.geometry;
        channel
            .request_pty(
                &request.term_type,
                None,
                Some((u32::from(cols), u32::from(rows), 0, 0)),
            )
            .map_err(|e| classify("pty request", &e))?;
        channel.shell().map_err(|e| classify("shell request", &e))?;

        session.set_blocking(false);

        info!(
            "ssh shell open for {}@{host} ({}x{}, TERM={})",
            request.target.username, cols, rows, request.term_type
        );
        Ok(Box::new(SshShell {
            session,
            close_timeout: request.connect_timeout,
            channel: Polled::new(channel, request.read_timeout, request.connect_timeout),
        }))
    }
}

// ── Connect helpers ───────────────────────────────────────────────────────────

/// Resolves `host` (optionally `host:port`) to socket addresses.
pub fn resolve(host: &str) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = match host.to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        // No port in the string (or a bare IPv6 literal): use the default.
        Err(_) => (host, DEFAULT_SSH_PORT).to_socket_addrs()?.collect(),
    };
    if addrs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{host} did not resolve to any address"),
        ));
    }
    Ok(addrs)
}

fn connect_tcp(host: &str, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let addrs = resolve(host)
        .map_err(|e| ConnectError::Network(format!("cannot resolve {host}: {e}")))?;

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                debug!("tcp connected to {addr}");
                return Ok(stream);
            }
            Err(e) => last_error = Some(format!("{addr}: {e}")),
        }
    }
    Err(ConnectError::Network(
        last_error.unwrap_or_else(|| format!("no address for {host}")),
    ))
}

/// Maps a libssh2 failure to the gateway's three-way error taxonomy.
fn classify(stage: &str, error: &ssh2::Error) -> ConnectError {
    match error.code() {
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
        | ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED) => ConnectError::Auth,
        ErrorCode::Session(
            LIBSSH2_ERROR_TIMEOUT
            | LIBSSH2_ERROR_SOCKET_SEND
            | LIBSSH2_ERROR_SOCKET_RECV
            | LIBSSH2_ERROR_SOCKET_DISCONNECT,
        ) => ConnectError::Network(format!("{stage}: {}", error.message())),
        _ => ConnectError::Protocol(format!("{stage}: {}", error.message())),
    }
}

fn remaining(started: Instant, budget: Duration) -> Duration {
    budget
        .checked_sub(started.elapsed())
        .unwrap_or(Duration::from_millis(1))
}

/// libssh2 takes milliseconds as `u32`; zero would mean "no timeout".
fn millis(d: Duration) -> u32 {
    u32::try_from(d.as_millis()).unwrap_or(u32::MAX).max(1)
}

// ── Shell ─────────────────────────────────────────────────────────────────────

/// The channel operations a shell needs.
trait ShellStream: Read + Write + Send {
    fn at_eof(&self) -> bool;

    fn request_size(&mut self, geometry: TermGeometry) -> io::Result<()>;
}

impl ShellStream for Channel {
    fn at_eof(&self) -> bool {
        self.eof()
    }

    fn request_size(&mut self, geometry: TermGeometry) -> io::Result<()> {
        self.request_pty_size(u32::from(geometry.cols), u32::from(geometry.rows), None, None)
            .map_err(io::Error::from)
    }
}

/// A non-blocking stream shared by the reader and writer threads.
///
/// The lock is held for one non-blocking call at a time and never across a
/// sleep.
struct Polled<C> {
    stream: Mutex<C>,
    idle_wait: Duration,
    op_timeout: Duration,
}

impl<C: ShellStream> Polled<C> {
    fn new(stream: C, poll_interval: Duration, op_timeout: Duration) -> Self {
        Self {
            stream: Mutex::new(stream),
            idle_wait: poll_interval.min(IDLE_WAIT_CAP),
            op_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, C> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads available data, or sleeps `idle_wait` and reports `WouldBlock`.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let result = {
            let mut stream = self.lock();
            match stream.read(buf) {
                // libssh2 can return zero on a window adjust; not end of stream.
                Ok(0) if !stream.at_eof() => {
                    Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"))
                }
                other => other,
            }
        };
        if matches!(&result, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
            thread::sleep(self.idle_wait);
        }
        result
    }

    /// Runs `op` until it stops reporting `WouldBlock` or `op_timeout` passes.
    fn retry<T>(&self, what: &str, mut op: impl FnMut(&mut C) -> io::Result<T>) -> io::Result<T> {
        let deadline = Instant::now() + self.op_timeout;
        loop {
            let mut stream = self.lock();
            let result = op(&mut *stream);
            drop(stream);
            match result {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            format!("{what} did not complete within {:?}", self.op_timeout),
                        ));
                    }
                    thread::sleep(RETRY_BACKOFF);
                }
                other => return other,
            }
        }
    }

    fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let n = self.retry("write", |stream| stream.write(rest))?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "remote window closed"));
            }
            rest = &rest[n..];
        }
        self.retry("flush", |stream| stream.flush())
    }

    fn resize(&self, geometry: TermGeometry) -> io::Result<()> {
        self.retry("resize", |stream| stream.request_size(geometry))
    }
}

/// One open SSH channel with a PTY.
///
/// libssh2 is not safe for concurrent use of one session, so the channel sits
/// behind a [`Polled`] lock.
struct SshShell {
    session: Session,
    close_timeout: Duration,
    channel: Polled<Channel>,
}

impl RemoteShell for SshShell {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.channel.read(buf)
    }

    fn write_all(&self, data: &[u8]) -> io::Result<()> {
        self.channel.write_all(data)
    }

    fn resize(&self, geometry: TermGeometry) -> io::Result<()> {
        self.channel.resize(geometry)
    }

    fn close(&self) {
        {
            let mut channel = self.channel.lock();
            self.session.set_timeout(millis(self.close_timeout));
            self.session.set_blocking(true);
            let _ = channel.send_eof();
            let _ = channel.close();
        }
        let _ = self
            .session
            .disconnect(None, "session closed by gateway", None);
        debug!("ssh session disconnected");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
