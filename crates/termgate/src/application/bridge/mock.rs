//! In-memory remote shell for tests and local development.
//!
//! [`MockConnector`] implements [`ShellConnector`] without any network.  The
//! shells it opens behave like a tiny remote host:
//!
//! - an optional banner is emitted as soon as the shell opens
//! - in echo mode every write is echoed back (like a PTY with echo on), and
//!   writing the line `exit` ends the stream
//! - in scripted mode the banner is followed by end of stream
//!
//! A [`MockProbe`] observes what the gateway did to the shells: how many are
//! live, what was written, which resizes arrived, how often `close` ran.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::time::Duration;

use termgate_core::{Credentials, TermGeometry};

use super::{ConnectError, ConnectRequest, RemoteShell, ShellConnector};

// ── Probe ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ProbeState {
    attempts: AtomicUsize,
    live: AtomicUsize,
    close_calls: AtomicUsize,
    written: Mutex<Vec<u8>>,
    resizes: Mutex<Vec<TermGeometry>>,
    requests: Mutex<Vec<ConnectRequest>>,
}

/// Read-only view of everything the mock saw.  Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct MockProbe {
    state: Arc<ProbeState>,
}

impl MockProbe {
    /// Number of `connect` calls, successful or not.
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Shells opened and not yet closed.
    pub fn live_connections(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Total `RemoteShell::close` calls across all shells.
    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    /// Every byte written to any shell, in order.
    pub fn written(&self) -> Vec<u8> {
        lock(&self.state.written).clone()
    }

    /// Every resize applied to any shell, in order.
    pub fn resizes(&self) -> Vec<TermGeometry> {
        lock(&self.state.resizes).clone()
    }

    /// The most recent connect request.
    pub fn last_request(&self) -> Option<ConnectRequest> {
        lock(&self.state.requests).last().cloned()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Connector ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Behaviour {
    Echo,
    Scripted,
    Fail(ConnectError),
}

/// A [`ShellConnector`] that never touches the network.
#[derive(Debug, Clone)]
pub struct MockConnector {
    password: String,
    behaviour: Behaviour,
    banner: Vec<Vec<u8>>,
    connect_delay: Duration,
    probe: MockProbe,
}

impl MockConnector {
    /// Accepts `password`; opened shells echo their input.
    pub fn echo(password: impl Into<String>) -> Self {
        Self::with_behaviour(password.into(), Behaviour::Echo, Vec::new())
    }

    /// Accepts `password`; opened shells emit `chunks` and then end.
    pub fn scripted(password: impl Into<String>, chunks: Vec<Vec<u8>>) -> Self {
        Self::with_behaviour(password.into(), Behaviour::Scripted, chunks)
    }

    /// Every connect fails with `error`.
    pub fn failing(error: ConnectError) -> Self {
        Self::with_behaviour(String::new(), Behaviour::Fail(error), Vec::new())
    }

    fn with_behaviour(password: String, behaviour: Behaviour, banner: Vec<Vec<u8>>) -> Self {
        Self {
            password,
            behaviour,
            banner,
            connect_delay: Duration::ZERO,
            probe: MockProbe::default(),
        }
    }

    /// Output emitted as soon as an echo shell opens.
    pub fn with_banner(mut self, banner: impl Into<Vec<u8>>) -> Self {
        self.banner = vec![banner.into()];
        self
    }

    /// Makes every connect block for `delay` first.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    pub fn probe(&self) -> MockProbe {
        self.probe.clone()
    }
}

impl ShellConnector for MockConnector {
    fn connect(
        &self,
        request: &ConnectRequest,
        credentials: Credentials,
    ) -> Result<Box<dyn RemoteShell>, ConnectError> {
        let state = &self.probe.state;
        state.attempts.fetch_add(1, Ordering::SeqCst);
        lock(&state.requests).push(request.clone());

        if !self.connect_delay.is_zero() {
            std::thread::sleep(self.connect_delay);
        }

        match &self.behaviour {
            Behaviour::Fail(e) => return Err(e.clone()),
            _ if credentials.expose() != self.password => return Err(ConnectError::Auth),
            _ => {}
        }

        let (tx, rx) = mpsc::channel();
        for chunk in &self.banner {
            // The receiver is held right here, so this cannot fail.
            let _ = tx.send(chunk.clone());
        }
        let echo = match self.behaviour {
            Behaviour::Echo => Some(tx),
            // Dropping the sender makes the stream end after the banner.
            _ => None,
        };

        state.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockShell {
            incoming: Mutex::new(rx),
            echo: Mutex::new(echo),
            leftover: Mutex::new(Vec::new()),
            read_timeout: request.read_timeout,
            closed: AtomicBool::new(false),
            probe: self.probe.clone(),
        }))
    }
}

// ── Shell ─────────────────────────────────────────────────────────────────────

struct MockShell {
    incoming: Mutex<mpsc::Receiver<Vec<u8>>>,
    echo: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    leftover: Mutex<Vec<u8>>,
    read_timeout: Duration,
    closed: AtomicBool,
    probe: MockProbe,
}

impl MockShell {
    fn shut(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        lock(&self.echo).take();
        self.probe.state.live.fetch_sub(1, Ordering::SeqCst);
        true
    }
}

impl RemoteShell for MockShell {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "shell closed"));
        }

        let mut leftover = lock(&self.leftover);
        if leftover.is_empty() {
            match lock(&self.incoming).recv_timeout(self.read_timeout) {
                Ok(chunk) => *leftover = chunk,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }

        let n = leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&leftover[..n]);
        leftover.drain(..n);
        Ok(n)
    }

    fn write_all(&self, data: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "shell closed"));
        }
        lock(&self.probe.state.written).extend_from_slice(data);

        let mut echo = lock(&self.echo);
        if let Some(tx) = echo.as_ref() {
            let _ = tx.send(data.to_vec());
        }
        if String::from_utf8_lossy(data).trim() == "exit" {
            echo.take();
        }
        Ok(())
    }

    fn resize(&self, geometry: TermGeometry) -> io::Result<()> {
        lock(&self.probe.state.resizes).push(geometry);
        Ok(())
    }

    fn close(&self) {
        self.probe.state.close_calls.fetch_add(1, Ordering::SeqCst);
        self.shut();
    }
}

impl Drop for MockShell {
    fn drop(&mut self) {
        self.shut();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use termgate_core::RemoteTarget;

    fn request() -> ConnectRequest {
        ConnectRequest {
            target: RemoteTarget {
                host: "h".into(),
                username: "u".into(),
            },
            geometry: TermGeometry::default(),
            term_type: "xterm".into(),
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_wrong_password_is_auth_error() {
        let connector = MockConnector::echo("right");
        let result = connector.connect(&request(), Credentials::new("wrong"));
        assert_eq!(result.err(), Some(ConnectError::Auth));
        assert_eq!(connector.probe().attempts(), 1);
        assert_eq!(connector.probe().live_connections(), 0);
    }

    #[test]
    fn test_echo_shell_echoes_and_exits() {
        // Arrange
        let connector = MockConnector::echo("pw");
        let shell = connector.connect(&request(), Credentials::new("pw")).unwrap();
        let mut buf = [0u8; 16];

        // Act / Assert
        assert_eq!(shell.read(&mut buf).unwrap_err().kind(), io::ErrorKind::TimedOut);
        shell.write_all(b"hi").unwrap();
        let n = shell.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");

        shell.write_all(b"exit\n").unwrap();
        let n = shell.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"exit\n");
        assert_eq!(shell.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_scripted_shell_splits_large_chunks() {
        let connector = MockConnector::scripted("pw", vec![b"abcdef".to_vec()]);
        let shell = connector.connect(&request(), Credentials::new("pw")).unwrap();
        let mut buf = [0u8; 4];

        assert_eq!(shell.read(&mut buf).unwrap(), 4);
        assert_eq!(shell.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(shell.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_drop_releases_live_count_without_counting_close() {
        let connector = MockConnector::echo("pw");
        let probe = connector.probe();
        let shell = connector.connect(&request(), Credentials::new("pw")).unwrap();
        assert_eq!(probe.live_connections(), 1);

        drop(shell);

        assert_eq!(probe.live_connections(), 0);
        assert_eq!(probe.close_calls(), 0);
    }
}
