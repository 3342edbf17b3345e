//! Session handler: the per-connection state machine.
//!
//! One [`SessionHandler`] runs per client connection, as one Tokio task on
//! the transport's runtime.  It owns everything session-scoped:
//!
//! - the lifecycle state (INIT → AUTHENTICATING → ACTIVE → CLOSING → CLOSED)
//! - at most one [`Bridge`] to a remote shell
//! - the outbound dispatcher task that feeds the client
//!
//! # Event loop
//!
//! The handler waits on four sources at once:
//!
//! ```text
//!  shutdown Notify     ──► CLOSING (process is stopping)
//!  remote_closed rx    ──► CLOSING (reader hit EOF / error)   [ACTIVE only]
//!  INIT idle deadline  ──► "authentication timeout", CLOSING  [INIT only]
//!  inbound frames      ──► decode, dispatch on (state, message)
//! ```
//!
//! # Blocking work
//!
//! The remote connect is blocking; it runs on Tokio's blocking pool via
//! `spawn_blocking` with an outer timeout.  Bridge writes and resizes only
//! push onto a channel.  Nothing in this module blocks the runtime.
//!
//! # Close
//!
//! [`SessionHandler::close`] is the single teardown path and is idempotent:
//! stop the bridge, give the dispatcher a bounded window to flush what is
//! already queued, close the transport, unregister, enter CLOSED.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Stream, StreamExt};
use termgate_core::{
    decode_client_frame, ClientMessage, Credentials, RemoteTarget, ServerMessage, SessionId,
    SessionState, TermGeometry,
};
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::bridge::{Bridge, ConnectError, ConnectRequest, ReaderSettings, RemoteShell, ShellConnector};
use super::outbound::{self, RemoteClosed};
use super::registry::SessionRegistry;
use super::transport::{FrameSink, Inbound};
use crate::domain::GatewayConfig;

/// Slack added to the connector's own timeout before the handler gives up
/// waiting on the blocking pool.
const CONNECT_GRACE: Duration = Duration::from_secs(2);

/// Error text sent when the failed-attempt budget is exhausted.
pub const TOO_MANY_ATTEMPTS: &str = "too many failed authentication attempts";
/// Error text sent when a connection idles in INIT too long.
pub const AUTH_TIMEOUT: &str = "authentication timeout";
/// Error text sent when the process stops.
pub const SHUTTING_DOWN: &str = "server shutting down";

// ── Close triggers ────────────────────────────────────────────────────────────

/// What caused a session to close.  Logged with the transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseTrigger {
    /// The client closed the connection or the transport failed.
    ClientDisconnected,
    /// The remote stream ended.
    RemoteClosed(RemoteClosed),
    /// The dispatcher could not deliver output.
    OutputFailed,
    /// Session negotiation failed after connecting.
    ProtocolFailure,
    /// The failed-attempt budget ran out.
    TooManyAttempts,
    /// No `auth` arrived within the idle timeout.
    IdleTimeout,
    /// Process shutdown.
    Shutdown,
}

impl fmt::Display for CloseTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseTrigger::ClientDisconnected => f.write_str("client disconnected"),
            CloseTrigger::RemoteClosed(reason) => write!(f, "{reason}"),
            CloseTrigger::OutputFailed => f.write_str("output delivery failed"),
            CloseTrigger::ProtocolFailure => f.write_str("remote protocol failure"),
            CloseTrigger::TooManyAttempts => f.write_str("too many failed attempts"),
            CloseTrigger::IdleTimeout => f.write_str("idle in INIT"),
            CloseTrigger::Shutdown => f.write_str("server shutdown"),
        }
    }
}

// ── Shared context ────────────────────────────────────────────────────────────

/// Process-wide collaborators every handler needs.  Cheap to clone.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<SessionRegistry>,
    pub connector: Arc<dyn ShellConnector>,
}

// ── Handler ───────────────────────────────────────────────────────────────────

/// Per-connection state machine.  See the module docs.
pub struct SessionHandler<S: FrameSink> {
    id: SessionId,
    peer: SocketAddr,
    state: SessionState,
    ctx: SessionContext,
    sink: Arc<Mutex<S>>,
    shutdown: Arc<Notify>,
    geometry: TermGeometry,
    failed_attempts: u32,
    idle_deadline: Instant,
    bridge: Option<Bridge>,
    dispatcher: Option<JoinHandle<()>>,
    remote_closed: Option<oneshot::Receiver<RemoteClosed>>,
}

impl<S: FrameSink> SessionHandler<S> {
    /// Creates a handler for a session that is already registered.
    ///
    /// `shutdown` is the signal returned by the registry at registration.
    pub fn new(
        ctx: SessionContext,
        id: SessionId,
        peer: SocketAddr,
        sink: S,
        shutdown: Arc<Notify>,
    ) -> Self {
        let geometry = ctx.config.initial_geometry;
        let idle_deadline = Instant::now() + ctx.config.init_idle_timeout;
        Self {
            id,
            peer,
            state: SessionState::Init,
            ctx,
            sink: Arc::new(Mutex::new(sink)),
            shutdown,
            geometry,
            failed_attempts: 0,
            idle_deadline,
            bridge: None,
            dispatcher: None,
            remote_closed: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the session to completion.  Returns once the session is CLOSED.
    pub async fn run<I>(mut self, mut inbound: I)
    where
        I: Stream<Item = Inbound> + Unpin + Send,
    {
        info!("session {}: connected from {}", self.id, self.peer);

        let trigger = loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    self.send_error(SHUTTING_DOWN).await;
                    break CloseTrigger::Shutdown;
                }
                closed = recv_remote_closed(&mut self.remote_closed) => {
                    break match closed {
                        Some(reason) => CloseTrigger::RemoteClosed(reason),
                        None => CloseTrigger::OutputFailed,
                    };
                }
                _ = tokio::time::sleep_until(self.idle_deadline), if self.state == SessionState::Init => {
                    warn!("session {}: no auth within {:?}", self.id, self.ctx.config.init_idle_timeout);
                    self.send_error(AUTH_TIMEOUT).await;
                    break CloseTrigger::IdleTimeout;
                }
                frame = inbound.next() => match frame {
                    Some(Inbound::Text(text)) => {
                        if let Some(trigger) = self.handle_frame(&text).await {
                            break trigger;
                        }
                    }
                    Some(Inbound::Disconnected) | None => break CloseTrigger::ClientDisconnected,
                },
            }
        };

        self.close(trigger).await;
    }

    // ── Frame dispatch ────────────────────────────────────────────────────────

    // The INIT idle deadline is only re-armed by a failed connect attempt;
    // other traffic in INIT does not extend it.
    async fn handle_frame(&mut self, text: &str) -> Option<CloseTrigger> {
        let msg = match decode_client_frame(text) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("session {}: dropped invalid frame: {e}", self.id);
                self.send_error(format!("invalid frame: {e}")).await;
                return None;
            }
        };
        // Only the type name: the payload may hold a password or keystrokes.
        debug!("session {}: received {} in {}", self.id, msg.type_name(), self.state);

        match (self.state, msg) {
            (
                SessionState::Init,
                ClientMessage::Auth {
                    host,
                    username,
                    password,
                },
            ) => self.authenticate(host, username, password).await,
            (SessionState::Init, other) => {
                self.send_error(format!("not authenticated: send auth before {}", other.type_name()))
                    .await;
                None
            }
            (SessionState::Active, ClientMessage::Input { data }) => self.forward_input(data),
            (SessionState::Active, ClientMessage::Resize { cols, rows }) => {
                self.forward_resize(cols, rows);
                None
            }
            (SessionState::Active, ClientMessage::Auth { .. }) => {
                self.send_error("already authenticated").await;
                None
            }
            (state, msg) => {
                debug!("session {}: ignored {} in {state}", self.id, msg.type_name());
                None
            }
        }
    }

    fn forward_input(&mut self, data: Vec<u8>) -> Option<CloseTrigger> {
        if data.is_empty() {
            return None;
        }
        let bridge = self.bridge.as_ref()?;
        if bridge.write(data).is_err() {
            // The reader reports the actual cause on remote_closed shortly.
            debug!("session {}: input after bridge stopped", self.id);
        }
        None
    }

    fn forward_resize(&mut self, cols: i64, rows: i64) {
        let Some(geometry) = TermGeometry::from_request(cols, rows) else {
            debug!("session {}: dropped invalid resize {cols}x{rows}", self.id);
            return;
        };
        self.geometry = geometry;
        if let Some(bridge) = &self.bridge {
            if bridge.resize(geometry).is_err() {
                debug!("session {}: resize after bridge stopped", self.id);
            }
        }
    }

    // ── Authentication ────────────────────────────────────────────────────────

    async fn authenticate(
        &mut self,
        host: String,
        username: String,
        password: String,
    ) -> Option<CloseTrigger> {
        let host = host.trim();
        if host.is_empty() {
            self.send_error("host is required").await;
            return None;
        }

        let resolved = self.ctx.config.hosts.resolve(host).to_string();
        let request = ConnectRequest {
            target: RemoteTarget {
                host: resolved,
                username,
            },
            geometry: self.geometry,
            term_type: self.ctx.config.term_type.clone(),
            connect_timeout: self.ctx.config.connect_timeout,
            read_timeout: self.ctx.config.read_poll_interval,
        };
        let target = format!("{}@{}", request.target.username, request.target.host);
        self.transition(SessionState::Authenticating, format_args!("auth for {target}"));

        let credentials = Credentials::new(password);
        let connector = Arc::clone(&self.ctx.connector);
        let blocking_request = request.clone();
        let task = tokio::task::spawn_blocking(move || connector.connect(&blocking_request, credentials));
        let limit = self.ctx.config.connect_timeout + CONNECT_GRACE;

        let result = tokio::select! {
            joined = tokio::time::timeout(limit, task) => match joined {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => Err(ConnectError::Protocol(format!("connect task failed: {e}"))),
                Err(_) => Err(ConnectError::Network(format!("connection to {} timed out", request.target.host))),
            },
            _ = self.shutdown.notified() => {
                // The blocking connect finishes on its own; its shell is dropped.
                self.send_error(SHUTTING_DOWN).await;
                return Some(CloseTrigger::Shutdown);
            }
        };

        match result {
            Ok(shell) => self.activate(shell, &target).await,
            Err(e) => self.connect_failed(e).await,
        }
    }

    async fn activate(&mut self, shell: Box<dyn RemoteShell>, target: &str) -> Option<CloseTrigger> {
        let (queue, drain) = outbound::channel(self.ctx.config.max_output_frame);
        let settings = ReaderSettings {
            chunk_size: self.ctx.config.read_chunk_size,
        };

        let bridge = match Bridge::start(self.id, shell, queue, settings) {
            Ok(bridge) => bridge,
            Err(e) => {
                return self
                    .connect_failed(ConnectError::Protocol(format!("failed to start bridge: {e}")))
                    .await
            }
        };

        let (closed_tx, closed_rx) = oneshot::channel();
        self.dispatcher = Some(tokio::spawn(outbound::run_dispatcher(
            self.id,
            drain,
            Arc::clone(&self.sink),
            closed_tx,
        )));
        self.remote_closed = Some(closed_rx);
        self.ctx.registry.attach_bridge(self.id, bridge.stopper());
        self.bridge = Some(bridge);
        self.failed_attempts = 0;

        self.transition(SessionState::Active, format_args!("shell open on {target}"));
        None
    }

    async fn connect_failed(&mut self, error: ConnectError) -> Option<CloseTrigger> {
        warn!("session {}: connect failed: {error}", self.id);
        self.send_error(error.to_string()).await;

        if matches!(error, ConnectError::Protocol(_)) {
            return Some(CloseTrigger::ProtocolFailure);
        }

        self.failed_attempts += 1;
        self.transition(SessionState::Init, &error);
        self.idle_deadline = Instant::now() + self.ctx.config.init_idle_timeout;

        if self.failed_attempts >= self.ctx.config.max_auth_attempts {
            self.send_error(TOO_MANY_ATTEMPTS).await;
            return Some(CloseTrigger::TooManyAttempts);
        }
        None
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Tears the session down.  Calling it again after the first call is a
    /// no-op.
    pub async fn close(&mut self, trigger: CloseTrigger) {
        if self.state.is_closing_or_closed() {
            return;
        }
        self.transition(SessionState::Closing, &trigger);

        if let Some(mut bridge) = self.bridge.take() {
            bridge.close();
        }

        // Bounded final flush: the reader stops within one poll interval and
        // the dispatcher exits after sending what was already queued.
        if let Some(mut dispatcher) = self.dispatcher.take() {
            let flush = self.ctx.config.close_flush_timeout;
            if tokio::time::timeout(flush, &mut dispatcher).await.is_err() {
                debug!("session {}: output flush exceeded {flush:?}, discarding", self.id);
                dispatcher.abort();
            }
        }
        self.remote_closed = None;

        self.sink.lock().await.close().await;
        self.ctx.registry.unregister(self.id);
        self.transition(SessionState::Closed, &trigger);
        info!("session {}: disconnected ({trigger})", self.id);
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn transition(&mut self, next: SessionState, trigger: impl fmt::Display) {
        match self.state.transition(next) {
            Ok(prev) => {
                self.ctx.registry.set_state(self.id, next);
                info!("session {}: {prev} -> {next} ({trigger})", self.id);
            }
            Err(e) => warn!("session {}: {e} ({trigger})", self.id),
        }
    }

    async fn send_error(&self, message: impl Into<String>) {
        let mut sink = self.sink.lock().await;
        if sink.send(ServerMessage::error(message)).await.is_err() {
            debug!("session {}: error reply dropped (client disconnected)", self.id);
        }
    }
}

/// Resolves with the remote closure reason, or `None` if the dispatcher
/// stopped without one.  Pending forever while no bridge is active.
async fn recv_remote_closed(rx: &mut Option<oneshot::Receiver<RemoteClosed>>) -> Option<RemoteClosed> {
    match rx {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::bridge::mock::{MockConnector, MockProbe};
    use crate::application::bridge::MockShellConnector;
    use crate::application::transport::{inbound_channel, ChannelSink};
    use crate::domain::HostDirectory;
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> GatewayConfig {
        GatewayConfig {
            pid_file: None,
            read_poll_interval: Duration::from_millis(10),
            close_flush_timeout: Duration::from_millis(500),
            ..GatewayConfig::default()
        }
    }

    struct Harness {
        id: SessionId,
        registry: Arc<SessionRegistry>,
        input: mpsc::UnboundedSender<Inbound>,
        output: mpsc::UnboundedReceiver<ServerMessage>,
        task: JoinHandle<()>,
    }

    impl Harness {
        fn start(connector: Arc<dyn ShellConnector>, config: GatewayConfig) -> Self {
            let registry = Arc::new(SessionRegistry::new());
            let id = SessionId::new();
            let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
            let shutdown = registry.register(id, peer);
            let ctx = SessionContext {
                config: Arc::new(config),
                registry: Arc::clone(&registry),
                connector,
            };
            let (sink, output) = ChannelSink::new();
            let (input, inbound) = inbound_channel();
            let handler = SessionHandler::new(ctx, id, peer, sink, shutdown);
            let task = tokio::spawn(handler.run(inbound));
            Self {
                id,
                registry,
                input,
                output,
                task,
            }
        }

        fn send(&self, json: &str) {
            self.input.send(Inbound::Text(json.to_string())).unwrap();
        }

        async fn recv(&mut self) -> ServerMessage {
            tokio::time::timeout(WAIT, self.output.recv())
                .await
                .expect("timed out waiting for a server message")
                .expect("sink closed")
        }

        async fn recv_error(&mut self) -> String {
            match self.recv().await {
                ServerMessage::Error { message } => message,
                other => panic!("expected error, got {other:?}"),
            }
        }

        /// Collects output frames until their concatenation contains `needle`.
        async fn output_until(&mut self, needle: &str) -> String {
            let mut text = String::new();
            while !text.contains(needle) {
                match self.recv().await {
                    ServerMessage::Output { data } => text.push_str(&data),
                    other => panic!("expected output, got {other:?}"),
                }
            }
            text
        }

        fn state(&self) -> Option<SessionState> {
            self.registry
                .enumerate()
                .into_iter()
                .find(|s| s.id == self.id)
                .map(|s| s.state)
        }

        async fn wait_state(&self, want: SessionState) {
            for _ in 0..500 {
                if self.state() == Some(want) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("session never reached {want}");
        }

        async fn finished(self) {
            tokio::time::timeout(WAIT, self.task)
                .await
                .expect("handler did not finish")
                .unwrap();
        }
    }

    const BAD_AUTH: &str = r#"{"type":"auth","host":"10.0.0.5","username":"u","password":"bad"}"#;
    const GOOD_AUTH: &str = r#"{"type":"auth","host":"10.0.0.5","username":"u","password":"pw"}"#;

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_bad_credentials_reply_once_and_stay_in_init() {
        // Arrange
        let connector = MockConnector::echo("pw");
        let probe: MockProbe = connector.probe();
        let mut h = Harness::start(Arc::new(connector), test_config());

        // Act
        h.send(BAD_AUTH);

        // Assert
        let message = h.recv_error().await;
        assert!(message.contains("authentication failed"));
        assert_eq!(h.state(), Some(SessionState::Init));
        assert_eq!(probe.live_connections(), 0);
        assert!(h.output.try_recv().is_err(), "exactly one error expected");
    }

    #[tokio::test]
    async fn test_retry_after_bad_credentials_succeeds() {
        let connector = MockConnector::echo("pw");
        let mut h = Harness::start(Arc::new(connector), test_config());

        h.send(BAD_AUTH);
        h.recv_error().await;
        h.send(GOOD_AUTH);

        h.wait_state(SessionState::Active).await;
    }

    #[tokio::test]
    async fn test_echoed_input_comes_back_as_output() {
        // Arrange
        let connector = MockConnector::echo("pw");
        let probe = connector.probe();
        let mut h = Harness::start(Arc::new(connector), test_config());
        h.send(GOOD_AUTH);
        h.wait_state(SessionState::Active).await;

        // Act
        h.send(r#"{"type":"input","data":"ls\n"}"#);

        // Assert
        let text = h.output_until("ls\n").await;
        assert!(text.contains("ls\n"));
        assert_eq!(probe.written(), b"ls\n".to_vec());
    }

    #[tokio::test]
    async fn test_input_before_auth_is_rejected_and_session_stays_open() {
        let mut h = Harness::start(Arc::new(MockConnector::echo("pw")), test_config());

        h.send(r#"{"type":"input","data":"ls\n"}"#);

        let message = h.recv_error().await;
        assert!(message.starts_with("not authenticated"));
        assert_eq!(h.state(), Some(SessionState::Init));
    }

    #[tokio::test]
    async fn test_invalid_frame_is_reported_and_connection_continues() {
        let mut h = Harness::start(Arc::new(MockConnector::echo("pw")), test_config());

        h.send("this is not json");
        let first = h.recv_error().await;
        h.send(r#"{"type":"bogus"}"#);
        let second = h.recv_error().await;

        assert!(first.starts_with("invalid frame"));
        assert!(second.contains("bogus"));
        assert_eq!(h.state(), Some(SessionState::Init));
    }

    #[tokio::test]
    async fn test_empty_host_never_reaches_connector() {
        // Arrange
        let mut connector = MockShellConnector::new();
        connector.expect_connect().times(0);
        let mut h = Harness::start(Arc::new(connector), test_config());

        // Act
        h.send(r#"{"type":"auth","host":"  ","username":"u","password":"pw"}"#);

        // Assert
        assert_eq!(h.recv_error().await, "host is required");
        assert_eq!(h.state(), Some(SessionState::Init));
    }

    #[tokio::test]
    async fn test_network_error_is_distinct_and_allows_retry() {
        let mut connector = MockShellConnector::new();
        connector
            .expect_connect()
            .times(1)
            .returning(|_, _| Err(ConnectError::Network("connection refused".into())));
        let mut h = Harness::start(Arc::new(connector), test_config());

        h.send(GOOD_AUTH);

        let message = h.recv_error().await;
        assert!(message.starts_with("network error"));
        assert!(!message.contains("authentication failed"));
        assert_eq!(h.state(), Some(SessionState::Init));
    }

    #[tokio::test]
    async fn test_protocol_error_closes_session() {
        let mut connector = MockShellConnector::new();
        connector
            .expect_connect()
            .returning(|_, _| Err(ConnectError::Protocol("pty request refused".into())));
        let mut h = Harness::start(Arc::new(connector), test_config());

        h.send(GOOD_AUTH);

        assert!(h.recv_error().await.starts_with("protocol error"));
        let registry = Arc::clone(&h.registry);
        h.finished().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_attempt_budget_exhaustion_closes_session() {
        // Arrange
        let connector = MockConnector::echo("pw");
        let probe = connector.probe();
        let config = GatewayConfig {
            max_auth_attempts: 2,
            ..test_config()
        };
        let mut h = Harness::start(Arc::new(connector), config);

        // Act
        h.send(BAD_AUTH);
        h.send(BAD_AUTH);

        // Assert
        assert_eq!(h.recv_error().await, "authentication failed");
        assert_eq!(h.recv_error().await, "authentication failed");
        assert_eq!(h.recv_error().await, TOO_MANY_ATTEMPTS);
        let registry = Arc::clone(&h.registry);
        h.finished().await;
        assert!(registry.is_empty());
        assert_eq!(probe.attempts(), 2);
    }

    #[tokio::test]
    async fn test_connector_receives_resolved_alias_and_geometry() {
        // Arrange
        let connector = MockConnector::echo("pw");
        let probe = connector.probe();
        let mut hosts = HostDirectory::new();
        hosts.insert("ioc-motor", "10.1.2.3");
        let config = GatewayConfig {
            hosts,
            ..test_config()
        };
        let h = Harness::start(Arc::new(connector), config);

        // Act
        h.send(r#"{"type":"auth","host":"ioc-motor","username":"ops","password":"pw"}"#);
        h.wait_state(SessionState::Active).await;

        // Assert
        let request = probe.last_request().unwrap();
        assert_eq!(request.target.host, "10.1.2.3");
        assert_eq!(request.target.username, "ops");
        assert_eq!(request.geometry, TermGeometry { cols: 80, rows: 24 });
        assert_eq!(request.term_type, "xterm");
    }

    #[tokio::test]
    async fn test_invalid_resize_is_not_forwarded() {
        // Arrange
        let connector = MockConnector::echo("pw");
        let probe = connector.probe();
        let h = Harness::start(Arc::new(connector), test_config());
        h.send(GOOD_AUTH);
        h.wait_state(SessionState::Active).await;

        // Act
        h.send(r#"{"type":"resize","cols":0,"rows":24}"#);
        h.send(r#"{"type":"resize","cols":80,"rows":-3}"#);
        h.send(r#"{"type":"resize","cols":5000,"rows":50}"#);

        // Assert: only the valid (clamped) request reached the shell.
        wait_for(|| !probe.resizes().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.resizes(), vec![TermGeometry { cols: 1000, rows: 50 }]);
    }

    #[tokio::test]
    async fn test_remote_eof_closes_session_after_flushing_output() {
        let connector = MockConnector::scripted("pw", vec![b"bye\r\n".to_vec()]);
        let probe = connector.probe();
        let mut h = Harness::start(Arc::new(connector), test_config());

        h.send(GOOD_AUTH);

        assert_eq!(h.output_until("bye").await, "bye\r\n");
        let registry = Arc::clone(&h.registry);
        h.finished().await;
        assert!(registry.is_empty());
        wait_for(|| probe.live_connections() == 0).await;
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_remote_shell() {
        let connector = MockConnector::echo("pw");
        let probe = connector.probe();
        let h = Harness::start(Arc::new(connector), test_config());
        h.send(GOOD_AUTH);
        h.wait_state(SessionState::Active).await;
        assert_eq!(probe.live_connections(), 1);

        h.input.send(Inbound::Disconnected).unwrap();
        let registry = Arc::clone(&h.registry);
        h.finished().await;

        assert!(registry.is_empty());
        wait_for(|| probe.live_connections() == 0).await;
        assert_eq!(probe.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_signal_closes_active_session() {
        let connector = MockConnector::echo("pw");
        let probe = connector.probe();
        let mut h = Harness::start(Arc::new(connector), test_config());
        h.send(GOOD_AUTH);
        h.wait_state(SessionState::Active).await;

        assert_eq!(h.registry.broadcast_close(), 1);

        assert_eq!(h.recv_error().await, "server shutting down");
        let registry = Arc::clone(&h.registry);
        h.finished().await;
        assert!(registry.is_empty());
        wait_for(|| probe.live_connections() == 0).await;
    }

    #[tokio::test]
    async fn test_idle_in_init_times_out() {
        let config = GatewayConfig {
            init_idle_timeout: Duration::from_millis(50),
            ..test_config()
        };
        let mut h = Harness::start(Arc::new(MockConnector::echo("pw")), config);

        assert_eq!(h.recv_error().await, AUTH_TIMEOUT);
        let registry = Arc::clone(&h.registry);
        h.finished().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_non_auth_traffic_does_not_extend_idle_timeout() {
        // Arrange
        let config = GatewayConfig {
            init_idle_timeout: Duration::from_millis(200),
            ..test_config()
        };
        let mut h = Harness::start(Arc::new(MockConnector::echo("pw")), config);
        let started = Instant::now();

        // Act: keep sending frames that are not auth attempts
        let mut timed_out = false;
        while !timed_out && started.elapsed() < Duration::from_secs(2) {
            // The handler drops its input once it has closed.
            let _ = h.input.send(Inbound::Text("{}".to_string()));
            let _ = h
                .input
                .send(Inbound::Text(r#"{"type":"input","data":"x"}"#.to_string()));
            tokio::time::sleep(Duration::from_millis(50)).await;
            while let Ok(msg) = h.output.try_recv() {
                timed_out |= msg == ServerMessage::error(AUTH_TIMEOUT);
            }
        }

        // Assert: closed on the original deadline, not held open by traffic
        assert!(timed_out);
        assert!(started.elapsed() < Duration::from_secs(1));
        let registry = Arc::clone(&h.registry);
        h.finished().await;
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_while_connect_in_flight_closes_and_releases_late_shell() {
        // Arrange: the connect sits on the blocking pool for a while
        let delay = Duration::from_millis(300);
        let connector = MockConnector::echo("pw").with_connect_delay(delay);
        let counters = connector.probe();
        let mut h = Harness::start(Arc::new(connector), test_config());
        h.send(GOOD_AUTH);
        h.wait_state(SessionState::Authenticating).await;

        // Act
        assert_eq!(h.registry.broadcast_close(), 1);

        // Assert: the session closes without waiting for the connect
        assert_eq!(h.recv_error().await, SHUTTING_DOWN);
        let registry = Arc::clone(&h.registry);
        let closing = Instant::now();
        h.finished().await;
        assert!(closing.elapsed() < delay);
        assert!(registry.is_empty());

        // The shell the connect eventually opens is dropped, not leaked.
        tokio::time::sleep(delay).await;
        wait_for(|| counters.attempts() == 1 && counters.live_connections() == 0).await;
    }

    #[tokio::test]
    async fn test_close_twice_is_same_as_once() {
        // Arrange: drive the handler by hand instead of through `run`.
        let connector = MockConnector::echo("pw");
        let probe = connector.probe();
        let registry = Arc::new(SessionRegistry::new());
        let id = SessionId::new();
        let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let shutdown = registry.register(id, peer);
        let ctx = SessionContext {
            config: Arc::new(test_config()),
            registry: Arc::clone(&registry),
            connector: Arc::new(connector),
        };
        let (sink, _output) = ChannelSink::new();
        let mut handler = SessionHandler::new(ctx, id, peer, sink, shutdown);
        assert!(handler.handle_frame(GOOD_AUTH).await.is_none());
        assert_eq!(handler.state(), SessionState::Active);

        // Act
        handler.close(CloseTrigger::ClientDisconnected).await;
        handler.close(CloseTrigger::RemoteClosed(RemoteClosed::Eof)).await;

        // Assert
        assert_eq!(handler.state(), SessionState::Closed);
        assert!(registry.is_empty());
        wait_for(|| probe.live_connections() == 0).await;
        assert_eq!(probe.close_calls(), 1);
    }

    #[tokio::test]
    async fn test_registry_size_matches_open_sessions() {
        let connector: Arc<dyn ShellConnector> = Arc::new(MockConnector::echo("pw"));
        let a = Harness::start(Arc::clone(&connector), test_config());
        assert_eq!(a.registry.len(), 1);

        a.input.send(Inbound::Disconnected).unwrap();
        let registry = Arc::clone(&a.registry);
        let id = a.id;
        a.finished().await;

        assert_eq!(registry.len(), 0);
        assert!(registry.enumerate().iter().all(|s| s.id != id));
    }

    #[test]
    fn test_close_trigger_display_names_cause() {
        assert_eq!(CloseTrigger::Shutdown.to_string(), "server shutdown");
        assert_eq!(
            CloseTrigger::RemoteClosed(RemoteClosed::Eof).to_string(),
            "remote end of stream"
        );
    }
}
