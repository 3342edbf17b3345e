//! WebSocket server: accept loop, per-session task management and
//! coordinated shutdown.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address and writing the
//!    liveness marker.
//! 2. Accepting incoming TCP connections from browsers.
//! 3. Upgrading each connection to a WebSocket session.
//! 4. Enforcing the session cap, registering the session and running its
//!    [`SessionHandler`] in a dedicated Tokio task.
//! 5. Adapting the tungstenite stream halves to the application's
//!    [`Inbound`] / [`FrameSink`] seam.
//! 6. Shutting down when the `running` flag is cleared: broadcast close, wait
//!    for the drain deadline, force-release stragglers, remove the marker.
//!
//! # Scheduling
//!
//! Every browser session is a Tokio task on the same runtime, which the
//! binary runs on a single thread: one cooperative multiplexer for all
//! client I/O.  The accept loop never blocks; it accepts a connection and
//! immediately spawns a task for it before accepting the next one.  Blocking
//! SSH work never runs here (see `application::bridge`).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{future, SinkExt, StreamExt};
use termgate_core::{encode_server_message, ServerMessage, SessionId};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use crate::application::bridge::ShellConnector;
use crate::application::liveness::LivenessMarker;
use crate::application::registry::{RegisterError, SessionRegistry};
use crate::application::session::{SessionContext, SessionHandler, SHUTTING_DOWN};
use crate::application::transport::{FrameSink, Inbound, InboundStream, SinkClosed};
use crate::domain::GatewayConfig;

/// How often the accept loop re-checks the `running` flag.
const ACCEPT_POLL: Duration = Duration::from_millis(200);

/// Error text sent to a connection refused by the session cap.
pub const SERVER_BUSY: &str = "server busy";

// ── Public API ────────────────────────────────────────────────────────────────

/// A bound, not yet running, gateway.
///
/// Splitting bind from run lets callers learn the actual listening address
/// (useful with port 0) and hold on to the registry before serving.
pub struct GatewayServer {
    listener: TcpListener,
    ctx: SessionContext,
}

impl GatewayServer {
    /// Binds the listener and writes the liveness marker (if configured).
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be bound or the marker cannot be
    /// written.
    pub async fn bind(
        config: GatewayConfig,
        connector: Arc<dyn ShellConnector>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(config.listen_addr)
            .await
            .with_context(|| {
                format!("failed to bind WebSocket listener on {}", config.listen_addr)
            })?;

        let registry = match &config.pid_file {
            Some(path) => SessionRegistry::with_liveness_marker(LivenessMarker::create(path)?),
            None => SessionRegistry::new(),
        };

        info!(
            "terminal gateway listening on {}",
            listener.local_addr().context("listener has no local address")?
        );

        Ok(Self {
            listener,
            ctx: SessionContext {
                config: Arc::new(config),
                registry: Arc::new(registry),
                connector,
            },
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// The session registry shared with every handler.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.ctx.registry)
    }

    /// Runs the accept loop until `running` is set to `false`, then performs
    /// the coordinated shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error only if the liveness marker cannot be removed.
    pub async fn run(self, running: Arc<AtomicBool>) -> anyhow::Result<()> {
        loop {
            if !running.load(Ordering::Relaxed) {
                info!("shutdown flag set; stopping accept loop");
                break;
            }

            // Short timeout so the loop re-checks `running` even when idle.
            match timeout(ACCEPT_POLL, self.listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    debug!("tcp connection from {peer}");
                    let ctx = self.ctx.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, ctx).await;
                    });
                }
                Ok(Err(e)) => {
                    // Transient (e.g. out of file descriptors); keep serving.
                    error!("accept error: {e}");
                }
                Err(_) => {}
            }
        }

        // Stop accepting before draining.
        drop(self.listener);
        shutdown(&self.ctx).await
    }
}

/// Binds and runs a gateway until `running` is cleared.
///
/// # Errors
///
/// See [`GatewayServer::bind`] and [`GatewayServer::run`].
pub async fn run_server(
    config: GatewayConfig,
    connector: Arc<dyn ShellConnector>,
    running: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    GatewayServer::bind(config, connector)
        .await?
        .run(running)
        .await
}

// ── Shutdown ──────────────────────────────────────────────────────────────────

async fn shutdown(ctx: &SessionContext) -> anyhow::Result<()> {
    let registry = &ctx.registry;
    let drain = ctx.config.drain_timeout;

    let asked = registry.broadcast_close();
    info!("shutdown: asked {asked} session(s) to close, waiting up to {drain:?}");

    if registry.wait_until_empty(drain).await {
        info!("shutdown: all sessions closed");
    } else {
        let released = registry.force_release_all();
        warn!("shutdown: drain deadline passed, force-released {released} session(s)");
    }

    registry
        .release_liveness_marker()
        .context("failed to remove liveness marker")?;
    Ok(())
}

// ── Per-connection task ───────────────────────────────────────────────────────

async fn handle_connection(stream: TcpStream, peer: SocketAddr, ctx: SessionContext) {
    // Bound the upgrade so a silent client cannot hold a task forever.
    let ws = match timeout(ctx.config.connect_timeout, accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!("WebSocket handshake failed with {peer}: {e}");
            return;
        }
        Err(_) => {
            warn!("WebSocket handshake with {peer} timed out");
            return;
        }
    };

    let id = SessionId::new();
    let (ws_tx, ws_rx) = ws.split();
    let mut sink = WsFrameSink::new(id, ws_tx);

    let shutdown = match ctx
        .registry
        .try_register(id, peer, ctx.config.max_sessions)
    {
        Ok(shutdown) => shutdown,
        Err(refused) => {
            warn!("refusing connection from {peer}: {refused}");
            let reply = match refused {
                RegisterError::Full { .. } => SERVER_BUSY,
                RegisterError::ShuttingDown => SHUTTING_DOWN,
            };
            let _ = sink.send(ServerMessage::error(reply)).await;
            sink.close().await;
            return;
        }
    };

    let registry = Arc::clone(&ctx.registry);
    let handler = SessionHandler::new(ctx, id, peer, sink, shutdown);
    let task = tokio::spawn(handler.run(inbound_frames(id, ws_rx)));
    registry.set_task(id, task.abort_handle());

    match task.await {
        Ok(()) => {}
        Err(e) if e.is_cancelled() => debug!("session {id}: task aborted"),
        Err(e) => {
            // A panicking handler must not leave a phantom registry entry.
            error!("session {id}: handler panicked: {e}");
            registry.unregister(id);
        }
    }
}

// ── Transport adapters ────────────────────────────────────────────────────────

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// [`FrameSink`] over the sending half of a tungstenite WebSocket.
pub struct WsFrameSink {
    session_id: SessionId,
    inner: WsSink,
}

impl WsFrameSink {
    fn new(session_id: SessionId, inner: WsSink) -> Self {
        Self { session_id, inner }
    }
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, msg: ServerMessage) -> Result<(), SinkClosed> {
        let text = match encode_server_message(&msg) {
            Ok(text) => text,
            Err(e) => {
                // Encoding our own enum cannot realistically fail; drop the frame.
                error!("session {}: failed to encode reply: {e}", self.session_id);
                return Ok(());
            }
        };
        self.inner
            .send(WsMessage::Text(text))
            .await
            .map_err(|_| SinkClosed)
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close().await {
            debug!("session {}: WebSocket close: {e}", self.session_id);
        }
    }
}

/// Maps the receiving half of a WebSocket onto [`Inbound`] events.
///
/// Text frames pass through undecoded; a Close frame or any transport error
/// becomes [`Inbound::Disconnected`]; binary and control frames are dropped.
fn inbound_frames(session_id: SessionId, source: WsSource) -> InboundStream {
    Box::pin(source.filter_map(move |item| {
        let event = match item {
            Ok(WsMessage::Text(text)) => Some(Inbound::Text(text)),
            Ok(WsMessage::Binary(data)) => {
                debug!(
                    "session {session_id}: unexpected binary WebSocket frame ({} bytes, ignored)",
                    data.len()
                );
                None
            }
            Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_)) => None,
            Ok(WsMessage::Close(_)) => {
                debug!("session {session_id}: WebSocket Close frame received");
                Some(Inbound::Disconnected)
            }
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Some(Inbound::Disconnected),
            Err(e) => {
                debug!("session {session_id}: WebSocket error: {e}");
                Some(Inbound::Disconnected)
            }
        };
        future::ready(event)
    }))
}
