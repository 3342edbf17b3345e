//! End-to-end tests for the gateway over real WebSocket connections.
//!
//! Each test binds a [`GatewayServer`] on an ephemeral loopback port with an
//! in-memory [`MockConnector`] standing in for SSH, connects one or more
//! tokio-tungstenite clients, and checks what the browser would see.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use termgate::application::bridge::mock::{MockConnector, MockProbe};
use termgate::application::{ConnectError, SessionRegistry, ShellConnector};
use termgate::domain::GatewayConfig;
use termgate::infrastructure::GatewayServer;
use termgate_core::{ServerMessage, SessionState, TermGeometry};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

const WAIT: Duration = Duration::from_secs(5);

const GOOD_AUTH: &str = r#"{"type":"auth","host":"10.0.0.5","username":"operator","password":"pw"}"#;
const BAD_AUTH: &str = r#"{"type":"auth","host":"10.0.0.5","username":"operator","password":"nope"}"#;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── Harness ───────────────────────────────────────────────────────────────────

struct Gateway {
    url: String,
    registry: Arc<SessionRegistry>,
    running: Arc<AtomicBool>,
    task: JoinHandle<anyhow::Result<()>>,
}

fn test_config() -> GatewayConfig {
    GatewayConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        pid_file: None,
        read_poll_interval: Duration::from_millis(10),
        drain_timeout: Duration::from_secs(2),
        ..GatewayConfig::default()
    }
}

async fn start(config: GatewayConfig, connector: Arc<dyn ShellConnector>) -> Gateway {
    let server = GatewayServer::bind(config, connector).await.unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    let running = Arc::new(AtomicBool::new(true));
    let task = tokio::spawn(server.run(Arc::clone(&running)));
    Gateway {
        url: format!("ws://{addr}"),
        registry,
        running,
        task,
    }
}

impl Gateway {
    async fn connect(&self) -> Client {
        let (ws, _) = connect_async(self.url.as_str()).await.unwrap();
        ws
    }

    async fn wait_for_sessions(&self, n: usize) {
        wait_for(|| self.registry.len() == n).await;
    }

    async fn wait_for_active(&self, n: usize) {
        wait_for(|| {
            self.registry
                .enumerate()
                .iter()
                .filter(|s| s.state == SessionState::Active)
                .count()
                == n
        })
        .await;
    }

    async fn wait_for_state(&self, state: SessionState) {
        wait_for(|| self.registry.enumerate().iter().any(|s| s.state == state)).await;
    }

    async fn stop(self) {
        self.running.store(false, Ordering::Relaxed);
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

async fn wait_for(cond: impl Fn() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn send(ws: &mut Client, json: &str) {
    ws.send(Message::Text(json.to_string())).await.unwrap();
}

/// Next JSON message from the gateway, or `None` once the socket closes.
async fn recv(ws: &mut Client) -> Option<ServerMessage> {
    loop {
        let frame = tokio::time::timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame");
        match frame {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => {}
        }
    }
}

async fn recv_error(ws: &mut Client) -> String {
    match recv(ws).await {
        Some(ServerMessage::Error { message }) => message,
        other => panic!("expected error, got {other:?}"),
    }
}

async fn output_until(ws: &mut Client, needle: &str) -> String {
    let mut text = String::new();
    while !text.contains(needle) {
        match recv(ws).await {
            Some(ServerMessage::Output { data }) => text.push_str(&data),
            other => panic!("expected output, got {other:?}"),
        }
    }
    text
}

/// Reads until the gateway closes the socket, returning any errors seen.
async fn errors_until_closed(ws: &mut Client) -> Vec<String> {
    let mut errors = Vec::new();
    while let Some(msg) = recv(ws).await {
        if let ServerMessage::Error { message } = msg {
            errors.push(message);
        }
    }
    errors
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_bad_credentials_keep_connection_open_for_retry() {
    // Arrange
    let connector = MockConnector::echo("pw");
    let probe: MockProbe = connector.probe();
    let gw = start(test_config(), Arc::new(connector)).await;
    let mut ws = gw.connect().await;

    // Act
    send(&mut ws, BAD_AUTH).await;

    // Assert: exactly one error, no shell, still in INIT
    assert_eq!(recv_error(&mut ws).await, "authentication failed");
    assert_eq!(probe.live_connections(), 0);
    gw.wait_for_sessions(1).await;
    assert_eq!(gw.registry.enumerate()[0].state, SessionState::Init);

    // Act: retry with the right password on the same socket
    send(&mut ws, GOOD_AUTH).await;
    gw.wait_for_active(1).await;
    assert_eq!(probe.live_connections(), 1);

    drop(ws);
    gw.wait_for_sessions(0).await;
    gw.stop().await;
}

#[tokio::test]
async fn test_unreachable_host_reports_network_error_and_uses_up_attempts() {
    // Arrange
    let connector = MockConnector::failing(ConnectError::Network("connection refused".into()));
    let counters = connector.probe();
    let gw = start(test_config(), Arc::new(connector)).await;
    let mut ws = gw.connect().await;

    // Act
    send(&mut ws, GOOD_AUTH).await;

    // Assert: the connection stays open in INIT for another try
    assert_eq!(recv_error(&mut ws).await, "network error: connection refused");
    gw.wait_for_state(SessionState::Init).await;
    assert_eq!(counters.attempts(), 1);

    // Act: two more tries exhaust the attempt budget
    send(&mut ws, GOOD_AUTH).await;
    assert_eq!(recv_error(&mut ws).await, "network error: connection refused");
    gw.wait_for_state(SessionState::Init).await;
    send(&mut ws, GOOD_AUTH).await;

    // Assert
    assert_eq!(
        errors_until_closed(&mut ws).await,
        vec![
            "network error: connection refused",
            "too many failed authentication attempts"
        ]
    );
    assert_eq!(counters.attempts(), 3);
    assert_eq!(counters.live_connections(), 0);
    gw.wait_for_sessions(0).await;

    gw.stop().await;
}

#[tokio::test]
async fn test_input_is_echoed_back_as_output() {
    let connector = MockConnector::echo("pw").with_banner("Last login: today\r\n$ ");
    let probe = connector.probe();
    let gw = start(test_config(), Arc::new(connector)).await;
    let mut ws = gw.connect().await;

    send(&mut ws, GOOD_AUTH).await;
    output_until(&mut ws, "$ ").await;
    send(&mut ws, r#"{"type":"input","data":"ls\n"}"#).await;

    assert_eq!(output_until(&mut ws, "ls\n").await, "ls\n");
    assert_eq!(probe.written(), b"ls\n".to_vec());

    gw.stop().await;
}

#[tokio::test]
async fn test_shutdown_closes_every_session_and_removes_pid_file() {
    // Arrange: three active sessions and a liveness marker
    let pid_file: PathBuf =
        std::env::temp_dir().join(format!("termgate-it-{}.pid", uuid::Uuid::new_v4()));
    let config = GatewayConfig {
        pid_file: Some(pid_file.clone()),
        ..test_config()
    };
    let connector = MockConnector::echo("pw");
    let probe = connector.probe();
    let gw = start(config, Arc::new(connector)).await;
    assert!(pid_file.exists());

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut ws = gw.connect().await;
        send(&mut ws, GOOD_AUTH).await;
        clients.push(ws);
    }
    gw.wait_for_active(3).await;
    assert_eq!(probe.live_connections(), 3);

    // Act
    let registry = Arc::clone(&gw.registry);
    let started = std::time::Instant::now();
    gw.stop().await;

    // Assert: drained within the deadline, nothing left behind
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(registry.is_empty());
    assert!(!pid_file.exists());
    wait_for(|| probe.live_connections() == 0).await;
    for ws in &mut clients {
        assert!(errors_until_closed(ws)
            .await
            .contains(&"server shutting down".to_string()));
    }
}

#[tokio::test]
async fn test_connections_beyond_cap_are_refused() {
    let config = GatewayConfig {
        max_sessions: 1,
        ..test_config()
    };
    let gw = start(config, Arc::new(MockConnector::echo("pw"))).await;
    let _first = gw.connect().await;
    gw.wait_for_sessions(1).await;

    let mut second = gw.connect().await;

    assert_eq!(errors_until_closed(&mut second).await, vec!["server busy"]);
    assert_eq!(gw.registry.len(), 1);

    gw.stop().await;
}

#[tokio::test]
async fn test_unauthenticated_connection_times_out() {
    let config = GatewayConfig {
        init_idle_timeout: Duration::from_millis(100),
        ..test_config()
    };
    let gw = start(config, Arc::new(MockConnector::echo("pw"))).await;
    let mut ws = gw.connect().await;

    assert_eq!(
        errors_until_closed(&mut ws).await,
        vec!["authentication timeout"]
    );
    gw.wait_for_sessions(0).await;

    gw.stop().await;
}

#[tokio::test]
async fn test_invalid_resize_is_not_forwarded_to_remote() {
    let connector = MockConnector::echo("pw");
    let probe = connector.probe();
    let gw = start(test_config(), Arc::new(connector)).await;
    let mut ws = gw.connect().await;
    send(&mut ws, GOOD_AUTH).await;
    gw.wait_for_active(1).await;

    send(&mut ws, r#"{"type":"resize","cols":0,"rows":24}"#).await;
    send(&mut ws, r#"{"type":"resize","cols":132,"rows":43}"#).await;

    wait_for(|| !probe.resizes().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(probe.resizes(), vec![TermGeometry { cols: 132, rows: 43 }]);

    gw.stop().await;
}

#[tokio::test]
async fn test_remote_exit_closes_websocket() {
    let connector = MockConnector::echo("pw");
    let gw = start(test_config(), Arc::new(connector)).await;
    let mut ws = gw.connect().await;
    send(&mut ws, GOOD_AUTH).await;
    gw.wait_for_active(1).await;

    send(&mut ws, r#"{"type":"input","data":"exit\n"}"#).await;

    assert_eq!(output_until(&mut ws, "exit").await, "exit\n");
    assert!(errors_until_closed(&mut ws).await.is_empty());
    gw.wait_for_sessions(0).await;

    gw.stop().await;
}

#[tokio::test]
async fn test_binary_frames_are_ignored() {
    let gw = start(test_config(), Arc::new(MockConnector::echo("pw"))).await;
    let mut ws = gw.connect().await;

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    send(&mut ws, r#"{"type":"input","data":"x"}"#).await;

    // The binary frame produced nothing; the next reply is for the input.
    assert_eq!(
        recv_error(&mut ws).await,
        "not authenticated: send auth before input"
    );

    gw.stop().await;
}
