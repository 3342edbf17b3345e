//! Gateway configuration types.
//!
//! [`GatewayConfig`] is the single source of truth for all runtime settings.
//! It is built once at startup (CLI arguments layered over an optional TOML
//! file layered over these defaults) and then shared as `Arc<GatewayConfig>`
//! by the acceptor and every session handler.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use termgate_core::TermGeometry;

use super::hosts::HostDirectory;

/// Default WebSocket listener address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8022";

/// Default liveness marker (PID file) path, relative to the working directory.
pub const DEFAULT_PID_FILE: &str = "termgate.pid";

/// All runtime configuration for the terminal gateway.
///
/// # Example
///
/// ```rust
/// use termgate::domain::GatewayConfig;
///
/// let cfg = GatewayConfig::default();
/// assert_eq!(cfg.listen_addr.port(), 8022);
/// assert_eq!(cfg.max_auth_attempts, 3);
/// ```
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Address the WebSocket listener binds to.
    pub listen_addr: SocketAddr,

    /// Liveness marker path.  `None` disables the marker (tests, embedding).
    pub pid_file: Option<PathBuf>,

    /// Upper bound on one remote connect + authenticate + PTY allocation.
    pub connect_timeout: Duration,

    /// Read timeout of each blocking remote read.  Bounds how long a reader
    /// thread takes to notice cancellation.
    pub read_poll_interval: Duration,

    /// Size of the reader's buffer, i.e. the largest single remote read.
    pub read_chunk_size: usize,

    /// The dispatcher stops coalescing queued chunks once a frame reaches
    /// this many bytes.
    pub max_output_frame: usize,

    /// How long a closing session may spend flushing queued output.
    pub close_flush_timeout: Duration,

    /// How long process shutdown waits for sessions to close before
    /// force-releasing the stragglers.
    pub drain_timeout: Duration,

    /// How long a connection may sit in INIT without sending a frame.
    pub init_idle_timeout: Duration,

    /// Failed `auth` attempts allowed per connection before it is closed.
    pub max_auth_attempts: u32,

    /// Concurrent session cap.  Connections beyond it are refused.
    pub max_sessions: usize,

    /// `TERM` value requested for the remote pseudo-terminal.
    pub term_type: String,

    /// Geometry of a freshly allocated remote pseudo-terminal.
    pub initial_geometry: TermGeometry,

    /// Managed-host aliases.
    pub hosts: HostDirectory,
}

impl Default for GatewayConfig {
    /// | Field                | Default          |
    /// |----------------------|------------------|
    /// | listen_addr          | `0.0.0.0:8022`   |
    /// | pid_file             | `termgate.pid`   |
    /// | connect_timeout      | 10 s             |
    /// | read_poll_interval   | 100 ms           |
    /// | read_chunk_size      | 1024 bytes       |
    /// | max_output_frame     | 16 KiB           |
    /// | close_flush_timeout  | 500 ms           |
    /// | drain_timeout        | 5 s              |
    /// | init_idle_timeout    | 60 s             |
    /// | max_auth_attempts    | 3                |
    /// | max_sessions         | 64               |
    /// | term_type            | `xterm`          |
    /// | initial_geometry     | 80x24            |
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8022)),
            pid_file: Some(PathBuf::from(DEFAULT_PID_FILE)),
            connect_timeout: Duration::from_secs(10),
            read_poll_interval: Duration::from_millis(100),
            read_chunk_size: 1024,
            max_output_frame: 16 * 1024,
            close_flush_timeout: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(5),
            init_idle_timeout: Duration::from_secs(60),
            max_auth_attempts: 3,
            max_sessions: 64,
            term_type: "xterm".to_string(),
            initial_geometry: TermGeometry::default(),
            hosts: HostDirectory::default(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
