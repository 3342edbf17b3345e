//! termgate library crate.
//!
//! A WebSocket-to-SSH terminal gateway: browsers open live shell sessions on
//! managed hosts through JSON frames over a WebSocket.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Browser (JSON over WebSocket)
//!         ↕
//! [termgate]
//!   ├── domain/           GatewayConfig, HostDirectory
//!   ├── application/
//!   │     ├── session     per-connection state machine
//!   │     ├── bridge      remote shell + reader/writer threads
//!   │     ├── outbound    reader thread → runtime FIFO (dispatcher)
//!   │     └── registry    live sessions, shutdown broadcast, PID file
//!   └── infrastructure/
//!         ├── ws_server   accept loop (tokio-tungstenite)
//!         ├── ssh         SSH connector (ssh2)
//!         └── config_file optional TOML settings
//!         ↕
//! Managed hosts (SSH, port 22)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `termgate-core`; it reaches the
//!   network only through the `FrameSink` and `ShellConnector` traits.
//! - `infrastructure` implements those traits with tungstenite and ssh2.
//!
//! # For beginners: two kinds of concurrency
//!
//! Browser connections are cheap and numerous, so they all share one
//! cooperative Tokio runtime.  SSH reads block, so each open shell gets its
//! own OS threads.  The only bridge between the two is a per-session channel
//! (`application::outbound`), which is why a slow remote host can never stall
//! another user's terminal.

/// Domain layer: pure configuration types (no I/O).
pub mod domain;

/// Application layer: session lifecycle, bridge and dispatcher.
pub mod application;

/// Infrastructure layer: WebSocket server, SSH connector, config file.
pub mod infrastructure;
