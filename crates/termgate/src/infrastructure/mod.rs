//! Infrastructure layer for termgate.
//!
//! The infrastructure layer handles all I/O: the browser-facing WebSocket
//! listener, the SSH client that opens remote shells, and the configuration
//! file.
//!
//! # Responsibilities
//!
//! - Binding the WebSocket listener and upgrading connections
//! - Adapting tungstenite streams to the application's transport seam
//! - Opening SSH sessions with a PTY (`ssh2`)
//! - Reading the optional TOML configuration file
//! - Driving the coordinated shutdown when the `running` flag is cleared
//!
//! # What does NOT belong here?
//!
//! - The session state machine (application layer)
//! - Message type definitions (`termgate-core`)
//! - Command-line parsing (that is done in `main.rs`)

pub mod config_file;
pub mod ssh;
pub mod ws_server;

pub use config_file::{load_config, ConfigError, FileConfig};
pub use ssh::SshConnector;
pub use ws_server::{run_server, GatewayServer};
