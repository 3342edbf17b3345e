//! Domain layer for termgate.
//!
//! Plain data with no I/O: the resolved runtime configuration and the
//! managed-host directory used to turn an alias into a connectable host.
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpStream`, `WebSocket` or SSH types
//! - File I/O or environment variable reading (see `infrastructure::config_file`)

pub mod config;
pub mod hosts;

pub use config::GatewayConfig;
pub use hosts::HostDirectory;
