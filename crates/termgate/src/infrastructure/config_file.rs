//! TOML configuration file for the gateway.
//!
//! The file is optional.  When given (`--config` / `TERMGATE_CONFIG`) it is
//! read once at startup and layered under the command-line arguments:
//!
//! ```text
//! CLI flag / TERMGATE_* env  >  config file  >  built-in defaults
//! ```
//!
//! # Example
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 8022
//! pid_file = "/run/termgate.pid"
//! max_sessions = 64
//! drain_timeout_secs = 5
//! log_level = "info"
//!
//! [session]
//! connect_timeout_secs = 10
//! read_poll_ms = 100
//! max_auth_attempts = 3
//! term_type = "xterm"
//!
//! [hosts]
//! ioc-rf-01 = "10.0.0.5"
//! ioc-vac-02 = "10.0.0.6:2222"
//! ```
//!
//! Every field has a serde default, so any subset of the file is valid.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use termgate_core::TermGeometry;
use thiserror::Error;

use crate::domain::config::DEFAULT_PID_FILE;
use crate::domain::{GatewayConfig, HostDirectory};

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value parsed but is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level layout of the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub server: ServerSection,
    pub session: SessionSection,
    pub hosts: HostDirectory,
}

/// Listener and process-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    /// IP address to bind.  `"0.0.0.0"` binds all interfaces.
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Liveness marker path.  An empty string disables the marker.
    #[serde(default = "default_pid_file")]
    pub pid_file: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// `tracing` level used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Per-session tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_poll_ms")]
    pub read_poll_ms: u64,
    #[serde(default = "default_read_chunk_size")]
    pub read_chunk_size: usize,
    #[serde(default = "default_max_output_frame")]
    pub max_output_frame: usize,
    #[serde(default = "default_close_flush_ms")]
    pub close_flush_ms: u64,
    #[serde(default = "default_init_idle_timeout_secs")]
    pub init_idle_timeout_secs: u64,
    #[serde(default = "default_max_auth_attempts")]
    pub max_auth_attempts: u32,
    #[serde(default = "default_term_type")]
    pub term_type: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8022
}
fn default_pid_file() -> String {
    DEFAULT_PID_FILE.to_string()
}
fn default_max_sessions() -> usize {
    64
}
fn default_drain_timeout_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_read_poll_ms() -> u64 {
    100
}
fn default_read_chunk_size() -> usize {
    1024
}
fn default_max_output_frame() -> usize {
    16 * 1024
}
fn default_close_flush_ms() -> u64 {
    500
}
fn default_init_idle_timeout_secs() -> u64 {
    60
}
fn default_max_auth_attempts() -> u32 {
    3
}
fn default_term_type() -> String {
    "xterm".to_string()
}
fn default_cols() -> u16 {
    80
}
fn default_rows() -> u16 {
    24
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            pid_file: default_pid_file(),
            max_sessions: default_max_sessions(),
            drain_timeout_secs: default_drain_timeout_secs(),
            log_level: default_log_level(),
        }
    }
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            read_poll_ms: default_read_poll_ms(),
            read_chunk_size: default_read_chunk_size(),
            max_output_frame: default_max_output_frame(),
            close_flush_ms: default_close_flush_ms(),
            init_idle_timeout_secs: default_init_idle_timeout_secs(),
            max_auth_attempts: default_max_auth_attempts(),
            term_type: default_term_type(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Reads and parses the file at `path`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read (a missing file is
/// an error: the path was given explicitly) and [`ConfigError::Parse`] if
/// the TOML is malformed.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

impl FileConfig {
    /// Validates the file values and converts them into a [`GatewayConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for an unparsable bind address or a
    /// zero where a positive value is required.
    pub fn into_gateway_config(self) -> Result<GatewayConfig, ConfigError> {
        let ip: IpAddr = self.server.bind.parse().map_err(|e| ConfigError::Invalid {
            field: "server.bind",
            reason: format!("'{}': {e}", self.server.bind),
        })?;

        let s = &self.session;
        positive("server.max_sessions", self.server.max_sessions as u64)?;
        positive("session.read_poll_ms", s.read_poll_ms)?;
        positive("session.read_chunk_size", s.read_chunk_size as u64)?;
        positive("session.max_output_frame", s.max_output_frame as u64)?;
        positive("session.max_auth_attempts", u64::from(s.max_auth_attempts))?;
        positive("session.connect_timeout_secs", s.connect_timeout_secs)?;

        let initial_geometry = TermGeometry::from_request(i64::from(s.cols), i64::from(s.rows))
            .ok_or_else(|| ConfigError::Invalid {
                field: "session.cols/rows",
                reason: format!("{}x{} (each must be at least 1)", s.cols, s.rows),
            })?;

        let pid_file = match self.server.pid_file.trim() {
            "" => None,
            p => Some(PathBuf::from(p)),
        };

        Ok(GatewayConfig {
            listen_addr: SocketAddr::new(ip, self.server.port),
            pid_file,
            connect_timeout: Duration::from_secs(s.connect_timeout_secs),
            read_poll_interval: Duration::from_millis(s.read_poll_ms),
            read_chunk_size: s.read_chunk_size,
            max_output_frame: s.max_output_frame,
            close_flush_timeout: Duration::from_millis(s.close_flush_ms),
            drain_timeout: Duration::from_secs(self.server.drain_timeout_secs),
            init_idle_timeout: Duration::from_secs(s.init_idle_timeout_secs),
            max_auth_attempts: s.max_auth_attempts,
            max_sessions: self.server.max_sessions,
            term_type: s.term_type.clone(),
            initial_geometry,
            hosts: self.hosts,
        })
    }
}

fn positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            field,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
