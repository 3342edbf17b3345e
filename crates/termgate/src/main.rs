//! termgate: WebSocket-to-SSH terminal gateway, entry point.
//!
//! Browsers connect over WebSocket, authenticate against a managed host with
//! a username and password, and then drive an interactive shell through JSON
//! frames.  Each remote shell runs on its own reader/writer threads; all
//! browser I/O shares one single-threaded Tokio runtime.
//!
//! # Usage
//!
//! ```text
//! termgate [OPTIONS]
//!
//! Options:
//!   --bind <IP>                  Listener IP address [default: 0.0.0.0]
//!   --port <PORT>                Listener port [default: 8022]
//!   --config <PATH>              Optional TOML configuration file
//!   --pid-file <PATH>            Liveness marker path [default: termgate.pid]
//!   --connect-timeout <SECS>     SSH connect budget [default: 10]
//!   --drain-timeout <SECS>       Shutdown drain deadline [default: 5]
//!   --max-sessions <N>           Concurrent session cap [default: 64]
//!   --log-level <LEVEL>          Fallback when RUST_LOG is unset [default: info]
//! ```
//!
//! # Precedence
//!
//! ```text
//! CLI flag  >  TERMGATE_* environment variable  >  config file  >  defaults
//! ```
//!
//! | Variable                    | Description                    |
//! |-----------------------------|--------------------------------|
//! | `TERMGATE_BIND`             | Listener IP address            |
//! | `TERMGATE_PORT`             | Listener port                  |
//! | `TERMGATE_CONFIG`           | Configuration file path        |
//! | `TERMGATE_PID_FILE`         | Liveness marker path           |
//! | `TERMGATE_CONNECT_TIMEOUT`  | SSH connect budget (secs)      |
//! | `TERMGATE_DRAIN_TIMEOUT`    | Shutdown drain deadline (secs) |
//! | `TERMGATE_MAX_SESSIONS`     | Concurrent session cap         |
//! | `TERMGATE_LOG_LEVEL`        | Log level fallback             |
//!
//! # Shutdown
//!
//! SIGINT (Ctrl+C) or SIGTERM clears the shared `running` flag.  The accept
//! loop notices within 200 ms, every live session is asked to close, and the
//! process exits once they are gone or the drain deadline passes.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use termgate::domain::GatewayConfig;
use termgate::infrastructure::{load_config, run_server, SshConnector};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// WebSocket-to-SSH terminal gateway.
///
/// Every option is optional; unset options fall back to the configuration
/// file (if any) and then to built-in defaults.
#[derive(Debug, Parser)]
#[command(
    name = "termgate",
    about = "WebSocket-to-SSH terminal gateway for browser-based shell sessions",
    version
)]
struct Cli {
    /// IP address to bind the WebSocket listener to.
    ///
    /// `0.0.0.0` accepts connections on every interface; `127.0.0.1` only
    /// local ones.
    #[arg(long, env = "TERMGATE_BIND")]
    bind: Option<IpAddr>,

    /// TCP port for the WebSocket listener.
    #[arg(long, env = "TERMGATE_PORT")]
    port: Option<u16>,

    /// Path of a TOML configuration file.  A missing file is an error.
    #[arg(long, env = "TERMGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Path of the liveness marker (PID file) written at startup.
    #[arg(long, env = "TERMGATE_PID_FILE")]
    pid_file: Option<PathBuf>,

    /// Do not write a liveness marker.
    #[arg(long, conflicts_with = "pid_file")]
    no_pid_file: bool,

    /// SSH connect budget in seconds (TCP + handshake + auth + shell).
    #[arg(long, env = "TERMGATE_CONNECT_TIMEOUT")]
    connect_timeout: Option<u64>,

    /// Seconds to wait for sessions to close at shutdown.
    #[arg(long, env = "TERMGATE_DRAIN_TIMEOUT")]
    drain_timeout: Option<u64>,

    /// Maximum number of concurrent sessions.
    #[arg(long, env = "TERMGATE_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, env = "TERMGATE_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Cli {
    /// Loads the configuration file (if given) and applies the CLI overrides.
    ///
    /// Returns the resolved config and the file's log level, if a file was
    /// read.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid, or if an
    /// override is zero where a positive value is required.
    fn resolve(&self) -> anyhow::Result<(GatewayConfig, Option<String>)> {
        let (base, file_log_level) = match &self.config {
            Some(path) => {
                let file = load_config(path)?;
                let level = file.server.log_level.clone();
                let cfg = file
                    .into_gateway_config()
                    .with_context(|| format!("invalid configuration in {}", path.display()))?;
                (cfg, Some(level))
            }
            None => (GatewayConfig::default(), None),
        };
        Ok((self.apply(base)?, file_log_level))
    }

    /// Layers the CLI overrides on top of `cfg`.
    fn apply(&self, mut cfg: GatewayConfig) -> anyhow::Result<GatewayConfig> {
        if self.bind.is_some() || self.port.is_some() {
            cfg.listen_addr = SocketAddr::new(
                self.bind.unwrap_or(cfg.listen_addr.ip()),
                self.port.unwrap_or(cfg.listen_addr.port()),
            );
        }
        if self.no_pid_file {
            cfg.pid_file = None;
        } else if let Some(path) = &self.pid_file {
            cfg.pid_file = Some(path.clone());
        }
        if let Some(secs) = self.connect_timeout {
            anyhow::ensure!(secs > 0, "--connect-timeout must be greater than zero");
            cfg.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.drain_timeout {
            cfg.drain_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = self.max_sessions {
            anyhow::ensure!(n > 0, "--max-sessions must be greater than zero");
            cfg.max_sessions = n;
        }
        Ok(cfg)
    }
}

/// Picks the log filter: `RUST_LOG`, then the CLI, then the file, then `info`.
fn log_filter(cli_level: Option<&str>, file_level: Option<&str>) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(cli_level.or(file_level).unwrap_or("info"))
    })
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Program entry point.
///
/// The runtime is single-threaded: browser I/O for every session is
/// multiplexed on this one thread, and blocking SSH work runs on dedicated
/// threads outside it.
#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // The config file is read before logging starts because it can carry the
    // log level.
    let (config, file_log_level) = cli.resolve()?;

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(
            cli.log_level.as_deref(),
            file_log_level.as_deref(),
        ))
        .init();

    info!(
        "termgate {} starting: listen={}, hosts={}, max_sessions={}",
        env!("CARGO_PKG_VERSION"),
        config.listen_addr,
        config.hosts.len(),
        config.max_sessions
    );

    // ── Graceful shutdown flag ─────────────────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    tokio::spawn(async move {
        match wait_for_signal().await {
            Ok(name) => {
                info!("received {name}, initiating graceful shutdown");
                running_clone.store(false, Ordering::Relaxed);
            }
            Err(e) => error!("failed to install signal handler: {e}"),
        }
    });

    run_server(config, Arc::new(SshConnector::new()), running).await?;

    info!("termgate stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "Ctrl+C"),
        _ = term.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "Ctrl+C")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
