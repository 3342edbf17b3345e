//! Application layer for termgate.
//!
//! The application layer knows *what* a terminal session does: its state
//! machine, how output travels from a blocking reader thread to the client,
//! and how the process tracks and stops its sessions.  It names no concrete
//! transport or SSH library; those live in the infrastructure layer behind
//! the [`FrameSink`] and [`ShellConnector`] seams.
//!
//! # Responsibilities
//!
//! - `bridge`    one remote shell, its reader and writer threads
//! - `outbound`  the cross-context FIFO and drain loop (dispatcher)
//! - `session`   the per-connection state machine
//! - `registry`  the process-wide session table and liveness marker
//! - `transport` the seam the WebSocket layer plugs into

pub mod bridge;
pub mod liveness;
pub mod outbound;
pub mod registry;
pub mod session;
pub mod transport;

pub use bridge::{ConnectError, ConnectRequest, RemoteShell, ShellConnector};
pub use liveness::{LivenessError, LivenessMarker};
pub use registry::{RegisterError, SessionRegistry, SessionSummary};
pub use session::{CloseTrigger, SessionContext, SessionHandler};
pub use transport::{FrameSink, Inbound, InboundStream};
