//! # termgate-core
//!
//! Shared library for the termgate terminal gateway containing the
//! browser-facing wire protocol and the session domain types.
//!
//! This crate has zero dependencies on sockets, threads, or an async runtime.
//! Everything here can be unit-tested without a network or an SSH server.
//!
//! # Architecture overview
//!
//! termgate lets many browser clients open live shell sessions on managed
//! hosts.  Each browser speaks JSON over a WebSocket; the gateway speaks SSH
//! (with a pseudo-terminal) to the remote host.  This crate defines the two
//! things both sides of that bridge agree on:
//!
//! - **`protocol`** – The JSON frames exchanged with the browser.  Inbound
//!   frames decode into [`ClientMessage`]; outbound frames are built from
//!   [`ServerMessage`].  A malformed frame becomes a [`FrameError`], never a
//!   connection failure.
//!
//! - **`domain`** – Session identity, the session state machine
//!   ([`SessionState`]), terminal geometry with its resize policy
//!   ([`TermGeometry`]), and the remote target/credential pair.

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `termgate_core::ClientMessage` instead of the full module path.
pub use domain::session::{
    Credentials, RemoteTarget, SessionId, SessionState, TermGeometry, TransitionError,
    MAX_TERM_DIMENSION,
};
pub use protocol::messages::{
    decode_client_frame, encode_server_message, ClientMessage, FrameError, ServerMessage,
};
