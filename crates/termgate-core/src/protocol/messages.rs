//! JSON message types for the browser-facing WebSocket protocol.
//!
//! Every frame is a single JSON object whose `"type"` field selects the
//! variant.  The browser sends three kinds of frames and receives two:
//!
//! ```text
//! Browser → Gateway:  {"type":"auth","host":"10.0.0.5","username":"u","password":"p"}
//!                     {"type":"input","data":"ls\n"}
//!                     {"type":"resize","cols":120,"rows":40}
//!
//! Gateway → Browser:  {"type":"output","data":"total 0\r\n"}
//!                     {"type":"error","message":"authentication failed"}
//! ```
//!
//! # Why decode by hand instead of `#[serde(tag = "type")]`?
//!
//! A derived tagged enum reports "unknown variant" and "missing field" through
//! the same opaque `serde_json::Error`.  The gateway must treat an unknown
//! `type` as an explicit, reportable [`FrameError`] (never a silent no-op), so
//! decoding is split in two steps: read the discriminant, then deserialize
//! the payload struct for that discriminant.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default terminal width applied when a `resize` frame omits `cols`.
pub const DEFAULT_COLS: i64 = 80;

/// Default terminal height applied when a `resize` frame omits `rows`.
pub const DEFAULT_ROWS: i64 = 24;

// ── Error type ────────────────────────────────────────────────────────────────

/// A malformed inbound frame.
///
/// A `FrameError` is local to one frame: the session handler logs it, replies
/// with an `error` message and keeps the connection open.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The frame text is not valid JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The frame is valid JSON but not an object with a string `type` field.
    #[error("frame has no \"type\" field")]
    MissingType,

    /// The `type` field names a message kind the gateway does not understand.
    #[error("unknown message type: {0:?}")]
    UnknownType(String),

    /// The payload for a known `type` has a missing or mistyped field.
    #[error("invalid {kind} payload: {detail}")]
    InvalidPayload { kind: &'static str, detail: String },

    /// An outbound message could not be serialized.
    #[error("failed to encode outbound message: {0}")]
    Encode(String),
}

// ── Browser → Gateway messages ───────────────────────────────────────────────

/// All messages that a browser can send to the gateway.
///
/// `Debug` is implemented by hand so that the password carried by
/// [`ClientMessage::Auth`] can never reach a log line.
#[derive(Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Open a remote shell on `host` as `username`.
    Auth {
        /// Remote host name, address, or managed-host alias.
        host: String,
        /// Remote login name.
        username: String,
        /// Remote password.  Forwarded to the SSH server and then dropped.
        password: String,
    },

    /// Keystrokes to forward to the remote shell, byte-for-byte.
    Input {
        /// Raw bytes (the UTF-8 encoding of the JSON `data` string).
        data: Vec<u8>,
    },

    /// Change the remote pseudo-terminal geometry.
    ///
    /// The values are kept signed and unvalidated here; the session handler
    /// applies the resize policy (see [`crate::TermGeometry::from_request`]).
    Resize {
        /// Requested width in character cells.
        cols: i64,
        /// Requested height in character cells.
        rows: i64,
    },
}

impl ClientMessage {
    /// Returns the wire discriminant of this message.
    ///
    /// Used in log lines instead of the message itself so that field values
    /// (passwords, keystrokes) are never logged.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Auth { .. } => "auth",
            ClientMessage::Input { .. } => "input",
            ClientMessage::Resize { .. } => "resize",
        }
    }
}

impl fmt::Debug for ClientMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientMessage::Auth { host, username, .. } => f
                .debug_struct("Auth")
                .field("host", host)
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            ClientMessage::Input { data } => {
                f.debug_struct("Input").field("len", &data.len()).finish()
            }
            ClientMessage::Resize { cols, rows } => f
                .debug_struct("Resize")
                .field("cols", cols)
                .field("rows", rows)
                .finish(),
        }
    }
}

// Payload shapes for each inbound `type`.  Missing optional fields fall back
// to the same defaults the dashboard's terminal widget assumes.

#[derive(Deserialize)]
struct AuthPayload {
    #[serde(default)]
    host: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    password: String,
}

#[derive(Deserialize)]
struct InputPayload {
    #[serde(default)]
    data: String,
}

#[derive(Deserialize)]
struct ResizePayload {
    #[serde(default = "default_cols")]
    cols: i64,
    #[serde(default = "default_rows")]
    rows: i64,
}

fn default_cols() -> i64 {
    DEFAULT_COLS
}

fn default_rows() -> i64 {
    DEFAULT_ROWS
}

/// Decodes one inbound text frame into a [`ClientMessage`].
///
/// # Errors
///
/// Returns a [`FrameError`] describing why the frame was rejected.  The
/// caller drops the frame and keeps the connection open.
///
/// # Examples
///
/// ```rust
/// use termgate_core::{decode_client_frame, ClientMessage};
///
/// let msg = decode_client_frame(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
/// assert_eq!(msg, ClientMessage::Resize { cols: 120, rows: 40 });
/// ```
pub fn decode_client_frame(text: &str) -> Result<ClientMessage, FrameError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| FrameError::InvalidJson(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();

    match kind.as_str() {
        "auth" => {
            let p: AuthPayload = payload(value, "auth")?;
            Ok(ClientMessage::Auth {
                host: p.host,
                username: p.username,
                password: p.password,
            })
        }
        "input" => {
            let p: InputPayload = payload(value, "input")?;
            Ok(ClientMessage::Input {
                data: p.data.into_bytes(),
            })
        }
        "resize" => {
            let p: ResizePayload = payload(value, "resize")?;
            Ok(ClientMessage::Resize {
                cols: p.cols,
                rows: p.rows,
            })
        }
        _ => Err(FrameError::UnknownType(kind)),
    }
}

fn payload<T: for<'de> Deserialize<'de>>(
    value: serde_json::Value,
    kind: &'static str,
) -> Result<T, FrameError> {
    serde_json::from_value(value).map_err(|e| FrameError::InvalidPayload {
        kind,
        detail: e.to_string(),
    })
}

// ── Gateway → Browser messages ───────────────────────────────────────────────

/// All messages that the gateway sends to the browser.
///
/// # Serde representation
///
/// ```json
/// {"type":"output","data":"..."}
/// {"type":"error","message":"..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Terminal output read from the remote shell.
    Output {
        /// Remote bytes as text.  Concatenating the `data` of consecutive
        /// frames reproduces the remote byte stream.
        data: String,
    },

    /// A human-readable error for the browser to display.
    Error {
        /// Error description.  Never contains credentials.
        message: String,
    },
}

impl ServerMessage {
    /// Convenience constructor for [`ServerMessage::Error`].
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Serializes a [`ServerMessage`] into the JSON text of one WebSocket frame.
///
/// # Errors
///
/// Returns [`FrameError::Encode`] if serialization fails.
pub fn encode_server_message(msg: &ServerMessage) -> Result<String, FrameError> {
    serde_json::to_string(msg).map_err(|e| FrameError::Encode(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
