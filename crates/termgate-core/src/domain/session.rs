//! Session domain types: identity, lifecycle state and terminal geometry.
//!
//! # Session lifecycle
//!
//! ```text
//!            Auth                 connect ok
//!   INIT ──────────► AUTHENTICATING ──────────► ACTIVE
//!    ▲  ◄──────────────────┘  │                   │
//!    │   auth / network fail  │ protocol fail     │ client gone / remote closed
//!    │                        ▼                   ▼
//!    └──────(idle, cap)──► CLOSING ◄──────────────┘
//!                             │
//!                             ▼
//!                           CLOSED   (terminal; present in no registry)
//! ```
//!
//! The transition table lives in [`SessionState::can_transition_to`] so the
//! session handler cannot drift from it.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Upper bound applied to each terminal dimension on resize.
pub const MAX_TERM_DIMENSION: u16 = 1000;

// ── Identity ──────────────────────────────────────────────────────────────────

/// Opaque unique identifier assigned to a session at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Allocates a fresh random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The first UUID group is unique enough for log correlation and keeps
        // log lines short.
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

// ── State machine ─────────────────────────────────────────────────────────────

/// Lifecycle state of one terminal session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// Connected; waiting for an `auth` message.
    Init,
    /// Remote connect in progress.
    Authenticating,
    /// Remote shell open; input and output flowing.
    Active,
    /// Teardown in progress.
    Closing,
    /// Terminal state.  Further messages are ignored.
    Closed,
}

/// An attempted transition that the state machine does not allow.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: SessionState,
    pub to: SessionState,
}

impl SessionState {
    /// Returns `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Init, Authenticating)
                | (Init, Closing)
                | (Authenticating, Active)
                | (Authenticating, Init)
                | (Authenticating, Closing)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }

    /// Moves to `next`, returning the previous state.
    ///
    /// # Errors
    ///
    /// Returns [`TransitionError`] (and leaves `self` unchanged) if the
    /// transition is not in the table.
    pub fn transition(&mut self, next: SessionState) -> Result<SessionState, TransitionError> {
        if !self.can_transition_to(next) {
            return Err(TransitionError {
                from: *self,
                to: next,
            });
        }
        let prev = *self;
        *self = next;
        Ok(prev)
    }

    /// Returns `true` once teardown has started or finished.
    pub fn is_closing_or_closed(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Closed)
    }

    /// Returns `true` while a remote bridge may exist for the session.
    pub fn has_bridge(self) -> bool {
        matches!(self, SessionState::Authenticating | SessionState::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Init => "INIT",
            SessionState::Authenticating => "AUTHENTICATING",
            SessionState::Active => "ACTIVE",
            SessionState::Closing => "CLOSING",
            SessionState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

// ── Geometry ──────────────────────────────────────────────────────────────────

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermGeometry {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermGeometry {
    /// The classic 80x24 terminal.
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TermGeometry {
    /// Applies the resize policy to a client request.
    ///
    /// Returns `None` when either dimension is zero or negative (the request
    /// is dropped, not forwarded).  Otherwise each dimension is clamped to
    /// [`MAX_TERM_DIMENSION`].
    ///
    /// ```rust
    /// use termgate_core::{TermGeometry, MAX_TERM_DIMENSION};
    ///
    /// assert_eq!(TermGeometry::from_request(0, 24), None);
    /// let g = TermGeometry::from_request(5000, 40).unwrap();
    /// assert_eq!(g.cols, MAX_TERM_DIMENSION);
    /// ```
    pub fn from_request(cols: i64, rows: i64) -> Option<Self> {
        if cols <= 0 || rows <= 0 {
            return None;
        }
        let clamp = |v: i64| v.min(i64::from(MAX_TERM_DIMENSION)) as u16;
        Some(Self {
            cols: clamp(cols),
            rows: clamp(rows),
        })
    }
}

// ── Remote target ─────────────────────────────────────────────────────────────

/// Where a session's shell runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Resolved host name or address (port 22 is implied when absent).
    pub host: String,
    /// Remote login name.
    pub username: String,
}

/// A password held only for the duration of one connect call.
///
/// Not `Clone`, not `Serialize`, and its `Debug` output is redacted: the value
/// is moved into the connector and dropped when the call returns.
pub struct Credentials {
    password: String,
}

impl Credentials {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }

    /// Borrow the secret for handing to the remote login protocol.
    pub fn expose(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credentials(<redacted>)")
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_are_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_session_id_display_is_short_prefix() {
        let id = SessionId::new();
        let shown = id.to_string();
        assert_eq!(shown.len(), 8);
        assert!(id.as_uuid().simple().to_string().starts_with(&shown));
    }

    #[test]
    fn test_happy_path_transitions_are_legal() {
        // Arrange
        let mut state = SessionState::Init;

        // Act / Assert
        assert_eq!(state.transition(SessionState::Authenticating), Ok(SessionState::Init));
        assert_eq!(
            state.transition(SessionState::Active),
            Ok(SessionState::Authenticating)
        );
        assert_eq!(state.transition(SessionState::Closing), Ok(SessionState::Active));
        assert_eq!(state.transition(SessionState::Closed), Ok(SessionState::Closing));
    }

    #[test]
    fn test_auth_failure_returns_to_init() {
        let mut state = SessionState::Authenticating;
        assert!(state.transition(SessionState::Init).is_ok());
        assert_eq!(state, SessionState::Init);
    }

    #[test]
    fn test_closed_is_terminal() {
        let mut state = SessionState::Closed;
        for next in [
            SessionState::Init,
            SessionState::Authenticating,
            SessionState::Active,
            SessionState::Closing,
            SessionState::Closed,
        ] {
            assert!(state.transition(next).is_err(), "CLOSED -> {next:?} must fail");
        }
        assert_eq!(state, SessionState::Closed);
    }

    #[test]
    fn test_init_cannot_jump_to_active() {
        let mut state = SessionState::Init;
        let err = state.transition(SessionState::Active).unwrap_err();
        assert_eq!(
            err,
            TransitionError {
                from: SessionState::Init,
                to: SessionState::Active
            }
        );
        assert_eq!(state, SessionState::Init, "failed transition must not mutate");
    }

    #[test]
    fn test_closing_cannot_reenter_closing() {
        // Re-entering close logic is a no-op decided by the caller; the table
        // itself refuses the self-loop.
        assert!(!SessionState::Closing.can_transition_to(SessionState::Closing));
    }

    #[test]
    fn test_state_display_is_uppercase() {
        assert_eq!(SessionState::Authenticating.to_string(), "AUTHENTICATING");
    }

    #[test]
    fn test_geometry_rejects_non_positive() {
        assert_eq!(TermGeometry::from_request(0, 24), None);
        assert_eq!(TermGeometry::from_request(80, 0), None);
        assert_eq!(TermGeometry::from_request(-5, 24), None);
        assert_eq!(TermGeometry::from_request(80, -1), None);
    }

    #[test]
    fn test_geometry_clamps_to_upper_bound() {
        let g = TermGeometry::from_request(100_000, 1001).unwrap();
        assert_eq!(g.cols, MAX_TERM_DIMENSION);
        assert_eq!(g.rows, MAX_TERM_DIMENSION);
    }

    #[test]
    fn test_geometry_passes_sane_values_through() {
        assert_eq!(
            TermGeometry::from_request(132, 43),
            Some(TermGeometry { cols: 132, rows: 43 })
        );
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new("s3cret");
        assert_eq!(creds.expose(), "s3cret");
        assert!(!format!("{creds:?}").contains("s3cret"));
    }
}
