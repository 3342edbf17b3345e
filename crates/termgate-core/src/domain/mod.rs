//! Domain entities for termgate.
//!
//! Pure session-level rules with no infrastructure dependencies: who a
//! session is, which state it is in, which transitions are legal, and how
//! terminal geometry requests are validated.

/// Session identity, state machine and terminal geometry.
pub mod session;
