//! Datapath session lifecycle.

use std::fmt;

use serde::Serialize;

/// Where a datapath connection is in its lifecycle.
///
/// ```text
/// Connecting → AwaitingHandshake → Admitted → Active → Closed
///                      └──────────→ Rejected
/// ```
///
/// Any non-terminal state may also fall straight to `Closed` on a fault,
/// timeout or controller shutdown. `Rejected` is only reachable from
/// `AwaitingHandshake`. Nothing leaves `Closed` or `Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transport accepted, identity not yet announced.
    Connecting,
    /// Identity announced, admission decision pending.
    AwaitingHandshake,
    /// Admitted, switching rules being installed.
    Admitted,
    /// Rules installed; steady state.
    Active,
    Closed,
    Rejected,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Rejected)
    }

    /// Whether `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Connecting, AwaitingHandshake) => true,
            (AwaitingHandshake, Admitted) | (AwaitingHandshake, Rejected) => true,
            (Admitted, Active) => true,
            (from, Closed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::AwaitingHandshake => "awaiting_handshake",
            SessionState::Admitted => "admitted",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
            SessionState::Rejected => "rejected",
        };
        f.write_str(s)
    }
}
