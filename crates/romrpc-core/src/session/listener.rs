//! Session lifecycle observation.

use crate::RomError;

/// Liveness of a client session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, never connected (or the first connect failed).
    Idle,
    Connecting,
    Established,
    /// Transport lost; the reconnect loop is running.
    Reconnecting,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Established => "established",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callbacks for connection lifecycle changes.
///
/// Callbacks run on a spawned task, never on the transport receive path.
/// Every method has an empty default.
pub trait SessionListener: Send + Sync + 'static {
    fn connected(&self) {}

    fn reconnecting(&self) {}

    /// `same_session` is false when the server handed out a new session id;
    /// server-side state (objects, subscriptions) from the old one is gone.
    fn reconnected(&self, _same_session: bool) {}

    fn disconnected(&self) {}

    /// Reconnection gave up, or the server closed with a fatal status.
    fn connection_failed(&self, _error: &RomError) {}
}
