//! Session state tag exposed to callers

use serde::{Deserialize, Serialize};

/// Lifecycle of the encrypted session on one physical connection.
///
/// ```text
/// Unpaired -> Handshaking -> Established -> Expired
///     ^            |
///     +------------+  (timeout or rejection)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Unpaired,
    Handshaking,
    Established,
    /// Terminal until the session is reset or the transport reconnected.
    Expired,
}

impl SessionState {
    pub fn is_established(self) -> bool {
        self == SessionState::Established
    }

    /// A handshake may still bring the session up without external action.
    pub fn can_establish(self) -> bool {
        matches!(self, SessionState::Unpaired | SessionState::Handshaking)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Unpaired => "UNPAIRED",
            SessionState::Handshaking => "HANDSHAKING",
            SessionState::Established => "ESTABLISHED",
            SessionState::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}
