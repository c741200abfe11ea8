use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the single outbound messaging session.
///
/// `LoggedOut` is terminal until the operator explicitly restarts the
/// session; the other states cycle as the connection comes and goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    /// No live session. Initial state, and where every connection loss lands.
    #[default]
    Disconnected,
    /// A pairing challenge has been issued and awaits confirmation on the
    /// paired device.
    Pairing,
    /// Session is open and ready to send.
    Connected,
    /// The account was deliberately signed out by the operator.
    LoggedOut,
}

impl SessionStatus {
    /// Whether `send` is allowed in this state.
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionStatus::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Pairing => "pairing",
            SessionStatus::Connected => "connected",
            SessionStatus::LoggedOut => "loggedOut",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
