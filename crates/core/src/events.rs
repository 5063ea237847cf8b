use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of the voice session, as observed by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

/// Events the session manager emits back to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// The connection moved to a new state.
    StateChanged(ConnectionState),
    /// Normalized loudness in `[0, 1]`, from the microphone or from agent speech.
    Volume(f32),
    /// The agent started (`true`) or stopped (`false`) speaking.
    Speaking(bool),
    /// The remote agent asked to advance the onboarding flow by `increment` stages.
    Promotion(u32),
}
