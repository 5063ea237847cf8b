//! Error taxonomy of the voice session manager.
//!
//! Component errors are local to their module; [`SessionError`] is what the
//! public `connect` reports. Every variant except `MalformedAudio` also
//! surfaces as the `Error` connection state.

use gemini_realtime::LiveError;

/// Failure converting audio between representations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed audio: {0}")]
    MalformedAudio(String),
}

/// Failure acquiring or running the microphone.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CaptureError {
    #[error("Microphone unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Failure acquiring or running the speaker.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlaybackError {
    #[error("Speaker unavailable: {0}")]
    DeviceUnavailable(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("Failed to open channel: {0}")]
    ChannelOpenFailed(String),
    #[error("Channel error: {0}")]
    ChannelError(String),
    #[error("Malformed audio: {0}")]
    MalformedAudio(String),
    #[error("Missing configuration: {0}")]
    ConfigMissing(String),
    #[error("Connect attempt was cancelled")]
    Cancelled,
    #[error("Session manager is no longer running")]
    ManagerClosed,
}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::DeviceUnavailable(msg) => SessionError::DeviceUnavailable(msg),
        }
    }
}

impl From<PlaybackError> for SessionError {
    fn from(err: PlaybackError) -> Self {
        match err {
            PlaybackError::DeviceUnavailable(msg) => SessionError::DeviceUnavailable(msg),
        }
    }
}

impl From<CodecError> for SessionError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::MalformedAudio(msg) => SessionError::MalformedAudio(msg),
        }
    }
}

impl From<LiveError> for SessionError {
    fn from(err: LiveError) -> Self {
        match err {
            LiveError::MissingApiKey => SessionError::ConfigMissing(err.to_string()),
            other => SessionError::ChannelOpenFailed(other.to_string()),
        }
    }
}
