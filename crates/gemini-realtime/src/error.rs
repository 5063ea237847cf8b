use tokio_tungstenite::tungstenite;

/// Errors raised by the Gemini Live client.
#[derive(Debug, thiserror::Error)]
pub enum LiveError {
    #[error("No Gemini API key configured")]
    MissingApiKey,
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tungstenite::Error>),
    #[error("Failed to serialize client message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Setup handshake failed: {0}")]
    Handshake(String),
    #[error("Channel closed")]
    Closed,
    #[error("Outbound queue is full")]
    Backpressure,
}

impl From<tungstenite::Error> for LiveError {
    fn from(err: tungstenite::Error) -> Self {
        LiveError::WebSocket(Box::new(err))
    }
}
