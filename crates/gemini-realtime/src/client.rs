//! Duplex channel to the Gemini Live API.

use crate::{
    error::LiveError,
    types::{
        Blob, ClientMessage, FunctionResponse, RealtimeInput, ServerMessage, Setup,
        ToolResponseMessage,
    },
};
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, protocol::Message as WsMessage},
};
use tracing::{Instrument, debug, error, info, instrument, warn};

/// Default Gemini Live WebSocket endpoint.
pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const CHANNEL_CAPACITY: usize = 128;

/// Something received on an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// A parsed server frame.
    Message(Box<ServerMessage>),
    /// The remote side closed the connection.
    Closed { reason: Option<String> },
    /// The transport failed after the channel was open.
    Error(String),
}

/// Outbound half of a [`LiveChannel`]. Dropping every clone closes the socket.
#[derive(Debug, Clone)]
pub struct LiveSender {
    tx: mpsc::Sender<ClientMessage>,
}

impl LiveSender {
    pub async fn send(&self, msg: ClientMessage) -> Result<(), LiveError> {
        self.tx.send(msg).await.map_err(|_| LiveError::Closed)
    }

    /// Streams one chunk of base64 audio tagged with `mime_type`.
    pub async fn send_audio(&self, mime_type: &str, data: String) -> Result<(), LiveError> {
        self.send(audio_input(mime_type, data)).await
    }

    /// Queues one chunk of audio without waiting. Fails with
    /// [`LiveError::Backpressure`] when the outbound queue is full.
    pub fn try_send_audio(&self, mime_type: &str, data: String) -> Result<(), LiveError> {
        self.tx
            .try_send(audio_input(mime_type, data))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => LiveError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => LiveError::Closed,
            })
    }

    pub async fn send_tool_responses(
        &self,
        responses: Vec<FunctionResponse>,
    ) -> Result<(), LiveError> {
        self.send(ClientMessage::ToolResponse(ToolResponseMessage {
            function_responses: responses,
        }))
        .await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

fn audio_input(mime_type: &str, data: String) -> ClientMessage {
    ClientMessage::RealtimeInput(RealtimeInput {
        audio: Blob {
            mime_type: mime_type.to_string(),
            data,
        },
    })
}

/// An open, set-up session with the remote agent.
#[derive(Debug)]
pub struct LiveChannel {
    pub sender: LiveSender,
    pub events: mpsc::Receiver<LiveEvent>,
}

impl LiveChannel {
    /// Assembles a channel from raw halves; whoever holds the opposite ends
    /// plays the remote side.
    pub fn from_parts(
        outbound: mpsc::Sender<ClientMessage>,
        events: mpsc::Receiver<LiveEvent>,
    ) -> Self {
        Self {
            sender: LiveSender { tx: outbound },
            events,
        }
    }
}

/// Opens channels to a realtime agent.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Whether a credential and endpoint are configured at all.
    fn is_configured(&self) -> bool {
        true
    }

    /// Connects, sends `setup` and resolves once the server acknowledged it.
    async fn open(&self, setup: Setup) -> Result<LiveChannel, LiveError>;
}

/// [`LiveConnector`] backed by the Gemini Live WebSocket API.
pub struct GeminiLiveClient {
    api_key: Option<SecretString>,
    endpoint: String,
}

impl GeminiLiveClient {
    pub fn new(api_key: Option<String>, endpoint: impl Into<String>) -> Self {
        Self {
            api_key: api_key.filter(|k| !k.is_empty()).map(SecretString::from),
            endpoint: endpoint.into(),
        }
    }

    fn url(&self) -> Result<String, LiveError> {
        let api_key = self.api_key.as_ref().ok_or(LiveError::MissingApiKey)?;
        Ok(format!("{}?key={}", self.endpoint, api_key.expose_secret()))
    }
}

#[async_trait]
impl LiveConnector for GeminiLiveClient {
    fn is_configured(&self) -> bool {
        self.api_key.is_some() && !self.endpoint.is_empty()
    }

    #[instrument(name = "gemini_live_open", skip_all, fields(model = %setup.model))]
    async fn open(&self, setup: Setup) -> Result<LiveChannel, LiveError> {
        let url = self.url()?;
        let (ws_stream, _) = connect_async(url).await?;
        info!("Connected to Gemini Live WebSocket.");
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        let setup_payload = serde_json::to_string(&ClientMessage::Setup(setup))?;
        ws_tx.send(WsMessage::Text(setup_payload.into())).await?;
        wait_for_setup_complete(&mut ws_rx).await?;
        info!("Gemini session setup is complete. Ready for bidirectional streaming.");

        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(pump(ws_tx, ws_rx, outbound_rx, events_tx).in_current_span());
        Ok(LiveChannel::from_parts(outbound_tx, events_rx))
    }
}

/// A decoded WebSocket frame.
enum Incoming {
    Server(Box<ServerMessage>),
    Closed(Option<String>),
    Ignored,
}

fn parse_frame(frame: WsMessage) -> Incoming {
    let bytes: &[u8] = match &frame {
        WsMessage::Text(text) => text.as_str().as_bytes(),
        WsMessage::Binary(data) => &data[..],
        WsMessage::Close(close_frame) => {
            return Incoming::Closed(close_frame.as_ref().map(|f| f.reason.as_str().to_string()));
        }
        _ => return Incoming::Ignored,
    };
    match serde_json::from_slice::<ServerMessage>(bytes) {
        Ok(msg) => Incoming::Server(Box::new(msg)),
        Err(e) => {
            warn!(error = %e, "Failed to parse Gemini server frame. Ignoring.");
            Incoming::Ignored
        }
    }
}

/// Reads frames until the server acknowledges the setup message.
async fn wait_for_setup_complete<R>(ws_rx: &mut R) -> Result<(), LiveError>
where
    R: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = ws_rx.next().await {
        match parse_frame(frame?) {
            Incoming::Server(msg) if msg.setup_complete.is_some() => return Ok(()),
            Incoming::Server(msg) => {
                warn!(?msg, "Received unexpected message during Gemini setup.");
            }
            Incoming::Closed(reason) => {
                return Err(LiveError::Handshake(format!(
                    "server closed the connection during setup: {}",
                    reason.unwrap_or_else(|| "no reason given".to_string())
                )));
            }
            Incoming::Ignored => {}
        }
    }
    Err(LiveError::Handshake("connection ended before setup completed".to_string()))
}

/// Moves frames between the socket and the channel halves until either side ends.
async fn pump<S, R>(
    mut ws_tx: S,
    mut ws_rx: R,
    mut outbound: mpsc::Receiver<ClientMessage>,
    events: mpsc::Sender<LiveEvent>,
) where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
    R: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(msg) => {
                    let payload = match serde_json::to_string(&msg) {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!(error = %e, "Failed to serialize client message. Dropping it.");
                            continue;
                        }
                    };
                    if let Err(e) = ws_tx.send(WsMessage::Text(payload.into())).await {
                        error!(error = %e, "Error writing to Gemini WebSocket.");
                        let _ = events.send(LiveEvent::Error(e.to_string())).await;
                        break;
                    }
                }
                None => {
                    debug!("Channel sender dropped. Closing Gemini WebSocket.");
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            },
            frame = ws_rx.next() => match frame {
                Some(Ok(frame)) => match parse_frame(frame) {
                    Incoming::Server(msg) => {
                        let _ = events.send(LiveEvent::Message(msg)).await;
                    }
                    Incoming::Closed(reason) => {
                        info!(?reason, "Gemini WebSocket connection closed by server.");
                        let _ = events.send(LiveEvent::Closed { reason }).await;
                        break;
                    }
                    Incoming::Ignored => {}
                },
                Some(Err(e)) => {
                    error!(error = %e, "Error reading from Gemini WebSocket.");
                    let _ = events.send(LiveEvent::Error(e.to_string())).await;
                    break;
                }
                None => {
                    let _ = events.send(LiveEvent::Closed { reason: None }).await;
                    break;
                }
            },
        }
    }
}
