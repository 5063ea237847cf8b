//! Voice Session Manager
//!
//! One actor task owns everything that changes during a session: the
//! connection state, the channel sender, the microphone and the playback
//! scheduler. Device callbacks, channel traffic and public calls all arrive
//! at that task as messages, so no two code paths ever touch the state at
//! once. Every event produced on behalf of a session carries that session's
//! epoch; events from an earlier session are dropped on arrival.

use crate::{
    audio_utils::{
        AudioFrame, CAPTURE_MIME_TYPE, PLAYBACK_SAMPLE_RATE, decode_transport, encode_transport,
        pcm16_to_samples, samples_to_pcm16,
    },
    backend::AudioBackend,
    capture::CaptureDevice,
    config::SessionSettings,
    error::SessionError,
    observer::SessionObserver,
    playback::{ItemHandle, PlaybackScheduler},
    tool_protocol,
};
use gemini_realtime::{
    LiveChannel, LiveConnector, LiveError, LiveEvent, LiveSender,
    types::{
        Content, FunctionCall, GenerationConfig, ResponseModality, ServerMessage, Setup,
        SpeechConfig, Tool,
    },
};
use lumi_core::{ConnectionState, SessionConfig};
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

const COMMAND_CAPACITY: usize = 16;

type ConnectReply = oneshot::Sender<Result<(), SessionError>>;

enum Command {
    Connect {
        config: SessionConfig,
        reply: ConnectReply,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Everything that reaches the actor from outside a public call.
enum Event {
    ChannelOpened {
        epoch: u64,
        result: Result<LiveChannel, LiveError>,
    },
    Remote {
        epoch: u64,
        event: LiveEvent,
    },
    /// The channel's event stream ended.
    RemoteEnded { epoch: u64 },
    Captured {
        epoch: u64,
        frame: AudioFrame,
        level: f32,
    },
    PlaybackFinished {
        epoch: u64,
        handle: ItemHandle,
    },
}

/// Handle to the session actor. Cloning it gives another handle to the same
/// session.
#[derive(Clone)]
pub struct SessionManager {
    commands: mpsc::Sender<Command>,
}

impl SessionManager {
    /// Spawns the session actor on the current tokio runtime.
    pub fn new(
        connector: Arc<dyn LiveConnector>,
        backend: Arc<dyn AudioBackend>,
        observer: Arc<dyn SessionObserver>,
        settings: SessionSettings,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let actor = SessionActor {
            connector,
            backend,
            observer,
            settings,
            events_tx,
            state: ConnectionState::Disconnected,
            epoch: 0,
            span: Span::none(),
            pending: None,
            session: None,
        };
        tokio::spawn(actor.run(commands_rx, events_rx));
        Self {
            commands: commands_tx,
        }
    }

    /// Opens a session configured by `config`, replacing any current one.
    ///
    /// Resolves once the channel is open and both audio devices run, or with
    /// the reason the session ended up in the `Error` state.
    pub async fn connect(&self, config: SessionConfig) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Connect { config, reply })
            .await
            .map_err(|_| SessionError::ManagerClosed)?;
        rx.await.map_err(|_| SessionError::ManagerClosed)?
    }

    /// Ends the current session, if any. Safe to call in any state and any
    /// number of times.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).await.is_err() {
            debug!("Session actor already stopped");
            return;
        }
        let _ = rx.await;
    }
}

struct PendingConnect {
    epoch: u64,
    config: SessionConfig,
    reply: ConnectReply,
    task: JoinHandle<()>,
}

struct ActiveSession {
    epoch: u64,
    sender: LiveSender,
    forwarder: JoinHandle<()>,
    capture: Option<Box<dyn CaptureDevice>>,
    playback: Option<PlaybackScheduler>,
}

impl ActiveSession {
    fn is_speaking(&self) -> bool {
        self.playback.as_ref().is_some_and(|p| p.is_speaking())
    }
}

struct SessionActor {
    connector: Arc<dyn LiveConnector>,
    backend: Arc<dyn AudioBackend>,
    observer: Arc<dyn SessionObserver>,
    settings: SessionSettings,
    events_tx: mpsc::UnboundedSender<Event>,
    state: ConnectionState,
    epoch: u64,
    span: Span,
    pending: Option<PendingConnect>,
    session: Option<ActiveSession>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
    ) {
        let mut ticker = tokio::time::interval(self.settings.tuning.amplitude_tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let speaking = self.is_speaking();
            let span = self.span.clone();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect { config, reply }) => {
                        self.connect(config, reply).await;
                    }
                    Some(Command::Disconnect { reply }) => {
                        self.disconnect().instrument(span).await;
                        let _ = reply.send(());
                    }
                    None => {
                        self.disconnect().instrument(span).await;
                        debug!("All session handles dropped. Session actor exiting.");
                        break;
                    }
                },
                Some(event) = events.recv() => {
                    self.handle_event(event).instrument(span).await;
                }
                _ = ticker.tick(), if speaking => {
                    let _enter = span.enter();
                    self.report_playback_amplitude();
                }
            }
        }
    }

    fn is_speaking(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_speaking())
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!(from = %self.state, to = %state, "Connection state changed");
        self.state = state;
        self.observer.on_connection_state_change(state);
    }

    async fn connect(&mut self, config: SessionConfig, reply: ConnectReply) {
        // A live or half-open session ends in Disconnected before the next
        // one starts Connecting.
        if self.session.is_some() || self.pending.is_some() {
            let previous = self.span.clone();
            self.disconnect().instrument(previous).await;
        }

        if !self.connector.is_configured() {
            error!("Cannot connect: no Gemini API key is configured.");
            self.set_state(ConnectionState::Error);
            let _ = reply.send(Err(SessionError::ConfigMissing(
                "GEMINI_API_KEY is not set".to_string(),
            )));
            return;
        }

        self.epoch += 1;
        let epoch = self.epoch;
        self.span = info_span!("voice_session", epoch, stage = %config.stage_title);
        let _enter = self.span.clone().entered();
        info!("Connecting voice session");
        self.set_state(ConnectionState::Connecting);

        let setup = self.build_setup(&config);
        let connector = Arc::clone(&self.connector);
        let events = self.events_tx.clone();
        let task = tokio::spawn(
            async move {
                let result = connector.open(setup).await;
                let _ = events.send(Event::ChannelOpened { epoch, result });
            }
            .instrument(self.span.clone()),
        );

        self.pending = Some(PendingConnect {
            epoch,
            config,
            reply,
            task,
        });
    }

    fn build_setup(&self, config: &SessionConfig) -> Setup {
        Setup {
            model: self.settings.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec![ResponseModality::Audio],
                speech_config: Some(SpeechConfig::prebuilt(self.settings.voice.clone())),
            },
            system_instruction: Some(Content::text(config.compose_instruction())),
            tools: vec![Tool {
                function_declarations: vec![tool_protocol::declaration()],
            }],
        }
    }

    async fn disconnect(&mut self) {
        self.teardown().await;
        if self.state != ConnectionState::Disconnected {
            info!("Voice session disconnected");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Cancels a pending connect and releases every resource of the current
    /// session. Never fails; problems are logged.
    async fn teardown(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!(epoch = pending.epoch, "Cancelling in-flight connect");
            pending.task.abort();
            let _ = pending.reply.send(Err(SessionError::Cancelled));
        }
        self.close_session().await;
    }

    async fn close_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        debug!(epoch = session.epoch, "Releasing session resources");

        if let Some(mut capture) = session.capture.take() {
            capture.stop().await;
        }
        if let Some(mut playback) = session.playback.take() {
            let was_speaking = playback.is_speaking();
            playback.close().await;
            if was_speaking {
                self.observer.on_speaking_change(false);
                self.observer.on_volume_change(0.0);
            }
        }
        // Dropping the last sender closes the socket.
        drop(session.sender);
        session.forwarder.abort();
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::ChannelOpened { epoch, result } => self.on_channel_opened(epoch, result).await,
            Event::Remote { epoch, event } if self.is_current(epoch) => {
                self.on_remote(event).await;
            }
            Event::RemoteEnded { epoch } if self.is_current(epoch) => {
                info!("Channel event stream ended");
                self.close_session().await;
                self.set_state(ConnectionState::Disconnected);
            }
            Event::Captured {
                epoch,
                frame,
                level,
            } if self.is_current(epoch) => self.on_captured(frame, level),
            Event::PlaybackFinished { epoch, handle } if self.is_current(epoch) => {
                self.on_playback_finished(handle);
            }
            _ => debug!("Dropping event from a previous session"),
        }
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.epoch == epoch)
    }

    async fn on_channel_opened(&mut self, epoch: u64, result: Result<LiveChannel, LiveError>) {
        let pending = match self.pending.take() {
            Some(pending) if pending.epoch == epoch => pending,
            other => {
                self.pending = other;
                // Dropping a late channel closes it.
                debug!(epoch, "Discarding channel opened for a cancelled connect");
                return;
            }
        };

        let channel = match result {
            Ok(channel) => channel,
            Err(e) => {
                error!(error = %e, "Failed to open Gemini Live channel");
                self.set_state(ConnectionState::Error);
                let _ = pending.reply.send(Err(e.into()));
                return;
            }
        };

        info!("Channel open");
        self.set_state(ConnectionState::Connected);

        let LiveChannel { sender, mut events } = channel;
        let forward_tx = self.events_tx.clone();
        let forwarder = tokio::spawn(
            async move {
                while let Some(event) = events.recv().await {
                    if forward_tx.send(Event::Remote { epoch, event }).is_err() {
                        return;
                    }
                }
                let _ = forward_tx.send(Event::RemoteEnded { epoch });
            }
            .in_current_span(),
        );
        self.session = Some(ActiveSession {
            epoch,
            sender,
            forwarder,
            capture: None,
            playback: None,
        });

        match self.start_devices(epoch).await {
            Ok(()) => {
                info!(stage = %pending.config.stage_title, "Voice session is live");
                let _ = pending.reply.send(Ok(()));
            }
            Err(e) => {
                error!(error = %e, "Failed to start audio devices");
                self.close_session().await;
                self.set_state(ConnectionState::Error);
                let _ = pending.reply.send(Err(e));
            }
        }
    }

    async fn start_devices(&mut self, epoch: u64) -> Result<(), SessionError> {
        let finished_tx = self.events_tx.clone();
        let speaker = self
            .backend
            .open_speaker(Arc::new(move |handle| {
                let _ = finished_tx.send(Event::PlaybackFinished { epoch, handle });
            }))
            .await?;
        let playback = PlaybackScheduler::new(speaker, self.settings.tuning.amplitude_reference);
        if let Some(session) = self.session.as_mut() {
            session.playback = Some(playback);
        }

        let mut capture = self.backend.microphone(&self.settings.tuning);
        let captured_tx = self.events_tx.clone();
        capture
            .start(Box::new(move |frame, level| {
                let _ = captured_tx.send(Event::Captured {
                    epoch,
                    frame,
                    level,
                });
            }))
            .await?;
        if let Some(session) = self.session.as_mut() {
            session.capture = Some(capture);
        }
        Ok(())
    }

    async fn on_remote(&mut self, event: LiveEvent) {
        match event {
            LiveEvent::Message(msg) => self.on_server_message(*msg).await,
            LiveEvent::Closed { reason } => {
                info!(?reason, "Channel closed by remote");
                self.close_session().await;
                self.set_state(ConnectionState::Disconnected);
            }
            LiveEvent::Error(e) => {
                let err = SessionError::ChannelError(e);
                error!(error = %err, "Voice session failed");
                self.close_session().await;
                self.set_state(ConnectionState::Error);
            }
        }
    }

    async fn on_server_message(&mut self, msg: ServerMessage) {
        if msg.is_interrupted() {
            self.interrupt();
        }

        for chunk in msg.audio_chunks() {
            self.play_chunk(chunk);
        }

        let calls = msg.function_calls();
        if !calls.is_empty() {
            self.answer_tool_calls(calls).await;
        }

        if let Some(cancellation) = &msg.tool_call_cancellation {
            info!(ids = ?cancellation.ids, "Agent cancelled tool calls");
        }
        if let Some(go_away) = &msg.go_away {
            warn!(time_left = ?go_away.time_left, "Server announced it will close the channel");
        }
        if msg.is_turn_complete() {
            debug!("Agent turn complete");
        }
    }

    fn interrupt(&mut self) {
        let Some(playback) = self.session.as_mut().and_then(|s| s.playback.as_mut()) else {
            return;
        };
        info!("Agent speech interrupted");
        if playback.abort_all() {
            self.observer.on_speaking_change(false);
            self.observer.on_volume_change(0.0);
        }
    }

    fn play_chunk(&mut self, data: &str) {
        let frame = match decode_transport(data)
            .and_then(|bytes| pcm16_to_samples(&bytes, PLAYBACK_SAMPLE_RATE))
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed audio chunk");
                return;
            }
        };
        let Some(playback) = self.session.as_mut().and_then(|s| s.playback.as_mut()) else {
            return;
        };
        if let Some(scheduled) = playback.enqueue(frame) {
            if scheduled.started_speaking {
                self.observer.on_speaking_change(true);
            }
        }
    }

    async fn answer_tool_calls(&self, calls: &[FunctionCall]) {
        let observer = Arc::clone(&self.observer);
        let responses: Vec<_> = calls
            .iter()
            .map(|wire| {
                let call = tool_protocol::from_wire(wire);
                let response = tool_protocol::answer(&call, |increment| {
                    observer.on_promotion(increment)
                });
                tool_protocol::to_wire(&response)
            })
            .collect();

        let Some(session) = self.session.as_ref() else {
            return;
        };
        if let Err(e) = session.sender.send_tool_responses(responses).await {
            warn!(error = %e, "Failed to send tool responses");
        }
    }

    /// Never waits on the channel: a frame that does not fit in the outbound
    /// queue is dropped so commands keep flowing while the socket is stalled.
    fn on_captured(&mut self, frame: AudioFrame, level: f32) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        // The agent's own voice drives the meter while it speaks.
        if !session.is_speaking() {
            self.observer.on_volume_change(level);
        }
        let data = encode_transport(&samples_to_pcm16(&frame.samples));
        if let Err(e) = session.sender.try_send_audio(CAPTURE_MIME_TYPE, data) {
            debug!(sequence = frame.sequence, error = %e, "Dropping capture frame");
        }
    }

    fn on_playback_finished(&mut self, handle: ItemHandle) {
        let Some(playback) = self.session.as_mut().and_then(|s| s.playback.as_mut()) else {
            return;
        };
        if playback.complete(handle) {
            debug!("Agent finished speaking");
            self.observer.on_speaking_change(false);
            self.observer.on_volume_change(0.0);
        }
    }

    fn report_playback_amplitude(&mut self) {
        let Some(playback) = self.session.as_mut().and_then(|s| s.playback.as_mut()) else {
            return;
        };
        if playback.is_speaking() {
            let level = playback.amplitude();
            self.observer.on_volume_change(level);
        }
    }
}
