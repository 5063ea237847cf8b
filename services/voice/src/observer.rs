use lumi_core::{ConnectionState, SessionEvent};
use tokio::sync::mpsc;
use tracing::debug;

/// Callbacks the session manager reports to the application layer.
///
/// Called from the session actor, one at a time and in event order.
#[cfg_attr(test, mockall::automock)]
pub trait SessionObserver: Send + Sync {
    fn on_connection_state_change(&self, state: ConnectionState);

    /// Loudness in `[0, 1]`: microphone level while the agent is quiet, agent
    /// speech level while it talks.
    fn on_volume_change(&self, level: f32);

    fn on_speaking_change(&self, speaking: bool);

    /// The agent asked to advance by `increment` stages.
    fn on_promotion(&self, increment: u32);
}

/// Forwards every callback as a [`SessionEvent`] over an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            debug!("Session event receiver dropped");
        }
    }
}

impl SessionObserver for ChannelObserver {
    fn on_connection_state_change(&self, state: ConnectionState) {
        self.forward(SessionEvent::StateChanged(state));
    }

    fn on_volume_change(&self, level: f32) {
        self.forward(SessionEvent::Volume(level));
    }

    fn on_speaking_change(&self, speaking: bool) {
        self.forward(SessionEvent::Speaking(speaking));
    }

    fn on_promotion(&self, increment: u32) {
        self.forward(SessionEvent::Promotion(increment));
    }
}
