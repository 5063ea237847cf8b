//! Audio device seam. The session only talks to [`AudioBackend`]; the cpal
//! implementation keeps every `cpal::Stream` on its own thread because streams
//! are not `Send` on every host.

use crate::{
    capture::{CaptureDevice, MicrophoneCapture},
    config::AudioTuning,
    error::PlaybackError,
    playback::{CompletionCallback, PlaybackSink, SpeakerOutput},
};
use async_trait::async_trait;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Opens microphone and speaker for one session.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    /// A fresh, not yet started microphone.
    fn microphone(&self, tuning: &AudioTuning) -> Box<dyn CaptureDevice>;

    /// Opens the speaker. `on_complete` fires once per scheduled item that
    /// played to its end.
    async fn open_speaker(
        &self,
        on_complete: CompletionCallback,
    ) -> Result<Box<dyn PlaybackSink>, PlaybackError>;
}

/// The default input and output devices of the default cpal host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

#[async_trait]
impl AudioBackend for CpalBackend {
    fn microphone(&self, tuning: &AudioTuning) -> Box<dyn CaptureDevice> {
        Box::new(MicrophoneCapture::new(tuning.clone()))
    }

    async fn open_speaker(
        &self,
        on_complete: CompletionCallback,
    ) -> Result<Box<dyn PlaybackSink>, PlaybackError> {
        let speaker = SpeakerOutput::open(on_complete).await?;
        Ok(Box::new(speaker))
    }
}

/// A dedicated thread that builds a cpal stream, plays it and holds it until
/// told to stop. The stream is dropped, releasing the device, when [`stop`]
/// is called or when this handle is dropped.
///
/// [`stop`]: StreamThread::stop
pub(crate) struct StreamThread {
    name: String,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Spawns the thread and waits until `build` produced a playing stream.
    pub(crate) async fn spawn<F>(name: &str, build: F) -> Result<Self, String>
    where
        F: FnOnce() -> Result<cpal::Stream, String> + Send + 'static,
    {
        use cpal::traits::StreamTrait;

        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), String>>();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("failed to start stream: {}", e)));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Either an explicit stop or the handle being dropped ends the wait.
                let _ = stop_rx.blocking_recv();
                drop(stream);
            })
            .map_err(|e| format!("failed to spawn {} thread: {}", name, e))?;

        let mut thread = Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        };

        match ready_rx.await {
            Ok(Ok(())) => {
                debug!(thread = %thread.name, "Audio stream thread is running.");
                Ok(thread)
            }
            Ok(Err(e)) => {
                thread.join().await;
                Err(e)
            }
            Err(_) => {
                thread.join().await;
                Err(format!("{} thread exited before the stream started", name))
            }
        }
    }

    /// Stops the stream and waits for the thread to release the device.
    pub(crate) async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        self.join().await;
    }

    async fn join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => debug!(thread = %self.name, "Audio stream thread finished."),
            Ok(Err(_)) => warn!(thread = %self.name, "Audio stream thread panicked."),
            Err(e) => warn!(thread = %self.name, error = %e, "Failed to join audio stream thread."),
        }
    }
}
