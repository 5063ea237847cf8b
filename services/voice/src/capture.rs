use crate::{
    audio_utils::{AudioFrame, CAPTURE_SAMPLE_RATE, create_resampler},
    backend::StreamThread,
    config::AudioTuning,
    error::CaptureError,
};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use rubato::{FastFixedIn, Resampler};
use tracing::{debug, error, info, warn};

/// Receives every captured frame together with its loudness in `[0, 1]`.
pub type FrameCallback = Box<dyn FnMut(AudioFrame, f32) + Send>;

/// Loudness of a block: root mean square scaled by `gain`, clamped to `[0, 1]`.
pub fn rms_level(samples: &[f32], gain: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let mean_square = samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32;
    (mean_square.sqrt() * gain).clamp(0.0, 1.0)
}

/// Turns arbitrary-sized mono blocks at the device rate into fixed-size
/// 16 kHz frames.
pub struct CaptureFramer {
    resampler: Option<FastFixedIn<f32>>,
    frame_samples: usize,
    gain: f32,
    pending_in: Vec<f32>,
    pending_out: Vec<f32>,
    sequence: u64,
}

impl CaptureFramer {
    pub fn new(device_rate: u32, frame_samples: usize, gain: f32) -> anyhow::Result<Self> {
        anyhow::ensure!(frame_samples > 0, "frame size must be greater than zero");
        anyhow::ensure!(device_rate > 0, "device sample rate must be greater than zero");
        let resampler = if device_rate == CAPTURE_SAMPLE_RATE {
            None
        } else {
            // Roughly 10 ms of device audio per resampler call.
            let chunk = (device_rate as usize / 100).max(1);
            Some(create_resampler(
                device_rate as f64,
                CAPTURE_SAMPLE_RATE as f64,
                chunk,
            )?)
        };
        Ok(Self {
            resampler,
            frame_samples,
            gain,
            pending_in: Vec::new(),
            pending_out: Vec::with_capacity(frame_samples * 2),
            sequence: 0,
        })
    }

    /// Feeds mono samples; calls `emit` once per completed frame, in order.
    pub fn push(&mut self, samples: &[f32], mut emit: impl FnMut(AudioFrame, f32)) {
        match self.resampler.as_mut() {
            None => self.pending_out.extend_from_slice(samples),
            Some(resampler) => {
                self.pending_in.extend_from_slice(samples);
                loop {
                    let needed = resampler.input_frames_next();
                    if self.pending_in.len() < needed {
                        break;
                    }
                    let chunk: Vec<f32> = self.pending_in.drain(..needed).collect();
                    match resampler.process(&[chunk], None) {
                        Ok(mut out) => {
                            if let Some(channel) = out.pop() {
                                self.pending_out.extend(channel);
                            }
                        }
                        Err(e) => warn!(error = %e, "Resampling failed. Dropping capture chunk."),
                    }
                }
            }
        }

        while self.pending_out.len() >= self.frame_samples {
            let samples: Vec<f32> = self.pending_out.drain(..self.frame_samples).collect();
            let level = rms_level(&samples, self.gain);
            let frame = AudioFrame::new(samples, CAPTURE_SAMPLE_RATE).with_sequence(self.sequence);
            self.sequence += 1;
            emit(frame, level);
        }
    }
}

/// A microphone producing 16 kHz mono frames.
///
/// The device is held from a successful `start` until `stop` (or drop).
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn start(&mut self, on_frame: FrameCallback) -> Result<(), CaptureError>;

    async fn stop(&mut self);
}

/// [`CaptureDevice`] on the default cpal input device.
pub struct MicrophoneCapture {
    tuning: AudioTuning,
    stream: Option<StreamThread>,
}

impl MicrophoneCapture {
    pub fn new(tuning: AudioTuning) -> Self {
        Self {
            tuning,
            stream: None,
        }
    }
}

#[async_trait]
impl CaptureDevice for MicrophoneCapture {
    async fn start(&mut self, on_frame: FrameCallback) -> Result<(), CaptureError> {
        if self.stream.is_some() {
            warn!("Microphone is already capturing");
            return Ok(());
        }
        let tuning = self.tuning.clone();
        let stream = StreamThread::spawn("lumi-capture", move || {
            build_input_stream(tuning, on_frame).map_err(|e| e.to_string())
        })
        .await
        .map_err(CaptureError::DeviceUnavailable)?;
        self.stream = Some(stream);
        info!("Started microphone capture");
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop().await;
            info!("Stopped microphone capture");
        }
    }
}

fn build_input_stream(
    tuning: AudioTuning,
    on_frame: FrameCallback,
) -> Result<cpal::Stream, CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| CaptureError::DeviceUnavailable("No input device available".into()))?;

    info!(
        "Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let supported = device.default_input_config().map_err(|e| {
        CaptureError::DeviceUnavailable(format!("Failed to get input config: {}", e))
    })?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    debug!(
        sample_rate = config.sample_rate.0,
        channels = config.channels,
        ?sample_format,
        "Input stream configuration"
    );

    let framer = CaptureFramer::new(config.sample_rate.0, tuning.frame_samples, tuning.rms_gain)
        .map_err(|e| CaptureError::DeviceUnavailable(e.to_string()))?;

    match sample_format {
        SampleFormat::F32 => build_typed_input::<f32>(&device, &config, framer, on_frame),
        SampleFormat::I16 => build_typed_input::<i16>(&device, &config, framer, on_frame),
        SampleFormat::U16 => build_typed_input::<u16>(&device, &config, framer, on_frame),
        other => Err(CaptureError::DeviceUnavailable(format!(
            "Unsupported input sample format: {:?}",
            other
        ))),
    }
}

fn build_typed_input<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut framer: CaptureFramer,
    mut on_frame: FrameCallback,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let channels = config.channels.max(1) as usize;
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                mono.clear();
                // Average all channels to create mono
                mono.extend(data.chunks(channels).map(|frame| {
                    frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() / frame.len() as f32
                }));
                framer.push(&mono, |frame, level| on_frame(frame, level));
            },
            |err| error!("Audio input stream error: {}", err),
            None,
        )
        .map_err(|e| {
            CaptureError::DeviceUnavailable(format!("Failed to build input stream: {}", e))
        })
}
