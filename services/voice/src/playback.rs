//! Gap-free playback of agent speech.
//!
//! [`PlaybackScheduler`] decides when each decoded chunk plays and tracks
//! which chunks are still sounding. The device behind it is a
//! [`PlaybackSink`]; [`SpeakerOutput`] is the cpal one.

use crate::{
    audio_utils::{AudioFrame, PLAYBACK_SAMPLE_RATE},
    backend::StreamThread,
    error::PlaybackError,
};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use cpal::{FromSample, SampleFormat, SizedSample, StreamConfig};
use parking_lot::Mutex;
use realfft::num_complex::Complex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Seconds on the output device's own timeline.
#[cfg_attr(test, mockall::automock)]
pub trait DeviceClock: Send + Sync {
    fn now(&self) -> f64;
}

/// Identifies one scheduled chunk for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ItemHandle(pub u64);

/// Called by the sink, from any thread, when an item finished playing.
pub type CompletionCallback = Arc<dyn Fn(ItemHandle) + Send + Sync>;

/// An output device that plays samples at absolute clock positions.
#[async_trait]
pub trait PlaybackSink: Send + Sync {
    fn clock(&self) -> Arc<dyn DeviceClock>;

    /// Plays 24 kHz mono `samples` starting at `start` seconds on [`clock`].
    ///
    /// [`clock`]: PlaybackSink::clock
    fn schedule(&mut self, handle: ItemHandle, samples: Arc<[f32]>, start: f64);

    /// Silences everything scheduled. Aborted items never report completion.
    fn abort_all(&mut self);

    /// Releases the device.
    async fn close(&mut self);
}

#[derive(Debug, Clone)]
pub struct PlaybackItem {
    pub handle: ItemHandle,
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
    pub start: f64,
    pub duration: f64,
}

impl PlaybackItem {
    fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Outcome of [`PlaybackScheduler::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Scheduled {
    pub handle: ItemHandle,
    pub start: f64,
    /// The active set was empty before this item.
    pub started_speaking: bool,
}

pub struct PlaybackScheduler {
    sink: Box<dyn PlaybackSink>,
    clock: Arc<dyn DeviceClock>,
    active: BTreeMap<ItemHandle, PlaybackItem>,
    next_free_time: f64,
    next_handle: u64,
    analyser: SpectrumAnalyser,
    amplitude_reference: f32,
}

impl PlaybackScheduler {
    pub fn new(sink: Box<dyn PlaybackSink>, amplitude_reference: f32) -> Self {
        let clock = sink.clock();
        Self {
            sink,
            clock,
            active: BTreeMap::new(),
            next_free_time: 0.0,
            next_handle: 0,
            analyser: SpectrumAnalyser::new(),
            amplitude_reference,
        }
    }

    /// Schedules `frame` right after everything already queued, or now if the
    /// queue ran dry. Empty frames are not scheduled.
    pub fn enqueue(&mut self, frame: AudioFrame) -> Option<Scheduled> {
        if frame.is_empty() {
            return None;
        }
        let now = self.clock.now();
        let start = self.next_free_time.max(now);
        let duration = frame.duration();
        let handle = ItemHandle(self.next_handle);
        self.next_handle += 1;

        let started_speaking = self.active.is_empty();
        let samples: Arc<[f32]> = frame.samples.into();
        self.sink.schedule(handle, Arc::clone(&samples), start);
        self.active.insert(
            handle,
            PlaybackItem {
                handle,
                samples,
                sample_rate: frame.sample_rate,
                start,
                duration,
            },
        );
        self.next_free_time = start + duration;
        debug!(handle = handle.0, start, duration, "Scheduled playback chunk");

        Some(Scheduled {
            handle,
            start,
            started_speaking,
        })
    }

    /// Retires a finished item. Returns `true` only when this removal emptied
    /// the active set; unknown or already aborted handles return `false`.
    pub fn complete(&mut self, handle: ItemHandle) -> bool {
        self.active.remove(&handle).is_some() && self.active.is_empty()
    }

    /// Stops everything. Returns whether anything was playing.
    pub fn abort_all(&mut self) -> bool {
        let was_speaking = !self.active.is_empty();
        self.sink.abort_all();
        self.active.clear();
        self.next_free_time = 0.0;
        was_speaking
    }

    pub fn is_speaking(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn next_free_time(&self) -> f64 {
        self.next_free_time
    }

    /// Loudness of what is sounding right now, normalized to `[0, 1]`.
    pub fn amplitude(&mut self) -> f32 {
        if self.active.is_empty() {
            return 0.0;
        }
        let now = self.clock.now();
        let window = self.sounding_window(now);
        (self.analyser.level(&window) / self.amplitude_reference).clamp(0.0, 1.0)
    }

    /// The `FFT_SIZE` samples of the timeline that end at `now`.
    fn sounding_window(&self, now: f64) -> Vec<f32> {
        let rate = PLAYBACK_SAMPLE_RATE as f64;
        (0..FFT_SIZE)
            .map(|i| {
                let t = now - (FFT_SIZE - i) as f64 / rate;
                self.active
                    .values()
                    .find(|item| item.start <= t && t < item.end())
                    .and_then(|item| {
                        let index = ((t - item.start) * item.sample_rate as f64) as usize;
                        item.samples.get(index).copied()
                    })
                    .unwrap_or(0.0)
            })
            .collect()
    }

    /// Aborts anything left and releases the device.
    pub async fn close(&mut self) {
        self.abort_all();
        self.sink.close().await;
    }
}

const FFT_SIZE: usize = 256;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Average spectrum level on the 0..255 byte scale used by browser analysers.
pub struct SpectrumAnalyser {
    fft: Arc<dyn realfft::RealToComplex<f32>>,
    window: Vec<f32>,
}

impl Default for SpectrumAnalyser {
    fn default() -> Self {
        Self::new()
    }
}

impl SpectrumAnalyser {
    pub fn new() -> Self {
        let mut planner = realfft::RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let n = FFT_SIZE as f32;
        // Blackman window
        let window = (0..FFT_SIZE)
            .map(|i| {
                let x = 2.0 * std::f32::consts::PI * i as f32 / n;
                0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos()
            })
            .collect();
        Self { fft, window }
    }

    /// `samples` shorter than the FFT size are zero-padded at the front;
    /// only the most recent `FFT_SIZE` samples are analysed.
    pub fn level(&mut self, samples: &[f32]) -> f32 {
        let mut input = vec![0.0f32; FFT_SIZE];
        let take = samples.len().min(FFT_SIZE);
        input[FFT_SIZE - take..].copy_from_slice(&samples[samples.len() - take..]);
        for (x, w) in input.iter_mut().zip(self.window.iter()) {
            *x *= w;
        }

        let mut spectrum = vec![Complex::new(0.0f32, 0.0f32); FFT_SIZE / 2 + 1];
        if let Err(e) = self.fft.process(&mut input, &mut spectrum) {
            warn!(error = %e, "Spectrum analysis failed");
            return 0.0;
        }

        let bins = FFT_SIZE / 2;
        let range = MAX_DECIBELS - MIN_DECIBELS;
        let total: f32 = spectrum[..bins]
            .iter()
            .map(|c| {
                let magnitude = c.norm() / FFT_SIZE as f32;
                if magnitude <= 0.0 {
                    return 0.0;
                }
                let db = 20.0 * magnitude.log10();
                (255.0 * (db - MIN_DECIBELS) / range).clamp(0.0, 255.0)
            })
            .sum();
        total / bins as f32
    }
}

/// Device clock driven by the number of frames the output callback rendered.
#[derive(Debug, Default)]
pub struct RenderedFramesClock {
    frames: AtomicU64,
    rate: AtomicU32,
}

impl RenderedFramesClock {
    fn advance(&self, frames: u64) {
        self.frames.fetch_add(frames, Ordering::Release);
    }
}

impl DeviceClock for RenderedFramesClock {
    fn now(&self) -> f64 {
        let rate = self.rate.load(Ordering::Acquire);
        if rate == 0 {
            return 0.0;
        }
        self.frames.load(Ordering::Acquire) as f64 / rate as f64
    }
}

struct QueuedChunk {
    handle: ItemHandle,
    samples: Arc<[f32]>,
    start: f64,
}

impl QueuedChunk {
    fn end(&self) -> f64 {
        self.start + self.samples.len() as f64 / PLAYBACK_SAMPLE_RATE as f64
    }

    /// Linear interpolation of the chunk at timeline position `t`.
    fn sample_at(&self, t: f64) -> f32 {
        let pos = (t - self.start) * PLAYBACK_SAMPLE_RATE as f64;
        if pos < 0.0 {
            return 0.0;
        }
        let index = pos as usize;
        let frac = (pos - index as f64) as f32;
        let a = self.samples.get(index).copied().unwrap_or(0.0);
        let b = self.samples.get(index + 1).copied().unwrap_or(a);
        a + (b - a) * frac
    }
}

type SharedQueue = Arc<Mutex<VecDeque<QueuedChunk>>>;

/// [`PlaybackSink`] on the default cpal output device.
pub struct SpeakerOutput {
    queue: SharedQueue,
    clock: Arc<RenderedFramesClock>,
    stream: Option<StreamThread>,
}

impl SpeakerOutput {
    pub async fn open(on_complete: CompletionCallback) -> Result<Self, PlaybackError> {
        let queue: SharedQueue = Arc::new(Mutex::new(VecDeque::new()));
        let clock = Arc::new(RenderedFramesClock::default());

        let stream = {
            let queue = Arc::clone(&queue);
            let clock = Arc::clone(&clock);
            StreamThread::spawn("lumi-playback", move || {
                build_output_stream(queue, clock, on_complete).map_err(|e| e.to_string())
            })
            .await
            .map_err(PlaybackError::DeviceUnavailable)?
        };
        info!("Started audio playback");

        Ok(Self {
            queue,
            clock,
            stream: Some(stream),
        })
    }
}

#[async_trait]
impl PlaybackSink for SpeakerOutput {
    fn clock(&self) -> Arc<dyn DeviceClock> {
        self.clock.clone()
    }

    fn schedule(&mut self, handle: ItemHandle, samples: Arc<[f32]>, start: f64) {
        self.queue.lock().push_back(QueuedChunk {
            handle,
            samples,
            start,
        });
    }

    fn abort_all(&mut self) {
        self.queue.lock().clear();
    }

    async fn close(&mut self) {
        self.queue.lock().clear();
        if let Some(stream) = self.stream.take() {
            stream.stop().await;
            info!("Stopped audio playback");
        }
    }
}

fn build_output_stream(
    queue: SharedQueue,
    clock: Arc<RenderedFramesClock>,
    on_complete: CompletionCallback,
) -> Result<cpal::Stream, PlaybackError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| PlaybackError::DeviceUnavailable("No output device available".into()))?;

    info!(
        "Using output device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let supported = device.default_output_config().map_err(|e| {
        PlaybackError::DeviceUnavailable(format!("Failed to get output config: {}", e))
    })?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    clock.rate.store(config.sample_rate.0, Ordering::Release);

    match sample_format {
        SampleFormat::F32 => build_typed_output::<f32>(&device, &config, queue, clock, on_complete),
        SampleFormat::I16 => build_typed_output::<i16>(&device, &config, queue, clock, on_complete),
        SampleFormat::U16 => build_typed_output::<u16>(&device, &config, queue, clock, on_complete),
        other => Err(PlaybackError::DeviceUnavailable(format!(
            "Unsupported output sample format: {:?}",
            other
        ))),
    }
}

fn build_typed_output<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    queue: SharedQueue,
    clock: Arc<RenderedFramesClock>,
    on_complete: CompletionCallback,
) -> Result<cpal::Stream, PlaybackError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels.max(1) as usize;
    let device_rate = config.sample_rate.0 as f64;
    let mut finished: Vec<ItemHandle> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let base = clock.frames.load(Ordering::Acquire);
                let frames = data.len() / channels;
                {
                    let mut queue = queue.lock();
                    for (i, frame) in data.chunks_mut(channels).enumerate() {
                        let t = (base + i as u64) as f64 / device_rate;
                        while queue.front().is_some_and(|chunk| t >= chunk.end()) {
                            if let Some(chunk) = queue.pop_front() {
                                finished.push(chunk.handle);
                            }
                        }
                        let value = queue.front().map_or(0.0, |chunk| chunk.sample_at(t));
                        frame.fill(T::from_sample(value));
                    }
                    let t_end = (base + frames as u64) as f64 / device_rate;
                    while queue.front().is_some_and(|chunk| t_end >= chunk.end()) {
                        if let Some(chunk) = queue.pop_front() {
                            finished.push(chunk.handle);
                        }
                    }
                }
                clock.advance(frames as u64);
                for handle in finished.drain(..) {
                    on_complete(handle);
                }
            },
            |err| error!("Audio output stream error: {}", err),
            None,
        )
        .map_err(|e| {
            PlaybackError::DeviceUnavailable(format!("Failed to build output stream: {}", e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[derive(Default)]
    struct Recorded {
        scheduled: Vec<(ItemHandle, usize, f64)>,
        aborts: usize,
        closed: bool,
    }

    struct RecordingSink {
        clock: Arc<dyn DeviceClock>,
        recorded: Arc<Mutex<Recorded>>,
    }

    #[async_trait]
    impl PlaybackSink for RecordingSink {
        fn clock(&self) -> Arc<dyn DeviceClock> {
            self.clock.clone()
        }

        fn schedule(&mut self, handle: ItemHandle, samples: Arc<[f32]>, start: f64) {
            self.recorded.lock().scheduled.push((handle, samples.len(), start));
        }

        fn abort_all(&mut self) {
            self.recorded.lock().aborts += 1;
        }

        async fn close(&mut self) {
            self.recorded.lock().closed = true;
        }
    }

    /// A clock whose time the test sets, in microseconds.
    fn manual_clock() -> (Arc<AtomicU64>, MockDeviceClock) {
        let micros = Arc::new(AtomicU64::new(0));
        let mut clock = MockDeviceClock::new();
        let source = Arc::clone(&micros);
        clock
            .expect_now()
            .returning(move || source.load(Ordering::SeqCst) as f64 / 1_000_000.0);
        (micros, clock)
    }

    fn scheduler_with(clock: MockDeviceClock) -> (PlaybackScheduler, Arc<Mutex<Recorded>>) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let sink = RecordingSink {
            clock: Arc::new(clock),
            recorded: Arc::clone(&recorded),
        };
        (PlaybackScheduler::new(Box::new(sink), 100.0), recorded)
    }

    fn chunk(seconds: f64) -> AudioFrame {
        let len = (seconds * PLAYBACK_SAMPLE_RATE as f64) as usize;
        AudioFrame::new(vec![0.25; len], PLAYBACK_SAMPLE_RATE)
    }

    #[test]
    fn test_chunks_are_scheduled_back_to_back() {
        let (micros, clock) = manual_clock();
        let (mut scheduler, recorded) = scheduler_with(clock);
        micros.store(1_000_000, Ordering::SeqCst);

        let first = scheduler.enqueue(chunk(0.5)).unwrap();
        let second = scheduler.enqueue(chunk(0.25)).unwrap();
        let third = scheduler.enqueue(chunk(0.25)).unwrap();

        assert!(first.started_speaking);
        assert!(!second.started_speaking);
        assert_abs_diff_eq!(first.start, 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(second.start, 1.5, epsilon = 1e-9);
        assert_abs_diff_eq!(third.start, 1.75, epsilon = 1e-9);
        assert_abs_diff_eq!(scheduler.next_free_time(), 2.0, epsilon = 1e-9);
        assert_eq!(scheduler.active_len(), 3);

        let recorded = recorded.lock();
        assert_eq!(recorded.scheduled.len(), 3);
        assert_eq!(recorded.scheduled[0].1, 12_000);
        // No two scheduled chunks overlap.
        for pair in recorded.scheduled.windows(2) {
            let (_, len, start) = pair[0];
            let end = start + len as f64 / PLAYBACK_SAMPLE_RATE as f64;
            assert!(pair[1].2 >= end - 1e-9);
        }
    }

    #[test]
    fn test_start_never_precedes_clock() {
        let (micros, clock) = manual_clock();
        let (mut scheduler, _) = scheduler_with(clock);

        let first = scheduler.enqueue(chunk(0.1)).unwrap();
        assert_abs_diff_eq!(first.start, 0.0, epsilon = 1e-9);

        // The queue ran dry; the next chunk starts at the current time.
        micros.store(3_000_000, Ordering::SeqCst);
        let late = scheduler.enqueue(chunk(0.1)).unwrap();
        assert_abs_diff_eq!(late.start, 3.0, epsilon = 1e-9);
        assert!(scheduler.next_free_time() >= 3.0);
    }

    #[test]
    fn test_empty_frame_is_not_scheduled() {
        let (_, clock) = manual_clock();
        let (mut scheduler, recorded) = scheduler_with(clock);
        assert!(scheduler.enqueue(AudioFrame::new(vec![], PLAYBACK_SAMPLE_RATE)).is_none());
        assert!(!scheduler.is_speaking());
        assert!(recorded.lock().scheduled.is_empty());
    }

    #[test]
    fn test_only_last_completion_reports_empty() {
        let (_, clock) = manual_clock();
        let (mut scheduler, _) = scheduler_with(clock);
        let a = scheduler.enqueue(chunk(0.1)).unwrap().handle;
        let b = scheduler.enqueue(chunk(0.1)).unwrap().handle;

        assert!(!scheduler.complete(a));
        assert!(scheduler.is_speaking());
        assert!(scheduler.complete(b));
        assert!(!scheduler.is_speaking());
        // Repeated and unknown handles are ignored.
        assert!(!scheduler.complete(b));
        assert!(!scheduler.complete(ItemHandle(99)));
    }

    #[test]
    fn test_abort_all_resets_timeline() {
        let (micros, clock) = manual_clock();
        let (mut scheduler, recorded) = scheduler_with(clock);
        micros.store(500_000, Ordering::SeqCst);
        let a = scheduler.enqueue(chunk(1.0)).unwrap().handle;
        scheduler.enqueue(chunk(1.0)).unwrap();

        assert!(scheduler.abort_all());
        assert!(!scheduler.is_speaking());
        assert_eq!(scheduler.next_free_time(), 0.0);
        assert_eq!(recorded.lock().aborts, 1);
        // A completion racing the abort finds nothing to retire.
        assert!(!scheduler.complete(a));
        assert!(!scheduler.abort_all());

        let next = scheduler.enqueue(chunk(0.1)).unwrap();
        assert!(next.started_speaking);
        assert_abs_diff_eq!(next.start, 0.5, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_close_aborts_and_releases_sink() {
        let (_, clock) = manual_clock();
        let (mut scheduler, recorded) = scheduler_with(clock);
        scheduler.enqueue(chunk(0.1)).unwrap();
        scheduler.close().await;
        assert!(!scheduler.is_speaking());
        assert!(recorded.lock().closed);
    }

    #[test]
    fn test_amplitude_is_zero_when_silent() {
        let (_, clock) = manual_clock();
        let (mut scheduler, _) = scheduler_with(clock);
        assert_eq!(scheduler.amplitude(), 0.0);

        scheduler.enqueue(AudioFrame::new(vec![0.0; 4800], PLAYBACK_SAMPLE_RATE));
        assert_eq!(scheduler.amplitude(), 0.0);
    }

    #[test]
    fn test_amplitude_tracks_sounding_audio() {
        let (micros, clock) = manual_clock();
        let (mut scheduler, _) = scheduler_with(clock);
        let tone: Vec<f32> = (0..24_000)
            .map(|i| 0.8 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 24_000.0).sin())
            .collect();
        scheduler.enqueue(AudioFrame::new(tone, PLAYBACK_SAMPLE_RATE));

        micros.store(500_000, Ordering::SeqCst);
        let level = scheduler.amplitude();
        assert!(level > 0.0 && level <= 1.0, "level was {}", level);

        // Past the end of the chunk nothing is sounding.
        micros.store(5_000_000, Ordering::SeqCst);
        assert_eq!(scheduler.amplitude(), 0.0);
    }

    #[test]
    fn test_analyser_levels() {
        let mut analyser = SpectrumAnalyser::new();
        assert_eq!(analyser.level(&[]), 0.0);
        assert_eq!(analyser.level(&[0.0; 256]), 0.0);

        let quiet: Vec<f32> = (0..256).map(|i| 0.01 * (i as f32 * 0.3).sin()).collect();
        let loud: Vec<f32> = (0..256).map(|i| 0.9 * (i as f32 * 0.3).sin()).collect();
        let quiet_level = analyser.level(&quiet);
        let loud_level = analyser.level(&loud);
        assert!(loud_level > quiet_level);
        assert!(loud_level <= 255.0);
    }

    #[test]
    fn test_queued_chunk_interpolates() {
        let chunk = QueuedChunk {
            handle: ItemHandle(0),
            samples: vec![0.0, 1.0, 0.0].into(),
            start: 1.0,
        };
        let step = 1.0 / PLAYBACK_SAMPLE_RATE as f64;
        assert_eq!(chunk.sample_at(0.5), 0.0);
        assert_abs_diff_eq!(chunk.sample_at(1.0 + step), 1.0, epsilon = 1e-4);
        assert_abs_diff_eq!(chunk.sample_at(1.0 + step * 0.5), 0.5, epsilon = 1e-3);
        assert_abs_diff_eq!(chunk.end(), 1.0 + 3.0 * step, epsilon = 1e-12);
    }

    #[test]
    fn test_rendered_frames_clock() {
        let clock = RenderedFramesClock::default();
        assert_eq!(clock.now(), 0.0);
        clock.rate.store(48_000, Ordering::Release);
        clock.advance(24_000);
        assert_abs_diff_eq!(clock.now(), 0.5, epsilon = 1e-12);
    }
}
