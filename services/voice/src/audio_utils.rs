use crate::error::CodecError;
use base64::Engine;
use rubato::{FastFixedIn, PolynomialDegree};

// Fixed by the Gemini Live protocol: 16 kHz mono upstream, 24 kHz mono downstream.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

/// Mime tag attached to every outbound audio chunk.
pub const CAPTURE_MIME_TYPE: &str = "audio/pcm;rate=16000";

/// A block of mono audio samples normalized to `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Position in the producing stream; diagnostic only, never used to reorder.
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Converts float samples to 16-bit little-endian PCM.
///
/// Samples are clamped to `[-1, 1]`; negative values scale by 32768 and
/// non-negative values by 32767, so both ends of the i16 range are reachable.
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&sample| {
            // NaN clamps to NaN; treat it as silence.
            let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
            let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
            (scaled as i16).to_le_bytes()
        })
        .collect()
}

/// Decodes 16-bit little-endian PCM into a frame at `sample_rate`.
pub fn pcm16_to_samples(bytes: &[u8], sample_rate: u32) -> Result<AudioFrame, CodecError> {
    if bytes.len() % 2 != 0 {
        return Err(CodecError::MalformedAudio(format!(
            "odd PCM16 byte length {}",
            bytes.len()
        )));
    }
    let samples = bytes
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]) as f32 / 32768.0)
        .collect();
    Ok(AudioFrame::new(samples, sample_rate))
}

/// Encodes binary audio as base64 text for the JSON transport.
pub fn encode_transport(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn decode_transport(text: &str) -> Result<Vec<u8>, CodecError> {
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| CodecError::MalformedAudio(format!("invalid base64: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler() {
        assert!(create_resampler(48000.0, 16000.0, 480).is_ok());
        assert!(create_resampler(44100.0, 16000.0, 441).is_ok());
        assert!(create_resampler(16000.0, 16000.0, 512).is_ok());
    }

    #[test]
    fn test_samples_to_pcm16_known_values() {
        let bytes = samples_to_pcm16(&[1.0, -1.0, 0.0, 0.5]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values, vec![i16::MAX, i16::MIN, 0, 16383]);
    }

    #[test]
    fn test_samples_to_pcm16_clamps_out_of_range() {
        let bytes = samples_to_pcm16(&[2.0, -7.5, f32::INFINITY, f32::NEG_INFINITY, f32::NAN]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(values, vec![i16::MAX, i16::MIN, i16::MAX, i16::MIN, 0]);
    }

    #[test]
    fn test_pcm16_to_samples() {
        // 16384 = [0x00, 0x40], -32768 = [0x00, 0x80]
        let frame = pcm16_to_samples(&[0x00, 0x40, 0x00, 0x80], PLAYBACK_SAMPLE_RATE).unwrap();
        assert_eq!(frame.sample_rate, PLAYBACK_SAMPLE_RATE);
        assert_eq!(frame.len(), 2);
        assert_abs_diff_eq!(frame.samples[0], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(frame.samples[1], -1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_pcm16_to_samples_rejects_odd_length() {
        let err = pcm16_to_samples(&[0x00, 0x40, 0x01], PLAYBACK_SAMPLE_RATE).unwrap_err();
        assert!(matches!(err, CodecError::MalformedAudio(_)));
        assert!(pcm16_to_samples(&[], PLAYBACK_SAMPLE_RATE).unwrap().is_empty());
    }

    #[test]
    fn test_pcm_round_trip_error_is_bounded() {
        let original: Vec<f32> = (0..=200).map(|i| -1.0 + i as f32 * 0.01).collect();
        let decoded = pcm16_to_samples(&samples_to_pcm16(&original), CAPTURE_SAMPLE_RATE).unwrap();
        assert_eq!(decoded.len(), original.len());
        // Truncation costs at most one step; the 32767/32768 scale mismatch on
        // the positive side adds at most one more.
        for (a, b) in original.iter().zip(decoded.samples.iter()) {
            let epsilon = if *a < 0.0 { 1.0 / 32768.0 } else { 2.0 / 32768.0 };
            assert_abs_diff_eq!(*a, *b, epsilon = epsilon);
        }
    }

    #[test]
    fn test_transport_round_trip() {
        let inputs: Vec<Vec<u8>> = vec![
            vec![],
            vec![0],
            vec![0xff, 0x00, 0x7f],
            (0..=255).collect(),
        ];
        for bytes in inputs {
            assert_eq!(decode_transport(&encode_transport(&bytes)).unwrap(), bytes);
        }
        assert_eq!(encode_transport(&[]), "");
    }

    #[test]
    fn test_decode_transport_rejects_invalid_text() {
        let err = decode_transport("invalid_base64!").unwrap_err();
        assert!(matches!(err, CodecError::MalformedAudio(_)));
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0.0; 12_000], PLAYBACK_SAMPLE_RATE).with_sequence(4);
        assert_abs_diff_eq!(frame.duration(), 0.5, epsilon = 1e-12);
        assert_eq!(frame.sequence, 4);
        assert_eq!(AudioFrame::new(vec![0.0; 10], 0).duration(), 0.0);
    }
}
