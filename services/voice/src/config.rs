use gemini_realtime::client::DEFAULT_ENDPOINT;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_VOICE: &str = "Kore";

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Audio constants tuned for a particular device and encoding. They shape the
/// UI volume signal only, never what goes over the wire.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioTuning {
    /// Samples per outbound capture frame at 16 kHz.
    pub frame_samples: usize,
    /// Boost applied to capture RMS so quiet speech still moves the meter.
    pub rms_gain: f32,
    /// Analyser level that maps to a playback volume of 1.0.
    pub amplitude_reference: f32,
    /// How often playback amplitude is sampled while the agent speaks.
    pub amplitude_tick: Duration,
}

impl Default for AudioTuning {
    fn default() -> Self {
        Self {
            frame_samples: 512,
            rms_gain: 8.0,
            amplitude_reference: 100.0,
            amplitude_tick: Duration::from_millis(100),
        }
    }
}

/// Settings the session manager needs besides the per-session config.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSettings {
    pub model: String,
    pub voice: String,
    pub tuning: AudioTuning,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            tuning: AudioTuning::default(),
        }
    }
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct VoiceConfig {
    pub gemini_api_key: Option<String>,
    pub endpoint: String,
    pub session: SessionSettings,
    pub log_level: Level,
    pub stages_path: Option<PathBuf>,
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

impl VoiceConfig {
    /// Loads configuration from environment variables.
    ///
    /// A missing `GEMINI_API_KEY` is not an error here: the session manager
    /// reports it as `ConfigMissing` when a connect is attempted.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|k| !k.is_empty());
        let endpoint =
            std::env::var("GEMINI_LIVE_ENDPOINT").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let model =
            std::env::var("GEMINI_LIVE_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let voice = std::env::var("GEMINI_VOICE").unwrap_or_else(|_| DEFAULT_VOICE.to_string());

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let defaults = AudioTuning::default();
        let frame_samples = parse_var("CAPTURE_FRAME_SAMPLES", defaults.frame_samples)?;
        if frame_samples == 0 {
            return Err(ConfigError::InvalidValue(
                "CAPTURE_FRAME_SAMPLES".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        let rms_gain = parse_var("CAPTURE_RMS_GAIN", defaults.rms_gain)?;
        let amplitude_reference =
            parse_var("PLAYBACK_AMPLITUDE_REFERENCE", defaults.amplitude_reference)?;
        if amplitude_reference <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "PLAYBACK_AMPLITUDE_REFERENCE".to_string(),
                "must be positive".to_string(),
            ));
        }
        let tick_ms = parse_var(
            "AMPLITUDE_TICK_MS",
            defaults.amplitude_tick.as_millis() as u64,
        )?;
        if tick_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "AMPLITUDE_TICK_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let stages_path = std::env::var("STAGES_PATH").ok().map(PathBuf::from);

        Ok(Self {
            gemini_api_key,
            endpoint,
            session: SessionSettings {
                model,
                voice,
                tuning: AudioTuning {
                    frame_samples,
                    rms_gain,
                    amplitude_reference,
                    amplitude_tick: Duration::from_millis(tick_ms),
                },
            },
            log_level,
            stages_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: &[&str] = &[
        "GEMINI_API_KEY",
        "GEMINI_LIVE_ENDPOINT",
        "GEMINI_LIVE_MODEL",
        "GEMINI_VOICE",
        "RUST_LOG",
        "CAPTURE_FRAME_SAMPLES",
        "CAPTURE_RMS_GAIN",
        "PLAYBACK_AMPLITUDE_REFERENCE",
        "AMPLITUDE_TICK_MS",
        "STAGES_PATH",
    ];

    fn clear_env_vars() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_config_error_display() {
        let invalid_value =
            ConfigError::InvalidValue("TEST_VAR".to_string(), "bad_value".to_string());
        assert_eq!(
            format!("{}", invalid_value),
            "Invalid value for environment variable TEST_VAR: bad_value"
        );
    }

    #[test]
    #[serial]
    fn test_config_defaults() {
        clear_env_vars();

        let config = VoiceConfig::from_env().expect("Config should load successfully");

        assert_eq!(config.gemini_api_key, None);
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.session, SessionSettings::default());
        assert_eq!(config.session.tuning.rms_gain, 8.0);
        assert_eq!(config.session.tuning.amplitude_reference, 100.0);
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.stages_path, None);
    }

    #[test]
    #[serial]
    fn test_config_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("GEMINI_API_KEY", "test-gemini-key");
            env::set_var("GEMINI_LIVE_ENDPOINT", "wss://localhost:9000/live");
            env::set_var("GEMINI_LIVE_MODEL", "models/custom");
            env::set_var("GEMINI_VOICE", "Puck");
            env::set_var("RUST_LOG", "debug");
            env::set_var("CAPTURE_FRAME_SAMPLES", "256");
            env::set_var("CAPTURE_RMS_GAIN", "4.5");
            env::set_var("PLAYBACK_AMPLITUDE_REFERENCE", "80");
            env::set_var("AMPLITUDE_TICK_MS", "50");
            env::set_var("STAGES_PATH", "/custom/stages.json");
        }

        let config = VoiceConfig::from_env().expect("Config should load successfully");

        assert_eq!(config.gemini_api_key.as_deref(), Some("test-gemini-key"));
        assert_eq!(config.endpoint, "wss://localhost:9000/live");
        assert_eq!(config.session.model, "models/custom");
        assert_eq!(config.session.voice, "Puck");
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.session.tuning.frame_samples, 256);
        assert_eq!(config.session.tuning.rms_gain, 4.5);
        assert_eq!(config.session.tuning.amplitude_reference, 80.0);
        assert_eq!(config.session.tuning.amplitude_tick, Duration::from_millis(50));
        assert_eq!(config.stages_path, Some(PathBuf::from("/custom/stages.json")));
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_empty_api_key_is_treated_as_missing() {
        clear_env_vars();
        unsafe {
            env::set_var("GEMINI_API_KEY", "");
        }
        let config = VoiceConfig::from_env().unwrap();
        assert_eq!(config.gemini_api_key, None);
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_invalid_log_level() {
        clear_env_vars();
        unsafe {
            env::set_var("RUST_LOG", "not-a-level");
        }

        let err = VoiceConfig::from_env().unwrap_err();
        match err {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }
        clear_env_vars();
    }

    #[test]
    #[serial]
    fn test_config_invalid_tuning_values() {
        clear_env_vars();
        unsafe {
            env::set_var("CAPTURE_RMS_GAIN", "loud");
        }
        match VoiceConfig::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "CAPTURE_RMS_GAIN"),
            _ => panic!("Expected InvalidValue for CAPTURE_RMS_GAIN"),
        }

        clear_env_vars();
        unsafe {
            env::set_var("CAPTURE_FRAME_SAMPLES", "0");
        }
        match VoiceConfig::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "CAPTURE_FRAME_SAMPLES"),
            _ => panic!("Expected InvalidValue for CAPTURE_FRAME_SAMPLES"),
        }

        clear_env_vars();
        unsafe {
            env::set_var("PLAYBACK_AMPLITUDE_REFERENCE", "-1");
        }
        match VoiceConfig::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "PLAYBACK_AMPLITUDE_REFERENCE"),
            _ => panic!("Expected InvalidValue for PLAYBACK_AMPLITUDE_REFERENCE"),
        }
        clear_env_vars();
    }
}
