//! Engine configuration and the JSON settings file.
//!
//! Sample rates are provider-specific and deliberately have no default: one
//! realtime provider speaks 24 kHz both ways, another takes 16 kHz input and
//! returns 24 kHz output. Adding a provider is a new `ProviderRates` value,
//! never a code branch.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Rate pair negotiated with a realtime speech provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRates {
    /// Rate the provider expects microphone audio at (capture target).
    pub input_sample_rate: u32,
    /// Rate the provider sends synthesized speech at (playback source).
    pub output_sample_rate: u32,
}

impl ProviderRates {
    pub fn new(input_sample_rate: u32, output_sample_rate: u32) -> Self {
        Self {
            input_sample_rate,
            output_sample_rate,
        }
    }

    /// Same rate in both directions.
    pub fn symmetric(rate: u32) -> Self {
        Self::new(rate, rate)
    }

    pub fn validate(&self) -> Result<()> {
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            return Err(BridgeError::InvalidConfig(format!(
                "sample rates must be non-zero (input={}, output={})",
                self.input_sample_rate, self.output_sample_rate
            )));
        }
        Ok(())
    }
}

/// Microphone acquisition preferences.
///
/// The processing flags are capability *requests*; backends that cannot honor
/// them log and continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct CaptureConfig {
    /// Native rate to ask the device for. `None` uses the device default.
    pub preferred_sample_rate: Option<u32>,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Input device name; falls back to the system default when absent or not found.
    pub preferred_device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            preferred_sample_rate: None,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            preferred_device: None,
        }
    }
}

/// How the playback engine re-checks its queue after draining it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TickMode {
    /// A scheduler thread wakes every `idle_grace` while playing.
    Timer,
    /// The caller drives `PlaybackEngine::tick` from its own frame loop.
    Manual,
}

/// Playback engine tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct PlaybackConfig {
    /// Queue capacity in chunks. On overflow the oldest chunks are dropped
    /// until half of this remains.
    pub max_queue_size: usize,
    /// How long the queue may stay empty before the engine returns to `Ready`.
    pub idle_grace_ms: u64,
    pub tick_mode: TickMode,
    /// Output gain applied at initialization, clamped to [0, 1].
    pub initial_volume: f32,
    /// Output device name; falls back to the system default when absent or not found.
    pub preferred_device: Option<String>,
}

impl PlaybackConfig {
    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    /// Number of chunks kept when the overflow policy fires.
    pub fn retained_on_overflow(&self) -> usize {
        (self.max_queue_size / 2).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_queue_size == 0 {
            return Err(BridgeError::InvalidConfig(
                "maxQueueSize must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            idle_grace_ms: 100,
            tick_mode: TickMode::Timer,
            initial_volume: 1.0,
            preferred_device: None,
        }
    }
}

/// Persistent audio settings (JSON).
///
/// `rates` is required; everything else falls back to defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSettings {
    pub rates: ProviderRates,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

impl AudioSettings {
    pub fn new(rates: ProviderRates) -> Self {
        Self {
            rates,
            capture: CaptureConfig::default(),
            playback: PlaybackConfig::default(),
        }
    }

    /// Parse and validate settings from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load and validate settings from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.rates.validate()?;
        self.playback.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_settings_fill_defaults() {
        let settings =
            AudioSettings::from_json(r#"{"rates":{"inputSampleRate":16000,"outputSampleRate":24000}}"#)
                .expect("parse minimal settings");
        assert_eq!(settings.rates, ProviderRates::new(16_000, 24_000));
        assert_eq!(settings.playback.max_queue_size, 100);
        assert_eq!(settings.playback.tick_mode, TickMode::Timer);
        assert!(settings.capture.echo_cancellation);
    }

    #[test]
    fn rates_are_required() {
        let err = AudioSettings::from_json("{}").unwrap_err();
        assert!(matches!(err, BridgeError::Json(_)));
    }

    #[test]
    fn zero_rate_rejected() {
        let err = AudioSettings::from_json(r#"{"rates":{"inputSampleRate":0,"outputSampleRate":24000}}"#)
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig(_)));
    }

    #[test]
    fn zero_queue_rejected() {
        let mut settings = AudioSettings::new(ProviderRates::symmetric(24_000));
        settings.playback.max_queue_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn playback_fields_are_camel_case() {
        let json = serde_json::to_value(PlaybackConfig::default()).expect("serialize");
        assert_eq!(json["maxQueueSize"], 100);
        assert_eq!(json["idleGraceMs"], 100);
        assert_eq!(json["tickMode"], "timer");
    }

    #[test]
    fn retained_window_is_half_capacity() {
        let cfg = PlaybackConfig {
            max_queue_size: 100,
            ..Default::default()
        };
        assert_eq!(cfg.retained_on_overflow(), 50);
        let tiny = PlaybackConfig {
            max_queue_size: 1,
            ..Default::default()
        };
        assert_eq!(tiny.retained_on_overflow(), 1);
    }

    #[test]
    fn save_then_load() {
        let dir = std::env::temp_dir().join(format!("voicebridge-settings-{}", std::process::id()));
        let path = dir.join("audio.json");
        let settings = AudioSettings::new(ProviderRates::symmetric(24_000));
        settings.save(&path).expect("save settings");
        let loaded = AudioSettings::load(&path).expect("load settings");
        assert_eq!(loaded, settings);
        let _ = fs::remove_dir_all(&dir);
    }
}
