//! Hardware seam for capture and playback.
//!
//! The engines never talk to an audio API directly. They go through
//! `InputBackend` / `OutputBackend`, which hand back RAII session objects:
//! dropping the session releases the device on every path, including error
//! unwinding inside the engines.
//!
//! Implementations:
//! - [`cpal_backend::CpalBackend`] (feature `audio-cpal`, default) for real hardware.
//! - [`stub::StubInput`] / [`stub::StubOutput`] for tests and headless builds.

#[cfg(feature = "audio-cpal")]
pub mod cpal_backend;
pub mod stub;

use serde::{Deserialize, Serialize};

use crate::config::{CaptureConfig, PlaybackConfig};
use crate::error::{BridgeError, Result};

/// Device-thread callback receiving interleaved f32 frames.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Device-thread callback receiving asynchronous stream failures
/// (device unplugged, backend fault).
pub type ErrorCallback = Box<dyn FnMut(BridgeError) + Send + 'static>;

/// Best-effort microphone permission status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    Granted,
    Denied,
    /// The OS will ask the user on first acquisition.
    Prompt,
    /// The host exposes no permission query.
    Unknown,
}

/// Native format a device session actually runs at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
}

/// A live microphone session. Dropping it stops the stream and releases the device.
pub trait InputSession: Send {
    fn format(&self) -> StreamFormat;
}

/// Source of microphone sessions.
pub trait InputBackend: Send + Sync {
    /// Query permission without prompting the user.
    fn permission_state(&self) -> PermissionState;

    /// Acquire the microphone and start delivering frames to `on_frame`.
    ///
    /// # Errors
    /// `PermissionDenied` or `DeviceUnavailable` when acquisition is refused;
    /// `AudioStream` when the backend cannot build a stream. Nothing is held
    /// on error.
    fn open_input(
        &self,
        config: &CaptureConfig,
        on_frame: FrameCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn InputSession>>;
}

/// One unit of audio placed on the output device's timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBuffer {
    /// Device-clock time (seconds) at which the first sample sounds.
    pub start_time: f64,
    /// Mono samples at `sample_rate`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl ScheduledBuffer {
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration()
    }
}

/// An open output device with a monotonic clock.
///
/// Dropping it releases the gain stage and the device.
pub trait OutputDevice: Send {
    /// Native rate every scheduled buffer must already be at.
    fn sample_rate(&self) -> u32;

    /// Current device-clock time in seconds. Monotonically non-decreasing.
    fn current_time(&self) -> f64;

    /// Queue `buffer` to start sounding at `buffer.start_time`.
    fn schedule(&mut self, buffer: ScheduledBuffer) -> Result<()>;

    /// Output gain in [0, 1].
    fn set_gain(&mut self, gain: f32);
}

/// Source of output devices.
pub trait OutputBackend: Send + Sync {
    /// # Errors
    /// `DeviceUnavailable` when no output device exists; `AudioStream` when the
    /// backend cannot build a stream.
    fn open_output(
        &self,
        config: &PlaybackConfig,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn OutputDevice>>;
}
