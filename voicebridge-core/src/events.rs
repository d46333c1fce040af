//! Status and degradation events broadcast by the engines.
//!
//! Each engine owns a `tokio::sync::broadcast::Sender<AudioEvent>`; callers
//! subscribe with `subscribe_events()`. Sends never block and are dropped when
//! nobody is listening, so emitting from a device callback is fine.
//!
//! All types serialize to camelCase JSON so they can be forwarded verbatim to a
//! UI or control channel.

use serde::{Deserialize, Serialize};

/// Broadcast channel capacity: events buffered for slow subscribers.
pub(crate) const EVENT_CHANNEL_CAP: usize = 256;

/// Which side of the pipeline an event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Capture,
    Playback,
}

/// Capture engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Idle,
    Capturing,
}

/// Playback engine state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackStatus {
    /// Constructed, no output device yet.
    Uninitialized,
    /// Device open, queue drained.
    Ready,
    /// Draining the queue onto the device clock.
    Playing,
    /// Terminal.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AudioEvent {
    /// Capture engine changed state.
    #[serde(rename_all = "camelCase")]
    CaptureStatus {
        status: CaptureStatus,
        detail: Option<String>,
    },

    /// Playback engine changed state.
    #[serde(rename_all = "camelCase")]
    PlaybackStatus { status: PlaybackStatus },

    /// The device went away mid-session. The engine has detached from it.
    #[serde(rename_all = "camelCase")]
    DeviceLost { direction: Direction, detail: String },

    /// A playback chunk failed to decode and was dropped.
    #[serde(rename_all = "camelCase")]
    ChunkRejected { reason: String },

    /// The playback queue hit capacity and shed its oldest chunks.
    #[serde(rename_all = "camelCase")]
    QueueOverflow { dropped: usize, retained: usize },
}
