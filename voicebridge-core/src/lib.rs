//! # voicebridge-core
//!
//! Realtime voice audio pipeline between local audio hardware and a
//! streaming speech API.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → InputBackend → CaptureEngine ─(EncodedFrame: PCM16 + base64)─► network
//!
//! network ─(PCM16 | base64)─► PlaybackEngine → PlaybackQueue → Scheduler → OutputBackend → Speaker
//! ```
//!
//! The two engines are independent; both lean on the pure conversion helpers
//! in [`audio`]. Sample rates are supplied by the caller per provider
//! ([`config::ProviderRates`]); nothing here assumes one.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod capture;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod playback;

// Convenience re-exports for downstream crates
pub use capture::{CaptureEngine, CaptureSink, EncodedFrame};
pub use config::{AudioSettings, CaptureConfig, PlaybackConfig, ProviderRates, TickMode};
pub use device::{InputBackend, OutputBackend, PermissionState};
pub use error::{BridgeError, Result};
pub use events::{AudioEvent, CaptureStatus, PlaybackStatus};
pub use playback::PlaybackEngine;

#[cfg(feature = "audio-cpal")]
pub use device::cpal_backend::CpalBackend;
