//! In-process stand-ins for audio hardware.
//!
//! `StubInput` lets a test push frames exactly as a device callback would,
//! refuse acquisition, or simulate an unplug. `StubOutput` exposes a manually
//! advanced clock and records every scheduled buffer. Both count session
//! opens and releases so tests can assert nothing leaks.
//!
//! Handles are cheap clones over shared state: keep one in the test, give a
//! clone to the engine as its backend.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tracing::debug;

use super::{
    ErrorCallback, FrameCallback, InputBackend, InputSession, OutputBackend, OutputDevice,
    PermissionState, ScheduledBuffer, StreamFormat,
};
use crate::config::{CaptureConfig, PlaybackConfig};
use crate::error::{BridgeError, Result};

/// How the next acquisition attempt should fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubFailure {
    PermissionDenied,
    DeviceUnavailable,
}

impl StubFailure {
    fn to_error(self) -> BridgeError {
        match self {
            Self::PermissionDenied => BridgeError::PermissionDenied,
            Self::DeviceUnavailable => BridgeError::DeviceUnavailable("stub device absent".into()),
        }
    }
}

// ── Input ────────────────────────────────────────────────────────────────────

struct InputInner {
    format: StreamFormat,
    permission: Mutex<PermissionState>,
    failure: Mutex<Option<StubFailure>>,
    /// Callbacks from the most recent open. Deliberately kept after release so a
    /// test can model a device that fires one more callback late.
    on_frame: Mutex<Option<FrameCallback>>,
    on_error: Mutex<Option<ErrorCallback>>,
    last_config: Mutex<Option<CaptureConfig>>,
    opened: AtomicUsize,
    released: AtomicUsize,
}

/// Scriptable microphone.
#[derive(Clone)]
pub struct StubInput {
    inner: Arc<InputInner>,
}

impl StubInput {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            inner: Arc::new(InputInner {
                format: StreamFormat {
                    sample_rate,
                    channels,
                },
                permission: Mutex::new(PermissionState::Granted),
                failure: Mutex::new(None),
                on_frame: Mutex::new(None),
                on_error: Mutex::new(None),
                last_config: Mutex::new(None),
                opened: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
            }),
        }
    }

    /// Make every subsequent `open_input` fail with `failure` (or succeed with `None`).
    pub fn fail_with(&self, failure: Option<StubFailure>) {
        *self.inner.failure.lock() = failure;
        if failure == Some(StubFailure::PermissionDenied) {
            *self.inner.permission.lock() = PermissionState::Denied;
        }
    }

    pub fn set_permission(&self, state: PermissionState) {
        *self.inner.permission.lock() = state;
    }

    /// Invoke the frame callback with interleaved samples, as the device would.
    ///
    /// Returns `false` if no stream was ever opened.
    pub fn deliver(&self, interleaved: &[f32]) -> bool {
        match self.inner.on_frame.lock().as_mut() {
            Some(callback) => {
                callback(interleaved);
                true
            }
            None => false,
        }
    }

    /// Fire the device-lost signal through the error callback.
    pub fn disconnect(&self, detail: &str) {
        if let Some(callback) = self.inner.on_error.lock().as_mut() {
            callback(BridgeError::DeviceUnavailable(detail.to_string()));
        }
    }

    /// Sessions currently held (opened and not yet dropped).
    pub fn open_sessions(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst) - self.inner.released.load(Ordering::SeqCst)
    }

    pub fn times_opened(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst)
    }

    /// Constraints passed to the most recent `open_input`.
    pub fn last_config(&self) -> Option<CaptureConfig> {
        self.inner.last_config.lock().clone()
    }
}

impl InputBackend for StubInput {
    fn permission_state(&self) -> PermissionState {
        *self.inner.permission.lock()
    }

    fn open_input(
        &self,
        config: &CaptureConfig,
        on_frame: FrameCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn InputSession>> {
        *self.inner.last_config.lock() = Some(config.clone());
        if let Some(failure) = *self.inner.failure.lock() {
            debug!(?failure, "stub input refusing acquisition");
            return Err(failure.to_error());
        }
        *self.inner.on_frame.lock() = Some(on_frame);
        *self.inner.on_error.lock() = Some(on_error);
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubInputSession {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct StubInputSession {
    inner: Arc<InputInner>,
}

impl InputSession for StubInputSession {
    fn format(&self) -> StreamFormat {
        self.inner.format
    }
}

impl Drop for StubInputSession {
    fn drop(&mut self) {
        self.inner.released.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Output ───────────────────────────────────────────────────────────────────

struct OutputInner {
    sample_rate: u32,
    clock: Mutex<f64>,
    failure: Mutex<Option<StubFailure>>,
    scheduled: Mutex<Vec<ScheduledBuffer>>,
    gain: Mutex<f32>,
    on_error: Mutex<Option<ErrorCallback>>,
    opened: AtomicUsize,
    released: AtomicUsize,
}

/// Speaker with a hand-cranked clock.
#[derive(Clone)]
pub struct StubOutput {
    inner: Arc<OutputInner>,
}

impl StubOutput {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            inner: Arc::new(OutputInner {
                sample_rate,
                clock: Mutex::new(0.0),
                failure: Mutex::new(None),
                scheduled: Mutex::new(Vec::new()),
                gain: Mutex::new(1.0),
                on_error: Mutex::new(None),
                opened: AtomicUsize::new(0),
                released: AtomicUsize::new(0),
            }),
        }
    }

    pub fn fail_with(&self, failure: Option<StubFailure>) {
        *self.inner.failure.lock() = failure;
    }

    /// Move the device clock forward. The clock never runs backwards.
    pub fn advance(&self, secs: f64) {
        *self.inner.clock.lock() += secs.max(0.0);
    }

    pub fn set_time(&self, secs: f64) {
        let mut clock = self.inner.clock.lock();
        *clock = clock.max(secs);
    }

    pub fn now(&self) -> f64 {
        *self.inner.clock.lock()
    }

    /// Every buffer scheduled so far, in scheduling order.
    pub fn scheduled(&self) -> Vec<ScheduledBuffer> {
        self.inner.scheduled.lock().clone()
    }

    pub fn gain(&self) -> f32 {
        *self.inner.gain.lock()
    }

    pub fn disconnect(&self, detail: &str) {
        if let Some(callback) = self.inner.on_error.lock().as_mut() {
            callback(BridgeError::DeviceUnavailable(detail.to_string()));
        }
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.opened.load(Ordering::SeqCst) - self.inner.released.load(Ordering::SeqCst)
    }
}

impl OutputBackend for StubOutput {
    fn open_output(
        &self,
        config: &PlaybackConfig,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn OutputDevice>> {
        if let Some(failure) = *self.inner.failure.lock() {
            return Err(failure.to_error());
        }
        *self.inner.gain.lock() = config.initial_volume.clamp(0.0, 1.0);
        *self.inner.on_error.lock() = Some(on_error);
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubOutputDevice {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct StubOutputDevice {
    inner: Arc<OutputInner>,
}

impl OutputDevice for StubOutputDevice {
    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate
    }

    fn current_time(&self) -> f64 {
        *self.inner.clock.lock()
    }

    fn schedule(&mut self, buffer: ScheduledBuffer) -> Result<()> {
        self.inner.scheduled.lock().push(buffer);
        Ok(())
    }

    fn set_gain(&mut self, gain: f32) {
        *self.inner.gain.lock() = gain;
    }
}

impl Drop for StubOutputDevice {
    fn drop(&mut self) {
        self.inner.released.fetch_add(1, Ordering::SeqCst);
    }
}
