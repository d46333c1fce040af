//! `CaptureEngine`: microphone → PCM16 transport chunks.
//!
//! ## Lifecycle
//!
//! ```text
//! CaptureEngine::new()
//!     └─► start(sink, rate)  → device open, status = Capturing
//!         └─► stop()         → sink detached, device released, status = Idle
//! ```
//!
//! A failed `start()` leaves the engine `Idle` with nothing held. A device
//! lost mid-session detaches the sink, reports `AudioEvent::DeviceLost` and
//! drops back to `Idle`; the dead session is released on the next
//! `stop()`/`start()`.
//!
//! ## Stop guarantee
//!
//! The processor (and the sink inside it) lives behind a gate mutex that the
//! device callback locks for the duration of each frame. `stop()` empties the
//! gate before releasing the device, so once `stop()` returns no sink call is
//! in progress and none can start, even if the backend fires a late callback.
//!
//! A sink may call `stop()` itself. That thread already holds the gate, so
//! the gate is only marked closed and the device is released from a
//! short-lived cleanup thread once the sink returns.
//!
//! ## Callback cost
//!
//! Each frame is downmixed, resampled, quantized and base64-encoded on the
//! backend's audio thread, under the gate lock, with a few small allocations.
//! That keeps frames strictly in order with no extra hop, at the price of
//! real-time headroom. Sinks must stay cheap: hand the frame to a channel or
//! socket buffer and return.

pub mod processor;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

pub use processor::{CaptureSink, EncodedFrame};

use crate::{
    config::CaptureConfig,
    device::{InputBackend, InputSession, PermissionState},
    error::{BridgeError, Result},
    events::{AudioEvent, CaptureStatus, Direction, EVENT_CHANNEL_CAP},
};
use processor::FrameProcessor;

type Gate = Arc<SinkGate>;

/// Holds the processor for the lifetime of a session.
#[derive(Default)]
struct SinkGate {
    processor: Mutex<Option<FrameProcessor>>,
    /// Set once the session is over; checked before every sink call.
    closed: AtomicBool,
    /// Thread currently inside the sink, if any.
    sink_thread: Mutex<Option<ThreadId>>,
}

impl SinkGate {
    fn install(&self, processor: FrameProcessor) {
        *self.processor.lock() = Some(processor);
    }

    /// Run one frame through the processor. `None` when no sink is attached.
    fn run(&self, data: &[f32]) -> Option<usize> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let mut slot = self.processor.lock();
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let processor = slot.as_mut()?;
        *self.sink_thread.lock() = Some(thread::current().id());
        let samples = processor.process(data);
        self.sink_thread.lock().take();
        Some(samples)
    }

    /// Stop all further sink calls. Returns `false` when called from inside
    /// the sink, where the processor lock is already held up the stack and the
    /// processor has to be dropped later.
    fn close(&self) -> bool {
        self.closed.store(true, Ordering::Release);
        if *self.sink_thread.lock() == Some(thread::current().id()) {
            return false;
        }
        self.processor.lock().take();
        true
    }
}

#[derive(Default)]
pub struct CaptureDiagnostics {
    pub frames_delivered: AtomicUsize,
    pub frames_emitted: AtomicUsize,
    pub frames_discarded: AtomicUsize,
    pub samples_emitted: AtomicUsize,
}

impl CaptureDiagnostics {
    pub fn reset(&self) {
        self.frames_delivered.store(0, Ordering::Relaxed);
        self.frames_emitted.store(0, Ordering::Relaxed);
        self.frames_discarded.store(0, Ordering::Relaxed);
        self.samples_emitted.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CaptureDiagnosticsSnapshot {
        CaptureDiagnosticsSnapshot {
            frames_delivered: self.frames_delivered.load(Ordering::Relaxed),
            frames_emitted: self.frames_emitted.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            samples_emitted: self.samples_emitted.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureDiagnosticsSnapshot {
    /// Device callbacks received.
    pub frames_delivered: usize,
    /// Frames handed to the sink.
    pub frames_emitted: usize,
    /// Callbacks that arrived with no sink attached (before setup or after stop).
    pub frames_discarded: usize,
    /// PCM16 samples handed to the sink.
    pub samples_emitted: usize,
}

struct ActiveSession {
    /// Dropped to release the microphone.
    device: Box<dyn InputSession>,
    gate: Gate,
}

/// Microphone capture engine.
///
/// `Send + Sync`; share it behind an `Arc` if several tasks need to stop it.
pub struct CaptureEngine {
    backend: Arc<dyn InputBackend>,
    config: CaptureConfig,
    session: Mutex<Option<ActiveSession>>,
    active: Arc<AtomicBool>,
    events_tx: broadcast::Sender<AudioEvent>,
    diagnostics: Arc<CaptureDiagnostics>,
}

impl CaptureEngine {
    pub fn new(backend: Arc<dyn InputBackend>, config: CaptureConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        Self {
            backend,
            config,
            session: Mutex::new(None),
            active: Arc::new(AtomicBool::new(false)),
            events_tx,
            diagnostics: Arc::new(CaptureDiagnostics::default()),
        }
    }

    /// Acquire the microphone and start emitting frames at `target_sample_rate`.
    ///
    /// # Errors
    /// - `InvalidConfig` for a zero target rate.
    /// - `AlreadyRunning` if a session is live.
    /// - `PermissionDenied` / `DeviceUnavailable` / `AudioStream` from the
    ///   backend. Not retried; the engine stays `Idle`.
    pub fn start<S: CaptureSink>(&self, sink: S, target_sample_rate: u32) -> Result<()> {
        if target_sample_rate == 0 {
            return Err(BridgeError::InvalidConfig(
                "capture target sample rate must be non-zero".into(),
            ));
        }

        let mut session = self.session.lock();
        if self.active.load(Ordering::SeqCst) {
            return Err(BridgeError::AlreadyRunning);
        }
        if let Some(stale) = session.take() {
            // Left behind by a device loss.
            release(stale);
        }

        self.diagnostics.reset();
        let gate: Gate = Arc::new(SinkGate::default());

        let device = match self.backend.open_input(
            &self.config,
            frame_callback(Arc::clone(&gate), Arc::clone(&self.diagnostics)),
            self.error_callback(Arc::clone(&gate)),
        ) {
            Ok(device) => device,
            Err(e) => {
                warn!("microphone acquisition failed: {e}");
                self.emit_status(CaptureStatus::Idle, Some(e.to_string()));
                return Err(e);
            }
        };

        // `device` is released by drop if anything below fails.
        let format = device.format();
        if format.sample_rate == 0 || format.channels == 0 {
            let e = BridgeError::AudioStream(format!(
                "input device reported unusable format ({} Hz, {} ch)",
                format.sample_rate, format.channels
            ));
            self.emit_status(CaptureStatus::Idle, Some(e.to_string()));
            return Err(e);
        }

        gate.install(FrameProcessor::new(format, target_sample_rate, Box::new(sink)));
        self.active.store(true, Ordering::SeqCst);
        *session = Some(ActiveSession { device, gate });

        info!(
            native_rate = format.sample_rate,
            channels = format.channels,
            target_rate = target_sample_rate,
            "capture started"
        );
        self.emit_status(CaptureStatus::Capturing, None);
        Ok(())
    }

    /// Detach the sink and release the microphone. Idempotent.
    pub fn stop(&self) {
        let Some(stale) = self.session.lock().take() else {
            return;
        };
        release(stale);
        if self.active.swap(false, Ordering::SeqCst) {
            self.emit_status(CaptureStatus::Idle, None);
        }
        let stats = self.diagnostics.snapshot();
        info!(
            frames = stats.frames_emitted,
            samples = stats.samples_emitted,
            "capture stopped"
        );
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Best-effort permission query. Never prompts.
    pub fn permission_state(&self) -> PermissionState {
        self.backend.permission_state()
    }

    pub fn status(&self) -> CaptureStatus {
        if self.is_active() {
            CaptureStatus::Capturing
        } else {
            CaptureStatus::Idle
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AudioEvent> {
        self.events_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> CaptureDiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn error_callback(&self, gate: Gate) -> crate::device::ErrorCallback {
        let active = Arc::clone(&self.active);
        let events_tx = self.events_tx.clone();
        Box::new(move |err: BridgeError| match err {
            BridgeError::DeviceUnavailable(detail) => {
                warn!("microphone lost: {detail}");
                gate.close();
                if active.swap(false, Ordering::SeqCst) {
                    let _ = events_tx.send(AudioEvent::DeviceLost {
                        direction: Direction::Capture,
                        detail: detail.clone(),
                    });
                    let _ = events_tx.send(AudioEvent::CaptureStatus {
                        status: CaptureStatus::Idle,
                        detail: Some(detail),
                    });
                }
            }
            other => warn!("capture stream error: {other}"),
        })
    }

    fn emit_status(&self, status: CaptureStatus, detail: Option<String>) {
        let _ = self.events_tx.send(AudioEvent::CaptureStatus { status, detail });
    }
}

impl Drop for CaptureEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Close the gate first so no sink call starts, then drop the device.
fn release(session: ActiveSession) {
    if session.gate.close() {
        drop(session.device);
        return;
    }

    // stop() from inside the sink: this may be the backend's own callback
    // thread, which must not tear down its stream.
    let spawned = thread::Builder::new()
        .name("voicebridge-capture-release".into())
        .spawn(move || {
            session.gate.processor.lock().take();
            drop(session.device);
            info!("microphone released after in-sink stop");
        });
    if let Err(e) = spawned {
        error!("failed to spawn capture release thread: {e}");
    }
}

fn frame_callback(gate: Gate, diagnostics: Arc<CaptureDiagnostics>) -> crate::device::FrameCallback {
    Box::new(move |data: &[f32]| {
        diagnostics.frames_delivered.fetch_add(1, Ordering::Relaxed);
        match gate.run(data) {
            Some(samples) => {
                if samples > 0 {
                    diagnostics.frames_emitted.fetch_add(1, Ordering::Relaxed);
                    diagnostics
                        .samples_emitted
                        .fetch_add(samples, Ordering::Relaxed);
                }
            }
            None => {
                diagnostics.frames_discarded.fetch_add(1, Ordering::Relaxed);
            }
        }
    })
}
