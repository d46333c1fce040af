//! `PlaybackEngine`: network PCM16 chunks → gapless speaker output.
//!
//! ## Lifecycle
//!
//! ```text
//! PlaybackEngine::new()              status = Uninitialized
//!     └─► initialize(source_rate)    device open, status = Ready
//!         └─► add_*_chunk()          status = Playing, queue drained onto the device clock
//!             └─► tick() after idle  queue stayed empty, status = Ready
//!     └─► stop()                     queue cleared, device released, status = Stopped (terminal)
//! ```
//!
//! ## Threading
//!
//! All mutable state (queue, timeline, device handle) sits behind one
//! `parking_lot::Mutex`, shared between callers of `add_*_chunk` and the
//! scheduler tick. With `TickMode::Timer` a dedicated thread runs the tick,
//! woken over a `crossbeam_channel` when playback starts and then every
//! `idle_grace` until the engine is `Ready` again.

pub mod queue;
pub mod scheduler;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    audio::{decode_base64, pcm16_from_le_bytes, pcm16_to_float, resample},
    config::{PlaybackConfig, TickMode},
    device::{ErrorCallback, OutputBackend, OutputDevice},
    error::{BridgeError, Result},
    events::{AudioEvent, Direction, PlaybackStatus, EVENT_CHANNEL_CAP},
};
use queue::PlaybackQueue;
use scheduler::Scheduler;

#[derive(Default)]
pub struct PlaybackDiagnostics {
    pub chunks_accepted: AtomicUsize,
    pub chunks_rejected: AtomicUsize,
    pub overflow_events: AtomicUsize,
    pub chunks_dropped: AtomicUsize,
    pub buffers_scheduled: AtomicUsize,
    pub schedule_errors: AtomicUsize,
}

impl PlaybackDiagnostics {
    pub fn snapshot(&self) -> PlaybackDiagnosticsSnapshot {
        PlaybackDiagnosticsSnapshot {
            chunks_accepted: self.chunks_accepted.load(Ordering::Relaxed),
            chunks_rejected: self.chunks_rejected.load(Ordering::Relaxed),
            overflow_events: self.overflow_events.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            buffers_scheduled: self.buffers_scheduled.load(Ordering::Relaxed),
            schedule_errors: self.schedule_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackDiagnosticsSnapshot {
    pub chunks_accepted: usize,
    pub chunks_rejected: usize,
    pub overflow_events: usize,
    /// Chunks shed by the overflow policy.
    pub chunks_dropped: usize,
    pub buffers_scheduled: usize,
    pub schedule_errors: usize,
}

struct EngineState {
    status: PlaybackStatus,
    /// Rate incoming chunks are encoded at.
    source_rate: u32,
    output: Option<Box<dyn OutputDevice>>,
    queue: PlaybackQueue,
    scheduler: Scheduler,
    volume: f32,
    /// When the queue was last drained.
    last_drain: Option<Instant>,
    /// Wakes the timer thread; `None` in manual mode or before initialize.
    wake_tx: Option<Sender<()>>,
}

struct Shared {
    backend: Arc<dyn OutputBackend>,
    config: PlaybackConfig,
    state: Mutex<EngineState>,
    /// Set from the device error callback; handled on the next call.
    device_lost: Arc<AtomicBool>,
    events_tx: broadcast::Sender<AudioEvent>,
    diagnostics: PlaybackDiagnostics,
}

/// Scheduled, queue-based speaker output.
///
/// `Send + Sync`; wrap in `Arc` to feed it from a network task while another
/// task handles interruptions.
pub struct PlaybackEngine {
    shared: Arc<Shared>,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackEngine {
    pub fn new(backend: Arc<dyn OutputBackend>, config: PlaybackConfig) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        let queue = PlaybackQueue::new(config.max_queue_size, config.retained_on_overflow());
        let volume = clamp_volume(config.initial_volume);
        Self {
            shared: Arc::new(Shared {
                backend,
                state: Mutex::new(EngineState {
                    status: PlaybackStatus::Uninitialized,
                    source_rate: 0,
                    output: None,
                    queue,
                    scheduler: Scheduler::new(),
                    volume,
                    last_drain: None,
                    wake_tx: None,
                }),
                config,
                device_lost: Arc::new(AtomicBool::new(false)),
                events_tx,
                diagnostics: PlaybackDiagnostics::default(),
            }),
            ticker: Mutex::new(None),
        }
    }

    /// Open the output device. Incoming chunks are assumed to be encoded at
    /// `source_sample_rate`; the device runs at its own native rate.
    ///
    /// Calling this again while initialized is logged and ignored.
    ///
    /// # Errors
    /// - `InvalidConfig` for a zero rate.
    /// - `Stopped` after `stop()`.
    /// - `DeviceUnavailable` / `AudioStream` from the backend, or `AudioStream`
    ///   for a device reporting a zero sample rate. Nothing is held; the engine
    ///   stays `Uninitialized` and may be initialized again.
    pub fn initialize(&self, source_sample_rate: u32) -> Result<()> {
        if source_sample_rate == 0 {
            return Err(BridgeError::InvalidConfig(
                "playback source sample rate must be non-zero".into(),
            ));
        }

        let shared = &self.shared;
        let mut state = shared.state.lock();
        match state.status {
            PlaybackStatus::Stopped => return Err(BridgeError::Stopped),
            PlaybackStatus::Ready | PlaybackStatus::Playing => {
                warn!("playback engine already initialized; ignoring initialize()");
                return Ok(());
            }
            PlaybackStatus::Uninitialized => {}
        }

        shared.device_lost.store(false, Ordering::SeqCst);
        let mut output = shared
            .backend
            .open_output(&shared.config, shared.device_error_callback())
            .map_err(|e| {
                error!("output device acquisition failed: {e}");
                e
            })?;

        // `output` is released by drop if anything below fails.
        let device_rate = output.sample_rate();
        if device_rate == 0 {
            let e = BridgeError::AudioStream("output device reported a zero sample rate".into());
            error!("{e}");
            return Err(e);
        }
        output.set_gain(state.volume);

        // The ticker parks on its channel until woken, so it never contends for
        // the state lock held here.
        let ticker = match shared.config.tick_mode {
            TickMode::Timer => {
                let (wake_tx, wake_rx) = bounded::<()>(1);
                Some((wake_tx, spawn_ticker(Arc::clone(shared), wake_rx)?))
            }
            TickMode::Manual => None,
        };

        state.output = Some(output);
        state.source_rate = source_sample_rate;
        state.scheduler.clear();
        if let Some((wake_tx, handle)) = ticker {
            state.wake_tx = Some(wake_tx);
            *self.ticker.lock() = Some(handle);
        }

        shared.set_status(&mut state, PlaybackStatus::Ready);
        info!(
            source_rate = source_sample_rate,
            device_rate, "playback initialized"
        );
        Ok(())
    }

    /// Queue one PCM16 chunk encoded at the source rate.
    pub fn add_audio_chunk(&self, frame: &[i16]) -> Result<()> {
        self.shared.enqueue(frame)
    }

    /// Queue one chunk of raw little-endian PCM16 bytes.
    ///
    /// # Errors
    /// `MalformedChunk` for an odd byte count; the chunk is dropped and
    /// playback continues.
    pub fn add_pcm_bytes(&self, bytes: &[u8]) -> Result<()> {
        let frame = pcm16_from_le_bytes(bytes).map_err(|e| self.shared.reject(e))?;
        self.shared.enqueue(&frame)
    }

    /// Queue one base64 transport chunk.
    ///
    /// # Errors
    /// `MalformedChunk` if the text does not decode to whole PCM16 samples; the
    /// chunk is dropped and playback continues.
    pub fn add_base64_audio_chunk(&self, chunk: &str) -> Result<()> {
        let frame = decode_base64(chunk).map_err(|e| self.shared.reject(e))?;
        self.shared.enqueue(&frame)
    }

    /// Drain anything queued, or fall back to `Ready` once the queue has stayed
    /// empty for `idle_grace`. Drive this from a frame loop in `TickMode::Manual`.
    pub fn tick(&self) -> PlaybackStatus {
        self.shared.tick()
    }

    /// Drop all pending audio and forget the timeline (e.g. the remote speaker
    /// was interrupted). Buffers already handed to the device still play out.
    pub fn clear_queue(&self) {
        let mut state = self.shared.state.lock();
        let discarded = state.queue.clear();
        state.scheduler.clear();
        debug!(discarded, "playback queue cleared");
    }

    /// Set output gain. Values outside [0, 1] are clamped; NaN mutes.
    pub fn set_volume(&self, level: f32) {
        let volume = clamp_volume(level);
        let mut state = self.shared.state.lock();
        state.volume = volume;
        if let Some(output) = state.output.as_mut() {
            output.set_gain(volume);
        }
    }

    pub fn volume(&self) -> f32 {
        self.shared.state.lock().volume
    }

    /// Clear the queue and release the gain stage and device. Terminal and idempotent.
    pub fn stop(&self) {
        // The ticker locks state; shut it down before taking the lock ourselves.
        let wake_tx = self.shared.state.lock().wake_tx.take();
        drop(wake_tx);
        if let Some(handle) = self.ticker.lock().take() {
            if handle.join().is_err() {
                error!("playback ticker thread panicked");
            }
        }

        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.status == PlaybackStatus::Stopped {
            return;
        }
        let discarded = state.queue.clear();
        state.scheduler.clear();
        state.output.take();
        shared.set_status(&mut state, PlaybackStatus::Stopped);
        info!(discarded, "playback stopped");
    }

    pub fn status(&self) -> PlaybackStatus {
        self.shared.state.lock().status
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn source_sample_rate(&self) -> Option<u32> {
        let state = self.shared.state.lock();
        state.output.as_ref().map(|_| state.source_rate)
    }

    pub fn device_sample_rate(&self) -> Option<u32> {
        self.shared
            .state
            .lock()
            .output
            .as_ref()
            .map(|o| o.sample_rate())
    }

    /// Planned start of the next buffer on the device clock, if a timeline is active.
    pub fn next_start_time(&self) -> Option<f64> {
        self.shared.state.lock().scheduler.next_start_time()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AudioEvent> {
        self.shared.events_tx.subscribe()
    }

    pub fn diagnostics_snapshot(&self) -> PlaybackDiagnosticsSnapshot {
        self.shared.diagnostics.snapshot()
    }
}

impl Drop for PlaybackEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn enqueue(&self, frame: &[i16]) -> Result<()> {
        let mut state = self.state.lock();
        self.check_live(&mut state)?;

        let device_rate = match state.output.as_ref() {
            Some(output) => output.sample_rate(),
            None => return Err(BridgeError::NotInitialized),
        };
        let samples = pcm16_to_float(frame);
        let samples = resample(&samples, state.source_rate, device_rate).into_owned();
        if samples.is_empty() {
            debug!("ignoring empty playback chunk");
            return Ok(());
        }

        self.diagnostics
            .chunks_accepted
            .fetch_add(1, Ordering::Relaxed);
        if let Some(overflow) = state.queue.push(samples) {
            warn!(
                dropped = overflow.dropped,
                retained = overflow.retained,
                "playback queue overflow, dropping oldest audio"
            );
            self.diagnostics
                .overflow_events
                .fetch_add(1, Ordering::Relaxed);
            self.diagnostics
                .chunks_dropped
                .fetch_add(overflow.dropped, Ordering::Relaxed);
            let _ = self.events_tx.send(AudioEvent::QueueOverflow {
                dropped: overflow.dropped,
                retained: overflow.retained,
            });
        }

        if state.status == PlaybackStatus::Ready {
            if let Some(now) = state.output.as_ref().map(|o| o.current_time()) {
                state.scheduler.anchor(now);
            }
            self.set_status(&mut state, PlaybackStatus::Playing);
            self.drain(&mut state);
            if let Some(wake_tx) = state.wake_tx.as_ref() {
                let _ = wake_tx.try_send(());
            }
        }
        Ok(())
    }

    fn tick(&self) -> PlaybackStatus {
        let mut state = self.state.lock();
        if self.check_live(&mut state).is_err() || state.status != PlaybackStatus::Playing {
            return state.status;
        }

        if !state.queue.is_empty() {
            self.drain(&mut state);
        } else {
            let idle = state
                .last_drain
                .map_or(true, |at| at.elapsed() >= self.config.idle_grace());
            if idle {
                self.set_status(&mut state, PlaybackStatus::Ready);
            }
        }
        state.status
    }

    /// Pop every queued buffer onto the device timeline.
    fn drain(&self, state: &mut EngineState) {
        let EngineState {
            output,
            queue,
            scheduler,
            ..
        } = state;
        let Some(output) = output.as_mut() else {
            return;
        };

        while let Some(buffer) = queue.pop() {
            match scheduler.schedule(output.as_mut(), buffer) {
                Ok(start) => {
                    self.diagnostics
                        .buffers_scheduled
                        .fetch_add(1, Ordering::Relaxed);
                    debug!(start, "scheduled playback buffer");
                }
                Err(e) => {
                    self.diagnostics
                        .schedule_errors
                        .fetch_add(1, Ordering::Relaxed);
                    warn!("failed to schedule playback buffer: {e}");
                }
            }
        }
        state.last_drain = Some(Instant::now());
    }

    /// Surface a device loss flagged by the error callback: release the dead
    /// device and fall back to `Uninitialized` so the caller can re-initialize.
    fn check_live(&self, state: &mut EngineState) -> Result<()> {
        match state.status {
            PlaybackStatus::Uninitialized => return Err(BridgeError::NotInitialized),
            PlaybackStatus::Stopped => return Err(BridgeError::Stopped),
            PlaybackStatus::Ready | PlaybackStatus::Playing => {}
        }
        if !self.device_lost.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let discarded = state.queue.clear();
        state.scheduler.clear();
        state.output.take();
        state.wake_tx.take();
        warn!(discarded, "output device lost, playback reset");
        self.set_status(state, PlaybackStatus::Uninitialized);
        Err(BridgeError::DeviceUnavailable("output device lost".into()))
    }

    fn reject(&self, err: BridgeError) -> BridgeError {
        warn!("dropping playback chunk: {err}");
        self.diagnostics
            .chunks_rejected
            .fetch_add(1, Ordering::Relaxed);
        let _ = self.events_tx.send(AudioEvent::ChunkRejected {
            reason: err.to_string(),
        });
        err
    }

    fn set_status(&self, state: &mut EngineState, status: PlaybackStatus) {
        if state.status == status {
            return;
        }
        debug!(from = ?state.status, to = ?status, "playback status change");
        state.status = status;
        let _ = self.events_tx.send(AudioEvent::PlaybackStatus { status });
    }

    fn device_error_callback(&self) -> ErrorCallback {
        let lost = Arc::clone(&self.device_lost);
        let events_tx = self.events_tx.clone();
        Box::new(move |err: BridgeError| match err {
            BridgeError::DeviceUnavailable(detail) => {
                warn!("output device lost: {detail}");
                if !lost.swap(true, Ordering::SeqCst) {
                    let _ = events_tx.send(AudioEvent::DeviceLost {
                        direction: Direction::Playback,
                        detail,
                    });
                }
            }
            other => warn!("playback stream error: {other}"),
        })
    }
}

/// Timer thread: tick on wake-up, then every `idle_grace` while playing.
fn spawn_ticker(shared: Arc<Shared>, wake_rx: Receiver<()>) -> Result<JoinHandle<()>> {
    let grace = shared.config.idle_grace();
    let handle = thread::Builder::new()
        .name("voicebridge-playback-tick".into())
        .spawn(move || {
            let mut playing = false;
            loop {
                let woke = if playing {
                    wake_rx.recv_timeout(grace)
                } else {
                    wake_rx.recv().map_err(|_| RecvTimeoutError::Disconnected)
                };
                if let Err(RecvTimeoutError::Disconnected) = woke {
                    break;
                }
                playing = shared.tick() == PlaybackStatus::Playing;
            }
            debug!("playback ticker exited");
        })?;
    Ok(handle)
}

fn clamp_volume(level: f32) -> f32 {
    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    }
}
