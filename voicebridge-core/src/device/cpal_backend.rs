//! cpal-backed input and output devices.
//!
//! # Threading
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Each stream is therefore built, played and dropped on its own
//! device thread. The open result (or error) is handed back over a
//! `crossbeam_channel`, and the returned session's `Drop` signals that thread
//! to drop the stream and joins it. Once the join returns the backend has
//! stopped invoking our callbacks.
//!
//! # Callback constraints
//!
//! The data callbacks run at elevated priority on an OS audio thread. The
//! output callback never locks: scheduled buffers arrive over an SPSC
//! `ringbuf`, the clock and gain are atomics. Scratch vectors only grow.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, Host, Sample, SampleFormat, SampleRate, SizedSample, Stream, StreamConfig,
    SupportedStreamConfig,
};
use crossbeam_channel::{bounded, Sender};
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapCons, HeapProd, HeapRb,
};
use tracing::{debug, error, info, warn};

use super::{
    DeviceInfo, ErrorCallback, FrameCallback, InputBackend, InputSession, OutputBackend,
    OutputDevice, PermissionState, ScheduledBuffer, StreamFormat,
};
use crate::config::{CaptureConfig, PlaybackConfig};
use crate::error::{BridgeError, Result};

/// Scheduled buffers in flight between the scheduler and the output callback.
const SCHEDULE_RING_CAPACITY: usize = 512;

/// Real audio hardware via the platform's default cpal host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl InputBackend for CpalBackend {
    /// cpal exposes no permission API. Report `Unknown` when an input device
    /// is visible (the OS decides at open time) and `Denied` when enumeration
    /// itself is refused.
    fn permission_state(&self) -> PermissionState {
        let host = cpal::default_host();
        match host.input_devices() {
            Ok(_) => PermissionState::Unknown,
            Err(e) => match classify_backend_message(&e.to_string()) {
                BridgeError::PermissionDenied => PermissionState::Denied,
                _ => PermissionState::Unknown,
            },
        }
    }

    fn open_input(
        &self,
        config: &CaptureConfig,
        on_frame: FrameCallback,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn InputSession>> {
        let config = config.clone();
        let (session, format) = DeviceThread::spawn("voicebridge-input", move || {
            build_input(&config, on_frame, on_error)
        })?;
        Ok(Box::new(CpalInputSession {
            _thread: session,
            format,
        }))
    }
}

impl OutputBackend for CpalBackend {
    fn open_output(
        &self,
        config: &PlaybackConfig,
        on_error: ErrorCallback,
    ) -> Result<Box<dyn OutputDevice>> {
        let preferred = config.preferred_device.clone();
        let (producer, consumer) = HeapRb::<ScheduledVoice>::new(SCHEDULE_RING_CAPACITY).split();
        let clock = Arc::new(AtomicU64::new(0));
        let gain = Arc::new(AtomicU32::new(config.initial_volume.clamp(0.0, 1.0).to_bits()));

        let renderer = Renderer {
            consumer,
            voices: VecDeque::with_capacity(64),
            clock: Arc::clone(&clock),
            gain: Arc::clone(&gain),
        };

        let (session, format) = DeviceThread::spawn("voicebridge-output", move || {
            build_output(preferred.as_deref(), renderer, on_error)
        })?;

        Ok(Box::new(CpalOutputDevice {
            _thread: session,
            producer,
            clock,
            gain,
            sample_rate: format.sample_rate,
        }))
    }
}

// ── Device thread ────────────────────────────────────────────────────────────

/// Owns the OS thread a `!Send` cpal stream lives on.
struct DeviceThread {
    shutdown: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceThread {
    /// Run `build` on a fresh thread and park the stream there until dropped.
    fn spawn<F>(name: &str, build: F) -> Result<(Self, StreamFormat)>
    where
        F: FnOnce() -> Result<(Stream, StreamFormat)> + Send + 'static,
    {
        let (open_tx, open_rx) = bounded::<Result<StreamFormat>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok((stream, format)) => {
                        let _ = open_tx.send(Ok(format));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                // Returns on explicit shutdown or when the sender is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
            })?;

        match open_rx.recv() {
            Ok(Ok(format)) => Ok((
                Self {
                    shutdown: Some(shutdown_tx),
                    handle: Some(handle),
                },
                format,
            )),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(BridgeError::Other(anyhow::anyhow!(
                    "{name} thread exited before reporting open status"
                )))
            }
        }
    }
}

impl Drop for DeviceThread {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("audio device thread panicked during shutdown");
            }
        }
    }
}

// ── Input ────────────────────────────────────────────────────────────────────

struct CpalInputSession {
    _thread: DeviceThread,
    format: StreamFormat,
}

impl InputSession for CpalInputSession {
    fn format(&self) -> StreamFormat {
        self.format
    }
}

impl Drop for CpalInputSession {
    fn drop(&mut self) {
        info!("microphone released");
    }
}

fn build_input(
    config: &CaptureConfig,
    on_frame: FrameCallback,
    on_error: ErrorCallback,
) -> Result<(Stream, StreamFormat)> {
    let host = cpal::default_host();
    let device = select_input_device(&host, config.preferred_device.as_deref())?;

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening input device"
    );

    if config.echo_cancellation || config.noise_suppression || config.auto_gain_control {
        debug!(
            echo_cancellation = config.echo_cancellation,
            noise_suppression = config.noise_suppression,
            auto_gain_control = config.auto_gain_control,
            "cpal host exposes no voice processing controls; requests left to the device"
        );
    }

    let supported = select_input_config(&device, config.preferred_sample_rate)?;
    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.config();
    let format = StreamFormat {
        sample_rate: stream_config.sample_rate.0,
        channels: stream_config.channels,
    };

    info!(
        sample_rate = format.sample_rate,
        channels = format.channels,
        ?sample_format,
        "input config selected"
    );

    let stream = match sample_format {
        SampleFormat::F32 => input_stream::<f32>(&device, &stream_config, on_frame, on_error),
        SampleFormat::I16 => input_stream::<i16>(&device, &stream_config, on_frame, on_error),
        SampleFormat::U16 => input_stream::<u16>(&device, &stream_config, on_frame, on_error),
        SampleFormat::I32 => input_stream::<i32>(&device, &stream_config, on_frame, on_error),
        SampleFormat::U8 => input_stream::<u8>(&device, &stream_config, on_frame, on_error),
        fmt => {
            return Err(BridgeError::AudioStream(format!(
                "unsupported input sample format: {fmt:?}"
            )))
        }
    }?;

    stream.play().map_err(play_error)?;
    Ok((stream, format))
}

fn input_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut on_frame: FrameCallback,
    on_error: ErrorCallback,
) -> Result<Stream>
where
    T: SizedSample,
    f32: cpal::FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_input_stream(
            config,
            move |data: &[T], _info: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| s.to_sample::<f32>()));
                on_frame(&scratch);
            },
            forward_stream_errors(on_error),
            None,
        )
        .map_err(build_error)
}

fn select_input_device(host: &Host, preferred: Option<&str>) -> Result<Device> {
    if let Some(name) = preferred {
        match host.input_devices() {
            Ok(mut devices) => {
                if let Some(device) =
                    devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
                {
                    return Ok(device);
                }
                warn!("preferred input device '{}' not found, falling back", name);
            }
            Err(e) => warn!("failed to list input devices while resolving preference: {e}"),
        }
    }

    if let Some(device) = host.default_input_device() {
        return Ok(device);
    }

    let mut devices = host
        .input_devices()
        .map_err(|e| classify_backend_message(&e.to_string()))?;
    let fallback = devices
        .next()
        .ok_or_else(|| BridgeError::DeviceUnavailable("no input device found".into()))?;
    warn!("no default input device, falling back to first available input");
    Ok(fallback)
}

/// Prefer a config that runs natively at `preferred_rate`, otherwise the device default.
fn select_input_config(device: &Device, preferred_rate: Option<u32>) -> Result<SupportedStreamConfig> {
    if let Some(rate) = preferred_rate {
        match device.supported_input_configs() {
            Ok(ranges) => {
                let mut candidates: Vec<_> = ranges
                    .filter(|r| r.min_sample_rate().0 <= rate && rate <= r.max_sample_rate().0)
                    .collect();
                // f32 first: no conversion in the callback.
                candidates.sort_by_key(|r| r.sample_format() != SampleFormat::F32);
                if let Some(range) = candidates.into_iter().next() {
                    return Ok(range.with_sample_rate(SampleRate(rate)));
                }
                debug!(rate, "device cannot run at preferred rate, using default config");
            }
            Err(e) => warn!("failed to query supported input configs: {e}"),
        }
    }

    device
        .default_input_config()
        .map_err(|e| classify_backend_message(&e.to_string()))
}

// ── Output ───────────────────────────────────────────────────────────────────

/// A scheduled buffer converted to absolute device frames.
struct ScheduledVoice {
    start_frame: u64,
    samples: Vec<f32>,
}

/// Output-callback state. Owned by the device thread.
struct Renderer {
    consumer: HeapCons<ScheduledVoice>,
    voices: VecDeque<ScheduledVoice>,
    /// Frames rendered so far: the device clock.
    clock: Arc<AtomicU64>,
    gain: Arc<AtomicU32>,
}

impl Renderer {
    /// Fill one interleaved device buffer from whatever voices overlap it.
    fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let frames = (out.len() / channels) as u64;
        let start = self.clock.load(Ordering::Acquire);
        let end = start + frames;

        while let Some(voice) = self.consumer.try_pop() {
            self.voices.push_back(voice);
        }

        out.fill(0.0);
        let gain = f32::from_bits(self.gain.load(Ordering::Relaxed));

        for voice in &self.voices {
            let voice_end = voice.start_frame + voice.samples.len() as u64;
            let from = voice.start_frame.max(start);
            let to = voice_end.min(end);
            for frame in from..to {
                let sample = voice.samples[(frame - voice.start_frame) as usize] * gain;
                let base = (frame - start) as usize * channels;
                for slot in &mut out[base..base + channels] {
                    *slot += sample;
                }
            }
        }

        self.voices
            .retain(|v| v.start_frame + v.samples.len() as u64 > end);
        self.clock.store(end, Ordering::Release);
    }
}

struct CpalOutputDevice {
    _thread: DeviceThread,
    producer: HeapProd<ScheduledVoice>,
    clock: Arc<AtomicU64>,
    gain: Arc<AtomicU32>,
    sample_rate: u32,
}

impl OutputDevice for CpalOutputDevice {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.clock.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn schedule(&mut self, buffer: ScheduledBuffer) -> Result<()> {
        let voice = ScheduledVoice {
            start_frame: (buffer.start_time * self.sample_rate as f64).round() as u64,
            samples: buffer.samples,
        };
        self.producer.try_push(voice).map_err(|_| {
            BridgeError::AudioStream("output schedule ring is full".into())
        })
    }

    fn set_gain(&mut self, gain: f32) {
        self.gain.store(gain.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

impl Drop for CpalOutputDevice {
    fn drop(&mut self) {
        info!("output device released");
    }
}

fn build_output(
    preferred: Option<&str>,
    renderer: Renderer,
    on_error: ErrorCallback,
) -> Result<(Stream, StreamFormat)> {
    let host = cpal::default_host();
    let device = select_output_device(&host, preferred)?;

    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening output device"
    );

    let supported = device
        .default_output_config()
        .map_err(|e| classify_backend_message(&e.to_string()))?;
    let sample_format = supported.sample_format();
    let stream_config: StreamConfig = supported.config();
    let format = StreamFormat {
        sample_rate: stream_config.sample_rate.0,
        channels: stream_config.channels,
    };

    info!(
        sample_rate = format.sample_rate,
        channels = format.channels,
        ?sample_format,
        "output config selected"
    );

    let stream = match sample_format {
        SampleFormat::F32 => output_stream::<f32>(&device, &stream_config, renderer, on_error),
        SampleFormat::I16 => output_stream::<i16>(&device, &stream_config, renderer, on_error),
        SampleFormat::U16 => output_stream::<u16>(&device, &stream_config, renderer, on_error),
        SampleFormat::I32 => output_stream::<i32>(&device, &stream_config, renderer, on_error),
        SampleFormat::U8 => output_stream::<u8>(&device, &stream_config, renderer, on_error),
        fmt => {
            return Err(BridgeError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }?;

    stream.play().map_err(play_error)?;
    Ok((stream, format))
}

fn output_stream<T>(
    device: &Device,
    config: &StreamConfig,
    mut renderer: Renderer,
    on_error: ErrorCallback,
) -> Result<Stream>
where
    T: SizedSample + cpal::FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                scratch.resize(data.len(), 0.0);
                renderer.render(&mut scratch, channels);
                for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                    *dst = T::from_sample(src);
                }
            },
            forward_stream_errors(on_error),
            None,
        )
        .map_err(build_error)
}

fn select_output_device(host: &Host, preferred: Option<&str>) -> Result<Device> {
    if let Some(name) = preferred {
        match host.output_devices() {
            Ok(mut devices) => {
                if let Some(device) =
                    devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
                {
                    return Ok(device);
                }
                warn!("preferred output device '{}' not found, falling back", name);
            }
            Err(e) => warn!("failed to list output devices while resolving preference: {e}"),
        }
    }

    host.default_output_device()
        .ok_or_else(|| BridgeError::DeviceUnavailable("no output device found".into()))
}

// ── Enumeration ──────────────────────────────────────────────────────────────

/// List all available audio input devices on the system.
pub fn list_input_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());
    match host.input_devices() {
        Ok(devices) => describe(devices, default_name.as_deref(), "Input Device"),
        Err(e) => {
            warn!("failed to enumerate input devices: {e}");
            Vec::new()
        }
    }
}

/// List all available audio output devices on the system.
pub fn list_output_devices() -> Vec<DeviceInfo> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());
    match host.output_devices() {
        Ok(devices) => describe(devices, default_name.as_deref(), "Output Device"),
        Err(e) => {
            warn!("failed to enumerate output devices: {e}");
            Vec::new()
        }
    }
}

fn describe(
    devices: impl Iterator<Item = Device>,
    default_name: Option<&str>,
    fallback_label: &str,
) -> Vec<DeviceInfo> {
    let mut list: Vec<DeviceInfo> = devices
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("{fallback_label} {}", idx + 1));
            let is_default = default_name == Some(name.as_str());
            DeviceInfo { name, is_default }
        })
        .collect();
    list.sort_by_key(|d| (!d.is_default, d.name.to_ascii_lowercase()));
    list
}

// ── Error mapping ────────────────────────────────────────────────────────────

fn forward_stream_errors(mut on_error: ErrorCallback) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| {
        error!("audio stream error: {err}");
        let mapped = match err {
            cpal::StreamError::DeviceNotAvailable => {
                BridgeError::DeviceUnavailable("device disconnected".into())
            }
            other => BridgeError::AudioStream(other.to_string()),
        };
        on_error(mapped);
    }
}

fn build_error(err: cpal::BuildStreamError) -> BridgeError {
    match err {
        cpal::BuildStreamError::DeviceNotAvailable => {
            BridgeError::DeviceUnavailable("device not available".into())
        }
        other => classify_backend_message(&other.to_string()),
    }
}

fn play_error(err: cpal::PlayStreamError) -> BridgeError {
    match err {
        cpal::PlayStreamError::DeviceNotAvailable => {
            BridgeError::DeviceUnavailable("device not available".into())
        }
        other => classify_backend_message(&other.to_string()),
    }
}

/// Backends report permission refusals as free-form text. Sniff for them.
fn classify_backend_message(message: &str) -> BridgeError {
    let lowered = message.to_ascii_lowercase();
    if lowered.contains("permission") || lowered.contains("access denied") || lowered.contains("not authorized") {
        BridgeError::PermissionDenied
    } else if lowered.contains("not available") || lowered.contains("no such device") {
        BridgeError::DeviceUnavailable(message.to_string())
    } else {
        BridgeError::AudioStream(message.to_string())
    }
}
