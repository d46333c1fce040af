use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use approx::assert_abs_diff_eq;
use tokio::sync::broadcast::{self, error::TryRecvError};
use voicebridge_core::audio::encode_base64;
use voicebridge_core::device::stub::{StubFailure, StubOutput};
use voicebridge_core::events::Direction;
use voicebridge_core::{AudioEvent, BridgeError, PlaybackConfig, PlaybackEngine, PlaybackStatus, TickMode};

/// Caller-driven ticks and no idle grace: every `tick()` on an empty queue
/// returns the engine to `Ready`.
fn manual() -> PlaybackConfig {
    PlaybackConfig {
        tick_mode: TickMode::Manual,
        idle_grace_ms: 0,
        ..PlaybackConfig::default()
    }
}

fn engine(output: &StubOutput, config: PlaybackConfig) -> PlaybackEngine {
    PlaybackEngine::new(Arc::new(output.clone()), config)
}

/// `secs` of constant PCM16 at `rate`.
fn chunk(rate: u32, secs: f64) -> Vec<i16> {
    vec![8_000; (rate as f64 * secs).round() as usize]
}

fn drain(rx: &mut broadcast::Receiver<AudioEvent>) -> Vec<AudioEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
            Err(TryRecvError::Lagged(_)) => continue,
        }
    }
}

fn statuses(events: &[AudioEvent]) -> Vec<PlaybackStatus> {
    events
        .iter()
        .filter_map(|e| match e {
            AudioEvent::PlaybackStatus { status } => Some(*status),
            _ => None,
        })
        .collect()
}

fn wait_for(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    done()
}

#[test]
fn three_chunks_play_back_to_back() {
    let output = StubOutput::new(48_000);
    output.set_time(1.0);
    let playback = engine(&output, manual());
    playback.initialize(48_000).expect("initialize");

    for _ in 0..3 {
        playback.add_audio_chunk(&chunk(48_000, 0.1)).expect("add chunk");
    }
    assert_eq!(playback.tick(), PlaybackStatus::Playing);

    let scheduled = output.scheduled();
    assert_eq!(scheduled.len(), 3);
    assert_abs_diff_eq!(scheduled[0].start_time, 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(scheduled[1].start_time, 1.1, epsilon = 1e-9);
    assert_abs_diff_eq!(scheduled[2].start_time, 1.2, epsilon = 1e-9);
    assert_abs_diff_eq!(playback.next_start_time().unwrap(), 1.3, epsilon = 1e-9);
}

#[test]
fn chunks_are_resampled_to_device_rate() {
    let output = StubOutput::new(48_000);
    let playback = engine(&output, manual());
    playback.initialize(24_000).expect("initialize");
    assert_eq!(playback.source_sample_rate(), Some(24_000));
    assert_eq!(playback.device_sample_rate(), Some(48_000));

    playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");

    let scheduled = output.scheduled();
    assert_eq!(scheduled.len(), 1);
    assert_eq!(scheduled[0].samples.len(), 4_800);
    assert_eq!(scheduled[0].sample_rate, 48_000);
    assert_abs_diff_eq!(scheduled[0].duration(), 0.1, epsilon = 1e-9);
}

#[test]
fn pcm_bytes_are_little_endian() {
    let output = StubOutput::new(24_000);
    let playback = engine(&output, manual());
    playback.initialize(24_000).expect("initialize");

    // 0x4000 = 16384
    playback.add_pcm_bytes(&[0x00, 0x40, 0x00, 0xC0]).expect("add bytes");

    let scheduled = output.scheduled();
    assert_abs_diff_eq!(scheduled[0].samples[0], 0.5, epsilon = 1e-3);
    assert_abs_diff_eq!(scheduled[0].samples[1], -0.5, epsilon = 1e-3);
}

#[test]
fn overflow_drops_oldest_down_to_half() {
    let output = StubOutput::new(24_000);
    let playback = engine(&output, manual());
    let mut rx = playback.subscribe_events();
    playback.initialize(24_000).expect("initialize");

    let mut first_overflow_len = None;
    for _ in 0..150 {
        playback.add_audio_chunk(&chunk(24_000, 0.02)).expect("add chunk");
        assert!(playback.queue_len() <= 100);
        if first_overflow_len.is_none() && playback.diagnostics_snapshot().overflow_events > 0 {
            first_overflow_len = Some(playback.queue_len());
        }
    }

    // The first chunk went straight to the device; 100 more filled the queue.
    assert_eq!(first_overflow_len, Some(50));
    let stats = playback.diagnostics_snapshot();
    assert_eq!(stats.chunks_accepted, 150);
    assert_eq!(stats.overflow_events, 1);
    assert_eq!(stats.chunks_dropped, 51);
    assert_eq!(playback.queue_len(), 98);

    let overflows: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, AudioEvent::QueueOverflow { .. }))
        .collect();
    assert_eq!(
        overflows,
        vec![AudioEvent::QueueOverflow {
            dropped: 51,
            retained: 50
        }]
    );
}

#[test]
fn schedule_is_monotonic_without_gaps() {
    let output = StubOutput::new(48_000);
    let playback = engine(&output, manual());
    playback.initialize(16_000).expect("initialize");

    // Feed faster than real time, ticking and advancing the clock in between.
    for (i, secs) in [0.02, 0.04, 0.06, 0.03, 0.05, 0.01, 0.08, 0.02].iter().enumerate() {
        playback.add_audio_chunk(&chunk(16_000, *secs)).expect("add chunk");
        if i % 2 == 1 {
            playback.tick();
            output.advance(0.01);
        }
    }
    playback.tick();

    let scheduled = output.scheduled();
    assert_eq!(scheduled.len(), 8);
    for pair in scheduled.windows(2) {
        assert!(pair[1].start_time >= pair[0].start_time);
        assert_abs_diff_eq!(pair[1].start_time, pair[0].end_time(), epsilon = 1e-9);
    }
}

#[test]
fn stalled_device_clock_is_not_scheduled_into_the_past() {
    let output = StubOutput::new(24_000);
    let playback = engine(&output, manual());
    playback.initialize(24_000).expect("initialize");

    playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");
    output.advance(0.5);
    playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");
    playback.tick();

    let scheduled = output.scheduled();
    assert_abs_diff_eq!(scheduled[1].start_time, 0.5, epsilon = 1e-9);
}

#[test]
fn malformed_chunks_are_dropped_without_disturbing_timeline() {
    let output = StubOutput::new(24_000);
    let playback = engine(&output, manual());
    let mut rx = playback.subscribe_events();
    playback.initialize(24_000).expect("initialize");

    playback
        .add_base64_audio_chunk(&encode_base64(&chunk(24_000, 0.1)))
        .expect("valid chunk");
    let planned = playback.next_start_time().expect("timeline active");

    let err = playback.add_base64_audio_chunk("@@ definitely not base64 @@").unwrap_err();
    assert!(matches!(err, BridgeError::MalformedChunk(_)));
    // Three bytes: a dangling half sample.
    let err = playback.add_base64_audio_chunk("AQD/").unwrap_err();
    assert!(matches!(err, BridgeError::MalformedChunk(_)));
    let err = playback.add_pcm_bytes(&[1, 2, 3]).unwrap_err();
    assert!(matches!(err, BridgeError::MalformedChunk(_)));

    assert_eq!(playback.next_start_time(), Some(planned));
    assert_eq!(playback.status(), PlaybackStatus::Playing);
    assert_eq!(playback.diagnostics_snapshot().chunks_rejected, 3);

    playback
        .add_base64_audio_chunk(&encode_base64(&chunk(24_000, 0.1)))
        .expect("valid chunk");
    playback.tick();
    let scheduled = output.scheduled();
    assert_eq!(scheduled.len(), 2);
    assert_abs_diff_eq!(scheduled[1].start_time, planned, epsilon = 1e-9);

    let rejected = drain(&mut rx)
        .into_iter()
        .filter(|e| matches!(e, AudioEvent::ChunkRejected { .. }))
        .count();
    assert_eq!(rejected, 3);
}

#[test]
fn ready_and_playing_alternate_with_traffic() {
    let output = StubOutput::new(24_000);
    let playback = engine(&output, manual());
    let mut rx = playback.subscribe_events();
    playback.initialize(24_000).expect("initialize");
    assert_eq!(playback.status(), PlaybackStatus::Ready);

    playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");
    assert_eq!(playback.status(), PlaybackStatus::Playing);
    assert_eq!(playback.tick(), PlaybackStatus::Ready);

    output.set_time(5.0);
    playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");
    assert_eq!(playback.status(), PlaybackStatus::Playing);

    // A fresh burst is anchored at the device's current time.
    let scheduled = output.scheduled();
    assert_abs_diff_eq!(scheduled[1].start_time, 5.0, epsilon = 1e-9);

    assert_eq!(
        statuses(&drain(&mut rx)),
        vec![
            PlaybackStatus::Ready,
            PlaybackStatus::Playing,
            PlaybackStatus::Ready,
            PlaybackStatus::Playing,
        ]
    );
}

#[test]
fn new_burst_waits_for_audio_still_playing() {
    let output = StubOutput::new(24_000);
    let config = PlaybackConfig {
        idle_grace_ms: 100,
        ..manual()
    };
    let playback = engine(&output, config);
    playback.initialize(24_000).expect("initialize");

    // A fast provider delivers a full second of speech, then pauses.
    playback.add_audio_chunk(&chunk(24_000, 1.0)).expect("add chunk");
    thread::sleep(Duration::from_millis(150));
    assert_eq!(playback.tick(), PlaybackStatus::Ready);

    // The next burst arrives while the first is still on the device.
    output.advance(0.2);
    playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");
    assert_eq!(playback.status(), PlaybackStatus::Playing);

    let scheduled = output.scheduled();
    assert_eq!(scheduled.len(), 2);
    assert!(scheduled[1].start_time >= scheduled[0].end_time() - 1e-9);
    assert_abs_diff_eq!(scheduled[1].start_time, 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(playback.next_start_time().unwrap(), 1.1, epsilon = 1e-9);
}

#[test]
fn timer_mode_returns_to_ready_on_its_own() {
    let output = StubOutput::new(24_000);
    let config = PlaybackConfig {
        idle_grace_ms: 20,
        ..PlaybackConfig::default()
    };
    let playback = engine(&output, config);
    playback.initialize(24_000).expect("initialize");

    playback.add_audio_chunk(&chunk(24_000, 0.05)).expect("add chunk");
    playback.add_audio_chunk(&chunk(24_000, 0.05)).expect("add chunk");

    assert!(wait_for(Duration::from_secs(2), || output.scheduled().len() == 2));
    assert!(wait_for(Duration::from_secs(2), || {
        playback.status() == PlaybackStatus::Ready
    }));
    assert_eq!(playback.queue_len(), 0);

    playback.add_audio_chunk(&chunk(24_000, 0.05)).expect("add chunk");
    assert!(wait_for(Duration::from_secs(2), || {
        playback.status() == PlaybackStatus::Ready
    }));
    assert_eq!(output.scheduled().len(), 3);

    playback.stop();
    assert_eq!(playback.status(), PlaybackStatus::Stopped);
}

#[test]
fn clear_queue_discards_pending_and_restarts_timeline() {
    let output = StubOutput::new(24_000);
    let playback = engine(&output, manual());
    playback.initialize(24_000).expect("initialize");

    playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");
    playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");
    playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");
    assert_eq!(playback.queue_len(), 2);

    playback.clear_queue();
    assert_eq!(playback.queue_len(), 0);
    assert_eq!(playback.next_start_time(), None);
    assert_eq!(playback.status(), PlaybackStatus::Playing);

    output.advance(0.05);
    playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");
    playback.tick();

    let scheduled = output.scheduled();
    assert_eq!(scheduled.len(), 2);
    assert_abs_diff_eq!(scheduled[1].start_time, 0.05, epsilon = 1e-9);
}

#[test]
fn empty_chunk_is_ignored() {
    let output = StubOutput::new(24_000);
    let playback = engine(&output, manual());
    playback.initialize(24_000).expect("initialize");

    playback.add_audio_chunk(&[]).expect("empty chunk");
    playback.add_base64_audio_chunk("").expect("empty base64");
    assert_eq!(playback.status(), PlaybackStatus::Ready);
    assert!(output.scheduled().is_empty());
}

#[test]
fn volume_is_clamped_and_applied() {
    let output = StubOutput::new(24_000);
    let playback = engine(&output, manual());

    playback.set_volume(0.5);
    playback.initialize(24_000).expect("initialize");
    assert_abs_diff_eq!(output.gain(), 0.5);

    playback.set_volume(1.7);
    assert_abs_diff_eq!(playback.volume(), 1.0);
    assert_abs_diff_eq!(output.gain(), 1.0);

    playback.set_volume(-3.0);
    assert_abs_diff_eq!(playback.volume(), 0.0);
    assert_abs_diff_eq!(output.gain(), 0.0);

    playback.set_volume(f32::NAN);
    assert_abs_diff_eq!(playback.volume(), 0.0);

    playback.set_volume(0.25);
    assert_abs_diff_eq!(output.gain(), 0.25);
}

#[test]
fn chunks_before_initialize_are_refused() {
    let output = StubOutput::new(24_000);
    let playback = engine(&output, manual());

    let err = playback.add_audio_chunk(&chunk(24_000, 0.1)).unwrap_err();
    assert!(matches!(err, BridgeError::NotInitialized));
    assert_eq!(playback.tick(), PlaybackStatus::Uninitialized);
    assert!(output.scheduled().is_empty());
}

#[test]
fn failed_initialize_can_be_retried() {
    let output = StubOutput::new(24_000);
    output.fail_with(Some(StubFailure::DeviceUnavailable));
    let playback = engine(&output, manual());

    let err = playback.initialize(24_000).unwrap_err();
    assert!(matches!(err, BridgeError::DeviceUnavailable(_)));
    assert_eq!(playback.status(), PlaybackStatus::Uninitialized);
    assert_eq!(output.open_sessions(), 0);

    output.fail_with(None);
    playback.initialize(24_000).expect("retry");
    assert_eq!(playback.status(), PlaybackStatus::Ready);
    assert_eq!(output.open_sessions(), 1);
}

#[test]
fn zero_rate_output_device_is_refused() {
    let output = StubOutput::new(0);
    let playback = engine(&output, PlaybackConfig::default());

    let err = playback.initialize(24_000).unwrap_err();
    assert!(matches!(err, BridgeError::AudioStream(_)));
    assert_eq!(playback.status(), PlaybackStatus::Uninitialized);
    assert_eq!(playback.device_sample_rate(), None);
    assert_eq!(output.open_sessions(), 0);
    assert!(matches!(
        playback.add_audio_chunk(&chunk(24_000, 0.1)),
        Err(BridgeError::NotInitialized)
    ));
}

#[test]
fn second_initialize_is_ignored() {
    let output = StubOutput::new(48_000);
    let playback = engine(&output, manual());

    playback.initialize(24_000).expect("initialize");
    playback.initialize(16_000).expect("second initialize is a no-op");
    assert_eq!(playback.source_sample_rate(), Some(24_000));
    assert_eq!(output.open_sessions(), 1);

    let err = playback.initialize(0).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidConfig(_)));
}

#[test]
fn lost_device_falls_back_to_uninitialized() {
    let output = StubOutput::new(24_000);
    let playback = engine(&output, manual());
    let mut rx = playback.subscribe_events();
    playback.initialize(24_000).expect("initialize");
    playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");

    output.disconnect("speaker unplugged");
    let err = playback.add_audio_chunk(&chunk(24_000, 0.1)).unwrap_err();
    assert!(matches!(err, BridgeError::DeviceUnavailable(_)));
    assert_eq!(playback.status(), PlaybackStatus::Uninitialized);
    assert_eq!(output.open_sessions(), 0);

    let events = drain(&mut rx);
    assert!(events.contains(&AudioEvent::DeviceLost {
        direction: Direction::Playback,
        detail: "speaker unplugged".into()
    }));
    assert_eq!(
        statuses(&events).last(),
        Some(&PlaybackStatus::Uninitialized)
    );

    playback.initialize(24_000).expect("reinitialize");
    playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");
    assert_eq!(playback.status(), PlaybackStatus::Playing);
}

#[test]
fn stop_is_terminal_and_idempotent() {
    let output = StubOutput::new(24_000);
    let playback = engine(&output, manual());
    let mut rx = playback.subscribe_events();
    playback.initialize(24_000).expect("initialize");
    for _ in 0..4 {
        playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");
    }

    playback.stop();
    playback.stop();

    assert_eq!(playback.status(), PlaybackStatus::Stopped);
    assert_eq!(playback.queue_len(), 0);
    assert_eq!(playback.next_start_time(), None);
    assert_eq!(output.open_sessions(), 0);

    assert!(matches!(
        playback.add_audio_chunk(&chunk(24_000, 0.1)),
        Err(BridgeError::Stopped)
    ));
    assert!(matches!(
        playback.add_base64_audio_chunk(&encode_base64(&[1, 2, 3])),
        Err(BridgeError::Stopped)
    ));
    assert!(matches!(playback.initialize(24_000), Err(BridgeError::Stopped)));
    assert_eq!(playback.tick(), PlaybackStatus::Stopped);

    let stopped = statuses(&drain(&mut rx))
        .into_iter()
        .filter(|s| *s == PlaybackStatus::Stopped)
        .count();
    assert_eq!(stopped, 1);
}

#[test]
fn timer_engine_stops_cleanly_on_drop() {
    let output = StubOutput::new(24_000);
    {
        let playback = engine(&output, PlaybackConfig::default());
        playback.initialize(24_000).expect("initialize");
        playback.add_audio_chunk(&chunk(24_000, 0.1)).expect("add chunk");
    }
    assert_eq!(output.open_sessions(), 0);
}
