//! Manual end-to-end check of the audio pipeline on real hardware.
//!
//! ```text
//! voice_loopback --rates 24000:24000 [--seconds 10]        mic → base64 → speaker
//! voice_loopback --settings audio.json --play speech.wav   WAV streamed as network chunks
//! voice_loopback --list-devices
//! ```

#[cfg(not(feature = "audio-cpal"))]
fn main() {
    eprintln!("voice_loopback requires the 'audio-cpal' feature");
    std::process::exit(1);
}

#[cfg(feature = "audio-cpal")]
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("voicebridge_core=info,voice_loopback=info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("voice_loopback failed: {e}");
        std::process::exit(1);
    }
}

#[cfg(feature = "audio-cpal")]
fn run() -> Result<(), String> {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use tracing::info;
    use voicebridge_core::{
        audio::{encode_base64, float_to_pcm16, merge_to_mono},
        device::cpal_backend::{list_input_devices, list_output_devices},
        AudioSettings, CaptureEngine, CpalBackend, EncodedFrame, PlaybackEngine, PlaybackStatus,
        ProviderRates,
    };

    #[derive(Debug)]
    struct Args {
        settings: Option<PathBuf>,
        rates: Option<ProviderRates>,
        seconds: u64,
        play: Option<PathBuf>,
        chunk_ms: u32,
        list_devices: bool,
    }

    fn parse_rates(raw: &str) -> Result<ProviderRates, String> {
        let (input, output) = raw.split_once(':').unwrap_or((raw, raw));
        let input = input
            .parse::<u32>()
            .map_err(|e| format!("invalid input rate '{input}': {e}"))?;
        let output = output
            .parse::<u32>()
            .map_err(|e| format!("invalid output rate '{output}': {e}"))?;
        Ok(ProviderRates::new(input, output))
    }

    fn parse_args() -> Result<Args, String> {
        let mut args = Args {
            settings: None,
            rates: None,
            seconds: 10,
            play: None,
            chunk_ms: 40,
            list_devices: false,
        };
        let mut it = std::env::args().skip(1);
        while let Some(flag) = it.next() {
            let mut value = |name: &str| it.next().ok_or_else(|| format!("{name} needs a value"));
            match flag.as_str() {
                "--settings" => args.settings = Some(PathBuf::from(value("--settings")?)),
                "--rates" => args.rates = Some(parse_rates(&value("--rates")?)?),
                "--seconds" => {
                    args.seconds = value("--seconds")?
                        .parse()
                        .map_err(|e| format!("invalid --seconds: {e}"))?
                }
                "--play" => args.play = Some(PathBuf::from(value("--play")?)),
                "--chunk-ms" => {
                    args.chunk_ms = value("--chunk-ms")?
                        .parse()
                        .map_err(|e| format!("invalid --chunk-ms: {e}"))?
                }
                "--list-devices" => args.list_devices = true,
                other => return Err(format!("unknown argument: {other}")),
            }
        }
        Ok(args)
    }

    /// Read a WAV file as mono PCM16 at its own sample rate.
    fn read_wav(path: &Path) -> Result<(Vec<i16>, u32), String> {
        let mut reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
        let spec = reader.spec();
        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| e.to_string())?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| e.to_string())?
            }
        };
        let channels = spec.channels.max(1) as usize;
        let mut planar = Vec::new();
        voicebridge_core::audio::deinterleave_into(&interleaved, channels, &mut planar);
        Ok((float_to_pcm16(&merge_to_mono(&planar)), spec.sample_rate))
    }

    fn wait_until_ready(playback: &PlaybackEngine, limit: Duration) {
        let deadline = Instant::now() + limit;
        while playback.status() == PlaybackStatus::Playing && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
    }

    let args = parse_args()?;

    if args.list_devices {
        println!("inputs:");
        for d in list_input_devices() {
            println!("  {}{}", d.name, if d.is_default { " (default)" } else { "" });
        }
        println!("outputs:");
        for d in list_output_devices() {
            println!("  {}{}", d.name, if d.is_default { " (default)" } else { "" });
        }
        return Ok(());
    }

    let settings = match (&args.settings, args.rates) {
        (Some(path), _) => AudioSettings::load(path).map_err(|e| e.to_string())?,
        (None, Some(rates)) => {
            let settings = AudioSettings::new(rates);
            settings.validate().map_err(|e| e.to_string())?;
            settings
        }
        (None, None) => return Err("sample rates are required: pass --settings or --rates IN:OUT".into()),
    };

    let backend = Arc::new(CpalBackend::new());
    let playback = PlaybackEngine::new(backend.clone(), settings.playback.clone());

    if let Some(path) = &args.play {
        let (pcm, rate) = read_wav(path)?;
        playback.initialize(rate).map_err(|e| e.to_string())?;
        let chunk_len = (rate as usize * args.chunk_ms.max(1) as usize / 1000).max(1);
        info!(file = %path.display(), rate, chunks = pcm.len().div_ceil(chunk_len), "streaming WAV");

        for chunk in pcm.chunks(chunk_len) {
            if let Err(e) = playback.add_base64_audio_chunk(&encode_base64(chunk)) {
                tracing::warn!("chunk rejected: {e}");
            }
            thread::sleep(Duration::from_millis(args.chunk_ms as u64));
        }
        wait_until_ready(&playback, Duration::from_secs(5));
        playback.stop();
        info!(stats = ?playback.diagnostics_snapshot(), "playback finished");
        return Ok(());
    }

    // Microphone loopback: audio takes the same path it would through the network.
    let rate = settings.rates.input_sample_rate;
    playback.initialize(rate).map_err(|e| e.to_string())?;
    let playback = Arc::new(playback);

    let capture = CaptureEngine::new(backend, settings.capture.clone());
    info!(permission = ?capture.permission_state(), "microphone permission");

    let sink_playback = Arc::clone(&playback);
    capture
        .start(
            move |frame: &EncodedFrame| {
                if let Err(e) = sink_playback.add_base64_audio_chunk(&frame.base64) {
                    tracing::warn!("loopback chunk rejected: {e}");
                }
            },
            rate,
        )
        .map_err(|e| e.to_string())?;

    info!(seconds = args.seconds, rate, "loopback running");
    thread::sleep(Duration::from_secs(args.seconds));

    capture.stop();
    wait_until_ready(&playback, Duration::from_secs(2));
    playback.stop();

    info!(
        capture = ?capture.diagnostics_snapshot(),
        playback = ?playback.diagnostics_snapshot(),
        "loopback finished"
    );
    Ok(())
}
