//! Per-frame capture processing, run inside the device callback.
//!
//! ```text
//! interleaved f32 @ native rate
//!   → deinterleave → merge_to_mono → resample(native → target)
//!   → float_to_pcm16 → encode_base64 → sink(&EncodedFrame)
//! ```

use crate::audio::{deinterleave_into, encode_base64, float_to_pcm16, merge_to_mono, resample};
use crate::device::StreamFormat;

/// One processed capture frame, ready for the network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    /// Zero-based frame index within the capture session.
    pub seq: u64,
    /// Mono PCM16 at `sample_rate`.
    pub pcm: Vec<i16>,
    /// `pcm` as base64 little-endian bytes.
    pub base64: String,
    pub sample_rate: u32,
}

impl EncodedFrame {
    pub fn duration_secs(&self) -> f64 {
        self.pcm.len() as f64 / self.sample_rate as f64
    }
}

/// Receiver of processed capture frames.
///
/// Called synchronously on the device thread once per frame. Must not block:
/// a slow sink stalls the device callback and the platform will drop input.
pub trait CaptureSink: Send + 'static {
    fn on_frame(&mut self, frame: &EncodedFrame);
}

impl<F> CaptureSink for F
where
    F: FnMut(&EncodedFrame) + Send + 'static,
{
    fn on_frame(&mut self, frame: &EncodedFrame) {
        self(frame)
    }
}

pub(crate) struct FrameProcessor {
    format: StreamFormat,
    target_rate: u32,
    planar: Vec<Vec<f32>>,
    seq: u64,
    sink: Box<dyn CaptureSink>,
}

impl FrameProcessor {
    pub(crate) fn new(format: StreamFormat, target_rate: u32, sink: Box<dyn CaptureSink>) -> Self {
        Self {
            format,
            target_rate,
            planar: Vec::with_capacity(format.channels as usize),
            seq: 0,
            sink,
        }
    }

    /// Process one device buffer. Returns the number of PCM16 samples emitted.
    pub(crate) fn process(&mut self, interleaved: &[f32]) -> usize {
        deinterleave_into(interleaved, self.format.channels as usize, &mut self.planar);
        let mono = merge_to_mono(&self.planar);
        let resampled = resample(&mono, self.format.sample_rate, self.target_rate);
        if resampled.is_empty() {
            return 0;
        }

        let pcm = float_to_pcm16(&resampled);
        let frame = EncodedFrame {
            seq: self.seq,
            base64: encode_base64(&pcm),
            pcm,
            sample_rate: self.target_rate,
        };
        self.seq += 1;
        self.sink.on_frame(&frame);
        frame.pcm.len()
    }
}
