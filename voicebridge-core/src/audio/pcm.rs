//! f32 ↔ PCM16 quantization and the raw little-endian byte layout.
//!
//! The mapping is asymmetric to match two's-complement `i16`: negative samples
//! scale by 32768, non-negative samples by 32767. Both directions are pure and
//! deterministic.

use crate::error::{BridgeError, Result};

const NEG_SCALE: f32 = 32768.0;
const POS_SCALE: f32 = 32767.0;

/// Quantize normalized f32 samples to PCM16.
///
/// Each sample is clamped to [-1.0, 1.0] before mapping. NaN maps to 0.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples.iter().map(|&s| quantize(s)).collect()
}

#[inline]
fn quantize(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    let scaled = if s < 0.0 { s * NEG_SCALE } else { s * POS_SCALE };
    scaled.round() as i16
}

/// Expand PCM16 samples back to normalized f32.
pub fn pcm16_to_float(frame: &[i16]) -> Vec<f32> {
    frame
        .iter()
        .map(|&s| {
            if s < 0 {
                s as f32 / NEG_SCALE
            } else {
                s as f32 / POS_SCALE
            }
        })
        .collect()
}

/// Serialize a frame as little-endian 16-bit words.
pub fn pcm16_to_le_bytes(frame: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frame.len() * 2);
    for sample in frame {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Parse little-endian 16-bit words.
///
/// # Errors
/// `BridgeError::MalformedChunk` when `bytes` has an odd length.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Result<Vec<i16>> {
    if bytes.len() % 2 != 0 {
        return Err(BridgeError::MalformedChunk(format!(
            "PCM16 payload has odd byte length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}
