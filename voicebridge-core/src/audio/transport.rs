//! Transport chunk encoding: PCM16 little-endian bytes as standard base64.
//!
//! This is lossless text transcoding of the raw words, not compression.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use super::pcm::{pcm16_from_le_bytes, pcm16_to_le_bytes};
use crate::error::{BridgeError, Result};

/// Encode a quantized frame for a text-oriented transport.
pub fn encode_base64(frame: &[i16]) -> String {
    BASE64.encode(pcm16_to_le_bytes(frame))
}

/// Decode a transport chunk back to the exact frame that produced it.
///
/// # Errors
/// `BridgeError::MalformedChunk` if the text is not valid base64 or decodes to
/// an odd number of bytes.
pub fn decode_base64(chunk: &str) -> Result<Vec<i16>> {
    let bytes = BASE64
        .decode(chunk.trim())
        .map_err(|e| BridgeError::MalformedChunk(format!("invalid base64: {e}")))?;
    pcm16_from_le_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_encoding() {
        // [1, -1] → 01 00 FF FF
        assert_eq!(encode_base64(&[1, -1]), "AQD//w==");
    }

    #[test]
    fn round_trip_is_bit_exact() {
        let frame: Vec<i16> = vec![i16::MIN, -12345, -1, 0, 1, 12345, i16::MAX];
        assert_eq!(decode_base64(&encode_base64(&frame)).unwrap(), frame);
    }

    #[test]
    fn empty_frame() {
        assert_eq!(encode_base64(&[]), "");
        assert!(decode_base64("").unwrap().is_empty());
    }

    #[test]
    fn garbage_is_malformed() {
        let err = decode_base64("not base64 at all!").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedChunk(_)));
    }

    #[test]
    fn odd_decoded_length_is_malformed() {
        // "AQID" decodes to three bytes.
        let err = decode_base64("AQID").unwrap_err();
        assert!(matches!(err, BridgeError::MalformedChunk(_)));
    }
}
