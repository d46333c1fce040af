//! Sample conversion utilities shared by capture and playback.
//!
//! Everything here is a pure function over borrowed slices: no state, no I/O,
//! safe to call from any thread (including real-time device callbacks, with
//! the caveat that most of them allocate their output).
//!
//! ```text
//! capture:  interleaved f32 → deinterleave → merge_to_mono → resample → float_to_pcm16 → encode_base64
//! playback: decode_base64 → pcm16_to_float → resample
//! ```

pub mod mix;
pub mod pcm;
pub mod resample;
pub mod transport;

pub use mix::{deinterleave_into, merge_to_mono};
pub use pcm::{float_to_pcm16, pcm16_from_le_bytes, pcm16_to_float, pcm16_to_le_bytes};
pub use resample::resample;
pub use transport::{decode_base64, encode_base64};
