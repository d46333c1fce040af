//! Linear-interpolation sample-rate conversion.
//!
//! ## Fidelity
//!
//! There is no anti-aliasing filter. Downsampling wideband material will alias;
//! voice-band speech (the only traffic through this crate) is unaffected in
//! practice. The pipeline's latency budget is tuned around this converter being
//! stateless and block-local, so it is kept as-is rather than swapped for a
//! band-limited design.
//!
//! Each call is independent: blocks are not stitched across calls, so a
//! fractional phase is lost at every chunk boundary.

use std::borrow::Cow;

/// Resample one mono block from `source_rate` to `target_rate`.
///
/// Equal rates return the input borrowed, untouched. Empty input or a zero
/// rate yields an empty buffer.
///
/// Output length is `round(len * target_rate / source_rate)`. Output sample `i`
/// interpolates between input `floor(i * ratio)` and the next index (clamped
/// to the last sample) by the fractional part.
pub fn resample(samples: &[f32], source_rate: u32, target_rate: u32) -> Cow<'_, [f32]> {
    if source_rate == target_rate {
        return Cow::Borrowed(samples);
    }
    if samples.is_empty() || source_rate == 0 || target_rate == 0 {
        return Cow::Owned(Vec::new());
    }

    let ratio = source_rate as f64 / target_rate as f64;
    let out_len = output_len(samples.len(), source_rate, target_rate);
    let last = samples.len() - 1;

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src = i as f64 * ratio;
        let lo = (src.floor() as usize).min(last);
        let hi = (lo + 1).min(last);
        let frac = (src - lo as f64) as f32;
        out.push(samples[lo] + (samples[hi] - samples[lo]) * frac);
    }
    Cow::Owned(out)
}

/// Number of samples `resample` produces for `len` input samples.
pub fn output_len(len: usize, source_rate: u32, target_rate: u32) -> usize {
    if source_rate == target_rate {
        return len;
    }
    if len == 0 || source_rate == 0 || target_rate == 0 {
        return 0;
    }
    let ratio = source_rate as f64 / target_rate as f64;
    (len as f64 / ratio).round() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_identity() {
        let samples: Vec<f32> = (0..480).map(|i| i as f32 * 0.001).collect();
        let out = resample(&samples, 16_000, 16_000);
        assert!(matches!(out, Cow::Borrowed(_)));
        assert_eq!(&*out, &samples[..]);
    }

    #[test]
    fn ratio_48k_to_16k_length() {
        let input = vec![0.0f32; 1000];
        let out = resample(&input, 48_000, 16_000);
        assert_eq!(out.len(), 333);
    }

    #[test]
    fn upsample_24k_to_48k_doubles_length() {
        let input = vec![0.25f32; 480];
        let out = resample(&input, 24_000, 48_000);
        assert_eq!(out.len(), 960);
        assert!(out.iter().all(|&s| (s - 0.25).abs() < 1e-6));
    }

    #[test]
    fn interpolates_between_neighbours() {
        // 2x upsample of a ramp lands halfway between input points.
        let out = resample(&[0.0, 1.0, 2.0], 1, 2);
        assert_eq!(out.len(), 6);
        assert_eq!(&out[..5], &[0.0, 0.5, 1.0, 1.5, 2.0]);
        // Upper index clamps to the last sample.
        assert_eq!(out[5], 2.0);
    }

    #[test]
    fn empty_input_is_empty_output() {
        assert!(resample(&[], 48_000, 16_000).is_empty());
        assert!(resample(&[], 16_000, 48_000).is_empty());
    }

    #[test]
    fn zero_rate_does_not_divide_by_zero() {
        assert!(resample(&[0.1, 0.2], 0, 16_000).is_empty());
        assert!(resample(&[0.1, 0.2], 16_000, 0).is_empty());
    }

    #[test]
    fn single_sample_input() {
        let out = resample(&[0.7], 16_000, 48_000);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|&s| s == 0.7));
    }

    #[test]
    fn length_matches_rate_ratio_for_common_pairs() {
        for &(from, to) in &[(44_100u32, 24_000u32), (48_000, 24_000), (16_000, 44_100)] {
            for len in [1usize, 127, 4096] {
                let got = resample(&vec![0.0; len], from, to).len() as f64;
                let want = len as f64 * to as f64 / from as f64;
                assert!((got - want.round()).abs() <= 1.0, "{from}->{to} len={len}");
            }
        }
    }
}
