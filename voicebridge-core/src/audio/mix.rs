//! Channel layout helpers: interleaved → planar, planar → mono.

/// Average channel buffers sample-wise into one mono buffer.
///
/// A single channel is returned unchanged; no channels yields an empty buffer.
/// Channels of unequal length are averaged over the shortest one.
pub fn merge_to_mono<C: AsRef<[f32]>>(channels: &[C]) -> Vec<f32> {
    match channels {
        [] => Vec::new(),
        [only] => only.as_ref().to_vec(),
        _ => {
            let frames = channels
                .iter()
                .map(|c| c.as_ref().len())
                .min()
                .unwrap_or(0);
            let count = channels.len() as f32;
            (0..frames)
                .map(|i| channels.iter().map(|c| c.as_ref()[i]).sum::<f32>() / count)
                .collect()
        }
    }
}

/// Split interleaved frames `[L0, R0, L1, R1, ...]` into per-channel buffers,
/// reusing the allocations already held by `planar`.
///
/// A trailing partial frame is discarded.
pub fn deinterleave_into(interleaved: &[f32], channels: usize, planar: &mut Vec<Vec<f32>>) {
    let channels = channels.max(1);
    let frames = interleaved.len() / channels;

    planar.resize_with(channels, Vec::new);
    for (c, buf) in planar.iter_mut().enumerate() {
        buf.clear();
        buf.extend(interleaved.iter().skip(c).step_by(channels).take(frames));
    }
}
