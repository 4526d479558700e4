//! Random fixed-length crops of padded sequences.
//!
//! The vocoder is trained on short windows of the latent sequence; the same
//! offsets (scaled by the hop length) crop the matching waveform.

use candle_core::Tensor;
use rand::Rng;

/// Draw one start offset per item so that `offset + segment_size` stays
/// inside the item's valid length where possible.
///
/// Items shorter than `segment_size` start at 0 and are zero-padded by
/// [`slice_segments`].
pub fn sample_offsets<R: Rng + ?Sized>(
    lengths: &[usize],
    segment_size: usize,
    rng: &mut R,
) -> Vec<usize> {
    lengths
        .iter()
        .map(|&length| {
            let max_start = length.saturating_sub(segment_size);
            rng.random_range(0..=max_start)
        })
        .collect()
}

/// Gather `x[b, :, offsets[b] .. offsets[b] + segment_size]` for each item.
///
/// Windows reaching past the time axis are zero-padded on the right.
pub fn slice_segments(
    x: &Tensor,
    offsets: &[usize],
    segment_size: usize,
) -> candle_core::Result<Tensor> {
    let (batch, _, time) = x.dims3()?;
    if offsets.len() != batch {
        candle_core::bail!(
            "slice_segments: {} offsets for a batch of {batch}",
            offsets.len()
        );
    }
    let mut items = Vec::with_capacity(batch);
    for (b, &offset) in offsets.iter().enumerate() {
        let start = offset.min(time);
        let available = (time - start).min(segment_size);
        let item = x.narrow(0, b, 1)?.narrow(2, start, available)?;
        let item = if available < segment_size {
            item.pad_with_zeros(2, 0, segment_size - available)?
        } else {
            item
        };
        items.push(item);
    }
    Tensor::cat(&items, 0)
}

/// Sample offsets and slice in one step. Returns the segments and the
/// offsets used.
pub fn rand_segments<R: Rng + ?Sized>(
    x: &Tensor,
    lengths: &[usize],
    segment_size: usize,
    rng: &mut R,
) -> candle_core::Result<(Tensor, Vec<usize>)> {
    let offsets = sample_offsets(lengths, segment_size, rng);
    let segments = slice_segments(x, &offsets, segment_size)?;
    Ok((segments, offsets))
}
