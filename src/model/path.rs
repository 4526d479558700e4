//! Duration-driven expansion and per-symbol averaging.
//!
//! Both directions are prefix-sum formulations over whole batches. A symbol
//! with duration `d` covers frames `[cum[s-1], cum[s])` where `cum` is the
//! running sum of durations.

use candle_core::{D, DType, Tensor};

/// Build a hard `[B, S, T]` alignment from integer-valued durations.
///
/// - `durations`: `[B, S]` float tensor of non-negative whole numbers
/// - `mask`: `[B, S, T]` alignment validity mask
///
/// `path[b, s, t] = 1` iff `cum[b, s-1] <= t < cum[b, s]`, then masked.
pub fn generate_path(durations: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
    let (_, num_symbols, num_frames) = mask.dims3()?;
    let dtype = mask.dtype();
    let cum = durations.to_dtype(DType::F32)?.cumsum(1)?; // [B, S]
    let positions = Tensor::arange(0u32, num_frames as u32, mask.device())?
        .to_dtype(DType::F32)?
        .reshape((1, 1, num_frames))?;
    // [B, S, T]: frame t lies before the end of symbol s
    let before_end = positions
        .broadcast_lt(&cum.unsqueeze(2)?)?
        .to_dtype(dtype)?;
    let before_start = before_end
        .pad_with_zeros(1, 1, 0)?
        .narrow(1, 0, num_symbols)?;
    (before_end - before_start)? * mask
}

/// Expand per-symbol values along a hard alignment:
/// `[B, C, S] x [B, S, T] -> [B, C, T]`.
pub fn expand_with_path(values: &Tensor, path: &Tensor) -> candle_core::Result<Tensor> {
    values.contiguous()?.matmul(&path.to_dtype(values.dtype())?.contiguous()?)
}

/// Repeat each symbol's values `durations[b, s]` times along time.
///
/// `values` is `[B, C, S]`, `durations` is `[B, S]`. The output time axis is
/// the longest item's total duration; shorter items are zero-padded.
pub fn expand_by_durations(values: &Tensor, durations: &Tensor) -> candle_core::Result<Tensor> {
    let (batch, num_symbols) = durations.dims2()?;
    let totals: Vec<f32> = durations.to_dtype(DType::F32)?.sum(1)?.to_vec1()?;
    let num_frames = totals.iter().fold(0f32, |a, &b| a.max(b)).round() as usize;
    let mask = Tensor::ones((batch, num_symbols, num_frames), values.dtype(), values.device())?;
    let path = generate_path(durations, &mask)?;
    expand_with_path(values, &path)
}

/// Average frame-level values over each symbol's span, counting only nonzero
/// frames (unvoiced frames carry zero pitch).
///
/// - `values`: `[B, C, T]`
/// - `durations`: `[B, S]` whole-number durations
///
/// Returns `[B, C, S]`; a symbol with no nonzero frames averages to 0.
/// Spans reaching past `T` are clipped to the end of the signal.
pub fn average_by_durations(values: &Tensor, durations: &Tensor) -> candle_core::Result<Tensor> {
    let (batch, channels, num_frames) = values.dims3()?;
    let num_symbols = durations.dim(1)?;
    let dtype = values.dtype();
    let values = values.to_dtype(DType::F32)?;

    let ends = durations
        .to_dtype(DType::F32)?
        .cumsum(1)?
        .clamp(0f32, num_frames as f32)?;
    let starts = ends.pad_with_zeros(1, 1, 0)?.narrow(1, 0, num_symbols)?;
    let as_index = |bounds: &Tensor| -> candle_core::Result<Tensor> {
        bounds
            .round()?
            .to_dtype(DType::U32)?
            .unsqueeze(1)?
            .broadcast_as((batch, channels, num_symbols))?
            .contiguous()
    };
    let ends = as_index(&ends)?;
    let starts = as_index(&starts)?;

    let nonzero = values.ne(0f32)?.to_dtype(DType::F32)?;
    let value_cums = values.cumsum(D::Minus1)?.pad_with_zeros(D::Minus1, 1, 0)?;
    let count_cums = nonzero.cumsum(D::Minus1)?.pad_with_zeros(D::Minus1, 1, 0)?;

    let sums = (value_cums.gather(&ends, D::Minus1)? - value_cums.gather(&starts, D::Minus1)?)?;
    let counts = (count_cums.gather(&ends, D::Minus1)? - count_cums.gather(&starts, D::Minus1)?)?;

    let safe_counts = counts.maximum(1f32)?;
    let averages = (sums / safe_counts)?;
    let zeros = averages.zeros_like()?;
    counts
        .gt(0.5f32)?
        .where_cond(&averages, &zeros)?
        .to_dtype(dtype)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_expand_repeats_values() {
        let dev = Device::Cpu;
        let values = Tensor::new(&[[[5f32, 7., 2.]]], &dev).unwrap();
        let durations = Tensor::new(&[[2f32, 3., 1.]], &dev).unwrap();
        let expanded = expand_by_durations(&values, &durations).unwrap();
        let got: Vec<f32> = expanded.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vec![5., 5., 7., 7., 7., 2.]);

        let back = average_by_durations(&expanded, &durations).unwrap();
        let got: Vec<f32> = back.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vec![5., 7., 2.]);
    }

    #[test]
    fn test_generate_path_sums_to_durations() {
        let dev = Device::Cpu;
        let durations = Tensor::new(&[[1f32, 0., 3.], [2., 2., 0.]], &dev).unwrap();
        let mask = Tensor::ones((2, 3, 5), DType::F32, &dev).unwrap();
        let path = generate_path(&durations, &mask).unwrap();
        let per_symbol: Vec<Vec<f32>> = path.sum(2).unwrap().to_vec2().unwrap();
        assert_eq!(per_symbol, vec![vec![1., 0., 3.], vec![2., 2., 0.]]);
        let per_frame: Vec<Vec<f32>> = path.sum(1).unwrap().to_vec2().unwrap();
        assert_eq!(per_frame[0], vec![1., 1., 1., 1., 0.]);
        assert_eq!(per_frame[1], vec![1., 1., 1., 1., 0.]);
    }

    #[test]
    fn test_average_skips_zero_frames() {
        let dev = Device::Cpu;
        // symbol 0: [0, 4, 6] -> 5, symbol 1: [0, 0] -> 0, symbol 2: [3] -> 3
        let values = Tensor::new(&[[[0f32, 4., 6., 0., 0., 3.]]], &dev).unwrap();
        let durations = Tensor::new(&[[3f32, 2., 1.]], &dev).unwrap();
        let avg = average_by_durations(&values, &durations).unwrap();
        let got: Vec<f32> = avg.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vec![5., 0., 3.]);
    }

    #[test]
    fn test_average_zero_duration_symbol() {
        let dev = Device::Cpu;
        let values = Tensor::new(&[[[1f32, 2., 3., 4.]]], &dev).unwrap();
        let durations = Tensor::new(&[[2f32, 0., 2.]], &dev).unwrap();
        let avg = average_by_durations(&values, &durations).unwrap();
        let got: Vec<f32> = avg.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vec![1.5, 0., 3.5]);
    }

    #[test]
    fn test_expand_pads_shorter_items() {
        let dev = Device::Cpu;
        let values = Tensor::new(&[[[1f32, 2.]], [[3., 4.]]], &dev).unwrap();
        let durations = Tensor::new(&[[1f32, 1.], [2., 2.]], &dev).unwrap();
        let expanded = expand_by_durations(&values, &durations).unwrap();
        assert_eq!(expanded.dims(), &[2, 1, 4]);
        let got: Vec<Vec<f32>> = expanded.squeeze(1).unwrap().to_vec2().unwrap();
        assert_eq!(got[0], vec![1., 2., 0., 0.]);
        assert_eq!(got[1], vec![3., 3., 4., 4.]);
    }
}
