//! Sequence masks built from per-item lengths.
//!
//! All masks are float tensors with 1.0 at valid positions and 0.0 at
//! padding, shaped `[B, 1, T]` so they broadcast over the channel axis.

use candle_core::{DType, Device, Tensor};

use crate::{Error, Result};

/// Fail fast when a per-item length exceeds the allocated time dimension.
pub fn validate_lengths(lengths: &[usize], max_len: usize) -> Result<()> {
    for (item, &length) in lengths.iter().enumerate() {
        if length > max_len {
            return Err(Error::Bounds {
                item,
                length,
                max: max_len,
            });
        }
    }
    Ok(())
}

/// Build a `[B, T]` mask with `mask[b, t] = t < lengths[b]`.
pub fn sequence_mask(
    lengths: &[usize],
    max_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    validate_lengths(lengths, max_len)?;
    let lengths: Vec<u32> = lengths.iter().map(|&l| l as u32).collect();
    let lengths = Tensor::new(lengths.as_slice(), device)?;
    let positions = Tensor::arange(0u32, max_len as u32, device)?.unsqueeze(0)?;
    let mask = positions.broadcast_lt(&lengths.unsqueeze(1)?)?;
    Ok(mask.to_dtype(dtype)?)
}

/// Build a `[B, 1, T]` time-validity mask.
pub fn time_mask(lengths: &[usize], max_len: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    Ok(sequence_mask(lengths, max_len, dtype, device)?.unsqueeze(1)?)
}

/// Outer product of a symbol mask `[B, 1, S]` and a frame mask `[B, 1, T]`,
/// giving the `[B, S, T]` validity mask of an alignment.
pub fn alignment_mask(x_mask: &Tensor, y_mask: &Tensor) -> candle_core::Result<Tensor> {
    let x = x_mask.squeeze(1)?.unsqueeze(2)?; // [B, S, 1]
    let y = y_mask.squeeze(1)?.unsqueeze(1)?; // [B, 1, T]
    x.broadcast_mul(&y)
}

/// Recover per-item lengths from a `[B, 1, T]` mask.
pub fn mask_lengths(mask: &Tensor) -> candle_core::Result<Vec<usize>> {
    let sums: Vec<f32> = mask
        .to_dtype(DType::F32)?
        .sum((1, 2))?
        .to_vec1()?;
    Ok(sums.into_iter().map(|s| s.round() as usize).collect())
}

/// Zero out padded positions. `mask` broadcasts against `xs`.
pub fn apply_mask(xs: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
    xs.broadcast_mul(mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_mask_values() {
        let mask = sequence_mask(&[2, 4, 0], 4, DType::F32, &Device::Cpu).unwrap();
        let vals: Vec<Vec<f32>> = mask.to_vec2().unwrap();
        assert_eq!(vals[0], vec![1.0, 1.0, 0.0, 0.0]);
        assert_eq!(vals[1], vec![1.0, 1.0, 1.0, 1.0]);
        assert_eq!(vals[2], vec![0.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_length_beyond_dimension_rejected() {
        let err = time_mask(&[3, 6], 5, DType::F32, &Device::Cpu).unwrap_err();
        assert!(matches!(
            err,
            Error::Bounds {
                item: 1,
                length: 6,
                max: 5
            }
        ));
    }

    #[test]
    fn test_mask_lengths_roundtrip() {
        let mask = time_mask(&[3, 1], 5, DType::F32, &Device::Cpu).unwrap();
        assert_eq!(mask.dims(), &[2, 1, 5]);
        assert_eq!(mask_lengths(&mask).unwrap(), vec![3, 1]);
    }

    #[test]
    fn test_masking_idempotent() {
        let dev = Device::Cpu;
        let mask = time_mask(&[3, 5], 5, DType::F32, &dev).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 4, 5), &dev).unwrap();
        let once = apply_mask(&xs, &mask).unwrap();
        let twice = apply_mask(&once, &mask).unwrap();
        let diff: f32 = (&once - &twice)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(diff, 0.0);
        // padding really is zero
        let tail: f32 = once
            .narrow(0, 0, 1)
            .unwrap()
            .narrow(2, 3, 2)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(tail, 0.0);
    }

    #[test]
    fn test_alignment_mask_shape() {
        let dev = Device::Cpu;
        let x_mask = time_mask(&[2, 3], 3, DType::F32, &dev).unwrap();
        let y_mask = time_mask(&[4, 5], 5, DType::F32, &dev).unwrap();
        let mask = alignment_mask(&x_mask, &y_mask).unwrap();
        assert_eq!(mask.dims(), &[2, 3, 5]);
        let total: f32 = mask.sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(total, (2 * 4 + 3 * 5) as f32);
    }
}
