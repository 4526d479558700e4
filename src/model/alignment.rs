//! Monotonic alignment search (MAS).
//!
//! Given a `[B, S, T]` matrix of per-(symbol, frame) log-likelihoods, find for
//! every batch item the hard monotonic alignment that maximises the summed
//! log-likelihood. Each valid frame is assigned to exactly one symbol, the
//! symbol index never decreases along the frame axis and advances by at most
//! one per frame.
//!
//! The search itself is a plain dynamic program over an `S x T` table. It
//! runs on host memory, one thread per batch item, and never participates in
//! gradient flow.

use candle_core::{D, DType, Device, Tensor};

use crate::Result;

/// Gaussian log-likelihood of every frame latent under every symbol prior.
///
/// - `z_p`: `[B, C, T]` frame latents
/// - `m_p`, `logs_p`: `[B, C, S]` prior mean and log-std per symbol
///
/// Returns `[B, S, T]` with
/// `sum_c -0.5 ln(2pi) - logs_p - 0.5 (z_p - m_p)^2 exp(-2 logs_p)`,
/// expanded into four matmul-friendly terms.
pub fn log_likelihood(z_p: &Tensor, m_p: &Tensor, logs_p: &Tensor) -> candle_core::Result<Tensor> {
    let o_scale = logs_p.affine(-2.0, 0.0)?.exp()?; // [B, C, S]
    let half_log_2pi = 0.5 * (2.0 * std::f64::consts::PI).ln();

    // [B, S, 1]
    let constant = logs_p
        .affine(-1.0, -half_log_2pi)?
        .sum_keepdim(1)?
        .transpose(1, 2)?;
    // [B, S, T]
    let quadratic = o_scale
        .transpose(1, 2)?
        .contiguous()?
        .matmul(&z_p.sqr()?.affine(-0.5, 0.0)?.contiguous()?)?;
    // [B, S, T]
    let cross = (m_p * &o_scale)?
        .transpose(1, 2)?
        .contiguous()?
        .matmul(&z_p.contiguous()?)?;
    // [B, S, 1]
    let mean_term = (m_p.sqr()? * &o_scale)?
        .affine(-0.5, 0.0)?
        .sum_keepdim(1)?
        .transpose(1, 2)?;

    (quadratic + cross)?
        .broadcast_add(&constant)?
        .broadcast_add(&mean_term)
}

/// Run MAS over a batch.
///
/// - `log_likelihood`: `[B, S, T]`
/// - `mask`: `[B, S, T]` validity mask (outer product of symbol and frame masks)
///
/// Returns a `[B, S, T]` 0/1 alignment on the input's device and dtype.
/// Items whose symbol or frame count is zero get an all-zero alignment. When
/// an item has more symbols than frames the alignment is best-effort: the
/// first `T` symbols get one frame each and the rest get none.
pub fn maximum_path(log_likelihood: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let (batch, num_symbols, num_frames) = log_likelihood.dims3()?;
    let device = log_likelihood.device().clone();
    let dtype = log_likelihood.dtype();

    let values: Vec<Vec<Vec<f32>>> = log_likelihood
        .detach()
        .to_dtype(DType::F32)?
        .to_device(&Device::Cpu)?
        .to_vec3()?;
    let valid: Vec<Vec<Vec<f32>>> = mask
        .to_dtype(DType::F32)?
        .to_device(&Device::Cpu)?
        .to_vec3()?;

    let extents: Vec<(usize, usize)> = valid.iter().map(|item| valid_extent(item)).collect();
    for (item, &(symbols, frames)) in extents.iter().enumerate() {
        if symbols > frames && frames > 0 {
            tracing::warn!(
                item,
                symbols,
                frames,
                "more symbols than frames, alignment is best-effort"
            );
        }
    }

    let assignments: Vec<Vec<usize>> = std::thread::scope(|scope| {
        let handles: Vec<_> = values
            .iter()
            .zip(extents.iter())
            .map(|(item, &(symbols, frames))| scope.spawn(move || search(item, symbols, frames)))
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect()
    });

    let mut path = vec![0f32; batch * num_symbols * num_frames];
    for (b, assignment) in assignments.iter().enumerate() {
        let base = b * num_symbols * num_frames;
        for (t, &s) in assignment.iter().enumerate() {
            path[base + s * num_frames + t] = 1.0;
        }
    }

    Ok(Tensor::from_vec(path, (batch, num_symbols, num_frames), &Device::Cpu)?
        .to_device(&device)?
        .to_dtype(dtype)?)
}

/// Per-symbol durations (frame counts) of an alignment: `[B, S, T] -> [B, S]`.
pub fn durations(path: &Tensor) -> candle_core::Result<Tensor> {
    path.sum(D::Minus1)
}

/// Number of valid symbols and frames of one `[S, T]` mask.
fn valid_extent(mask: &[Vec<f32>]) -> (usize, usize) {
    let symbols = mask
        .iter()
        .filter(|row| row.iter().any(|&v| v > 0.5))
        .count();
    let frames = mask
        .first()
        .map(|row| row.len())
        .unwrap_or(0);
    let frames = (0..frames)
        .filter(|&t| mask.iter().any(|row| row[t] > 0.5))
        .count();
    (symbols, frames)
}

/// Dynamic program plus backtrack for one item. Returns the symbol index
/// assigned to each of the first `num_frames` frames.
///
/// Ties between staying on a symbol and advancing prefer staying.
fn search(values: &[Vec<f32>], num_symbols: usize, num_frames: usize) -> Vec<usize> {
    if num_symbols == 0 || num_frames == 0 {
        return Vec::new();
    }
    let idx = |s: usize, t: usize| s * num_frames + t;

    let mut score = vec![f32::NEG_INFINITY; num_symbols * num_frames];
    score[0] = values[0][0];
    for t in 1..num_frames {
        for s in 0..num_symbols.min(t + 1) {
            let stay = score[idx(s, t - 1)];
            let advance = if s > 0 {
                score[idx(s - 1, t - 1)]
            } else {
                f32::NEG_INFINITY
            };
            let best = if advance > stay { advance } else { stay };
            score[idx(s, t)] = values[s][t] + best;
        }
    }

    let mut assignment = vec![0usize; num_frames];
    let mut s = num_symbols.min(num_frames) - 1;
    for t in (0..num_frames).rev() {
        assignment[t] = s;
        if t == 0 || s == 0 {
            continue;
        }
        // s == t: staying would leave more symbols than remaining frames
        if s == t || score[idx(s - 1, t - 1)] > score[idx(s, t - 1)] {
            s -= 1;
        }
    }
    assignment
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mask::{alignment_mask, time_mask};

    fn run(values: Vec<f32>, s: usize, t: usize) -> Vec<Vec<f32>> {
        let dev = Device::Cpu;
        let logp = Tensor::from_vec(values, (1, s, t), &dev).unwrap();
        let mask = Tensor::ones((1, s, t), DType::F32, &dev).unwrap();
        maximum_path(&logp, &mask)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2()
            .unwrap()
    }

    fn assert_monotonic(path: &[Vec<f32>]) {
        let frames = path[0].len();
        let mut prev = 0usize;
        for t in 0..frames {
            let hits: Vec<usize> = (0..path.len()).filter(|&s| path[s][t] == 1.0).collect();
            assert_eq!(hits.len(), 1, "frame {t} must map to one symbol");
            let s = hits[0];
            if t == 0 {
                assert_eq!(s, 0);
            } else {
                assert!(s == prev || s == prev + 1, "jump at frame {t}: {prev} -> {s}");
            }
            prev = s;
        }
        assert_eq!(prev, path.len() - 1, "last frame must reach the last symbol");
    }

    #[test]
    fn test_follows_clear_maximum() {
        let path = run(vec![0., -10., -10., -10., 0., 0.], 2, 3);
        assert_eq!(path, vec![vec![1., 0., 0.], vec![0., 1., 1.]]);
    }

    #[test]
    fn test_ties_prefer_staying() {
        let path = run(vec![0.0; 8], 2, 4);
        assert_eq!(path, vec![vec![1., 0., 0., 0.], vec![0., 1., 1., 1.]]);
    }

    #[test]
    fn test_random_alignment_is_monotonic_and_covers() {
        let dev = Device::Cpu;
        let logp = Tensor::randn(0f32, 1.0, (1, 5, 17), &dev).unwrap();
        let mask = Tensor::ones((1, 5, 17), DType::F32, &dev).unwrap();
        let path: Vec<Vec<f32>> = maximum_path(&logp, &mask)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_monotonic(&path);
        for row in &path {
            assert!(row.iter().sum::<f32>() >= 1.0, "every symbol gets a frame");
        }
    }

    #[test]
    fn test_padded_batch_respects_masks() {
        let dev = Device::Cpu;
        let x_mask = time_mask(&[3, 2], 3, DType::F32, &dev).unwrap();
        let y_mask = time_mask(&[7, 4], 7, DType::F32, &dev).unwrap();
        let mask = alignment_mask(&x_mask, &y_mask).unwrap();
        let logp = Tensor::randn(0f32, 1.0, (2, 3, 7), &dev).unwrap();
        let path = maximum_path(&logp, &mask).unwrap();

        let durs: Vec<Vec<f32>> = durations(&path).unwrap().to_vec2().unwrap();
        assert_eq!(durs[0].iter().sum::<f32>(), 7.0);
        assert_eq!(durs[1].iter().sum::<f32>(), 4.0);
        assert_eq!(durs[1][2], 0.0);

        let outside: f32 = (path.clone() - (&path * &mask).unwrap())
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(outside, 0.0);
    }

    #[test]
    fn test_zero_length_item_gets_empty_alignment() {
        let dev = Device::Cpu;
        let x_mask = time_mask(&[2, 0], 2, DType::F32, &dev).unwrap();
        let y_mask = time_mask(&[4, 0], 4, DType::F32, &dev).unwrap();
        let mask = alignment_mask(&x_mask, &y_mask).unwrap();
        let logp = Tensor::zeros((2, 2, 4), DType::F32, &dev).unwrap();
        let path = maximum_path(&logp, &mask).unwrap();
        let durs: Vec<Vec<f32>> = durations(&path).unwrap().to_vec2().unwrap();
        assert_eq!(durs[0].iter().sum::<f32>(), 4.0);
        assert_eq!(durs[1], vec![0.0, 0.0]);
    }

    #[test]
    fn test_more_symbols_than_frames() {
        let path = run(vec![0.0; 12], 4, 3);
        let counts: Vec<f32> = path.iter().map(|row| row.iter().sum()).collect();
        assert_eq!(counts, vec![1.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_log_likelihood_matches_direct_formula() {
        let dev = Device::Cpu;
        let z_p = Tensor::randn(0f32, 1.0, (1, 3, 4), &dev).unwrap();
        let m_p = Tensor::randn(0f32, 1.0, (1, 3, 2), &dev).unwrap();
        let logs_p = Tensor::randn(0f32, 0.3, (1, 3, 2), &dev).unwrap();
        let fast: Vec<Vec<f32>> = log_likelihood(&z_p, &m_p, &logs_p)
            .unwrap()
            .squeeze(0)
            .unwrap()
            .to_vec2()
            .unwrap();

        let z: Vec<Vec<f32>> = z_p.squeeze(0).unwrap().to_vec2().unwrap();
        let m: Vec<Vec<f32>> = m_p.squeeze(0).unwrap().to_vec2().unwrap();
        let l: Vec<Vec<f32>> = logs_p.squeeze(0).unwrap().to_vec2().unwrap();
        let half_log_2pi = 0.5 * (2.0 * std::f32::consts::PI).ln();
        for s in 0..2 {
            for t in 0..4 {
                let direct: f32 = (0..3)
                    .map(|c| {
                        let diff = z[c][t] - m[c][s];
                        -half_log_2pi - l[c][s] - 0.5 * diff * diff * (-2.0 * l[c][s]).exp()
                    })
                    .sum();
                assert!((direct - fast[s][t]).abs() < 1e-4, "{direct} vs {}", fast[s][t]);
            }
        }
    }
}
