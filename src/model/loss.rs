//! Training objectives.
//!
//! All functions return scalar tensors so callers can weight and sum them.

use candle_core::{Result, Tensor};

use crate::model::discriminator::Judgement;

/// KL divergence between the posterior (flowed to prior space) and the
/// aligned prior, averaged over valid frames.
///
/// - `z_p`, `logs_q`: `[B, C, T]`
/// - `m_p`, `logs_p`: `[B, C, T]` (already expanded along the alignment)
/// - `z_mask`: `[B, 1, T]`
pub fn kl_loss(
    z_p: &Tensor,
    logs_q: &Tensor,
    m_p: &Tensor,
    logs_p: &Tensor,
    z_mask: &Tensor,
) -> Result<Tensor> {
    let kl = ((logs_p - logs_q)? - 0.5)?;
    let quad = ((z_p - m_p)?.sqr()? * 0.5)?.mul(&logs_p.affine(-2.0, 0.0)?.exp()?)?;
    let kl = (kl + quad)?.broadcast_mul(z_mask)?.sum_all()?;
    let frames = z_mask.sum_all()?.maximum(1f32)?;
    kl / frames
}

/// Sum of mean absolute differences between real and generated feature
/// maps, doubled.
pub fn feature_loss(real: &[Judgement], fake: &[Judgement]) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for (r, g) in real.iter().zip(fake.iter()) {
        for (rf, gf) in r.features.iter().zip(g.features.iter()) {
            let l = (rf.detach() - gf)?.abs()?.mean_all()?;
            total = Some(match total {
                Some(t) => (t + l)?,
                None => l,
            });
        }
    }
    match total {
        Some(t) => t * 2.0,
        None => candle_core::bail!("feature_loss: no feature maps"),
    }
}

/// Least-squares GAN loss for the discriminator. Returns the total and the
/// per-sub-discriminator real/fake terms.
pub fn discriminator_loss(
    real: &[Judgement],
    fake: &[Judgement],
) -> Result<(Tensor, Vec<Tensor>, Vec<Tensor>)> {
    let mut real_losses = Vec::with_capacity(real.len());
    let mut fake_losses = Vec::with_capacity(fake.len());
    for (r, g) in real.iter().zip(fake.iter()) {
        real_losses.push(r.score.affine(-1.0, 1.0)?.sqr()?.mean_all()?);
        fake_losses.push(g.score.sqr()?.mean_all()?);
    }
    let total = sum_scalars(real_losses.iter().chain(fake_losses.iter()))?;
    Ok((total, real_losses, fake_losses))
}

/// Least-squares GAN loss for the generator.
pub fn generator_loss(fake: &[Judgement]) -> Result<(Tensor, Vec<Tensor>)> {
    let losses = fake
        .iter()
        .map(|g| g.score.affine(-1.0, 1.0)?.sqr()?.mean_all())
        .collect::<Result<Vec<_>>>()?;
    let total = sum_scalars(losses.iter())?;
    Ok((total, losses))
}

/// Mean squared error over valid positions. `mask` broadcasts against the
/// inputs.
pub fn masked_mse(prediction: &Tensor, target: &Tensor, mask: &Tensor) -> Result<Tensor> {
    let err = (prediction - target)?.sqr()?.broadcast_mul(mask)?.sum_all()?;
    let count = mask
        .broadcast_as(prediction.shape())?
        .sum_all()?
        .maximum(1f32)?;
    err / count
}

/// Duration NLL summed over the batch and normalised by the symbol count.
pub fn duration_loss(nll: &Tensor, x_mask: &Tensor) -> Result<Tensor> {
    let symbols = x_mask.sum_all()?.maximum(1f32)?;
    nll.sum_all()? / symbols
}

fn sum_scalars<'a>(values: impl Iterator<Item = &'a Tensor>) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for v in values {
        total = Some(match total {
            Some(t) => (t + v)?,
            None => v.clone(),
        });
    }
    match total {
        Some(t) => Ok(t),
        None => candle_core::bail!("no loss terms"),
    }
}
