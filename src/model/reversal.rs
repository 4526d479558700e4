//! Language-adversarial classifier behind a gradient-reversal layer.
//!
//! The reversal op is the identity in the forward pass. In the backward pass
//! it clamps the incoming gradient to `[-clip, clip]` and multiplies it by
//! `-scale`, so the encoder upstream is pushed to remove language cues the
//! classifier can exploit.

use candle_core::backend::BackendStorage;
use candle_core::{CpuStorage, CustomOp1, D, DType, Layout, Module, Result, Shape, Tensor};
use candle_nn::{Linear, VarBuilder, ops::log_softmax};

use crate::config::ReversalConfig;
use crate::model::mask::sequence_mask;

#[derive(Debug, Clone, Copy)]
struct GradientReversal {
    scale: f64,
    clip: f64,
}

impl CustomOp1 for GradientReversal {
    fn name(&self) -> &'static str {
        "gradient-reversal"
    }

    fn cpu_fwd(&self, storage: &CpuStorage, layout: &Layout) -> Result<(CpuStorage, Shape)> {
        let (start, end) = layout
            .contiguous_offsets()
            .ok_or_else(|| candle_core::Error::Msg("gradient-reversal: input not contiguous".into()))?;
        let out = match storage {
            CpuStorage::F32(v) => CpuStorage::F32(v[start..end].to_vec()),
            CpuStorage::F64(v) => CpuStorage::F64(v[start..end].to_vec()),
            CpuStorage::F16(v) => CpuStorage::F16(v[start..end].to_vec()),
            CpuStorage::BF16(v) => CpuStorage::BF16(v[start..end].to_vec()),
            other => candle_core::bail!("gradient-reversal: unsupported dtype {:?}", other.dtype()),
        };
        Ok((out, layout.shape().clone()))
    }

    fn bwd(&self, _arg: &Tensor, _res: &Tensor, grad_res: &Tensor) -> Result<Option<Tensor>> {
        let grad = grad_res.clamp(-self.clip, self.clip)?;
        Ok(Some(grad.affine(-self.scale, 0.0)?))
    }
}

/// Identity forward, clamped and negated gradient backward.
///
/// The custom op runs on host memory; tensors on other devices take a round
/// trip through the CPU.
pub fn reverse_gradient(xs: &Tensor, scale: f64, clip: f64) -> Result<Tensor> {
    let op = GradientReversal { scale, clip };
    if xs.device().is_cpu() {
        xs.contiguous()?.apply_op1(op)
    } else {
        let device = xs.device().clone();
        xs.to_device(&candle_core::Device::Cpu)?
            .contiguous()?
            .apply_op1(op)?
            .to_device(&device)
    }
}

/// Two stacked linear layers (no activation in between) predicting the
/// language of every frame latent.
#[derive(Debug, Clone)]
pub struct ReversalClassifier {
    hidden: Linear,
    output: Linear,
    scale: f64,
    clip: f64,
}

impl ReversalClassifier {
    pub fn new(
        in_channels: usize,
        num_languages: usize,
        cfg: &ReversalConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        Ok(Self {
            hidden: candle_nn::linear(in_channels, cfg.hidden_dim, vb.pp("_classifier.0"))?,
            output: candle_nn::linear(cfg.hidden_dim, num_languages, vb.pp("_classifier.1"))?,
            scale: cfg.scale_factor,
            clip: cfg.gradient_clip,
        })
    }

    /// `xs`: `[B, T, C]` -> language logits `[B, T, num_languages]`.
    pub fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = reverse_gradient(xs, self.scale, self.clip)?;
        self.output.forward(&self.hidden.forward(&xs)?)
    }

    /// Mean cross-entropy over valid frames.
    ///
    /// - `lengths`: valid frames per item
    /// - `language_ids`: `[B]` target language per item (u32)
    /// - `logits`: `[B, T, L]`
    pub fn loss(lengths: &[usize], language_ids: &Tensor, logits: &Tensor) -> crate::Result<Tensor> {
        let (batch, frames, _) = logits.dims3()?;
        let mask = sequence_mask(lengths, frames, logits.dtype(), logits.device())?;
        let targets = language_ids
            .to_dtype(DType::U32)?
            .reshape((batch, 1, 1))?
            .broadcast_as((batch, frames, 1))?
            .contiguous()?;
        let log_probs = log_softmax(logits, D::Minus1)?;
        let picked = log_probs.gather(&targets, D::Minus1)?.squeeze(D::Minus1)?; // [B, T]
        let total = (picked.neg()? * &mask)?.sum_all()?;
        let count = mask.sum_all()?.maximum(1f32)?;
        Ok((total / count)?)
    }
}
