//! Masked self-attention encoder over channel-first sequences.
//!
//! Used by the text encoder (symbols -> hidden states) and by the pitch and
//! energy predictors (hidden states -> one value per symbol). Layers are
//! post-norm: `x = norm(x + attn(x))`, `x = norm(x + ffn(x))`.

use candle_core::{D, Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, LayerNorm, VarBuilder, ops::softmax_last_dim};

/// Hyper-parameters of one encoder stack.
#[derive(Debug, Clone, Copy)]
pub struct EncoderDims {
    pub in_channels: usize,
    /// `Some(n)` adds a final 1x1 projection to `n` channels.
    pub out_channels: Option<usize>,
    pub hidden_channels_ffn: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub kernel_size: usize,
}

// ---------------------------------------------------------------------------
// Channel-first layer norm
// ---------------------------------------------------------------------------

/// Layer norm over the channel axis of a `[B, C, T]` tensor.
#[derive(Debug, Clone)]
pub(crate) struct ChannelNorm {
    inner: LayerNorm,
}

impl ChannelNorm {
    pub(crate) fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let gamma = vb.get_with_hints(channels, "gamma", candle_nn::Init::Const(1.0))?;
        let beta = vb.get(channels, "beta")?;
        Ok(Self {
            inner: LayerNorm::new(gamma, beta, 1e-5),
        })
    }
}

impl Module for ChannelNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.transpose(1, 2)?
            .contiguous()?
            .apply(&self.inner)?
            .transpose(1, 2)
    }
}

// ---------------------------------------------------------------------------
// Multi-head attention with 1x1 conv projections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MultiHeadAttention {
    conv_q: Conv1d,
    conv_k: Conv1d,
    conv_v: Conv1d,
    conv_o: Conv1d,
    num_heads: usize,
}

impl MultiHeadAttention {
    fn new(channels: usize, num_heads: usize, vb: VarBuilder) -> Result<Self> {
        if channels % num_heads != 0 {
            candle_core::bail!("attention width {channels} not divisible by {num_heads} heads");
        }
        let conv = |name: &str| candle_nn::conv1d(channels, channels, 1, Default::default(), vb.pp(name));
        Ok(Self {
            conv_q: conv("conv_q")?,
            conv_k: conv("conv_k")?,
            conv_v: conv("conv_v")?,
            conv_o: conv("conv_o")?,
            num_heads,
        })
    }

    /// `xs`: `[B, C, T]`, `attn_mask`: `[B, 1, T, T]` with 1.0 where attending
    /// is allowed.
    fn forward(&self, xs: &Tensor, attn_mask: &Tensor) -> Result<Tensor> {
        let (b, c, t) = xs.dims3()?;
        let head_dim = c / self.num_heads;
        let heads = |x: Tensor| -> Result<Tensor> {
            x.reshape((b, self.num_heads, head_dim, t))?
                .transpose(2, 3)?
                .contiguous()
        };
        let q = heads(self.conv_q.forward(xs)?)?;
        let k = heads(self.conv_k.forward(xs)?)?;
        let v = heads(self.conv_v.forward(xs)?)?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        // masked positions get a large negative bias before the softmax
        let bias = attn_mask.affine(1e4, -1e4)?;
        let weights = softmax_last_dim(&scores.broadcast_add(&bias)?)?;
        let out = weights
            .matmul(&v)?
            .transpose(2, 3)?
            .contiguous()?
            .reshape((b, c, t))?;
        self.conv_o.forward(&out)
    }
}

// ---------------------------------------------------------------------------
// Conv feed-forward
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FeedForward {
    conv_1: Conv1d,
    conv_2: Conv1d,
}

impl FeedForward {
    fn new(channels: usize, hidden: usize, kernel_size: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: kernel_size / 2,
            ..Default::default()
        };
        Ok(Self {
            conv_1: candle_nn::conv1d(channels, hidden, kernel_size, cfg, vb.pp("conv_1"))?,
            conv_2: candle_nn::conv1d(hidden, channels, kernel_size, cfg, vb.pp("conv_2"))?,
        })
    }

    fn forward(&self, xs: &Tensor, x_mask: &Tensor) -> Result<Tensor> {
        let h = self.conv_1.forward(&xs.broadcast_mul(x_mask)?)?.relu()?;
        self.conv_2
            .forward(&h.broadcast_mul(x_mask)?)?
            .broadcast_mul(x_mask)
    }
}

// ---------------------------------------------------------------------------
// Encoder stack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SequenceEncoder {
    attn_layers: Vec<MultiHeadAttention>,
    norm_layers_1: Vec<ChannelNorm>,
    ffn_layers: Vec<FeedForward>,
    norm_layers_2: Vec<ChannelNorm>,
    proj: Option<Conv1d>,
}

impl SequenceEncoder {
    pub fn new(dims: EncoderDims, vb: VarBuilder) -> Result<Self> {
        let channels = dims.in_channels;
        let mut attn_layers = Vec::with_capacity(dims.num_layers);
        let mut norm_layers_1 = Vec::with_capacity(dims.num_layers);
        let mut ffn_layers = Vec::with_capacity(dims.num_layers);
        let mut norm_layers_2 = Vec::with_capacity(dims.num_layers);
        for i in 0..dims.num_layers {
            attn_layers.push(MultiHeadAttention::new(
                channels,
                dims.num_heads,
                vb.pp(format!("attn_layers.{i}")),
            )?);
            norm_layers_1.push(ChannelNorm::new(channels, vb.pp(format!("norm_layers_1.{i}")))?);
            ffn_layers.push(FeedForward::new(
                channels,
                dims.hidden_channels_ffn,
                dims.kernel_size,
                vb.pp(format!("ffn_layers.{i}")),
            )?);
            norm_layers_2.push(ChannelNorm::new(channels, vb.pp(format!("norm_layers_2.{i}")))?);
        }
        let proj = match dims.out_channels {
            Some(out) => Some(candle_nn::conv1d(
                channels,
                out,
                1,
                Default::default(),
                vb.pp("proj"),
            )?),
            None => None,
        };
        Ok(Self {
            attn_layers,
            norm_layers_1,
            ffn_layers,
            norm_layers_2,
            proj,
        })
    }

    /// `xs`: `[B, C, T]`, `x_mask`: `[B, 1, T]`. Output is masked.
    pub fn forward(&self, xs: &Tensor, x_mask: &Tensor) -> Result<Tensor> {
        // [B, 1, T, 1] * [B, 1, 1, T]
        let attn_mask = x_mask
            .unsqueeze(D::Minus1)?
            .broadcast_mul(&x_mask.unsqueeze(2)?)?;
        let mut xs = xs.clone();
        for (((attn, norm_1), ffn), norm_2) in self
            .attn_layers
            .iter()
            .zip(&self.norm_layers_1)
            .zip(&self.ffn_layers)
            .zip(&self.norm_layers_2)
        {
            xs = xs.broadcast_mul(x_mask)?;
            let ys = attn.forward(&xs, &attn_mask)?;
            xs = norm_1.forward(&(xs + ys)?)?;
            let ys = ffn.forward(&xs, x_mask)?;
            xs = norm_2.forward(&(xs + ys)?)?;
        }
        let xs = xs.broadcast_mul(x_mask)?;
        match &self.proj {
            Some(proj) => proj.forward(&xs)?.broadcast_mul(x_mask),
            None => Ok(xs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mask::time_mask;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn dims(out: Option<usize>) -> EncoderDims {
        EncoderDims {
            in_channels: 8,
            out_channels: out,
            hidden_channels_ffn: 16,
            num_heads: 2,
            num_layers: 2,
            kernel_size: 3,
        }
    }

    #[test]
    fn test_encoder_shapes() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let enc = SequenceEncoder::new(dims(None), vb.pp("encoder")).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 8, 5), &dev).unwrap();
        let mask = time_mask(&[5, 3], 5, DType::F32, &dev).unwrap();
        assert_eq!(enc.forward(&xs, &mask).unwrap().dims(), &[2, 8, 5]);

        let pred = SequenceEncoder::new(dims(Some(1)), vb.pp("pred")).unwrap();
        assert_eq!(pred.forward(&xs, &mask).unwrap().dims(), &[2, 1, 5]);
    }

    #[test]
    fn test_padding_does_not_leak() {
        // Random weights: changing padded inputs must not change valid outputs.
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let enc = SequenceEncoder::new(dims(Some(3)), vb).unwrap();
        let mask = time_mask(&[3], 6, DType::F32, &dev).unwrap();

        let valid = Tensor::randn(0f32, 1.0, (1, 8, 3), &dev).unwrap();
        let pad_a = Tensor::zeros((1, 8, 3), DType::F32, &dev).unwrap();
        let pad_b = Tensor::randn(0f32, 5.0, (1, 8, 3), &dev).unwrap();
        let xa = Tensor::cat(&[&valid, &pad_a], 2).unwrap();
        let xb = Tensor::cat(&[&valid, &pad_b], 2).unwrap();

        let ya = enc.forward(&xa, &mask).unwrap();
        let yb = enc.forward(&xb, &mask).unwrap();
        let diff: f32 = (ya - yb)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!(diff < 1e-4, "padding leaked: {diff}");
    }

    #[test]
    fn test_bad_head_count_rejected() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let mut d = dims(None);
        d.num_heads = 3;
        assert!(SequenceEncoder::new(d, vb).is_err());
    }
}
