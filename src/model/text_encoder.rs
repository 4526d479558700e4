//! Symbol encoder: embeds symbols, appends the language embedding, runs the
//! attention stack and projects to per-symbol prior statistics.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv1d, Embedding, VarBuilder};

use crate::config::XvaPitchConfig;
use crate::model::transformer::{EncoderDims, SequenceEncoder};

/// Output of [`TextEncoder::forward`].
#[derive(Debug, Clone)]
pub struct TextEncoding {
    /// Hidden states `[B, C + L, S]` (symbol hidden plus language channels).
    pub x: Tensor,
    /// Prior mean `[B, C, S]`.
    pub m_p: Tensor,
    /// Prior log-std `[B, C, S]`.
    pub logs_p: Tensor,
    /// Symbol mask `[B, 1, S]`.
    pub x_mask: Tensor,
}

#[derive(Debug, Clone)]
pub struct TextEncoder {
    emb: Embedding,
    encoder: SequenceEncoder,
    proj: Conv1d,
    embed_scale: f64,
    latent_channels: usize,
}

impl TextEncoder {
    pub fn new(cfg: &XvaPitchConfig, vb: VarBuilder) -> Result<Self> {
        let latent = cfg.latent_channels;
        let hidden = cfg.text_hidden_channels();
        let emb = candle_nn::embedding(cfg.num_symbols, latent, vb.pp("emb"))?;
        let encoder = SequenceEncoder::new(
            EncoderDims {
                in_channels: hidden,
                out_channels: None,
                hidden_channels_ffn: cfg.text_encoder.hidden_channels_ffn,
                num_heads: cfg.text_encoder.num_heads,
                num_layers: cfg.text_encoder.num_layers,
                kernel_size: cfg.text_encoder.kernel_size,
            },
            vb.pp("encoder"),
        )?;
        let proj = candle_nn::conv1d(hidden, 2 * latent, 1, Default::default(), vb.pp("proj"))?;
        Ok(Self {
            emb,
            encoder,
            proj,
            embed_scale: (latent as f64).sqrt(),
            latent_channels: latent,
        })
    }

    /// - `tokens`: `[B, S]` symbol ids (u32)
    /// - `language`: `[B, S, L]` per-symbol language embedding
    /// - `x_mask`: `[B, 1, S]`
    pub fn forward(&self, tokens: &Tensor, language: &Tensor, x_mask: &Tensor) -> Result<TextEncoding> {
        let xs = (self.emb.forward(tokens)? * self.embed_scale)?;
        let xs = Tensor::cat(&[&xs, &language.to_dtype(xs.dtype())?], 2)?
            .transpose(1, 2)?
            .contiguous()?;
        let x = self.encoder.forward(&xs.broadcast_mul(x_mask)?, x_mask)?;
        let stats = self.proj.forward(&x)?.broadcast_mul(x_mask)?;
        let m_p = stats.narrow(1, 0, self.latent_channels)?;
        let logs_p = stats.narrow(1, self.latent_channels, self.latent_channels)?;
        Ok(TextEncoding {
            x,
            m_p,
            logs_p,
            x_mask: x_mask.clone(),
        })
    }
}
