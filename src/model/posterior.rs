//! Posterior encoder: linear spectrogram -> sampled frame latents.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv1d, VarBuilder};

use crate::config::XvaPitchConfig;
use crate::model::wavenet::WaveNet;

/// Output of [`PosteriorEncoder::forward`].
#[derive(Debug, Clone)]
pub struct Posterior {
    /// Sampled latent `z = m_q + eps * exp(logs_q)`, masked. `[B, C, T]`
    pub z: Tensor,
    pub m_q: Tensor,
    pub logs_q: Tensor,
}

#[derive(Debug, Clone)]
pub struct PosteriorEncoder {
    pre: Conv1d,
    enc: WaveNet,
    proj: Conv1d,
    out_channels: usize,
}

impl PosteriorEncoder {
    pub fn new(cfg: &XvaPitchConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.latent_channels;
        let pre = candle_nn::conv1d(cfg.spec_channels, hidden, 1, Default::default(), vb.pp("pre"))?;
        let enc = WaveNet::new(
            hidden,
            cfg.posterior.kernel_size,
            cfg.posterior.dilation_rate,
            cfg.posterior.num_layers,
            cfg.speaker_emb_dim,
            vb.pp("enc"),
        )?;
        let proj = candle_nn::conv1d(hidden, 2 * hidden, 1, Default::default(), vb.pp("proj"))?;
        Ok(Self {
            pre,
            enc,
            proj,
            out_channels: hidden,
        })
    }

    /// - `spec`: `[B, F, T]`
    /// - `y_mask`: `[B, 1, T]`
    /// - `g`: speaker conditioning `[B, D, 1]`
    pub fn forward(&self, spec: &Tensor, y_mask: &Tensor, g: &Tensor) -> Result<Posterior> {
        let xs = self.pre.forward(spec)?.broadcast_mul(y_mask)?;
        let xs = self.enc.forward(&xs, y_mask, Some(g))?;
        let stats = self.proj.forward(&xs)?.broadcast_mul(y_mask)?;
        let m_q = stats.narrow(1, 0, self.out_channels)?;
        let logs_q = stats.narrow(1, self.out_channels, self.out_channels)?;
        let noise = m_q.randn_like(0.0, 1.0)?;
        let z = (&m_q + (noise * logs_q.exp()?)?)?.broadcast_mul(y_mask)?;
        Ok(Posterior { z, m_q, logs_q })
    }
}
