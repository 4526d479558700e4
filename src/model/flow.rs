//! Residual coupling flow mapping posterior latents to the prior space.
//!
//! Each block splits channels in half, predicts a shift (and optionally a
//! log-scale) for the second half from the first half with a WaveNet, and
//! leaves the first half untouched. Channel order is reversed between blocks
//! so every channel gets transformed. Reverse mode undoes the blocks exactly,
//! in opposite order.
//!
//! The last block may carry a 1x1 projector that widens the latent before
//! coupling (used to append auxiliary pitch/energy channels). The projector
//! is not invertible: in reverse the widened channels are dropped after that
//! block.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv1d, VarBuilder};

use crate::config::XvaPitchConfig;
use crate::model::wavenet::WaveNet;

/// Reverse the channel axis of a `[B, C, T]` tensor.
pub fn flip_channels(xs: &Tensor) -> Result<Tensor> {
    let channels = xs.dim(1)?;
    let index: Vec<u32> = (0..channels as u32).rev().collect();
    let index = Tensor::new(index.as_slice(), xs.device())?;
    xs.contiguous()?.index_select(&index, 1)
}

/// Geometry of one coupling block.
#[derive(Debug, Clone, Copy)]
pub struct CouplingDims {
    pub channels: usize,
    pub hidden_channels: usize,
    pub kernel_size: usize,
    pub dilation_rate: usize,
    pub num_layers: usize,
    pub cond_channels: usize,
    pub mean_only: bool,
    /// Input width of the widening projector, if any.
    pub projector_in: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ResidualCouplingBlock {
    pre: Conv1d,
    enc: WaveNet,
    post: Conv1d,
    projector: Option<Conv1d>,
    half_channels: usize,
    mean_only: bool,
}

impl ResidualCouplingBlock {
    pub fn new(dims: CouplingDims, vb: VarBuilder) -> crate::Result<Self> {
        if dims.channels == 0 || dims.channels % 2 != 0 {
            return Err(crate::Error::Config(format!(
                "coupling block needs an even channel count, got {}",
                dims.channels
            )));
        }
        let half = dims.channels / 2;
        let pre = candle_nn::conv1d(half, dims.hidden_channels, 1, Default::default(), vb.pp("pre"))?;
        let enc = WaveNet::new(
            dims.hidden_channels,
            dims.kernel_size,
            dims.dilation_rate,
            dims.num_layers,
            dims.cond_channels,
            vb.pp("enc"),
        )?;
        let post_channels = if dims.mean_only { half } else { 2 * half };
        let post = candle_nn::conv1d(
            dims.hidden_channels,
            post_channels,
            1,
            Default::default(),
            vb.pp("post"),
        )?;
        let projector = match dims.projector_in {
            Some(width) => Some(candle_nn::conv1d(
                width,
                dims.channels,
                1,
                Default::default(),
                vb.pp("projector"),
            )?),
            None => None,
        };
        Ok(Self {
            pre,
            enc,
            post,
            projector,
            half_channels: half,
            mean_only: dims.mean_only,
        })
    }

    pub fn has_projector(&self) -> bool {
        self.projector.is_some()
    }

    /// Shift and log-scale for the second half, both masked.
    fn coupling(&self, x0: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let h = self.pre.forward(x0)?.broadcast_mul(x_mask)?;
        let h = self.enc.forward(&h, x_mask, g)?;
        let stats = self.post.forward(&h)?.broadcast_mul(x_mask)?;
        if self.mean_only {
            let logs = stats.zeros_like()?;
            Ok((stats, logs))
        } else {
            let m = stats.narrow(1, 0, self.half_channels)?;
            let logs = stats.narrow(1, self.half_channels, self.half_channels)?;
            Ok((m, logs))
        }
    }

    /// Returns the transformed latent and the per-item log-determinant `[B]`.
    pub fn forward(&self, xs: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let xs = match &self.projector {
            Some(projector) => projector.forward(xs)?.broadcast_mul(x_mask)?,
            None => xs.clone(),
        };
        let x0 = xs.narrow(1, 0, self.half_channels)?;
        let x1 = xs.narrow(1, self.half_channels, self.half_channels)?;
        let (m, logs) = self.coupling(&x0, x_mask, g)?;
        let x1 = (m + (x1 * logs.exp()?)?.broadcast_mul(x_mask)?)?;
        let logdet = logs.sum((1, 2))?;
        Ok((Tensor::cat(&[&x0, &x1], 1)?, logdet))
    }

    pub fn reverse(&self, xs: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let x0 = xs.narrow(1, 0, self.half_channels)?;
        let x1 = xs.narrow(1, self.half_channels, self.half_channels)?;
        let (m, logs) = self.coupling(&x0, x_mask, g)?;
        let x1 = ((x1 - m)? * logs.neg()?.exp()?)?.broadcast_mul(x_mask)?;
        Tensor::cat(&[&x0, &x1], 1)
    }
}

/// Output of [`ResidualCouplingFlow::forward`].
#[derive(Debug, Clone)]
pub struct FlowOutput {
    pub z_p: Tensor,
    /// Summed log-determinant per item `[B]`.
    pub logdet: Tensor,
}

#[derive(Debug, Clone)]
pub struct ResidualCouplingFlow {
    flows: Vec<ResidualCouplingBlock>,
    latent_channels: usize,
}

impl ResidualCouplingFlow {
    pub fn new(cfg: &XvaPitchConfig, vb: VarBuilder) -> crate::Result<Self> {
        let latent = cfg.latent_channels;
        let num_flows = cfg.flow.num_flows;
        let mut flows = Vec::with_capacity(num_flows);
        for i in 0..num_flows {
            let expanded = if i + 1 == num_flows {
                cfg.expanded_flow_dim()
            } else {
                None
            };
            let channels = latent + 2 * expanded.unwrap_or(0);
            let dims = CouplingDims {
                channels,
                hidden_channels: channels,
                kernel_size: cfg.flow.kernel_size,
                dilation_rate: cfg.flow.dilation_rate,
                num_layers: cfg.flow.num_layers,
                cond_channels: cfg.flow_cond_channels(),
                mean_only: true,
                projector_in: expanded.map(|_| latent),
            };
            flows.push(ResidualCouplingBlock::new(dims, vb.pp(format!("flows.{i}")))?);
        }
        Ok(Self {
            flows,
            latent_channels: latent,
        })
    }

    /// Posterior latent `[B, C, T]` -> prior-space latent. With an expanded
    /// last block the output has `C + 2D` channels.
    pub fn forward(&self, z: &Tensor, y_mask: &Tensor, g: Option<&Tensor>) -> Result<FlowOutput> {
        let mut xs = z.clone();
        let mut logdet: Option<Tensor> = None;
        for flow in &self.flows {
            let (ys, ld) = flow.forward(&xs, y_mask, g)?;
            xs = flip_channels(&ys)?;
            logdet = Some(match logdet {
                Some(total) => (total + ld)?,
                None => ld,
            });
        }
        let logdet = match logdet {
            Some(ld) => ld,
            None => Tensor::zeros(z.dim(0)?, z.dtype(), z.device())?,
        };
        Ok(FlowOutput { z_p: xs, logdet })
    }

    /// Prior-space latent -> posterior latent `[B, C, T]`.
    ///
    /// When the last block widens the latent, `z_p` must carry the auxiliary
    /// channels (`C + 2D` wide); they are dropped after that block.
    pub fn reverse(&self, z_p: &Tensor, y_mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let mut xs = z_p.clone();
        for flow in self.flows.iter().rev() {
            xs = flow.reverse(&flip_channels(&xs)?, y_mask, g)?;
            if flow.has_projector() {
                xs = xs.narrow(1, 0, self.latent_channels)?;
            }
        }
        Ok(xs)
    }
}
