//! Non-causal WaveNet stack shared by the posterior encoder and the coupling
//! flows.
//!
//! Each layer is a dilated conv producing `2H` channels, an optional slice of
//! the global conditioning added on top, a gated `tanh * sigmoid`
//! activation, then a 1x1 conv split into a residual part and a skip part.
//! The output is the masked sum of all skip parts.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, VarBuilder, ops::sigmoid};

/// Add `a + b` (with broadcasting over time) and apply the gated activation
/// `tanh(first half) * sigmoid(second half)` over channels.
pub fn fused_add_tanh_sigmoid_multiply(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let in_act = a.broadcast_add(b)?;
    let parts = in_act.chunk(2, 1)?;
    parts[0].tanh()? * sigmoid(&parts[1])?
}

#[derive(Debug, Clone)]
pub struct WaveNet {
    in_layers: Vec<Conv1d>,
    res_skip_layers: Vec<Conv1d>,
    cond_layer: Option<Conv1d>,
    hidden_channels: usize,
}

impl WaveNet {
    /// `cond_channels == 0` builds an unconditioned stack.
    pub fn new(
        hidden_channels: usize,
        kernel_size: usize,
        dilation_rate: usize,
        num_layers: usize,
        cond_channels: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let cond_layer = if cond_channels > 0 {
            Some(candle_nn::conv1d(
                cond_channels,
                2 * hidden_channels * num_layers,
                1,
                Default::default(),
                vb.pp("cond_layer"),
            )?)
        } else {
            None
        };

        let mut in_layers = Vec::with_capacity(num_layers);
        let mut res_skip_layers = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let dilation = dilation_rate.pow(i as u32);
            let cfg = Conv1dConfig {
                dilation,
                padding: (kernel_size * dilation - dilation) / 2,
                ..Default::default()
            };
            in_layers.push(candle_nn::conv1d(
                hidden_channels,
                2 * hidden_channels,
                kernel_size,
                cfg,
                vb.pp(format!("in_layers.{i}")),
            )?);
            // the last layer only feeds the skip path
            let res_skip_channels = if i + 1 < num_layers {
                2 * hidden_channels
            } else {
                hidden_channels
            };
            res_skip_layers.push(candle_nn::conv1d(
                hidden_channels,
                res_skip_channels,
                1,
                Default::default(),
                vb.pp(format!("res_skip_layers.{i}")),
            )?);
        }

        Ok(Self {
            in_layers,
            res_skip_layers,
            cond_layer,
            hidden_channels,
        })
    }

    /// - `xs`: `[B, H, T]`
    /// - `x_mask`: `[B, 1, T]`
    /// - `g`: `[B, cond, 1]` (global) or `[B, cond, T]` (per frame)
    pub fn forward(&self, xs: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let g = match (g, &self.cond_layer) {
            (Some(g), Some(cond_layer)) => Some(cond_layer.forward(g)?),
            _ => None,
        };
        let num_layers = self.in_layers.len();
        let width = 2 * self.hidden_channels;

        let mut xs = xs.clone();
        let mut output = xs.zeros_like()?;
        for (i, (in_layer, res_skip_layer)) in self
            .in_layers
            .iter()
            .zip(self.res_skip_layers.iter())
            .enumerate()
        {
            let xs_in = in_layer.forward(&xs)?;
            let acts = match &g {
                Some(g) => fused_add_tanh_sigmoid_multiply(&xs_in, &g.narrow(1, i * width, width)?)?,
                None => fused_add_tanh_sigmoid_multiply(&xs_in, &xs_in.zeros_like()?)?,
            };
            let res_skip = res_skip_layer.forward(&acts)?;
            if i + 1 < num_layers {
                let res = res_skip.narrow(1, 0, self.hidden_channels)?;
                let skip = res_skip.narrow(1, self.hidden_channels, self.hidden_channels)?;
                xs = (xs + res)?.broadcast_mul(x_mask)?;
                output = (output + skip)?;
            } else {
                output = (output + res_skip)?;
            }
        }
        output.broadcast_mul(x_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mask::time_mask;
    use candle_core::{DType, Device};

    #[test]
    fn test_wavenet_shape_and_mask() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let wn = WaveNet::new(8, 5, 1, 3, 6, vb.pp("enc")).unwrap();
        let xs = Tensor::randn(0f32, 1.0, (2, 8, 12), &dev).unwrap();
        let mask = time_mask(&[12, 7], 12, DType::F32, &dev).unwrap();
        let g = Tensor::randn(0f32, 1.0, (2, 6, 1), &dev).unwrap();
        let out = wn.forward(&xs, &mask, Some(&g)).unwrap();
        assert_eq!(out.dims(), &[2, 8, 12]);
        let tail: f32 = out
            .narrow(0, 1, 1)
            .unwrap()
            .narrow(2, 7, 5)
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
    fn test_gated_activation() {
        let dev = Device::Cpu;
        let a = Tensor::zeros((1, 4, 3), DType::F32, &dev).unwrap();
        let out = fused_add_tanh_sigmoid_multiply(&a, &a).unwrap();
        assert_eq!(out.dims(), &[1, 2, 3]);
        // tanh(0) * sigmoid(0) = 0
        let sum: f32 = out.abs().unwrap().sum_all().unwrap().to_scalar().unwrap();
        assert_eq!(sum, 0.0);
    }
}
