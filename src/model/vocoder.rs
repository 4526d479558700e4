//! HiFi-GAN generator: frame latents -> waveform.
//!
//! ```text
//! Input: [B, C, T]
//! conv_pre(C, 512, k=7) (+ cond_layer(g))
//! 4 upsample stages: rates=[8,8,2,2], product=256=hop_length
//! Each: LeakyReLU(0.1) + ConvTranspose1d + mean of 3 multi-dilation ResBlocks
//! LeakyReLU + conv_post(k=7, no bias) + tanh
//! Output: [B, 1, T * 256]
//! ```
//!
//! Upsampling and residual convs are weight-normalised; `conv_pre`,
//! `conv_post` and the conditioning layer are plain convs.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig, VarBuilder, ops::leaky_relu};
use candle_transformers::models::encodec;

use crate::config::VocoderConfig;

const LRELU_SLOPE: f64 = 0.1;

fn get_padding(kernel_size: usize, dilation: usize) -> usize {
    (kernel_size * dilation - dilation) / 2
}

// ---------------------------------------------------------------------------
// Residual block: pairs of (dilated conv, conv) with LeakyReLU in between
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ResBlock {
    convs1: Vec<Conv1d>,
    convs2: Vec<Conv1d>,
}

impl ResBlock {
    pub fn new(channels: usize, kernel_size: usize, dilations: &[usize], vb: VarBuilder) -> Result<Self> {
        let mut convs1 = Vec::with_capacity(dilations.len());
        let mut convs2 = Vec::with_capacity(dilations.len());
        for (i, &dilation) in dilations.iter().enumerate() {
            let cfg1 = Conv1dConfig {
                dilation,
                padding: get_padding(kernel_size, dilation),
                ..Default::default()
            };
            convs1.push(encodec::conv1d_weight_norm(
                channels,
                channels,
                kernel_size,
                cfg1,
                vb.pp(format!("convs1.{i}")),
            )?);
            let cfg2 = Conv1dConfig {
                padding: get_padding(kernel_size, 1),
                ..Default::default()
            };
            convs2.push(encodec::conv1d_weight_norm(
                channels,
                channels,
                kernel_size,
                cfg2,
                vb.pp(format!("convs2.{i}")),
            )?);
        }
        Ok(Self { convs1, convs2 })
    }
}

impl Module for ResBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for (c1, c2) in self.convs1.iter().zip(self.convs2.iter()) {
            let ys = leaky_relu(&xs, LRELU_SLOPE)?.apply(c1)?;
            let ys = leaky_relu(&ys, LRELU_SLOPE)?.apply(c2)?;
            xs = (xs + ys)?;
        }
        Ok(xs)
    }
}

// ---------------------------------------------------------------------------
// Generator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HifiganGenerator {
    conv_pre: Conv1d,
    ups: Vec<ConvTranspose1d>,
    resblocks: Vec<ResBlock>,
    conv_post: Conv1d,
    cond_layer: Option<Conv1d>,
    num_kernels: usize,
}

impl HifiganGenerator {
    /// `cond_channels == 0` disables speaker conditioning.
    pub fn new(
        in_channels: usize,
        cond_channels: usize,
        cfg: &VocoderConfig,
        vb: VarBuilder,
    ) -> Result<Self> {
        let initial = cfg.upsample_initial_channel;
        let conv_pre = candle_nn::conv1d(
            in_channels,
            initial,
            7,
            Conv1dConfig {
                padding: 3,
                ..Default::default()
            },
            vb.pp("conv_pre"),
        )?;

        let mut ups = Vec::with_capacity(cfg.upsample_rates.len());
        let mut resblocks = Vec::new();
        let mut channels = initial;
        for (i, (&rate, &kernel)) in cfg
            .upsample_rates
            .iter()
            .zip(cfg.upsample_kernel_sizes.iter())
            .enumerate()
        {
            let out = initial >> (i + 1);
            let up_cfg = ConvTranspose1dConfig {
                stride: rate,
                padding: (kernel - rate) / 2,
                ..Default::default()
            };
            ups.push(encodec::conv_transpose1d_weight_norm(
                channels,
                out,
                kernel,
                true,
                up_cfg,
                vb.pp(format!("ups.{i}")),
            )?);
            for (kernel_size, dilations) in cfg
                .resblock_kernel_sizes
                .iter()
                .zip(cfg.resblock_dilation_sizes.iter())
            {
                let index = resblocks.len();
                resblocks.push(ResBlock::new(
                    out,
                    *kernel_size,
                    dilations,
                    vb.pp(format!("resblocks.{index}")),
                )?);
            }
            channels = out;
        }

        let conv_post = candle_nn::conv1d_no_bias(
            channels,
            1,
            7,
            Conv1dConfig {
                padding: 3,
                ..Default::default()
            },
            vb.pp("conv_post"),
        )?;
        let cond_layer = if cond_channels > 0 {
            Some(candle_nn::conv1d(
                cond_channels,
                initial,
                1,
                Default::default(),
                vb.pp("cond_layer"),
            )?)
        } else {
            None
        };

        Ok(Self {
            conv_pre,
            ups,
            resblocks,
            conv_post,
            cond_layer,
            num_kernels: cfg.resblock_kernel_sizes.len(),
        })
    }

    /// - `xs`: `[B, C, T]` latents
    /// - `g`: `[B, D, 1]` speaker conditioning
    pub fn forward(&self, xs: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let mut o = self.conv_pre.forward(xs)?;
        if let (Some(g), Some(cond_layer)) = (g, &self.cond_layer) {
            o = o.broadcast_add(&cond_layer.forward(g)?)?;
        }
        for (i, up) in self.ups.iter().enumerate() {
            o = leaky_relu(&o, LRELU_SLOPE)?.apply(up)?;
            let blocks = &self.resblocks[i * self.num_kernels..(i + 1) * self.num_kernels];
            let mut sum: Option<Tensor> = None;
            for block in blocks {
                let ys = block.forward(&o)?;
                sum = Some(match sum {
                    Some(acc) => (acc + ys)?,
                    None => ys,
                });
            }
            if let Some(sum) = sum {
                o = (sum / self.num_kernels as f64)?;
            }
        }
        // final activation uses the default LeakyReLU slope
        leaky_relu(&o, 0.01)?.apply(&self.conv_post)?.tanh()
    }
}
