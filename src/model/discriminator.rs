//! Multi-period plus scale discriminator for adversarial vocoder training.
//!
//! The period discriminators fold a waveform `[B, 1, T]` into `P` interleaved
//! columns of length `T / P` and convolve along each column. A 2-D conv with
//! a `(k, 1)` kernel over `[B, C, T/P, P]` is exactly a 1-D conv over
//! `[B * P, C, T/P]`, which is how it is computed here; checkpoints store the
//! kernels with the unit width axis squeezed out.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, VarBuilder, ops::leaky_relu};
use candle_transformers::models::encodec;

use crate::config::DiscriminatorConfig;

const LRELU_SLOPE: f64 = 0.1;

/// Scores and intermediate feature maps of one sub-discriminator.
#[derive(Debug, Clone)]
pub struct Judgement {
    /// Flattened logits `[B, N]`.
    pub score: Tensor,
    pub features: Vec<Tensor>,
}

// ---------------------------------------------------------------------------
// Period discriminator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PeriodDiscriminator {
    convs: Vec<Conv1d>,
    conv_post: Conv1d,
    period: usize,
}

impl PeriodDiscriminator {
    pub fn new(period: usize, vb: VarBuilder) -> Result<Self> {
        let channels = [1usize, 32, 128, 512, 1024, 1024];
        let mut convs = Vec::with_capacity(channels.len() - 1);
        for i in 0..channels.len() - 1 {
            let stride = if i + 2 < channels.len() { 3 } else { 1 };
            let cfg = Conv1dConfig {
                stride,
                padding: 2,
                ..Default::default()
            };
            convs.push(encodec::conv1d_weight_norm(
                channels[i],
                channels[i + 1],
                5,
                cfg,
                vb.pp(format!("convs.{i}")),
            )?);
        }
        let conv_post = encodec::conv1d_weight_norm(
            1024,
            1,
            3,
            Conv1dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv_post"),
        )?;
        Ok(Self {
            convs,
            conv_post,
            period,
        })
    }

    /// `[B*P, C, H] -> [B, C, H, P]`
    fn unfold(&self, xs: &Tensor, batch: usize) -> Result<Tensor> {
        let (_, c, h) = xs.dims3()?;
        xs.reshape((batch, self.period, c, h))?.permute((0, 2, 3, 1))
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Judgement> {
        let (batch, channels, time) = xs.dims3()?;
        let p = self.period;
        let xs = if time % p != 0 {
            reflect_pad_right(xs, p - time % p)?
        } else {
            xs.clone()
        };
        let rows = xs.dim(2)? / p;
        // [B, C, H, P] -> [B, P, C, H] -> [B*P, C, H]
        let mut h = xs
            .reshape((batch, channels, rows, p))?
            .permute((0, 3, 1, 2))?
            .contiguous()?
            .reshape((batch * p, channels, rows))?;

        let mut features = Vec::with_capacity(self.convs.len() + 1);
        for conv in &self.convs {
            h = leaky_relu(&conv.forward(&h)?, LRELU_SLOPE)?;
            features.push(self.unfold(&h, batch)?);
        }
        let h = self.conv_post.forward(&h)?;
        let out = self.unfold(&h, batch)?;
        let score = out.flatten_from(1)?;
        features.push(out);
        Ok(Judgement { score, features })
    }
}

/// Reflect-pad the last axis on the right by `pad` samples.
fn reflect_pad_right(xs: &Tensor, pad: usize) -> Result<Tensor> {
    let time = xs.dim(2)?;
    if pad >= time {
        candle_core::bail!("reflect pad of {pad} needs more than {time} samples");
    }
    let index: Vec<u32> = (0..pad).map(|i| (time - 2 - i) as u32).collect();
    let index = Tensor::new(index.as_slice(), xs.device())?;
    let xs = xs.contiguous()?;
    Tensor::cat(&[&xs, &xs.index_select(&index, 2)?], 2)
}

// ---------------------------------------------------------------------------
// Scale discriminator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScaleDiscriminator {
    convs: Vec<Conv1d>,
    conv_post: Conv1d,
}

impl ScaleDiscriminator {
    pub fn new(vb: VarBuilder) -> Result<Self> {
        // (in, out, kernel, stride, groups, padding)
        let layers: [(usize, usize, usize, usize, usize, usize); 6] = [
            (1, 16, 15, 1, 1, 7),
            (16, 64, 41, 4, 4, 20),
            (64, 256, 41, 4, 16, 20),
            (256, 1024, 41, 4, 64, 20),
            (1024, 1024, 41, 4, 256, 20),
            (1024, 1024, 5, 1, 1, 2),
        ];
        let mut convs = Vec::with_capacity(layers.len());
        for (i, &(cin, cout, kernel, stride, groups, padding)) in layers.iter().enumerate() {
            let cfg = Conv1dConfig {
                stride,
                groups,
                padding,
                ..Default::default()
            };
            convs.push(encodec::conv1d_weight_norm(
                cin / groups,
                cout,
                kernel,
                cfg,
                vb.pp(format!("convs.{i}")),
            )?);
        }
        let conv_post = encodec::conv1d_weight_norm(
            1024,
            1,
            3,
            Conv1dConfig {
                padding: 1,
                ..Default::default()
            },
            vb.pp("conv_post"),
        )?;
        Ok(Self { convs, conv_post })
    }

    pub fn forward(&self, xs: &Tensor) -> Result<Judgement> {
        let mut h = xs.clone();
        let mut features = Vec::with_capacity(self.convs.len() + 1);
        for conv in &self.convs {
            h = leaky_relu(&conv.forward(&h)?, LRELU_SLOPE)?;
            features.push(h.clone());
        }
        let h = self.conv_post.forward(&h)?;
        let score = h.flatten_from(1)?;
        features.push(h);
        Ok(Judgement { score, features })
    }
}

// ---------------------------------------------------------------------------
// Combined
// ---------------------------------------------------------------------------

/// Judgements of every sub-discriminator, scale discriminator first.
#[derive(Debug, Clone)]
pub struct DiscriminatorOutput {
    pub real: Vec<Judgement>,
    pub fake: Option<Vec<Judgement>>,
}

#[derive(Debug, Clone)]
pub struct VitsDiscriminator {
    scale: ScaleDiscriminator,
    periods: Vec<PeriodDiscriminator>,
}

impl VitsDiscriminator {
    pub fn new(cfg: &DiscriminatorConfig, vb: VarBuilder) -> Result<Self> {
        let scale = ScaleDiscriminator::new(vb.pp("nets.0"))?;
        let periods = cfg
            .periods
            .iter()
            .enumerate()
            .map(|(i, &p)| PeriodDiscriminator::new(p, vb.pp(format!("nets.{}", i + 1))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { scale, periods })
    }

    fn judge(&self, xs: &Tensor) -> Result<Vec<Judgement>> {
        let mut out = Vec::with_capacity(self.periods.len() + 1);
        out.push(self.scale.forward(xs)?);
        for period in &self.periods {
            out.push(period.forward(xs)?);
        }
        Ok(out)
    }

    /// Judge real audio and, optionally, generated audio. Both `[B, 1, T]`.
    pub fn forward(&self, real: &Tensor, fake: Option<&Tensor>) -> Result<DiscriminatorOutput> {
        let real = self.judge(real)?;
        let fake = fake.map(|f| self.judge(f)).transpose()?;
        Ok(DiscriminatorOutput { real, fake })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_reflect_pad() {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[[1f32, 2., 3., 4.]]], &dev).unwrap();
        let y: Vec<f32> = reflect_pad_right(&x, 2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(y, vec![1., 2., 3., 4., 3., 2.]);
    }

    #[test]
    fn test_period_discriminator_shapes() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let disc = PeriodDiscriminator::new(3, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 1, 100), &dev).unwrap();
        let out = disc.forward(&x).unwrap();
        assert_eq!(out.features.len(), 6);
        // 100 -> padded 102 -> 34 rows -> 12 -> 4 -> 2 -> 1 -> 1
        assert_eq!(out.features[0].dims(), &[2, 32, 12, 3]);
        assert_eq!(out.score.dims(), &[2, 3]);
    }

    #[test]
    fn test_full_discriminator_counts() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let cfg = DiscriminatorConfig {
            periods: vec![2, 3],
        };
        let disc = VitsDiscriminator::new(&cfg, vb).unwrap();
        let real = Tensor::randn(0f32, 1.0, (1, 1, 256), &dev).unwrap();
        let fake = Tensor::randn(0f32, 1.0, (1, 1, 256), &dev).unwrap();
        let out = disc.forward(&real, Some(&fake)).unwrap();
        assert_eq!(out.real.len(), 3);
        assert_eq!(out.fake.unwrap().len(), 3);
        assert_eq!(out.real[0].features.len(), 7);
    }
}
