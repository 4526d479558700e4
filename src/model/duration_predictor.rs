//! Stochastic duration predictor.
//!
//! A normalizing flow over two channels: the (log) duration of each symbol
//! and an auxiliary noise channel. Training evaluates the variational
//! negative log-likelihood of observed durations, using a small posterior
//! flow to dequantize them. Inference runs the main flow in reverse from
//! scaled Gaussian noise and reads the log-duration off channel 0.
//!
//! ```text
//! condition:  x -> pre (+ cond(g)) (+ cond_lang(l)) -> DDSConv -> proj
//! main flow:  ElementwiseAffine(2), [CouplingFlow, Flip] x N
//! posterior:  durations -> post_pre -> DDSConv -> post_proj,
//!             ElementwiseAffine(2), [CouplingFlow, Flip] x N
//! ```

use std::f64::consts::PI;

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Init, VarBuilder, ops::sigmoid};

use crate::config::XvaPitchConfig;
use crate::model::flow::flip_channels;
use crate::model::transformer::ChannelNorm;

const MIN_DURATION: f64 = 1e-5;
const DDS_LAYERS: usize = 3;
/// Coupling log-scales are soft-clamped to `(-LOG_SCALE_BOUND, LOG_SCALE_BOUND)`.
const LOG_SCALE_BOUND: f64 = 5.0;

/// Numerically stable `log(sigmoid(x)) = -softplus(-x)`.
fn log_sigmoid(xs: &Tensor) -> Result<Tensor> {
    // -softplus(-x) = min(x, 0) - ln(1 + exp(-|x|))
    let neg_abs = xs.abs()?.neg()?;
    let tail = neg_abs.exp()?.affine(1.0, 1.0)?.log()?;
    xs.minimum(0f32)? - tail
}

fn sum_masked(xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
    xs.broadcast_mul(mask)?.sum((1, 2))
}

// ---------------------------------------------------------------------------
// Dilated depth-separable conv stack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct DdsConv {
    convs_sep: Vec<Conv1d>,
    convs_1x1: Vec<Conv1d>,
    norms_1: Vec<ChannelNorm>,
    norms_2: Vec<ChannelNorm>,
}

impl DdsConv {
    fn new(channels: usize, kernel_size: usize, num_layers: usize, vb: VarBuilder) -> Result<Self> {
        let mut convs_sep = Vec::with_capacity(num_layers);
        let mut convs_1x1 = Vec::with_capacity(num_layers);
        let mut norms_1 = Vec::with_capacity(num_layers);
        let mut norms_2 = Vec::with_capacity(num_layers);
        for i in 0..num_layers {
            let dilation = kernel_size.pow(i as u32);
            let cfg = Conv1dConfig {
                groups: channels,
                dilation,
                padding: (kernel_size * dilation - dilation) / 2,
                ..Default::default()
            };
            convs_sep.push(candle_nn::conv1d(
                channels,
                channels,
                kernel_size,
                cfg,
                vb.pp(format!("convs_sep.{i}")),
            )?);
            convs_1x1.push(candle_nn::conv1d(
                channels,
                channels,
                1,
                Default::default(),
                vb.pp(format!("convs_1x1.{i}")),
            )?);
            norms_1.push(ChannelNorm::new(channels, vb.pp(format!("norms_1.{i}")))?);
            norms_2.push(ChannelNorm::new(channels, vb.pp(format!("norms_2.{i}")))?);
        }
        Ok(Self {
            convs_sep,
            convs_1x1,
            norms_1,
            norms_2,
        })
    }

    fn forward(&self, xs: &Tensor, x_mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let mut xs = match g {
            Some(g) => xs.broadcast_add(g)?,
            None => xs.clone(),
        };
        for i in 0..self.convs_sep.len() {
            let ys = self.convs_sep[i].forward(&xs.broadcast_mul(x_mask)?)?;
            let ys = self.norms_1[i].forward(&ys)?.gelu_erf()?;
            let ys = self.convs_1x1[i].forward(&ys)?;
            let ys = self.norms_2[i].forward(&ys)?.gelu_erf()?;
            xs = (xs + ys)?;
        }
        xs.broadcast_mul(x_mask)
    }
}

// ---------------------------------------------------------------------------
// Flow layers
// ---------------------------------------------------------------------------

/// `y = m + exp(logs) * x` with learned per-channel `m`, `logs`.
#[derive(Debug, Clone)]
struct ElementwiseAffine {
    m: Tensor,
    logs: Tensor,
}

impl ElementwiseAffine {
    fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            m: vb.get((channels, 1), "m")?,
            logs: vb.get((channels, 1), "logs")?,
        })
    }

    fn forward(&self, xs: &Tensor, x_mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let ys = xs
            .broadcast_mul(&self.logs.exp()?)?
            .broadcast_add(&self.m)?
            .broadcast_mul(x_mask)?;
        let logdet = sum_masked(&self.logs.broadcast_as(xs.shape())?, x_mask)?;
        Ok((ys, logdet))
    }

    fn reverse(&self, xs: &Tensor, x_mask: &Tensor) -> Result<Tensor> {
        xs.broadcast_sub(&self.m)?
            .broadcast_mul(&self.logs.neg()?.exp()?)?
            .broadcast_mul(x_mask)
    }
}

/// Affine coupling over two channels, conditioned through a DDSConv.
///
/// The output projection starts at zero so a fresh coupling is the identity.
#[derive(Debug, Clone)]
struct CouplingFlow {
    pre: Conv1d,
    convs: DdsConv,
    proj: Conv1d,
    half_channels: usize,
}

impl CouplingFlow {
    fn new(channels: usize, hidden: usize, kernel_size: usize, vb: VarBuilder) -> Result<Self> {
        let half = channels / 2;
        let vb_proj = vb.pp("proj");
        let proj = Conv1d::new(
            vb_proj.get_with_hints((2 * half, hidden, 1), "weight", Init::Const(0.))?,
            Some(vb_proj.get_with_hints(2 * half, "bias", Init::Const(0.))?),
            Default::default(),
        );
        Ok(Self {
            pre: candle_nn::conv1d(half, hidden, 1, Default::default(), vb.pp("pre"))?,
            convs: DdsConv::new(hidden, kernel_size, DDS_LAYERS, vb.pp("convs"))?,
            proj,
            half_channels: half,
        })
    }

    fn stats(&self, x0: &Tensor, x_mask: &Tensor, g: &Tensor) -> Result<(Tensor, Tensor)> {
        let h = self.pre.forward(x0)?;
        let h = self.convs.forward(&h, x_mask, Some(g))?;
        let h = self.proj.forward(&h)?.broadcast_mul(x_mask)?;
        let m = h.narrow(1, 0, self.half_channels)?;
        let logs = (h
            .narrow(1, self.half_channels, self.half_channels)?
            .affine(1.0 / LOG_SCALE_BOUND, 0.0)?
            .tanh()?
            * LOG_SCALE_BOUND)?;
        Ok((m, logs))
    }

    fn forward(&self, xs: &Tensor, x_mask: &Tensor, g: &Tensor) -> Result<(Tensor, Tensor)> {
        let x0 = xs.narrow(1, 0, self.half_channels)?;
        let x1 = xs.narrow(1, self.half_channels, self.half_channels)?;
        let (m, logs) = self.stats(&x0, x_mask, g)?;
        let x1 = (m + (x1 * logs.exp()?)?.broadcast_mul(x_mask)?)?;
        Ok((Tensor::cat(&[&x0, &x1], 1)?, logs.sum((1, 2))?))
    }

    fn reverse(&self, xs: &Tensor, x_mask: &Tensor, g: &Tensor) -> Result<Tensor> {
        let x0 = xs.narrow(1, 0, self.half_channels)?;
        let x1 = xs.narrow(1, self.half_channels, self.half_channels)?;
        let (m, logs) = self.stats(&x0, x_mask, g)?;
        let x1 = ((x1 - m)? * logs.neg()?.exp()?)?.broadcast_mul(x_mask)?;
        Tensor::cat(&[&x0, &x1], 1)
    }
}

/// Elementwise affine followed by `num_flows` coupling layers, each followed
/// by a channel flip.
#[derive(Debug, Clone)]
struct DurationFlows {
    affine: ElementwiseAffine,
    couplings: Vec<CouplingFlow>,
}

impl DurationFlows {
    fn new(hidden: usize, kernel_size: usize, num_flows: usize, vb: VarBuilder) -> Result<Self> {
        let affine = ElementwiseAffine::new(2, vb.pp("0"))?;
        let couplings = (0..num_flows)
            .map(|i| CouplingFlow::new(2, hidden, kernel_size, vb.pp(1 + 2 * i)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { affine, couplings })
    }

    fn forward(&self, xs: &Tensor, x_mask: &Tensor, g: &Tensor) -> Result<(Tensor, Tensor)> {
        let (mut xs, mut logdet) = self.affine.forward(xs, x_mask)?;
        for coupling in &self.couplings {
            let (ys, ld) = coupling.forward(&xs, x_mask, g)?;
            xs = flip_channels(&ys)?;
            logdet = (logdet + ld)?;
        }
        Ok((xs, logdet))
    }

    fn reverse(&self, xs: &Tensor, x_mask: &Tensor, g: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for coupling in self.couplings.iter().rev() {
            xs = coupling.reverse(&flip_channels(&xs)?, x_mask, g)?;
        }
        self.affine.reverse(&xs, x_mask)
    }
}

// ---------------------------------------------------------------------------
// Predictor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StochasticDurationPredictor {
    pre: Conv1d,
    convs: DdsConv,
    proj: Conv1d,
    cond: Option<Conv1d>,
    cond_lang: Option<Conv1d>,
    flows: DurationFlows,
    post_pre: Conv1d,
    post_convs: DdsConv,
    post_proj: Conv1d,
    post_flows: DurationFlows,
}

impl StochasticDurationPredictor {
    pub fn new(cfg: &XvaPitchConfig, vb: VarBuilder) -> Result<Self> {
        let hidden = cfg.latent_channels;
        let k = cfg.duration.kernel_size;
        let num_flows = cfg.duration.num_flows;
        let conv1x1 = |cin: usize, cout: usize, name: &str| {
            candle_nn::conv1d(cin, cout, 1, Default::default(), vb.pp(name))
        };
        let cond = if cfg.speaker_emb_dim > 0 {
            Some(conv1x1(cfg.speaker_emb_dim, hidden, "cond")?)
        } else {
            None
        };
        let cond_lang = if cfg.language_emb_dim > 0 {
            Some(conv1x1(cfg.language_emb_dim, hidden, "cond_lang")?)
        } else {
            None
        };
        Ok(Self {
            pre: conv1x1(cfg.text_hidden_channels(), hidden, "pre")?,
            convs: DdsConv::new(hidden, k, DDS_LAYERS, vb.pp("convs"))?,
            proj: conv1x1(hidden, hidden, "proj")?,
            cond,
            cond_lang,
            flows: DurationFlows::new(hidden, k, num_flows, vb.pp("flows"))?,
            post_pre: conv1x1(1, hidden, "post_pre")?,
            post_convs: DdsConv::new(hidden, k, DDS_LAYERS, vb.pp("post_convs"))?,
            post_proj: conv1x1(hidden, hidden, "post_proj")?,
            post_flows: DurationFlows::new(hidden, k, num_flows, vb.pp("post_flows"))?,
        })
    }

    /// Conditioning features `[B, H, S]` from the text hidden states.
    fn condition(
        &self,
        x: &Tensor,
        x_mask: &Tensor,
        g: Option<&Tensor>,
        lang: Option<&Tensor>,
    ) -> Result<Tensor> {
        let mut h = self.pre.forward(x)?;
        if let (Some(g), Some(cond)) = (g, &self.cond) {
            h = h.broadcast_add(&cond.forward(g)?)?;
        }
        if let (Some(lang), Some(cond_lang)) = (lang, &self.cond_lang) {
            h = h.broadcast_add(&cond_lang.forward(lang)?)?;
        }
        let h = self.convs.forward(&h, x_mask, None)?;
        self.proj.forward(&h)?.broadcast_mul(x_mask)
    }

    /// Per-item negative log-likelihood `[B]` of observed durations.
    ///
    /// - `x`: text hidden states `[B, C + L, S]`
    /// - `durations`: `[B, 1, S]` frame counts from the alignment
    /// - `g`: speaker conditioning `[B, D, 1]`
    /// - `lang`: language conditioning `[B, L, 1]` or `[B, L, S]`
    pub fn nll(
        &self,
        x: &Tensor,
        x_mask: &Tensor,
        durations: &Tensor,
        g: Option<&Tensor>,
        lang: Option<&Tensor>,
    ) -> Result<Tensor> {
        let (batch, _, symbols) = x.dims3()?;
        let h = self.condition(x, x_mask, g, lang)?;
        let half_log_2pi = 0.5 * (2.0 * PI).ln();

        // dequantization posterior q(u, nu | d)
        let h_w = self.post_pre.forward(durations)?;
        let h_w = self.post_convs.forward(&h_w, x_mask, None)?;
        let h_w = self.post_proj.forward(&h_w)?.broadcast_mul(x_mask)?;
        let e_q = Tensor::randn(0f32, 1.0, (batch, 2, symbols), x.device())?
            .to_dtype(x.dtype())?
            .broadcast_mul(x_mask)?;
        let (z_q, logdet_q) = self.post_flows.forward(&e_q, x_mask, &(&h + &h_w)?)?;
        let z_u = z_q.narrow(1, 0, 1)?;
        let z1 = z_q.narrow(1, 1, 1)?;
        let u = sigmoid(&z_u)?.broadcast_mul(x_mask)?;
        let z0 = (durations - u)?.broadcast_mul(x_mask)?;
        let logdet_q = (logdet_q
            + sum_masked(&(log_sigmoid(&z_u)? + log_sigmoid(&z_u.neg()?)?)?, x_mask)?)?;
        let nll_q = (sum_masked(&e_q.sqr()?.affine(-0.5, -half_log_2pi)?, x_mask)? - logdet_q)?;

        // log flow on the dequantized durations
        let z0 = z0
            .maximum(MIN_DURATION)?
            .log()?
            .broadcast_mul(x_mask)?;
        let logdet_log = sum_masked(&z0.neg()?, x_mask)?;
        let z = Tensor::cat(&[&z0, &z1], 1)?;
        let (z, logdet) = self.flows.forward(&z, x_mask, &h)?;
        let logdet = (logdet + logdet_log)?;
        let nll = (sum_masked(&z.sqr()?.affine(0.5, half_log_2pi)?, x_mask)? - logdet)?;
        nll + nll_q
    }

    /// Sample log-durations `[B, 1, S]` by running the flow in reverse from
    /// Gaussian noise scaled by `noise_scale`.
    pub fn predict_log_durations(
        &self,
        x: &Tensor,
        x_mask: &Tensor,
        g: Option<&Tensor>,
        lang: Option<&Tensor>,
        noise_scale: f64,
    ) -> Result<Tensor> {
        let (batch, _, symbols) = x.dims3()?;
        let h = self.condition(x, x_mask, g, lang)?;
        let z = (Tensor::randn(0f32, 1.0, (batch, 2, symbols), x.device())?
            .to_dtype(x.dtype())?
            * noise_scale)?;
        let z = self.flows.reverse(&z, x_mask, &h)?;
        z.narrow(1, 0, 1)?.broadcast_mul(x_mask)
    }
}
