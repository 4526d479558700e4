//! Pitch and energy: per-symbol predictors and the schemes that carry
//! prosody into the latent space.
//!
//! Energy is handled in the log domain everywhere: frame targets are
//! `ln(1 + e)` and predictors are trained against per-symbol averages of that
//! quantity, so predicted values can be fed to a scheme unchanged.
//!
//! A scheme has two sides:
//! - `encode` (training) adjusts the flow output before alignment and exposes
//!   any extra tensors the losses need;
//! - `condition` (inference) folds predicted, frame-expanded prosody into the
//!   prior mean, or into extra channels appended to the sampled latent.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, VarBuilder};

use crate::config::{ProsodyScheme, XvaPitchConfig};
use crate::model::transformer::{EncoderDims, SequenceEncoder};

/// Channel 1 of the overwritten latent holds log-energy divided by this.
const ENERGY_FLOW_SCALE: f64 = 10.0;
/// Extra damping of the energy embedding added to the flow output in training.
const ENERGY_TRAIN_DAMPING: f64 = 0.01;

/// `ln(1 + e)` applied to raw frame energy.
pub fn log_energy(energy: &Tensor) -> Result<Tensor> {
    energy.affine(1.0, 1.0)?.log()
}

// ---------------------------------------------------------------------------
// Predictor
// ---------------------------------------------------------------------------

/// Predicts one value per symbol from text hidden states and the speaker.
#[derive(Debug, Clone)]
pub struct ProsodyPredictor {
    encoder: SequenceEncoder,
}

impl ProsodyPredictor {
    pub fn new(cfg: &XvaPitchConfig, vb: VarBuilder) -> Result<Self> {
        let predictor = &cfg.prosody.predictor;
        let encoder = SequenceEncoder::new(
            EncoderDims {
                in_channels: cfg.text_hidden_channels() + cfg.speaker_emb_dim,
                out_channels: Some(1),
                hidden_channels_ffn: predictor.hidden_channels_ffn,
                num_heads: predictor.num_heads,
                num_layers: predictor.num_layers,
                kernel_size: predictor.kernel_size,
            },
            vb.pp("encoder"),
        )?;
        Ok(Self { encoder })
    }

    /// - `x`: `[B, C, S]` text hidden states
    /// - `g`: `[B, D, 1]` speaker conditioning
    ///
    /// Returns `[B, 1, S]`.
    pub fn forward(&self, x: &Tensor, x_mask: &Tensor, g: &Tensor) -> Result<Tensor> {
        let (batch, _, symbols) = x.dims3()?;
        let speaker = g.broadcast_as((batch, g.dim(1)?, symbols))?;
        let xs = Tensor::cat(&[x, &speaker.to_dtype(x.dtype())?], 1)?;
        self.encoder.forward(&xs.broadcast_mul(x_mask)?, x_mask)
    }
}

// ---------------------------------------------------------------------------
// Scheme interface
// ---------------------------------------------------------------------------

/// Frame-level prosody tracks, each `[B, 1, T]`. `energy` is log-energy.
#[derive(Debug, Clone, Default)]
pub struct FrameProsody {
    pub pitch: Option<Tensor>,
    pub energy: Option<Tensor>,
}

impl FrameProsody {
    fn require_pitch(&self) -> Result<&Tensor> {
        self.pitch
            .as_ref()
            .ok_or_else(|| candle_core::Error::Msg("prosody scheme needs a pitch track".into()))
    }

    fn require_energy(&self) -> Result<&Tensor> {
        self.energy
            .as_ref()
            .ok_or_else(|| candle_core::Error::Msg("prosody scheme needs an energy track".into()))
    }
}

/// Auxiliary channels produced by a widened flow, with the embeddings that
/// supervise them. All `[B, D, T]`.
#[derive(Debug, Clone)]
pub struct AuxLatents {
    pub pitch: Tensor,
    pub pitch_target: Tensor,
    pub energy: Tensor,
    pub energy_target: Tensor,
}

/// Training-side result of a scheme.
#[derive(Debug, Clone)]
pub struct EncodedProsody {
    /// Latent used for alignment and the KL term, `[B, C, T]`.
    pub z_p: Tensor,
    /// Pitch read back out of the latent `[B, 1, T]` (overwrite scheme).
    pub pitch_flow: Option<Tensor>,
    /// Log-energy read back out of the latent `[B, 1, T]` (overwrite scheme).
    pub energy_flow: Option<Tensor>,
    pub aux: Option<AuxLatents>,
}

/// Inference-side result of a scheme.
#[derive(Debug, Clone)]
pub struct ConditionedPrior {
    pub m_p: Tensor,
    /// Channels to append to the sampled latent before the reverse flow.
    pub flow_extra: Option<Tensor>,
}

pub trait ProsodyConditioning {
    fn encode(&self, z_p: &Tensor, targets: &FrameProsody, y_mask: &Tensor) -> Result<EncodedProsody>;

    fn condition(
        &self,
        m_p: &Tensor,
        predicted: &FrameProsody,
        y_mask: &Tensor,
    ) -> Result<ConditionedPrior>;
}

fn embedding_conv(out_channels: usize, vb: VarBuilder) -> Result<Conv1d> {
    let cfg = Conv1dConfig {
        padding: 1,
        ..Default::default()
    };
    candle_nn::conv1d(1, out_channels, 3, cfg, vb)
}

fn embed(conv: &Conv1d, track: &Tensor, y_mask: &Tensor) -> Result<Tensor> {
    conv.forward(track)?.broadcast_mul(y_mask)
}

// ---------------------------------------------------------------------------
// Additive
// ---------------------------------------------------------------------------

/// Embedded pitch is removed from (and embedded energy added to) the flow
/// output during training; inference applies the opposite to the prior mean.
/// The training-side energy embedding is further damped by
/// `ENERGY_TRAIN_DAMPING`, so only the pitch offsets cancel exactly.
#[derive(Debug, Clone)]
pub struct AdditiveScheme {
    pitch_emb: Option<Conv1d>,
    energy_emb: Option<Conv1d>,
    scaling: f64,
}

impl AdditiveScheme {
    pub fn new(cfg: &XvaPitchConfig, vb: VarBuilder) -> Result<Self> {
        let latent = cfg.latent_channels;
        let pitch_emb = if cfg.prosody.pitch {
            Some(embedding_conv(latent, vb.pp("pitch_emb"))?)
        } else {
            None
        };
        let energy_emb = if cfg.prosody.energy {
            Some(embedding_conv(latent, vb.pp("energy_emb"))?)
        } else {
            None
        };
        Ok(Self {
            pitch_emb,
            energy_emb,
            scaling: cfg.prosody.scaling,
        })
    }

    /// `pitch_scale * P + energy_scale * E`.
    fn offset(
        &self,
        like: &Tensor,
        tracks: &FrameProsody,
        y_mask: &Tensor,
        pitch_scale: f64,
        energy_scale: f64,
    ) -> Result<Tensor> {
        let mut offset = like.zeros_like()?;
        if let Some(conv) = &self.pitch_emb {
            let pitch = embed(conv, tracks.require_pitch()?, y_mask)?;
            offset = (offset + (pitch * pitch_scale)?)?;
        }
        if let Some(conv) = &self.energy_emb {
            let energy = embed(conv, tracks.require_energy()?, y_mask)?;
            offset = (offset + (energy * energy_scale)?)?;
        }
        Ok(offset)
    }
}

impl ProsodyConditioning for AdditiveScheme {
    fn encode(&self, z_p: &Tensor, targets: &FrameProsody, y_mask: &Tensor) -> Result<EncodedProsody> {
        let offset = self.offset(
            z_p,
            targets,
            y_mask,
            -self.scaling,
            self.scaling * ENERGY_TRAIN_DAMPING,
        )?;
        let z_p = (z_p + offset)?;
        Ok(EncodedProsody {
            z_p,
            pitch_flow: None,
            energy_flow: None,
            aux: None,
        })
    }

    fn condition(
        &self,
        m_p: &Tensor,
        predicted: &FrameProsody,
        y_mask: &Tensor,
    ) -> Result<ConditionedPrior> {
        let offset = self.offset(m_p, predicted, y_mask, self.scaling, -self.scaling)?;
        let m_p = (m_p + offset)?;
        Ok(ConditionedPrior {
            m_p,
            flow_extra: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Overwrite
// ---------------------------------------------------------------------------

/// Latent channel 0 carries pitch and channel 1 carries scaled log-energy.
/// Those channels are zeroed before alignment and overwritten at inference.
#[derive(Debug, Clone, Default)]
pub struct OverwriteScheme;

impl ProsodyConditioning for OverwriteScheme {
    fn encode(&self, z_p: &Tensor, _targets: &FrameProsody, y_mask: &Tensor) -> Result<EncodedProsody> {
        let (batch, channels, frames) = z_p.dims3()?;
        let pitch_flow = z_p.narrow(1, 0, 1)?.broadcast_mul(y_mask)?;
        let energy_flow = (z_p.narrow(1, 1, 1)? * ENERGY_FLOW_SCALE)?.broadcast_mul(y_mask)?;
        let cleared = Tensor::zeros((batch, 2, frames), z_p.dtype(), z_p.device())?;
        let z_p = Tensor::cat(&[&cleared, &z_p.narrow(1, 2, channels - 2)?], 1)?;
        Ok(EncodedProsody {
            z_p,
            pitch_flow: Some(pitch_flow),
            energy_flow: Some(energy_flow),
            aux: None,
        })
    }

    fn condition(
        &self,
        m_p: &Tensor,
        predicted: &FrameProsody,
        y_mask: &Tensor,
    ) -> Result<ConditionedPrior> {
        let channels = m_p.dim(1)?;
        let pitch = predicted.require_pitch()?.broadcast_mul(y_mask)?;
        let energy = (predicted.require_energy()? / ENERGY_FLOW_SCALE)?.broadcast_mul(y_mask)?;
        let m_p = Tensor::cat(&[&pitch, &energy, &m_p.narrow(1, 2, channels - 2)?], 1)?;
        Ok(ConditionedPrior {
            m_p,
            flow_extra: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Expanded flow
// ---------------------------------------------------------------------------

/// The last flow block widens the latent by `2D` channels that are trained to
/// match embedded pitch and energy, and are filled from predictions at
/// inference.
#[derive(Debug, Clone)]
pub struct ExpandedScheme {
    pitch_emb: Conv1d,
    energy_emb: Conv1d,
    latent_channels: usize,
    dim: usize,
}

impl ExpandedScheme {
    pub fn new(cfg: &XvaPitchConfig, dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            pitch_emb: embedding_conv(dim, vb.pp("pitch_emb"))?,
            energy_emb: embedding_conv(dim, vb.pp("energy_emb"))?,
            latent_channels: cfg.latent_channels,
            dim,
        })
    }
}

impl ProsodyConditioning for ExpandedScheme {
    fn encode(&self, z_p: &Tensor, targets: &FrameProsody, y_mask: &Tensor) -> Result<EncodedProsody> {
        let (c, d) = (self.latent_channels, self.dim);
        let width = z_p.dim(1)?;
        if width != c + 2 * d {
            candle_core::bail!("expanded flow output has {width} channels, expected {}", c + 2 * d);
        }
        let aux = AuxLatents {
            pitch: z_p.narrow(1, c, d)?,
            pitch_target: embed(&self.pitch_emb, targets.require_pitch()?, y_mask)?,
            energy: z_p.narrow(1, c + d, d)?,
            energy_target: embed(&self.energy_emb, targets.require_energy()?, y_mask)?,
        };
        Ok(EncodedProsody {
            z_p: z_p.narrow(1, 0, c)?,
            pitch_flow: None,
            energy_flow: None,
            aux: Some(aux),
        })
    }

    fn condition(
        &self,
        m_p: &Tensor,
        predicted: &FrameProsody,
        y_mask: &Tensor,
    ) -> Result<ConditionedPrior> {
        let pitch = embed(&self.pitch_emb, predicted.require_pitch()?, y_mask)?;
        let energy = embed(&self.energy_emb, predicted.require_energy()?, y_mask)?;
        Ok(ConditionedPrior {
            m_p: m_p.clone(),
            flow_extra: Some(Tensor::cat(&[&pitch, &energy], 1)?),
        })
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

/// The scheme chosen by the configuration.
#[derive(Debug, Clone)]
pub enum ProsodyConditioner {
    Additive(AdditiveScheme),
    OverwriteFlow(OverwriteScheme),
    ExpandedFlow(ExpandedScheme),
}

impl ProsodyConditioner {
    pub fn new(cfg: &XvaPitchConfig, vb: VarBuilder) -> Result<Self> {
        Ok(match cfg.prosody.scheme {
            ProsodyScheme::Additive => Self::Additive(AdditiveScheme::new(cfg, vb)?),
            ProsodyScheme::OverwriteFlow => Self::OverwriteFlow(OverwriteScheme),
            ProsodyScheme::ExpandedFlow { dim } => {
                Self::ExpandedFlow(ExpandedScheme::new(cfg, dim, vb)?)
            }
        })
    }

    fn scheme(&self) -> &dyn ProsodyConditioning {
        match self {
            Self::Additive(s) => s,
            Self::OverwriteFlow(s) => s,
            Self::ExpandedFlow(s) => s,
        }
    }
}

impl ProsodyConditioning for ProsodyConditioner {
    fn encode(&self, z_p: &Tensor, targets: &FrameProsody, y_mask: &Tensor) -> Result<EncodedProsody> {
        self.scheme().encode(z_p, targets, y_mask)
    }

    fn condition(
        &self,
        m_p: &Tensor,
        predicted: &FrameProsody,
        y_mask: &Tensor,
    ) -> Result<ConditionedPrior> {
        self.scheme().condition(m_p, predicted, y_mask)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mask::time_mask;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn tracks(dev: &Device) -> FrameProsody {
        FrameProsody {
            pitch: Some(Tensor::randn(0f32, 1.0, (1, 1, 6), dev).unwrap()),
            energy: Some(Tensor::randn(0f32, 1.0, (1, 1, 6), dev).unwrap()),
        }
    }

    fn config(scheme: ProsodyScheme) -> XvaPitchConfig {
        let mut cfg = XvaPitchConfig {
            latent_channels: 8,
            ..Default::default()
        };
        cfg.prosody.energy = true;
        cfg.prosody.scheme = scheme;
        cfg
    }

    fn max_abs(xs: &Tensor) -> f32 {
        xs.abs().unwrap().max_all().unwrap().to_scalar().unwrap()
    }

    #[test]
    fn test_additive_pitch_condition_undoes_encode() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut cfg = config(ProsodyScheme::Additive);
        cfg.prosody.energy = false;
        let scheme = ProsodyConditioner::new(&cfg, vb).unwrap();
        let mask = time_mask(&[6], 6, DType::F32, &dev).unwrap();
        let m = Tensor::randn(0f32, 1.0, (1, 8, 6), &dev).unwrap();
        let t = tracks(&dev);

        let conditioned = scheme.condition(&m, &t, &mask).unwrap();
        assert!(conditioned.flow_extra.is_none());
        assert!(max_abs(&(&conditioned.m_p - &m).unwrap()) > 1e-4);
        let encoded = scheme.encode(&conditioned.m_p, &t, &mask).unwrap();
        assert!(max_abs(&(encoded.z_p - &m).unwrap()) < 1e-5);
    }

    #[test]
    fn test_additive_energy_is_damped_in_training() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let mut cfg = config(ProsodyScheme::Additive);
        cfg.prosody.pitch = false;
        let scheme = ProsodyConditioner::new(&cfg, vb).unwrap();
        let mask = time_mask(&[6], 6, DType::F32, &dev).unwrap();
        let zeros = Tensor::zeros((1, 8, 6), DType::F32, &dev).unwrap();
        let t = tracks(&dev);

        // inference subtracts s * E, training adds 0.01 * s * E
        let inference = scheme.condition(&zeros, &t, &mask).unwrap().m_p;
        let training = scheme.encode(&zeros, &t, &mask).unwrap().z_p;
        assert!(max_abs(&inference) > 1e-3);
        let residual = (training + (inference * ENERGY_TRAIN_DAMPING).unwrap()).unwrap();
        assert!(max_abs(&residual) < 1e-6);
    }

    #[test]
    fn test_overwrite_channels() {
        let dev = Device::Cpu;
        let scheme = OverwriteScheme;
        let mask = time_mask(&[6], 6, DType::F32, &dev).unwrap();
        let z = Tensor::randn(0f32, 1.0, (1, 8, 6), &dev).unwrap();
        let encoded = scheme.encode(&z, &FrameProsody::default(), &mask).unwrap();
        let cleared: f32 = encoded
            .z_p
            .narrow(1, 0, 2)
            .unwrap()
            .abs()
            .unwrap()
            .sum_all()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert_eq!(cleared, 0.0);
        let energy_flow: Vec<f32> = encoded.energy_flow.unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let channel1: Vec<f32> = z.narrow(1, 1, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        for (a, b) in energy_flow.iter().zip(channel1.iter()) {
            assert!((a - b * 10.0).abs() < 1e-5);
        }

        let t = tracks(&dev);
        let prior = scheme.condition(&z, &t, &mask).unwrap();
        let pitch: Vec<f32> = prior.m_p.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let expected: Vec<f32> = t.pitch.unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(pitch, expected);
    }

    #[test]
    fn test_expanded_splits_aux_channels() {
        let dev = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let scheme =
            ProsodyConditioner::new(&config(ProsodyScheme::ExpandedFlow { dim: 3 }), vb).unwrap();
        let mask = time_mask(&[6], 6, DType::F32, &dev).unwrap();
        let z = Tensor::randn(0f32, 1.0, (1, 14, 6), &dev).unwrap();
        let t = tracks(&dev);
        let encoded = scheme.encode(&z, &t, &mask).unwrap();
        assert_eq!(encoded.z_p.dims(), &[1, 8, 6]);
        let aux = encoded.aux.unwrap();
        assert_eq!(aux.pitch.dims(), &[1, 3, 6]);
        assert_eq!(aux.energy_target.dims(), &[1, 3, 6]);

        let prior = scheme.condition(&encoded.z_p, &t, &mask).unwrap();
        assert_eq!(prior.flow_extra.unwrap().dims(), &[1, 6, 6]);

        let narrow = Tensor::zeros((1, 8, 6), DType::F32, &dev).unwrap();
        assert!(scheme.encode(&narrow, &t, &mask).is_err());
    }

    #[test]
    fn test_predictor_shape() {
        let dev = Device::Cpu;
        let mut cfg = config(ProsodyScheme::Additive);
        cfg.speaker_emb_dim = 4;
        cfg.prosody.predictor.num_layers = 1;
        cfg.prosody.predictor.hidden_channels_ffn = 8;
        let vb = VarBuilder::zeros(DType::F32, &dev);
        let predictor = ProsodyPredictor::new(&cfg, vb).unwrap();
        let x = Tensor::randn(0f32, 1.0, (2, 12, 5), &dev).unwrap();
        let mask = time_mask(&[5, 3], 5, DType::F32, &dev).unwrap();
        let g = Tensor::randn(0f32, 1.0, (2, 4, 1), &dev).unwrap();
        assert_eq!(predictor.forward(&x, &mask, &g).unwrap().dims(), &[2, 1, 5]);
    }

    #[test]
    fn test_log_energy() {
        let dev = Device::Cpu;
        let e = Tensor::new(&[0f32, std::f32::consts::E - 1.0], &dev).unwrap();
        let got: Vec<f32> = log_energy(&e).unwrap().to_vec1().unwrap();
        assert!(got[0].abs() < 1e-6);
        assert!((got[1] - 1.0).abs() < 1e-6);
    }
}
