//! Configuration for the xVAPitch model.
//!
//! One immutable value describes the whole model. Optional sub-modules
//! (pitch/energy predictors, the language-adversarial classifier) are
//! switched here once and then exist as `Option` components on the model.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Number of entries in the language table shipped with the symbol set.
pub const NUM_LANGUAGES: usize = 31;

/// Top-level model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct XvaPitchConfig {
    // --- Vocabulary / conditioning ---
    pub num_symbols: usize,
    pub num_languages: usize,
    pub language_emb_dim: usize,
    pub speaker_emb_dim: usize,
    /// Multiplier applied to the language embedding before use.
    pub language_weight: f64,

    // --- Latent space ---
    pub latent_channels: usize,
    /// Linear spectrogram bins fed to the posterior encoder.
    pub spec_channels: usize,

    // --- Audio framing ---
    pub hop_length: usize,
    pub sample_rate: u32,
    /// Latent frames per random training crop.
    pub segment_size: usize,

    pub text_encoder: TextEncoderConfig,
    pub posterior: PosteriorConfig,
    pub flow: FlowConfig,
    pub duration: DurationPredictorConfig,
    pub prosody: ProsodyConfig,
    pub language_adversarial: Option<ReversalConfig>,
    pub vocoder: VocoderConfig,
    pub discriminator: DiscriminatorConfig,
    pub inference: InferenceConfig,
}

impl Default for XvaPitchConfig {
    fn default() -> Self {
        Self {
            num_symbols: 165,
            num_languages: NUM_LANGUAGES,
            language_emb_dim: 4,
            speaker_emb_dim: 512,
            language_weight: 1.0,
            latent_channels: 192,
            spec_channels: 513,
            hop_length: 256,
            sample_rate: 22050,
            segment_size: 32,
            text_encoder: TextEncoderConfig::default(),
            posterior: PosteriorConfig::default(),
            flow: FlowConfig::default(),
            duration: DurationPredictorConfig::default(),
            prosody: ProsodyConfig::default(),
            language_adversarial: None,
            vocoder: VocoderConfig::default(),
            discriminator: DiscriminatorConfig::default(),
            inference: InferenceConfig::default(),
        }
    }
}

impl XvaPitchConfig {
    /// The "big" variant: wider latent space and language embedding.
    pub fn big() -> Self {
        Self {
            language_emb_dim: 12,
            latent_channels: 256,
            ..Self::default()
        }
    }

    /// Load a JSON config; missing fields take their default values.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.verify()?;
        Ok(cfg)
    }

    /// Channel width of the text encoder output (symbol hidden + language).
    pub fn text_hidden_channels(&self) -> usize {
        self.latent_channels + self.language_emb_dim
    }

    /// Channel width of the coupling-flow conditioning vector.
    pub fn flow_cond_channels(&self) -> usize {
        if self.flow.language_conditioning {
            self.speaker_emb_dim + self.language_emb_dim
        } else {
            self.speaker_emb_dim
        }
    }

    /// Extra channels appended by the expanded flow block, if any.
    pub fn expanded_flow_dim(&self) -> Option<usize> {
        match self.prosody.scheme {
            ProsodyScheme::ExpandedFlow { dim } => Some(dim),
            _ => None,
        }
    }

    /// Validate invariants that would otherwise surface as shape errors
    /// deep inside a forward pass.
    pub fn verify(&self) -> Result<()> {
        if self.latent_channels == 0 || self.latent_channels % 2 != 0 {
            return Err(Error::Config(format!(
                "latent_channels must be even for the coupling split, got {}",
                self.latent_channels
            )));
        }
        if let Some(dim) = self.expanded_flow_dim()
            && dim == 0
        {
            return Err(Error::Config("expanded flow dim must be positive".into()));
        }
        if self.text_encoder.num_heads == 0 {
            return Err(Error::Config("text encoder needs at least one head".into()));
        }
        if self.text_hidden_channels() % self.text_encoder.num_heads != 0 {
            return Err(Error::Config(format!(
                "text hidden width {} not divisible by {} heads",
                self.text_hidden_channels(),
                self.text_encoder.num_heads
            )));
        }
        if self.prosody.pitch || self.prosody.energy {
            if self.prosody.predictor.num_heads == 0 {
                return Err(Error::Config("prosody predictor needs at least one head".into()));
            }
            let width = self.text_hidden_channels() + self.speaker_emb_dim;
            if width % self.prosody.predictor.num_heads != 0 {
                return Err(Error::Config(format!(
                    "prosody predictor width {width} not divisible by {} heads",
                    self.prosody.predictor.num_heads
                )));
            }
        }
        if self.prosody.scheme != ProsodyScheme::Additive
            && !(self.prosody.pitch && self.prosody.energy)
        {
            return Err(Error::Config(format!(
                "{:?} needs both pitch and energy predictors",
                self.prosody.scheme
            )));
        }
        if self.segment_size == 0 {
            return Err(Error::Config("segment_size must be positive".into()));
        }
        if self.language_emb_dim == 0 || self.num_languages == 0 {
            return Err(Error::Config("language table must not be empty".into()));
        }
        self.vocoder.verify(self.hop_length)?;
        self.discriminator.verify()?;
        Ok(())
    }
}

/// Transformer text encoder hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TextEncoderConfig {
    pub hidden_channels_ffn: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub kernel_size: usize,
}

impl Default for TextEncoderConfig {
    fn default() -> Self {
        Self {
            hidden_channels_ffn: 768,
            num_heads: 2,
            num_layers: 10,
            kernel_size: 3,
        }
    }
}

/// Posterior (spectrogram) encoder hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PosteriorConfig {
    pub kernel_size: usize,
    pub dilation_rate: usize,
    pub num_layers: usize,
}

impl Default for PosteriorConfig {
    fn default() -> Self {
        Self {
            kernel_size: 5,
            dilation_rate: 1,
            num_layers: 16,
        }
    }
}

/// Residual coupling flow hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub num_flows: usize,
    pub kernel_size: usize,
    pub dilation_rate: usize,
    pub num_layers: usize,
    /// Condition the flow on `[speaker; language]` instead of speaker only.
    pub language_conditioning: bool,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            num_flows: 4,
            kernel_size: 5,
            dilation_rate: 1,
            num_layers: 4,
            language_conditioning: false,
        }
    }
}

/// Stochastic duration predictor hyper-parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DurationPredictorConfig {
    pub kernel_size: usize,
    pub num_flows: usize,
    /// Stop gradients from the duration loss reaching the text encoder.
    pub detach_input: bool,
}

impl Default for DurationPredictorConfig {
    fn default() -> Self {
        Self {
            kernel_size: 3,
            num_flows: 4,
            detach_input: true,
        }
    }
}

/// How predicted pitch/energy reach the latent space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProsodyScheme {
    /// Embedded pitch/energy are subtracted from/added to the latents.
    Additive,
    /// Latent channels 0 and 1 carry pitch and energy directly.
    OverwriteFlow,
    /// The last flow block widens the latent by `2 * dim` auxiliary channels.
    ExpandedFlow { dim: usize },
}

/// Pitch/energy prediction and conditioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProsodyConfig {
    pub pitch: bool,
    pub energy: bool,
    pub scheme: ProsodyScheme,
    /// Scale applied to embedded pitch/energy before they touch the latents.
    pub scaling: f64,
    pub predictor: PredictorConfig,
}

impl Default for ProsodyConfig {
    fn default() -> Self {
        Self {
            pitch: true,
            energy: false,
            scheme: ProsodyScheme::Additive,
            scaling: 0.1,
            predictor: PredictorConfig::default(),
        }
    }
}

/// Transformer hyper-parameters of the per-symbol pitch/energy predictor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictorConfig {
    pub hidden_channels_ffn: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub kernel_size: usize,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            hidden_channels_ffn: 768,
            num_heads: 2,
            num_layers: 3,
            kernel_size: 3,
        }
    }
}

/// Language-adversarial classifier behind a gradient-reversal layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReversalConfig {
    pub hidden_dim: usize,
    /// Gradients are clamped to `[-gradient_clip, gradient_clip]`.
    pub gradient_clip: f64,
    /// Multiplier of the reversed gradient.
    pub scale_factor: f64,
}

impl Default for ReversalConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 192,
            gradient_clip: 0.25,
            scale_factor: 1.0,
        }
    }
}

/// HiFi-GAN generator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VocoderConfig {
    /// Upsample rates (product must equal the hop length).
    pub upsample_rates: Vec<usize>,
    pub upsample_kernel_sizes: Vec<usize>,
    pub resblock_kernel_sizes: Vec<usize>,
    pub resblock_dilation_sizes: Vec<Vec<usize>>,
    pub upsample_initial_channel: usize,
}

impl Default for VocoderConfig {
    fn default() -> Self {
        Self {
            upsample_rates: vec![8, 8, 2, 2],
            upsample_kernel_sizes: vec![16, 16, 4, 4],
            resblock_kernel_sizes: vec![3, 7, 11],
            resblock_dilation_sizes: vec![vec![1, 3, 5], vec![1, 3, 5], vec![1, 3, 5]],
            upsample_initial_channel: 512,
        }
    }
}

impl VocoderConfig {
    /// Verify that upsample rates multiply to the hop length and that the
    /// per-stage lists line up.
    pub fn verify(&self, hop_length: usize) -> Result<()> {
        let product: usize = self.upsample_rates.iter().product();
        if product != hop_length {
            return Err(Error::Config(format!(
                "upsample_rates product is {product}, expected {hop_length} (hop_length)"
            )));
        }
        if self.upsample_rates.len() != self.upsample_kernel_sizes.len() {
            return Err(Error::Config(
                "upsample_rates and upsample_kernel_sizes differ in length".into(),
            ));
        }
        if self.resblock_kernel_sizes.len() != self.resblock_dilation_sizes.len() {
            return Err(Error::Config(
                "resblock kernel and dilation lists differ in length".into(),
            ));
        }
        if self.upsample_initial_channel >> self.upsample_rates.len() == 0 {
            return Err(Error::Config(
                "upsample_initial_channel too small for the number of stages".into(),
            ));
        }
        Ok(())
    }
}

/// Multi-period discriminator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscriminatorConfig {
    pub periods: Vec<usize>,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            periods: vec![2, 3, 5, 7, 11],
        }
    }
}

impl DiscriminatorConfig {
    pub fn verify(&self) -> Result<()> {
        if self.periods.is_empty() || self.periods.contains(&0) {
            return Err(Error::Config(format!(
                "periods must be non-empty and positive, got {:?}",
                self.periods
            )));
        }
        Ok(())
    }
}

/// Sampling controls used at inference time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Global duration multiplier.
    pub length_scale: f64,
    /// Noise scale of the prior sample `z_p = m_p + eps * exp(logs_p) * scale`.
    pub noise_scale: f64,
    /// Noise scale of the duration predictor's reverse flow.
    pub noise_scale_dp: f64,
    /// Truncate the decoded latent to this many frames.
    pub max_len: Option<usize>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            length_scale: 1.0,
            noise_scale: 0.0,
            noise_scale_dp: 0.333,
            max_len: None,
        }
    }
}
