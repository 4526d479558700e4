//! End-to-end inference pipeline.
//!
//! Loads a JSON config plus safetensors weights and turns one utterance
//! (symbol ids, a speaker embedding and a language id) into mono audio:
//! 1. Normalise the speaker embedding
//! 2. Encode symbols and sample durations
//! 3. Predict pitch/energy and condition the prior
//! 4. Sample the prior latent, invert the flow
//! 5. Decode with the HiFi-GAN generator

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;

use crate::config::XvaPitchConfig;
use crate::model::speaker::SpeakerEncoder;
use crate::model::{InferenceOptions, Language, XvaPitch};
use crate::{Error, Result};

/// Mono audio produced by the pipeline.
#[derive(Debug, Clone)]
pub struct AudioOutput {
    /// Samples in [-1, 1].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioOutput {
    pub fn duration_s(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Per-utterance synthesis controls.
#[derive(Debug, Clone)]
pub struct SynthesisParams {
    /// Symbol ids of the utterance.
    pub symbols: Vec<u32>,
    /// Index into the language table.
    pub language_id: u32,
    /// Speaker embedding, `speaker_emb_dim` values.
    pub speaker: Vec<f32>,
    /// Duration multiplier: > 1 speaks slower.
    pub pacing: f64,
}

pub struct XvaPitchPipeline {
    model: XvaPitch,
    cfg: XvaPitchConfig,
    device: Device,
}

impl XvaPitchPipeline {
    /// Load from a JSON config and one or more safetensors shards.
    pub fn load(config_path: &Path, weights: &[PathBuf], device: &Device, dtype: DType) -> Result<Self> {
        tracing::info!("Loading config from {:?}", config_path);
        let cfg = XvaPitchConfig::from_json_file(config_path)?;

        if weights.is_empty() {
            return Err(Error::WeightLoad("no weight files given".into()));
        }
        for path in weights {
            if !path.exists() {
                return Err(Error::WeightLoad(format!("{} not found", path.display())));
            }
        }

        tracing::info!("Loading xVAPitch weights from {:?}", weights);
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(weights, dtype, device)
                .map_err(|e| Error::WeightLoad(format!("xVAPitch weights: {e}")))?
        };
        let model = XvaPitch::new(&cfg, vb)?;
        tracing::info!("xVAPitch pipeline loaded");
        Ok(Self::from_model(model, device))
    }

    /// Wrap an already constructed model.
    pub fn from_model(model: XvaPitch, device: &Device) -> Self {
        Self {
            cfg: model.config().clone(),
            model,
            device: device.clone(),
        }
    }

    pub fn config(&self) -> &XvaPitchConfig {
        &self.cfg
    }

    pub fn model(&self) -> &XvaPitch {
        &self.model
    }

    /// Synthesise one utterance.
    pub fn synthesize(&self, params: &SynthesisParams) -> Result<AudioOutput> {
        if params.symbols.is_empty() {
            return Err(Error::Config("cannot synthesise an empty symbol sequence".into()));
        }
        if params.speaker.len() != self.cfg.speaker_emb_dim {
            return Err(Error::Config(format!(
                "speaker embedding has {} values, expected {}",
                params.speaker.len(),
                self.cfg.speaker_emb_dim
            )));
        }
        if params.language_id as usize >= self.cfg.num_languages {
            return Err(Error::Config(format!(
                "language id {} outside a table of {}",
                params.language_id, self.cfg.num_languages
            )));
        }
        if !(params.pacing > 0.0) {
            return Err(Error::Config(format!("pacing must be positive, got {}", params.pacing)));
        }

        let tokens = Tensor::new(params.symbols.as_slice(), &self.device)?.unsqueeze(0)?;
        let language = Tensor::new(&[params.language_id], &self.device)?;
        let speaker = Tensor::new(params.speaker.as_slice(), &self.device)?.unsqueeze(0)?;
        let opts = InferenceOptions {
            pacing: params.pacing,
            ..InferenceOptions::from_config(&self.cfg)
        };

        tracing::debug!(symbols = params.symbols.len(), "synthesising");
        let wav = self
            .model
            .infer(&tokens, None, Language::Ids(&language), &speaker, &opts)?;
        let samples: Vec<f32> = wav.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        Ok(AudioOutput {
            samples,
            sample_rate: self.cfg.sample_rate,
        })
    }

    /// Compute a speaker embedding from reference audio with an external
    /// encoder.
    pub fn embed_speaker(&self, encoder: &dyn SpeakerEncoder, audio: &[f32]) -> Result<Vec<f32>> {
        if encoder.embedding_dim() != self.cfg.speaker_emb_dim {
            return Err(Error::Config(format!(
                "speaker encoder produces {} values, model expects {}",
                encoder.embedding_dim(),
                self.cfg.speaker_emb_dim
            )));
        }
        let audio = Tensor::new(audio, &self.device)?.unsqueeze(0)?;
        let embedding = encoder.embed(&audio)?;
        Ok(embedding.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DurationPredictorConfig, FlowConfig, PosteriorConfig, PredictorConfig, TextEncoderConfig,
        VocoderConfig,
    };

    fn tiny_config() -> XvaPitchConfig {
        XvaPitchConfig {
            num_symbols: 12,
            speaker_emb_dim: 4,
            latent_channels: 4,
            spec_channels: 6,
            hop_length: 4,
            text_encoder: TextEncoderConfig {
                hidden_channels_ffn: 8,
                num_heads: 2,
                num_layers: 1,
                kernel_size: 3,
            },
            posterior: PosteriorConfig {
                kernel_size: 3,
                dilation_rate: 1,
                num_layers: 1,
            },
            flow: FlowConfig {
                num_flows: 1,
                kernel_size: 3,
                dilation_rate: 1,
                num_layers: 1,
                language_conditioning: false,
            },
            duration: DurationPredictorConfig {
                kernel_size: 3,
                num_flows: 1,
                detach_input: true,
            },
            vocoder: VocoderConfig {
                upsample_rates: vec![4],
                upsample_kernel_sizes: vec![8],
                resblock_kernel_sizes: vec![3],
                resblock_dilation_sizes: vec![vec![1]],
                upsample_initial_channel: 4,
            },
            prosody: crate::config::ProsodyConfig {
                predictor: PredictorConfig {
                    hidden_channels_ffn: 8,
                    num_heads: 2,
                    num_layers: 1,
                    kernel_size: 3,
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    struct ConstantEncoder(usize);

    impl SpeakerEncoder for ConstantEncoder {
        fn embedding_dim(&self) -> usize {
            self.0
        }

        fn embed(&self, audio: &Tensor) -> candle_core::Result<Tensor> {
            Tensor::ones((audio.dim(0)?, self.0), DType::F32, audio.device())
        }
    }

    fn pipeline() -> XvaPitchPipeline {
        let dev = Device::Cpu;
        let cfg = tiny_config();
        let model = XvaPitch::new(&cfg, VarBuilder::zeros(DType::F32, &dev)).unwrap();
        XvaPitchPipeline::from_model(model, &dev)
    }

    #[test]
    fn test_synthesize_rejects_bad_inputs() {
        let p = pipeline();
        let good = SynthesisParams {
            symbols: vec![1, 2, 3],
            language_id: 0,
            speaker: vec![0.5; 4],
            pacing: 1.0,
        };
        let empty = SynthesisParams {
            symbols: vec![],
            ..good.clone()
        };
        assert!(matches!(p.synthesize(&empty), Err(Error::Config(_))));
        let wrong_speaker = SynthesisParams {
            speaker: vec![0.5; 3],
            ..good.clone()
        };
        assert!(matches!(p.synthesize(&wrong_speaker), Err(Error::Config(_))));
        let bad_language = SynthesisParams {
            language_id: 99,
            ..good.clone()
        };
        assert!(matches!(p.synthesize(&bad_language), Err(Error::Config(_))));
        let bad_pacing = SynthesisParams { pacing: 0.0, ..good };
        assert!(matches!(p.synthesize(&bad_pacing), Err(Error::Config(_))));
    }

    #[test]
    fn test_synthesize_shapes() {
        let p = pipeline();
        let audio = p
            .synthesize(&SynthesisParams {
                symbols: vec![1, 2, 3],
                language_id: 2,
                speaker: vec![0.5; 4],
                pacing: 1.0,
            })
            .unwrap();
        assert_eq!(audio.sample_rate, 22050);
        // at least one frame per utterance
        assert!(audio.samples.len() >= 4);
        assert_eq!(audio.samples.len() % 4, 0);
    }

    #[test]
    fn test_embed_speaker_checks_width() {
        let p = pipeline();
        let audio = vec![0.0f32; 100];
        assert_eq!(p.embed_speaker(&ConstantEncoder(4), &audio).unwrap(), vec![1.0; 4]);
        assert!(p.embed_speaker(&ConstantEncoder(5), &audio).is_err());
    }

    #[test]
    fn test_load_missing_weights() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.json");
        std::fs::write(&config, serde_json::to_string(&tiny_config()).unwrap()).unwrap();
        let missing = vec![dir.path().join("model.safetensors")];
        let err = XvaPitchPipeline::load(&config, &missing, &Device::Cpu, DType::F32);
        assert!(matches!(err, Err(Error::WeightLoad(_))));
    }
}
