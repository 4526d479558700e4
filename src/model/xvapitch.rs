//! The xVAPitch model.
//!
//! Training (`train_step`) encodes the spectrogram into posterior latents,
//! maps them through the coupling flow, aligns them against the text prior
//! with monotonic alignment search, and trains the duration and prosody
//! predictors on the resulting durations. The vocoder sees a random crop of
//! the posterior latents.
//!
//! Inference (`infer`) replaces the search with sampled durations, expands
//! the prior along them, samples a latent, inverts the flow and decodes.
//!
//! Every call is stateless apart from the learned parameters.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, VarBuilder};
use rand::Rng;

use crate::config::XvaPitchConfig;
use crate::model::alignment;
use crate::model::discriminator::{DiscriminatorOutput, VitsDiscriminator};
use crate::model::duration_predictor::StochasticDurationPredictor;
use crate::model::flow::ResidualCouplingFlow;
use crate::model::loss;
use crate::model::mask::{alignment_mask, time_mask, validate_lengths};
use crate::model::path::{average_by_durations, expand_with_path, generate_path};
use crate::model::posterior::PosteriorEncoder;
use crate::model::prosody::{
    AuxLatents, EncodedProsody, FrameProsody, ProsodyConditioner, ProsodyConditioning,
    ProsodyPredictor, log_energy,
};
use crate::model::reversal::ReversalClassifier;
use crate::model::segment::{rand_segments, slice_segments};
use crate::model::speaker::speaker_conditioning;
use crate::model::text_encoder::{TextEncoder, TextEncoding};
use crate::model::vocoder::HifiganGenerator;
use crate::{Error, Result};

/// Language input for one batch.
#[derive(Debug, Clone, Copy)]
pub enum Language<'a> {
    /// One language id per item, `[B]`.
    Ids(&'a Tensor),
    /// Per-symbol language embeddings `[B, S, L]` for mixed-language input.
    PerSymbol(&'a Tensor),
}

/// Language embeddings in the three shapes the sub-modules consume.
struct LanguageContext {
    /// `[B, S, L]`, appended to every symbol embedding.
    per_symbol: Tensor,
    /// `[B, L, 1]` when a single language per item is known.
    global: Option<Tensor>,
    /// `[B, L, 1]` or `[B, L, S]` for the duration predictor.
    duration_cond: Tensor,
}

/// One training batch. Lengths are valid prefixes of the padded axes.
#[derive(Debug, Clone, Copy)]
pub struct TrainBatch<'a> {
    /// `[B, S]` symbol ids.
    pub tokens: &'a Tensor,
    pub token_lengths: &'a [usize],
    /// `[B, F, T]` linear spectrogram.
    pub spec: &'a Tensor,
    pub spec_lengths: &'a [usize],
    /// `[B, 1, T * hop]` waveform.
    pub waveform: &'a Tensor,
    /// `[B, D]` speaker embeddings.
    pub d_vectors: &'a Tensor,
    /// `[B]` language ids.
    pub language_ids: &'a Tensor,
    /// `[B, 1, T]` frame pitch, zero where unvoiced.
    pub pitch: Option<&'a Tensor>,
    /// `[B, 1, T]` raw frame energy.
    pub energy: Option<&'a Tensor>,
}

/// A per-symbol prediction with its target, both `[B, 1, S]`.
#[derive(Debug, Clone)]
pub struct ProsodyOutput {
    pub prediction: Tensor,
    pub target: Tensor,
}

/// Everything the training losses need from one step.
#[derive(Debug, Clone)]
pub struct TrainOutput {
    /// Generated waveform crop `[B, 1, segment * hop]`.
    pub waveform_hat: Tensor,
    /// Matching crop of the real waveform.
    pub waveform_segment: Tensor,
    /// Latent-frame offsets of the crops.
    pub slice_offsets: Vec<usize>,
    pub z: Tensor,
    /// Flow output used for alignment `[B, C, T]`.
    pub z_p: Tensor,
    /// Prior statistics expanded to frames `[B, C, T]`.
    pub m_p: Tensor,
    pub logs_p: Tensor,
    pub m_q: Tensor,
    pub logs_q: Tensor,
    pub x_mask: Tensor,
    pub y_mask: Tensor,
    /// Hard alignment `[B, S, T]`.
    pub alignment: Tensor,
    /// Frames per symbol `[B, S]`.
    pub durations: Tensor,
    /// Duration NLL normalised by the symbol count.
    pub loss_duration: Tensor,
    pub pitch: Option<ProsodyOutput>,
    pub energy: Option<ProsodyOutput>,
    /// Pitch read from the latent, averaged per symbol (overwrite scheme).
    pub pitch_flow: Option<ProsodyOutput>,
    pub energy_flow: Option<ProsodyOutput>,
    pub aux: Option<AuxLatents>,
    /// Language logits `[B, T, num_languages]`.
    pub language_logits: Option<Tensor>,
}

impl TrainOutput {
    pub fn kl_loss(&self) -> Result<Tensor> {
        Ok(loss::kl_loss(
            &self.z_p,
            &self.logs_q,
            &self.m_p,
            &self.logs_p,
            &self.y_mask,
        )?)
    }

    /// Sum of masked MSE terms of every prosody output present.
    pub fn prosody_loss(&self) -> Result<Option<Tensor>> {
        let mut total: Option<Tensor> = None;
        let mut add = |term: Tensor| -> Result<()> {
            total = Some(match total.take() {
                Some(t) => (t + term)?,
                None => term,
            });
            Ok(())
        };
        for out in [&self.pitch, &self.energy, &self.pitch_flow, &self.energy_flow]
            .into_iter()
            .flatten()
        {
            add(loss::masked_mse(&out.prediction, &out.target, &self.x_mask)?)?;
        }
        if let Some(aux) = &self.aux {
            add(loss::masked_mse(&aux.pitch, &aux.pitch_target, &self.y_mask)?)?;
            add(loss::masked_mse(&aux.energy, &aux.energy_target, &self.y_mask)?)?;
        }
        Ok(total)
    }

    /// Cross-entropy of the language classifier over valid frames.
    pub fn language_loss(&self, spec_lengths: &[usize], language_ids: &Tensor) -> Result<Option<Tensor>> {
        self.language_logits
            .as_ref()
            .map(|logits| ReversalClassifier::loss(spec_lengths, language_ids, logits))
            .transpose()
    }
}

/// Output of [`XvaPitch::train_vocoder_only`].
#[derive(Debug, Clone)]
pub struct VocoderTrainOutput {
    pub waveform_hat: Tensor,
    pub waveform_segment: Tensor,
    pub slice_offsets: Vec<usize>,
    pub m_q: Tensor,
    pub logs_q: Tensor,
    pub y_mask: Tensor,
}

/// Generator-side loss terms of one step.
#[derive(Debug, Clone)]
pub struct GeneratorLosses {
    pub adversarial: Tensor,
    pub feature_matching: Tensor,
    pub kl: Tensor,
    pub duration: Tensor,
    pub prosody: Option<Tensor>,
}

/// Sampling controls for inference.
#[derive(Debug, Clone, Copy)]
pub struct InferenceOptions {
    pub length_scale: f64,
    /// Extra duration multiplier applied on top of `length_scale`.
    pub pacing: f64,
    pub noise_scale: f64,
    pub noise_scale_dp: f64,
    pub max_len: Option<usize>,
}

impl InferenceOptions {
    pub fn from_config(cfg: &XvaPitchConfig) -> Self {
        Self {
            length_scale: cfg.inference.length_scale,
            pacing: 1.0,
            noise_scale: cfg.inference.noise_scale,
            noise_scale_dp: cfg.inference.noise_scale_dp,
            max_len: cfg.inference.max_len,
        }
    }
}

/// Durations and alignment predicted from text.
struct PredictedAlignment {
    text: TextEncoding,
    g: Tensor,
    lang: LanguageContext,
    /// Ceiled durations `[B, 1, S]`.
    w_ceil: Tensor,
    y_mask: Tensor,
    attn: Tensor,
}

#[derive(Debug, Clone)]
pub struct XvaPitch {
    cfg: XvaPitchConfig,
    text_encoder: TextEncoder,
    posterior_encoder: PosteriorEncoder,
    flow: ResidualCouplingFlow,
    duration_predictor: StochasticDurationPredictor,
    emb_l: Embedding,
    pitch_predictor: Option<ProsodyPredictor>,
    energy_predictor: Option<ProsodyPredictor>,
    prosody: Option<ProsodyConditioner>,
    reversal_classifier: Option<ReversalClassifier>,
    waveform_decoder: HifiganGenerator,
    discriminator: Option<VitsDiscriminator>,
    device: Device,
    dtype: DType,
}

impl XvaPitch {
    /// Build the generator side of the model. The discriminator is attached
    /// separately with [`XvaPitch::with_discriminator`].
    pub fn new(cfg: &XvaPitchConfig, vb: VarBuilder) -> Result<Self> {
        cfg.verify()?;
        let text_encoder = TextEncoder::new(cfg, vb.pp("text_encoder"))?;
        let posterior_encoder = PosteriorEncoder::new(cfg, vb.pp("posterior_encoder"))?;
        let flow = ResidualCouplingFlow::new(cfg, vb.pp("flow"))?;
        let duration_predictor = StochasticDurationPredictor::new(cfg, vb.pp("duration_predictor"))?;
        let emb_l = candle_nn::embedding(cfg.num_languages, cfg.language_emb_dim, vb.pp("emb_l"))?;

        let pitch_predictor = if cfg.prosody.pitch {
            Some(ProsodyPredictor::new(cfg, vb.pp("pitch_predictor"))?)
        } else {
            None
        };
        let energy_predictor = if cfg.prosody.energy {
            Some(ProsodyPredictor::new(cfg, vb.pp("energy_predictor"))?)
        } else {
            None
        };
        let prosody = if cfg.prosody.pitch || cfg.prosody.energy {
            Some(ProsodyConditioner::new(cfg, vb.clone())?)
        } else {
            None
        };
        let reversal_classifier = match &cfg.language_adversarial {
            Some(rc) => Some(ReversalClassifier::new(
                cfg.latent_channels,
                cfg.num_languages,
                rc,
                vb.pp("reversal_classifier"),
            )?),
            None => None,
        };
        let waveform_decoder = HifiganGenerator::new(
            cfg.latent_channels,
            cfg.speaker_emb_dim,
            &cfg.vocoder,
            vb.pp("waveform_decoder"),
        )?;

        tracing::info!(
            latent = cfg.latent_channels,
            language_dim = cfg.language_emb_dim,
            pitch = cfg.prosody.pitch,
            energy = cfg.prosody.energy,
            scheme = ?cfg.prosody.scheme,
            language_adversarial = cfg.language_adversarial.is_some(),
            "xVAPitch model constructed"
        );

        Ok(Self {
            cfg: cfg.clone(),
            text_encoder,
            posterior_encoder,
            flow,
            duration_predictor,
            emb_l,
            pitch_predictor,
            energy_predictor,
            prosody,
            reversal_classifier,
            waveform_decoder,
            discriminator: None,
            device: vb.device().clone(),
            dtype: vb.dtype(),
        })
    }

    /// Attach the discriminator ensemble (training only).
    pub fn with_discriminator(mut self, vb: VarBuilder) -> Result<Self> {
        self.discriminator = Some(VitsDiscriminator::new(&self.cfg.discriminator, vb.pp("disc"))?);
        Ok(self)
    }

    pub fn config(&self) -> &XvaPitchConfig {
        &self.cfg
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    // -----------------------------------------------------------------------
    // Conditioning helpers
    // -----------------------------------------------------------------------

    /// `[B]` language ids -> weighted embeddings `[B, L, 1]`.
    fn language_embedding(&self, ids: &Tensor) -> Result<Tensor> {
        let emb = self.emb_l.forward(&ids.to_dtype(DType::U32)?)?;
        Ok((emb * self.cfg.language_weight)?.unsqueeze(2)?)
    }

    fn language_context(&self, language: Language<'_>, batch: usize, symbols: usize) -> Result<LanguageContext> {
        let dim = self.cfg.language_emb_dim;
        match language {
            Language::Ids(ids) => {
                let global = self.language_embedding(ids)?;
                let per_symbol = global
                    .transpose(1, 2)?
                    .broadcast_as((batch, symbols, dim))?
                    .contiguous()?;
                Ok(LanguageContext {
                    per_symbol,
                    duration_cond: global.clone(),
                    global: Some(global),
                })
            }
            Language::PerSymbol(emb) => {
                if emb.dims() != [batch, symbols, dim] {
                    return Err(Error::Config(format!(
                        "per-symbol language embedding has shape {:?}, expected [{batch}, {symbols}, {dim}]",
                        emb.dims()
                    )));
                }
                let per_symbol = emb.to_dtype(self.dtype)?;
                let duration_cond = per_symbol.transpose(1, 2)?.contiguous()?;
                Ok(LanguageContext {
                    per_symbol,
                    global: None,
                    duration_cond,
                })
            }
        }
    }

    /// Coupling-flow conditioning: the speaker vector, or `[speaker; language]`
    /// when the flow is language-conditioned. Per-symbol languages need the
    /// alignment to reach frame rate.
    fn flow_conditioning(&self, g: &Tensor, lang: &LanguageContext, attn: Option<&Tensor>) -> Result<Tensor> {
        if !self.cfg.flow.language_conditioning {
            return Ok(g.clone());
        }
        match (&lang.global, attn) {
            (Some(global), _) => Ok(Tensor::cat(&[g, &global.detach()], 1)?),
            (None, Some(attn)) => {
                let frames = attn.dim(2)?;
                let per_symbol = lang.per_symbol.transpose(1, 2)?.contiguous()?;
                let lang_frames = expand_with_path(&per_symbol, attn)?;
                let g_frames = g.broadcast_as((g.dim(0)?, g.dim(1)?, frames))?.contiguous()?;
                Ok(Tensor::cat(&[&g_frames, &lang_frames.detach()], 1)?)
            }
            (None, None) => Err(Error::Config(
                "per-symbol language conditioning of the flow needs an alignment".into(),
            )),
        }
    }

    fn speaker(&self, d_vectors: &Tensor) -> Result<Tensor> {
        Ok(speaker_conditioning(&d_vectors.to_dtype(self.dtype)?)?)
    }

    fn check_batch(&self, what: &str, lengths: &[usize], batch: usize) -> Result<()> {
        if lengths.len() != batch {
            return Err(Error::Config(format!(
                "{what}: {} lengths for a batch of {batch}",
                lengths.len()
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Training
    // -----------------------------------------------------------------------

    /// One full training forward pass.
    pub fn train_step<R: Rng + ?Sized>(&self, batch: &TrainBatch<'_>, rng: &mut R) -> Result<TrainOutput> {
        let (b, symbols) = batch.tokens.dims2()?;
        let frames = batch.spec.dim(2)?;
        self.check_batch("token_lengths", batch.token_lengths, b)?;
        self.check_batch("spec_lengths", batch.spec_lengths, b)?;
        validate_lengths(batch.token_lengths, symbols)?;
        validate_lengths(batch.spec_lengths, frames)?;

        let g = self.speaker(batch.d_vectors)?;
        let lang = self.language_context(Language::Ids(batch.language_ids), b, symbols)?;

        // posterior and flow
        let y_mask = time_mask(batch.spec_lengths, frames, self.dtype, &self.device)?;
        let posterior = self.posterior_encoder.forward(batch.spec, &y_mask, &g)?;
        let g_flow = self.flow_conditioning(&g, &lang, None)?;
        let flowed = self.flow.forward(&posterior.z, &y_mask, Some(&g_flow))?;

        // prior
        let x_mask = time_mask(batch.token_lengths, symbols, self.dtype, &self.device)?;
        let text = self.text_encoder.forward(batch.tokens, &lang.per_symbol, &x_mask)?;

        let language_logits = match &self.reversal_classifier {
            Some(classifier) => {
                let z_p = flowed.z_p.narrow(1, 0, self.cfg.latent_channels)?;
                Some(classifier.forward(&z_p.transpose(1, 2)?.contiguous()?)?)
            }
            None => None,
        };

        // prosody
        let frame_targets = self.frame_targets(batch)?;
        let encoded = match &self.prosody {
            Some(scheme) => scheme.encode(&flowed.z_p, &frame_targets, &y_mask)?,
            None => EncodedProsody {
                z_p: flowed.z_p.clone(),
                pitch_flow: None,
                energy_flow: None,
                aux: None,
            },
        };
        let z_p = encoded.z_p;

        // alignment
        let attn = {
            let logp = alignment::log_likelihood(
                &z_p.detach(),
                &text.m_p.detach(),
                &text.logs_p.detach(),
            )?;
            alignment::maximum_path(&logp, &alignment_mask(&x_mask, &y_mask)?)?
        };
        let durations = alignment::durations(&attn)?;
        tracing::debug!(batch = b, symbols, frames, "alignment computed");

        // duration predictor
        let sdp_x = if self.cfg.duration.detach_input {
            text.x.detach()
        } else {
            text.x.clone()
        };
        let nll = self.duration_predictor.nll(
            &sdp_x,
            &x_mask,
            &durations.unsqueeze(1)?,
            Some(&g.detach()),
            Some(&lang.duration_cond),
        )?;
        let loss_duration = loss::duration_loss(&nll, &x_mask)?;

        // per-symbol prosody targets and predictions
        let pitch_target = frame_targets
            .pitch
            .as_ref()
            .map(|p| average_by_durations(p, &durations))
            .transpose()?;
        let energy_target = frame_targets
            .energy
            .as_ref()
            .map(|e| average_by_durations(e, &durations))
            .transpose()?;
        let predictor_x = text.x.detach();
        let pitch = predict_against(&self.pitch_predictor, &pitch_target, &predictor_x, &x_mask, &g)?;
        let energy = predict_against(&self.energy_predictor, &energy_target, &predictor_x, &x_mask, &g)?;
        let pitch_flow = flow_against(encoded.pitch_flow.as_ref(), &pitch_target, &durations)?;
        let energy_flow = flow_against(encoded.energy_flow.as_ref(), &energy_target, &durations)?;

        // expand the prior along the alignment
        let m_p = expand_with_path(&text.m_p, &attn)?;
        let logs_p = expand_with_path(&text.logs_p, &attn)?;

        // vocoder crop
        let segment_size = self.cfg.segment_size;
        let hop = self.cfg.hop_length;
        let (z_slice, slice_offsets) =
            rand_segments(&posterior.z, batch.spec_lengths, segment_size, rng)?;
        let waveform_hat = self.waveform_decoder.forward(&z_slice, Some(&g))?;
        let wav_offsets: Vec<usize> = slice_offsets.iter().map(|o| o * hop).collect();
        let waveform_segment = slice_segments(batch.waveform, &wav_offsets, segment_size * hop)?;

        Ok(TrainOutput {
            waveform_hat,
            waveform_segment,
            slice_offsets,
            z: posterior.z,
            z_p,
            m_p,
            logs_p,
            m_q: posterior.m_q,
            logs_q: posterior.logs_q,
            x_mask,
            y_mask,
            alignment: attn,
            durations,
            loss_duration,
            pitch,
            energy,
            pitch_flow,
            energy_flow,
            aux: encoded.aux,
            language_logits,
        })
    }

    /// Frame-level prosody targets for the enabled predictors; energy is
    /// moved to the log domain.
    fn frame_targets(&self, batch: &TrainBatch<'_>) -> Result<FrameProsody> {
        let pitch = if self.cfg.prosody.pitch {
            let pitch = batch
                .pitch
                .ok_or_else(|| Error::Config("pitch is enabled but the batch has no pitch".into()))?;
            Some(pitch.to_dtype(self.dtype)?)
        } else {
            None
        };
        let energy = if self.cfg.prosody.energy {
            let energy = batch
                .energy
                .ok_or_else(|| Error::Config("energy is enabled but the batch has no energy".into()))?;
            Some(log_energy(&energy.to_dtype(self.dtype)?)?)
        } else {
            None
        };
        Ok(FrameProsody { pitch, energy })
    }

    /// Posterior encoder, crop and decoder only; no alignment.
    pub fn train_vocoder_only<R: Rng + ?Sized>(
        &self,
        batch: &TrainBatch<'_>,
        rng: &mut R,
    ) -> Result<VocoderTrainOutput> {
        let b = batch.spec.dim(0)?;
        let frames = batch.spec.dim(2)?;
        self.check_batch("spec_lengths", batch.spec_lengths, b)?;
        let g = self.speaker(batch.d_vectors)?;
        let y_mask = time_mask(batch.spec_lengths, frames, self.dtype, &self.device)?;
        let posterior = self.posterior_encoder.forward(batch.spec, &y_mask, &g)?;

        let segment_size = self.cfg.segment_size;
        let hop = self.cfg.hop_length;
        let (z_slice, slice_offsets) =
            rand_segments(&posterior.z, batch.spec_lengths, segment_size, rng)?;
        let waveform_hat = self.waveform_decoder.forward(&z_slice, Some(&g))?;
        let wav_offsets: Vec<usize> = slice_offsets.iter().map(|o| o * hop).collect();
        let waveform_segment = slice_segments(batch.waveform, &wav_offsets, segment_size * hop)?;
        Ok(VocoderTrainOutput {
            waveform_hat,
            waveform_segment,
            slice_offsets,
            m_q: posterior.m_q,
            logs_q: posterior.logs_q,
            y_mask,
        })
    }

    /// Score real and (optionally) generated waveforms.
    pub fn discriminate(&self, real: &Tensor, fake: Option<&Tensor>) -> Result<DiscriminatorOutput> {
        let disc = self
            .discriminator
            .as_ref()
            .ok_or_else(|| Error::Config("model was built without a discriminator".into()))?;
        Ok(disc.forward(real, fake)?)
    }

    /// Generator-side losses for one step, given the discriminator's view of
    /// the real and generated crops.
    pub fn generator_losses(&self, out: &TrainOutput, judged: &DiscriminatorOutput) -> Result<GeneratorLosses> {
        let fake = judged
            .fake
            .as_ref()
            .ok_or_else(|| Error::Config("generator losses need judgements of generated audio".into()))?;
        let (adversarial, _) = loss::generator_loss(fake)?;
        let feature_matching = loss::feature_loss(&judged.real, fake)?;
        Ok(GeneratorLosses {
            adversarial,
            feature_matching,
            kl: out.kl_loss()?,
            duration: out.loss_duration.clone(),
            prosody: out.prosody_loss()?,
        })
    }

    // -----------------------------------------------------------------------
    // Inference
    // -----------------------------------------------------------------------

    fn predict_alignment(
        &self,
        tokens: &Tensor,
        token_lengths: Option<&[usize]>,
        language: Language<'_>,
        d_vectors: &Tensor,
        opts: &InferenceOptions,
    ) -> Result<PredictedAlignment> {
        let (b, symbols) = tokens.dims2()?;
        let full = vec![symbols; b];
        let token_lengths = token_lengths.unwrap_or(&full);
        self.check_batch("token_lengths", token_lengths, b)?;

        let g = self.speaker(d_vectors)?;
        let lang = self.language_context(language, b, symbols)?;
        let x_mask = time_mask(token_lengths, symbols, self.dtype, &self.device)?;
        let text = self.text_encoder.forward(tokens, &lang.per_symbol, &x_mask)?;

        let logw = self.duration_predictor.predict_log_durations(
            &text.x,
            &x_mask,
            Some(&g),
            Some(&lang.duration_cond),
            opts.noise_scale_dp,
        )?;
        let w = (logw.exp()?.broadcast_mul(&x_mask)? * (opts.length_scale * opts.pacing))?;
        let w_ceil = w.ceil()?;

        let totals: Vec<f32> = w_ceil.sum((1, 2))?.to_dtype(DType::F32)?.to_vec1()?;
        let y_lengths: Vec<usize> = totals.iter().map(|&t| t.max(1.0) as usize).collect();
        let frames = y_lengths.iter().copied().max().unwrap_or(1);
        tracing::debug!(symbols, frames, "predicted durations");

        let y_mask = time_mask(&y_lengths, frames, self.dtype, &self.device)?;
        let attn = generate_path(&w_ceil.squeeze(1)?, &alignment_mask(&x_mask, &y_mask)?)?;
        Ok(PredictedAlignment {
            text,
            g,
            lang,
            w_ceil,
            y_mask,
            attn,
        })
    }

    /// Predicted whole-frame durations `[B, 1, S]` without decoding audio.
    pub fn predict_durations(
        &self,
        tokens: &Tensor,
        token_lengths: Option<&[usize]>,
        language: Language<'_>,
        d_vectors: &Tensor,
        opts: &InferenceOptions,
    ) -> Result<Tensor> {
        Ok(self
            .predict_alignment(tokens, token_lengths, language, d_vectors, opts)?
            .w_ceil)
    }

    /// Synthesise waveforms `[B, 1, N]` from symbols.
    pub fn infer(
        &self,
        tokens: &Tensor,
        token_lengths: Option<&[usize]>,
        language: Language<'_>,
        d_vectors: &Tensor,
        opts: &InferenceOptions,
    ) -> Result<Tensor> {
        let aligned = self.predict_alignment(tokens, token_lengths, language, d_vectors, opts)?;
        let PredictedAlignment {
            text,
            g,
            lang,
            y_mask,
            attn,
            ..
        } = aligned;

        let m_p = expand_with_path(&text.m_p, &attn)?;
        let logs_p = expand_with_path(&text.logs_p, &attn)?;

        let mut predicted = FrameProsody::default();
        if let Some(pred) = &self.pitch_predictor {
            let per_symbol = pred.forward(&text.x, &text.x_mask, &g)?;
            predicted.pitch = Some(expand_with_path(&per_symbol, &attn)?);
        }
        if let Some(pred) = &self.energy_predictor {
            let per_symbol = pred.forward(&text.x, &text.x_mask, &g)?;
            predicted.energy = Some(expand_with_path(&per_symbol, &attn)?);
        }
        let (m_p, flow_extra) = match &self.prosody {
            Some(scheme) => {
                let prior = scheme.condition(&m_p, &predicted, &y_mask)?;
                (prior.m_p, prior.flow_extra)
            }
            None => (m_p, None),
        };

        let noise = (m_p.randn_like(0.0, 1.0)? * logs_p.exp()?)?;
        let z_p = (&m_p + (noise * opts.noise_scale)?)?;
        let z_p = match flow_extra {
            Some(extra) => Tensor::cat(&[&z_p, &extra], 1)?,
            None => z_p,
        };

        let g_flow = self.flow_conditioning(&g, &lang, Some(&attn))?;
        let z = self
            .flow
            .reverse(&z_p, &y_mask, Some(&g_flow))?
            .broadcast_mul(&y_mask)?;
        let z = match opts.max_len {
            Some(limit) if limit < z.dim(2)? => z.narrow(2, 0, limit)?,
            _ => z,
        };
        Ok(self.waveform_decoder.forward(&z, Some(&g))?)
    }

    /// Re-voice a spectrogram: encode with the source speaker, flow forward,
    /// flow back with the target speaker, decode with the target speaker.
    pub fn voice_conversion(
        &self,
        spec: &Tensor,
        spec_lengths: &[usize],
        language_ids: &Tensor,
        source: &Tensor,
        target: &Tensor,
    ) -> Result<Tensor> {
        let (b, _, frames) = spec.dims3()?;
        self.check_batch("spec_lengths", spec_lengths, b)?;
        let g_src = self.speaker(source)?;
        let g_tgt = self.speaker(target)?;
        let y_mask = time_mask(spec_lengths, frames, self.dtype, &self.device)?;
        let posterior = self.posterior_encoder.forward(spec, &y_mask, &g_src)?;

        let lang = self.language_context(Language::Ids(language_ids), b, 1)?;
        let flow_src = self.flow_conditioning(&g_src, &lang, None)?;
        let flow_tgt = self.flow_conditioning(&g_tgt, &lang, None)?;
        let z_p = self.flow.forward(&posterior.z, &y_mask, Some(&flow_src))?.z_p;
        let z_hat = self.flow.reverse(&z_p, &y_mask, Some(&flow_tgt))?;
        Ok(self
            .waveform_decoder
            .forward(&z_hat.broadcast_mul(&y_mask)?, Some(&g_tgt))?)
    }
}

/// Run an optional predictor against an optional per-symbol target.
fn predict_against(
    predictor: &Option<ProsodyPredictor>,
    target: &Option<Tensor>,
    x: &Tensor,
    x_mask: &Tensor,
    g: &Tensor,
) -> Result<Option<ProsodyOutput>> {
    match (predictor, target) {
        (Some(predictor), Some(target)) => Ok(Some(ProsodyOutput {
            prediction: predictor.forward(x, x_mask, g)?,
            target: target.clone(),
        })),
        _ => Ok(None),
    }
}

/// Average a latent-carried prosody track per symbol and pair it with its
/// target.
fn flow_against(
    frames: Option<&Tensor>,
    target: &Option<Tensor>,
    durations: &Tensor,
) -> Result<Option<ProsodyOutput>> {
    match (frames, target) {
        (Some(frames), Some(target)) => Ok(Some(ProsodyOutput {
            prediction: average_by_durations(frames, durations)?,
            target: target.clone(),
        })),
        _ => Ok(None),
    }
}
