//! Model components for xVAPitch.
//!
//! ## Components
//!
//! - [`text_encoder`]: symbol embedding + transformer, per-symbol prior statistics
//! - [`posterior`]: WaveNet spectrogram encoder producing frame latents
//! - [`flow`]: residual coupling flow between posterior and prior space
//! - [`alignment`]: monotonic alignment search and durations
//! - [`duration_predictor`]: stochastic (flow-based) duration predictor
//! - [`prosody`]: pitch/energy predictors and latent conditioning schemes
//! - [`reversal`]: gradient reversal and the language-adversarial classifier
//! - [`vocoder`]: HiFi-GAN generator (latent → waveform)
//! - [`discriminator`]: multi-period + scale discriminators
//! - [`xvapitch`]: the assembled model: training step, inference, voice conversion

pub mod alignment;
pub mod discriminator;
pub mod duration_predictor;
pub mod flow;
pub mod loss;
pub mod mask;
pub mod path;
pub mod posterior;
pub mod prosody;
pub mod reversal;
pub mod segment;
pub mod speaker;
pub mod text_encoder;
pub mod transformer;
pub mod vocoder;
pub mod wavenet;
pub mod xvapitch;

pub use xvapitch::{InferenceOptions, Language, TrainBatch, TrainOutput, XvaPitch};
