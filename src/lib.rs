//! xVAPitch text-to-speech in pure Rust.
//!
//! A candle-based implementation of xVAPitch, a VITS-family end-to-end TTS
//! model with explicit pitch and energy prediction, multi-language symbol
//! input and speaker conditioning from external speaker embeddings. Loads
//! safetensors weights directly.
//!
//! ## Architecture
//!
//! ```text
//! symbols + language → text encoder → prior (m_p, logs_p) ──┐
//!                           │                               │
//!                           ├→ duration predictor → path ───┤
//!                           └→ pitch / energy predictors ───┤
//!                                                           ↓
//!                         sampled z_p → reverse flow → z → HiFi-GAN → waveform
//! ```
//!
//! During training the spectrogram is encoded into posterior latents, mapped
//! through the flow and aligned against the prior with monotonic alignment
//! search.
//!
//! ## Modules
//!
//! - [`audio`]: WAV output
//! - [`config`]: model configuration
//! - [`model`]: encoders, flow, alignment, predictors, vocoder, discriminators
//! - [`pipeline`]: weight loading and single-utterance synthesis

pub mod audio;
pub mod config;
pub mod model;
pub mod pipeline;

mod error;

pub use error::{Error, Result};
