//! Speaker conditioning.
//!
//! The model consumes fixed-size speaker embeddings ("d-vectors") computed
//! by an external speaker encoder. They are L2-normalised and presented as a
//! `[B, D, 1]` global conditioning vector.

use candle_core::{D, Result, Tensor};

/// Anything that maps reference audio to a speaker embedding.
pub trait SpeakerEncoder {
    /// Embedding width produced by [`SpeakerEncoder::embed`].
    fn embedding_dim(&self) -> usize;

    /// `audio`: `[B, N]` mono samples at the model rate -> `[B, D]`.
    fn embed(&self, audio: &Tensor) -> Result<Tensor>;
}

/// L2-normalise each row of `[B, D]` embeddings, with the norm floored at
/// `1e-12`.
pub fn l2_normalize(embeddings: &Tensor) -> Result<Tensor> {
    let norm = embeddings
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .sqrt()?
        .maximum(1e-12)?;
    embeddings.broadcast_div(&norm)
}

/// `[B, D]` d-vectors -> normalised `[B, D, 1]` conditioning.
pub fn speaker_conditioning(d_vectors: &Tensor) -> Result<Tensor> {
    l2_normalize(d_vectors)?.unsqueeze(2)
}
