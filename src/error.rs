//! Error types for xvapitch-rs.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// Invalid configuration, detected at construction time.
    #[error("config: {0}")]
    Config(String),

    /// A per-item length exceeds the allocated time dimension.
    #[error("length {length} of item {item} exceeds time dimension {max}")]
    Bounds {
        item: usize,
        length: usize,
        max: usize,
    },

    /// Weight loading error (missing file, missing tensor, shape mismatch).
    #[error("weight loading: {0}")]
    WeightLoad(String),

    /// Audio output error (WAV I/O).
    #[error("audio: {0}")]
    Audio(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}
