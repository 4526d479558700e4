//! Audio I/O utilities.
//!
//! Mono float WAV output at the model sample rate.

mod wav;

pub use wav::{peak_normalize, write_wav};
