//! Mono WAV file I/O.

use crate::Result;
use std::path::Path;

/// Write mono f32 samples as a 32-bit float WAV file.
pub fn write_wav(path: impl AsRef<Path>, samples: &[f32], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for &s in samples {
        writer.write_sample(s)?;
    }
    writer.finalize()?;
    Ok(())
}

/// Peak-normalize samples to [-1, 1]. Silence is left untouched.
pub fn peak_normalize(samples: &mut [f32]) {
    let max_abs = samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max);
    if max_abs > 1e-8 {
        let scale = 1.0 / max_abs;
        for s in samples.iter_mut() {
            *s *= scale;
        }
    }
}
