//! xVAPitch CLI: speech synthesis from symbol ids.
//!
//! Symbol ids come from the external symbol table; the speaker embedding is
//! read from a safetensors file produced by an external speaker encoder.
//!
//! # Output
//!
//! Writes a mono float WAV at the model sample rate to --output and prints
//! a one-line JSON summary to stdout on success:
//!
//! ```json
//! {"path":"/tmp/out.wav","duration_s":1.25,"sample_rate":22050}
//! ```

use std::path::PathBuf;

use clap::Parser;
use xvapitch_rs::{
    audio::{peak_normalize, write_wav},
    pipeline::{SynthesisParams, XvaPitchPipeline},
};

#[derive(Parser, Debug)]
#[command(
    name = "xvapitch",
    about = "xVAPitch text-to-speech synthesis",
    long_about = "Synthesise speech from symbol ids, a speaker embedding and a language id.\n\
                  Output is written to --output; a JSON summary line is printed to stdout."
)]
struct Args {
    /// Model config (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Model weights (safetensors). Repeat for sharded checkpoints.
    #[arg(long, short = 'w', required = true)]
    weights: Vec<PathBuf>,

    /// Comma-separated symbol ids, e.g. "12,40,7,33".
    #[arg(long, short = 's')]
    symbols: String,

    /// Safetensors file holding the speaker embedding.
    #[arg(long)]
    speaker: PathBuf,

    /// Tensor name of the embedding inside --speaker. Defaults to the only
    /// tensor in the file.
    #[arg(long)]
    speaker_key: Option<String>,

    /// Language id (index into the language table).
    #[arg(long, short = 'l', default_value_t = 0)]
    language: u32,

    /// Duration multiplier; values above 1 speak slower.
    #[arg(long, default_value_t = 1.0)]
    pacing: f64,

    /// Output WAV path.
    #[arg(long, short = 'o')]
    output: PathBuf,

    /// Scale the output to full range.
    #[arg(long)]
    normalize: bool,

    /// Run on the CPU even when CUDA is available.
    #[arg(long)]
    cpu: bool,
}

fn parse_symbols(raw: &str) -> anyhow::Result<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|e| anyhow::anyhow!("invalid symbol id '{s}': {e}"))
        })
        .collect()
}

fn load_speaker(
    path: &std::path::Path,
    key: Option<&str>,
    device: &candle_core::Device,
) -> anyhow::Result<Vec<f32>> {
    let mut tensors = candle_core::safetensors::load(path, device)?;
    let tensor = match key {
        Some(key) => tensors
            .remove(key)
            .ok_or_else(|| anyhow::anyhow!("no tensor '{key}' in {}", path.display()))?,
        None if tensors.len() == 1 => tensors
            .into_values()
            .next()
            .ok_or_else(|| anyhow::anyhow!("{} is empty", path.display()))?,
        None => anyhow::bail!(
            "{} holds {} tensors; pick one with --speaker-key",
            path.display(),
            tensors.len()
        ),
    };
    Ok(tensor
        .to_dtype(candle_core::DType::F32)?
        .flatten_all()?
        .to_vec1()?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let symbols = parse_symbols(&args.symbols)?;
    if symbols.is_empty() {
        anyhow::bail!("no symbol ids given");
    }

    if let Some(parent) = args.output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let device = if args.cpu {
        candle_core::Device::Cpu
    } else {
        candle_core::Device::cuda_if_available(0)?
    };
    let dtype = candle_core::DType::F32;
    tracing::info!("Using device: {:?}", device);

    let pipeline = XvaPitchPipeline::load(&args.config, &args.weights, &device, dtype)
        .map_err(|e| anyhow::anyhow!("failed to load pipeline: {e}"))?;

    let speaker = load_speaker(&args.speaker, args.speaker_key.as_deref(), &device)?;

    tracing::info!("Synthesising {} symbols...", symbols.len());
    let mut audio = pipeline
        .synthesize(&SynthesisParams {
            symbols,
            language_id: args.language,
            speaker,
            pacing: args.pacing,
        })
        .map_err(|e| anyhow::anyhow!("synthesis failed: {e}"))?;

    if args.normalize {
        peak_normalize(&mut audio.samples);
    }
    write_wav(&args.output, &audio.samples, audio.sample_rate)
        .map_err(|e| anyhow::anyhow!("failed to write audio: {e}"))?;

    println!(
        r#"{{"path":"{path}","duration_s":{duration:.3},"sample_rate":{sr}}}"#,
        path = args.output.display(),
        duration = audio.duration_s(),
        sr = audio.sample_rate,
    );

    Ok(())
}
