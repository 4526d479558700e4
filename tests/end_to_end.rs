//! End-to-end training and inference on a small randomly initialised model.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use xvapitch_rs::config::{
    DurationPredictorConfig, FlowConfig, PosteriorConfig, PredictorConfig, ProsodyConfig,
    ProsodyScheme, TextEncoderConfig, VocoderConfig, XvaPitchConfig,
};
use xvapitch_rs::model::path::{average_by_durations, expand_by_durations};
use xvapitch_rs::model::{InferenceOptions, Language, TrainBatch, XvaPitch};

const HOP: usize = 8;

fn small_config() -> XvaPitchConfig {
    XvaPitchConfig {
        num_symbols: 32,
        language_emb_dim: 4,
        speaker_emb_dim: 4,
        latent_channels: 8,
        spec_channels: 12,
        hop_length: HOP,
        segment_size: 8,
        text_encoder: TextEncoderConfig {
            hidden_channels_ffn: 16,
            num_heads: 2,
            num_layers: 2,
            kernel_size: 3,
        },
        posterior: PosteriorConfig {
            kernel_size: 5,
            dilation_rate: 1,
            num_layers: 2,
        },
        flow: FlowConfig {
            num_flows: 2,
            kernel_size: 5,
            dilation_rate: 1,
            num_layers: 2,
            language_conditioning: true,
        },
        duration: DurationPredictorConfig {
            kernel_size: 3,
            num_flows: 2,
            detach_input: true,
        },
        prosody: ProsodyConfig {
            pitch: true,
            energy: true,
            scheme: ProsodyScheme::OverwriteFlow,
            scaling: 0.1,
            predictor: PredictorConfig {
                hidden_channels_ffn: 8,
                num_heads: 2,
                num_layers: 1,
                kernel_size: 3,
            },
        },
        vocoder: VocoderConfig {
            upsample_rates: vec![4, 2],
            upsample_kernel_sizes: vec![8, 4],
            resblock_kernel_sizes: vec![3],
            resblock_dilation_sizes: vec![vec![1, 3]],
            upsample_initial_channel: 16,
        },
        ..Default::default()
    }
}

struct Batch {
    tokens: Tensor,
    spec: Tensor,
    waveform: Tensor,
    d_vectors: Tensor,
    language_ids: Tensor,
    pitch: Tensor,
    energy: Tensor,
}

fn make_batch(cfg: &XvaPitchConfig, dev: &Device) -> Batch {
    let frames = 15;
    Batch {
        tokens: Tensor::new(&[[3u32, 9, 4, 17, 0, 0], [5, 1, 22, 8, 13, 2]], dev).unwrap(),
        spec: Tensor::randn(0f32, 1.0, (2, cfg.spec_channels, frames), dev).unwrap(),
        waveform: Tensor::randn(0f32, 0.1, (2, 1, frames * HOP), dev).unwrap(),
        d_vectors: Tensor::randn(0f32, 1.0, (2, cfg.speaker_emb_dim), dev).unwrap(),
        language_ids: Tensor::new(&[1u32, 7], dev).unwrap(),
        pitch: Tensor::rand(80f32, 300.0, (2, 1, frames), dev).unwrap(),
        energy: Tensor::rand(0f32, 5.0, (2, 1, frames), dev).unwrap(),
    }
}

#[test]
fn train_step_alignment_covers_every_frame() {
    let dev = Device::Cpu;
    let cfg = small_config();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
    let model = XvaPitch::new(&cfg, vb).unwrap();
    let b = make_batch(&cfg, &dev);

    let batch = TrainBatch {
        tokens: &b.tokens,
        token_lengths: &[4, 6],
        spec: &b.spec,
        spec_lengths: &[10, 15],
        waveform: &b.waveform,
        d_vectors: &b.d_vectors,
        language_ids: &b.language_ids,
        pitch: Some(&b.pitch),
        energy: Some(&b.energy),
    };
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let out = model.train_step(&batch, &mut rng).unwrap();

    // every valid frame is assigned to exactly one symbol
    let attn: Vec<Vec<Vec<f32>>> = out.alignment.to_vec3().unwrap();
    let frame_sums: Vec<f32> = attn
        .iter()
        .map(|item| item.iter().flatten().sum())
        .collect();
    assert_eq!(frame_sums, vec![10.0, 15.0]);

    let durations: Vec<Vec<f32>> = out.durations.to_vec2().unwrap();
    assert_eq!(durations[0].iter().sum::<f32>(), 10.0);
    assert_eq!(durations[1].iter().sum::<f32>(), 15.0);
    assert_eq!(&durations[0][4..], &[0.0, 0.0]);

    // monotonic: the assigned symbol never decreases along time
    for (item, &frames) in attn.iter().zip([10usize, 15].iter()) {
        let mut last = 0;
        for t in 0..frames {
            let symbol = (0..item.len())
                .find(|&s| item[s][t] == 1.0)
                .expect("frame without a symbol");
            assert!(symbol >= last);
            last = symbol;
        }
    }

    assert_eq!(out.waveform_hat.dims(), &[2, 1, cfg.segment_size * HOP]);
    assert_eq!(out.waveform_segment.dims(), &[2, 1, cfg.segment_size * HOP]);
    assert!(out.slice_offsets[0] <= 10 - cfg.segment_size);
    assert!(out.slice_offsets[1] <= 15 - cfg.segment_size);

    // the overwrite scheme exposes latent-carried prosody per symbol
    let pitch_flow = out.pitch_flow.as_ref().unwrap();
    assert_eq!(pitch_flow.prediction.dims(), &[2, 1, 6]);
    assert!(out.energy_flow.is_some());

    let kl: f32 = out.kl_loss().unwrap().to_scalar().unwrap();
    assert!(kl.is_finite());
    let dur: f32 = out.loss_duration.to_scalar().unwrap();
    assert!(dur.is_finite());
    let prosody: f32 = out.prosody_loss().unwrap().unwrap().to_scalar().unwrap();
    assert!(prosody.is_finite());
}

#[test]
fn inference_produces_hop_aligned_audio() {
    let dev = Device::Cpu;
    let cfg = small_config();
    // zero weights and no duration noise: every valid symbol lasts one frame
    let model = XvaPitch::new(&cfg, VarBuilder::zeros(DType::F32, &dev)).unwrap();
    let b = make_batch(&cfg, &dev);
    let opts = InferenceOptions {
        noise_scale_dp: 0.0,
        ..InferenceOptions::from_config(&cfg)
    };
    let language = Language::Ids(&b.language_ids);

    let durations = model
        .predict_durations(&b.tokens, Some(&[4, 6]), language, &b.d_vectors, &opts)
        .unwrap();
    let durations: Vec<Vec<f32>> = durations.squeeze(1).unwrap().to_vec2().unwrap();
    assert_eq!(durations[0], vec![1.0, 1.0, 1.0, 1.0, 0.0, 0.0]);
    assert_eq!(durations[1], vec![1.0; 6]);

    let wav = model
        .infer(&b.tokens, Some(&[4, 6]), language, &b.d_vectors, &opts)
        .unwrap();
    assert_eq!(wav.dims(), &[2, 1, 6 * HOP]);

    let truncated = InferenceOptions {
        max_len: Some(3),
        ..opts
    };
    let wav = model
        .infer(&b.tokens, Some(&[4, 6]), language, &b.d_vectors, &truncated)
        .unwrap();
    assert_eq!(wav.dims(), &[2, 1, 3 * HOP]);
}

#[test]
fn expand_then_average_recovers_symbol_values() {
    let dev = Device::Cpu;
    let counts = Tensor::new(&[[2f32, 3., 1.]], &dev).unwrap();
    let values = Tensor::new(&[[[5f32, 7., 2.]]], &dev).unwrap();
    let frames = expand_by_durations(&values, &counts).unwrap();
    let expanded: Vec<f32> = frames.flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(expanded, vec![5., 5., 7., 7., 7., 2.]);
    let back: Vec<f32> = average_by_durations(&frames, &counts)
        .unwrap()
        .flatten_all()
        .unwrap()
        .to_vec1()
        .unwrap();
    assert_eq!(back, vec![5., 7., 2.]);
}
