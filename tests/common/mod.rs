//! Shared test utilities: a tiny model directory built on the fly.

#![allow(dead_code)]

use burn::tensor::{Tensor, TensorData};
use burn_ndarray::{NdArray, NdArrayDevice};
use pocket_engine::config::{
    FlowConfig, FlowLmConfig, FlowLmTransformerConfig, GenerationConfig, LookupTableConfig,
    MimiConfig, MimiTransformerConfig, NormKind, QuantizerConfig, SeanetConfig,
};
use pocket_engine::weights::{save_state_dict, write_safetensors};
use pocket_engine::{CpuEngine, EngineConfig, ModelConfig, TtsModel};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

pub type TestBackend = NdArray<f32>;

/// Model width of the fixture.
pub const D_MODEL: usize = 16;
/// Samples decoded per frame by the fixture.
pub const SAMPLES_PER_FRAME: usize = 128;
pub const SAMPLE_RATE: u32 = 1600;

/// How the fixture's end-of-sequence head behaves.
#[derive(Debug, Clone, Copy)]
pub struct FixtureOptions {
    /// Constant end-of-sequence logit. Above the threshold ends on the first
    /// frame, far below never ends.
    pub eos_logit: f32,
    pub max_frames: usize,
    pub stream_capacity: usize,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            eos_logit: 10.0,
            max_frames: 64,
            stream_capacity: 2,
        }
    }
}

impl FixtureOptions {
    /// A model that never signals end of sequence.
    pub fn endless(max_frames: usize) -> Self {
        Self {
            eos_logit: -1000.0,
            max_frames,
            ..Self::default()
        }
    }
}

pub fn tiny_config(options: &FixtureOptions) -> ModelConfig {
    ModelConfig {
        flow_lm: FlowLmConfig {
            flow: FlowConfig { dim: 16, depth: 1 },
            transformer: FlowLmTransformerConfig {
                hidden_scale: 2,
                max_period: 10000.0,
                d_model: D_MODEL,
                num_heads: 2,
                num_layers: 1,
                norm: NormKind::RmsNorm,
            },
            lookup_table: LookupTableConfig {
                dim: D_MODEL,
                n_bins: 16,
            },
        },
        mimi: MimiConfig {
            sample_rate: SAMPLE_RATE as usize,
            channels: 1,
            frame_rate: 12.5,
            seanet: SeanetConfig {
                dimension: 8,
                channels: 1,
                n_filters: 4,
                n_residual_layers: 1,
                ratios: vec![4, 2],
                kernel_size: 7,
                residual_kernel_size: 3,
                last_kernel_size: 3,
                dilation_base: 2,
                compress: 2,
            },
            transformer: MimiTransformerConfig {
                d_model: 8,
                num_heads: 2,
                num_layers: 1,
                layer_scale: 0.01,
                context: 50,
                max_period: 10000.0,
                dim_feedforward: 16,
            },
            quantizer: QuantizerConfig {
                dimension: 8,
                output_dimension: 8,
            },
        },
        generation: GenerationConfig {
            max_frames: options.max_frames,
            stream_capacity: options.stream_capacity,
            ..GenerationConfig::default()
        },
    }
}

fn write_tokenizer(dir: &Path) {
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {
                "[UNK]": 0, "Hello": 1, "world": 2, ".": 3, ",": 4, "!": 5,
                "The": 6, "quick": 7, "brown": 8, "fox": 9, "jumps": 10, "over": 11
            },
            "unk_token": "[UNK]"
        }
    });
    fs::write(dir.join("tokenizer.json"), json.to_string()).expect("write tokenizer");
}

fn write_voice(dir: &Path, name: &str, positions: usize, offset: f32) {
    let values = (0..positions * D_MODEL)
        .map(|i| ((i as f32 + offset) * 0.37).sin() * 0.5)
        .collect();
    write_safetensors(
        dir.join(format!("{name}.safetensors")),
        &[("audio_prompt".to_string(), vec![1, positions, D_MODEL], values)],
    )
    .expect("write voice");
}

/// Write a complete model directory and return it.
pub fn model_dir(options: FixtureOptions) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = tiny_config(&options);
    fs::write(
        dir.path().join("config.yaml"),
        serde_yaml::to_string(&config).expect("yaml"),
    )
    .expect("write config");

    let device = NdArrayDevice::default();
    let mut model = TtsModel::<TestBackend>::from_config(&config, 7, &device).expect("model");
    model.flow_lm.out_eos.weight = model.flow_lm.out_eos.weight.zeros_like();
    model.flow_lm.out_eos.bias = Some(Tensor::from_data(
        TensorData::new(vec![options.eos_logit], [1]),
        &device,
    ));
    save_state_dict(&mut model, dir.path().join("model.safetensors")).expect("save weights");

    write_tokenizer(dir.path());
    let voices = dir.path().join("voices");
    fs::create_dir(&voices).expect("voices dir");
    write_voice(&voices, "alba", 3, 0.0);
    write_voice(&voices, "marius", 2, 11.0);
    dir
}

/// A loaded engine with a fixed seed.
pub fn loaded_engine(options: FixtureOptions) -> (TempDir, CpuEngine) {
    let dir = model_dir(options);
    let mut engine = CpuEngine::cpu();
    engine.load(dir.path()).expect("load");
    engine
        .configure(EngineConfig {
            use_fixed_seed: true,
            seed: 1234,
            ..EngineConfig::default()
        })
        .expect("configure");
    (dir, engine)
}
