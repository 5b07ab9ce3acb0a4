//! Per-voice conditioning embeddings.
//!
//! Each file `voices/<name>.safetensors` holds one precomputed conditioning
//! sequence in the language model's input space. The store is read once at
//! load time and never mutated afterwards; sessions share entries through
//! `Arc`.

use crate::error::EngineError;
use crate::weights::TensorData;
use anyhow::{bail, Context, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData as BurnTensorData};
use safetensors::SafeTensors;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Tensor names tried, in order, inside a voice file.
const VOICE_TENSOR_NAMES: &[&str] = &["audio_prompt", "embedding", "voice", "speaker"];

/// Built-in voices in their canonical index order.
const BUILTIN_VOICES: &[(&str, &str, &str)] = &[
    ("alba", "female", "Clear, neutral female voice"),
    ("marius", "male", "Warm male voice"),
    ("javert", "male", "Authoritative male voice"),
    ("jean", "male", "Gentle male voice"),
    ("fantine", "female", "Soft female voice"),
    ("cosette", "female", "Young female voice"),
    ("eponine", "female", "Expressive female voice"),
    ("azelma", "female", "Bright female voice"),
];

/// Descriptive metadata for one loaded voice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceInfo {
    /// Index used by [`crate::EngineConfig::voice_index`].
    pub index: usize,
    /// File stem of the voice.
    pub name: String,
    /// Gender label for built-in voices.
    pub gender: Option<&'static str>,
    /// Short description for built-in voices.
    pub description: Option<&'static str>,
}

/// One voice: a `[1, positions, d_model]` conditioning sequence.
#[derive(Debug, Clone)]
pub struct VoiceEmbedding<B: Backend> {
    pub name: String,
    pub conditioning: Tensor<B, 3>,
}

impl<B: Backend> VoiceEmbedding<B> {
    /// Read a voice file and normalize it to `[1, positions, d_model]`.
    pub fn from_file(path: &Path, d_model: usize, device: &B::Device) -> Result<Self> {
        let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_bytes(name, &bytes, d_model, device)
            .with_context(|| format!("loading voice {}", path.display()))
    }

    /// Parse a SafeTensors payload holding one conditioning tensor.
    pub fn from_bytes(
        name: String,
        bytes: &[u8],
        d_model: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let tensors = SafeTensors::deserialize(bytes)?;
        let names = tensors.names();
        let key = VOICE_TENSOR_NAMES
            .iter()
            .copied()
            .find(|candidate| names.iter().any(|name| name.as_str() == *candidate))
            .or_else(|| match names.as_slice() {
                [only] => Some(only.as_str()),
                _ => None,
            });
        let Some(key) = key else {
            bail!("no conditioning tensor found (tensors: {names:?})");
        };
        let raw = TensorData::from_safetensor(tensors.tensor(key)?);
        let positions = match raw.shape.as_slice() {
            [dim] if *dim == d_model => 1,
            [positions, dim] if *dim == d_model => *positions,
            [1, positions, dim] if *dim == d_model => *positions,
            other => bail!("tensor {key} has shape {other:?}, expected [.., {d_model}]"),
        };
        if positions == 0 {
            bail!("tensor {key} holds no positions");
        }
        let values = raw.to_f32_vec()?;
        if values.iter().any(|v| !v.is_finite()) {
            bail!("tensor {key} contains non-finite values");
        }
        let conditioning =
            Tensor::from_data(BurnTensorData::new(values, [1, positions, d_model]), device);
        Ok(Self { name, conditioning })
    }

    /// Number of conditioning positions.
    pub fn positions(&self) -> usize {
        self.conditioning.dims()[1]
    }
}

/// Immutable set of voices loaded from a model directory.
#[derive(Debug)]
pub struct VoiceStore<B: Backend> {
    voices: Vec<Arc<VoiceEmbedding<B>>>,
}

impl<B: Backend> VoiceStore<B> {
    /// Load every `*.safetensors` file in `dir`.
    ///
    /// Built-in voice names take the first indices in their canonical order;
    /// any other voices follow alphabetically.
    pub fn load_dir(dir: &Path, d_model: usize, device: &B::Device) -> Result<Self> {
        if !dir.is_dir() {
            bail!("voices directory {} not found", dir.display());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "safetensors") {
                paths.push(path);
            }
        }
        paths.sort_by_key(|path| {
            let stem = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            let rank = BUILTIN_VOICES
                .iter()
                .position(|(name, _, _)| *name == stem)
                .unwrap_or(BUILTIN_VOICES.len());
            (rank, stem)
        });

        let voices = paths
            .iter()
            .map(|path| VoiceEmbedding::from_file(path, d_model, device).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        if voices.is_empty() {
            bail!("no voice files in {}", dir.display());
        }
        log::debug!(
            "loaded {} voices: {}",
            voices.len(),
            voices
                .iter()
                .map(|voice| voice.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(Self { voices })
    }

    /// Build a store from already parsed voices, keeping their order.
    pub fn from_voices(voices: Vec<VoiceEmbedding<B>>) -> Self {
        Self {
            voices: voices.into_iter().map(Arc::new).collect(),
        }
    }

    /// Number of loaded voices.
    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    /// Look up a voice by index.
    pub fn embedding(&self, index: usize) -> Result<Arc<VoiceEmbedding<B>>, EngineError> {
        self.voices
            .get(index)
            .cloned()
            .ok_or(EngineError::VoiceNotFound {
                index,
                available: self.voices.len(),
            })
    }

    /// Metadata for every voice, in index order.
    pub fn infos(&self) -> Vec<VoiceInfo> {
        self.voices
            .iter()
            .enumerate()
            .map(|(index, voice)| {
                let builtin = BUILTIN_VOICES
                    .iter()
                    .find(|(name, _, _)| *name == voice.name);
                VoiceInfo {
                    index,
                    name: voice.name.clone(),
                    gender: builtin.map(|(_, gender, _)| *gender),
                    description: builtin.map(|(_, _, description)| *description),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::write_safetensors;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn write_voice(dir: &Path, name: &str, key: &str, shape: Vec<usize>) {
        let count = shape.iter().product();
        let values = (0..count).map(|i| i as f32 * 0.01).collect();
        write_safetensors(
            dir.join(format!("{name}.safetensors")),
            &[(key.to_string(), shape, values)],
        )
        .expect("write voice");
    }

    #[test]
    fn voices_follow_canonical_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_voice(dir.path(), "zed", "audio_prompt", vec![1, 2, 4]);
        write_voice(dir.path(), "marius", "embedding", vec![3, 4]);
        write_voice(dir.path(), "alba", "voice", vec![4]);
        write_voice(dir.path(), "bob", "speaker", vec![2, 4]);

        let device = NdArrayDevice::default();
        let store = VoiceStore::<TestBackend>::load_dir(dir.path(), 4, &device).expect("load");
        let names: Vec<String> = store.infos().into_iter().map(|info| info.name).collect();
        assert_eq!(names, vec!["alba", "marius", "bob", "zed"]);
        assert_eq!(store.embedding(0).expect("alba").positions(), 1);
        assert_eq!(store.embedding(1).expect("marius").conditioning.dims(), [1, 3, 4]);
        assert_eq!(store.infos()[0].gender, Some("female"));
        assert_eq!(store.infos()[2].description, None);
    }

    #[test]
    fn out_of_range_index_is_voice_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_voice(dir.path(), "alba", "audio_prompt", vec![1, 1, 4]);
        let device = NdArrayDevice::default();
        let store = VoiceStore::<TestBackend>::load_dir(dir.path(), 4, &device).expect("load");
        assert!(matches!(
            store.embedding(1),
            Err(EngineError::VoiceNotFound {
                index: 1,
                available: 1
            })
        ));
    }

    #[test]
    fn entries_are_shared_not_copied() {
        let dir = tempfile::tempdir().expect("tempdir");
        write_voice(dir.path(), "alba", "audio_prompt", vec![1, 1, 4]);
        let device = NdArrayDevice::default();
        let store = VoiceStore::<TestBackend>::load_dir(dir.path(), 4, &device).expect("load");
        let first = store.embedding(0).expect("voice");
        let second = store.embedding(0).expect("voice");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn wrong_width_or_empty_dir_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let device = NdArrayDevice::default();
        assert!(VoiceStore::<TestBackend>::load_dir(dir.path(), 4, &device).is_err());

        write_voice(dir.path(), "alba", "audio_prompt", vec![1, 2, 5]);
        let err = VoiceStore::<TestBackend>::load_dir(dir.path(), 4, &device).unwrap_err();
        assert!(format!("{err:#}").contains("expected"));
    }
}
