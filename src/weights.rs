//! SafeTensors weight loading, export and name mapping.
//!
//! Modules expose their tensors through [`Parameterized::visit_params`] under
//! dotted names that follow the checkpoint layout. Loading walks every
//! parameter, looks it up in the file and replaces it; a missing name or a
//! wrong shape fails the load. Checkpoint names that no parameter asks for are
//! ignored.

use anyhow::{bail, Context, Result};
use burn::tensor::{backend::Backend, Tensor, TensorData as BurnTensorData};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;

/// Raw tensor payload extracted from a SafeTensors file.
#[derive(Debug, Clone)]
pub struct TensorData {
    /// Scalar dtype in the file.
    pub dtype: Dtype,
    /// Shape as a list of dimensions.
    pub shape: Vec<usize>,
    /// Raw byte buffer in row-major order.
    pub data: Vec<u8>,
}

impl TensorData {
    /// Create TensorData from a safetensors TensorView.
    pub fn from_safetensor(tensor: TensorView<'_>) -> Self {
        Self {
            dtype: tensor.dtype(),
            shape: tensor.shape().to_vec(),
            data: tensor.data().to_vec(),
        }
    }

    /// Number of scalar elements.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Decode the payload into `f32` values.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        let values: Vec<f32> = match self.dtype {
            Dtype::F32 => self
                .data
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            Dtype::BF16 => self
                .data
                .chunks_exact(2)
                .map(|b| f32::from_bits((u16::from_le_bytes([b[0], b[1]]) as u32) << 16))
                .collect(),
            Dtype::F16 => self
                .data
                .chunks_exact(2)
                .map(|b| f16_to_f32(u16::from_le_bytes([b[0], b[1]])))
                .collect(),
            other => bail!("unsupported tensor dtype {other:?}"),
        };
        if values.len() != self.numel() {
            bail!(
                "tensor payload holds {} values but shape {:?} needs {}",
                values.len(),
                self.shape,
                self.numel()
            );
        }
        Ok(values)
    }
}

fn f16_to_f32(bits: u16) -> f32 {
    let sign = ((bits >> 15) & 1) as u32;
    let exponent = ((bits >> 10) & 0x1f) as u32;
    let mantissa = (bits & 0x3ff) as u32;
    let out = match (exponent, mantissa) {
        (0, 0) => sign << 31,
        (0, _) => {
            // Subnormal: renormalize into an f32 exponent.
            let mut e = 127 - 15 + 1;
            let mut m = mantissa;
            while m & 0x400 == 0 {
                m <<= 1;
                e -= 1;
            }
            (sign << 31) | ((e as u32) << 23) | ((m & 0x3ff) << 13)
        }
        (0x1f, 0) => (sign << 31) | 0x7f80_0000,
        (0x1f, _) => (sign << 31) | 0x7fc0_0000 | (mantissa << 13),
        _ => (sign << 31) | ((exponent + 127 - 15) << 23) | (mantissa << 13),
    };
    f32::from_bits(out)
}

/// Mutable handle to one parameter tensor.
pub enum ParamRef<'a, B: Backend> {
    /// Rank-1 tensor such as a norm scale or bias.
    Vector(&'a mut Tensor<B, 1>),
    /// Rank-2 tensor stored exactly as in the checkpoint.
    Matrix(&'a mut Tensor<B, 2>),
    /// Rank-3 convolution kernel.
    Kernel(&'a mut Tensor<B, 3>),
    /// Linear weight held as `[in, out]` but stored as `[out, in]`.
    Linear(&'a mut Tensor<B, 2>),
}

impl<B: Backend> ParamRef<'_, B> {
    /// Shape of this parameter in checkpoint layout.
    pub fn checkpoint_shape(&self) -> Vec<usize> {
        match self {
            ParamRef::Vector(t) => t.dims().to_vec(),
            ParamRef::Matrix(t) => t.dims().to_vec(),
            ParamRef::Kernel(t) => t.dims().to_vec(),
            ParamRef::Linear(t) => {
                let [d_in, d_out] = t.dims();
                vec![d_out, d_in]
            }
        }
    }
}

/// Callback invoked for every parameter of a module tree.
pub trait ParamVisitor<B: Backend> {
    /// Visit one named parameter.
    fn visit(&mut self, name: &str, param: ParamRef<'_, B>) -> Result<()>;
}

/// Modules whose tensors can be loaded from or exported to a checkpoint.
pub trait Parameterized<B: Backend> {
    /// Visit every parameter under `prefix`.
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()>;
}

/// Join a parameter prefix and a local name with a dot.
pub fn param_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// Read every tensor of a SafeTensors file, mapping checkpoint names onto
/// module paths.
pub fn load_state_dict(path: impl AsRef<Path>) -> Result<HashMap<String, TensorData>> {
    let path = path.as_ref();
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let tensors = SafeTensors::deserialize(&bytes)
        .with_context(|| format!("parsing {}", path.display()))?;
    let mut state = HashMap::new();

    for name in tensors.names() {
        if let Some(mapped) = map_checkpoint_name(name) {
            let tensor = tensors.tensor(name)?;
            state.insert(mapped, TensorData::from_safetensor(tensor));
        } else {
            log::debug!("skipping checkpoint tensor {name}");
        }
    }

    Ok(state)
}

/// Replace every parameter of `module` with the matching tensor in `state`.
pub fn apply_state_dict<B: Backend, M: Parameterized<B>>(
    module: &mut M,
    state: &HashMap<String, TensorData>,
    device: &B::Device,
) -> Result<()> {
    let mut loader = StateDictLoader {
        state,
        device,
        used: HashSet::new(),
    };
    module.visit_params("", &mut loader)?;
    let unused = state.len().saturating_sub(loader.used.len());
    if unused > 0 {
        log::debug!("{unused} checkpoint tensors were not used by the model");
    }
    Ok(())
}

struct StateDictLoader<'s, 'd, B: Backend> {
    state: &'s HashMap<String, TensorData>,
    device: &'d B::Device,
    used: HashSet<String>,
}

impl<B: Backend> ParamVisitor<B> for StateDictLoader<'_, '_, B> {
    fn visit(&mut self, name: &str, param: ParamRef<'_, B>) -> Result<()> {
        let Some(tensor) = self.state.get(name) else {
            bail!("missing tensor {name}");
        };
        let expected = param.checkpoint_shape();
        if !shape_matches(&expected, &tensor.shape, matches!(param, ParamRef::Vector(_))) {
            bail!(
                "tensor {name} has shape {:?}, expected {:?}",
                tensor.shape,
                expected
            );
        }
        let values = tensor
            .to_f32_vec()
            .with_context(|| format!("decoding tensor {name}"))?;
        match param {
            ParamRef::Vector(t) => {
                *t = Tensor::from_data(BurnTensorData::new(values, [expected[0]]), self.device);
            }
            ParamRef::Matrix(t) => {
                *t = Tensor::from_data(
                    BurnTensorData::new(values, [expected[0], expected[1]]),
                    self.device,
                );
            }
            ParamRef::Kernel(t) => {
                *t = Tensor::from_data(
                    BurnTensorData::new(values, [expected[0], expected[1], expected[2]]),
                    self.device,
                );
            }
            ParamRef::Linear(t) => {
                let stored: Tensor<B, 2> = Tensor::from_data(
                    BurnTensorData::new(values, [expected[0], expected[1]]),
                    self.device,
                );
                *t = stored.transpose();
            }
        }
        self.used.insert(name.to_string());
        Ok(())
    }
}

/// Vectors may be stored with extra singleton axes (e.g. `[1, 1, dim]`).
fn shape_matches(expected: &[usize], actual: &[usize], squeeze: bool) -> bool {
    if expected == actual {
        return true;
    }
    if !squeeze {
        return false;
    }
    let squeezed: Vec<usize> = actual.iter().copied().filter(|&d| d != 1).collect();
    let wanted: Vec<usize> = expected.iter().copied().filter(|&d| d != 1).collect();
    squeezed == wanted
}

/// Collect every parameter of `module` as `f32` checkpoint tensors.
pub fn export_state_dict<B: Backend, M: Parameterized<B>>(
    module: &mut M,
) -> Result<Vec<(String, Vec<usize>, Vec<f32>)>> {
    let mut writer = StateDictWriter {
        entries: Vec::new(),
    };
    module.visit_params("", &mut writer)?;
    Ok(writer.entries)
}

/// Write every parameter of `module` to a SafeTensors file.
pub fn save_state_dict<B: Backend, M: Parameterized<B>>(
    module: &mut M,
    path: impl AsRef<Path>,
) -> Result<()> {
    let entries = export_state_dict(module)?;
    write_safetensors(path, &entries)
}

/// Write named `f32` tensors to a SafeTensors file.
pub fn write_safetensors(
    path: impl AsRef<Path>,
    entries: &[(String, Vec<usize>, Vec<f32>)],
) -> Result<()> {
    let buffers: Vec<Vec<u8>> = entries
        .iter()
        .map(|(_, _, values)| values.iter().flat_map(|v| v.to_le_bytes()).collect())
        .collect();
    let mut views = HashMap::new();
    for ((name, shape, _), bytes) in entries.iter().zip(buffers.iter()) {
        let view = TensorView::new(Dtype::F32, shape.clone(), bytes)
            .with_context(|| format!("building view for {name}"))?;
        views.insert(name.clone(), view);
    }
    let bytes = safetensors::serialize(&views, &None)?;
    fs::write(path.as_ref(), bytes)
        .with_context(|| format!("writing {}", path.as_ref().display()))?;
    Ok(())
}

struct StateDictWriter {
    entries: Vec<(String, Vec<usize>, Vec<f32>)>,
}

impl<B: Backend> ParamVisitor<B> for StateDictWriter {
    fn visit(&mut self, name: &str, param: ParamRef<'_, B>) -> Result<()> {
        let shape = param.checkpoint_shape();
        let data = match param {
            ParamRef::Vector(t) => t.clone().into_data(),
            ParamRef::Matrix(t) => t.clone().into_data(),
            ParamRef::Kernel(t) => t.clone().into_data(),
            ParamRef::Linear(t) => t.clone().transpose().into_data(),
        };
        let values = data
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|err| anyhow::anyhow!("reading tensor {name}: {err:?}"))?;
        self.entries.push((name.to_string(), shape, values));
        Ok(())
    }
}

/// Map a checkpoint tensor name onto this crate's module paths.
///
/// Names already in module form map to themselves.
pub fn map_checkpoint_name(name: &str) -> Option<String> {
    if let Some(rest) = name.strip_prefix("flow_lm.") {
        return map_flow_lm_name(rest).map(|mapped| format!("flow_lm.{mapped}"));
    }
    if let Some(rest) = name.strip_prefix("mimi.") {
        return map_mimi_name(rest).map(|mapped| format!("mimi.{mapped}"));
    }
    None
}

/// Map FlowLM checkpoint tensor names into module paths.
fn map_flow_lm_name(name: &str) -> Option<String> {
    const FLOW_SKIP_EXACT: &[&str] = &[
        "condition_provider.conditioners.transcript_in_segment.learnt_padding",
        "condition_provider.conditioners.speaker_wavs.learnt_padding",
        "condition_provider.conditioners.speaker_wavs.output_proj.weight",
    ];
    const FLOW_SKIP_PREFIXES: &[&str] = &["flow.w_s_t."];
    const FLOW_RENAME_EXACT: &[(&str, &str)] = &[(
        "condition_provider.conditioners.transcript_in_segment.embed.weight",
        "conditioner.embed.weight",
    )];

    if FLOW_SKIP_EXACT.iter().any(|skip| *skip == name)
        || FLOW_SKIP_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
    {
        return None;
    }

    if let Some(mapped) = map_exact(name, FLOW_RENAME_EXACT) {
        return Some(mapped);
    }

    Some(name.to_string())
}

/// Map waveform decoder checkpoint tensor names into module paths.
fn map_mimi_name(name: &str) -> Option<String> {
    const MIMI_SKIP_PREFIXES: &[&str] = &[
        "quantizer.vq.",
        "quantizer.logvar_proj.",
        "encoder.",
        "encoder_transformer.",
        "downsample.",
    ];
    const MIMI_RENAME_EXACT: &[(&str, &str)] =
        &[("quantizer.output_proj.weight", "quantizer.weight")];
    const MIMI_PREFIX_MAP: &[(&str, &str)] = &[
        ("decoder_transformer.transformer.", "decoder_transformer."),
        ("upsample.convtr.convtr.", "upsample.conv."),
        ("upsample.convtr.", "upsample.conv."),
    ];

    let name = name.strip_prefix("model.").unwrap_or(name);

    if MIMI_SKIP_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
    {
        return None;
    }

    if let Some(mapped) = map_exact(name, MIMI_RENAME_EXACT) {
        return Some(mapped);
    }

    if let Some(rest) = name.strip_prefix("decoder.model.") {
        return map_seanet_layer("decoder", rest);
    }

    if let Some(mapped) = map_prefix(name, MIMI_PREFIX_MAP) {
        return Some(mapped);
    }

    Some(name.to_string())
}

/// Apply exact-match rename rules.
fn map_exact(name: &str, rules: &[(&str, &str)]) -> Option<String> {
    rules
        .iter()
        .find(|(from, _)| name == *from)
        .map(|(_, to)| (*to).to_string())
}

/// Apply prefix-based rename rules.
fn map_prefix(name: &str, rules: &[(&str, &str)]) -> Option<String> {
    for (prefix, target) in rules {
        if let Some(rest) = name.strip_prefix(prefix) {
            return Some(format!("{target}{rest}"));
        }
    }
    None
}

/// Map a SEANet layer name into the decoder's layer index format.
fn map_seanet_layer(prefix: &str, rest: &str) -> Option<String> {
    let mut parts = rest.split('.');
    let layer_idx = parts.next()?;
    let tail: Vec<&str> = parts.collect();
    match tail.as_slice() {
        ["conv", "conv", param] | ["conv", param] => {
            Some(format!("{prefix}.layers.{layer_idx}.conv.{param}"))
        }
        ["convtr", "convtr", param] | ["convtr", param] => {
            Some(format!("{prefix}.layers.{layer_idx}.conv_transpose.{param}"))
        }
        ["block", block_idx, "conv", "conv", param] | ["block", block_idx, "conv", param] => {
            let idx: usize = block_idx.parse().ok()?;
            let conv_idx = idx / 2;
            Some(format!(
                "{prefix}.layers.{layer_idx}.resblock.{conv_idx}.{param}"
            ))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    struct Pair {
        scale: Tensor<TestBackend, 1>,
        proj: Tensor<TestBackend, 2>,
    }

    impl Parameterized<TestBackend> for Pair {
        fn visit_params(
            &mut self,
            prefix: &str,
            visitor: &mut dyn ParamVisitor<TestBackend>,
        ) -> Result<()> {
            visitor.visit(&param_name(prefix, "scale"), ParamRef::Vector(&mut self.scale))?;
            visitor.visit(&param_name(prefix, "proj"), ParamRef::Linear(&mut self.proj))
        }
    }

    fn pair(device: &NdArrayDevice) -> Pair {
        Pair {
            scale: Tensor::from_data(BurnTensorData::new(vec![1.0f32, 2.0], [2]), device),
            proj: Tensor::from_data(
                BurnTensorData::new(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3]),
                device,
            ),
        }
    }

    #[test]
    fn flow_lm_filters_and_renames() {
        assert_eq!(
            map_checkpoint_name(
                "flow_lm.condition_provider.conditioners.transcript_in_segment.embed.weight"
            )
            .as_deref(),
            Some("flow_lm.conditioner.embed.weight")
        );
        assert!(map_checkpoint_name("flow_lm.flow.w_s_t.skip").is_none());
        assert_eq!(
            map_checkpoint_name("flow_lm.transformer.layers.0.linear1.weight").as_deref(),
            Some("flow_lm.transformer.layers.0.linear1.weight")
        );
    }

    #[test]
    fn mimi_strips_prefix_and_maps_seanet() {
        assert_eq!(
            map_checkpoint_name("mimi.model.decoder.model.3.block.3.conv.conv.bias").as_deref(),
            Some("mimi.decoder.layers.3.resblock.1.bias")
        );
        assert_eq!(
            map_checkpoint_name("mimi.decoder.model.2.convtr.convtr.weight").as_deref(),
            Some("mimi.decoder.layers.2.conv_transpose.weight")
        );
        assert_eq!(
            map_checkpoint_name("mimi.upsample.convtr.convtr.weight").as_deref(),
            Some("mimi.upsample.conv.weight")
        );
        assert!(map_checkpoint_name("mimi.encoder.model.0.conv.conv.weight").is_none());
        assert!(map_checkpoint_name("mimi.quantizer.vq.codebook").is_none());
        assert!(map_checkpoint_name("unrelated.weight").is_none());
    }

    #[test]
    fn export_then_load_restores_linear_layout() {
        let device = NdArrayDevice::default();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("pair.safetensors");

        let mut source = pair(&device);
        let entries = export_state_dict(&mut source).expect("export");
        let (_, shape, values) = entries
            .iter()
            .find(|(name, _, _)| name == "proj")
            .expect("proj entry");
        assert_eq!(shape, &vec![3, 2]);
        assert_eq!(values, &vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

        let renamed: Vec<_> = entries
            .into_iter()
            .map(|(name, shape, values)| (format!("flow_lm.{name}"), shape, values))
            .collect();
        write_safetensors(&path, &renamed).expect("write");

        let state = load_state_dict(&path).expect("load");
        let mut target = Pair {
            scale: Tensor::zeros([2], &device),
            proj: Tensor::zeros([2, 3], &device),
        };
        let nested: HashMap<String, TensorData> = state
            .into_iter()
            .map(|(name, data)| (name.trim_start_matches("flow_lm.").to_string(), data))
            .collect();
        apply_state_dict(&mut target, &nested, &device).expect("apply");
        let proj = target.proj.into_data().to_vec::<f32>().expect("vec");
        assert_eq!(proj, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn missing_or_misshaped_tensor_fails() {
        let device = NdArrayDevice::default();
        let mut target = pair(&device);
        let empty = HashMap::new();
        let err = apply_state_dict(&mut target, &empty, &device).expect_err("missing");
        assert!(format!("{err:#}").contains("missing tensor scale"));

        let mut state = HashMap::new();
        state.insert(
            "scale".to_string(),
            TensorData {
                dtype: Dtype::F32,
                shape: vec![3],
                data: vec![0; 12],
            },
        );
        let err = apply_state_dict(&mut target, &state, &device).expect_err("shape");
        assert!(format!("{err:#}").contains("shape"));
    }

    #[test]
    fn half_precision_payloads_decode() {
        let bf16 = TensorData {
            dtype: Dtype::BF16,
            shape: vec![2],
            data: [1.5f32, -2.0]
                .iter()
                .flat_map(|v| ((v.to_bits() >> 16) as u16).to_le_bytes())
                .collect(),
        };
        assert_eq!(bf16.to_f32_vec().expect("bf16"), vec![1.5, -2.0]);

        // 0x3c00 = 1.0, 0xc000 = -2.0, 0x0001 = smallest subnormal.
        let f16 = TensorData {
            dtype: Dtype::F16,
            shape: vec![3],
            data: [0x3c00u16, 0xc000, 0x0001]
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect(),
        };
        let values = f16.to_f32_vec().expect("f16");
        assert_eq!(values[0], 1.0);
        assert_eq!(values[1], -2.0);
        assert!((values[2] - 5.960_464_5e-8).abs() < 1e-12);
    }
}
