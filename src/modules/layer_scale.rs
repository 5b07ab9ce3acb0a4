//! LayerScale used by the decoder transformer's residual branches.

use crate::weights::{param_name, ParamRef, ParamVisitor, Parameterized};
use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor};

/// Learnable per-channel scale applied to a residual update.
#[derive(Debug, Clone)]
pub struct LayerScale<B: Backend> {
    /// Scale vector with shape `[dim]`.
    pub scale: Tensor<B, 1>,
}

impl<B: Backend> LayerScale<B> {
    /// Create a scale filled with `init_value`.
    pub fn new(dim: usize, init_value: f32, device: &B::Device) -> Self {
        Self {
            scale: Tensor::full([dim], init_value, device),
        }
    }

    /// Apply the scale to a `[batch, seq, dim]` tensor.
    pub fn apply(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        let dim = input.dims()[2];
        input.mul(self.scale.clone().reshape([1, 1, dim]))
    }
}

impl<B: Backend> Parameterized<B> for LayerScale<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        visitor.visit(&param_name(prefix, "scale"), ParamRef::Vector(&mut self.scale))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::TensorData as BurnTensorData;
    use burn_ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn scales_each_channel() {
        let device = NdArrayDevice::default();
        let mut scale = LayerScale::<NdArray<f32>>::new(2, 0.5, &device);
        scale.scale = Tensor::from_data(BurnTensorData::new(vec![0.5f32, 2.0], [2]), &device);
        let input = Tensor::<NdArray<f32>, 3>::ones([1, 2, 2], &device);
        let values = scale.apply(input).into_data().to_vec::<f32>().expect("vec");
        assert_eq!(values, vec![0.5, 2.0, 0.5, 2.0]);
    }
}
