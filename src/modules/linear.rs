//! Parameter-holding primitives built on plain tensors.
//!
//! Layers keep bare `Tensor`s instead of `burn::module::Param` so a model can
//! be shared across threads behind an `Arc` and loaded through
//! [`Parameterized`].

use crate::weights::{param_name, ParamRef, ParamVisitor, Parameterized};
use anyhow::Result;
use burn::tensor::{backend::Backend, module::linear, Int, Tensor, TensorData as BurnTensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Deterministic parameter initializer.
///
/// Weights drawn from the same seed are identical, which keeps freshly built
/// models reproducible before a checkpoint is applied.
pub struct ParamInit {
    rng: StdRng,
}

impl ParamInit {
    /// Create an initializer from a seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Uniform values in `[-bound, bound]`.
    pub fn uniform<B: Backend, const D: usize>(
        &mut self,
        shape: [usize; D],
        bound: f32,
        device: &B::Device,
    ) -> Tensor<B, D> {
        let count = shape.iter().product();
        let values: Vec<f32> = if bound > 0.0 {
            (0..count)
                .map(|_| self.rng.gen_range(-bound..=bound))
                .collect()
        } else {
            vec![0.0; count]
        };
        Tensor::from_data(BurnTensorData::new(values, shape), device)
    }

    /// Kaiming-style uniform values scaled by `1/sqrt(fan_in)`.
    pub fn fan_in<B: Backend, const D: usize>(
        &mut self,
        shape: [usize; D],
        fan_in: usize,
        device: &B::Device,
    ) -> Tensor<B, D> {
        let bound = 1.0 / (fan_in.max(1) as f32).sqrt();
        self.uniform(shape, bound, device)
    }
}

/// Affine projection `y = x W + b` with `W` held as `[in, out]`.
#[derive(Debug, Clone)]
pub struct Linear<B: Backend> {
    /// Weight `[d_in, d_out]`.
    pub weight: Tensor<B, 2>,
    /// Optional bias `[d_out]`.
    pub bias: Option<Tensor<B, 1>>,
}

impl<B: Backend> Linear<B> {
    /// Create a randomly initialized projection.
    pub fn new(
        init: &mut ParamInit,
        d_in: usize,
        d_out: usize,
        with_bias: bool,
        device: &B::Device,
    ) -> Self {
        let weight = init.fan_in([d_in, d_out], d_in, device);
        let bias = with_bias.then(|| init.fan_in([d_out], d_in, device));
        Self { weight, bias }
    }

    /// Output width.
    pub fn d_out(&self) -> usize {
        self.weight.dims()[1]
    }

    /// Apply the projection over the last axis.
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        linear(input, self.weight.clone(), self.bias.clone())
    }
}

impl<B: Backend> Parameterized<B> for Linear<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        visitor.visit(&param_name(prefix, "weight"), ParamRef::Linear(&mut self.weight))?;
        if let Some(bias) = self.bias.as_mut() {
            visitor.visit(&param_name(prefix, "bias"), ParamRef::Vector(bias))?;
        }
        Ok(())
    }
}

/// Layer normalization over the last axis.
#[derive(Debug, Clone)]
pub struct LayerNorm<B: Backend> {
    /// Optional scale; `None` means no affine transform.
    pub gamma: Option<Tensor<B, 1>>,
    /// Optional shift.
    pub beta: Option<Tensor<B, 1>>,
    /// Numerical epsilon.
    pub epsilon: f32,
}

impl<B: Backend> LayerNorm<B> {
    /// LayerNorm with unit scale and zero shift.
    pub fn new(dim: usize, epsilon: f32, affine: bool, device: &B::Device) -> Self {
        Self {
            gamma: affine.then(|| Tensor::ones([dim], device)),
            beta: affine.then(|| Tensor::zeros([dim], device)),
            epsilon,
        }
    }

    /// Normalize across the last axis.
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let mean = x.clone().mean_dim(D - 1);
        let centered = x.sub(mean);
        let var = centered.clone().square().mean_dim(D - 1);
        let mut out = centered.div(var.add_scalar(self.epsilon).sqrt());
        if let Some(gamma) = &self.gamma {
            out = out.mul(broadcast_last(gamma.clone()));
        }
        if let Some(beta) = &self.beta {
            out = out.add(broadcast_last(beta.clone()));
        }
        out
    }
}

impl<B: Backend> Parameterized<B> for LayerNorm<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        if let Some(gamma) = self.gamma.as_mut() {
            visitor.visit(&param_name(prefix, "weight"), ParamRef::Vector(gamma))?;
        }
        if let Some(beta) = self.beta.as_mut() {
            visitor.visit(&param_name(prefix, "bias"), ParamRef::Vector(beta))?;
        }
        Ok(())
    }
}

/// RMS-style normalization with a learnable scale.
///
/// Matches the checkpoint's flavour: the input is divided by the square root
/// of its unbiased variance, without centering the numerator.
#[derive(Debug, Clone)]
pub struct RmsNorm<B: Backend> {
    /// Scale parameter.
    pub alpha: Tensor<B, 1>,
    /// Numerical epsilon.
    pub epsilon: f32,
}

impl<B: Backend> RmsNorm<B> {
    /// RMSNorm with unit scale.
    pub fn new(dim: usize, epsilon: f32, device: &B::Device) -> Self {
        Self {
            alpha: Tensor::ones([dim], device),
            epsilon,
        }
    }

    /// Normalize across the last axis.
    pub fn forward<const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        let dim = x.dims()[D - 1];
        let mean = x.clone().mean_dim(D - 1);
        let var = x
            .clone()
            .sub(mean)
            .square()
            .sum_dim(D - 1)
            .div_scalar(dim.saturating_sub(1).max(1) as f32);
        let denom = var.add_scalar(self.epsilon).sqrt();
        x.mul(broadcast_last(self.alpha.clone())).div(denom)
    }
}

impl<B: Backend> Parameterized<B> for RmsNorm<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        visitor.visit(&param_name(prefix, "alpha"), ParamRef::Vector(&mut self.alpha))
    }
}

/// Token embedding table `[n_bins, dim]`.
#[derive(Debug, Clone)]
pub struct Embedding<B: Backend> {
    /// Embedding weights.
    pub weight: Tensor<B, 2>,
}

impl<B: Backend> Embedding<B> {
    /// Create a randomly initialized table.
    pub fn new(init: &mut ParamInit, n_bins: usize, dim: usize, device: &B::Device) -> Self {
        Self {
            weight: init.uniform([n_bins, dim], 1.0, device),
        }
    }

    /// Number of rows in the table.
    pub fn n_bins(&self) -> usize {
        self.weight.dims()[0]
    }

    /// Look up `[batch, seq]` ids, producing `[batch, seq, dim]`.
    pub fn forward(&self, ids: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        burn::tensor::module::embedding(self.weight.clone(), ids)
    }
}

impl<B: Backend> Parameterized<B> for Embedding<B> {
    fn visit_params(&mut self, prefix: &str, visitor: &mut dyn ParamVisitor<B>) -> Result<()> {
        visitor.visit(&param_name(prefix, "weight"), ParamRef::Matrix(&mut self.weight))
    }
}

/// Reshape a `[dim]` vector so it broadcasts against the last axis of a rank-`D` tensor.
fn broadcast_last<B: Backend, const D: usize>(v: Tensor<B, 1>) -> Tensor<B, D> {
    let dim = v.dims()[0];
    let mut shape = [1usize; D];
    shape[D - 1] = dim;
    v.reshape(shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Tolerance;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    #[test]
    fn linear_applies_weight_and_bias() {
        let device = NdArrayDevice::default();
        let layer = Linear::<TestBackend> {
            weight: Tensor::from_data(
                BurnTensorData::new(vec![1.0f32, 0.0, 0.0, 2.0], [2, 2]),
                &device,
            ),
            bias: Some(Tensor::from_data(
                BurnTensorData::new(vec![0.5f32, -0.5], [2]),
                &device,
            )),
        };
        let input = Tensor::<TestBackend, 3>::from_data(
            BurnTensorData::new(vec![1.0f32, 1.0], [1, 1, 2]),
            &device,
        );
        let output = layer.forward(input);
        output.into_data().assert_approx_eq(
            &BurnTensorData::new(vec![1.5f32, 1.5], [1, 1, 2]),
            Tolerance::<f32>::absolute(1e-6),
        );
    }

    #[test]
    fn layer_norm_centers_and_scales() {
        let device = NdArrayDevice::default();
        let norm = LayerNorm::<TestBackend>::new(4, 1e-6, true, &device);
        let input = Tensor::<TestBackend, 2>::from_data(
            BurnTensorData::new(vec![1.0f32, 2.0, 3.0, 4.0], [1, 4]),
            &device,
        );
        let values = norm.forward(input).into_data().to_vec::<f32>().expect("vec");
        let mean: f32 = values.iter().sum::<f32>() / 4.0;
        let var: f32 = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-5);
        assert!((var - 1.0).abs() < 1e-3);
    }

    #[test]
    fn rms_norm_uses_unbiased_variance() {
        let device = NdArrayDevice::default();
        let norm = RmsNorm::<TestBackend>::new(2, 0.0, &device);
        let input = Tensor::<TestBackend, 2>::from_data(
            BurnTensorData::new(vec![1.0f32, 3.0], [1, 2]),
            &device,
        );
        // Unbiased variance of [1, 3] is 2.
        let expected = [1.0 / 2f32.sqrt(), 3.0 / 2f32.sqrt()];
        let values = norm.forward(input).into_data().to_vec::<f32>().expect("vec");
        for (got, want) in values.iter().zip(expected) {
            assert!((got - want).abs() < 1e-5);
        }
    }

    #[test]
    fn init_is_deterministic_per_seed() {
        let device = NdArrayDevice::default();
        let a: Tensor<TestBackend, 2> = ParamInit::new(7).fan_in([3, 4], 3, &device);
        let b: Tensor<TestBackend, 2> = ParamInit::new(7).fan_in([3, 4], 3, &device);
        let c: Tensor<TestBackend, 2> = ParamInit::new(8).fan_in([3, 4], 3, &device);
        let a = a.into_data().to_vec::<f32>().expect("vec");
        assert_eq!(a, b.into_data().to_vec::<f32>().expect("vec"));
        assert_ne!(a, c.into_data().to_vec::<f32>().expect("vec"));
        let bound = 1.0 / 3f32.sqrt();
        assert!(a.iter().all(|v| v.abs() <= bound));
    }
}
