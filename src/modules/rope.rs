//! Rotary positional encoding.
//!
//! Feature pairs `(2i, 2i + 1)` of every head are rotated by
//! `position * theta^(-2i / head_dim)`. The inverse frequencies only depend on
//! the head width, so they are computed once per layer.

use burn::tensor::{backend::Backend, Int, Tensor, TensorData};

#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    head_dim: usize,
    inv_freq: Vec<f32>,
}

impl RotaryEmbedding {
    pub fn new(head_dim: usize, theta: f32) -> Self {
        let half = head_dim / 2;
        let inv_freq = (0..half)
            .map(|i| theta.powf(-2.0 * i as f32 / head_dim as f32))
            .collect();
        Self { head_dim, inv_freq }
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    /// Rotate `[batch, heads, seq, head_dim]` whose first row sits at
    /// absolute position `start`.
    pub fn apply<B: Backend>(&self, x: Tensor<B, 4>, start: usize) -> Tensor<B, 4> {
        let [batch, heads, seq, dim] = x.dims();
        let half = self.inv_freq.len();
        if half == 0 || seq == 0 || dim != self.head_dim {
            return x;
        }
        let device = x.device();

        let inv_freq: Tensor<B, 2> =
            Tensor::from_data(TensorData::new(self.inv_freq.clone(), [1, half]), &device);
        let positions = Tensor::<B, 1, Int>::arange(start as i64..(start + seq) as i64, &device)
            .float()
            .reshape([seq, 1]);
        let angles = positions.mul(inv_freq);
        let cos = angles.clone().cos().reshape([1, 1, seq, half]);
        let sin = angles.sin().reshape([1, 1, seq, half]);

        let pairs = x.reshape([batch, heads, seq, half, 2]);
        let even = pairs.clone().narrow(4, 0, 1).reshape([batch, heads, seq, half]);
        let odd = pairs.narrow(4, 1, 1).reshape([batch, heads, seq, half]);

        let rotated_even = even.clone().mul(cos.clone()).sub(odd.clone().mul(sin.clone()));
        let rotated_odd = even.mul(sin).add(odd.mul(cos));
        Tensor::stack::<5>(vec![rotated_even, rotated_odd], 4).reshape([batch, heads, seq, dim])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::{NdArray, NdArrayDevice};

    type TestBackend = NdArray<f32>;

    fn values(x: Tensor<TestBackend, 4>) -> Vec<f32> {
        x.into_data().to_vec::<f32>().expect("vec")
    }

    #[test]
    fn position_zero_is_identity() {
        let device = NdArrayDevice::default();
        let rope = RotaryEmbedding::new(4, 10000.0);
        let input = Tensor::<TestBackend, 4>::from_floats([[[[1.0, 0.0, 0.0, 1.0]]]], &device);
        assert_eq!(values(rope.apply(input, 0)), vec![1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn first_pair_turns_by_one_radian_per_position() {
        let device = NdArrayDevice::default();
        let rope = RotaryEmbedding::new(2, 10000.0);
        let input = Tensor::<TestBackend, 4>::from_floats([[[[1.0, 0.0]]]], &device);
        let out = values(rope.apply(input, 1));
        assert!((out[0] - 1f32.cos()).abs() < 1e-6);
        assert!((out[1] - 1f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn rotation_preserves_norm_and_offsets_compose() {
        let device = NdArrayDevice::default();
        let rope = RotaryEmbedding::new(4, 100.0);
        let input = Tensor::<TestBackend, 4>::from_floats(
            [[[[0.3, -1.2, 0.5, 2.0], [0.3, -1.2, 0.5, 2.0]]]],
            &device,
        );
        let whole = values(rope.apply(input.clone(), 5));
        let second = values(rope.apply(input.narrow(2, 1, 1), 6));
        for (a, b) in whole[4..].iter().zip(&second) {
            assert!((a - b).abs() < 1e-6);
        }

        let norm = |v: &[f32]| v.iter().map(|x| x * x).sum::<f32>();
        assert!((norm(&whole[..4]) - norm(&[0.3, -1.2, 0.5, 2.0])).abs() < 1e-4);
    }
}
