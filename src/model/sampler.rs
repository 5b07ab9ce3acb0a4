//! Noise source and consistency sampling for one latent frame.
//!
//! Each frame starts from Gaussian noise whose variance is the temperature.
//! `top_p` keeps the central `top_p` mass of that Gaussian: draws outside the
//! matching two-sided bound are redrawn, and clamped if they keep missing.
//! The flow network then refines the noise into a latent over a fixed number
//! of equal time intervals.

use crate::modules::flow_net::SimpleMlpAdaLn;
use crate::perf::{self, Metric};
use anyhow::Result;
use burn::tensor::{backend::Backend, Tensor, TensorData};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

const MAX_REDRAWS: usize = 16;

/// Per-session Gaussian noise generator.
pub struct NoiseSampler {
    rng: StdRng,
    normal: Normal<f32>,
    bound: Option<f32>,
}

impl NoiseSampler {
    /// Build a sampler for `temperature` and `top_p`.
    ///
    /// `seed` makes every draw reproducible; `None` seeds from the OS.
    pub fn new(temperature: f32, top_p: f32, seed: Option<u64>) -> Result<Self> {
        let std = temperature.sqrt();
        let normal = Normal::new(0.0, std)
            .map_err(|err| anyhow::anyhow!("invalid noise scale {std}: {err}"))?;
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            rng,
            normal,
            bound: truncation_bound(top_p).map(|z| z * std),
        })
    }

    /// Absolute bound applied to each draw, if any.
    pub fn bound(&self) -> Option<f32> {
        self.bound
    }

    /// Draw `count` values.
    pub fn draw(&mut self, count: usize) -> Vec<f32> {
        (0..count).map(|_| self.draw_one()).collect()
    }

    fn draw_one(&mut self) -> f32 {
        let Some(bound) = self.bound else {
            return self.normal.sample(&mut self.rng);
        };
        let mut value = self.normal.sample(&mut self.rng);
        for _ in 0..MAX_REDRAWS {
            if value.abs() <= bound {
                return value;
            }
            value = self.normal.sample(&mut self.rng);
        }
        value.clamp(-bound, bound)
    }

    /// Draw a `[batch, dim]` noise tensor.
    pub fn tensor<B: Backend>(&mut self, shape: [usize; 2], device: &B::Device) -> Tensor<B, 2> {
        let values = self.draw(shape[0] * shape[1]);
        Tensor::from_data(TensorData::new(values, shape), device)
    }
}

/// Bound, in standard deviations, that keeps the central `top_p` mass of a
/// standard normal. `None` when nothing is truncated.
pub fn truncation_bound(top_p: f32) -> Option<f32> {
    if !(top_p > 0.0 && top_p < 1.0) {
        return None;
    }
    Some(inverse_normal_cdf(0.5 * (1.0 + top_p as f64)) as f32)
}

/// Quantile function of the standard normal distribution.
///
/// Rational approximation by Acklam, relative error below `1.2e-9`.
pub fn inverse_normal_cdf(p: f64) -> f64 {
    const A: [f64; 6] = [
        -3.969_683_028_665_376e1,
        2.209_460_984_245_205e2,
        -2.759_285_104_469_687e2,
        1.383_577_518_672_69e2,
        -3.066_479_806_614_716e1,
        2.506_628_277_459_239,
    ];
    const B: [f64; 5] = [
        -5.447_609_879_822_406e1,
        1.615_858_368_580_409e2,
        -1.556_989_798_598_866e2,
        6.680_131_188_771_972e1,
        -1.328_068_155_288_572e1,
    ];
    const C: [f64; 6] = [
        -7.784_894_002_430_293e-3,
        -3.223_964_580_411_365e-1,
        -2.400_758_277_161_838,
        -2.549_732_539_343_734,
        4.374_664_141_464_968,
        2.938_163_982_698_783,
    ];
    const D: [f64; 4] = [
        7.784_695_709_041_462e-3,
        3.224_671_290_700_398e-1,
        2.445_134_137_142_996,
        3.754_408_661_907_416,
    ];
    const P_LOW: f64 = 0.02425;

    if p <= 0.0 {
        return f64::NEG_INFINITY;
    }
    if p >= 1.0 {
        return f64::INFINITY;
    }
    if p < P_LOW {
        let q = (-2.0 * p.ln()).sqrt();
        (((((C[0] * q + C[1]) * q + C[2]) * q + C[3]) * q + C[4]) * q + C[5])
            / ((((D[0] * q + D[1]) * q + D[2]) * q + D[3]) * q + 1.0)
    } else if p <= 1.0 - P_LOW {
        let q = p - 0.5;
        let r = q * q;
        (((((A[0] * r + A[1]) * r + A[2]) * r + A[3]) * r + A[4]) * r + A[5]) * q
            / (((((B[0] * r + B[1]) * r + B[2]) * r + B[3]) * r + B[4]) * r + 1.0)
    } else {
        -inverse_normal_cdf(1.0 - p)
    }
}

/// Refine `noise` into a latent conditioned on `condition` in `steps`
/// consistency steps.
///
/// The step count only changes how finely `[0, 1]` is integrated; the output
/// always has the shape of `noise`.
pub fn consistency_sample<B: Backend>(
    flow_net: &SimpleMlpAdaLn<B>,
    condition: Tensor<B, 2>,
    noise: Tensor<B, 2>,
    steps: usize,
) -> Tensor<B, 2> {
    let _span = perf::span(Metric::FlowNetSample);
    integrate_flow(
        |s, t, x| flow_net.forward(condition.clone(), s, t, x),
        noise,
        steps,
    )
}

/// Euler integration of a two-time flow over `steps` equal intervals:
/// `x += flow(s_i, t_i, x) / steps` with `s_i = i / steps`, `t_i = s_i + 1 / steps`.
fn integrate_flow<B: Backend>(
    flow: impl Fn(Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) -> Tensor<B, 2>,
    mut x: Tensor<B, 2>,
    steps: usize,
) -> Tensor<B, 2> {
    let steps = steps.max(1);
    let batch = x.dims()[0];
    let device = x.device();
    let dt = 1.0 / steps as f32;
    for i in 0..steps {
        let s = Tensor::full([batch, 1], i as f32 * dt, &device);
        let t = Tensor::full([batch, 1], (i + 1) as f32 * dt, &device);
        let direction = flow(s, t, x.clone());
        x = x.add(direction.mul_scalar(dt));
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::flow_net::SimpleMlpAdaLnConfig;
    use crate::modules::linear::ParamInit;
    use burn_ndarray::{NdArray, NdArrayDevice};

    #[test]
    fn inverse_cdf_matches_known_quantiles() {
        assert!(inverse_normal_cdf(0.5).abs() < 1e-9);
        assert!((inverse_normal_cdf(0.975) - 1.959_963_985).abs() < 1e-6);
        assert!((inverse_normal_cdf(0.01) + 2.326_347_874).abs() < 1e-6);
        assert!(inverse_normal_cdf(1.0).is_infinite());
    }

    #[test]
    fn top_p_one_disables_truncation() {
        assert_eq!(truncation_bound(1.0), None);
        let bound = truncation_bound(0.95).expect("bound");
        assert!((bound - 1.959_964).abs() < 1e-4);
    }

    #[test]
    fn fixed_seed_repeats_and_respects_bound() {
        let mut first = NoiseSampler::new(0.7, 0.5, Some(7)).expect("sampler");
        let mut second = NoiseSampler::new(0.7, 0.5, Some(7)).expect("sampler");
        let a = first.draw(512);
        assert_eq!(a, second.draw(512));

        let bound = first.bound().expect("bound");
        assert!(a.iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn constant_flow_lands_on_the_same_point_for_any_step_count() {
        let device = NdArrayDevice::default();
        let start = Tensor::<NdArray<f32>, 2>::zeros([1, 3], &device);
        for steps in [1, 2, 4] {
            let out = integrate_flow(|_s, _t, x| x.zeros_like().add_scalar(2.0), start.clone(), steps)
                .into_data()
                .to_vec::<f32>()
                .expect("vec");
            assert!(out.iter().all(|v| (v - 2.0).abs() < 1e-5), "{steps}: {out:?}");
        }
    }

    #[test]
    fn integration_visits_interval_starts() {
        let device = NdArrayDevice::default();
        let start = Tensor::<NdArray<f32>, 2>::zeros([1, 1], &device);
        let out = integrate_flow(|s, _t, _x| s, start, 4)
            .into_data()
            .to_vec::<f32>()
            .expect("vec");
        let expected = (0.0 + 0.25 + 0.5 + 0.75) / 4.0;
        assert!((out[0] - expected).abs() < 1e-6);
    }

    #[test]
    fn step_count_keeps_latent_shape() {
        let device = NdArrayDevice::default();
        let config = SimpleMlpAdaLnConfig::new(4, 8, 4, 6, 1);
        let net = SimpleMlpAdaLn::<NdArray<f32>>::new(&config, &mut ParamInit::new(3), &device);
        let condition = Tensor::ones([1, 6], &device);
        let mut sampler = NoiseSampler::new(0.7, 0.9, Some(1)).expect("sampler");
        let noise = sampler.tensor::<NdArray<f32>>([1, 4], &device);
        let one = consistency_sample(&net, condition.clone(), noise.clone(), 1);
        let four = consistency_sample(&net, condition, noise, 4);
        assert_eq!(one.dims(), four.dims());
    }
}
