//! Causal multi-head attention over a per-utterance key/value cache.
//!
//! Queries arrive in chunks (a whole prefix, or one frame per step). Their
//! keys and values are appended to a [`KvCache`], and attention runs over
//! everything still cached. An optional context window bounds both what a
//! query may see and how much the cache retains.

use crate::perf::{self, Metric};
use crate::state::CacheLen;
use burn::tensor::{activation::softmax, backend::Backend, Bool, Int, Tensor};

const MASKED: f32 = -1.0e9;

/// Keys and values of one layer, `[batch, heads, seq, head_dim]`.
#[derive(Debug, Clone)]
pub struct KvCache<B: Backend> {
    /// Absolute position of the next appended row.
    pub next_position: usize,
    entries: Option<(Tensor<B, 4>, Tensor<B, 4>)>,
}

impl<B: Backend> Default for KvCache<B> {
    fn default() -> Self {
        Self {
            next_position: 0,
            entries: None,
        }
    }
}

impl<B: Backend> KvCache<B> {
    /// Append new rows, drop what `window` no longer needs, and return the
    /// retained keys and values.
    ///
    /// With a window, the oldest query of the chunk still needs `window - 1`
    /// earlier keys, so `window + added - 1` rows are kept.
    pub fn append(
        &mut self,
        keys: Tensor<B, 4>,
        values: Tensor<B, 4>,
        window: Option<usize>,
    ) -> (Tensor<B, 4>, Tensor<B, 4>) {
        let added = keys.dims()[2];
        let (mut keys, mut values) = match self.entries.take() {
            Some((old_keys, old_values)) => (
                Tensor::cat(vec![old_keys, keys], 2),
                Tensor::cat(vec![old_values, values], 2),
            ),
            None => (keys, values),
        };
        if let Some(window) = window {
            let keep = window + added.saturating_sub(1);
            let total = keys.dims()[2];
            if total > keep {
                keys = keys.narrow(2, total - keep, keep);
                values = values.narrow(2, total - keep, keep);
            }
        }
        self.next_position += added;
        self.entries = Some((keys.clone(), values.clone()));
        (keys, values)
    }
}

impl<B: Backend> CacheLen for KvCache<B> {
    fn cached_positions(&self) -> usize {
        self.entries
            .as_ref()
            .map(|(keys, _)| keys.dims()[2])
            .unwrap_or(0)
    }
}

/// Scaled dot-product attention with causal and windowed masking.
///
/// Holds no weights; projections live in the surrounding transformer layer.
#[derive(Debug, Clone)]
pub struct CausalAttention {
    pub head_dim: usize,
    pub causal: bool,
    pub context: Option<usize>,
}

impl CausalAttention {
    /// Attend the newest `queries` over `keys`/`values` as returned by
    /// [`KvCache::append`] on `cache`.
    pub fn attend<B: Backend>(
        &self,
        cache: &KvCache<B>,
        queries: Tensor<B, 4>,
        keys: Tensor<B, 4>,
        values: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let _span = perf::span(Metric::MhaAttention);
        let [batch, heads, q_len, _] = queries.dims();
        let k_len = keys.dims()[2];
        let q_start = cache.next_position.saturating_sub(q_len);
        let k_start = cache.next_position.saturating_sub(k_len);

        let scores = queries
            .matmul(keys.swap_dims(2, 3))
            .div_scalar((self.head_dim as f32).sqrt());
        let scores = match self.mask::<B>(q_start, q_len, k_start, k_len, &scores.device()) {
            Some(mask) => scores.mask_fill(
                mask.reshape([1, 1, q_len, k_len])
                    .repeat_dim(0, batch)
                    .repeat_dim(1, heads),
                MASKED,
            ),
            None => scores,
        };
        softmax(scores, 3).matmul(values)
    }

    /// `[q_len, k_len]`, `true` where the query may not see the key.
    fn mask<B: Backend>(
        &self,
        q_start: usize,
        q_len: usize,
        k_start: usize,
        k_len: usize,
        device: &B::Device,
    ) -> Option<Tensor<B, 2, Bool>> {
        if !self.causal && self.context.is_none() {
            return None;
        }
        let q = Tensor::<B, 1, Int>::arange(q_start as i64..(q_start + q_len) as i64, device)
            .reshape([q_len, 1])
            .repeat_dim(1, k_len);
        let k = Tensor::<B, 1, Int>::arange(k_start as i64..(k_start + k_len) as i64, device)
            .reshape([1, k_len])
            .repeat_dim(0, q_len);

        let mut blocked = if self.causal {
            k.clone().greater(q.clone())
        } else {
            k.clone().equal_elem(-1)
        };
        if let Some(context) = self.context {
            let oldest = q.sub_scalar(context.saturating_sub(1) as i64);
            blocked = blocked.bool_or(oldest.greater(k));
        }
        Some(blocked)
    }
}
