//! Scaled-dot-product attention CPU reference implementation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::backend_trait::{AttentionBackend, AttentionCall, AttentionError, AttentionResult};
use crate::tensor::{Tensor, TensorData};

/// Reference SDPA: `softmax(Q·Kᵀ·scale + mask) · V`.
///
/// Shapes are `[..., L, E]`, `[..., S, E]`, `[..., S, Ev]` producing
/// `[..., L, Ev]`. Accumulates in f32 and returns the query's dtype/device.
#[derive(Debug, Clone, Default)]
pub struct CpuAttention {
    dropout_seed: Option<u64>,
}

impl CpuAttention {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make dropout deterministic: each batch row draws from `seed + row`.
    pub fn with_dropout_seed(seed: u64) -> Self {
        Self {
            dropout_seed: Some(seed),
        }
    }
}

impl AttentionBackend for CpuAttention {
    fn name(&self) -> &'static str {
        "cpu-sdpa"
    }

    fn scaled_dot_product_attention(&self, call: &AttentionCall<'_>) -> AttentionResult<Tensor> {
        scaled_dot_product_attention(call, self.dropout_seed)
    }
}

/// Validated problem geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Geometry {
    batch_dims: Vec<usize>,
    seq_q: usize,
    seq_kv: usize,
    head_dim: usize,
    value_dim: usize,
}

impl Geometry {
    fn batch(&self) -> usize {
        self.batch_dims.iter().product()
    }
}

fn validate(call: &AttentionCall<'_>) -> AttentionResult<Geometry> {
    let (q, k, v) = (call.query, call.key, call.value);

    for (name, t) in [("query", q), ("key", k), ("value", v)] {
        if t.rank() < 2 {
            return Err(AttentionError::Shape(format!(
                "{name} must have rank >= 2, got shape {:?}",
                t.shape()
            )));
        }
        if !t.dtype().is_float() {
            return Err(AttentionError::DType(format!("{name} has dtype {}", t.dtype())));
        }
    }
    if k.dtype() != q.dtype() || v.dtype() != q.dtype() {
        return Err(AttentionError::DType(format!(
            "query/key/value dtypes differ: {}/{}/{}",
            q.dtype(),
            k.dtype(),
            v.dtype()
        )));
    }
    if k.rank() != q.rank() || v.rank() != q.rank() {
        return Err(AttentionError::Shape(format!(
            "rank mismatch: q {:?}, k {:?}, v {:?}",
            q.shape(),
            k.shape(),
            v.shape()
        )));
    }

    let rank = q.rank();
    let batch_dims = q.shape()[..rank - 2].to_vec();
    if k.shape()[..rank - 2] != batch_dims[..] || v.shape()[..rank - 2] != batch_dims[..] {
        return Err(AttentionError::Shape(format!(
            "batch dims differ: q {:?}, k {:?}, v {:?}",
            q.shape(),
            k.shape(),
            v.shape()
        )));
    }

    let geometry = Geometry {
        batch_dims,
        seq_q: q.shape()[rank - 2],
        seq_kv: k.shape()[rank - 2],
        head_dim: q.shape()[rank - 1],
        value_dim: v.shape()[rank - 1],
    };
    if k.shape()[rank - 1] != geometry.head_dim {
        return Err(AttentionError::Shape(format!(
            "query head dim {} != key head dim {}",
            geometry.head_dim,
            k.shape()[rank - 1]
        )));
    }
    if v.shape()[rank - 2] != geometry.seq_kv {
        return Err(AttentionError::Shape(format!(
            "key length {} != value length {}",
            geometry.seq_kv,
            v.shape()[rank - 2]
        )));
    }

    if !(0.0..1.0).contains(&call.dropout_p) {
        return Err(AttentionError::Dropout(call.dropout_p));
    }
    if call.is_causal && call.attn_mask.is_some() {
        return Err(AttentionError::Mask(
            "explicit attn_mask cannot be combined with is_causal".into(),
        ));
    }

    Ok(geometry)
}

/// Mask resolved against the output geometry.
///
/// `offsets[b]` is the element offset of batch row `b`; the trailing `[L, S]`
/// plane is addressed with `row_stride`/`col_stride` (0 when broadcast).
struct MaskPlan {
    values: MaskValues,
    offsets: Vec<usize>,
    row_stride: usize,
    col_stride: usize,
}

enum MaskValues {
    Keep(Vec<bool>),
    Additive(Vec<f32>),
}

impl MaskPlan {
    fn resolve(mask: &Tensor, geometry: &Geometry) -> AttentionResult<Self> {
        let rank = geometry.batch_dims.len() + 2;
        if mask.rank() > rank {
            return Err(AttentionError::Mask(format!(
                "mask rank {} exceeds attention rank {rank}",
                mask.rank()
            )));
        }

        let mut target = geometry.batch_dims.clone();
        target.push(geometry.seq_q);
        target.push(geometry.seq_kv);

        let mut padded = vec![1usize; rank - mask.rank()];
        padded.extend_from_slice(mask.shape());

        for (axis, (&m, &t)) in padded.iter().zip(&target).enumerate() {
            if m != t && m != 1 {
                return Err(AttentionError::Mask(format!(
                    "mask shape {:?} does not broadcast to {:?} (axis {axis})",
                    mask.shape(),
                    target
                )));
            }
        }

        let mut strides = vec![0usize; rank];
        let mut acc = 1usize;
        for axis in (0..rank).rev() {
            strides[axis] = if padded[axis] == 1 { 0 } else { acc };
            acc *= padded[axis];
        }

        let batch = geometry.batch();
        let mut offsets = Vec::with_capacity(batch);
        for b in 0..batch {
            let mut rem = b;
            let mut offset = 0;
            for axis in (0..geometry.batch_dims.len()).rev() {
                let dim = geometry.batch_dims[axis];
                offset += (rem % dim) * strides[axis];
                rem /= dim;
            }
            offsets.push(offset);
        }

        let values = match mask.data() {
            TensorData::Bool(v) => MaskValues::Keep(v.clone()),
            other => MaskValues::Additive(other.to_f32_vec()),
        };

        Ok(Self {
            values,
            offsets,
            row_stride: strides[rank - 2],
            col_stride: strides[rank - 1],
        })
    }

    #[inline(always)]
    fn apply(&self, batch: usize, i: usize, j: usize, score: f32) -> f32 {
        let idx = self.offsets[batch] + i * self.row_stride + j * self.col_stride;
        match &self.values {
            MaskValues::Keep(keep) => {
                if keep[idx] {
                    score
                } else {
                    f32::NEG_INFINITY
                }
            }
            MaskValues::Additive(add) => score + add[idx],
        }
    }
}

/// Compute SDPA for `call`. `dropout_seed` fixes the dropout pattern.
pub fn scaled_dot_product_attention(
    call: &AttentionCall<'_>,
    dropout_seed: Option<u64>,
) -> AttentionResult<Tensor> {
    let geometry = validate(call)?;
    let mask = call
        .attn_mask
        .map(|m| MaskPlan::resolve(m, &geometry))
        .transpose()?;

    let q = call.query.to_f32_vec();
    let k = call.key.to_f32_vec();
    let v = call.value.to_f32_vec();
    let scale = call.effective_scale();

    let Geometry {
        seq_q,
        seq_kv,
        head_dim,
        value_dim,
        ..
    } = geometry;
    let batch = geometry.batch();

    let mut output = vec![0.0f32; batch * seq_q * value_dim];
    let chunk_size = (seq_q * value_dim).max(1);

    let process = |b: usize, out_chunk: &mut [f32]| {
        let mut rng = (call.dropout_p > 0.0).then(|| {
            let seed = match dropout_seed {
                Some(seed) => seed.wrapping_add(b as u64),
                None => rand::rng().random(),
            };
            StdRng::seed_from_u64(seed)
        });
        let keep_scale = 1.0 / (1.0 - call.dropout_p);
        let mut scores = vec![0.0f32; seq_kv];

        for i in 0..seq_q {
            let q_base = (b * seq_q + i) * head_dim;
            let q_row = &q[q_base..q_base + head_dim];

            let mut row_max = f32::NEG_INFINITY;
            for (j, score) in scores.iter_mut().enumerate() {
                if call.is_causal && j > i {
                    *score = f32::NEG_INFINITY;
                    continue;
                }
                let k_base = (b * seq_kv + j) * head_dim;
                let k_row = &k[k_base..k_base + head_dim];
                let mut s = q_row.iter().zip(k_row).map(|(a, b)| a * b).sum::<f32>() * scale;
                if let Some(mask) = &mask {
                    s = mask.apply(b, i, j, s);
                }
                *score = s;
                row_max = row_max.max(s);
            }

            let out_row = &mut out_chunk[i * value_dim..(i + 1) * value_dim];
            // Fully masked row.
            if row_max == f32::NEG_INFINITY {
                out_row.fill(0.0);
                continue;
            }

            let mut sum_exp = 0.0f32;
            for score in scores.iter_mut() {
                *score = (*score - row_max).exp();
                sum_exp += *score;
            }
            let inv_sum = 1.0 / sum_exp;

            for (j, &weight) in scores.iter().enumerate() {
                let mut w = weight * inv_sum;
                if let Some(rng) = rng.as_mut() {
                    w = if rng.random::<f32>() < call.dropout_p {
                        0.0
                    } else {
                        w * keep_scale
                    };
                }
                if w == 0.0 {
                    continue;
                }
                let v_base = (b * seq_kv + j) * value_dim;
                let v_row = &v[v_base..v_base + value_dim];
                for (o, &x) in out_row.iter_mut().zip(v_row) {
                    *o += w * x;
                }
            }
        }
    };

    if batch > 1 {
        output
            .par_chunks_mut(chunk_size)
            .enumerate()
            .for_each(|(b, chunk)| process(b, chunk));
    } else {
        output
            .chunks_mut(chunk_size)
            .enumerate()
            .for_each(|(b, chunk)| process(b, chunk));
    }

    let mut shape = geometry.batch_dims;
    shape.push(seq_q);
    shape.push(value_dim);
    Tensor::new(
        shape,
        TensorData::from_f32(&output, call.query.dtype()),
        call.query.device(),
    )
}
