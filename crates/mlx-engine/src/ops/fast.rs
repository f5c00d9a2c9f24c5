//! Normalization layers, rotary embeddings and attention.

use crate::array::Array;
use crate::device::Stream;
use crate::dtype::Dtype;
use crate::engine::{BinaryOp, Engine, ReduceOp, UnaryOp};
use crate::error::{EngineError, EngineResult};

use super::creation::{arange, tri};
use super::math::softmax;
use super::shape::{repeat, slice_axis};
use super::scalar_like;

pub fn rms_norm(e: &dyn Engine, x: &Array, weight: Option<&Array>, eps: f64, s: &Stream) -> EngineResult<Array> {
    if x.ndim() == 0 {
        return Err(EngineError::invalid("rms_norm", "input must have at least one dimension"));
    }
    let last = x.ndim() - 1;
    let sq = e.unary(UnaryOp::Square, x, s)?;
    let ms = e.reduce(ReduceOp::Sum, &sq, &[last], true, s)?;
    let ms = e.binary(BinaryOp::Divide, &ms, &scalar_like(e, x.shape()[last] as f64, &ms)?, s)?;
    let denom = e.unary(UnaryOp::Rsqrt, &e.binary(BinaryOp::Add, &ms, &scalar_like(e, eps, &ms)?, s)?, s)?;
    let out = e.binary(BinaryOp::Multiply, x, &denom, s)?;
    match weight {
        Some(w) => e.binary(BinaryOp::Multiply, &out, w, s),
        None => Ok(out),
    }
}

pub fn layer_norm(
    e: &dyn Engine,
    x: &Array,
    weight: Option<&Array>,
    bias: Option<&Array>,
    eps: f64,
    s: &Stream,
) -> EngineResult<Array> {
    if x.ndim() == 0 {
        return Err(EngineError::invalid("layer_norm", "input must have at least one dimension"));
    }
    let last = [x.ndim() as i64 - 1];
    let mu = super::math::mean(e, x, Some(&last), true, s)?;
    let var = super::math::var(e, x, Some(&last), true, 0, s)?;
    let centered = e.binary(BinaryOp::Subtract, x, &mu, s)?;
    let denom = e.unary(UnaryOp::Rsqrt, &e.binary(BinaryOp::Add, &var, &scalar_like(e, eps, &var)?, s)?, s)?;
    let mut out = e.binary(BinaryOp::Multiply, &centered, &denom, s)?;
    if let Some(w) = weight {
        out = e.binary(BinaryOp::Multiply, &out, w, s)?;
    }
    if let Some(b) = bias {
        out = e.binary(BinaryOp::Add, &out, b, s)?;
    }
    Ok(out)
}

/// Rotary position embedding over the first `dims` features of the last axis.
///
/// Positions run along the second-to-last axis starting at `offset`.
/// Frequencies are `base^(-2i/dims)` unless explicit `freqs` are given.
#[allow(clippy::too_many_arguments)]
pub fn rope(
    e: &dyn Engine,
    x: &Array,
    dims: usize,
    traditional: bool,
    base: Option<f64>,
    scale: f64,
    offset: i64,
    freqs: Option<&Array>,
    s: &Stream,
) -> EngineResult<Array> {
    if x.ndim() < 2 {
        return Err(EngineError::invalid("rope", "input must have at least two dimensions"));
    }
    let d = x.shape()[x.ndim() - 1];
    if dims == 0 || dims % 2 != 0 || dims > d {
        return Err(EngineError::invalid("rope", format!("dims must be even and at most {}", d)));
    }
    let half = dims / 2;
    let len = x.shape()[x.ndim() - 2];
    let dt = if x.dtype().is_floating() { x.dtype() } else { Dtype::Float32 };

    let inv_freq = match (base, freqs) {
        (Some(base), None) => {
            let exps = arange(e, 0.0, half as f64, 1.0, Dtype::Float32)?;
            let exps = e.binary(BinaryOp::Multiply, &exps, &scalar_like(e, -2.0 / dims as f64, &exps)?, s)?;
            e.binary(BinaryOp::Power, &scalar_like(e, base, &exps)?, &exps, s)?
        }
        (None, Some(f)) => {
            if f.size() != half {
                return Err(EngineError::invalid("rope", format!("freqs must have {} entries", half)));
            }
            e.unary(UnaryOp::Reciprocal, &e.astype(f, Dtype::Float32, s)?, s)?
        }
        _ => {
            return Err(EngineError::invalid("rope", "exactly one of base or freqs must be provided"))
        }
    };
    let positions = arange(e, offset as f64, (offset + len as i64) as f64, 1.0, Dtype::Float32)?;
    let positions = e.binary(BinaryOp::Multiply, &positions, &scalar_like(e, scale, &positions)?, s)?;
    let theta = e.binary(
        BinaryOp::Multiply,
        &e.reshape(&positions, &[len, 1], s)?,
        &e.reshape(&inv_freq, &[1, half], s)?,
        s,
    )?;
    let cos = e.astype(&e.unary(UnaryOp::Cos, &theta, s)?, dt, s)?;
    let sin = e.astype(&e.unary(UnaryOp::Sin, &theta, s)?, dt, s)?;

    let last = x.ndim() - 1;
    let (x1, x2) = if traditional {
        (strided_last(e, x, 0, dims, s)?, strided_last(e, x, 1, dims, s)?)
    } else {
        (slice_axis(e, x, last, 0, half, s)?, slice_axis(e, x, last, half, dims, s)?)
    };
    let mul = |a: &Array, b: &Array| e.binary(BinaryOp::Multiply, a, b, s);
    let r1 = e.binary(BinaryOp::Subtract, &mul(&x1, &cos)?, &mul(&x2, &sin)?, s)?;
    let r2 = e.binary(BinaryOp::Add, &mul(&x1, &sin)?, &mul(&x2, &cos)?, s)?;

    let rotated = if traditional {
        let mut shape = r1.shape().to_vec();
        shape.push(1);
        let a = e.reshape(&r1, &shape, s)?;
        let b = e.reshape(&r2, &shape, s)?;
        let both = e.concatenate(&[a, b], shape.len() - 1, s)?;
        let mut out = r1.shape().to_vec();
        out[last] = dims;
        e.reshape(&both, &out, s)?
    } else {
        e.concatenate(&[r1, r2], last, s)?
    };
    if dims < d {
        let rest = slice_axis(e, x, last, dims, d, s)?;
        e.concatenate(&[rotated, rest], last, s)
    } else {
        Ok(rotated)
    }
}

// every other element of the first `dims` features, starting at `first`
fn strided_last(e: &dyn Engine, x: &Array, first: usize, dims: usize, s: &Stream) -> EngineResult<Array> {
    let nd = x.ndim();
    let mut start = vec![0i64; nd];
    let mut stop: Vec<i64> = x.shape().iter().map(|&d| d as i64).collect();
    let mut strides = vec![1i64; nd];
    start[nd - 1] = first as i64;
    stop[nd - 1] = dims as i64;
    strides[nd - 1] = 2;
    e.slice(x, &start, &stop, &strides, s)
}

/// Attention mask: the causal shortcut or an explicit boolean/additive array
#[derive(Debug, Clone)]
pub enum AttentionMask {
    Causal,
    Array(Array),
}

/// `softmax(q @ k^T * scale + mask) @ v` with grouped-query head broadcasting.
///
/// `sinks`, one logit per query head, join the softmax normalizer without
/// contributing a value row.
#[allow(clippy::too_many_arguments)]
pub fn scaled_dot_product_attention(
    e: &dyn Engine,
    q: &Array,
    k: &Array,
    v: &Array,
    scale: f64,
    mask: Option<&AttentionMask>,
    sinks: Option<&Array>,
    s: &Stream,
) -> EngineResult<Array> {
    if q.ndim() != 4 || k.ndim() != 4 || v.ndim() != 4 {
        return Err(EngineError::invalid(
            "scaled_dot_product_attention",
            "queries, keys and values must be 4-dimensional",
        ));
    }
    let (hq, hk) = (q.shape()[1], k.shape()[1]);
    if hk == 0 || hq % hk != 0 {
        return Err(EngineError::invalid(
            "scaled_dot_product_attention",
            "query heads must be a multiple of key/value heads",
        ));
    }
    let (k, v) = if hq != hk {
        (repeat(e, k, hq / hk, Some(1), s)?, repeat(e, v, hq / hk, Some(1), s)?)
    } else {
        (k.clone(), v.clone())
    };
    let qs = e.binary(BinaryOp::Multiply, q, &scalar_like(e, scale, q)?, s)?;
    let kt = e.transpose(&k, &[0, 1, 3, 2], s)?;
    let mut scores = e.matmul(&qs, &kt, s)?;
    let (l, sl) = (q.shape()[2], k.shape()[2]);
    let neg_inf = scalar_like(e, f64::NEG_INFINITY, &scores)?;

    match mask {
        Some(AttentionMask::Causal) => {
            let allowed = tri(e, l, Some(sl), sl as i64 - l as i64, Dtype::Bool)?;
            scores = e.select(&allowed, &scores, &neg_inf, s)?;
        }
        Some(AttentionMask::Array(m)) if m.dtype() == Dtype::Bool => {
            scores = e.select(m, &scores, &neg_inf, s)?;
        }
        Some(AttentionMask::Array(m)) => {
            scores = e.binary(BinaryOp::Add, &scores, m, s)?;
        }
        None => {}
    }

    let last = scores.ndim() - 1;
    let probs = match sinks {
        Some(sk) => {
            let mut shape = scores.shape().to_vec();
            shape[last] = 1;
            let sk = e.astype(&e.reshape(sk, &[1, hq, 1, 1], s)?, scores.dtype(), s)?;
            let sk = e.broadcast_to(&sk, &shape, s)?;
            let joined = e.concatenate(&[sk, scores.clone()], last, s)?;
            let p = softmax(e, &joined, Some(&[-1]), true, s)?;
            slice_axis(e, &p, last, 1, sl + 1, s)?
        }
        None => softmax(e, &scores, Some(&[-1]), true, s)?,
    };
    e.matmul(&probs, &v, s)
}
