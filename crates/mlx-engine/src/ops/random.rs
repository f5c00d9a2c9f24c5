//! Random distributions.
//!
//! Every sampler draws from [`Engine::random_uniform`] or
//! [`Engine::random_normal`] with a single key, so results are reproducible
//! for a given key.

use crate::array::Array;
use crate::device::Stream;
use crate::dtype::Dtype;
use crate::engine::{ArgReduceOp, BinaryOp, Engine, LinalgOp, UnaryOp};
use crate::error::{EngineError, EngineResult};

use super::{broadcast_shapes, normalize_axis, scalar, scalar_like};

fn require_float(op: &str, dtype: Dtype) -> EngineResult<()> {
    if dtype.is_floating() {
        Ok(())
    } else {
        Err(EngineError::invalid(op, format!("can only generate floating point values, got {}", dtype.name())))
    }
}

/// Uniform samples in `[low, high)`
pub fn uniform(
    e: &dyn Engine,
    low: &Array,
    high: &Array,
    shape: &[usize],
    dtype: Dtype,
    key: Option<&Array>,
    s: &Stream,
) -> EngineResult<Array> {
    require_float("uniform", dtype)?;
    let bshape = broadcast_shapes("uniform", low.shape(), high.shape())?;
    broadcast_shapes("uniform", &bshape, shape)?;
    let u = e.random_uniform(shape, dtype, key, s)?;
    let low = e.astype(low, dtype, s)?;
    let high = e.astype(high, dtype, s)?;
    let range = e.binary(BinaryOp::Subtract, &high, &low, s)?;
    let out = e.binary(BinaryOp::Add, &low, &e.binary(BinaryOp::Multiply, &u, &range, s)?, s)?;
    e.broadcast_to(&out, shape, s)
}

/// Normal samples with mean `loc` and standard deviation `scale`
pub fn normal(
    e: &dyn Engine,
    shape: &[usize],
    dtype: Dtype,
    loc: f64,
    scale: f64,
    key: Option<&Array>,
    s: &Stream,
) -> EngineResult<Array> {
    require_float("normal", dtype)?;
    let z = e.random_normal(shape, dtype, key, s)?;
    if loc == 0.0 && scale == 1.0 {
        return Ok(z);
    }
    let z = e.binary(BinaryOp::Multiply, &z, &scalar(e, scale, dtype)?, s)?;
    e.binary(BinaryOp::Add, &z, &scalar(e, loc, dtype)?, s)
}

/// Integers in `[low, high)`
pub fn randint(
    e: &dyn Engine,
    low: &Array,
    high: &Array,
    shape: &[usize],
    dtype: Dtype,
    key: Option<&Array>,
    s: &Stream,
) -> EngineResult<Array> {
    if !dtype.is_integer() {
        return Err(EngineError::invalid("randint", format!("can only generate integer values, got {}", dtype.name())));
    }
    let lo = e.astype(low, Dtype::Float64, s)?;
    let hi = e.astype(high, Dtype::Float64, s)?;
    let u = uniform(e, &lo, &hi, shape, Dtype::Float64, key, s)?;
    let floored = e.unary(UnaryOp::Floor, &u, s)?;
    // guard against rounding up to `high`
    let top = e.binary(BinaryOp::Subtract, &hi, &scalar(e, 1.0, Dtype::Float64)?, s)?;
    let clamped = e.binary(BinaryOp::Minimum, &floored, &e.binary(BinaryOp::Maximum, &top, &lo, s)?, s)?;
    e.astype(&clamped, dtype, s)
}

/// Booleans that are true with probability `p`
pub fn bernoulli(e: &dyn Engine, p: &Array, shape: Option<&[usize]>, key: Option<&Array>, s: &Stream) -> EngineResult<Array> {
    let shape = shape.unwrap_or_else(|| p.shape()).to_vec();
    broadcast_shapes("bernoulli", p.shape(), &shape)?;
    let u = e.random_uniform(&shape, Dtype::Float32, key, s)?;
    let p = e.astype(p, Dtype::Float32, s)?;
    e.binary(BinaryOp::Less, &u, &p, s)
}

/// Draw category indices from unnormalized log-probabilities along `axis`.
///
/// Uses the Gumbel-max trick. `shape` and `num_samples` are mutually
/// exclusive; `num_samples` appends a trailing sample axis.
pub fn categorical(
    e: &dyn Engine,
    logits: &Array,
    axis: i64,
    shape: Option<&[usize]>,
    num_samples: Option<usize>,
    key: Option<&Array>,
    s: &Stream,
) -> EngineResult<Array> {
    if shape.is_some() && num_samples.is_some() {
        return Err(EngineError::invalid("categorical", "at most one of shape or num_samples can be specified"));
    }
    let ax = normalize_axis("categorical", axis, logits.ndim())?;
    let batch: Vec<usize> = logits
        .shape()
        .iter()
        .enumerate()
        .filter(|&(i, _)| i != ax)
        .map(|(_, &d)| d)
        .collect();
    let moved = {
        let mut perm: Vec<usize> = (0..logits.ndim()).filter(|&i| i != ax).collect();
        perm.push(ax);
        e.transpose(logits, &perm, s)?
    };
    let n = logits.shape()[ax];
    let (out_shape, expanded) = match (shape, num_samples) {
        (Some(shape), None) => {
            broadcast_shapes("categorical", &batch, shape)?;
            (shape.to_vec(), moved)
        }
        (None, Some(k)) => {
            let mut out = batch.clone();
            out.push(k);
            let mut with_axis = batch.clone();
            with_axis.push(1);
            with_axis.push(n);
            let m = e.reshape(&moved, &with_axis, s)?;
            let mut target = out.clone();
            target.push(n);
            (out, e.broadcast_to(&m, &target, s)?)
        }
        _ => (batch, moved),
    };
    let mut noise_shape = out_shape.clone();
    noise_shape.push(n);
    let g = gumbel(e, &noise_shape, Dtype::Float32, key, s)?;
    let scores = e.binary(BinaryOp::Add, &e.astype(&expanded, Dtype::Float32, s)?, &g, s)?;
    e.arg_reduce(ArgReduceOp::ArgMax, &scores, noise_shape.len() - 1, false, s)
}

/// A random permutation of `0..n`
pub fn permutation_n(e: &dyn Engine, n: usize, key: Option<&Array>, s: &Stream) -> EngineResult<Array> {
    let u = e.random_uniform(&[n], Dtype::Float32, key, s)?;
    let order = e.argsort(&u, 0, s)?;
    e.astype(&order, Dtype::Int32, s)
}

/// Shuffle `a` along `axis`
pub fn permutation(e: &dyn Engine, a: &Array, axis: i64, key: Option<&Array>, s: &Stream) -> EngineResult<Array> {
    let ax = normalize_axis("permutation", axis, a.ndim())?;
    let order = permutation_n(e, a.shape()[ax], key, s)?;
    e.take(a, &order, ax, s)
}

/// Samples from `N(mean, cov)` via the Cholesky factor of `cov`
pub fn multivariate_normal(
    e: &dyn Engine,
    mean: &Array,
    cov: &Array,
    shape: &[usize],
    dtype: Dtype,
    key: Option<&Array>,
    s: &Stream,
) -> EngineResult<Array> {
    require_float("multivariate_normal", dtype)?;
    if mean.ndim() < 1 || cov.ndim() < 2 {
        return Err(EngineError::invalid("multivariate_normal", "mean must be 1-d and cov at least 2-d"));
    }
    let n = mean.shape()[mean.ndim() - 1];
    let cs = cov.shape();
    if cs[cs.len() - 1] != n || cs[cs.len() - 2] != n {
        return Err(EngineError::invalid(
            "multivariate_normal",
            format!("cov must have shape [..., {}, {}]", n, n),
        ));
    }
    let l = e.linalg(LinalgOp::Cholesky { upper: false }, &[e.astype(cov, dtype, s)?], s)?;
    let l = l
        .into_iter()
        .next()
        .ok_or_else(|| EngineError::runtime("cholesky produced no output"))?;
    let mut zshape = shape.to_vec();
    zshape.push(n);
    let z = e.random_normal(&zshape, dtype, key, s)?;
    // z @ L^T
    let lt = {
        let nd = l.ndim();
        let mut perm: Vec<usize> = (0..nd).collect();
        perm.swap(nd - 1, nd - 2);
        e.transpose(&l, &perm, s)?
    };
    let mut z_row = zshape.clone();
    z_row.insert(zshape.len() - 1, 1);
    let prod = e.matmul(&e.reshape(&z, &z_row, s)?, &lt, s)?;
    let prod = e.reshape(&prod, &zshape, s)?;
    e.binary(BinaryOp::Add, &prod, &e.astype(mean, dtype, s)?, s)
}

/// Normal samples truncated to `[lower, upper]` by inverse CDF sampling
pub fn truncated_normal(
    e: &dyn Engine,
    lower: &Array,
    upper: &Array,
    shape: Option<&[usize]>,
    dtype: Dtype,
    key: Option<&Array>,
    s: &Stream,
) -> EngineResult<Array> {
    require_float("truncated_normal", dtype)?;
    let bshape = broadcast_shapes("truncated_normal", lower.shape(), upper.shape())?;
    let shape = match shape {
        Some(shape) => {
            broadcast_shapes("truncated_normal", &bshape, shape)?;
            shape.to_vec()
        }
        None => bshape,
    };
    let sqrt2 = std::f64::consts::SQRT_2;
    let cdf = |x: &Array| -> EngineResult<Array> {
        let x = e.astype(x, dtype, s)?;
        let scaled = e.binary(BinaryOp::Divide, &x, &scalar(e, sqrt2, dtype)?, s)?;
        e.unary(UnaryOp::Erf, &scaled, s)
    };
    let lo = cdf(lower)?;
    let hi = cdf(upper)?;
    // uniform in (erf(lo/sqrt2), erf(hi/sqrt2)), mapped back through erfinv
    let u = uniform(e, &lo, &hi, &shape, dtype, key, s)?;
    let eps = finfo_eps(dtype);
    let bound = scalar(e, 1.0 - eps, dtype)?;
    let u = e.binary(BinaryOp::Minimum, &u, &bound, s)?;
    let u = e.binary(BinaryOp::Maximum, &u, &e.unary(UnaryOp::Negative, &bound, s)?, s)?;
    let out = e.unary(UnaryOp::ErfInv, &u, s)?;
    let out = e.binary(BinaryOp::Multiply, &out, &scalar(e, sqrt2, dtype)?, s)?;
    let out = e.binary(BinaryOp::Maximum, &out, &e.astype(lower, dtype, s)?, s)?;
    e.binary(BinaryOp::Minimum, &out, &e.astype(upper, dtype, s)?, s)
}

fn finfo_eps(dtype: Dtype) -> f64 {
    crate::dtype::finfo(dtype).map(|f| f.eps).unwrap_or(f64::EPSILON)
}

/// Standard Gumbel samples, `-log(-log(u))`
pub fn gumbel(e: &dyn Engine, shape: &[usize], dtype: Dtype, key: Option<&Array>, s: &Stream) -> EngineResult<Array> {
    require_float("gumbel", dtype)?;
    let u = e.random_uniform(shape, dtype, key, s)?;
    // keep u inside (0, 1)
    let tiny = scalar(e, finfo_eps(dtype), dtype)?;
    let u = e.binary(BinaryOp::Maximum, &u, &tiny, s)?;
    let inner = e.unary(UnaryOp::Negative, &e.unary(UnaryOp::Log, &u, s)?, s)?;
    e.unary(UnaryOp::Negative, &e.unary(UnaryOp::Log, &inner, s)?, s)
}

/// Laplace samples with location `loc` and scale `scale`
pub fn laplace(
    e: &dyn Engine,
    shape: &[usize],
    dtype: Dtype,
    loc: f64,
    scale: f64,
    key: Option<&Array>,
    s: &Stream,
) -> EngineResult<Array> {
    require_float("laplace", dtype)?;
    // u in (-1, 1); x = -sign(u) * log(1 - |u|)
    let lo = scalar(e, -1.0 + finfo_eps(dtype), dtype)?;
    let hi = scalar(e, 1.0, dtype)?;
    let u = uniform(e, &lo, &hi, shape, dtype, key, s)?;
    let mag = e.binary(BinaryOp::Subtract, &scalar_like(e, 1.0, &u)?, &e.unary(UnaryOp::Abs, &u, s)?, s)?;
    let mag = e.binary(BinaryOp::Maximum, &mag, &scalar_like(e, finfo_eps(dtype), &mag)?, s)?;
    let x = e.binary(
        BinaryOp::Multiply,
        &e.unary(UnaryOp::Negative, &e.unary(UnaryOp::Sign, &u, s)?, s)?,
        &e.unary(UnaryOp::Log, &mag, s)?,
        s,
    )?;
    let x = e.binary(BinaryOp::Multiply, &x, &scalar(e, scale, dtype)?, s)?;
    e.binary(BinaryOp::Add, &x, &scalar(e, loc, dtype)?, s)
}

/// Split `key` (or the global key) into `num` keys, one per row
pub fn split(e: &dyn Engine, key: Option<&Array>, num: usize, s: &Stream) -> EngineResult<Array> {
    if num == 0 {
        return Err(EngineError::invalid("split", "num must be positive"));
    }
    e.split_key(key, num, s)
}
