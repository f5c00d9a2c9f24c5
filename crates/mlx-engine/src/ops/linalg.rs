//! Matmul variants, norms and quantized products.

use crate::array::{Array, HostBuffer};
use crate::device::Stream;
use crate::dtype::Dtype;
use crate::engine::{BinaryOp, Engine, LinalgOp, QuantMode, ReduceOp, UnaryOp};
use crate::error::{EngineError, EngineResult};

use super::creation::arange;
use super::shape::{expand_dims, flatten, slice_axis};
use super::{float_dtype, normalize_axis, resolve_axes, scalar_like};

/// Order of a vector or matrix norm
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NormOrd {
    /// p-norm; `f64::INFINITY` and `f64::NEG_INFINITY` are allowed
    P(f64),
    Fro,
    Nuc,
}

pub fn norm(
    e: &dyn Engine,
    a: &Array,
    ord: Option<NormOrd>,
    axes: Option<&[i64]>,
    keepdims: bool,
    s: &Stream,
) -> EngineResult<Array> {
    let x = if a.dtype().is_inexact() { a.clone() } else { e.astype(a, Dtype::Float32, s)? };
    let abs = e.unary(UnaryOp::Abs, &x, s)?;
    let abs = if abs.dtype().is_complex() { e.astype(&abs, Dtype::Float32, s)? } else { abs };

    let ax = match (ord, axes) {
        (None, None) => {
            let all: Vec<usize> = (0..a.ndim()).collect();
            return l2(e, &abs, &all, keepdims, s);
        }
        (Some(_), None) if a.ndim() > 2 => {
            return Err(EngineError::invalid("norm", "ord requires axis for arrays with more than two dimensions"));
        }
        _ => resolve_axes("norm", axes, a.ndim())?,
    };
    // resolve_axes sorts; keep the caller's order for matrix norms
    let ordered: Vec<usize> = match axes {
        Some(list) => list
            .iter()
            .map(|&v| normalize_axis("norm", v, a.ndim()))
            .collect::<EngineResult<_>>()?,
        None => ax.clone(),
    };

    match (ordered.len(), ord) {
        (1, None) => l2(e, &abs, &ax, keepdims, s),
        (1, Some(NormOrd::P(p))) if p == 2.0 => l2(e, &abs, &ax, keepdims, s),
        (1, Some(NormOrd::P(p))) => vector_norm(e, &abs, p, &ax, keepdims, s),
        (1, Some(_)) => Err(EngineError::invalid("norm", "invalid ord for a vector norm")),
        (2, None) | (2, Some(NormOrd::Fro)) => l2(e, &abs, &ax, keepdims, s),
        (2, Some(ord)) => matrix_norm(e, &x, &abs, ord, ordered[0], ordered[1], keepdims, s),
        _ => Err(EngineError::invalid("norm", "improper number of axes")),
    }
}

fn l2(e: &dyn Engine, abs: &Array, axes: &[usize], keepdims: bool, s: &Stream) -> EngineResult<Array> {
    let sq = e.unary(UnaryOp::Square, abs, s)?;
    let total = e.reduce(ReduceOp::Sum, &sq, axes, keepdims, s)?;
    e.unary(UnaryOp::Sqrt, &total, s)
}

fn vector_norm(e: &dyn Engine, abs: &Array, p: f64, axes: &[usize], keepdims: bool, s: &Stream) -> EngineResult<Array> {
    if p == f64::INFINITY {
        e.reduce(ReduceOp::Max, abs, axes, keepdims, s)
    } else if p == f64::NEG_INFINITY {
        e.reduce(ReduceOp::Min, abs, axes, keepdims, s)
    } else if p == 0.0 {
        let nz = e.binary(BinaryOp::NotEqual, abs, &scalar_like(e, 0.0, abs)?, s)?;
        let nz = e.astype(&nz, abs.dtype(), s)?;
        e.reduce(ReduceOp::Sum, &nz, axes, keepdims, s)
    } else if p == 1.0 {
        e.reduce(ReduceOp::Sum, abs, axes, keepdims, s)
    } else {
        let powed = e.binary(BinaryOp::Power, abs, &scalar_like(e, p, abs)?, s)?;
        let total = e.reduce(ReduceOp::Sum, &powed, axes, keepdims, s)?;
        e.binary(BinaryOp::Power, &total, &scalar_like(e, 1.0 / p, &total)?, s)
    }
}

#[allow(clippy::too_many_arguments)]
fn matrix_norm(
    e: &dyn Engine,
    x: &Array,
    abs: &Array,
    ord: NormOrd,
    row: usize,
    col: usize,
    keepdims: bool,
    s: &Stream,
) -> EngineResult<Array> {
    let reduce_pair = |inner: usize, outer_op: ReduceOp| -> EngineResult<Array> {
        let summed = e.reduce(ReduceOp::Sum, abs, &[inner], true, s)?;
        let mut axes = vec![row, col];
        axes.sort_unstable();
        e.reduce(outer_op, &summed, &axes, keepdims, s)
    };
    match ord {
        NormOrd::P(p) if p == f64::INFINITY => reduce_pair(col, ReduceOp::Max),
        NormOrd::P(p) if p == f64::NEG_INFINITY => reduce_pair(col, ReduceOp::Min),
        NormOrd::P(p) if p == 1.0 => reduce_pair(row, ReduceOp::Max),
        NormOrd::P(p) if p == -1.0 => reduce_pair(row, ReduceOp::Min),
        NormOrd::P(p) if p == 2.0 || p == -2.0 => {
            let sv = singular_values(e, x, row, col, s)?;
            let last = sv.ndim() - 1;
            let op = if p > 0.0 { ReduceOp::Max } else { ReduceOp::Min };
            let out = e.reduce(op, &sv, &[last], false, s)?;
            restore_dims(e, &out, x, row, col, keepdims, s)
        }
        NormOrd::Nuc => {
            let sv = singular_values(e, x, row, col, s)?;
            let last = sv.ndim() - 1;
            let out = e.reduce(ReduceOp::Sum, &sv, &[last], false, s)?;
            restore_dims(e, &out, x, row, col, keepdims, s)
        }
        _ => Err(EngineError::invalid("norm", "invalid ord for a matrix norm")),
    }
}

fn singular_values(e: &dyn Engine, x: &Array, row: usize, col: usize, s: &Stream) -> EngineResult<Array> {
    let mut perm: Vec<usize> = (0..x.ndim()).filter(|&i| i != row && i != col).collect();
    perm.push(row);
    perm.push(col);
    let moved = e.transpose(x, &perm, s)?;
    let mut out = e.linalg(LinalgOp::Svd { compute_uv: false }, &[moved], s)?;
    out.pop().ok_or_else(|| EngineError::runtime("svd produced no output"))
}

fn restore_dims(
    e: &dyn Engine,
    out: &Array,
    x: &Array,
    row: usize,
    col: usize,
    keepdims: bool,
    s: &Stream,
) -> EngineResult<Array> {
    if !keepdims {
        return Ok(out.clone());
    }
    let shape: Vec<usize> = x
        .shape()
        .iter()
        .enumerate()
        .map(|(i, &d)| if i == row || i == col { 1 } else { d })
        .collect();
    e.reshape(out, &shape, s)
}

/// Cross product of 3-vectors along `axis`
pub fn cross(e: &dyn Engine, a: &Array, b: &Array, axis: i64, s: &Stream) -> EngineResult<Array> {
    let ax = normalize_axis("cross", axis, a.ndim())?;
    let bx = normalize_axis("cross", axis, b.ndim())?;
    if a.shape()[ax] != 3 || b.shape()[bx] != 3 {
        return Err(EngineError::invalid("cross", "inputs must have size 3 along the cross axis"));
    }
    let comp = |x: &Array, axis: usize, i: usize| slice_axis(e, x, axis, i, i + 1, s);
    let (a0, a1, a2) = (comp(a, ax, 0)?, comp(a, ax, 1)?, comp(a, ax, 2)?);
    let (b0, b1, b2) = (comp(b, bx, 0)?, comp(b, bx, 1)?, comp(b, bx, 2)?);
    let term = |p: &Array, q: &Array, r: &Array, t: &Array| -> EngineResult<Array> {
        e.binary(
            BinaryOp::Subtract,
            &e.binary(BinaryOp::Multiply, p, q, s)?,
            &e.binary(BinaryOp::Multiply, r, t, s)?,
            s,
        )
    };
    let c0 = term(&a1, &b2, &a2, &b1)?;
    let c1 = term(&a2, &b0, &a0, &b2)?;
    let c2 = term(&a0, &b1, &a1, &b0)?;
    e.concatenate(&[c0, c1, c2], ax, s)
}

/// `alpha * (a @ b) + beta * c`
pub fn addmm(e: &dyn Engine, c: &Array, a: &Array, b: &Array, alpha: f64, beta: f64, s: &Stream) -> EngineResult<Array> {
    let prod = e.matmul(a, b, s)?;
    let prod = if alpha != 1.0 {
        e.binary(BinaryOp::Multiply, &prod, &scalar_like(e, alpha, &prod)?, s)?
    } else {
        prod
    };
    let c = if beta != 1.0 {
        e.binary(BinaryOp::Multiply, c, &scalar_like(e, beta, c)?, s)?
    } else {
        c.clone()
    };
    e.binary(BinaryOp::Add, &prod, &c, s)
}

/// Expand a block mask to element granularity over `rows x cols`
fn expand_block_mask(e: &dyn Engine, mask: &Array, block: usize, rows: usize, cols: usize, dtype: Dtype, s: &Stream) -> EngineResult<Array> {
    let m = super::shape::repeat(e, mask, block, Some(-2), s)?;
    let m = super::shape::repeat(e, &m, block, Some(-1), s)?;
    let m = slice_axis(e, &m, m.ndim() - 2, 0, rows, s)?;
    let m = slice_axis(e, &m, m.ndim() - 1, 0, cols, s)?;
    e.astype(&m, dtype, s)
}

/// Matmul with block-level masks on the output and either operand
#[allow(clippy::too_many_arguments)]
pub fn block_masked_mm(
    e: &dyn Engine,
    a: &Array,
    b: &Array,
    block_size: usize,
    mask_out: Option<&Array>,
    mask_lhs: Option<&Array>,
    mask_rhs: Option<&Array>,
    s: &Stream,
) -> EngineResult<Array> {
    if a.ndim() < 2 || b.ndim() < 2 {
        return Err(EngineError::invalid("block_masked_mm", "inputs must have at least two dimensions"));
    }
    if block_size == 0 {
        return Err(EngineError::invalid("block_masked_mm", "block_size must be positive"));
    }
    let (m, k) = (a.shape()[a.ndim() - 2], a.shape()[a.ndim() - 1]);
    let n = b.shape()[b.ndim() - 1];
    let mut lhs = a.clone();
    if let Some(mask) = mask_lhs {
        let full = expand_block_mask(e, mask, block_size, m, k, a.dtype(), s)?;
        lhs = e.binary(BinaryOp::Multiply, &lhs, &full, s)?;
    }
    let mut rhs = b.clone();
    if let Some(mask) = mask_rhs {
        let full = expand_block_mask(e, mask, block_size, k, n, b.dtype(), s)?;
        rhs = e.binary(BinaryOp::Multiply, &rhs, &full, s)?;
    }
    let mut out = e.matmul(&lhs, &rhs, s)?;
    if let Some(mask) = mask_out {
        let full = expand_block_mask(e, mask, block_size, m, n, out.dtype(), s)?;
        out = e.binary(BinaryOp::Multiply, &out, &full, s)?;
    }
    Ok(out)
}

/// One matmul per `[start, end)` range of the contraction axis.
///
/// `a` is `[..., M, K]`, `b` is `[..., K, N]` and `segments` is
/// `[..., S, 2]`; the result is `[..., S, M, N]`.
pub fn segmented_mm(e: &dyn Engine, a: &Array, b: &Array, segments: &Array, s: &Stream) -> EngineResult<Array> {
    if a.ndim() < 2 || b.ndim() < 2 {
        return Err(EngineError::invalid("segmented_mm", "inputs must have at least two dimensions"));
    }
    if segments.ndim() < 2 || segments.shape()[segments.ndim() - 1] != 2 {
        return Err(EngineError::invalid(
            "segmented_mm",
            format!("segments must have shape [..., S, 2], got {:?}", segments.shape()),
        ));
    }
    let k = a.shape()[a.ndim() - 1];
    if b.shape()[b.ndim() - 2] != k {
        return Err(EngineError::invalid(
            "segmented_mm",
            format!("inner dimensions differ: {:?} and {:?}", a.shape(), b.shape()),
        ));
    }
    let last = segments.ndim() - 1;
    let bounds = e.astype(segments, Dtype::Int32, s)?;
    let lo = slice_axis(e, &bounds, last, 0, 1, s)?;
    let hi = slice_axis(e, &bounds, last, 1, 2, s)?;
    let positions = arange(e, 0.0, k as f64, 1.0, Dtype::Int32)?;
    let inside = e.binary(
        BinaryOp::LogicalAnd,
        &e.binary(BinaryOp::GreaterEqual, &positions, &lo, s)?,
        &e.binary(BinaryOp::Less, &positions, &hi, s)?,
        s,
    )?;
    // [..., S, 1, K] against [..., 1, M, K]
    let mask = expand_dims(e, &e.astype(&inside, a.dtype(), s)?, &[-2], s)?;
    let lhs = e.binary(BinaryOp::Multiply, &expand_dims(e, a, &[-3], s)?, &mask, s)?;
    e.matmul(&lhs, &expand_dims(e, b, &[-3], s)?, s)
}

/// Walsh-Hadamard transform along the last axis in Sylvester order.
///
/// The axis length must be a power of two. `scale` defaults to
/// `1 / sqrt(n)`, which makes the transform orthonormal.
pub fn hadamard_transform(e: &dyn Engine, a: &Array, scale: Option<f64>, s: &Stream) -> EngineResult<Array> {
    let Some(&n) = a.shape().last() else {
        return Err(EngineError::invalid("hadamard_transform", "input must have at least one dimension"));
    };
    if !n.is_power_of_two() {
        return Err(EngineError::invalid(
            "hadamard_transform",
            format!("last dimension must be a power of two, got {}", n),
        ));
    }
    let scale = scale.unwrap_or(1.0 / (n as f64).sqrt());
    let entries = (0..n * n)
        .map(|i| if ((i / n) & (i % n)).count_ones() % 2 == 0 { scale } else { -scale })
        .collect();
    let dtype = float_dtype(a.dtype());
    let h = e.from_buffer(HostBuffer::Float64(entries), &[n, n], dtype)?;
    e.matmul(&e.astype(a, dtype, s)?, &h, s)
}

/// Flatten batch dims of a matrix stack to `[batch, rows, cols]`
fn batch_matrices(e: &dyn Engine, x: &Array, s: &Stream) -> EngineResult<Array> {
    if x.ndim() < 2 {
        return Err(EngineError::invalid("gather_mm", "inputs must have at least two dimensions"));
    }
    let rows = x.shape()[x.ndim() - 2];
    let cols = x.shape()[x.ndim() - 1];
    let batch: usize = x.shape()[..x.ndim() - 2].iter().product();
    e.reshape(x, &[batch, rows, cols], s)
}

/// Matmul of matrices gathered from the batch dimensions of `a` and `b`
pub fn gather_mm(
    e: &dyn Engine,
    a: &Array,
    b: &Array,
    lhs_indices: Option<&Array>,
    rhs_indices: Option<&Array>,
    s: &Stream,
) -> EngineResult<Array> {
    let fa = batch_matrices(e, a, s)?;
    let fb = batch_matrices(e, b, s)?;
    let default_idx = |batch: usize, shape: &[usize]| -> EngineResult<Array> {
        let idx = arange(e, 0.0, batch as f64, 1.0, Dtype::Uint32)?;
        e.reshape(&idx, shape, s)
    };
    let lhs = match lhs_indices {
        Some(i) => i.clone(),
        None => default_idx(fa.shape()[0], &a.shape()[..a.ndim() - 2])?,
    };
    let rhs = match rhs_indices {
        Some(i) => i.clone(),
        None => default_idx(fb.shape()[0], &b.shape()[..b.ndim() - 2])?,
    };
    let idx = super::shape::broadcast_arrays(e, &[lhs, rhs], s)?;
    let batch_shape = idx[0].shape().to_vec();
    let li = flatten(e, &idx[0], 0, -1, s)?;
    let ri = flatten(e, &idx[1], 0, -1, s)?;
    let sa = e.take(&fa, &li, 0, s)?;
    let sb = e.take(&fb, &ri, 0, s)?;
    let prod = e.matmul(&sa, &sb, s)?;
    let mut out = batch_shape;
    out.push(prod.shape()[1]);
    out.push(prod.shape()[2]);
    e.reshape(&prod, &out, s)
}

fn matrix_t(e: &dyn Engine, w: &Array, s: &Stream) -> EngineResult<Array> {
    let nd = w.ndim();
    let mut perm: Vec<usize> = (0..nd).collect();
    perm.swap(nd - 1, nd - 2);
    e.transpose(w, &perm, s)
}

/// Quantization parameters with their defaults filled in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuantParams {
    pub group_size: usize,
    pub bits: u32,
    pub mode: QuantMode,
}

impl QuantParams {
    pub fn new(group_size: Option<usize>, bits: Option<u32>, mode: QuantMode) -> Self {
        Self {
            group_size: group_size.unwrap_or_else(|| mode.default_group_size()),
            bits: bits.unwrap_or_else(|| mode.default_bits()),
            mode,
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn dequantized_weight(
    e: &dyn Engine,
    x: &Array,
    w: &Array,
    scales: &Array,
    biases: Option<&Array>,
    transpose: bool,
    q: QuantParams,
    s: &Stream,
) -> EngineResult<Array> {
    let dtype = if x.dtype().is_floating() { x.dtype() } else { Dtype::Float32 };
    let full = e.dequantize(w, scales, biases, q.group_size, q.bits, q.mode, Some(dtype), s)?;
    if transpose {
        matrix_t(e, &full, s)
    } else {
        Ok(full)
    }
}

/// `x @ dequantize(w).T` (or without the transpose)
#[allow(clippy::too_many_arguments)]
pub fn quantized_matmul(
    e: &dyn Engine,
    x: &Array,
    w: &Array,
    scales: &Array,
    biases: Option<&Array>,
    transpose: bool,
    q: QuantParams,
    s: &Stream,
) -> EngineResult<Array> {
    if q.mode == QuantMode::Affine && biases.is_none() {
        return Err(EngineError::invalid("quantized_matmul", "affine quantization requires biases"));
    }
    let wf = dequantized_weight(e, x, w, scales, biases, transpose, q, s)?;
    e.matmul(x, &wf, s)
}

#[allow(clippy::too_many_arguments)]
pub fn gather_qmm(
    e: &dyn Engine,
    x: &Array,
    w: &Array,
    scales: &Array,
    biases: Option<&Array>,
    lhs_indices: Option<&Array>,
    rhs_indices: Option<&Array>,
    transpose: bool,
    q: QuantParams,
    s: &Stream,
) -> EngineResult<Array> {
    if q.mode == QuantMode::Affine && biases.is_none() {
        return Err(EngineError::invalid("gather_qmm", "affine quantization requires biases"));
    }
    let wf = dequantized_weight(e, x, w, scales, biases, transpose, q, s)?;
    gather_mm(e, x, &wf, lhs_indices, rhs_indices, s)
}

/// Product of `x` with a weight quantized in one of the fp4 schemes
pub fn qqmm(e: &dyn Engine, x: &Array, w: &Array, scales: &Array, q: QuantParams, s: &Stream) -> EngineResult<Array> {
    if q.mode == QuantMode::Affine {
        return Err(EngineError::invalid("qqmm", "only nvfp4 and mxfp4 modes are supported"));
    }
    let wf = dequantized_weight(e, x, w, scales, None, true, q, s)?;
    e.matmul(x, &wf, s)
}
