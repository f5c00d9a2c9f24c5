//! Derived elementwise math and reductions.

use std::f64::consts::PI;

use crate::array::Array;
use crate::device::Stream;
use crate::dtype::{finfo, Dtype};
use crate::engine::{ArgReduceOp, BinaryOp, Engine, ReduceOp, ScanOp, UnaryOp};
use crate::error::{EngineError, EngineResult};

use super::shape::{flatten, slice_axis};
use super::{float_dtype, normalize_axis, resolve_axes, scalar, scalar_like};

fn to_float(e: &dyn Engine, a: &Array, s: &Stream) -> EngineResult<Array> {
    let dt = float_dtype(a.dtype());
    if dt == a.dtype() {
        Ok(a.clone())
    } else {
        e.astype(a, dt, s)
    }
}

// ============================================================================
// Elementwise
// ============================================================================

pub fn degrees(e: &dyn Engine, a: &Array, s: &Stream) -> EngineResult<Array> {
    let x = to_float(e, a, s)?;
    e.binary(BinaryOp::Multiply, &x, &scalar_like(e, 180.0 / PI, &x)?, s)
}

pub fn radians(e: &dyn Engine, a: &Array, s: &Stream) -> EngineResult<Array> {
    let x = to_float(e, a, s)?;
    e.binary(BinaryOp::Multiply, &x, &scalar_like(e, PI / 180.0, &x)?, s)
}

/// Decode uint8 e4m3 bytes into `dtype`
pub fn from_fp8(e: &dyn Engine, a: &Array, dtype: Dtype, s: &Stream) -> EngineResult<Array> {
    if !dtype.is_inexact() || dtype.is_complex() {
        return Err(EngineError::dtype("from_fp8", dtype));
    }
    let decoded = e.unary(UnaryOp::FromFp8, a, s)?;
    if decoded.dtype() == dtype {
        Ok(decoded)
    } else {
        e.astype(&decoded, dtype, s)
    }
}

/// Clip into `[lo, hi]`; at least one bound must be given
pub fn clip(e: &dyn Engine, a: &Array, lo: Option<&Array>, hi: Option<&Array>, s: &Stream) -> EngineResult<Array> {
    if lo.is_none() && hi.is_none() {
        return Err(EngineError::invalid("clip", "at most one of a_min and a_max may be nil"));
    }
    let mut x = a.clone();
    if let Some(lo) = lo {
        x = e.binary(BinaryOp::Maximum, &x, lo, s)?;
    }
    if let Some(hi) = hi {
        x = e.binary(BinaryOp::Minimum, &x, hi, s)?;
    }
    Ok(x)
}

pub fn nan_to_num(
    e: &dyn Engine,
    a: &Array,
    nan: f64,
    posinf: Option<f64>,
    neginf: Option<f64>,
    s: &Stream,
) -> EngineResult<Array> {
    let Some(info) = finfo(a.dtype()) else {
        return Ok(a.clone());
    };
    let posinf = scalar_like(e, posinf.unwrap_or(info.max), a)?;
    let neginf = scalar_like(e, neginf.unwrap_or(info.min), a)?;
    let nan = scalar_like(e, nan, a)?;
    let x = e.select(&e.unary(UnaryOp::IsNan, a, s)?, &nan, a, s)?;
    let x = e.select(&e.unary(UnaryOp::IsPosInf, &x, s)?, &posinf, &x, s)?;
    e.select(&e.unary(UnaryOp::IsNegInf, &x, s)?, &neginf, &x, s)
}

/// `|a - b| <= atol + rtol * |b|`, with equal infinities and optionally NaNs matching
pub fn isclose(
    e: &dyn Engine,
    a: &Array,
    b: &Array,
    rtol: f64,
    atol: f64,
    equal_nan: bool,
    s: &Stream,
) -> EngineResult<Array> {
    let dt = crate::dtype::promote_types(float_dtype(a.dtype()), float_dtype(b.dtype()));
    let (fa, fb) = (e.astype(a, dt, s)?, e.astype(b, dt, s)?);
    let diff = e.unary(UnaryOp::Abs, &e.binary(BinaryOp::Subtract, &fa, &fb, s)?, s)?;
    let tol = e.binary(
        BinaryOp::Add,
        &scalar(e, atol, dt)?,
        &e.binary(BinaryOp::Multiply, &scalar(e, rtol, dt)?, &e.unary(UnaryOp::Abs, &fb, s)?, s)?,
        s,
    )?;
    let mut out = e.binary(BinaryOp::LessEqual, &diff, &tol, s)?;
    out = e.binary(BinaryOp::LogicalOr, &out, &e.binary(BinaryOp::Equal, &fa, &fb, s)?, s)?;
    if equal_nan {
        let both = e.binary(
            BinaryOp::LogicalAnd,
            &e.unary(UnaryOp::IsNan, &fa, s)?,
            &e.unary(UnaryOp::IsNan, &fb, s)?,
            s,
        )?;
        out = e.binary(BinaryOp::LogicalOr, &out, &both, s)?;
    }
    Ok(out)
}

pub fn allclose(
    e: &dyn Engine,
    a: &Array,
    b: &Array,
    rtol: f64,
    atol: f64,
    equal_nan: bool,
    s: &Stream,
) -> EngineResult<Array> {
    let close = isclose(e, a, b, rtol, atol, equal_nan, s)?;
    reduce(e, ReduceOp::All, &close, None, false, s)
}

/// Scalar boolean: same shape and equal values
pub fn array_equal(e: &dyn Engine, a: &Array, b: &Array, equal_nan: bool, s: &Stream) -> EngineResult<Array> {
    if a.shape() != b.shape() {
        return scalar(e, 0.0, Dtype::Bool);
    }
    let mut eq = e.binary(BinaryOp::Equal, a, b, s)?;
    if equal_nan && a.dtype().is_inexact() && b.dtype().is_inexact() {
        let both = e.binary(
            BinaryOp::LogicalAnd,
            &e.unary(UnaryOp::IsNan, a, s)?,
            &e.unary(UnaryOp::IsNan, b, s)?,
            s,
        )?;
        eq = e.binary(BinaryOp::LogicalOr, &eq, &both, s)?;
    }
    reduce(e, ReduceOp::All, &eq, None, false, s)
}

/// `(floor_divide(a, b), remainder(a, b))`
pub fn divmod(e: &dyn Engine, a: &Array, b: &Array, s: &Stream) -> EngineResult<Vec<Array>> {
    Ok(vec![
        e.binary(BinaryOp::FloorDivide, a, b, s)?,
        e.binary(BinaryOp::Remainder, a, b, s)?,
    ])
}

// ============================================================================
// Reductions
// ============================================================================

/// Reduction over optional, possibly negative axes
pub fn reduce(
    e: &dyn Engine,
    op: ReduceOp,
    a: &Array,
    axes: Option<&[i64]>,
    keepdims: bool,
    s: &Stream,
) -> EngineResult<Array> {
    let axes = resolve_axes(op.name(), axes, a.ndim())?;
    e.reduce(op, a, &axes, keepdims, s)
}

fn reduced_count(a: &Array, axes: &[usize]) -> usize {
    axes.iter().map(|&ax| a.shape()[ax]).product()
}

pub fn mean(e: &dyn Engine, a: &Array, axes: Option<&[i64]>, keepdims: bool, s: &Stream) -> EngineResult<Array> {
    let ax = resolve_axes("mean", axes, a.ndim())?;
    let x = to_float(e, a, s)?;
    let total = e.reduce(ReduceOp::Sum, &x, &ax, keepdims, s)?;
    let n = reduced_count(a, &ax) as f64;
    e.binary(BinaryOp::Divide, &total, &scalar_like(e, n, &total)?, s)
}

pub fn var(
    e: &dyn Engine,
    a: &Array,
    axes: Option<&[i64]>,
    keepdims: bool,
    ddof: usize,
    s: &Stream,
) -> EngineResult<Array> {
    let ax = resolve_axes("var", axes, a.ndim())?;
    let x = to_float(e, a, s)?;
    let n = reduced_count(a, &ax);
    let ax_i: Vec<i64> = ax.iter().map(|&v| v as i64).collect();
    let mu = mean(e, &x, Some(&ax_i), true, s)?;
    let centered = e.binary(BinaryOp::Subtract, &x, &mu, s)?;
    let sq = e.unary(UnaryOp::Square, &centered, s)?;
    let total = e.reduce(ReduceOp::Sum, &sq, &ax, keepdims, s)?;
    let denom = n.saturating_sub(ddof) as f64;
    let denom = if denom == 0.0 { f64::NAN } else { denom };
    e.binary(BinaryOp::Divide, &total, &scalar_like(e, denom, &total)?, s)
}

pub fn std(
    e: &dyn Engine,
    a: &Array,
    axes: Option<&[i64]>,
    keepdims: bool,
    ddof: usize,
    s: &Stream,
) -> EngineResult<Array> {
    let v = var(e, a, axes, keepdims, ddof, s)?;
    e.unary(UnaryOp::Sqrt, &v, s)
}

/// Move `axes` to the end and merge them into one trailing axis
fn gather_axes(e: &dyn Engine, a: &Array, axes: &[usize], s: &Stream) -> EngineResult<Array> {
    let mut perm: Vec<usize> = (0..a.ndim()).filter(|i| !axes.contains(i)).collect();
    perm.extend_from_slice(axes);
    let x = e.transpose(a, &perm, s)?;
    let keep = a.ndim() - axes.len();
    let mut shape: Vec<usize> = x.shape()[..keep].to_vec();
    shape.push(x.shape()[keep..].iter().product());
    e.reshape(&x, &shape, s)
}

fn keepdims_shape(a: &Array, axes: &[usize]) -> Vec<usize> {
    a.shape()
        .iter()
        .enumerate()
        .map(|(i, &d)| if axes.contains(&i) { 1 } else { d })
        .collect()
}

pub fn median(e: &dyn Engine, a: &Array, axes: Option<&[i64]>, keepdims: bool, s: &Stream) -> EngineResult<Array> {
    let ax = resolve_axes("median", axes, a.ndim())?;
    let x = gather_axes(e, &to_float(e, a, s)?, &ax, s)?;
    let last = x.ndim() - 1;
    let n = x.shape()[last];
    if n == 0 {
        return Err(EngineError::invalid("median", "cannot compute the median of an empty axis"));
    }
    let sorted = e.sort(&x, last, s)?;
    let hi = slice_axis(e, &sorted, last, n / 2, n / 2 + 1, s)?;
    let mid = if n % 2 == 1 {
        hi
    } else {
        let lo = slice_axis(e, &sorted, last, n / 2 - 1, n / 2, s)?;
        let sum = e.binary(BinaryOp::Add, &lo, &hi, s)?;
        e.binary(BinaryOp::Multiply, &sum, &scalar_like(e, 0.5, &sum)?, s)?
    };
    let out = if keepdims { keepdims_shape(a, &ax) } else { mid.shape()[..last].to_vec() };
    e.reshape(&mid, &out, s)
}

pub fn logsumexp(e: &dyn Engine, a: &Array, axes: Option<&[i64]>, keepdims: bool, s: &Stream) -> EngineResult<Array> {
    let ax = resolve_axes("logsumexp", axes, a.ndim())?;
    let x = to_float(e, a, s)?;
    let m = e.reduce(ReduceOp::Max, &x, &ax, true, s)?;
    let m = e.unary(UnaryOp::StopGradient, &m, s)?;
    let finite = e.unary(UnaryOp::IsFinite, &m, s)?;
    let m = e.select(&finite, &m, &scalar_like(e, 0.0, &m)?, s)?;
    let shifted = e.unary(UnaryOp::Exp, &e.binary(BinaryOp::Subtract, &x, &m, s)?, s)?;
    let total = e.reduce(ReduceOp::Sum, &shifted, &ax, true, s)?;
    let out = e.binary(BinaryOp::Add, &e.unary(UnaryOp::Log, &total, s)?, &m, s)?;
    if keepdims {
        Ok(out)
    } else {
        let shape: Vec<usize> = (0..a.ndim()).filter(|i| !ax.contains(i)).map(|i| a.shape()[i]).collect();
        e.reshape(&out, &shape, s)
    }
}

/// Softmax over `axes`. With `precise` the computation is carried out in float32
/// for half precision inputs.
pub fn softmax(e: &dyn Engine, a: &Array, axes: Option<&[i64]>, precise: bool, s: &Stream) -> EngineResult<Array> {
    let ax = resolve_axes("softmax", axes, a.ndim())?;
    let mut x = to_float(e, a, s)?;
    let out_dtype = x.dtype();
    if precise && matches!(out_dtype, Dtype::Float16 | Dtype::Bfloat16) {
        x = e.astype(&x, Dtype::Float32, s)?;
    }
    let m = e.unary(UnaryOp::StopGradient, &e.reduce(ReduceOp::Max, &x, &ax, true, s)?, s)?;
    let ex = e.unary(UnaryOp::Exp, &e.binary(BinaryOp::Subtract, &x, &m, s)?, s)?;
    let total = e.reduce(ReduceOp::Sum, &ex, &ax, true, s)?;
    let out = e.binary(BinaryOp::Divide, &ex, &total, s)?;
    if out.dtype() != out_dtype {
        e.astype(&out, out_dtype, s)
    } else {
        Ok(out)
    }
}

/// Index of the extreme element; flattened when `axis` is `None`
pub fn arg_reduce(
    e: &dyn Engine,
    op: ArgReduceOp,
    a: &Array,
    axis: Option<i64>,
    keepdims: bool,
    s: &Stream,
) -> EngineResult<Array> {
    let name = match op {
        ArgReduceOp::ArgMin => "argmin",
        ArgReduceOp::ArgMax => "argmax",
    };
    match axis {
        Some(ax) => {
            let ax = normalize_axis(name, ax, a.ndim())?;
            e.arg_reduce(op, a, ax, keepdims, s)
        }
        None => {
            let flat = flatten(e, a, 0, -1, s)?;
            let out = e.arg_reduce(op, &flat, 0, false, s)?;
            if keepdims {
                e.reshape(&out, &vec![1; a.ndim()], s)
            } else {
                Ok(out)
            }
        }
    }
}

/// Cumulative op along `axis`; flattened when `None`
pub fn scan(
    e: &dyn Engine,
    op: ScanOp,
    a: &Array,
    axis: Option<i64>,
    reverse: bool,
    inclusive: bool,
    s: &Stream,
) -> EngineResult<Array> {
    match axis {
        Some(ax) => {
            let ax = normalize_axis("scan", ax, a.ndim())?;
            e.scan(op, a, ax, reverse, inclusive, s)
        }
        None => {
            let flat = flatten(e, a, 0, -1, s)?;
            e.scan(op, &flat, 0, reverse, inclusive, s)
        }
    }
}

/// Sort along `axis`; flattened when `None`
pub fn sort(e: &dyn Engine, a: &Array, axis: Option<i64>, s: &Stream) -> EngineResult<Array> {
    match axis {
        Some(ax) => e.sort(a, normalize_axis("sort", ax, a.ndim())?, s),
        None => e.sort(&flatten(e, a, 0, -1, s)?, 0, s),
    }
}

pub fn argsort(e: &dyn Engine, a: &Array, axis: Option<i64>, s: &Stream) -> EngineResult<Array> {
    match axis {
        Some(ax) => e.argsort(a, normalize_axis("argsort", ax, a.ndim())?, s),
        None => e.argsort(&flatten(e, a, 0, -1, s)?, 0, s),
    }
}

pub fn partition(e: &dyn Engine, a: &Array, kth: i64, axis: Option<i64>, arg: bool, s: &Stream) -> EngineResult<Array> {
    let (x, ax) = match axis {
        Some(ax) => (a.clone(), normalize_axis("partition", ax, a.ndim())?),
        None => (flatten(e, a, 0, -1, s)?, 0),
    };
    let kth = normalize_axis("partition", kth, x.shape()[ax])
        .map_err(|_| EngineError::invalid("partition", format!("kth {} out of range", kth)))?;
    if arg {
        e.argpartition(&x, kth, ax, s)
    } else {
        e.partition(&x, kth, ax, s)
    }
}

/// The `k` largest entries along `axis`, in ascending order
pub fn topk(e: &dyn Engine, a: &Array, k: usize, axis: Option<i64>, s: &Stream) -> EngineResult<Array> {
    let (x, ax) = match axis {
        Some(ax) => (a.clone(), normalize_axis("topk", ax, a.ndim())?),
        None => (flatten(e, a, 0, -1, s)?, 0),
    };
    let n = x.shape()[ax];
    if k == 0 || k > n {
        return Err(EngineError::invalid(
            "topk",
            format!("k must be in [1, {}], got {}", n, k),
        ));
    }
    let sorted = e.sort(&x, ax, s)?;
    slice_axis(e, &sorted, ax, n - k, n, s)
}
