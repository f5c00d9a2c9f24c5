//! Shape manipulation built on reshape/transpose/broadcast/slice/gather.

use crate::array::Array;
use crate::device::Stream;
use crate::dtype::Dtype;
use crate::engine::{BinaryOp, Engine, ReduceOp};
use crate::error::{EngineError, EngineResult};

use super::creation::{tri, zeros};
use super::{broadcast_shapes, index_array, normalize_axes, normalize_axis};

// ============================================================================
// Reshaping
// ============================================================================

/// Reshape with at most one inferred (`-1`) dimension
pub fn reshape(e: &dyn Engine, a: &Array, shape: &[i64], s: &Stream) -> EngineResult<Array> {
    let resolved = infer_shape("reshape", a.size(), shape)?;
    e.reshape(a, &resolved, s)
}

/// Resolve a shape that may contain one `-1`
pub fn infer_shape(op: &str, size: usize, shape: &[i64]) -> EngineResult<Vec<usize>> {
    let mut infer = None;
    let mut known = 1usize;
    for (i, &d) in shape.iter().enumerate() {
        if d == -1 {
            if infer.is_some() {
                return Err(EngineError::invalid(op, "can only infer one dimension"));
            }
            infer = Some(i);
        } else if d < 0 {
            return Err(EngineError::invalid(op, format!("invalid dimension {}", d)));
        } else {
            known *= d as usize;
        }
    }
    let mut out: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
    if let Some(i) = infer {
        if known == 0 || size % known != 0 {
            return Err(EngineError::invalid(
                op,
                format!("cannot infer dimension for array of size {} into {:?}", size, shape),
            ));
        }
        out[i] = size / known;
    } else if known != size {
        return Err(EngineError::invalid(
            op,
            format!("cannot reshape array of size {} into shape {:?}", size, shape),
        ));
    }
    Ok(out)
}

pub fn flatten(e: &dyn Engine, a: &Array, start: i64, end: i64, s: &Stream) -> EngineResult<Array> {
    if a.ndim() == 0 {
        return e.reshape(a, &[1], s);
    }
    let start = normalize_axis("flatten", start, a.ndim())?;
    let end = normalize_axis("flatten", end, a.ndim())?;
    if start > end {
        return Err(EngineError::invalid("flatten", "start_axis must be <= end_axis"));
    }
    let shape = a.shape();
    let mut out: Vec<usize> = shape[..start].to_vec();
    out.push(shape[start..=end].iter().product());
    out.extend_from_slice(&shape[end + 1..]);
    e.reshape(a, &out, s)
}

pub fn unflatten(e: &dyn Engine, a: &Array, axis: i64, shape: &[i64], s: &Stream) -> EngineResult<Array> {
    let axis = normalize_axis("unflatten", axis, a.ndim())?;
    let inner = infer_shape("unflatten", a.shape()[axis], shape)?;
    let mut out: Vec<usize> = a.shape()[..axis].to_vec();
    out.extend(inner);
    out.extend_from_slice(&a.shape()[axis + 1..]);
    e.reshape(a, &out, s)
}

/// Remove size-one axes (all of them when `axes` is `None`)
pub fn squeeze(e: &dyn Engine, a: &Array, axes: Option<&[i64]>, s: &Stream) -> EngineResult<Array> {
    let shape = a.shape();
    let drop = match axes {
        Some(axes) => {
            let axes = normalize_axes("squeeze", axes, a.ndim())?;
            if let Some(&bad) = axes.iter().find(|&&ax| shape[ax] != 1) {
                return Err(EngineError::invalid(
                    "squeeze",
                    format!("cannot squeeze axis {} with size {}", bad, shape[bad]),
                ));
            }
            axes
        }
        None => (0..shape.len()).filter(|&i| shape[i] == 1).collect(),
    };
    let out: Vec<usize> = (0..shape.len())
        .filter(|i| !drop.contains(i))
        .map(|i| shape[i])
        .collect();
    e.reshape(a, &out, s)
}

pub fn expand_dims(e: &dyn Engine, a: &Array, axes: &[i64], s: &Stream) -> EngineResult<Array> {
    let out_ndim = a.ndim() + axes.len();
    let axes = normalize_axes("expand_dims", axes, out_ndim)?;
    let mut src = a.shape().iter();
    let out: Vec<usize> = (0..out_ndim)
        .map(|i| {
            if axes.contains(&i) {
                1
            } else {
                src.next().copied().unwrap_or(1)
            }
        })
        .collect();
    e.reshape(a, &out, s)
}

// ============================================================================
// Axis permutations
// ============================================================================

/// Transpose by an explicit permutation, or reverse axes when `None`
pub fn transpose(e: &dyn Engine, a: &Array, axes: Option<&[i64]>, s: &Stream) -> EngineResult<Array> {
    let perm: Vec<usize> = match axes {
        Some(axes) => {
            if axes.len() != a.ndim() {
                return Err(EngineError::invalid(
                    "transpose",
                    format!("axes {:?} do not match array of dimension {}", axes, a.ndim()),
                ));
            }
            let mut perm = Vec::with_capacity(axes.len());
            for &ax in axes {
                let ax = normalize_axis("transpose", ax, a.ndim())?;
                if perm.contains(&ax) {
                    return Err(EngineError::invalid("transpose", "repeated axis in permutation"));
                }
                perm.push(ax);
            }
            perm
        }
        None => (0..a.ndim()).rev().collect(),
    };
    e.transpose(a, &perm, s)
}

pub fn swapaxes(e: &dyn Engine, a: &Array, axis1: i64, axis2: i64, s: &Stream) -> EngineResult<Array> {
    let a1 = normalize_axis("swapaxes", axis1, a.ndim())?;
    let a2 = normalize_axis("swapaxes", axis2, a.ndim())?;
    let mut perm: Vec<usize> = (0..a.ndim()).collect();
    perm.swap(a1, a2);
    e.transpose(a, &perm, s)
}

pub fn moveaxis(e: &dyn Engine, a: &Array, source: i64, destination: i64, s: &Stream) -> EngineResult<Array> {
    let src = normalize_axis("moveaxis", source, a.ndim())?;
    let dst = normalize_axis("moveaxis", destination, a.ndim())?;
    let mut perm: Vec<usize> = (0..a.ndim()).filter(|&i| i != src).collect();
    perm.insert(dst, src);
    e.transpose(a, &perm, s)
}

/// Promote `a` to at least `ndim` dimensions the way numpy does
pub fn atleast(e: &dyn Engine, a: &Array, ndim: usize, s: &Stream) -> EngineResult<Array> {
    let shape = a.shape();
    if shape.len() >= ndim {
        return Ok(a.clone());
    }
    let out: Vec<usize> = match (ndim, shape.len()) {
        (_, 0) => vec![1; ndim],
        (2, 1) => vec![1, shape[0]],
        (3, 1) => vec![1, shape[0], 1],
        (3, 2) => vec![shape[0], shape[1], 1],
        _ => shape.to_vec(),
    };
    e.reshape(a, &out, s)
}

// ============================================================================
// Joining and splitting
// ============================================================================

pub fn concatenate(e: &dyn Engine, arrays: &[Array], axis: i64, s: &Stream) -> EngineResult<Array> {
    let first = arrays
        .first()
        .ok_or_else(|| EngineError::invalid("concatenate", "no arrays provided"))?;
    let axis = normalize_axis("concatenate", axis, first.ndim())?;
    e.concatenate(arrays, axis, s)
}

pub fn stack(e: &dyn Engine, arrays: &[Array], axis: i64, s: &Stream) -> EngineResult<Array> {
    let first = arrays
        .first()
        .ok_or_else(|| EngineError::invalid("stack", "no arrays provided"))?;
    let axis = normalize_axis("stack", axis, first.ndim() + 1)?;
    let expanded = arrays
        .iter()
        .map(|a| {
            if a.shape() != first.shape() {
                return Err(EngineError::invalid("stack", "all arrays must have the same shape"));
            }
            expand_dims(e, a, &[axis as i64], s)
        })
        .collect::<EngineResult<Vec<_>>>()?;
    e.concatenate(&expanded, axis, s)
}

/// Slice `[lo, hi)` of `axis`
pub fn slice_axis(e: &dyn Engine, a: &Array, axis: usize, lo: usize, hi: usize, s: &Stream) -> EngineResult<Array> {
    let mut start = vec![0i64; a.ndim()];
    let mut stop: Vec<i64> = a.shape().iter().map(|&d| d as i64).collect();
    let strides = vec![1i64; a.ndim()];
    start[axis] = lo as i64;
    stop[axis] = hi.max(lo) as i64;
    e.slice(a, &start, &stop, &strides, s)
}

/// Split into `sections` equal parts along `axis`
pub fn split_sections(e: &dyn Engine, a: &Array, sections: usize, axis: i64, s: &Stream) -> EngineResult<Vec<Array>> {
    let ax = normalize_axis("split", axis, a.ndim())?;
    let len = a.shape()[ax];
    if sections == 0 || len % sections != 0 {
        return Err(EngineError::invalid(
            "split",
            "array split does not result in sub arrays with equal size",
        ));
    }
    let step = len / sections;
    (0..sections)
        .map(|i| slice_axis(e, a, ax, i * step, (i + 1) * step, s))
        .collect()
}

/// Split at the given boundaries along `axis`; produces `indices.len() + 1` parts
pub fn split_indices(e: &dyn Engine, a: &Array, indices: &[i64], axis: i64, s: &Stream) -> EngineResult<Vec<Array>> {
    let ax = normalize_axis("split", axis, a.ndim())?;
    let len = a.shape()[ax] as i64;
    let clamp = |i: i64| -> usize {
        let i = if i < 0 { i + len } else { i };
        i.clamp(0, len) as usize
    };
    let mut bounds = vec![0usize];
    bounds.extend(indices.iter().map(|&i| clamp(i)));
    bounds.push(len as usize);
    bounds
        .windows(2)
        .map(|w| slice_axis(e, a, ax, w[0], w[1], s))
        .collect()
}

pub fn broadcast_arrays(e: &dyn Engine, arrays: &[Array], s: &Stream) -> EngineResult<Vec<Array>> {
    let mut shape: Vec<usize> = Vec::new();
    for a in arrays {
        shape = broadcast_shapes("broadcast_arrays", &shape, a.shape())?;
    }
    arrays.iter().map(|a| e.broadcast_to(a, &shape, s)).collect()
}

// ============================================================================
// Repetition
// ============================================================================

pub fn tile(e: &dyn Engine, a: &Array, reps: &[usize], s: &Stream) -> EngineResult<Array> {
    let ndim = a.ndim().max(reps.len());
    let mut shape = vec![1usize; ndim - a.ndim()];
    shape.extend_from_slice(a.shape());
    let mut reps_full = vec![1usize; ndim - reps.len()];
    reps_full.extend_from_slice(reps);

    let mut interleaved = Vec::with_capacity(ndim * 2);
    let mut target = Vec::with_capacity(ndim * 2);
    let mut out = Vec::with_capacity(ndim);
    for (d, r) in shape.iter().zip(&reps_full) {
        interleaved.extend_from_slice(&[1, *d]);
        target.extend_from_slice(&[*r, *d]);
        out.push(r * d);
    }
    let x = e.reshape(a, &interleaved, s)?;
    let x = e.broadcast_to(&x, &target, s)?;
    e.reshape(&x, &out, s)
}

/// Repeat each element `repeats` times along `axis` (flattened when `None`)
pub fn repeat(e: &dyn Engine, a: &Array, repeats: usize, axis: Option<i64>, s: &Stream) -> EngineResult<Array> {
    let (x, axis) = match axis {
        Some(ax) => (a.clone(), normalize_axis("repeat", ax, a.ndim())?),
        None => (flatten(e, a, 0, -1, s)?, 0),
    };
    let shape = x.shape().to_vec();
    let expanded = expand_dims(e, &x, &[axis as i64 + 1], s)?;
    let mut target = shape.clone();
    target.insert(axis + 1, repeats);
    let b = e.broadcast_to(&expanded, &target, s)?;
    let mut out = shape;
    out[axis] *= repeats;
    e.reshape(&b, &out, s)
}

/// Roll elements along `axes`; flattened roll when `None`
pub fn roll(e: &dyn Engine, a: &Array, shift: &[i64], axes: Option<&[i64]>, s: &Stream) -> EngineResult<Array> {
    let Some(axes) = axes else {
        let flat = flatten(e, a, 0, -1, s)?;
        let total: i64 = shift.iter().sum();
        let rolled = roll_axis(e, &flat, total, 0, s)?;
        return e.reshape(&rolled, a.shape(), s);
    };
    if shift.len() != axes.len() && shift.len() != 1 {
        return Err(EngineError::invalid("roll", "shift and axis must have the same length"));
    }
    let mut x = a.clone();
    for (i, &ax) in axes.iter().enumerate() {
        let ax = normalize_axis("roll", ax, a.ndim())?;
        let sh = if shift.len() == 1 { shift[0] } else { shift[i] };
        x = roll_axis(e, &x, sh, ax, s)?;
    }
    Ok(x)
}

fn roll_axis(e: &dyn Engine, a: &Array, shift: i64, axis: usize, s: &Stream) -> EngineResult<Array> {
    let n = a.shape()[axis] as i64;
    if n == 0 {
        return Ok(a.clone());
    }
    let k = shift.rem_euclid(n) as usize;
    if k == 0 {
        return Ok(a.clone());
    }
    let n = n as usize;
    let tail = slice_axis(e, a, axis, n - k, n, s)?;
    let head = slice_axis(e, a, axis, 0, n - k, s)?;
    e.concatenate(&[tail, head], axis, s)
}

// ============================================================================
// Diagonals and triangles
// ============================================================================

/// Diagonal with `offset` taken over `axis1`/`axis2`, appended as the last axis
pub fn diagonal(e: &dyn Engine, a: &Array, offset: i64, axis1: i64, axis2: i64, s: &Stream) -> EngineResult<Array> {
    if a.ndim() < 2 {
        return Err(EngineError::invalid("diagonal", "array must have at least two dimensions"));
    }
    let ax1 = normalize_axis("diagonal", axis1, a.ndim())?;
    let ax2 = normalize_axis("diagonal", axis2, a.ndim())?;
    if ax1 == ax2 {
        return Err(EngineError::invalid("diagonal", "axis1 and axis2 cannot be the same"));
    }
    let mut perm: Vec<usize> = (0..a.ndim()).filter(|&i| i != ax1 && i != ax2).collect();
    perm.push(ax1);
    perm.push(ax2);
    let x = e.transpose(a, &perm, s)?;
    let (n, m) = (a.shape()[ax1] as i64, a.shape()[ax2] as i64);
    let mut shape: Vec<usize> = x.shape()[..x.ndim() - 2].to_vec();
    shape.push((n * m) as usize);
    let flat = e.reshape(&x, &shape, s)?;

    let flat_idx: Vec<i64> = (0..n)
        .filter_map(|i| {
            let j = i + offset;
            (j >= 0 && j < m).then_some(i * m + j)
        })
        .collect();
    let idx = index_array(e, &flat_idx)?;
    e.take(&flat, &idx, shape.len() - 1, s)
}

/// Extract a diagonal from a matrix or build a matrix from a vector
pub fn diag(e: &dyn Engine, a: &Array, k: i64, s: &Stream) -> EngineResult<Array> {
    match a.ndim() {
        1 => {
            let len = a.shape()[0];
            let n = len + k.unsigned_abs() as usize;
            let flat = zeros(e, &[n * n], a.dtype(), s)?;
            let positions: Vec<i64> = (0..len as i64)
                .map(|i| {
                    let (r, c) = if k >= 0 { (i, i + k) } else { (i - k, i) };
                    r * n as i64 + c
                })
                .collect();
            let idx = index_array(e, &positions)?;
            let filled = e.put_along_axis(&flat, &idx, a, 0, s)?;
            e.reshape(&filled, &[n, n], s)
        }
        2 => diagonal(e, a, k, 0, 1, s),
        _ => Err(EngineError::invalid("diag", "input must be 1- or 2-dimensional")),
    }
}

pub fn trace(
    e: &dyn Engine,
    a: &Array,
    offset: i64,
    axis1: i64,
    axis2: i64,
    dtype: Option<Dtype>,
    s: &Stream,
) -> EngineResult<Array> {
    let d = diagonal(e, a, offset, axis1, axis2, s)?;
    let d = match dtype {
        Some(dt) => e.astype(&d, dt, s)?,
        None => d,
    };
    let last = d.ndim() - 1;
    e.reduce(ReduceOp::Sum, &d, &[last], false, s)
}

fn triangle(e: &dyn Engine, a: &Array, k: i64, lower: bool, s: &Stream) -> EngineResult<Array> {
    if a.ndim() < 2 {
        return Err(EngineError::invalid(
            if lower { "tril" } else { "triu" },
            "array must have at least two dimensions",
        ));
    }
    let n = a.shape()[a.ndim() - 2];
    let m = a.shape()[a.ndim() - 1];
    let mask = if lower {
        tri(e, n, Some(m), k, Dtype::Bool)?
    } else {
        let below = tri(e, n, Some(m), k - 1, Dtype::Bool)?;
        e.unary(crate::engine::UnaryOp::LogicalNot, &below, s)?
    };
    let zero = super::scalar_like(e, 0.0, a)?;
    e.select(&mask, a, &zero, s)
}

pub fn tril(e: &dyn Engine, a: &Array, k: i64, s: &Stream) -> EngineResult<Array> {
    triangle(e, a, k, true, s)
}

pub fn triu(e: &dyn Engine, a: &Array, k: i64, s: &Stream) -> EngineResult<Array> {
    triangle(e, a, k, false, s)
}

// ============================================================================
// Gathers over optional axes
// ============================================================================

/// Gather along `axis`, or from the flattened array when `None`
pub fn take(e: &dyn Engine, a: &Array, indices: &Array, axis: Option<i64>, s: &Stream) -> EngineResult<Array> {
    match axis {
        Some(ax) => {
            let ax = normalize_axis("take", ax, a.ndim())?;
            e.take(a, indices, ax, s)
        }
        None => {
            let flat = flatten(e, a, 0, -1, s)?;
            e.take(&flat, indices, 0, s)
        }
    }
}

pub fn take_along_axis(e: &dyn Engine, a: &Array, indices: &Array, axis: Option<i64>, s: &Stream) -> EngineResult<Array> {
    match axis {
        Some(ax) => {
            let ax = normalize_axis("take_along_axis", ax, a.ndim())?;
            e.take_along_axis(a, indices, ax, s)
        }
        None => {
            let flat = flatten(e, a, 0, -1, s)?;
            let idx = flatten(e, indices, 0, -1, s)?;
            e.take_along_axis(&flat, &idx, 0, s)
        }
    }
}

pub fn put_along_axis(
    e: &dyn Engine,
    a: &Array,
    indices: &Array,
    values: &Array,
    axis: Option<i64>,
    s: &Stream,
) -> EngineResult<Array> {
    match axis {
        Some(ax) => {
            let ax = normalize_axis("put_along_axis", ax, a.ndim())?;
            e.put_along_axis(a, indices, values, ax, s)
        }
        None => {
            let flat = flatten(e, a, 0, -1, s)?;
            let idx = flatten(e, indices, 0, -1, s)?;
            let vals = flatten(e, values, 0, -1, s)?;
            let out = e.put_along_axis(&flat, &idx, &vals, 0, s)?;
            e.reshape(&out, a.shape(), s)
        }
    }
}

/// Python slice semantics for one axis of length `len`.
///
/// Returns `(start, stop, step)` ready for [`Engine::slice`].
pub fn normalize_slice(start: Option<i64>, stop: Option<i64>, step: i64, len: usize) -> EngineResult<(i64, i64, i64)> {
    if step == 0 {
        return Err(EngineError::invalid("slice", "slice step cannot be zero"));
    }
    let n = len as i64;
    let wrap = |i: i64| if i < 0 { i + n } else { i };
    if step > 0 {
        let lo = start.map(wrap).unwrap_or(0).clamp(0, n);
        let hi = stop.map(wrap).unwrap_or(n).clamp(0, n);
        Ok((lo, hi.max(lo), step))
    } else {
        let lo = start.map(wrap).unwrap_or(n - 1).clamp(-1, n - 1);
        let hi = stop.map(wrap).unwrap_or(-1).clamp(-1, n - 1);
        Ok((lo, hi.min(lo), step))
    }
}

// ============================================================================
// Products
// ============================================================================

/// Contract the last `axes_a` of `a` with the matching leading axes of `b`
pub fn tensordot(e: &dyn Engine, a: &Array, b: &Array, axes_a: &[i64], axes_b: &[i64], s: &Stream) -> EngineResult<Array> {
    if axes_a.len() != axes_b.len() {
        return Err(EngineError::invalid("tensordot", "axes lists must have the same length"));
    }
    let ca: Vec<usize> = axes_a
        .iter()
        .map(|&x| normalize_axis("tensordot", x, a.ndim()))
        .collect::<EngineResult<_>>()?;
    let cb: Vec<usize> = axes_b
        .iter()
        .map(|&x| normalize_axis("tensordot", x, b.ndim()))
        .collect::<EngineResult<_>>()?;
    for (&i, &j) in ca.iter().zip(&cb) {
        if a.shape()[i] != b.shape()[j] {
            return Err(EngineError::invalid("tensordot", "contracted dimensions must match"));
        }
    }
    let fa: Vec<usize> = (0..a.ndim()).filter(|i| !ca.contains(i)).collect();
    let fb: Vec<usize> = (0..b.ndim()).filter(|i| !cb.contains(i)).collect();
    let k: usize = ca.iter().map(|&i| a.shape()[i]).product();
    let ma: usize = fa.iter().map(|&i| a.shape()[i]).product();
    let nb: usize = fb.iter().map(|&i| b.shape()[i]).product();

    let pa: Vec<usize> = fa.iter().chain(&ca).copied().collect();
    let pb: Vec<usize> = cb.iter().chain(&fb).copied().collect();
    let at = e.reshape(&e.transpose(a, &pa, s)?, &[ma, k], s)?;
    let bt = e.reshape(&e.transpose(b, &pb, s)?, &[k, nb], s)?;
    let prod = e.matmul(&at, &bt, s)?;
    let out: Vec<usize> = fa
        .iter()
        .map(|&i| a.shape()[i])
        .chain(fb.iter().map(|&i| b.shape()[i]))
        .collect();
    e.reshape(&prod, &out, s)
}

/// `tensordot` over the last `n` axes of `a` and first `n` of `b`
pub fn tensordot_n(e: &dyn Engine, a: &Array, b: &Array, n: usize, s: &Stream) -> EngineResult<Array> {
    if n > a.ndim() || n > b.ndim() {
        return Err(EngineError::invalid("tensordot", "too many axes to contract"));
    }
    let axes_a: Vec<i64> = (a.ndim() - n..a.ndim()).map(|i| i as i64).collect();
    let axes_b: Vec<i64> = (0..n).map(|i| i as i64).collect();
    tensordot(e, a, b, &axes_a, &axes_b, s)
}

pub fn inner(e: &dyn Engine, a: &Array, b: &Array, s: &Stream) -> EngineResult<Array> {
    if a.ndim() == 0 || b.ndim() == 0 {
        return e.binary(BinaryOp::Multiply, a, b, s);
    }
    tensordot(e, a, b, &[-1], &[-1], s)
}

pub fn outer(e: &dyn Engine, a: &Array, b: &Array, s: &Stream) -> EngineResult<Array> {
    let fa = e.reshape(a, &[a.size(), 1], s)?;
    let fb = e.reshape(b, &[b.size()], s)?;
    e.binary(BinaryOp::Multiply, &fa, &fb, s)
}

pub fn kron(e: &dyn Engine, a: &Array, b: &Array, s: &Stream) -> EngineResult<Array> {
    let ndim = a.ndim().max(b.ndim());
    let pad = |shape: &[usize]| {
        let mut out = vec![1usize; ndim - shape.len()];
        out.extend_from_slice(shape);
        out
    };
    let (sa, sb) = (pad(a.shape()), pad(b.shape()));
    let mut ra = Vec::with_capacity(ndim * 2);
    let mut rb = Vec::with_capacity(ndim * 2);
    let mut out = Vec::with_capacity(ndim);
    for i in 0..ndim {
        ra.extend_from_slice(&[sa[i], 1]);
        rb.extend_from_slice(&[1, sb[i]]);
        out.push(sa[i] * sb[i]);
    }
    let prod = e.binary(
        BinaryOp::Multiply,
        &e.reshape(a, &ra, s)?,
        &e.reshape(b, &rb, s)?,
        s,
    )?;
    e.reshape(&prod, &out, s)
}

/// Einstein summation over explicit or implicit output subscripts.
///
/// Repeated subscripts within one operand take the diagonal. Ellipses are
/// not supported.
pub fn einsum(e: &dyn Engine, subscripts: &str, operands: &[Array], s: &Stream) -> EngineResult<Array> {
    let (inputs, output, counts) = parse_einsum("einsum", subscripts, operands.len())?;
    let mut letters = output.clone();
    for (c, _) in &counts {
        if !letters.contains(c) {
            letters.push(*c);
        }
    }

    let mut sizes: Vec<Option<usize>> = vec![None; letters.len()];
    let mut aligned = Vec::with_capacity(operands.len());
    for (subs, op) in inputs.iter().zip(operands) {
        if subs.len() != op.ndim() {
            return Err(EngineError::invalid("einsum", "subscript count does not match operand rank"));
        }
        let mut subs = subs.clone();
        let mut x = op.clone();
        // collapse repeated subscripts onto their diagonal
        while let Some((p, q)) = find_repeat(&subs) {
            x = diagonal(e, &x, 0, p as i64, q as i64, s)?;
            let c = subs[p];
            subs = subs
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != p && *i != q)
                .map(|(_, c)| *c)
                .collect();
            subs.push(c);
        }
        for (i, c) in subs.iter().enumerate() {
            let pos = letters.iter().position(|l| l == c).unwrap_or(0);
            let d = x.shape()[i];
            match sizes[pos] {
                Some(prev) if prev != d && prev != 1 && d != 1 => {
                    return Err(EngineError::invalid(
                        "einsum",
                        format!("size mismatch for subscript '{}'", c),
                    ))
                }
                Some(prev) if prev >= d => {}
                _ => sizes[pos] = Some(d),
            }
        }
        let perm: Vec<usize> = letters
            .iter()
            .filter_map(|l| subs.iter().position(|c| c == l))
            .collect();
        let x = e.transpose(&x, &perm, s)?;
        let full: Vec<usize> = letters
            .iter()
            .map(|l| subs.iter().position(|c| c == l).map(|i| op_dim(&x, &perm, i)).unwrap_or(1))
            .collect();
        aligned.push(e.reshape(&x, &full, s)?);
    }

    let mut acc = aligned[0].clone();
    for x in &aligned[1..] {
        acc = e.binary(BinaryOp::Multiply, &acc, x, s)?;
    }
    let full: Vec<usize> = sizes.iter().map(|d| d.unwrap_or(1)).collect();
    if acc.shape() != full.as_slice() {
        acc = e.broadcast_to(&acc, &full, s)?;
    }
    let contracted: Vec<usize> = (output.len()..letters.len()).collect();
    if contracted.is_empty() {
        Ok(acc)
    } else {
        e.reduce(ReduceOp::Sum, &acc, &contracted, false, s)
    }
}

fn find_repeat(subs: &[char]) -> Option<(usize, usize)> {
    for p in 0..subs.len() {
        for q in p + 1..subs.len() {
            if subs[p] == subs[q] {
                return Some((p, q));
            }
        }
    }
    None
}

// dimension of original axis `i` after permuting by `perm`
fn op_dim(x: &Array, perm: &[usize], i: usize) -> usize {
    perm.iter()
        .position(|&p| p == i)
        .map(|pos| x.shape()[pos])
        .unwrap_or(1)
}

/// Per-operand subscripts, output subscripts and the occurrence count of
/// every input subscript in first-seen order
type EinsumTerms = (Vec<Vec<char>>, Vec<char>, Vec<(char, usize)>);

fn parse_einsum(op: &str, subscripts: &str, operands: usize) -> EngineResult<EinsumTerms> {
    let spec: String = subscripts.chars().filter(|c| !c.is_whitespace()).collect();
    if spec.contains('.') {
        return Err(EngineError::invalid(op, "ellipsis is not supported"));
    }
    let (lhs, rhs) = match spec.split_once("->") {
        Some((l, r)) => (l.to_string(), Some(r.to_string())),
        None => (spec.clone(), None),
    };
    let inputs: Vec<Vec<char>> = lhs.split(',').map(|t| t.chars().collect()).collect();
    if inputs.len() != operands {
        return Err(EngineError::invalid(
            op,
            format!("{} subscripts given for {} operands", inputs.len(), operands),
        ));
    }

    let mut counts: Vec<(char, usize)> = Vec::new();
    for c in inputs.iter().flatten() {
        if !c.is_ascii_alphabetic() {
            return Err(EngineError::invalid(op, format!("invalid subscript '{}'", c)));
        }
        match counts.iter_mut().find(|(x, _)| x == c) {
            Some((_, n)) => *n += 1,
            None => counts.push((*c, 1)),
        }
    }
    let output: Vec<char> = match rhs {
        Some(r) => r.chars().collect(),
        None => {
            let mut once: Vec<char> = counts.iter().filter(|(_, n)| *n == 1).map(|(c, _)| *c).collect();
            once.sort_unstable();
            once
        }
    };
    for c in &output {
        if !counts.iter().any(|(x, _)| x == c) {
            return Err(EngineError::invalid(op, format!("output subscript '{}' not in inputs", c)));
        }
    }
    Ok((inputs, output, counts))
}

/// Greedy pairwise contraction order for [`einsum`] and a printable summary.
///
/// Each step names two positions in the current operand list; the pair is
/// removed and its intermediate appended at the end. The cheapest pair by
/// multiply count goes first, earliest pair on ties.
pub fn einsum_path(subscripts: &str, operands: &[Array]) -> EngineResult<(Vec<Vec<usize>>, String)> {
    let (inputs, output, counts) = parse_einsum("einsum_path", subscripts, operands.len())?;
    let mut sizes: Vec<(char, usize)> = counts.iter().map(|(c, _)| (*c, 1)).collect();
    for (subs, x) in inputs.iter().zip(operands) {
        if subs.len() != x.ndim() {
            return Err(EngineError::invalid("einsum_path", "subscript count does not match operand rank"));
        }
        for (c, &d) in subs.iter().zip(x.shape()) {
            if let Some((_, size)) = sizes.iter_mut().find(|(x, _)| x == c) {
                *size = (*size).max(d);
            }
        }
    }
    let size_of = |c: &char| sizes.iter().find(|(x, _)| x == c).map_or(1, |(_, d)| *d);
    let cost = |letters: &[char]| letters.iter().map(size_of).product::<usize>();

    let mut all: Vec<char> = Vec::new();
    for c in inputs.iter().flatten() {
        if !all.contains(c) {
            all.push(*c);
        }
    }
    let naive_flops = cost(&all) * operands.len().saturating_sub(1).max(1);

    let mut terms = inputs.clone();
    let mut path = Vec::new();
    let mut steps = Vec::new();
    let mut optimized_flops = 0;
    if terms.len() == 1 {
        path.push(vec![0]);
        steps.push((all.len(), format!("{}->{}", chars(&terms[0]), chars(&output))));
        optimized_flops = cost(&all);
    }
    while terms.len() > 1 {
        let mut best: Option<(usize, usize, usize, Vec<char>, Vec<char>)> = None;
        for i in 0..terms.len() {
            for j in i + 1..terms.len() {
                let mut union: Vec<char> = Vec::new();
                for c in terms[i].iter().chain(&terms[j]) {
                    if !union.contains(c) {
                        union.push(*c);
                    }
                }
                let kept: Vec<char> = union
                    .iter()
                    .filter(|c| {
                        output.contains(c)
                            || terms.iter().enumerate().any(|(k, t)| k != i && k != j && t.contains(c))
                    })
                    .copied()
                    .collect();
                let flops = cost(&union);
                if best.as_ref().map_or(true, |b| flops < b.2) {
                    best = Some((i, j, flops, union, kept));
                }
            }
        }
        let Some((i, j, flops, union, kept)) = best else { break };
        optimized_flops += flops;
        let current = format!("{},{}->{}", chars(&terms[i]), chars(&terms[j]), chars(&kept));
        terms.remove(j);
        terms.remove(i);
        terms.push(kept);
        path.push(vec![i, j]);
        steps.push((union.len(), current));
    }
    let rule = "-".repeat(50);
    let mut summary = String::new();
    let complete = inputs.iter().map(|t| chars(t)).collect::<Vec<_>>().join(",");
    summary.push_str(&format!("  Complete contraction:  {}->{}\n", complete, chars(&output)));
    summary.push_str(&format!("         Naive scaling:  {}\n", all.len()));
    summary.push_str(&format!("     Optimized scaling:  {}\n", steps.iter().map(|(n, _)| *n).max().unwrap_or(0)));
    summary.push_str(&format!("      Naive FLOP count:  {:.3e}\n", naive_flops as f64));
    summary.push_str(&format!("  Optimized FLOP count:  {:.3e}\n", optimized_flops as f64));
    summary.push_str(&format!("{}\nscaling   current\n{}\n", rule, rule));
    for (scaling, current) in &steps {
        summary.push_str(&format!("{:>5}     {}\n", scaling, current));
    }
    Ok((path, summary))
}

fn chars(letters: &[char]) -> String {
    letters.iter().collect()
}
