//! Reductions, scans and sorting along axes.

use std::cmp::Ordering;

use mlx_engine::{ArgReduceOp, Dtype, EngineError, EngineResult, ReduceOp, ScanOp};

use crate::tensor::{lanes, strides, unravel, Data, Tensor, C64};

fn check_axis(op: &str, axis: usize, ndim: usize) -> EngineResult<()> {
    if axis >= ndim {
        return Err(EngineError::invalid(
            op,
            format!("axis {} is out of bounds for array of dimension {}", axis, ndim),
        ));
    }
    Ok(())
}

fn accumulate_dtype(op: ReduceOp, dt: Dtype) -> Dtype {
    match op {
        ReduceOp::All | ReduceOp::Any => Dtype::Bool,
        ReduceOp::Sum | ReduceOp::Prod if dt.is_bool() => Dtype::Int32,
        _ => dt,
    }
}

// ============================================================================
// Reduce
// ============================================================================

pub fn reduce(op: ReduceOp, a: &Tensor, axes: &[usize], keepdims: bool) -> EngineResult<Tensor> {
    for &ax in axes {
        check_axis(op.name(), ax, a.ndim())?;
    }
    let kept: Vec<usize> = a
        .shape
        .iter()
        .enumerate()
        .map(|(i, &d)| if axes.contains(&i) { 1 } else { d })
        .collect();
    let out_size: usize = kept.iter().product();
    let kept_strides = strides(&kept);
    let out_shape: Vec<usize> = if keepdims {
        kept.clone()
    } else {
        a.shape
            .iter()
            .enumerate()
            .filter(|(i, _)| !axes.contains(i))
            .map(|(_, &d)| d)
            .collect()
    };
    let out_dtype = accumulate_dtype(op, a.dtype);

    // flat output position of every input element
    let mut index = vec![0usize; a.ndim()];
    let mut target = Vec::with_capacity(a.size());
    for flat in 0..a.size() {
        unravel(flat, &a.shape, &mut index);
        let pos: usize = index
            .iter()
            .enumerate()
            .map(|(d, &i)| if axes.contains(&d) { 0 } else { i * kept_strides[d] })
            .sum();
        target.push(pos);
    }

    if let Data::Complex(values) = &a.data {
        let init = match op {
            ReduceOp::Sum => C64::new(0.0, 0.0),
            ReduceOp::Prod => C64::new(1.0, 0.0),
            _ => return Err(EngineError::dtype(op.name(), a.dtype)),
        };
        let mut acc = vec![init; out_size];
        for (v, &t) in values.iter().zip(&target) {
            acc[t] = if op == ReduceOp::Sum { acc[t] + v } else { acc[t] * v };
        }
        return Ok(Tensor::complex(out_shape, acc));
    }

    let init = match op {
        ReduceOp::Sum | ReduceOp::Any => 0.0,
        ReduceOp::Prod | ReduceOp::All => 1.0,
        ReduceOp::Max => f64::NEG_INFINITY,
        ReduceOp::Min => f64::INFINITY,
    };
    let mut acc = vec![init; out_size];
    for (&v, &t) in a.values().iter().zip(&target) {
        acc[t] = match op {
            ReduceOp::Sum => acc[t] + v,
            ReduceOp::Prod => acc[t] * v,
            ReduceOp::Max if v.is_nan() || acc[t].is_nan() => f64::NAN,
            ReduceOp::Max => acc[t].max(v),
            ReduceOp::Min if v.is_nan() || acc[t].is_nan() => f64::NAN,
            ReduceOp::Min => acc[t].min(v),
            ReduceOp::All => f64::from(u8::from(acc[t] != 0.0 && v != 0.0)),
            ReduceOp::Any => f64::from(u8::from(acc[t] != 0.0 || v != 0.0)),
        };
    }
    Ok(Tensor::real(out_shape, out_dtype, acc))
}

// ============================================================================
// Arg reductions
// ============================================================================

pub fn arg_reduce(op: ArgReduceOp, a: &Tensor, axis: usize, keepdims: bool) -> EngineResult<Tensor> {
    let name = match op {
        ArgReduceOp::ArgMin => "argmin",
        ArgReduceOp::ArgMax => "argmax",
    };
    check_axis(name, axis, a.ndim())?;
    if a.shape[axis] == 0 {
        return Err(EngineError::invalid(name, "cannot reduce an empty axis"));
    }
    if a.is_complex() {
        return Err(EngineError::dtype(name, a.dtype));
    }
    let values = a.values();
    let stride = strides(&a.shape)[axis];
    let len = a.shape[axis];
    let mut out = Vec::new();
    for base in lanes(&a.shape, axis) {
        let mut best = 0usize;
        for k in 1..len {
            let (cur, cand) = (values[base + best * stride], values[base + k * stride]);
            let better = match op {
                ArgReduceOp::ArgMax => cand > cur || (cand.is_nan() && !cur.is_nan()),
                ArgReduceOp::ArgMin => cand < cur || (cand.is_nan() && !cur.is_nan()),
            };
            if better {
                best = k;
            }
        }
        out.push(best as f64);
    }
    let mut shape = a.shape.clone();
    if keepdims {
        shape[axis] = 1;
    } else {
        shape.remove(axis);
    }
    Ok(Tensor::real(shape, Dtype::Uint32, out))
}

// ============================================================================
// Scans
// ============================================================================

pub fn scan(op: ScanOp, a: &Tensor, axis: usize, reverse: bool, inclusive: bool) -> EngineResult<Tensor> {
    let name = match op {
        ScanOp::Sum => "cumsum",
        ScanOp::Prod => "cumprod",
        ScanOp::Max => "cummax",
        ScanOp::Min => "cummin",
        ScanOp::LogAddExp => "logcumsumexp",
    };
    check_axis(name, axis, a.ndim())?;
    if a.is_complex() {
        return Err(EngineError::dtype(name, a.dtype));
    }
    let out_dtype = match op {
        ScanOp::Sum | ScanOp::Prod if a.dtype.is_bool() => Dtype::Int32,
        ScanOp::LogAddExp => mlx_engine::ops::float_dtype(a.dtype),
        _ => a.dtype,
    };
    let init = match op {
        ScanOp::Sum => 0.0,
        ScanOp::Prod => 1.0,
        ScanOp::Max | ScanOp::LogAddExp => f64::NEG_INFINITY,
        ScanOp::Min => f64::INFINITY,
    };
    let combine = |acc: f64, v: f64| match op {
        ScanOp::Sum => acc + v,
        ScanOp::Prod => acc * v,
        ScanOp::Max => acc.max(v),
        ScanOp::Min => acc.min(v),
        ScanOp::LogAddExp => {
            let m = acc.max(v);
            if m == f64::NEG_INFINITY {
                m
            } else {
                m + ((acc - m).exp() + (v - m).exp()).ln()
            }
        }
    };
    let values = a.values();
    let mut out = vec![0.0; values.len()];
    let stride = strides(&a.shape)[axis];
    let len = a.shape[axis];
    for base in lanes(&a.shape, axis) {
        let mut acc = init;
        for step in 0..len {
            let k = if reverse { len - 1 - step } else { step };
            let pos = base + k * stride;
            if inclusive {
                acc = combine(acc, values[pos]);
                out[pos] = acc;
            } else {
                out[pos] = acc;
                acc = combine(acc, values[pos]);
            }
        }
    }
    Ok(Tensor::real(a.shape.clone(), out_dtype, out))
}

// ============================================================================
// Sorting
// ============================================================================

// NaNs sort last
fn total(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Stable sort of every lane; returns the sorted tensor or the permutation
pub fn sort(a: &Tensor, axis: usize, indices: bool) -> EngineResult<Tensor> {
    let name = if indices { "argsort" } else { "sort" };
    check_axis(name, axis, a.ndim())?;
    if a.is_complex() {
        return Err(EngineError::dtype(name, a.dtype));
    }
    let values = a.values();
    let stride = strides(&a.shape)[axis];
    let len = a.shape[axis];
    let mut out = vec![0.0; values.len()];
    for base in lanes(&a.shape, axis) {
        let mut order: Vec<usize> = (0..len).collect();
        order.sort_by(|&i, &j| total(values[base + i * stride], values[base + j * stride]));
        for (k, &src) in order.iter().enumerate() {
            out[base + k * stride] = if indices { src as f64 } else { values[base + src * stride] };
        }
    }
    let dtype = if indices { Dtype::Uint32 } else { a.dtype };
    Ok(Tensor::real(a.shape.clone(), dtype, out))
}

/// A full sort satisfies the partition contract for every `kth`
pub fn partition(a: &Tensor, kth: usize, axis: usize, indices: bool) -> EngineResult<Tensor> {
    let name = if indices { "argpartition" } else { "partition" };
    check_axis(name, axis, a.ndim())?;
    if kth >= a.shape[axis].max(1) {
        return Err(EngineError::invalid(
            name,
            format!("kth {} is out of bounds for axis of size {}", kth, a.shape[axis]),
        ));
    }
    sort(a, axis, indices)
}
