//! Array creation.

use crate::array::{Array, HostBuffer};
use crate::device::Stream;
use crate::dtype::Dtype;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

use super::scalar;

/// Array of `shape` filled with `value` (broadcast), cast to `dtype` when given
pub fn full(
    e: &dyn Engine,
    shape: &[usize],
    value: &Array,
    dtype: Option<Dtype>,
    s: &Stream,
) -> EngineResult<Array> {
    let value = match dtype {
        Some(dt) if dt != value.dtype() => e.astype(value, dt, s)?,
        _ => value.clone(),
    };
    e.broadcast_to(&value, shape, s)
}

pub fn zeros(e: &dyn Engine, shape: &[usize], dtype: Dtype, s: &Stream) -> EngineResult<Array> {
    full(e, shape, &scalar(e, 0.0, dtype)?, None, s)
}

pub fn ones(e: &dyn Engine, shape: &[usize], dtype: Dtype, s: &Stream) -> EngineResult<Array> {
    full(e, shape, &scalar(e, 1.0, dtype)?, None, s)
}

pub fn zeros_like(e: &dyn Engine, a: &Array, dtype: Option<Dtype>, s: &Stream) -> EngineResult<Array> {
    zeros(e, a.shape(), dtype.unwrap_or_else(|| a.dtype()), s)
}

pub fn ones_like(e: &dyn Engine, a: &Array, dtype: Option<Dtype>, s: &Stream) -> EngineResult<Array> {
    ones(e, a.shape(), dtype.unwrap_or_else(|| a.dtype()), s)
}

/// Evenly spaced values in `[start, stop)`
pub fn arange(e: &dyn Engine, start: f64, stop: f64, step: f64, dtype: Dtype) -> EngineResult<Array> {
    if step == 0.0 {
        return Err(EngineError::invalid("arange", "step must be non-zero"));
    }
    if !start.is_finite() || !stop.is_finite() || !step.is_finite() {
        return Err(EngineError::invalid("arange", "cannot compute length of an infinite range"));
    }
    let len = ((stop - start) / step).ceil().max(0.0) as usize;
    let values: Vec<f64> = (0..len).map(|i| start + step * i as f64).collect();
    e.from_buffer(HostBuffer::Float64(values), &[len], dtype)
}

/// `num` evenly spaced values over `[start, stop]`
pub fn linspace(e: &dyn Engine, start: f64, stop: f64, num: usize, dtype: Dtype) -> EngineResult<Array> {
    let values: Vec<f64> = match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            (0..num).map(|i| start + step * i as f64).collect()
        }
    };
    e.from_buffer(HostBuffer::Float64(values), &[num], dtype)
}

/// Ones on the `k`-th diagonal of an `n x m` matrix
pub fn eye(e: &dyn Engine, n: usize, m: Option<usize>, k: i64, dtype: Dtype) -> EngineResult<Array> {
    let m = m.unwrap_or(n);
    let mut values = vec![0.0; n * m];
    for i in 0..n {
        let j = i as i64 + k;
        if j >= 0 && (j as usize) < m {
            values[i * m + j as usize] = 1.0;
        }
    }
    e.from_buffer(HostBuffer::Float64(values), &[n, m], dtype)
}

pub fn identity(e: &dyn Engine, n: usize, dtype: Dtype) -> EngineResult<Array> {
    eye(e, n, None, 0, dtype)
}

/// Ones at and below the `k`-th diagonal
pub fn tri(e: &dyn Engine, n: usize, m: Option<usize>, k: i64, dtype: Dtype) -> EngineResult<Array> {
    let m = m.unwrap_or(n);
    let mut values = vec![0.0; n * m];
    for i in 0..n {
        for j in 0..m {
            if (j as i64) <= i as i64 + k {
                values[i * m + j] = 1.0;
            }
        }
    }
    e.from_buffer(HostBuffer::Float64(values), &[n, m], dtype)
}

/// Coordinate grids from 1-d coordinate vectors.
///
/// `indexing` is `"xy"` (cartesian, the first two axes swapped) or `"ij"`.
pub fn meshgrid(
    e: &dyn Engine,
    arrays: &[Array],
    sparse: bool,
    indexing: &str,
    s: &Stream,
) -> EngineResult<Vec<Array>> {
    if indexing != "xy" && indexing != "ij" {
        return Err(EngineError::invalid(
            "meshgrid",
            format!("invalid indexing value '{}'", indexing),
        ));
    }
    let ndim = arrays.len();
    let mut lengths: Vec<usize> = arrays.iter().map(|a| a.size()).collect();
    let swap = indexing == "xy" && ndim > 1;
    if swap {
        lengths.swap(0, 1);
    }

    let mut outputs = Vec::with_capacity(ndim);
    for (i, a) in arrays.iter().enumerate() {
        let mut pos = i;
        if swap && i < 2 {
            pos = 1 - i;
        }
        let mut shape = vec![1; ndim];
        shape[pos] = a.size();
        let reshaped = e.reshape(a, &shape, s)?;
        if sparse {
            outputs.push(reshaped);
        } else {
            outputs.push(e.broadcast_to(&reshaped, &lengths, s)?);
        }
    }
    Ok(outputs)
}
