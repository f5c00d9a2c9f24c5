//! Composite Operations
//!
//! Operations expressed purely in terms of [`Engine`](crate::Engine)
//! primitives. Any engine implementation gets them for free, and because
//! they only call primitives, tracing and export see through them.
//!
//! ## Module Structure
//!
//! - [`creation`]: constant-filled arrays, ranges, identity matrices
//! - [`shape`]: axis manipulation, stacking, splitting, tiling, einsum
//! - [`math`]: derived elementwise math and reductions
//! - [`linalg`]: matmul variants, norms, quantized products
//! - [`fast`]: normalization layers, rotary embeddings, attention
//! - [`fft`]: argument normalization for the transform family, shifts
//! - [`conv`]: 1/2/3-d and transposed convolution front ends
//! - [`random`]: distributions built on uniform and normal samples

pub mod conv;
pub mod creation;
pub mod fast;
pub mod fft;
pub mod linalg;
pub mod math;
pub mod random;
pub mod shape;

use crate::array::{Array, HostBuffer};
use crate::dtype::Dtype;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

/// Wrap a possibly negative axis into `0..ndim`
pub fn normalize_axis(op: &str, axis: i64, ndim: usize) -> EngineResult<usize> {
    let n = ndim as i64;
    let wrapped = if axis < 0 { axis + n } else { axis };
    if wrapped < 0 || wrapped >= n {
        return Err(EngineError::invalid(
            op,
            format!("axis {} is out of bounds for array of dimension {}", axis, ndim),
        ));
    }
    Ok(wrapped as usize)
}

/// Wrap and deduplicate a list of axes, keeping ascending order
pub fn normalize_axes(op: &str, axes: &[i64], ndim: usize) -> EngineResult<Vec<usize>> {
    let mut out = Vec::with_capacity(axes.len());
    for &axis in axes {
        let ax = normalize_axis(op, axis, ndim)?;
        if out.contains(&ax) {
            return Err(EngineError::invalid(op, format!("duplicate axis {}", axis)));
        }
        out.push(ax);
    }
    out.sort_unstable();
    Ok(out)
}

/// `None` means every axis
pub fn resolve_axes(op: &str, axes: Option<&[i64]>, ndim: usize) -> EngineResult<Vec<usize>> {
    match axes {
        Some(axes) => normalize_axes(op, axes, ndim),
        None => Ok((0..ndim).collect()),
    }
}

/// Numpy-style broadcast of two shapes
pub fn broadcast_shapes(op: &str, a: &[usize], b: &[usize]) -> EngineResult<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut out = vec![0; ndim];
    for i in 0..ndim {
        let da = if i + a.len() >= ndim { a[i + a.len() - ndim] } else { 1 };
        let db = if i + b.len() >= ndim { b[i + b.len() - ndim] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return Err(EngineError::broadcast(op, a, b)),
        };
    }
    Ok(out)
}

/// Rank-0 array holding `value`
pub fn scalar(e: &dyn Engine, value: f64, dtype: Dtype) -> EngineResult<Array> {
    e.from_buffer(HostBuffer::Float64(vec![value]), &[], dtype)
}

/// Rank-0 array with `value` in the dtype of `like`
pub fn scalar_like(e: &dyn Engine, value: f64, like: &Array) -> EngineResult<Array> {
    scalar(e, value, like.dtype())
}

/// Dtype used for arithmetic on `a`: inexact dtypes are kept, others become float32
pub fn float_dtype(dtype: Dtype) -> Dtype {
    if dtype.is_inexact() {
        dtype
    } else {
        Dtype::Float32
    }
}

/// Int32 index vector
pub fn index_array(e: &dyn Engine, indices: &[i64]) -> EngineResult<Array> {
    e.from_buffer(HostBuffer::Int(indices.to_vec()), &[indices.len()], Dtype::Int32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_axis() {
        assert_eq!(normalize_axis("sum", -1, 3).unwrap(), 2);
        assert_eq!(normalize_axis("sum", 0, 3).unwrap(), 0);
        assert!(normalize_axis("sum", 3, 3).is_err());
        assert!(normalize_axis("sum", -4, 3).is_err());
    }

    #[test]
    fn test_normalize_axes() {
        assert_eq!(normalize_axes("sum", &[-1, 0], 3).unwrap(), vec![0, 2]);
        assert!(normalize_axes("sum", &[1, -2], 3).is_err());
    }

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes("add", &[2, 1], &[3]).unwrap(), vec![2, 3]);
        assert_eq!(broadcast_shapes("add", &[], &[4, 5]).unwrap(), vec![4, 5]);
        assert!(broadcast_shapes("add", &[2, 3], &[4]).is_err());
    }
}
