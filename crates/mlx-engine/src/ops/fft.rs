//! Fourier transform front ends.
//!
//! Resolve the optional length and axis arguments of the 1-d, 2-d and n-d
//! entry points into the single [`Engine::fft`] primitive.

use crate::array::Array;
use crate::device::Stream;
use crate::engine::{Engine, FftOp};
use crate::error::{EngineError, EngineResult};

use super::normalize_axis;
use super::shape::roll;

/// Transform along the given axes with optional output lengths.
///
/// When `n` is absent the input length is used, except for the last axis of
/// an inverse real transform where it is `2 * (len - 1)`. When `axes` is
/// absent it defaults to the last `n.len()` axes, or to every axis.
pub fn fftn(
    e: &dyn Engine,
    a: &Array,
    n: Option<&[usize]>,
    axes: Option<&[i64]>,
    op: FftOp,
    s: &Stream,
) -> EngineResult<Array> {
    let ndim = a.ndim();
    let axes: Vec<i64> = match (axes, n) {
        (Some(axes), _) => axes.to_vec(),
        (None, Some(n)) => (ndim as i64 - n.len() as i64..ndim as i64).collect(),
        (None, None) => (0..ndim as i64).collect(),
    };
    if axes.is_empty() {
        return Ok(a.clone());
    }
    let resolved: Vec<usize> = axes
        .iter()
        .map(|&ax| normalize_axis("fft", ax, ndim))
        .collect::<EngineResult<_>>()?;
    let mut seen = resolved.clone();
    seen.sort_unstable();
    seen.dedup();
    if seen.len() != resolved.len() {
        return Err(EngineError::invalid("fft", "duplicate axes"));
    }
    let lengths: Vec<usize> = match n {
        Some(n) => {
            if n.len() != resolved.len() {
                return Err(EngineError::invalid("fft", "shape and axes must have the same length"));
            }
            if n.contains(&0) {
                return Err(EngineError::invalid("fft", "invalid number of data points 0"));
            }
            n.to_vec()
        }
        None => resolved
            .iter()
            .enumerate()
            .map(|(i, &ax)| {
                let len = a.shape()[ax];
                if op.real && op.inverse && i == resolved.len() - 1 {
                    2 * len.saturating_sub(1)
                } else {
                    len
                }
            })
            .collect(),
    };
    e.fft(a, &lengths, &resolved, op, s)
}

/// One-dimensional transform along `axis`
pub fn fft1(e: &dyn Engine, a: &Array, n: Option<usize>, axis: i64, op: FftOp, s: &Stream) -> EngineResult<Array> {
    let n = n.map(|n| vec![n]);
    fftn(e, a, n.as_deref(), Some(&[axis]), op, s)
}

fn shift(e: &dyn Engine, a: &Array, axes: Option<&[i64]>, inverse: bool, s: &Stream) -> EngineResult<Array> {
    let axes: Vec<i64> = match axes {
        Some(axes) => axes.to_vec(),
        None => (0..a.ndim() as i64).collect(),
    };
    let shifts: Vec<i64> = axes
        .iter()
        .map(|&ax| {
            let n = a.shape()[normalize_axis("fftshift", ax, a.ndim())?] as i64;
            Ok(if inverse { -(n / 2) } else { n / 2 })
        })
        .collect::<EngineResult<_>>()?;
    if axes.is_empty() {
        return Ok(a.clone());
    }
    roll(e, a, &shifts, Some(&axes), s)
}

/// Move the zero-frequency term to the center
pub fn fftshift(e: &dyn Engine, a: &Array, axes: Option<&[i64]>, s: &Stream) -> EngineResult<Array> {
    shift(e, a, axes, false, s)
}

pub fn ifftshift(e: &dyn Engine, a: &Array, axes: Option<&[i64]>, s: &Stream) -> EngineResult<Array> {
    shift(e, a, axes, true, s)
}
