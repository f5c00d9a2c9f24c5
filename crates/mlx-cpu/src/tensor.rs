//! Tensor Storage
//!
//! A [`Tensor`] is a dense, row-major block of values with a shape and a
//! dtype. Every value is stored widened: `f64` for real dtypes and
//! `Complex<f64>` for complex64. After every construction the values are
//! normalized to what the dtype can actually represent (integer
//! wrap-around, single and half precision rounding, booleans as 0/1), so
//! the widened storage never carries precision the dtype does not have.
//!
//! ## Byte codec
//!
//! [`to_bytes`] and [`from_bytes`] encode values in the little-endian
//! machine layout of each dtype. Views and every file format go through
//! them, and serde writes tensors as a hex string of those bytes so that
//! non-finite values survive JSON.

use std::borrow::Cow;

use half::{bf16, f16};
use mlx_engine::{Dtype, EngineError, EngineResult};
use num_complex::Complex;
use serde::{Deserialize, Serialize};

pub type C64 = Complex<f64>;

// ============================================================================
// Tensor
// ============================================================================

/// Element storage
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Real(Vec<f64>),
    Complex(Vec<C64>),
}

/// Dense row-major values of one dtype
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorRepr", into = "TensorRepr")]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
    pub data: Data,
}

impl Tensor {
    /// Build a tensor, converting and normalizing `data` to `dtype`
    pub fn new(shape: Vec<usize>, dtype: Dtype, data: Data) -> Tensor {
        let data = match (dtype.is_complex(), data) {
            (true, Data::Real(v)) => Data::Complex(v.into_iter().map(|x| round_complex(C64::new(x, 0.0))).collect()),
            (true, Data::Complex(v)) => Data::Complex(v.into_iter().map(round_complex).collect()),
            (false, Data::Real(v)) => Data::Real(v.into_iter().map(|x| normalize(dtype, x)).collect()),
            (false, Data::Complex(v)) => Data::Real(v.into_iter().map(|c| normalize(dtype, c.re)).collect()),
        };
        Tensor { shape, dtype, data }
    }

    pub fn real(shape: Vec<usize>, dtype: Dtype, values: Vec<f64>) -> Tensor {
        Tensor::new(shape, dtype, Data::Real(values))
    }

    pub fn complex(shape: Vec<usize>, values: Vec<C64>) -> Tensor {
        Tensor::new(shape, Dtype::Complex64, Data::Complex(values))
    }

    pub fn scalar(value: f64, dtype: Dtype) -> Tensor {
        Tensor::real(Vec::new(), dtype, vec![value])
    }

    pub fn zeros(shape: Vec<usize>, dtype: Dtype) -> Tensor {
        let n = shape.iter().product();
        Tensor::real(shape, dtype, vec![0.0; n])
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    pub fn nbytes(&self) -> usize {
        self.size() * self.dtype.size()
    }

    pub fn is_complex(&self) -> bool {
        matches!(self.data, Data::Complex(_))
    }

    /// Real values; complex tensors yield their real parts
    pub fn values(&self) -> Cow<'_, [f64]> {
        match &self.data {
            Data::Real(v) => Cow::Borrowed(v),
            Data::Complex(v) => Cow::Owned(v.iter().map(|c| c.re).collect()),
        }
    }

    /// Complex values; real tensors yield a zero imaginary part
    pub fn complex_values(&self) -> Cow<'_, [C64]> {
        match &self.data {
            Data::Complex(v) => Cow::Borrowed(v),
            Data::Real(v) => Cow::Owned(v.iter().map(|&x| C64::new(x, 0.0)).collect()),
        }
    }

    pub fn astype(&self, dtype: Dtype) -> Tensor {
        if dtype == self.dtype {
            return self.clone();
        }
        Tensor::new(self.shape.clone(), dtype, self.data.clone())
    }

    pub fn with_shape(&self, shape: Vec<usize>) -> Tensor {
        Tensor {
            shape,
            dtype: self.dtype,
            data: self.data.clone(),
        }
    }

    /// Gather elements by flat source index into a new tensor of `shape`
    pub fn gather(&self, shape: Vec<usize>, index: &[usize]) -> Tensor {
        let data = match &self.data {
            Data::Real(v) => Data::Real(index.iter().map(|&i| v[i]).collect()),
            Data::Complex(v) => Data::Complex(index.iter().map(|&i| v[i]).collect()),
        };
        Tensor {
            shape,
            dtype: self.dtype,
            data,
        }
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// Round `value` to what `dtype` can hold
pub fn normalize(dtype: Dtype, value: f64) -> f64 {
    match dtype {
        Dtype::Bool => {
            if value != 0.0 {
                1.0
            } else {
                0.0
            }
        }
        Dtype::Float64 => value,
        Dtype::Float32 | Dtype::Complex64 => value as f32 as f64,
        Dtype::Float16 => f16::from_f64(value).to_f64(),
        Dtype::Bfloat16 => bf16::from_f64(value).to_f64(),
        _ => wrap_int(dtype, value),
    }
}

fn wrap_int(dtype: Dtype, value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    let t = value.trunc();
    match dtype {
        Dtype::Int64 => t as i64 as f64,
        Dtype::Uint64 if t < 0.0 => t as i64 as u64 as f64,
        Dtype::Uint64 => t as u64 as f64,
        Dtype::Int32 => t as i64 as i32 as f64,
        Dtype::Int16 => t as i64 as i16 as f64,
        Dtype::Int8 => t as i64 as i8 as f64,
        Dtype::Uint32 => t as i64 as u32 as f64,
        Dtype::Uint16 => t as i64 as u16 as f64,
        Dtype::Uint8 => t as i64 as u8 as f64,
        _ => t,
    }
}

fn round_complex(c: C64) -> C64 {
    C64::new(c.re as f32 as f64, c.im as f32 as f64)
}

// ============================================================================
// Index arithmetic
// ============================================================================

/// Row-major strides in elements
pub fn strides(shape: &[usize]) -> Vec<usize> {
    let mut out = vec![1; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        out[i] = out[i + 1] * shape[i + 1];
    }
    out
}

/// Multi-index of a flat position
pub fn unravel(mut flat: usize, shape: &[usize], out: &mut [usize]) {
    for d in (0..shape.len()).rev() {
        let n = shape[d].max(1);
        out[d] = flat % n;
        flat /= n;
    }
}

/// Advance a multi-index in row-major order; false once it wraps around
pub fn increment(index: &mut [usize], shape: &[usize]) -> bool {
    for d in (0..shape.len()).rev() {
        index[d] += 1;
        if index[d] < shape[d] {
            return true;
        }
        index[d] = 0;
    }
    false
}

/// For each flat position of `out_shape`, the flat position in `in_shape`
/// it reads from under numpy broadcasting
pub fn broadcast_map(op: &str, in_shape: &[usize], out_shape: &[usize]) -> EngineResult<Vec<usize>> {
    if in_shape.len() > out_shape.len() {
        return Err(EngineError::broadcast(op, in_shape, out_shape));
    }
    let offset = out_shape.len() - in_shape.len();
    let in_strides = strides(in_shape);
    let mut eff = vec![0usize; out_shape.len()];
    for (i, &d) in in_shape.iter().enumerate() {
        let o = out_shape[i + offset];
        if d == o {
            eff[i + offset] = in_strides[i];
        } else if d != 1 {
            return Err(EngineError::broadcast(op, in_shape, out_shape));
        }
    }
    let size: usize = out_shape.iter().product();
    let mut out = Vec::with_capacity(size);
    if size == 0 {
        return Ok(out);
    }
    let mut index = vec![0usize; out_shape.len()];
    let mut pos = 0usize;
    loop {
        out.push(pos);
        // carry through the multi-index, adjusting the source position
        let mut d = out_shape.len();
        loop {
            if d == 0 {
                return Ok(out);
            }
            d -= 1;
            index[d] += 1;
            pos += eff[d];
            if index[d] < out_shape[d] {
                break;
            }
            pos -= eff[d] * index[d];
            index[d] = 0;
        }
    }
}

/// Flat start of every lane along `axis`; lane elements are
/// `strides(shape)[axis]` apart
pub fn lanes(shape: &[usize], axis: usize) -> Vec<usize> {
    let st = strides(shape);
    let len = shape[axis];
    let size: usize = shape.iter().product();
    if len == 0 || size == 0 {
        return Vec::new();
    }
    let outer: usize = shape[..axis].iter().product();
    let inner = st[axis];
    let mut bases = Vec::with_capacity(size / len);
    for o in 0..outer {
        for i in 0..inner {
            bases.push(o * len * inner + i);
        }
    }
    bases
}

// ============================================================================
// Byte codec
// ============================================================================

/// Little-endian machine bytes of every element
pub fn to_bytes(t: &Tensor) -> Vec<u8> {
    let mut out = Vec::with_capacity(t.nbytes());
    match &t.data {
        Data::Complex(v) => {
            for c in v {
                out.extend_from_slice(&(c.re as f32).to_le_bytes());
                out.extend_from_slice(&(c.im as f32).to_le_bytes());
            }
        }
        Data::Real(v) => {
            for &x in v {
                match t.dtype {
                    Dtype::Bool => out.push(u8::from(x != 0.0)),
                    Dtype::Uint8 => out.push(x as u8),
                    Dtype::Int8 => out.push(x as i8 as u8),
                    Dtype::Uint16 => out.extend_from_slice(&(x as u16).to_le_bytes()),
                    Dtype::Int16 => out.extend_from_slice(&(x as i16).to_le_bytes()),
                    Dtype::Uint32 => out.extend_from_slice(&(x as u32).to_le_bytes()),
                    Dtype::Int32 => out.extend_from_slice(&(x as i32).to_le_bytes()),
                    Dtype::Uint64 => out.extend_from_slice(&(x as u64).to_le_bytes()),
                    Dtype::Int64 => out.extend_from_slice(&(x as i64).to_le_bytes()),
                    Dtype::Float16 => out.extend_from_slice(&f16::from_f64(x).to_le_bytes()),
                    Dtype::Bfloat16 => out.extend_from_slice(&bf16::from_f64(x).to_le_bytes()),
                    Dtype::Float32 | Dtype::Complex64 => out.extend_from_slice(&(x as f32).to_le_bytes()),
                    Dtype::Float64 => out.extend_from_slice(&x.to_le_bytes()),
                }
            }
        }
    }
    out
}

/// Decode little-endian machine bytes
pub fn from_bytes(op: &str, bytes: &[u8], shape: Vec<usize>, dtype: Dtype) -> EngineResult<Tensor> {
    let size: usize = shape.iter().product();
    let width = dtype.size();
    if bytes.len() != size * width {
        return Err(EngineError::invalid(
            op,
            format!("expected {} bytes for {} elements of {}, got {}", size * width, size, dtype, bytes.len()),
        ));
    }
    if dtype.is_complex() {
        let values = bytes
            .chunks_exact(8)
            .map(|c| C64::new(f32::from_le_bytes([c[0], c[1], c[2], c[3]]) as f64, f32::from_le_bytes([c[4], c[5], c[6], c[7]]) as f64))
            .collect();
        return Ok(Tensor::complex(shape, values));
    }
    let values = bytes
        .chunks_exact(width)
        .map(|c| decode_one(dtype, c))
        .collect();
    Ok(Tensor::real(shape, dtype, values))
}

fn decode_one(dtype: Dtype, c: &[u8]) -> f64 {
    let b2 = |c: &[u8]| [c[0], c[1]];
    let b4 = |c: &[u8]| [c[0], c[1], c[2], c[3]];
    let b8 = |c: &[u8]| [c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]];
    match dtype {
        Dtype::Bool => f64::from(u8::from(c[0] != 0)),
        Dtype::Uint8 => c[0] as f64,
        Dtype::Int8 => c[0] as i8 as f64,
        Dtype::Uint16 => u16::from_le_bytes(b2(c)) as f64,
        Dtype::Int16 => i16::from_le_bytes(b2(c)) as f64,
        Dtype::Uint32 => u32::from_le_bytes(b4(c)) as f64,
        Dtype::Int32 => i32::from_le_bytes(b4(c)) as f64,
        Dtype::Uint64 => u64::from_le_bytes(b8(c)) as f64,
        Dtype::Int64 => i64::from_le_bytes(b8(c)) as f64,
        Dtype::Float16 => f16::from_le_bytes(b2(c)).to_f64(),
        Dtype::Bfloat16 => bf16::from_le_bytes(b2(c)).to_f64(),
        Dtype::Float32 | Dtype::Complex64 => f32::from_le_bytes(b4(c)) as f64,
        Dtype::Float64 => f64::from_le_bytes(b8(c)),
    }
}

#[derive(Serialize, Deserialize)]
struct TensorRepr {
    shape: Vec<usize>,
    dtype: Dtype,
    data: String,
}

impl From<Tensor> for TensorRepr {
    fn from(t: Tensor) -> Self {
        let data = to_bytes(&t).iter().map(|b| format!("{:02x}", b)).collect();
        TensorRepr {
            shape: t.shape,
            dtype: t.dtype,
            data,
        }
    }
}

impl TryFrom<TensorRepr> for Tensor {
    type Error = EngineError;

    fn try_from(repr: TensorRepr) -> EngineResult<Tensor> {
        let hex = repr.data.as_bytes();
        if hex.len() % 2 != 0 {
            return Err(EngineError::io("deserialize", "odd number of hex digits in tensor data"));
        }
        let bytes = hex
            .chunks(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
                    .ok_or_else(|| EngineError::io("deserialize", "invalid hex digit in tensor data"))
            })
            .collect::<EngineResult<Vec<u8>>>()?;
        from_bytes("deserialize", &bytes, repr.shape, repr.dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_integers_wrap() {
        assert_eq!(normalize(Dtype::Uint8, 256.0), 0.0);
        assert_eq!(normalize(Dtype::Uint8, -1.0), 255.0);
        assert_eq!(normalize(Dtype::Int8, 130.0), -126.0);
        assert_eq!(normalize(Dtype::Int32, 2.7), 2.0);
        assert_eq!(normalize(Dtype::Int32, -2.7), -2.0);
        assert_eq!(normalize(Dtype::Bool, 0.5), 1.0);
    }

    #[test]
    fn test_normalize_float_rounding() {
        assert_eq!(normalize(Dtype::Float32, 0.1), 0.1f32 as f64);
        assert_eq!(normalize(Dtype::Float64, 0.1), 0.1);
        assert_eq!(normalize(Dtype::Float16, 65520.0), f64::INFINITY);
    }

    #[test]
    fn test_strides_and_unravel() {
        assert_eq!(strides(&[2, 3, 4]), vec![12, 4, 1]);
        let mut idx = [0; 3];
        unravel(13, &[2, 3, 4], &mut idx);
        assert_eq!(idx, [1, 0, 1]);
    }

    #[test]
    fn test_broadcast_map() {
        assert_eq!(broadcast_map("add", &[3], &[2, 3]).unwrap(), vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(broadcast_map("add", &[2, 1], &[2, 3]).unwrap(), vec![0, 0, 0, 1, 1, 1]);
        assert_eq!(broadcast_map("add", &[], &[2]).unwrap(), vec![0, 0]);
        assert!(broadcast_map("add", &[2], &[3]).is_err());
    }

    #[test]
    fn test_lanes() {
        assert_eq!(lanes(&[2, 3], 1), vec![0, 3]);
        assert_eq!(lanes(&[2, 3], 0), vec![0, 1, 2]);
    }

    #[test]
    fn test_byte_codec() {
        let t = Tensor::real(vec![3], Dtype::Int16, vec![1.0, -2.0, 300.0]);
        let bytes = to_bytes(&t);
        assert_eq!(bytes.len(), 6);
        assert_eq!(from_bytes("view", &bytes, vec![3], Dtype::Int16).unwrap(), t);

        let c = Tensor::complex(vec![1], vec![C64::new(1.5, -2.0)]);
        assert_eq!(from_bytes("view", &to_bytes(&c), vec![1], Dtype::Complex64).unwrap(), c);
    }

    #[test]
    fn test_serde_keeps_non_finite_values() {
        let t = Tensor::real(vec![3], Dtype::Float32, vec![f64::NEG_INFINITY, 1.5, f64::INFINITY]);
        let json = serde_json::to_string(&t).unwrap();
        let back: Tensor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
