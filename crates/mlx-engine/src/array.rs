//! Opaque Arrays and Host Buffers
//!
//! An [`Array`] is a cheap, clonable reference to engine-owned storage.
//! Callers can read its shape and dtype; everything else (data, graph
//! position, device placement) stays behind the [`ArrayImpl`] trait and is
//! reached through the engine.
//!
//! [`HostBuffer`] is the flat, row-major exchange format used when data
//! crosses the boundary in either direction.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use num_complex::Complex64 as C64;

use crate::dtype::Dtype;

// ============================================================================
// Array
// ============================================================================

/// Engine-side storage behind an [`Array`].
pub trait ArrayImpl: Send + Sync + fmt::Debug {
    fn shape(&self) -> &[usize];
    fn dtype(&self) -> Dtype;
    fn as_any(&self) -> &dyn Any;
}

/// Reference-counted handle to one engine array.
#[derive(Clone)]
pub struct Array(Arc<dyn ArrayImpl>);

impl Array {
    pub fn new<T: ArrayImpl + 'static>(inner: T) -> Self {
        Array(Arc::new(inner))
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn dtype(&self) -> Dtype {
        self.0.dtype()
    }

    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Number of elements
    pub fn size(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn itemsize(&self) -> usize {
        self.dtype().size()
    }

    pub fn nbytes(&self) -> usize {
        self.size() * self.itemsize()
    }

    /// Downcast to the engine's concrete storage type
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref::<T>()
    }

    /// Identity comparison
    pub fn ptr_eq(&self, other: &Array) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Array")
            .field("shape", &self.shape())
            .field("dtype", &self.dtype())
            .finish()
    }
}

// ============================================================================
// HostBuffer
// ============================================================================

/// Flat row-major data exchanged with the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum HostBuffer {
    Bool(Vec<bool>),
    Int(Vec<i64>),
    UInt(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Complex(Vec<C64>),
}

impl HostBuffer {
    pub fn len(&self) -> usize {
        match self {
            HostBuffer::Bool(v) => v.len(),
            HostBuffer::Int(v) => v.len(),
            HostBuffer::UInt(v) => v.len(),
            HostBuffer::Float32(v) => v.len(),
            HostBuffer::Float64(v) => v.len(),
            HostBuffer::Complex(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The dtype a buffer maps to when no explicit dtype is requested
    pub fn natural_dtype(&self) -> Dtype {
        match self {
            HostBuffer::Bool(_) => Dtype::Bool,
            HostBuffer::Int(_) => Dtype::Int64,
            HostBuffer::UInt(_) => Dtype::Uint64,
            HostBuffer::Float32(_) => Dtype::Float32,
            HostBuffer::Float64(_) => Dtype::Float64,
            HostBuffer::Complex(_) => Dtype::Complex64,
        }
    }

    /// Element `i` widened to double precision. Complex values yield their real part.
    pub fn get_f64(&self, i: usize) -> Option<f64> {
        match self {
            HostBuffer::Bool(v) => v.get(i).map(|b| if *b { 1.0 } else { 0.0 }),
            HostBuffer::Int(v) => v.get(i).map(|x| *x as f64),
            HostBuffer::UInt(v) => v.get(i).map(|x| *x as f64),
            HostBuffer::Float32(v) => v.get(i).map(|x| *x as f64),
            HostBuffer::Float64(v) => v.get(i).copied(),
            HostBuffer::Complex(v) => v.get(i).map(|c| c.re),
        }
    }
}

/// A single host scalar
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Complex(f64, f64),
}

impl Scalar {
    /// Buffer holding just this scalar
    pub fn to_buffer(self) -> HostBuffer {
        match self {
            Scalar::Bool(b) => HostBuffer::Bool(vec![b]),
            Scalar::Int(i) => HostBuffer::Int(vec![i]),
            Scalar::Float(f) => HostBuffer::Float64(vec![f]),
            Scalar::Complex(re, im) => HostBuffer::Complex(vec![C64::new(re, im)]),
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            Scalar::Int(i) => i as f64,
            Scalar::Float(f) => f,
            Scalar::Complex(re, _) => re,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Dummy {
        shape: Vec<usize>,
    }

    impl ArrayImpl for Dummy {
        fn shape(&self) -> &[usize] {
            &self.shape
        }
        fn dtype(&self) -> Dtype {
            Dtype::Float32
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[test]
    fn test_array_metadata() {
        let a = Array::new(Dummy { shape: vec![2, 3] });
        assert_eq!(a.ndim(), 2);
        assert_eq!(a.size(), 6);
        assert_eq!(a.nbytes(), 24);
        assert!(a.downcast_ref::<Dummy>().is_some());
        assert!(a.ptr_eq(&a.clone()));
    }

    #[test]
    fn test_host_buffer() {
        let buf = HostBuffer::Int(vec![1, 2, 3]);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.natural_dtype(), Dtype::Int64);
        assert_eq!(buf.get_f64(2), Some(3.0));
        assert_eq!(Scalar::Bool(true).as_f64(), 1.0);
    }
}
