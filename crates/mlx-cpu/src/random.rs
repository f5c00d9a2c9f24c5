//! Keyed random generation.
//!
//! A key is a `uint32[2]` tensor. Every sampler seeds a [`StdRng`] from the
//! 64-bit value of its key, so a key always produces the same numbers.
//! [`GlobalKey`] holds the implicit key used when the caller passes none;
//! each draw splits it and advances it.

use mlx_engine::{finfo, Dtype, EngineError, EngineResult};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::tensor::{normalize, Tensor};

/// Key words of a seed
pub fn key_words(seed: u64) -> [u32; 2] {
    [(seed >> 32) as u32, (seed & 0xffff_ffff) as u32]
}

pub fn key_tensor(words: [u32; 2]) -> Tensor {
    Tensor::real(vec![2], Dtype::Uint32, vec![f64::from(words[0]), f64::from(words[1])])
}

fn rng(op: &str, key: &Tensor) -> EngineResult<StdRng> {
    if key.dtype != Dtype::Uint32 || key.shape != [2] {
        return Err(EngineError::invalid(
            op,
            format!("key must be a uint32 array of shape [2], got {} {:?}", key.dtype, key.shape),
        ));
    }
    let v = key.values();
    Ok(StdRng::seed_from_u64(((v[0] as u64) << 32) | v[1] as u64))
}

/// `num` child keys as a `[num, 2]` tensor
pub fn split(key: &Tensor, num: usize) -> EngineResult<Tensor> {
    let mut rng = rng("split", key)?;
    let words = (0..num * 2).map(|_| f64::from(rng.gen::<u32>())).collect();
    Ok(Tensor::real(vec![num, 2], Dtype::Uint32, words))
}

fn check_float(op: &str, dtype: Dtype) -> EngineResult<()> {
    if dtype.is_floating() {
        Ok(())
    } else {
        Err(EngineError::dtype(op, dtype))
    }
}

/// Samples in `[0, 1)` after rounding to `dtype`
pub fn uniform(key: &Tensor, shape: &[usize], dtype: Dtype) -> EngineResult<Tensor> {
    check_float("uniform", dtype)?;
    let mut rng = rng("uniform", key)?;
    let below_one = 1.0 - finfo(dtype).map_or(f64::EPSILON, |f| f.eps) / 2.0;
    let n = shape.iter().product();
    let values = (0..n)
        .map(|_| {
            let x = normalize(dtype, rng.gen::<f64>());
            if x >= 1.0 {
                below_one
            } else {
                x
            }
        })
        .collect();
    Ok(Tensor::real(shape.to_vec(), dtype, values))
}

pub fn normal(key: &Tensor, shape: &[usize], dtype: Dtype) -> EngineResult<Tensor> {
    check_float("normal", dtype)?;
    let mut rng = rng("normal", key)?;
    let n = shape.iter().product();
    let values = (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
    Ok(Tensor::real(shape.to_vec(), dtype, values))
}

/// The implicit key
#[derive(Debug)]
pub struct GlobalKey {
    words: Mutex<[u32; 2]>,
}

impl GlobalKey {
    pub fn new(seed: u64) -> Self {
        GlobalKey {
            words: Mutex::new(key_words(seed)),
        }
    }

    pub fn seed(&self, seed: u64) {
        *self.words.lock() = key_words(seed);
    }

    /// Advance the global key and return a fresh subkey
    pub fn next(&self) -> EngineResult<Tensor> {
        let mut words = self.words.lock();
        let children = split(&key_tensor(*words), 2)?;
        let v = children.values();
        *words = [v[0] as u32, v[1] as u32];
        Ok(key_tensor([v[2] as u32, v[3] as u32]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_key_words() {
        assert_eq!(key_words(0), [0, 0]);
        assert_eq!(key_words((3 << 32) | 7), [3, 7]);
    }

    #[test]
    fn test_same_key_same_numbers() {
        let k = key_tensor([0, 42]);
        let a = uniform(&k, &[8], Dtype::Float32).unwrap();
        let b = uniform(&k, &[8], Dtype::Float32).unwrap();
        assert_eq!(a, b);
        assert!(a.values().iter().all(|&x| (0.0..1.0).contains(&x)));
        let other = uniform(&key_tensor([0, 43]), &[8], Dtype::Float32).unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_split_shape() {
        let keys = split(&key_tensor([1, 2]), 3).unwrap();
        assert_eq!(keys.shape, vec![3, 2]);
        assert_eq!(keys.dtype, Dtype::Uint32);
        assert!(split(&Tensor::zeros(vec![3], Dtype::Uint32), 2).is_err());
    }

    #[test]
    fn test_global_key_advances() {
        let g = GlobalKey::new(0);
        let a = g.next().unwrap();
        let b = g.next().unwrap();
        assert_ne!(a, b);
        g.seed(0);
        assert_eq!(g.next().unwrap(), a);
    }

    #[test]
    fn test_integer_dtype_rejected() {
        assert!(uniform(&key_tensor([0, 0]), &[2], Dtype::Int32).is_err());
    }
}
