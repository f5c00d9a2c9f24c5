//! Keys and distributions.
//!
//! Every sampler takes an optional `key`; without one the engine's global
//! key is split and advanced. Each entry is also reachable under a
//! `random_` prefix. Key splitting is only registered as `random_split`,
//! since `split` is the array splitter.

use mlx_engine::ops::random;
use mlx_engine::Dtype;

use super::one;
use crate::args::Args;
use crate::core::Core;
use crate::dispatch::TableBuilder;
use crate::error::{BridgeError, BridgeResult};
use crate::value::Value;

const PREFIXED: &[(&str, &str)] = &[
    ("random_seed", "seed"),
    ("random_key", "key"),
    ("random_uniform", "uniform"),
    ("random_normal", "normal"),
    ("random_randint", "randint"),
    ("random_bernoulli", "bernoulli"),
    ("random_categorical", "categorical"),
    ("random_permutation", "permutation"),
    ("random_multivariate_normal", "multivariate_normal"),
    ("random_truncated_normal", "truncated_normal"),
    ("random_gumbel", "gumbel"),
    ("random_laplace", "laplace"),
];

pub(crate) fn register(t: &mut TableBuilder) {
    t.admin("seed", &["seed"], |core, args| {
        let seed = seed_value(args)?;
        core.engine().seed(seed);
        Ok(Value::Nil)
    });
    t.admin("key", &["seed"], |core, args| {
        let seed = seed_value(args)?;
        one(core, |e| e.key(seed))
    });
    t.op("random_split", &["key", "num"], |core, args| {
        let key = args.opt_array(core, "key")?;
        let num = args.usize_or("num", 2)?;
        let s = args.stream(core)?;
        one(core, |e| random::split(e, key.as_ref(), num, &s))
    });

    t.op("uniform", &["shape", "low", "high", "dtype", "key"], |core, args| {
        let shape = shape_or_scalar(args)?;
        let low = bound(core, args, "low", 0.0)?;
        let high = bound(core, args, "high", 1.0)?;
        let dtype = args.dtype_or("dtype", Dtype::Float32)?;
        let key = args.opt_array(core, "key")?;
        let s = args.stream(core)?;
        one(core, |e| random::uniform(e, &low, &high, &shape, dtype, key.as_ref(), &s))
    });
    t.op("normal", &["shape", "loc", "scale", "dtype", "key"], |core, args| {
        let shape = shape_or_scalar(args)?;
        let (loc, scale) = (args.float_or("loc", 0.0)?, args.float_or("scale", 1.0)?);
        let dtype = args.dtype_or("dtype", Dtype::Float32)?;
        let key = args.opt_array(core, "key")?;
        let s = args.stream(core)?;
        one(core, |e| random::normal(e, &shape, dtype, loc, scale, key.as_ref(), &s))
    });
    t.op("randint", &["low", "high", "shape", "dtype", "key"], |core, args| {
        let (low, high) = (args.array(core, "low")?, args.array(core, "high")?);
        let shape = shape_or_scalar(args)?;
        let dtype = args.dtype_or("dtype", Dtype::Int32)?;
        let key = args.opt_array(core, "key")?;
        let s = args.stream(core)?;
        one(core, |e| random::randint(e, &low, &high, &shape, dtype, key.as_ref(), &s))
    });
    t.op("bernoulli", &["p", "shape", "key"], |core, args| {
        let p = bound(core, args, "p", 0.5)?;
        let shape = args.opt_shape("shape")?;
        let key = args.opt_array(core, "key")?;
        let s = args.stream(core)?;
        one(core, |e| random::bernoulli(e, &p, shape.as_deref(), key.as_ref(), &s))
    });
    t.op("categorical", &["logits", "axis", "shape", "num_samples", "key"], |core, args| {
        let logits = args.array(core, "logits")?;
        let axis = args.int_or("axis", -1)?;
        let shape = args.opt_shape("shape")?;
        let num_samples = args.opt_usize("num_samples")?;
        let key = args.opt_array(core, "key")?;
        let s = args.stream(core)?;
        one(core, |e| random::categorical(e, &logits, axis, shape.as_deref(), num_samples, key.as_ref(), &s))
    });
    t.op("permutation", &["x", "axis", "key"], |core, args| {
        let key = args.opt_array(core, "key")?;
        let axis = args.int_or("axis", 0)?;
        let s = args.stream(core)?;
        match args.required("x")? {
            Value::Int(n) => {
                let n = usize::try_from(*n)
                    .map_err(|_| BridgeError::argument(format!("permutation: length must be non-negative, got {}", n)))?;
                one(core, |e| random::permutation_n(e, n, key.as_ref(), &s))
            }
            _ => {
                let x = args.array(core, "x")?;
                one(core, |e| random::permutation(e, &x, axis, key.as_ref(), &s))
            }
        }
    });
    t.op("multivariate_normal", &["mean", "cov", "shape", "dtype", "key"], |core, args| {
        let (mean, cov) = (args.array(core, "mean")?, args.array(core, "cov")?);
        let shape = shape_or_scalar(args)?;
        let dtype = args.dtype_or("dtype", Dtype::Float32)?;
        let key = args.opt_array(core, "key")?;
        let s = args.stream(core)?;
        one(core, |e| random::multivariate_normal(e, &mean, &cov, &shape, dtype, key.as_ref(), &s))
    });
    t.op("truncated_normal", &["lower", "upper", "shape", "dtype", "key"], |core, args| {
        let (lower, upper) = (args.array(core, "lower")?, args.array(core, "upper")?);
        let shape = args.opt_shape("shape")?;
        let dtype = args.dtype_or("dtype", Dtype::Float32)?;
        let key = args.opt_array(core, "key")?;
        let s = args.stream(core)?;
        one(core, |e| random::truncated_normal(e, &lower, &upper, shape.as_deref(), dtype, key.as_ref(), &s))
    });
    t.op("gumbel", &["shape", "dtype", "key"], |core, args| {
        let shape = shape_or_scalar(args)?;
        let dtype = args.dtype_or("dtype", Dtype::Float32)?;
        let key = args.opt_array(core, "key")?;
        let s = args.stream(core)?;
        one(core, |e| random::gumbel(e, &shape, dtype, key.as_ref(), &s))
    });
    t.op("laplace", &["shape", "dtype", "loc", "scale", "key"], |core, args| {
        let shape = shape_or_scalar(args)?;
        let dtype = args.dtype_or("dtype", Dtype::Float32)?;
        let (loc, scale) = (args.float_or("loc", 0.0)?, args.float_or("scale", 1.0)?);
        let key = args.opt_array(core, "key")?;
        let s = args.stream(core)?;
        one(core, |e| random::laplace(e, &shape, dtype, loc, scale, key.as_ref(), &s))
    });

    for &(alias, target) in PREFIXED {
        t.alias(alias, target);
    }
}

fn seed_value(args: &Args) -> BridgeResult<u64> {
    let seed = args.int("seed")?;
    u64::try_from(seed).map_err(|_| BridgeError::argument(format!("{}: seed must be non-negative, got {}", args.op(), seed)))
}

/// Sample shape; absent means a scalar draw
fn shape_or_scalar(args: &Args) -> BridgeResult<Vec<usize>> {
    Ok(args.opt_shape("shape")?.unwrap_or_default())
}

/// A distribution parameter given as a number or array, with a float default
fn bound(core: &Core, args: &Args, name: &str, default: f64) -> BridgeResult<mlx_engine::Array> {
    match args.opt_array(core, name)? {
        Some(a) => Ok(a),
        None => crate::convert::to_array(core, &Value::Float(default), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn core() -> Core {
        Core::new(Arc::new(CpuEngine::with_seed(7)))
    }

    fn shape(dims: &[i64]) -> Value {
        Value::list(dims.iter().map(|&d| Value::Int(d)).collect())
    }

    #[test]
    fn test_same_key_same_draw() {
        let core = core();
        let key = core.call("key", vec![Value::Int(3)]).unwrap();
        let kwargs = || Value::hash([("key", key.clone())]);
        let a = core.call("uniform", vec![shape(&[4]), kwargs()]).unwrap();
        let b = core.call("random_uniform", vec![shape(&[4]), kwargs()]).unwrap();
        assert_eq!(a.as_array().unwrap().to_a(&core).unwrap(), b.as_array().unwrap().to_a(&core).unwrap());
    }

    #[test]
    fn test_seed_returns_nil() {
        let core = core();
        assert_eq!(core.call("seed", vec![Value::Int(1)]).unwrap(), Value::Nil);
        assert!(core.call("seed", vec![Value::Int(-1)]).unwrap_err().is_argument_error());
    }

    #[test]
    fn test_random_split_shape() {
        let core = core();
        let key = core.call("key", vec![Value::Int(0)]).unwrap();
        let keys = core.call("random_split", vec![key, Value::Int(3)]).unwrap();
        assert_eq!(keys.as_array().unwrap().shape(), vec![3, 2]);
    }

    #[test]
    fn test_permutation_of_length() {
        let core = core();
        let out = core.call("permutation", vec![Value::Int(5)]).unwrap();
        let handle = out.as_array().unwrap();
        assert_eq!(handle.shape(), vec![5]);
        let sorted = core.call("sort", vec![out.clone()]).unwrap();
        let expected = Value::list((0..5).map(Value::Int).collect());
        assert_eq!(sorted.as_array().unwrap().to_a(&core).unwrap(), expected);
    }

    #[test]
    fn test_scalar_draw_without_shape() {
        let core = core();
        let out = core.call("normal", vec![]).unwrap();
        assert_eq!(out.as_array().unwrap().ndim(), 0);
    }
}
