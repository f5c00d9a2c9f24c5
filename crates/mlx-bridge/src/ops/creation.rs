//! Array constructors.

use mlx_engine::ops::creation;
use mlx_engine::Dtype;

use super::{many, one};
use crate::args::Args;
use crate::convert;
use crate::core::Core;
use crate::dispatch::TableBuilder;
use crate::error::{BridgeError, BridgeResult};
use crate::value::Value;

pub(crate) fn register(t: &mut TableBuilder) {
    t.op("array", &["value", "dtype"], op_array);
    t.alias("asarray", "array");
    t.op("zeros", &["shape", "dtype"], |core, args| {
        let (shape, dtype) = (args.shape("shape")?, args.dtype_or("dtype", Dtype::Float32)?);
        let s = args.stream(core)?;
        one(core, |e| creation::zeros(e, &shape, dtype, &s))
    });
    t.op("ones", &["shape", "dtype"], |core, args| {
        let (shape, dtype) = (args.shape("shape")?, args.dtype_or("dtype", Dtype::Float32)?);
        let s = args.stream(core)?;
        one(core, |e| creation::ones(e, &shape, dtype, &s))
    });
    t.op("full", &["shape", "vals", "dtype"], |core, args| {
        let shape = args.shape("shape")?;
        let vals = args.array(core, "vals")?;
        let dtype = args.opt_dtype("dtype")?;
        let s = args.stream(core)?;
        one(core, |e| creation::full(e, &shape, &vals, dtype, &s))
    });
    t.op("zeros_like", &["a", "dtype"], |core, args| {
        let (a, dtype) = (args.array(core, "a")?, args.opt_dtype("dtype")?);
        let s = args.stream(core)?;
        one(core, |e| creation::zeros_like(e, &a, dtype, &s))
    });
    t.op("ones_like", &["a", "dtype"], |core, args| {
        let (a, dtype) = (args.array(core, "a")?, args.opt_dtype("dtype")?);
        let s = args.stream(core)?;
        one(core, |e| creation::ones_like(e, &a, dtype, &s))
    });
    t.op("full_like", &["a", "vals", "dtype"], |core, args| {
        let a = args.array(core, "a")?;
        let vals = args.array(core, "vals")?;
        let dtype = args.dtype_or("dtype", a.dtype())?;
        let s = args.stream(core)?;
        one(core, |e| creation::full(e, a.shape(), &vals, Some(dtype), &s))
    });
    t.op("arange", &["start", "stop", "step", "dtype"], op_arange);
    t.op("linspace", &["start", "stop", "num", "dtype"], |core, args| {
        let start = args.float("start")?;
        let stop = args.float("stop")?;
        let num = args.usize_or("num", 50)?;
        let dtype = args.dtype_or("dtype", Dtype::Float32)?;
        one(core, |e| creation::linspace(e, start, stop, num, dtype))
    });
    t.op("eye", &["n", "m", "k", "dtype"], |core, args| {
        let (n, [m, k], dtype) = split_dtype(args, "n", ["m", "k"])?;
        let n = convert::to_usize(&n)?;
        let m = m.as_ref().map(convert::to_usize).transpose()?;
        let k = k.as_ref().map(convert::to_int).transpose()?.unwrap_or(0);
        one(core, |e| creation::eye(e, n, m, k, dtype.unwrap_or(Dtype::Float32)))
    });
    t.op("identity", &["n", "dtype"], |core, args| {
        let n = args.usize("n")?;
        let dtype = args.dtype_or("dtype", Dtype::Float32)?;
        one(core, |e| creation::identity(e, n, dtype))
    });
    t.op("tri", &["n", "m", "k", "dtype"], |core, args| {
        let (n, [m, k], dtype) = split_dtype(args, "n", ["m", "k"])?;
        let n = convert::to_usize(&n)?;
        let m = m.as_ref().map(convert::to_usize).transpose()?;
        let k = k.as_ref().map(convert::to_int).transpose()?.unwrap_or(0);
        one(core, |e| creation::tri(e, n, m, k, dtype.unwrap_or(Dtype::Float32)))
    });
    t.op("astype", &["a", "dtype"], |core, args| {
        let (a, dtype) = (args.array(core, "a")?, args.dtype("dtype")?);
        let s = args.stream(core)?;
        one(core, |e| e.astype(&a, dtype, &s))
    });
    t.op("meshgrid", &["*arrays", "sparse", "indexing"], |core, args| {
        let arrays = args.rest_arrays(core)?;
        let sparse = args.bool_or("sparse", false)?;
        let indexing = args.text_or("indexing", "xy")?;
        let s = args.stream(core)?;
        many(core, |e| creation::meshgrid(e, &arrays, sparse, &indexing, &s))
    });
    t.op("copy", &["a"], |core, args| {
        let a = args.array(core, "a")?;
        let s = args.stream(core)?;
        one(core, |e| e.astype(&a, a.dtype(), &s))
    });
}

fn op_array(core: &Core, args: &Args) -> BridgeResult<Value> {
    let dtype = args.opt_dtype("dtype")?;
    convert::to_array(core, args.required("value")?, dtype).map(Value::from)
}

/// `arange(stop)`, `arange(start, stop)`, `arange(start, stop, step)`,
/// each optionally followed (or keyword-given) a dtype in any slot
fn op_arange(core: &Core, args: &Args) -> BridgeResult<Value> {
    let (first, [second, third], dtype) = split_dtype(args, "start", ["stop", "step"])?;
    let numbers: Vec<Value> = std::iter::once(first)
        .chain(second)
        .chain(third)
        .collect();
    let (start, stop, step) = match numbers.as_slice() {
        [stop] => (Value::Int(0), stop.clone(), Value::Int(1)),
        [start, stop] => (start.clone(), stop.clone(), Value::Int(1)),
        [start, stop, step] => (start.clone(), stop.clone(), step.clone()),
        _ => return Err(BridgeError::argument("arange: expected stop, start and stop, or start, stop and step")),
    };
    let all_int = [&start, &stop, &step].iter().all(|v| matches!(v, Value::Int(_)));
    let dtype = dtype.unwrap_or(if all_int { Dtype::Int32 } else { Dtype::Float32 });
    let (start, stop, step) = (convert::to_float(&start)?, convert::to_float(&stop)?, convert::to_float(&step)?);
    if step == 0.0 {
        return Err(BridgeError::argument("arange: step cannot be zero"));
    }
    one(core, |e| creation::arange(e, start, stop, step, dtype))
}

/// Separate a dtype given in any optional positional slot from the numbers.
///
/// Returns the required leading value, the remaining numeric slots in
/// order, and the dtype from the first slot that looks like one or the
/// `dtype` keyword.
fn split_dtype(args: &Args, first: &str, rest: [&str; 2]) -> BridgeResult<(Value, [Option<Value>; 2], Option<Dtype>)> {
    let mut dtype = args.opt_dtype("dtype")?;
    let head = args.required(first)?.clone();
    if convert::looks_like_dtype(&head) {
        return Err(BridgeError::argument(format!("{}: '{}' must be a number", args.op(), first)));
    }
    let mut numbers = [None, None];
    let mut slot = 0;
    for name in rest {
        match args.get(name) {
            Some(v) if convert::looks_like_dtype(v) => {
                if dtype.is_some() {
                    return Err(BridgeError::argument(format!("{}: dtype given twice", args.op())));
                }
                dtype = Some(convert::to_dtype(v)?);
            }
            Some(v) => {
                numbers[slot] = Some(v.clone());
                slot += 1;
            }
            None => {}
        }
    }
    Ok((head, numbers, dtype))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn core() -> Core {
        Core::new(Arc::new(CpuEngine::with_seed(4)))
    }

    fn to_a(core: &Core, v: &Value) -> Value {
        v.as_array().unwrap().to_a(core).unwrap()
    }

    #[test]
    fn test_arange_dtype_in_any_slot() {
        let core = core();
        let a = core.call("arange", vec![Value::Int(3), Value::Dtype(Dtype::Float32)]).unwrap();
        assert_eq!(a.as_array().unwrap().dtype(), Dtype::Float32);
        assert_eq!(to_a(&core, &a), Value::list(vec![0.0.into(), 1.0.into(), 2.0.into()]));

        let b = core.call("arange", vec![Value::Int(1), Value::Int(7), Value::Int(2), Value::sym("int32")]).unwrap();
        assert_eq!(to_a(&core, &b), Value::list(vec![1i64.into(), 3i64.into(), 5i64.into()]));
    }

    #[test]
    fn test_arange_default_dtype() {
        let core = core();
        let ints = core.call("arange", vec![Value::Int(2)]).unwrap();
        assert_eq!(ints.as_array().unwrap().dtype(), Dtype::Int32);
        let floats = core.call("arange", vec![Value::Float(0.0), Value::Float(1.0), Value::Float(0.5)]).unwrap();
        assert_eq!(floats.as_array().unwrap().dtype(), Dtype::Float32);
    }

    #[test]
    fn test_eye_accepts_dtype_as_second_argument() {
        let core = core();
        let a = core.call("eye", vec![Value::Int(2), Value::sym("int32")]).unwrap();
        let handle = a.as_array().unwrap();
        assert_eq!(handle.dtype(), Dtype::Int32);
        assert_eq!(handle.shape(), vec![2, 2]);
    }

    #[test]
    fn test_full_like_keeps_dtype() {
        let core = core();
        let a = core.call("zeros", vec![Value::list(vec![Value::Int(2)]), Value::sym("int16")]).unwrap();
        let b = core.call("full_like", vec![a, Value::Int(7)]).unwrap();
        assert_eq!(b.as_array().unwrap().dtype(), Dtype::Int16);
        assert_eq!(to_a(&core, &b), Value::list(vec![7i64.into(), 7i64.into()]));
    }
}
