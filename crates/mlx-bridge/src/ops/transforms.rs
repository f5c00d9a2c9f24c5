//! Function transforms, evaluation and export.
//!
//! Transforms that wrap a host callable return a [`FunctionHandle`] with a
//! host body: calling it re-enters the host, so it never runs inside a
//! release window. Compiled and imported functions replay natively.
//!
//! ## Gradients
//!
//! `grad` and `value_and_grad` differentiate the first output of `fun`,
//! which must be a scalar array, with respect to the positional arguments
//! named by `argnums`. Other arguments and keywords pass through unchanged.

use std::path::PathBuf;

use mlx_engine::ops::creation;
use mlx_engine::Array;

use crate::args::Args;
use crate::convert;
use crate::core::Core;
use crate::dispatch::TableBuilder;
use crate::error::{BridgeError, BridgeResult};
use crate::handles::{
    call_split, export_inputs, CompiledFunction, ExporterHandle, FunctionBody, FunctionHandle, FunctionKind,
};
use crate::value::{Hash, Value};

pub(crate) fn register(t: &mut TableBuilder) {
    t.op("grad", &["fun", "argnums"], |_, args| gradient(args, false));
    t.op("value_and_grad", &["fun", "argnums"], |_, args| gradient(args, true));
    t.op("vjp", &["fun", "primals", "cotangents"], |core, args| {
        let fun = callable(args)?;
        let primals = args.array_list(core, "primals")?;
        let cotangents = args.array_list(core, "cotangents")?;
        let mut host = core.host_fn(|arrays| core.call_value(&fun, &host_values(arrays), &Hash::new()));
        let (outputs, vjps) = core.run_engine(|e| e.vjp(&mut host, &primals, &cotangents))?;
        Ok(Value::list(vec![convert::array_list(outputs), convert::array_list(vjps)]))
    });
    t.op("jvp", &["fun", "primals", "tangents"], |core, args| {
        let fun = callable(args)?;
        let primals = args.array_list(core, "primals")?;
        let tangents = args.array_list(core, "tangents")?;
        let mut host = core.host_fn(|arrays| core.call_value(&fun, &host_values(arrays), &Hash::new()));
        let (outputs, jvps) = core.run_engine(|e| e.jvp(&mut host, &primals, &tangents))?;
        Ok(Value::list(vec![convert::array_list(outputs), convert::array_list(jvps)]))
    });
    t.op("vmap", &["fun", "in_axes", "out_axes"], op_vmap);
    t.op("checkpoint", &["fun"], |_, args| {
        let fun = callable(args)?;
        let refs = vec![fun.clone()];
        let handle = FunctionHandle::host("checkpoint", FunctionKind::Vector, refs, move |core, args, kwargs| {
            let inputs = convert::to_arrays(core, args)?;
            let mut host = core.host_fn(|arrays| core.call_value(&fun, &host_values(arrays), kwargs));
            let outputs = core.run_engine(|e| e.checkpoint(&mut host, &inputs))?;
            Ok(convert::project(outputs))
        });
        Ok(Value::Function(handle))
    });
    t.op("compile", &["fun", "inputs", "outputs", "shapeless"], |core, args| {
        let fun = callable(args)?;
        let shapeless = args.bool_or("shapeless", false)?;
        let mut refs = vec![fun.clone()];
        refs.extend(["inputs", "outputs"].iter().filter_map(|k| args.get(k)).filter(|v| !v.is_nil()).cloned());
        let body = FunctionBody::Compiled(CompiledFunction::new(fun, shapeless, core.config().max_compile_cache));
        Ok(Value::Function(FunctionHandle::new("compiled", FunctionKind::Vector, body, refs)))
    });
    t.admin("disable_compile", &[], |core, _| {
        core.set_compile_enabled(false);
        Ok(Value::Nil)
    });
    t.admin("enable_compile", &[], |core, _| {
        core.set_compile_enabled(true);
        Ok(Value::Nil)
    });

    // Evaluation
    t.op("eval", &["*trees"], |core, args| {
        let arrays = tree_leaves(args);
        core.run_engine(|e| e.eval(&arrays))?;
        Ok(Value::Nil)
    });
    t.op("async_eval", &["*trees"], |core, args| {
        let arrays = tree_leaves(args);
        core.run_engine(|e| e.async_eval(&arrays))?;
        Ok(Value::Nil)
    });
    t.op("depends", &["inputs", "dependencies"], |core, args| {
        let (inputs, single) = array_or_list(core, args.required("inputs")?)?;
        let (dependencies, _) = array_or_list(core, args.required("dependencies")?)?;
        let outputs = core.run_engine(|e| e.depends(&inputs, &dependencies))?;
        Ok(if single { convert::project(outputs) } else { convert::array_list(outputs) })
    });

    // Export
    t.admin("export_function", &["file", "fun", "*args", "shapeless", "**kwargs"], op_export_function);
    t.admin("exporter", &["file", "fun", "shapeless"], |core, args| {
        let path = PathBuf::from(args.text("file")?);
        let fun = callable(args)?;
        let shapeless = args.bool_or("shapeless", false)?;
        let session = core.run_engine(|e| e.exporter(&path, shapeless))?;
        Ok(Value::Exporter(ExporterHandle::new(session, path, fun)))
    });
    t.admin("import_function", &["file"], |core, args| {
        let path = PathBuf::from(args.text("file")?);
        let f = core.run_engine(|e| e.import_function(&path))?;
        let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        Ok(Value::Function(FunctionHandle::new(&name, FunctionKind::ArgsKwargs, FunctionBody::NativeKw(f), Vec::new())))
    });
    t.admin("export_to_dot", &["file", "*outputs"], |core, args| {
        let path = PathBuf::from(args.text("file")?);
        let outputs = tree_leaves(args);
        core.run_engine(|e| e.export_to_dot(&path, &outputs))?;
        Ok(Value::Nil)
    });
}

fn host_values(arrays: &[Array]) -> Vec<Value> {
    arrays.iter().cloned().map(Value::from).collect()
}

/// Arrays reachable from the variadic arguments
fn tree_leaves(args: &Args) -> Vec<Array> {
    let mut out = Vec::new();
    for value in args.rest() {
        convert::tree_arrays(value, &mut out);
    }
    out
}

fn callable(args: &Args) -> BridgeResult<Value> {
    let fun = args.required("fun")?;
    if !fun.is_callable() {
        return Err(BridgeError::type_mismatch("Proc or Function", fun.type_name()));
    }
    Ok(fun.clone())
}

/// `argnums` as an integer or a list of integers; defaults to the first argument
fn argnums(args: &Args) -> BridgeResult<Vec<usize>> {
    let nums = match args.get("argnums") {
        None | Some(Value::Nil) => return Ok(vec![0]),
        Some(v @ Value::Int(_)) => vec![convert::to_int(v)?],
        Some(v) => convert::to_int_list(v)?,
    };
    if nums.is_empty() {
        return Err(BridgeError::argument(format!("{}: argnums cannot be empty", args.op())));
    }
    nums.into_iter()
        .map(|n| {
            usize::try_from(n)
                .map_err(|_| BridgeError::argument(format!("{}: argnums must be non-negative, got {}", args.op(), n)))
        })
        .collect()
}

fn gradient(args: &Args, with_value: bool) -> BridgeResult<Value> {
    let fun = callable(args)?;
    let argnums = argnums(args)?;
    let (name, kind) = if with_value {
        ("value_and_grad", FunctionKind::ValueAndGrad)
    } else {
        ("grad", FunctionKind::Vector)
    };
    let refs = vec![fun.clone()];
    let handle = FunctionHandle::host(name, kind, refs, move |core, call_args, kwargs| {
        if let Some(&bad) = argnums.iter().find(|&&n| n >= call_args.len()) {
            return Err(BridgeError::argument(format!(
                "{}: argnums {} out of range for {} arguments",
                name,
                bad,
                call_args.len()
            )));
        }
        let primals = argnums
            .iter()
            .map(|&n| convert::to_array(core, &call_args[n], None))
            .collect::<BridgeResult<Vec<_>>>()?;
        let rebuild = |arrays: &[Array]| -> Vec<Value> {
            let mut full = call_args.to_vec();
            for (&n, a) in argnums.iter().zip(arrays) {
                full[n] = Value::from(a.clone());
            }
            full
        };

        let s = core.current_stream();
        let mut host = core.host_fn(|arrays| core.call_value(&fun, &rebuild(arrays), kwargs));
        // Ones for the loss, zeros for auxiliary outputs
        let mut seed = core.host_fn(|outputs| {
            let Some(loss) = outputs.first() else {
                return Err(BridgeError::argument(format!("{}: function returned no arrays", name)));
            };
            if loss.size() != 1 {
                return Err(BridgeError::argument(format!(
                    "{}: the function must return a scalar array, got shape {:?}",
                    name,
                    loss.shape()
                )));
            }
            let e = core.engine();
            outputs
                .iter()
                .enumerate()
                .map(|(i, o)| {
                    if i == 0 {
                        creation::ones_like(e, o, None, &s)
                    } else {
                        creation::zeros_like(e, o, None, &s)
                    }
                })
                .collect::<mlx_engine::EngineResult<Vec<_>>>()
                .map(convert::array_list)
                .map_err(BridgeError::from)
        });
        let (values, grads) = core.run_engine(|e| e.vjp_with(&mut host, &primals, &mut seed))?;
        let grads = convert::project(grads);
        Ok(if with_value {
            Value::list(vec![convert::project(values), grads])
        } else {
            grads
        })
    });
    Ok(Value::Function(handle))
}

/// One entry per input: an integer, nil for broadcast, or a list of those
fn axes_spec(value: Option<&Value>) -> BridgeResult<Option<Vec<Option<i64>>>> {
    match value {
        None => Ok(None),
        Some(Value::Nil) => Ok(Some(vec![None])),
        Some(v @ Value::Int(_)) => Ok(Some(vec![Some(convert::to_int(v)?)])),
        Some(v) => convert::list_items(v)?
            .iter()
            .map(|item| match item {
                Value::Nil => Ok(None),
                other => convert::to_int(other).map(Some),
            })
            .collect::<BridgeResult<Vec<_>>>()
            .map(Some),
    }
}

fn op_vmap(_: &Core, args: &Args) -> BridgeResult<Value> {
    let fun = callable(args)?;
    // `None` from axes_spec means the default axis 0 for every entry
    let in_spec = axes_spec(args.get("in_axes"))?;
    let out_spec = axes_spec(args.get("out_axes"))?;
    let out_axes: Vec<Option<usize>> = out_spec
        .unwrap_or_else(|| vec![Some(0)])
        .into_iter()
        .map(|axis| match axis {
            Some(n) if n < 0 => Err(BridgeError::argument(format!("vmap: out_axes must be non-negative, got {}", n))),
            Some(n) => Ok(Some(n as usize)),
            None => Ok(None),
        })
        .collect::<BridgeResult<_>>()?;

    let refs = vec![fun.clone()];
    let handle = FunctionHandle::host("vmap", FunctionKind::Vector, refs, move |core, call_args, kwargs| {
        let inputs = convert::to_arrays(core, call_args)?;
        let in_axes = match &in_spec {
            None => vec![Some(0); inputs.len()],
            Some(spec) if spec.len() == 1 => vec![spec[0]; inputs.len()],
            Some(spec) if spec.len() == inputs.len() => spec.clone(),
            Some(spec) => {
                return Err(BridgeError::argument(format!(
                    "vmap: in_axes has {} entries for {} inputs",
                    spec.len(),
                    inputs.len()
                )))
            }
        };
        let in_axes = in_axes
            .iter()
            .zip(&inputs)
            .map(|(axis, a)| match axis {
                None => Ok(None),
                Some(n) => {
                    let ndim = a.ndim() as i64;
                    let k = if *n < 0 { n + ndim } else { *n };
                    if k < 0 || k >= ndim {
                        return Err(BridgeError::argument(format!(
                            "vmap: in_axes {} out of bounds for input with {} dimensions",
                            n, ndim
                        )));
                    }
                    Ok(Some(k as usize))
                }
            })
            .collect::<BridgeResult<Vec<_>>>()?;
        let mut host = core.host_fn(|arrays| core.call_value(&fun, &host_values(arrays), kwargs));
        let outputs = core.run_engine(|e| e.vmap(&mut host, &inputs, &in_axes, &out_axes))?;
        Ok(convert::project(outputs))
    });
    Ok(Value::Function(handle))
}

fn op_export_function(core: &Core, args: &Args) -> BridgeResult<Value> {
    let path = PathBuf::from(args.text("file")?);
    let fun = callable(args)?;
    let shapeless = args.bool_or("shapeless", false)?;
    let kwargs = Hash::from_pairs(args.extra().iter().map(|(k, v)| (k.clone(), v.clone())));
    let (inputs, names) = export_inputs(core, args.rest(), &kwargs)?;
    let positional = args.rest().len();
    let mut host = core.host_fn(|arrays| call_split(core, &fun, arrays, positional, &names));
    core.run_engine(|e| e.export_function(&path, &mut host, &inputs, &names, shapeless))?;
    Ok(Value::Nil)
}

/// Arrays of a list, or the one array of a non-list; the flag marks the latter
fn array_or_list(core: &Core, value: &Value) -> BridgeResult<(Vec<Array>, bool)> {
    match value {
        Value::List(_) => Ok((convert::to_arrays(core, &convert::list_items(value)?)?, false)),
        other => Ok((vec![convert::to_array(core, other, None)?], true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Proc;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn core() -> Core {
        Core::new(Arc::new(CpuEngine::new()))
    }

    fn floats(values: &[f64]) -> Value {
        Value::list(values.iter().map(|&x| Value::Float(x)).collect())
    }

    /// `sum(x * x)` as a host proc calling back into `core`
    fn sum_of_squares(core: &Core) -> Value {
        let core = core.clone();
        Value::from(Proc::new("sum_of_squares", move |args| {
            let sq = core.call("multiply", vec![args[0].clone(), args[0].clone()])?;
            core.call("sum", vec![sq])
        }))
    }

    fn close_to(core: &Core, value: &Value, expected: &[f64]) {
        let got = value.as_array().unwrap().to_a(core).unwrap();
        let got: Vec<f64> = got.as_list().unwrap().to_vec().iter().map(|v| v.as_float().unwrap()).collect();
        assert_eq!(got.len(), expected.len());
        for (g, e) in got.iter().zip(expected) {
            assert!((g - e).abs() < 1e-2, "{} vs {}", g, e);
        }
    }

    #[test]
    fn test_grad_of_sum_of_squares() {
        let core = core();
        let grad = core.call("grad", vec![sum_of_squares(&core)]).unwrap();
        let out = core.call_value(&grad, &[floats(&[1.0, 2.0])], &Hash::new()).unwrap();
        close_to(&core, &out, &[2.0, 4.0]);
    }

    #[test]
    fn test_value_and_grad_pair() {
        let core = core();
        let f = core.call("value_and_grad", vec![sum_of_squares(&core)]).unwrap();
        let Value::Function(handle) = &f else { panic!("expected a function") };
        assert_eq!(handle.kind(), FunctionKind::ValueAndGrad);
        assert!(!handle.releases_gvl());
        let out = core.call_value(&f, &[floats(&[3.0])], &Hash::new()).unwrap();
        let pair = out.as_list().unwrap();
        assert_eq!(pair.len(), 2);
        assert_eq!(pair.get(0).unwrap().as_array().unwrap().item(&core).unwrap().as_float(), Some(9.0));
    }

    #[test]
    fn test_depends_keeps_input_form() {
        let core = core();
        let x = core.call("array", vec![floats(&[1.0, 2.0])]).unwrap();
        let dep = core.call("array", vec![floats(&[0.0])]).unwrap();
        let single = core.call("depends", vec![x.clone(), dep.clone()]).unwrap();
        assert_eq!(single.as_array().unwrap().to_a(&core).unwrap(), floats(&[1.0, 2.0]));
        let listed = core.call("depends", vec![Value::list(vec![x]), Value::list(vec![dep])]).unwrap();
        assert_eq!(listed.as_list().unwrap().len(), 1);
    }

    #[test]
    fn test_gradients_call_the_host_once() {
        let core = core();
        let calls = std::rc::Rc::new(std::cell::Cell::new(0usize));
        let counted = {
            let (core, calls) = (core.clone(), std::rc::Rc::clone(&calls));
            Value::from(Proc::new("counted", move |args| {
                calls.set(calls.get() + 1);
                let sq = core.call("multiply", vec![args[0].clone(), args[0].clone()])?;
                core.call("sum", vec![sq])
            }))
        };

        let grad = core.call("grad", vec![counted.clone()]).unwrap();
        let out = core.call_value(&grad, &[floats(&[3.0])], &Hash::new()).unwrap();
        close_to(&core, &out, &[6.0]);
        assert_eq!(calls.get(), 1);

        let f = core.call("value_and_grad", vec![counted]).unwrap();
        let out = core.call_value(&f, &[floats(&[3.0])], &Hash::new()).unwrap();
        let pair = out.as_list().unwrap();
        assert_eq!(pair.get(0).unwrap().as_array().unwrap().item(&core).unwrap().as_float(), Some(9.0));
        close_to(&core, &pair.get(1).unwrap(), &[6.0]);
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_grad_requires_scalar_output() {
        let core = core();
        let identity = Value::from(Proc::new("identity", |args| Ok(args[0].clone())));
        let grad = core.call("grad", vec![identity]).unwrap();
        let err = core.call_value(&grad, &[floats(&[1.0, 2.0])], &Hash::new()).unwrap_err();
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_argnums_out_of_range() {
        let core = core();
        let grad = core.call("grad", vec![sum_of_squares(&core), Value::Int(3)]).unwrap();
        let err = core.call_value(&grad, &[floats(&[1.0])], &Hash::new()).unwrap_err();
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_vmap_default_axes() {
        let core = core();
        let f = core.call("vmap", vec![sum_of_squares(&core)]).unwrap();
        let x = Value::list(vec![floats(&[1.0, 2.0]), floats(&[3.0, 4.0])]);
        let out = core.call_value(&f, &[x], &Hash::new()).unwrap();
        close_to(&core, &out, &[5.0, 25.0]);
    }

    #[test]
    fn test_compile_toggles() {
        let core = core();
        assert_eq!(core.call("disable_compile", vec![]).unwrap(), Value::Nil);
        assert!(!core.compile_enabled());
        core.call("enable_compile", vec![]).unwrap();
        assert!(core.compile_enabled());
    }

    #[test]
    fn test_eval_accepts_trees() {
        let core = core();
        let a = core.call("ones", vec![Value::list(vec![Value::Int(2)])]).unwrap();
        let tree = Value::list(vec![a.clone(), Value::hash([("b", a)]), Value::Int(1)]);
        assert_eq!(core.call("eval", vec![tree]).unwrap(), Value::Nil);
    }
}
