//! Shape manipulation, joining, slicing and gathering.

use mlx_engine::ops::shape::{self, normalize_slice};
use mlx_engine::ops;
use mlx_engine::{Array, PadMode};

use super::{many, one};
use crate::args::Args;
use crate::convert;
use crate::core::Core;
use crate::dispatch::TableBuilder;
use crate::error::{BridgeError, BridgeResult};
use crate::value::Value;

pub(crate) fn register(t: &mut TableBuilder) {
    t.op("reshape", &["a", "shape"], |core, args| {
        let a = args.array(core, "a")?;
        let dims = convert::to_signed_shape(args.required("shape")?)?;
        let s = args.stream(core)?;
        one(core, |e| shape::reshape(e, &a, &dims, &s))
    });
    t.op("flatten", &["a", "start_axis", "end_axis"], |core, args| {
        let a = args.array(core, "a")?;
        let (start, end) = (args.int_or("start_axis", 0)?, args.int_or("end_axis", -1)?);
        let s = args.stream(core)?;
        one(core, |e| shape::flatten(e, &a, start, end, &s))
    });
    t.op("unflatten", &["a", "axis", "shape"], |core, args| {
        let (a, axis) = (args.array(core, "a")?, args.int("axis")?);
        let dims = convert::to_signed_shape(args.required("shape")?)?;
        let s = args.stream(core)?;
        one(core, |e| shape::unflatten(e, &a, axis, &dims, &s))
    });
    t.op("transpose", &["a", "axes"], |core, args| {
        let (a, axes) = (args.array(core, "a")?, args.axes("axes")?);
        let s = args.stream(core)?;
        one(core, |e| shape::transpose(e, &a, axes.as_deref(), &s))
    });
    t.alias("permute_dims", "transpose");
    t.op("swapaxes", &["a", "axis1", "axis2"], |core, args| {
        let a = args.array(core, "a")?;
        let (axis1, axis2) = (args.int("axis1")?, args.int("axis2")?);
        let s = args.stream(core)?;
        one(core, |e| shape::swapaxes(e, &a, axis1, axis2, &s))
    });
    t.op("moveaxis", &["a", "source", "destination"], |core, args| {
        let a = args.array(core, "a")?;
        let (source, destination) = (args.int("source")?, args.int("destination")?);
        let s = args.stream(core)?;
        one(core, |e| shape::moveaxis(e, &a, source, destination, &s))
    });
    t.op("squeeze", &["a", "axis"], |core, args| {
        let (a, axes) = (args.array(core, "a")?, args.axes("axis")?);
        let s = args.stream(core)?;
        one(core, |e| shape::squeeze(e, &a, axes.as_deref(), &s))
    });
    t.op("expand_dims", &["a", "axis"], |core, args| {
        let a = args.array(core, "a")?;
        let axes = convert::to_axes(args.required("axis")?)?;
        let s = args.stream(core)?;
        one(core, |e| shape::expand_dims(e, &a, &axes, &s))
    });
    t.op("broadcast_to", &["a", "shape"], |core, args| {
        let (a, dims) = (args.array(core, "a")?, args.shape("shape")?);
        let s = args.stream(core)?;
        one(core, |e| e.broadcast_to(&a, &dims, &s))
    });
    t.admin("broadcast_shapes", &["*shapes"], |_, args| {
        let mut shapes = args.rest().iter().map(convert::to_shape);
        let Some(first) = shapes.next() else {
            return Err(BridgeError::argument("broadcast_shapes requires at least one shape"));
        };
        let mut out = first?;
        for shape in shapes {
            out = ops::broadcast_shapes("broadcast_shapes", &out, &shape?)?;
        }
        Ok(convert::shape_value(&out))
    });
    t.op("broadcast_arrays", &["*arrays"], |core, args| {
        let arrays = args.rest_arrays(core)?;
        let s = args.stream(core)?;
        many(core, |e| shape::broadcast_arrays(e, &arrays, &s))
    });

    // Joining and splitting
    t.op("concatenate", &["arrays", "axis"], |core, args| {
        let arrays = args.array_list(core, "arrays")?;
        let axis = args.int_or("axis", 0)?;
        let s = args.stream(core)?;
        one(core, |e| shape::concatenate(e, &arrays, axis, &s))
    });
    t.alias("concat", "concatenate");
    t.op("stack", &["arrays", "axis"], |core, args| {
        let arrays = args.array_list(core, "arrays")?;
        let axis = args.int_or("axis", 0)?;
        let s = args.stream(core)?;
        one(core, |e| shape::stack(e, &arrays, axis, &s))
    });
    t.op("split", &["a", "indices_or_sections", "axis"], op_split);
    t.op("pad", &["a", "pad_width", "mode", "constant_values"], op_pad);
    t.op("tile", &["a", "reps"], |core, args| {
        let (a, reps) = (args.array(core, "a")?, args.shape("reps")?);
        let s = args.stream(core)?;
        one(core, |e| shape::tile(e, &a, &reps, &s))
    });
    t.op("repeat", &["a", "repeats", "axis"], |core, args| {
        let (a, repeats) = (args.array(core, "a")?, args.usize("repeats")?);
        let axis = args.axis("axis")?;
        let s = args.stream(core)?;
        one(core, |e| shape::repeat(e, &a, repeats, axis, &s))
    });
    t.op("roll", &["a", "shift", "axis"], |core, args| {
        let a = args.array(core, "a")?;
        let shift = convert::to_axes(args.required("shift")?)?;
        let axes = args.axes("axis")?;
        let s = args.stream(core)?;
        one(core, |e| shape::roll(e, &a, &shift, axes.as_deref(), &s))
    });

    // Diagonals and triangles
    t.op("diag", &["a", "k"], |core, args| {
        let (a, k) = (args.array(core, "a")?, args.int_or("k", 0)?);
        let s = args.stream(core)?;
        one(core, |e| shape::diag(e, &a, k, &s))
    });
    t.op("diagonal", &["a", "offset", "axis1", "axis2"], |core, args| {
        let a = args.array(core, "a")?;
        let offset = args.int_or("offset", 0)?;
        let (axis1, axis2) = (args.int_or("axis1", 0)?, args.int_or("axis2", 1)?);
        let s = args.stream(core)?;
        one(core, |e| shape::diagonal(e, &a, offset, axis1, axis2, &s))
    });
    t.op("trace", &["a", "offset", "axis1", "axis2", "dtype"], |core, args| {
        let a = args.array(core, "a")?;
        let offset = args.int_or("offset", 0)?;
        let (axis1, axis2) = (args.int_or("axis1", 0)?, args.int_or("axis2", 1)?);
        let dtype = args.opt_dtype("dtype")?;
        let s = args.stream(core)?;
        one(core, |e| shape::trace(e, &a, offset, axis1, axis2, dtype, &s))
    });
    t.op("tril", &["a", "k"], |core, args| {
        let (a, k) = (args.array(core, "a")?, args.int_or("k", 0)?);
        let s = args.stream(core)?;
        one(core, |e| shape::tril(e, &a, k, &s))
    });
    t.op("triu", &["a", "k"], |core, args| {
        let (a, k) = (args.array(core, "a")?, args.int_or("k", 0)?);
        let s = args.stream(core)?;
        one(core, |e| shape::triu(e, &a, k, &s))
    });

    // Gathers and scatters
    t.op("take", &["a", "indices", "axis"], |core, args| {
        let (a, indices) = (args.array(core, "a")?, args.array(core, "indices")?);
        let axis = args.axis("axis")?;
        let s = args.stream(core)?;
        one(core, |e| shape::take(e, &a, &indices, axis, &s))
    });
    t.op("take_along_axis", &["a", "indices", "axis"], |core, args| {
        let (a, indices) = (args.array(core, "a")?, args.array(core, "indices")?);
        let axis = args.axis("axis")?;
        let s = args.stream(core)?;
        one(core, |e| shape::take_along_axis(e, &a, &indices, axis, &s))
    });
    t.op("put_along_axis", &["a", "indices", "values", "axis"], |core, args| {
        let (a, indices) = (args.array(core, "a")?, args.array(core, "indices")?);
        let values = args.array(core, "values")?;
        let axis = args.axis("axis")?;
        let s = args.stream(core)?;
        one(core, |e| shape::put_along_axis(e, &a, &indices, &values, axis, &s))
    });
    t.op("slice", &["a", "start", "stop", "strides"], |core, args| {
        let a = args.array(core, "a")?;
        let (start, stop, strides) = slice_bounds(args, &a)?;
        let s = args.stream(core)?;
        one(core, |e| e.slice(&a, &start, &stop, &strides, &s))
    });
    t.op("slice_update", &["a", "update", "start", "stop", "strides"], |core, args| {
        let (a, update) = (args.array(core, "a")?, args.array(core, "update")?);
        let (start, stop, strides) = slice_bounds(args, &a)?;
        let s = args.stream(core)?;
        one(core, |e| e.slice_update(&a, &update, &start, &stop, &strides, &s))
    });
    t.op("as_strided", &["a", "shape", "strides", "offset"], |core, args| {
        let a = args.array(core, "a")?;
        let dims = args.opt_shape("shape")?.unwrap_or_else(|| a.shape().to_vec());
        let strides = match args.get("strides") {
            Some(v) => convert::to_strides(v)?,
            None => row_major_strides(&dims),
        };
        if strides.len() != dims.len() {
            return Err(BridgeError::argument("as_strided: shape and strides must have the same length"));
        }
        let offset = args.usize_or("offset", 0)?;
        let s = args.stream(core)?;
        one(core, |e| e.as_strided(&a, &dims, &strides, offset, &s))
    });

    for (name, ndim) in [("atleast_1d", 1), ("atleast_2d", 2), ("atleast_3d", 3)] {
        t.op(name, &["*arrays"], move |core, args| {
            let arrays = args.rest_arrays(core)?;
            let s = args.stream(core)?;
            let out = core.run_engine(|e| {
                arrays
                    .iter()
                    .map(|a| shape::atleast(e, a, ndim, &s))
                    .collect::<Result<Vec<_>, _>>()
            })?;
            Ok(convert::project(out))
        });
    }

    // Products and views
    t.op("tensordot", &["a", "b", "axes"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let s = args.stream(core)?;
        match args.get("axes") {
            None => one(core, |e| shape::tensordot_n(e, &a, &b, 2, &s)),
            Some(Value::Int(_)) => {
                let n = args.usize("axes")?;
                one(core, |e| shape::tensordot_n(e, &a, &b, n, &s))
            }
            Some(v) => {
                let pair = convert::list_items(v)?;
                let [lhs, rhs] = pair.as_slice() else {
                    return Err(BridgeError::argument("tensordot: axes must be an integer or a pair of axis lists"));
                };
                let (lhs, rhs) = (convert::to_axes(lhs)?, convert::to_axes(rhs)?);
                one(core, |e| shape::tensordot(e, &a, &b, &lhs, &rhs, &s))
            }
        }
    });
    t.op("einsum", &["subscripts", "*operands"], |core, args| {
        let subscripts = args.text("subscripts")?;
        let operands = args.rest_arrays(core)?;
        let s = args.stream(core)?;
        one(core, |e| shape::einsum(e, &subscripts, &operands, &s))
    });
    t.admin("einsum_path", &["subscripts", "*operands"], |core, args| {
        let subscripts = args.text("subscripts")?;
        let operands = args.rest_arrays(core)?;
        let (path, summary) = shape::einsum_path(&subscripts, &operands)?;
        let steps = path
            .iter()
            .map(|step| Value::list(step.iter().map(|&i| Value::from(i)).collect()))
            .collect();
        Ok(Value::list(vec![Value::list(steps), Value::str(&summary)]))
    });
    t.op("view", &["a", "dtype"], |core, args| {
        let (a, dtype) = (args.array(core, "a")?, args.dtype("dtype")?);
        let s = args.stream(core)?;
        one(core, |e| e.view(&a, dtype, &s))
    });
}

/// `split(a, 3)` in equal sections, `split(a, [2, 5])` at indices
fn op_split(core: &Core, args: &Args) -> BridgeResult<Value> {
    let a = args.array(core, "a")?;
    let axis = args.int_or("axis", 0)?;
    let s = args.stream(core)?;
    match args.required("indices_or_sections")? {
        Value::Int(_) => {
            let sections = args.usize("indices_or_sections")?;
            if sections == 0 {
                return Err(BridgeError::argument("split: number of sections must be positive"));
            }
            many(core, |e| shape::split_sections(e, &a, sections, axis, &s))
        }
        v => {
            let indices = convert::to_int_list(v)?;
            many(core, |e| shape::split_indices(e, &a, &indices, axis, &s))
        }
    }
}

/// `pad_width` is `n`, `[lo, hi]` for every axis, or one `[lo, hi]` per axis
fn op_pad(core: &Core, args: &Args) -> BridgeResult<Value> {
    let a = args.array(core, "a")?;
    let (low, high) = pad_widths(args.required("pad_width")?, a.ndim())?;
    let mode = match args.text_or("mode", "constant")?.as_str() {
        "constant" => PadMode::Constant,
        "edge" => PadMode::Edge,
        other => return Err(BridgeError::argument(format!("pad: unsupported mode '{}'", other))),
    };
    let value = match args.get("constant_values") {
        Some(v) => convert::to_array(core, v, Some(a.dtype()))?,
        None => convert::to_array(core, &Value::Int(0), Some(a.dtype()))?,
    };
    let s = args.stream(core)?;
    one(core, |e| e.pad(&a, &low, &high, &value, mode, &s))
}

fn pad_widths(value: &Value, ndim: usize) -> BridgeResult<(Vec<usize>, Vec<usize>)> {
    if let Value::Int(_) = value {
        let n = convert::to_usize(value)?;
        return Ok((vec![n; ndim], vec![n; ndim]));
    }
    let items = convert::list_items(value)?;
    if items.is_empty() {
        return Err(BridgeError::argument("pad: pad_width cannot be empty"));
    }
    let pair = |v: &Value| -> BridgeResult<(usize, usize)> {
        match convert::to_shape(v)?.as_slice() {
            [n] => Ok((*n, *n)),
            [lo, hi] => Ok((*lo, *hi)),
            _ => Err(BridgeError::argument("pad: each pad width must be n or [low, high]")),
        }
    };
    let widths = if items.iter().all(|v| matches!(v, Value::Int(_))) {
        vec![pair(value)?; ndim]
    } else {
        items.iter().map(pair).collect::<BridgeResult<Vec<_>>>()?
    };
    if widths.len() != ndim {
        return Err(BridgeError::argument(format!(
            "pad: expected {} pad widths, got {}",
            ndim,
            widths.len()
        )));
    }
    Ok(widths.into_iter().unzip())
}

/// Start, stop and strides for every axis, normalized like host slices
fn slice_bounds(args: &Args, a: &Array) -> BridgeResult<(Vec<i64>, Vec<i64>, Vec<i64>)> {
    let start = convert::to_int_list(args.required("start")?)?;
    let stop = convert::to_int_list(args.required("stop")?)?;
    let strides = match args.get("strides") {
        Some(v) => convert::to_strides(v)?,
        None => vec![1; a.ndim()],
    };
    if start.len() != a.ndim() || stop.len() != a.ndim() || strides.len() != a.ndim() {
        return Err(BridgeError::argument(format!(
            "{}: start, stop and strides must have {} entries",
            args.op(),
            a.ndim()
        )));
    }
    let mut bounds = (Vec::new(), Vec::new(), Vec::new());
    for (i, &len) in a.shape().iter().enumerate() {
        let (lo, hi, step) = normalize_slice(Some(start[i]), Some(stop[i]), strides[i], len)?;
        bounds.0.push(lo);
        bounds.1.push(hi);
        bounds.2.push(step);
    }
    Ok(bounds)
}

fn row_major_strides(shape: &[usize]) -> Vec<i64> {
    let mut strides = vec![1i64; shape.len()];
    for i in (0..shape.len().saturating_sub(1)).rev() {
        strides[i] = strides[i + 1] * shape[i + 1] as i64;
    }
    strides
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn core() -> Core {
        Core::new(Arc::new(CpuEngine::new()))
    }

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().map(|&n| Value::Int(n)).collect())
    }

    #[test]
    fn test_split_keeps_empty_parts() {
        let core = core();
        let a = core.call("arange", vec![Value::Int(4)]).unwrap();
        let parts = core.call("split", vec![a, ints(&[1, 1])]).unwrap();
        let parts = parts.as_list().unwrap().to_vec();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].as_array().unwrap().shape(), vec![0]);
    }

    #[test]
    fn test_broadcast_shapes_folds_left() {
        let core = core();
        let out = core.call("broadcast_shapes", vec![ints(&[5, 1, 4]), ints(&[1, 3, 1])]).unwrap();
        assert_eq!(out, ints(&[5, 3, 4]));
        let out = core.call("broadcast_shapes", vec![ints(&[2, 1]), ints(&[3]), ints(&[1, 1, 1])]).unwrap();
        assert_eq!(out, ints(&[1, 2, 3]));
        assert!(core.call("broadcast_shapes", vec![]).unwrap_err().is_argument_error());
        assert!(core.call("broadcast_shapes", vec![ints(&[2]), ints(&[3])]).is_err());
    }

    #[test]
    fn test_permute_dims_is_transpose() {
        let core = core();
        let a = core.call("zeros", vec![ints(&[2, 3, 4])]).unwrap();
        let out = core.call("permute_dims", vec![a, ints(&[2, 0, 1])]).unwrap();
        assert_eq!(out.as_array().unwrap().shape(), vec![4, 2, 3]);
    }

    #[test]
    fn test_einsum_path_returns_path_and_summary() {
        let core = core();
        let a = core.call("ones", vec![ints(&[2, 3])]).unwrap();
        let b = core.call("ones", vec![ints(&[3, 4])]).unwrap();
        let out = core.call("einsum_path", vec![Value::str("ij,jk->ik"), a, b]).unwrap();
        let parts = out.as_list().unwrap().to_vec();
        assert_eq!(parts[0], Value::list(vec![ints(&[0, 1])]));
        let Value::Str(summary) = &parts[1] else { panic!("expected a string") };
        assert!(summary.contains("Complete contraction:  ij,jk->ik"));
    }

    #[test]
    fn test_pad_width_forms() {
        assert_eq!(pad_widths(&Value::Int(1), 2).unwrap(), (vec![1, 1], vec![1, 1]));
        assert_eq!(pad_widths(&ints(&[1, 2]), 2).unwrap(), (vec![1, 1], vec![2, 2]));
        let per_axis = Value::list(vec![ints(&[0, 1]), ints(&[2, 3])]);
        assert_eq!(pad_widths(&per_axis, 2).unwrap(), (vec![0, 2], vec![1, 3]));
        assert!(pad_widths(&Value::list(vec![]), 2).unwrap_err().is_argument_error());
    }

    #[test]
    fn test_row_major_strides() {
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(row_major_strides(&[]), Vec::<i64>::new());
    }

    #[test]
    fn test_atleast_projects_single_input() {
        let core = core();
        let one = core.call("atleast_2d", vec![Value::Int(1)]).unwrap();
        assert_eq!(one.as_array().unwrap().shape(), vec![1, 1]);
        let two = core.call("atleast_1d", vec![Value::Int(1), Value::Int(2)]).unwrap();
        assert_eq!(two.as_list().unwrap().len(), 2);
    }
}
