//! Value Converter
//!
//! Maps host values to engine values and back, with one promotion policy.
//!
//! ## Host to array
//!
//! - An array handle is used as-is, cast when a dtype is requested
//! - Scalars become rank-0 arrays: booleans as `bool_`, integers as
//!   `int32` (`int64` when out of range), floats as `float32`, complex
//!   numbers as `complex64`
//! - Nested lists are flattened depth-first. The shape comes from the
//!   first element at each depth and every sibling must match it. Values
//!   are gathered in single precision unless `float64` is requested, then
//!   cast to the requested dtype
//!
//! ## Array to host
//!
//! Rank-0 arrays become scalars, everything else nested lists mirroring
//! the shape. Complex arrays have no host form.

use mlx_engine::{Array, Device, DeviceKind, Dtype, DtypeCategory, DtypeLike, HostBuffer, Scalar, Stream};
use num_complex::Complex64 as C64;
use tracing::trace;

use crate::core::Core;
use crate::error::{BridgeError, BridgeResult};
use crate::value::Value;

// ============================================================================
// Host -> Array
// ============================================================================

/// Convert any array-like host value to an engine array
pub fn to_array(core: &Core, value: &Value, dtype: Option<Dtype>) -> BridgeResult<Array> {
    let array = match value {
        Value::Array(handle) => handle.get(),
        Value::List(_) => return list_to_array(core, value, dtype),
        other => {
            let (scalar, natural) = scalar_of(other)?;
            let target = dtype.unwrap_or(natural);
            return Ok(core.engine().from_buffer(scalar.to_buffer(), &[], target)?);
        }
    };
    match dtype {
        Some(d) if d != array.dtype() => Ok(core.engine().astype(&array, d, &core.current_stream())?),
        _ => Ok(array),
    }
}

/// Convert every value of `values`
pub fn to_arrays(core: &Core, values: &[Value]) -> BridgeResult<Vec<Array>> {
    values.iter().map(|v| to_array(core, v, None)).collect()
}

/// Optional array: `nil` is absent
pub fn to_opt_array(core: &Core, value: &Value) -> BridgeResult<Option<Array>> {
    match value {
        Value::Nil => Ok(None),
        v => to_array(core, v, None).map(Some),
    }
}

fn scalar_of(value: &Value) -> BridgeResult<(Scalar, Dtype)> {
    match value {
        Value::Bool(b) => Ok((Scalar::Bool(*b), Dtype::Bool)),
        Value::Int(n) => {
            let natural = if i32::try_from(*n).is_ok() { Dtype::Int32 } else { Dtype::Int64 };
            Ok((Scalar::Int(*n), natural))
        }
        Value::Float(x) => Ok((Scalar::Float(*x), Dtype::Float32)),
        Value::Complex(re, im) => Ok((Scalar::Complex(*re, *im), Dtype::Complex64)),
        other => Err(BridgeError::type_mismatch("Array, List or numeric scalar", other.type_name())),
    }
}

/// Leaves and shape of a rectangular nested list
struct Flattened {
    shape: Vec<usize>,
    leaves: Vec<Scalar>,
    complex: bool,
}

fn flatten_nested(value: &Value) -> BridgeResult<Flattened> {
    let mut shape = Vec::new();
    let mut cursor = value.clone();
    while let Value::List(list) = cursor {
        shape.push(list.len());
        cursor = list.get(0).unwrap_or(Value::Nil);
    }

    let mut out = Flattened {
        shape,
        leaves: Vec::new(),
        complex: false,
    };
    collect_leaves(value, 0, &mut out)?;
    Ok(out)
}

fn collect_leaves(value: &Value, depth: usize, out: &mut Flattened) -> BridgeResult<()> {
    match value {
        Value::List(list) => {
            let expected = out.shape.get(depth).copied();
            if expected != Some(list.len()) {
                return Err(BridgeError::ragged(depth, expected.unwrap_or(0), list.len()));
            }
            for item in list.to_vec() {
                collect_leaves(&item, depth + 1, out)?;
            }
            Ok(())
        }
        leaf => {
            if depth != out.shape.len() {
                return Err(BridgeError::ragged(depth, out.shape[depth], 0));
            }
            let scalar = match leaf {
                Value::Bool(b) => Scalar::Bool(*b),
                Value::Int(n) => Scalar::Int(*n),
                Value::Float(x) => Scalar::Float(*x),
                Value::Complex(re, im) => {
                    out.complex = true;
                    Scalar::Complex(*re, *im)
                }
                other => return Err(BridgeError::type_mismatch("numeric or boolean scalar", other.type_name())),
            };
            out.leaves.push(scalar);
            Ok(())
        }
    }
}

/// Build a nested list as float32 and cast to `dtype`.
///
/// Only a float64 target is built at full precision. Integer targets go
/// through float32 as well, so values past 2^24 lose their low bits.
fn list_to_array(core: &Core, value: &Value, dtype: Option<Dtype>) -> BridgeResult<Array> {
    let flat = flatten_nested(value)?;
    trace!(shape = ?flat.shape, ?dtype, "converting nested list");
    let engine = core.engine();
    let built = if flat.complex {
        let data = flat.leaves.iter().map(|s| match s {
            Scalar::Complex(re, im) => C64::new(*re, *im),
            other => C64::new(other.as_f64(), 0.0),
        });
        engine.from_buffer(HostBuffer::Complex(data.collect()), &flat.shape, Dtype::Complex64)?
    } else if dtype == Some(Dtype::Float64) {
        let data = flat.leaves.iter().map(|s| s.as_f64()).collect();
        return Ok(engine.from_buffer(HostBuffer::Float64(data), &flat.shape, Dtype::Float64)?);
    } else {
        let data = flat.leaves.iter().map(|s| s.as_f64() as f32).collect();
        engine.from_buffer(HostBuffer::Float32(data), &flat.shape, Dtype::Float32)?
    };
    match dtype {
        Some(d) if d != built.dtype() => Ok(engine.astype(&built, d, &core.current_stream())?),
        _ => Ok(built),
    }
}

// ============================================================================
// Array -> Host
// ============================================================================

fn buffer_value(buffer: &HostBuffer, i: usize) -> BridgeResult<Value> {
    let missing = || BridgeError::engine("array buffer is shorter than its shape");
    match buffer {
        HostBuffer::Bool(v) => v.get(i).map(|b| Value::Bool(*b)).ok_or_else(missing),
        HostBuffer::Int(v) => v.get(i).map(|n| Value::Int(*n)).ok_or_else(missing),
        HostBuffer::UInt(v) => v.get(i).map(|n| Value::Int(*n as i64)).ok_or_else(missing),
        HostBuffer::Float32(v) => v.get(i).map(|x| Value::Float(*x as f64)).ok_or_else(missing),
        HostBuffer::Float64(v) => v.get(i).map(|x| Value::Float(*x)).ok_or_else(missing),
        HostBuffer::Complex(_) => Err(BridgeError::unsupported_dtype(Dtype::Complex64, "conversion to host values")),
    }
}

fn read_buffer(core: &Core, array: &Array) -> BridgeResult<HostBuffer> {
    if array.dtype().is_complex() {
        return Err(BridgeError::unsupported_dtype(array.dtype(), "conversion to host values"));
    }
    Ok(core.engine().to_buffer(array)?)
}

/// Nested host value mirroring the array (`to_a`)
pub fn array_to_value(core: &Core, array: &Array) -> BridgeResult<Value> {
    let buffer = read_buffer(core, array)?;
    let mut cursor = 0;
    build_nested(&buffer, array.shape(), &mut cursor)
}

fn build_nested(buffer: &HostBuffer, shape: &[usize], cursor: &mut usize) -> BridgeResult<Value> {
    match shape.split_first() {
        None => {
            let value = buffer_value(buffer, *cursor)?;
            *cursor += 1;
            Ok(value)
        }
        Some((&len, rest)) => {
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(build_nested(buffer, rest, cursor)?);
            }
            Ok(Value::list(items))
        }
    }
}

/// Scalar of a size-1 array
pub fn item(core: &Core, array: &Array) -> BridgeResult<Value> {
    if array.size() != 1 {
        return Err(BridgeError::argument(format!(
            "item can only be called on arrays of size 1, got size {}",
            array.size()
        )));
    }
    buffer_value(&read_buffer(core, array)?, 0)
}

/// One output as a bare array, several as a list
pub fn project(mut outputs: Vec<Array>) -> Value {
    if outputs.len() == 1 {
        if let Some(a) = outputs.pop() {
            return Value::from(a);
        }
    }
    array_list(outputs)
}

/// Outputs as a list, even when there is only one
pub fn array_list(outputs: Vec<Array>) -> Value {
    Value::list(outputs.into_iter().map(Value::from).collect())
}

/// Every array reachable through lists and hash values; other leaves are skipped
pub fn tree_arrays(value: &Value, out: &mut Vec<Array>) {
    match value {
        Value::Array(h) => out.push(h.get()),
        Value::List(list) => list.to_vec().iter().for_each(|v| tree_arrays(v, out)),
        Value::Hash(hash) => hash.entries().iter().for_each(|(_, v)| tree_arrays(v, out)),
        _ => {}
    }
}

/// Arrays returned by a host callback: an array, a scalar, or a list or
/// hash of them
pub fn result_arrays(core: &Core, value: &Value) -> BridgeResult<Vec<Array>> {
    match value {
        Value::Array(h) => Ok(vec![h.get()]),
        Value::List(list) => {
            let mut out = Vec::with_capacity(list.len());
            for item in list.to_vec() {
                out.extend(result_arrays(core, &item)?);
            }
            Ok(out)
        }
        Value::Hash(hash) => {
            let mut out = Vec::with_capacity(hash.len());
            for (_, item) in hash.entries() {
                out.extend(result_arrays(core, &item)?);
            }
            Ok(out)
        }
        v if v.is_scalar() => Ok(vec![to_array(core, v, None)?]),
        other => Err(BridgeError::type_mismatch("Array or List of Array", other.type_name())),
    }
}

// ============================================================================
// Dtypes, devices, streams
// ============================================================================

/// Whether the value names a dtype (handle or recognized tag)
pub fn looks_like_dtype(value: &Value) -> bool {
    match value {
        Value::Dtype(_) => true,
        Value::Str(s) | Value::Symbol(s) => Dtype::from_name(s).is_some(),
        _ => false,
    }
}

pub fn to_dtype(value: &Value) -> BridgeResult<Dtype> {
    match value {
        Value::Dtype(d) => Ok(*d),
        Value::Str(s) | Value::Symbol(s) => {
            Dtype::from_name(s).ok_or_else(|| BridgeError::argument(format!("unknown dtype: {}", s)))
        }
        other => Err(BridgeError::type_mismatch("Dtype", other.type_name())),
    }
}

/// Dtype or category; dtype tags are checked first
pub fn to_dtype_like(value: &Value) -> BridgeResult<DtypeLike> {
    match value {
        Value::Dtype(d) => Ok(DtypeLike::Dtype(*d)),
        Value::Category(c) => Ok(DtypeLike::Category(*c)),
        Value::Str(s) | Value::Symbol(s) => Dtype::from_name(s)
            .map(DtypeLike::Dtype)
            .or_else(|| DtypeCategory::from_name(s).map(DtypeLike::Category))
            .ok_or_else(|| BridgeError::argument(format!("unknown dtype or category: {}", s))),
        other => Err(BridgeError::type_mismatch("Dtype or DtypeCategory", other.type_name())),
    }
}

pub fn to_device(value: &Value) -> BridgeResult<Device> {
    match value {
        Value::Device(d) => Ok(*d),
        Value::Stream(s) => Ok(s.device),
        Value::Str(s) | Value::Symbol(s) => DeviceKind::from_name(s)
            .map(|kind| Device::new(kind, 0))
            .ok_or_else(|| BridgeError::argument(format!("unknown device: {}", s))),
        other => Err(BridgeError::type_mismatch("Device", other.type_name())),
    }
}

/// A stream, or the default stream of a device; `nil` is the current stream
pub fn to_stream(core: &Core, value: &Value) -> BridgeResult<Stream> {
    match value {
        Value::Nil => Ok(core.current_stream()),
        Value::Stream(s) => Ok(*s),
        other => to_device(other).map(|d| core.default_stream(d)),
    }
}

// ============================================================================
// Numbers and lists
// ============================================================================

pub fn to_int(value: &Value) -> BridgeResult<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        other => Err(BridgeError::type_mismatch("Integer", other.type_name())),
    }
}

pub fn to_usize(value: &Value) -> BridgeResult<usize> {
    let n = to_int(value)?;
    usize::try_from(n).map_err(|_| BridgeError::argument(format!("expected a non-negative integer, got {}", n)))
}

pub fn to_float(value: &Value) -> BridgeResult<f64> {
    value
        .as_float()
        .ok_or_else(|| BridgeError::type_mismatch("Float", value.type_name()))
}

/// Booleans; `nil` reads as false
pub fn to_bool(value: &Value) -> BridgeResult<bool> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Nil => Ok(false),
        other => Err(BridgeError::type_mismatch("Boolean", other.type_name())),
    }
}

pub fn to_text(value: &Value) -> BridgeResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| BridgeError::type_mismatch("String", value.type_name()))
}

/// Items of a list value
pub fn list_items(value: &Value) -> BridgeResult<Vec<Value>> {
    match value {
        Value::List(list) => Ok(list.to_vec()),
        other => Err(BridgeError::type_mismatch("List", other.type_name())),
    }
}

pub fn to_int_list(value: &Value) -> BridgeResult<Vec<i64>> {
    list_items(value)?.iter().map(to_int).collect()
}

/// One integer or a list of integers
pub fn to_axes(value: &Value) -> BridgeResult<Vec<i64>> {
    match value {
        Value::Int(n) => Ok(vec![*n]),
        Value::List(_) => to_int_list(value),
        other => Err(BridgeError::type_mismatch("Integer or List of Integer", other.type_name())),
    }
}

/// Shape vector; a single integer is a 1-d shape
pub fn to_shape(value: &Value) -> BridgeResult<Vec<usize>> {
    to_signed_shape(value)?
        .into_iter()
        .map(|d| usize::try_from(d).map_err(|_| BridgeError::argument("shape dimensions must be non-negative")))
        .collect()
}

/// Shape vector that may carry one `-1` to be inferred
pub fn to_signed_shape(value: &Value) -> BridgeResult<Vec<i64>> {
    match value {
        Value::Int(n) => Ok(vec![*n]),
        Value::List(_) => to_int_list(value),
        other => Err(BridgeError::type_mismatch("shape (List of Integer)", other.type_name())),
    }
}

/// Strides may be negative
pub fn to_strides(value: &Value) -> BridgeResult<Vec<i64>> {
    to_signed_shape(value)
}

/// A single integer repeated `arity` times, or a list of exactly `arity` integers
pub fn to_spatial(value: &Value, arity: usize) -> BridgeResult<Vec<usize>> {
    let values = to_spatial_list(value, arity)?;
    if values.len() != arity {
        return Err(BridgeError::argument(format!(
            "expected an integer or {} integers, got {}",
            arity,
            values.len()
        )));
    }
    Ok(values)
}

/// A single integer repeated `arity` times, or a list of any length
pub fn to_spatial_list(value: &Value, arity: usize) -> BridgeResult<Vec<usize>> {
    match value {
        Value::Int(_) => Ok(vec![to_usize(value)?; arity]),
        Value::List(_) => list_items(value)?.iter().map(to_usize).collect(),
        other => Err(BridgeError::type_mismatch("Integer or List of Integer", other.type_name())),
    }
}

// ============================================================================
// Host-visible renderings
// ============================================================================

/// Host value for a dtype or category query result
pub fn dtype_like_value(like: DtypeLike) -> Value {
    match like {
        DtypeLike::Dtype(d) => Value::Dtype(d),
        DtypeLike::Category(c) => Value::Category(c),
    }
}

/// Shape as a host list
pub fn shape_value(shape: &[usize]) -> Value {
    Value::list(shape.iter().map(|&d| Value::from(d)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn core() -> Core {
        Core::new(Arc::new(CpuEngine::with_seed(5)))
    }

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().map(|&n| Value::Int(n)).collect())
    }

    #[test]
    fn test_integer_lists_are_built_in_float32() {
        let core = core();
        let a = to_array(&core, &ints(&[16_777_217]), Some(Dtype::Int64)).unwrap();
        assert_eq!(a.dtype(), Dtype::Int64);
        assert_eq!(array_to_value(&core, &a).unwrap(), ints(&[16_777_216]));
        let exact = to_array(&core, &ints(&[16_777_217]), Some(Dtype::Float64)).unwrap();
        assert_eq!(array_to_value(&core, &exact).unwrap(), Value::list(vec![Value::Float(16_777_217.0)]));
    }

    #[test]
    fn test_nested_list_defaults_to_float32() {
        let core = core();
        let a = to_array(&core, &Value::list(vec![ints(&[1, 2]), ints(&[3, 4])]), None).unwrap();
        assert_eq!(a.shape(), &[2, 2]);
        assert_eq!(a.dtype(), Dtype::Float32);
        let back = array_to_value(&core, &a).unwrap();
        assert_eq!(back, Value::list(vec![ints(&[1, 2]), ints(&[3, 4])]));
    }

    #[test]
    fn test_ragged_and_bad_leaves() {
        let core = core();
        let ragged = Value::list(vec![ints(&[1, 2]), ints(&[3])]);
        assert!(to_array(&core, &ragged, None).unwrap_err().is_ragged());
        let mixed = Value::list(vec![ints(&[1]), Value::Int(2)]);
        assert!(to_array(&core, &mixed, None).unwrap_err().is_ragged());
        let text = Value::list(vec![Value::Int(1), Value::str("x")]);
        assert!(to_array(&core, &text, None).unwrap_err().is_type_error());
    }

    #[test]
    fn test_float64_keeps_precision() {
        let core = core();
        let value = Value::list(vec![Value::Float(0.1), Value::Float(1e-12)]);
        let a = to_array(&core, &value, Some(Dtype::Float64)).unwrap();
        assert_eq!(a.dtype(), Dtype::Float64);
        assert_eq!(array_to_value(&core, &a).unwrap(), value);
    }

    #[test]
    fn test_scalar_inference() {
        let core = core();
        assert_eq!(to_array(&core, &Value::Int(5), None).unwrap().dtype(), Dtype::Int32);
        assert_eq!(to_array(&core, &Value::Int(1 << 40), None).unwrap().dtype(), Dtype::Int64);
        assert_eq!(to_array(&core, &Value::Float(0.5), None).unwrap().dtype(), Dtype::Float32);
        assert_eq!(to_array(&core, &Value::Bool(true), None).unwrap().dtype(), Dtype::Bool);
        let a = to_array(&core, &Value::Int(5), None).unwrap();
        assert_eq!(a.ndim(), 0);
        assert_eq!(item(&core, &a).unwrap(), Value::Int(5));
    }

    #[test]
    fn test_empty_list() {
        let core = core();
        let a = to_array(&core, &Value::list(vec![]), None).unwrap();
        assert_eq!(a.shape(), &[0]);
        assert_eq!(array_to_value(&core, &a).unwrap(), Value::list(vec![]));
    }

    #[test]
    fn test_item_requires_size_one() {
        let core = core();
        let a = to_array(&core, &ints(&[1, 2]), None).unwrap();
        assert!(item(&core, &a).unwrap_err().is_argument_error());
        let c = to_array(&core, &Value::Complex(1.0, 2.0), None).unwrap();
        assert!(item(&core, &c).unwrap_err().is_dtype_error());
    }

    #[test]
    fn test_coercions() {
        assert_eq!(to_dtype(&Value::sym("int16")).unwrap(), Dtype::Int16);
        assert!(to_dtype(&Value::sym("int17")).unwrap_err().is_argument_error());
        assert_eq!(
            to_dtype_like(&Value::sym("floating")).unwrap(),
            DtypeLike::Category(DtypeCategory::Floating)
        );
        assert_eq!(to_axes(&Value::Int(-1)).unwrap(), vec![-1]);
        assert!(to_shape(&ints(&[2, -1])).unwrap_err().is_argument_error());
        assert_eq!(to_strides(&ints(&[-1])).unwrap(), vec![-1]);
        assert_eq!(to_spatial(&Value::Int(2), 3).unwrap(), vec![2, 2, 2]);
        assert!(to_spatial(&ints(&[1, 2, 3]), 2).unwrap_err().is_argument_error());
        assert_eq!(to_device(&Value::sym("gpu")).unwrap(), Device::gpu());
    }
}
