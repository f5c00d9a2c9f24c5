//! Array handle methods.
//!
//! Accessors, conversion, indexing and operator sugar on [`ArrayHandle`].
//! Operators route through the dispatch table so they bind and fail
//! exactly like the named operations.

use mlx_engine::ops::shape::normalize_slice;
use mlx_engine::{Array, Dtype};

use crate::convert;
use crate::core::Core;
use crate::error::{BridgeError, BridgeResult};
use crate::handles::ArrayHandle;
use crate::value::{RangeValue, Value};

/// Operator symbol to operation name
const OPERATORS: &[(&str, &str)] = &[
    ("+", "add"),
    ("-", "subtract"),
    ("*", "multiply"),
    ("/", "divide"),
    ("//", "floor_divide"),
    ("%", "remainder"),
    ("**", "power"),
    ("@", "matmul"),
    ("==", "equal"),
    ("!=", "not_equal"),
    ("<", "less"),
    ("<=", "less_equal"),
    (">", "greater"),
    (">=", "greater_equal"),
    ("&", "bitwise_and"),
    ("|", "bitwise_or"),
    ("^", "bitwise_xor"),
    ("<<", "left_shift"),
    (">>", "right_shift"),
];

/// One resolved index along an axis
enum Selector {
    Single(i64),
    Range(i64, i64, i64),
}

impl ArrayHandle {
    pub fn shape(&self) -> Vec<usize> {
        self.get().shape().to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.get().ndim()
    }

    pub fn size(&self) -> usize {
        self.get().size()
    }

    pub fn dtype(&self) -> Dtype {
        self.get().dtype()
    }

    pub fn itemsize(&self) -> usize {
        self.get().itemsize()
    }

    pub fn nbytes(&self) -> usize {
        self.get().nbytes()
    }

    /// Host scalar of a size-1 array
    pub fn item(&self, core: &Core) -> BridgeResult<Value> {
        convert::item(core, &self.get())
    }

    /// Scalar for rank 0, nested lists otherwise
    pub fn to_a(&self, core: &Core) -> BridgeResult<Value> {
        convert::array_to_value(core, &self.get())
    }

    pub fn astype(&self, core: &Core, dtype: Dtype) -> BridgeResult<ArrayHandle> {
        let a = self.get();
        let s = core.current_stream();
        let cast = core.run_engine(|e| e.astype(&a, dtype, &s))?;
        Ok(ArrayHandle::new(cast))
    }

    // ========================================================================
    // Indexing
    // ========================================================================

    /// `a[i, j, ...]`
    ///
    /// Integers select and drop an axis, ranges slice it, `nil` inserts a
    /// new axis, arrays and lists gather along it.
    pub fn index(&self, core: &Core, indices: &[Value]) -> BridgeResult<Value> {
        let mut a = self.get();
        check_index_count(&a, indices)?;
        let s = core.current_stream();
        let mut axis = 0;
        for index in indices {
            match index {
                Value::Nil => {
                    a = core.run_engine(|e| mlx_engine::ops::shape::expand_dims(e, &a, &[axis as i64], &s))?;
                    axis += 1;
                }
                Value::Int(_) | Value::Range(_) => {
                    let len = a.shape()[axis];
                    let selector = selector(index, axis, len)?;
                    let (start, stop, strides) = full_slice(&a, axis, &selector);
                    let sliced = core.run_engine(|e| e.slice(&a, &start, &stop, &strides, &s))?;
                    a = match selector {
                        Selector::Single(_) => {
                            let mut shape = sliced.shape().to_vec();
                            shape.remove(axis);
                            core.run_engine(|e| e.reshape(&sliced, &shape, &s))?
                        }
                        Selector::Range(..) => {
                            axis += 1;
                            sliced
                        }
                    };
                }
                Value::Array(_) | Value::List(_) => {
                    let mut idx = convert::to_array(core, index, None)?;
                    if !idx.dtype().is_integer() {
                        idx = core.run_engine(|e| e.astype(&idx, Dtype::Int32, &s))?;
                    }
                    a = core.run_engine(|e| e.take(&a, &idx, axis, &s))?;
                    axis += idx.ndim();
                }
                other => {
                    return Err(BridgeError::type_mismatch(
                        "Integer, Range, nil, Array or List",
                        other.type_name(),
                    ))
                }
            }
        }
        Ok(Value::from(a))
    }

    /// `a[i, j, ...] = value`; rebinds the handle to the updated array
    pub fn set_index(&self, core: &Core, indices: &[Value], value: &Value) -> BridgeResult<()> {
        let a = self.get();
        check_index_count(&a, indices)?;
        let s = core.current_stream();

        let mut start: Vec<i64> = vec![0; a.ndim()];
        let mut stop: Vec<i64> = a.shape().iter().map(|&d| d as i64).collect();
        let mut strides: Vec<i64> = vec![1; a.ndim()];
        let mut region = a.shape().to_vec();
        let mut kept = Vec::with_capacity(a.ndim());
        for (axis, len) in a.shape().iter().copied().enumerate() {
            match indices.get(axis) {
                Some(index @ (Value::Int(_) | Value::Range(_))) => match selector(index, axis, len)? {
                    Selector::Single(i) => {
                        start[axis] = i;
                        stop[axis] = i + 1;
                        region[axis] = 1;
                    }
                    Selector::Range(lo, hi, step) => {
                        start[axis] = lo;
                        stop[axis] = hi;
                        strides[axis] = step;
                        region[axis] = range_len(lo, hi, step);
                        kept.push(region[axis]);
                    }
                },
                Some(other) => {
                    return Err(BridgeError::type_mismatch("Integer or Range", other.type_name()));
                }
                None => kept.push(len),
            }
        }

        let update = convert::to_array(core, value, Some(a.dtype()))?;
        let updated = core.run_engine(|e| {
            let update = e.broadcast_to(&update, &kept, &s)?;
            let update = e.reshape(&update, &region, &s)?;
            e.slice_update(&a, &update, &start, &stop, &strides, &s)
        })?;
        self.set(updated);
        Ok(())
    }

    // ========================================================================
    // Rendering and operators
    // ========================================================================

    /// `array([...], dtype=float32)`
    pub fn inspect(&self, core: &Core) -> String {
        let a = self.get();
        match convert::array_to_value(core, &a) {
            Ok(values) => format!("array({}, dtype={})", values, a.dtype()),
            Err(_) => format!("array(shape={:?}, dtype={})", a.shape(), a.dtype()),
        }
    }

    /// Apply a binary operator symbol such as `+` or `<=`
    pub fn operator(&self, core: &Core, symbol: &str, other: &Value) -> BridgeResult<Value> {
        let name = OPERATORS
            .iter()
            .find(|(sym, _)| *sym == symbol)
            .map(|(_, name)| *name)
            .ok_or_else(|| BridgeError::argument(format!("undefined operator '{}' for Array", symbol)))?;
        core.call(name, vec![Value::Array(self.clone()), other.clone()])
    }

    /// Unary minus
    pub fn neg(&self, core: &Core) -> BridgeResult<Value> {
        core.call("negative", vec![Value::Array(self.clone())])
    }

    /// Bitwise inversion (`~`)
    pub fn invert(&self, core: &Core) -> BridgeResult<Value> {
        core.call("bitwise_invert", vec![Value::Array(self.clone())])
    }
}

fn check_index_count(a: &Array, indices: &[Value]) -> BridgeResult<()> {
    let used = indices.iter().filter(|v| !v.is_nil()).count();
    if used > a.ndim() {
        return Err(BridgeError::argument(format!(
            "too many indices for array: array is {}-dimensional, but {} were indexed",
            a.ndim(),
            used
        )));
    }
    Ok(())
}

fn selector(index: &Value, axis: usize, len: usize) -> BridgeResult<Selector> {
    match index {
        Value::Int(i) => {
            let n = len as i64;
            let wrapped = if *i < 0 { i + n } else { *i };
            if wrapped < 0 || wrapped >= n {
                return Err(BridgeError::index_range(*i, axis, len));
            }
            Ok(Selector::Single(wrapped))
        }
        Value::Range(r) => {
            let (lo, hi, step) = normalize_slice(r.start, range_stop(r), 1, len)?;
            Ok(Selector::Range(lo, hi, step))
        }
        other => Err(BridgeError::type_mismatch("Integer or Range", other.type_name())),
    }
}

/// Exclusive stop of a host range; `a..=-1` and `a..=i64::MAX` run to the end
fn range_stop(r: &RangeValue) -> Option<i64> {
    match (r.end, r.exclusive) {
        (None, _) => None,
        (Some(end), true) => Some(end),
        (Some(-1), false) => None,
        (Some(end), false) => end.checked_add(1),
    }
}

fn full_slice(a: &Array, axis: usize, selector: &Selector) -> (Vec<i64>, Vec<i64>, Vec<i64>) {
    let mut start = vec![0i64; a.ndim()];
    let mut stop: Vec<i64> = a.shape().iter().map(|&d| d as i64).collect();
    let mut strides = vec![1i64; a.ndim()];
    match *selector {
        Selector::Single(i) => {
            start[axis] = i;
            stop[axis] = i + 1;
        }
        Selector::Range(lo, hi, step) => {
            start[axis] = lo;
            stop[axis] = hi;
            strides[axis] = step;
        }
    }
    (start, stop, strides)
}

fn range_len(lo: i64, hi: i64, step: i64) -> usize {
    let span = if step > 0 { hi - lo } else { lo - hi };
    let step = step.abs();
    if span <= 0 {
        0
    } else {
        ((span + step - 1) / step) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn core() -> Core {
        Core::new(Arc::new(CpuEngine::with_seed(2)))
    }

    fn handle(core: &Core, value: Value) -> ArrayHandle {
        ArrayHandle::new(convert::to_array(core, &value, Some(Dtype::Int32)).unwrap())
    }

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().map(|&n| Value::Int(n)).collect())
    }

    #[test]
    fn test_negative_index_wraps() {
        let core = core();
        let a = handle(&core, ints(&[10, 11, 12, 13, 14]));
        let last = a.index(&core, &[Value::Int(-1)]).unwrap();
        assert_eq!(last.as_array().unwrap().item(&core).unwrap(), Value::Int(14));
        let err = a.index(&core, &[Value::Int(-6)]).unwrap_err();
        assert!(err.is_index_error());
    }

    #[test]
    fn test_range_and_newaxis() {
        let core = core();
        let a = handle(&core, ints(&[0, 1, 2, 3, 4]));
        let mid = a.index(&core, &[Value::Range(RangeValue::exclusive(1, 3))]).unwrap();
        assert_eq!(mid.as_array().unwrap().to_a(&core).unwrap(), ints(&[1, 2]));
        let tail = a.index(&core, &[Value::Range(RangeValue::inclusive(3, -1))]).unwrap();
        assert_eq!(tail.as_array().unwrap().to_a(&core).unwrap(), ints(&[3, 4]));
        let row = a.index(&core, &[Value::Nil]).unwrap();
        assert_eq!(row.as_array().unwrap().shape(), vec![1, 5]);
    }

    #[test]
    fn test_inclusive_range_to_max_runs_to_end() {
        let core = core();
        let a = handle(&core, ints(&[0, 1, 2, 3, 4]));
        let tail = a.index(&core, &[Value::Range(RangeValue::inclusive(2, i64::MAX))]).unwrap();
        assert_eq!(tail.as_array().unwrap().to_a(&core).unwrap(), ints(&[2, 3, 4]));
    }

    #[test]
    fn test_too_many_indices() {
        let core = core();
        let a = handle(&core, ints(&[1, 2]));
        let err = a.index(&core, &[Value::Int(0), Value::Int(0)]).unwrap_err();
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_set_index_rebinds() {
        let core = core();
        let a = handle(&core, Value::list(vec![ints(&[1, 2]), ints(&[3, 4])]));
        let alias = a.clone();
        a.set_index(&core, &[Value::Int(-1)], &Value::Int(9)).unwrap();
        let expected = Value::list(vec![ints(&[1, 2]), ints(&[9, 9])]);
        assert_eq!(alias.to_a(&core).unwrap(), expected);
    }

    #[test]
    fn test_inspect_and_operators() {
        let core = core();
        let a = handle(&core, ints(&[1, 2]));
        assert_eq!(a.inspect(&core), "array([1, 2], dtype=int32)");
        let sum = a.operator(&core, "+", &Value::Int(1)).unwrap();
        assert_eq!(sum.as_array().unwrap().to_a(&core).unwrap(), ints(&[2, 3]));
        assert!(a.operator(&core, "<=>", &Value::Int(1)).unwrap_err().is_argument_error());
    }
}
