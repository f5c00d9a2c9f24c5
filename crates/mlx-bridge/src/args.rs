//! Call Adapter
//!
//! Binds host positional and keyword arguments to an operation's declared
//! parameter list, then hands out typed values through the coercions in
//! [`crate::convert`].
//!
//! ## Parameter lists
//!
//! - `"name"`: positional-or-keyword
//! - `"*name"`: collects the remaining positional arguments; parameters
//!   after it are keyword-only
//! - `"**name"`: collects keywords no other parameter claims
//!
//! Every optional parameter counts as absent when missing or `nil`.

use indexmap::IndexMap;
use mlx_engine::{Array, Dtype, Stream};
use smol_str::SmolStr;

use crate::convert;
use crate::core::Core;
use crate::error::{BridgeError, BridgeResult};
use crate::value::{Hash, Value};

/// Arguments of one call, bound to parameter names
#[derive(Debug)]
pub struct Args {
    op: &'static str,
    values: IndexMap<&'static str, Value>,
    rest: Vec<Value>,
    extra: Vec<(SmolStr, Value)>,
    stream: Value,
}

/// Whether `key` is a keyword of the parameter list
pub(crate) fn is_keyword(params: &[&'static str], takes_stream: bool, key: &str) -> bool {
    (takes_stream && key == "stream")
        || params.iter().any(|p| (*p == key && !p.starts_with('*')) || p.starts_with("**"))
}

impl Args {
    pub fn bind(
        op: &'static str,
        params: &'static [&'static str],
        positional: Vec<Value>,
        kwargs: &Hash,
        takes_stream: bool,
    ) -> BridgeResult<Self> {
        let mut args = Args {
            op,
            values: IndexMap::new(),
            rest: Vec::new(),
            extra: Vec::new(),
            stream: Value::Nil,
        };

        let slots: Vec<&'static str> = params
            .iter()
            .copied()
            .take_while(|p| !p.starts_with('*'))
            .collect();
        let variadic = params.iter().any(|p| p.starts_with('*') && !p.starts_with("**"));

        let given = positional.len();
        let mut positional = positional.into_iter();
        for &name in &slots {
            match positional.next() {
                Some(v) => {
                    args.values.insert(name, v);
                }
                None => break,
            }
        }
        let leftover: Vec<Value> = positional.collect();
        if !leftover.is_empty() {
            if !variadic {
                return Err(BridgeError::argument(format!(
                    "{}: wrong number of arguments (given {}, expected at most {})",
                    op,
                    given,
                    slots.len()
                )));
            }
            args.rest = leftover;
        }

        let collects_extra = params.iter().any(|p| p.starts_with("**"));
        for (key, value) in kwargs.entries() {
            if takes_stream && key == "stream" {
                args.stream = value;
                continue;
            }
            match params.iter().find(|p| !p.starts_with('*') && **p == key.as_str()) {
                Some(&name) => {
                    if args.values.contains_key(name) {
                        return Err(BridgeError::argument(format!(
                            "{}: got multiple values for argument '{}'",
                            op, name
                        )));
                    }
                    args.values.insert(name, value);
                }
                None if collects_extra => args.extra.push((key, value)),
                None => {
                    return Err(BridgeError::argument(format!("{}: unknown keyword: {}", op, key)));
                }
            }
        }
        Ok(args)
    }

    pub fn op(&self) -> &'static str {
        self.op
    }

    /// Bound value; `nil` counts as absent
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name).filter(|v| !v.is_nil())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn required(&self, name: &str) -> BridgeResult<&Value> {
        self.get(name)
            .ok_or_else(|| BridgeError::argument(format!("{}: missing required argument '{}'", self.op, name)))
    }

    /// Variadic positional arguments
    pub fn rest(&self) -> &[Value] {
        &self.rest
    }

    /// Keywords collected by a `**` parameter
    pub fn extra(&self) -> &[(SmolStr, Value)] {
        &self.extra
    }

    /// Run `coerce` on an optional argument
    pub fn opt<T>(&self, name: &str, coerce: impl FnOnce(&Value) -> BridgeResult<T>) -> BridgeResult<Option<T>> {
        self.get(name).map(coerce).transpose()
    }

    // ---- arrays ----------------------------------------------------------

    pub fn array(&self, core: &Core, name: &str) -> BridgeResult<Array> {
        convert::to_array(core, self.required(name)?, None)
    }

    pub fn opt_array(&self, core: &Core, name: &str) -> BridgeResult<Option<Array>> {
        self.opt(name, |v| convert::to_array(core, v, None))
    }

    /// Arrays given as one list argument
    pub fn array_list(&self, core: &Core, name: &str) -> BridgeResult<Vec<Array>> {
        convert::to_arrays(core, &convert::list_items(self.required(name)?)?)
    }

    /// Variadic arrays
    pub fn rest_arrays(&self, core: &Core) -> BridgeResult<Vec<Array>> {
        convert::to_arrays(core, &self.rest)
    }

    // ---- numbers -----------------------------------------------------------

    pub fn int(&self, name: &str) -> BridgeResult<i64> {
        convert::to_int(self.required(name)?)
    }

    pub fn opt_int(&self, name: &str) -> BridgeResult<Option<i64>> {
        self.opt(name, convert::to_int)
    }

    pub fn int_or(&self, name: &str, default: i64) -> BridgeResult<i64> {
        Ok(self.opt_int(name)?.unwrap_or(default))
    }

    pub fn usize(&self, name: &str) -> BridgeResult<usize> {
        convert::to_usize(self.required(name)?)
    }

    pub fn opt_usize(&self, name: &str) -> BridgeResult<Option<usize>> {
        self.opt(name, convert::to_usize)
    }

    pub fn usize_or(&self, name: &str, default: usize) -> BridgeResult<usize> {
        Ok(self.opt_usize(name)?.unwrap_or(default))
    }

    pub fn float(&self, name: &str) -> BridgeResult<f64> {
        convert::to_float(self.required(name)?)
    }

    pub fn opt_float(&self, name: &str) -> BridgeResult<Option<f64>> {
        self.opt(name, convert::to_float)
    }

    pub fn float_or(&self, name: &str, default: f64) -> BridgeResult<f64> {
        Ok(self.opt_float(name)?.unwrap_or(default))
    }

    pub fn bool_or(&self, name: &str, default: bool) -> BridgeResult<bool> {
        Ok(self.opt(name, convert::to_bool)?.unwrap_or(default))
    }

    // ---- dtypes, shapes, axes --------------------------------------------------

    pub fn dtype(&self, name: &str) -> BridgeResult<Dtype> {
        convert::to_dtype(self.required(name)?)
    }

    pub fn opt_dtype(&self, name: &str) -> BridgeResult<Option<Dtype>> {
        self.opt(name, convert::to_dtype)
    }

    pub fn dtype_or(&self, name: &str, default: Dtype) -> BridgeResult<Dtype> {
        Ok(self.opt_dtype(name)?.unwrap_or(default))
    }

    /// One integer or a list of integers
    pub fn axes(&self, name: &str) -> BridgeResult<Option<Vec<i64>>> {
        self.opt(name, convert::to_axes)
    }

    /// A single axis
    pub fn axis(&self, name: &str) -> BridgeResult<Option<i64>> {
        self.opt_int(name)
    }

    pub fn shape(&self, name: &str) -> BridgeResult<Vec<usize>> {
        convert::to_shape(self.required(name)?)
    }

    pub fn opt_shape(&self, name: &str) -> BridgeResult<Option<Vec<usize>>> {
        self.opt(name, convert::to_shape)
    }

    pub fn text(&self, name: &str) -> BridgeResult<String> {
        convert::to_text(self.required(name)?)
    }

    pub fn text_or(&self, name: &str, default: &str) -> BridgeResult<String> {
        Ok(self.opt(name, convert::to_text)?.unwrap_or_else(|| default.to_string()))
    }

    /// Stream named by the `stream:` keyword, or the current default
    pub fn stream(&self, core: &Core) -> BridgeResult<Stream> {
        convert::to_stream(core, &self.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PARAMS: &[&str] = &["a", "axis", "keepdims"];

    #[test]
    fn test_positional_and_keyword_binding() {
        let kwargs = Hash::from_pairs([("keepdims", Value::Bool(true))]);
        let args = Args::bind("sum", PARAMS, vec![Value::Int(1), Value::Int(0)], &kwargs, true).unwrap();
        assert_eq!(args.axes("axis").unwrap(), Some(vec![0]));
        assert!(args.bool_or("keepdims", false).unwrap());
    }

    #[test]
    fn test_nil_is_absent() {
        let args = Args::bind("sum", PARAMS, vec![Value::Int(1), Value::Nil], &Hash::new(), true).unwrap();
        assert_eq!(args.axes("axis").unwrap(), None);
        assert!(args.required("axis").unwrap_err().is_argument_error());
    }

    #[test]
    fn test_binding_errors() {
        let too_many = Args::bind("sum", PARAMS, vec![Value::Nil; 4], &Hash::new(), true);
        assert!(too_many.unwrap_err().is_argument_error());

        let twice = Hash::from_pairs([("a", Value::Int(1))]);
        assert!(Args::bind("sum", PARAMS, vec![Value::Int(1)], &twice, true).is_err());

        let unknown = Hash::from_pairs([("axes", Value::Int(1))]);
        let err = Args::bind("sum", PARAMS, vec![], &unknown, true).unwrap_err();
        assert_eq!(err.to_string(), "sum: unknown keyword: axes");
    }

    #[test]
    fn test_variadic_and_extra() {
        const EXPORT: &[&str] = &["file", "fun", "*args", "shapeless", "**kwargs"];
        let kwargs = Hash::from_pairs([("shapeless", Value::Bool(true)), ("y", Value::Int(2))]);
        let args = Args::bind("export_function", EXPORT, vec![Value::Nil, Value::Nil, Value::Int(1)], &kwargs, false).unwrap();
        assert_eq!(args.rest(), &[Value::Int(1)]);
        assert_eq!(args.extra().len(), 1);
        assert!(args.bool_or("shapeless", false).unwrap());
    }

    #[test]
    fn test_stream_keyword_only_when_taken() {
        let kwargs = Hash::from_pairs([("stream", Value::sym("cpu"))]);
        assert!(Args::bind("cpu", &[], vec![], &kwargs, false).is_err());
        assert!(is_keyword(PARAMS, true, "stream"));
        assert!(!is_keyword(PARAMS, false, "stream"));
    }
}
