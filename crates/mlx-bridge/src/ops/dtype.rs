//! Dtype and category constants, dtype queries and numeric constants.

use mlx_engine::{finfo, iinfo, issubdtype, Dtype, DtypeCategory};

use crate::convert;
use crate::dispatch::TableBuilder;
use crate::error::BridgeError;
use crate::value::{Hash, Value};

const NUMBERS: &[(&str, f64)] = &[
    ("pi", std::f64::consts::PI),
    ("e", std::f64::consts::E),
    ("euler_gamma", 0.577_215_664_901_532_9),
    ("inf", f64::INFINITY),
    ("nan", f64::NAN),
];

pub(crate) fn register(t: &mut TableBuilder) {
    for d in Dtype::ALL {
        t.admin(d.name(), &[], move |_, _| Ok(Value::Dtype(d)));
    }
    for c in DtypeCategory::ALL {
        t.admin(c.name(), &[], move |_, _| Ok(Value::Category(c)));
    }
    for &(name, x) in NUMBERS {
        t.admin(name, &[], move |_, _| Ok(Value::Float(x)));
    }
    t.admin("newaxis", &[], |_, _| Ok(Value::Nil));

    t.admin("issubdtype", &["a", "b"], |_, args| {
        let a = convert::to_dtype_like(args.required("a")?)?;
        let b = convert::to_dtype_like(args.required("b")?)?;
        Ok(Value::Bool(issubdtype(a, b)))
    });
    t.admin("finfo", &["dtype"], |_, args| {
        let dtype = args.dtype("dtype")?;
        let info = finfo(dtype)
            .ok_or_else(|| BridgeError::argument(format!("finfo: {} is not an inexact type", dtype.name())))?;
        Ok(Value::Hash(Hash::from_pairs([
            ("min", Value::Float(info.min)),
            ("max", Value::Float(info.max)),
            ("eps", Value::Float(info.eps)),
            ("dtype", Value::Dtype(info.dtype)),
        ])))
    });
    t.admin("iinfo", &["dtype"], |_, args| {
        let dtype = args.dtype("dtype")?;
        let info = iinfo(dtype)
            .ok_or_else(|| BridgeError::argument(format!("iinfo: {} is not an integer type", dtype.name())))?;
        Ok(Value::Hash(Hash::from_pairs([
            ("min", limit(info.min)),
            ("max", limit(info.max)),
            ("dtype", Value::Dtype(info.dtype)),
        ])))
    });
}

/// Integer limits past `i64` (the top of uint64) come back as floats
fn limit(n: i128) -> Value {
    i64::try_from(n).map_or(Value::Float(n as f64), Value::Int)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Core;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn core() -> Core {
        Core::new(Arc::new(CpuEngine::new()))
    }

    #[test]
    fn test_constants() {
        let core = core();
        assert_eq!(core.call("float32", vec![]).unwrap(), Value::Dtype(Dtype::Float32));
        assert_eq!(core.call("integer", vec![]).unwrap(), Value::Category(DtypeCategory::Integer));
        assert_eq!(core.call("newaxis", vec![]).unwrap(), Value::Nil);
        assert_eq!(core.call("pi", vec![]).unwrap(), Value::Float(std::f64::consts::PI));
    }

    #[test]
    fn test_issubdtype_mixed_operands() {
        let core = core();
        let yes = core.call("issubdtype", vec![Value::sym("int8"), Value::sym("signedinteger")]).unwrap();
        assert_eq!(yes, Value::Bool(true));
        let no = core
            .call("issubdtype", vec![Value::Category(DtypeCategory::Floating), Value::Dtype(Dtype::Float32)])
            .unwrap();
        assert_eq!(no, Value::Bool(false));
    }

    #[test]
    fn test_iinfo_limits() {
        let core = core();
        let info = core.call("iinfo", vec![Value::sym("int8")]).unwrap();
        let info = info.as_hash().unwrap();
        assert_eq!(info.get("min"), Some(Value::Int(-128)));
        assert_eq!(info.get("max"), Some(Value::Int(127)));
        assert_eq!(limit(u64::MAX as i128), Value::Float(u64::MAX as f64));
    }

    #[test]
    fn test_finfo_rejects_integers() {
        let core = core();
        assert!(core.call("finfo", vec![Value::sym("int32")]).unwrap_err().is_argument_error());
        let info = core.call("finfo", vec![Value::sym("float16")]).unwrap();
        assert_eq!(info.as_hash().unwrap().get("max"), Some(Value::Float(65504.0)));
    }
}
