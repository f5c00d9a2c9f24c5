//! Elementwise math: unary, binary and ternary entries.

use mlx_engine::ops::{linalg, math, shape};
use mlx_engine::{BinaryOp, Dtype, UnaryOp};

use super::{many, one, released};
use crate::dispatch::TableBuilder;
use crate::error::BridgeError;

const UNARY: &[(&str, UnaryOp)] = &[
    ("abs", UnaryOp::Abs),
    ("negative", UnaryOp::Negative),
    ("sign", UnaryOp::Sign),
    ("sqrt", UnaryOp::Sqrt),
    ("rsqrt", UnaryOp::Rsqrt),
    ("square", UnaryOp::Square),
    ("reciprocal", UnaryOp::Reciprocal),
    ("exp", UnaryOp::Exp),
    ("expm1", UnaryOp::Expm1),
    ("log", UnaryOp::Log),
    ("log2", UnaryOp::Log2),
    ("log10", UnaryOp::Log10),
    ("log1p", UnaryOp::Log1p),
    ("sin", UnaryOp::Sin),
    ("cos", UnaryOp::Cos),
    ("tan", UnaryOp::Tan),
    ("arcsin", UnaryOp::ArcSin),
    ("arccos", UnaryOp::ArcCos),
    ("arctan", UnaryOp::ArcTan),
    ("sinh", UnaryOp::Sinh),
    ("cosh", UnaryOp::Cosh),
    ("tanh", UnaryOp::Tanh),
    ("arcsinh", UnaryOp::ArcSinh),
    ("arccosh", UnaryOp::ArcCosh),
    ("arctanh", UnaryOp::ArcTanh),
    ("sigmoid", UnaryOp::Sigmoid),
    ("erf", UnaryOp::Erf),
    ("erfinv", UnaryOp::ErfInv),
    ("floor", UnaryOp::Floor),
    ("ceil", UnaryOp::Ceil),
    ("logical_not", UnaryOp::LogicalNot),
    ("bitwise_invert", UnaryOp::BitwiseInvert),
    ("isnan", UnaryOp::IsNan),
    ("isinf", UnaryOp::IsInf),
    ("isposinf", UnaryOp::IsPosInf),
    ("isneginf", UnaryOp::IsNegInf),
    ("isfinite", UnaryOp::IsFinite),
    ("stop_gradient", UnaryOp::StopGradient),
    ("real", UnaryOp::Real),
    ("imag", UnaryOp::Imag),
    ("conjugate", UnaryOp::Conjugate),
];

const BINARY: &[(&str, BinaryOp)] = &[
    ("floor_divide", BinaryOp::FloorDivide),
    ("remainder", BinaryOp::Remainder),
    ("power", BinaryOp::Power),
    ("maximum", BinaryOp::Maximum),
    ("minimum", BinaryOp::Minimum),
    ("equal", BinaryOp::Equal),
    ("not_equal", BinaryOp::NotEqual),
    ("less", BinaryOp::Less),
    ("less_equal", BinaryOp::LessEqual),
    ("greater", BinaryOp::Greater),
    ("greater_equal", BinaryOp::GreaterEqual),
    ("logical_and", BinaryOp::LogicalAnd),
    ("logical_or", BinaryOp::LogicalOr),
    ("bitwise_and", BinaryOp::BitwiseAnd),
    ("bitwise_or", BinaryOp::BitwiseOr),
    ("bitwise_xor", BinaryOp::BitwiseXor),
    ("left_shift", BinaryOp::LeftShift),
    ("right_shift", BinaryOp::RightShift),
    ("arctan2", BinaryOp::ArcTan2),
    ("logaddexp", BinaryOp::LogAddExp),
];

/// Arithmetic that runs inside a release window
const RELEASED: &[(&str, BinaryOp)] = &[
    ("add", BinaryOp::Add),
    ("subtract", BinaryOp::Subtract),
    ("multiply", BinaryOp::Multiply),
    ("divide", BinaryOp::Divide),
];

pub(crate) fn register(t: &mut TableBuilder) {
    // Unary
    for &(name, op) in UNARY {
        t.op(name, &["a"], move |core, args| {
            let a = args.array(core, "a")?;
            let s = args.stream(core)?;
            one(core, |e| e.unary(op, &a, &s))
        });
    }
    t.alias("conj", "conjugate");
    t.op("degrees", &["a"], |core, args| {
        let a = args.array(core, "a")?;
        let s = args.stream(core)?;
        one(core, |e| math::degrees(e, &a, &s))
    });
    t.op("radians", &["a"], |core, args| {
        let a = args.array(core, "a")?;
        let s = args.stream(core)?;
        one(core, |e| math::radians(e, &a, &s))
    });
    t.op("contiguous", &["a"], |core, args| {
        let a = args.array(core, "a")?;
        let s = args.stream(core)?;
        one(core, |e| e.astype(&a, a.dtype(), &s))
    });
    t.op("round", &["a", "decimals"], |core, args| {
        let a = args.array(core, "a")?;
        let decimals = args.int_or("decimals", 0)?;
        let decimals = i32::try_from(decimals)
            .map_err(|_| BridgeError::argument(format!("round: decimals out of range: {}", decimals)))?;
        let s = args.stream(core)?;
        one(core, |e| e.unary(UnaryOp::Round(decimals), &a, &s))
    });
    t.op("nan_to_num", &["a", "nan", "posinf", "neginf"], |core, args| {
        let a = args.array(core, "a")?;
        let nan = args.float_or("nan", 0.0)?;
        let (posinf, neginf) = (args.opt_float("posinf")?, args.opt_float("neginf")?);
        let s = args.stream(core)?;
        one(core, |e| math::nan_to_num(e, &a, nan, posinf, neginf, &s))
    });
    t.op("to_fp8", &["x"], |core, args| {
        let x = args.array(core, "x")?;
        let s = args.stream(core)?;
        one(core, |e| e.unary(UnaryOp::ToFp8, &x, &s))
    });
    t.op("from_fp8", &["x", "dtype"], |core, args| {
        let x = args.array(core, "x")?;
        let dtype = args.dtype_or("dtype", Dtype::Bfloat16)?;
        let s = args.stream(core)?;
        one(core, |e| math::from_fp8(e, &x, dtype, &s))
    });

    // Binary
    for &(name, op) in RELEASED {
        t.op(name, &["a", "b"], move |core, args| {
            let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
            let s = args.stream(core)?;
            released(core, move |e| e.binary(op, &a, &b, &s))
        });
    }
    for &(name, op) in BINARY {
        t.op(name, &["a", "b"], move |core, args| {
            let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
            let s = args.stream(core)?;
            one(core, |e| e.binary(op, &a, &b, &s))
        });
    }
    t.op("outer", &["a", "b"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let s = args.stream(core)?;
        one(core, |e| shape::outer(e, &a, &b, &s))
    });
    t.op("inner", &["a", "b"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let s = args.stream(core)?;
        one(core, |e| shape::inner(e, &a, &b, &s))
    });
    t.op("kron", &["a", "b"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let s = args.stream(core)?;
        one(core, |e| shape::kron(e, &a, &b, &s))
    });
    t.op("divmod", &["a", "b"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let s = args.stream(core)?;
        many(core, |e| math::divmod(e, &a, &b, &s))
    });
    t.op("isclose", &["a", "b", "rtol", "atol", "equal_nan"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let (rtol, atol) = (args.float_or("rtol", 1e-5)?, args.float_or("atol", 1e-8)?);
        let equal_nan = args.bool_or("equal_nan", false)?;
        let s = args.stream(core)?;
        one(core, |e| math::isclose(e, &a, &b, rtol, atol, equal_nan, &s))
    });
    t.op("allclose", &["a", "b", "rtol", "atol", "equal_nan"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let (rtol, atol) = (args.float_or("rtol", 1e-5)?, args.float_or("atol", 1e-8)?);
        let equal_nan = args.bool_or("equal_nan", false)?;
        let s = args.stream(core)?;
        one(core, |e| math::allclose(e, &a, &b, rtol, atol, equal_nan, &s))
    });
    t.op("array_equal", &["a", "b", "equal_nan"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let equal_nan = args.bool_or("equal_nan", false)?;
        let s = args.stream(core)?;
        one(core, |e| math::array_equal(e, &a, &b, equal_nan, &s))
    });

    // Ternary
    t.op("where", &["condition", "x", "y"], |core, args| {
        let cond = args.array(core, "condition")?;
        let (x, y) = (args.array(core, "x")?, args.array(core, "y")?);
        let s = args.stream(core)?;
        one(core, |e| e.select(&cond, &x, &y, &s))
    });
    t.op("clip", &["a", "a_min", "a_max"], |core, args| {
        let a = args.array(core, "a")?;
        let (lo, hi) = (args.opt_array(core, "a_min")?, args.opt_array(core, "a_max")?);
        if lo.is_none() && hi.is_none() {
            return Err(BridgeError::argument("clip: a_min and a_max cannot both be nil"));
        }
        let s = args.stream(core)?;
        one(core, |e| math::clip(e, &a, lo.as_ref(), hi.as_ref(), &s))
    });
    t.op("addmm", &["c", "a", "b", "alpha", "beta"], |core, args| {
        let c = args.array(core, "c")?;
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let (alpha, beta) = (args.float_or("alpha", 1.0)?, args.float_or("beta", 1.0)?);
        let s = args.stream(core)?;
        one(core, |e| linalg::addmm(e, &c, &a, &b, alpha, beta, &s))
    });
}

#[cfg(test)]
mod tests {
    use crate::core::Core;
    use crate::value::Value;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn floats(values: &[f64]) -> Value {
        Value::list(values.iter().map(|&x| Value::Float(x)).collect())
    }

    #[test]
    fn test_unary_accepts_host_lists() {
        let core = Core::new(Arc::new(CpuEngine::new()));
        let out = core.call("abs", vec![floats(&[-1.5, 2.0])]).unwrap();
        assert_eq!(out.as_array().unwrap().to_a(&core).unwrap(), floats(&[1.5, 2.0]));
    }

    #[test]
    fn test_released_and_held_binaries_agree() {
        let core = Core::new(Arc::new(CpuEngine::new()));
        let sum = core.call("add", vec![floats(&[1.0, 2.0]), Value::Float(1.0)]).unwrap();
        let max = core.call("maximum", vec![floats(&[1.0, 2.0]), Value::Float(1.5)]).unwrap();
        assert_eq!(sum.as_array().unwrap().to_a(&core).unwrap(), floats(&[2.0, 3.0]));
        assert_eq!(max.as_array().unwrap().to_a(&core).unwrap(), floats(&[1.5, 2.0]));
    }

    #[test]
    fn test_clip_needs_one_bound() {
        let core = Core::new(Arc::new(CpuEngine::new()));
        let err = core.call("clip", vec![floats(&[1.0]), Value::Nil, Value::Nil]).unwrap_err();
        assert!(err.is_argument_error());
        let out = core.call("clip", vec![floats(&[-1.0, 3.0]), Value::Float(0.0), Value::Nil]).unwrap();
        assert_eq!(out.as_array().unwrap().to_a(&core).unwrap(), floats(&[0.0, 3.0]));
    }

    #[test]
    fn test_fp8_encode_and_decode() {
        let core = Core::new(Arc::new(CpuEngine::new()));
        let bytes = core.call("to_fp8", vec![floats(&[1.0, -2.0, 1000.0])]).unwrap();
        let ints = Value::list(vec![Value::Int(56), Value::Int(192), Value::Int(126)]);
        assert_eq!(bytes.as_array().unwrap().to_a(&core).unwrap(), ints);
        let back = core.call("from_fp8", vec![bytes.clone(), Value::sym("float32")]).unwrap();
        assert_eq!(back.as_array().unwrap().to_a(&core).unwrap(), floats(&[1.0, -2.0, 448.0]));
        let default = core.call("from_fp8", vec![bytes]).unwrap();
        assert_eq!(default.as_array().unwrap().dtype(), mlx_engine::Dtype::Bfloat16);
    }

    #[test]
    fn test_divmod_returns_pair() {
        let core = Core::new(Arc::new(CpuEngine::new()));
        let out = core.call("divmod", vec![floats(&[7.0]), Value::Float(2.0)]).unwrap();
        assert_eq!(out.as_list().unwrap().len(), 2);
    }
}
