//! Matrix products, quantization and the `linalg` decompositions.
//!
//! Decompositions with several outputs return a host list in the order the
//! engine produces them: `qr` gives `[q, r]`, `svd` gives `[u, s, vt]`,
//! `lu` gives `[p, l, u]`, `eig` and `eigh` give `[values, vectors]`.

use mlx_engine::ops::linalg::{self, NormOrd, QuantParams};
use mlx_engine::{LinalgOp, QuantMode};

use super::{many, one, released};
use crate::args::Args;
use crate::core::Core;
use crate::dispatch::TableBuilder;
use crate::error::{BridgeError, BridgeResult};
use crate::value::Value;

/// Single-input factorizations with one output
const SINGLE: &[(&str, LinalgOp)] = &[("inv", LinalgOp::Inv), ("pinv", LinalgOp::Pinv), ("eigvals", LinalgOp::EigVals)];

/// Single-input factorizations returning a list
const MULTI: &[(&str, LinalgOp)] = &[
    ("qr", LinalgOp::Qr),
    ("lu", LinalgOp::Lu),
    ("lu_factor", LinalgOp::LuFactor),
    ("eig", LinalgOp::Eig),
];

pub(crate) fn register(t: &mut TableBuilder) {
    // Products
    t.op("matmul", &["a", "b"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let s = args.stream(core)?;
        released(core, move |e| e.matmul(&a, &b, &s))
    });
    t.op(
        "block_masked_mm",
        &["a", "b", "block_size", "mask_out", "mask_lhs", "mask_rhs"],
        |core, args| {
            let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
            let block_size = args.usize_or("block_size", 64)?;
            let mask_out = args.opt_array(core, "mask_out")?;
            let mask_lhs = args.opt_array(core, "mask_lhs")?;
            let mask_rhs = args.opt_array(core, "mask_rhs")?;
            let s = args.stream(core)?;
            one(core, |e| {
                linalg::block_masked_mm(
                    e,
                    &a,
                    &b,
                    block_size,
                    mask_out.as_ref(),
                    mask_lhs.as_ref(),
                    mask_rhs.as_ref(),
                    &s,
                )
            })
        },
    );
    t.op("gather_mm", &["a", "b", "lhs_indices", "rhs_indices", "sorted_indices"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let lhs = args.opt_array(core, "lhs_indices")?;
        let rhs = args.opt_array(core, "rhs_indices")?;
        let _sorted = args.bool_or("sorted_indices", false)?;
        let s = args.stream(core)?;
        one(core, |e| linalg::gather_mm(e, &a, &b, lhs.as_ref(), rhs.as_ref(), &s))
    });
    t.op("segmented_mm", &["a", "b", "segments"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let segments = args.array(core, "segments")?;
        let s = args.stream(core)?;
        one(core, |e| linalg::segmented_mm(e, &a, &b, &segments, &s))
    });
    t.op("hadamard_transform", &["a", "scale"], |core, args| {
        let (a, scale) = (args.array(core, "a")?, args.opt_float("scale")?);
        let s = args.stream(core)?;
        one(core, |e| linalg::hadamard_transform(e, &a, scale, &s))
    });

    // Quantization
    t.op("quantize", &["w", "group_size", "bits", "mode"], |core, args| {
        let w = args.array(core, "w")?;
        let q = quant_params(args, QuantMode::Affine)?;
        let s = args.stream(core)?;
        many(core, |e| e.quantize(&w, q.group_size, q.bits, q.mode, &s))
    });
    t.op(
        "dequantize",
        &["w", "scales", "biases", "group_size", "bits", "mode", "dtype"],
        |core, args| {
            let (w, scales) = (args.array(core, "w")?, args.array(core, "scales")?);
            let biases = args.opt_array(core, "biases")?;
            let q = quant_params(args, QuantMode::Affine)?;
            let dtype = args.opt_dtype("dtype")?;
            let s = args.stream(core)?;
            one(core, |e| e.dequantize(&w, &scales, biases.as_ref(), q.group_size, q.bits, q.mode, dtype, &s))
        },
    );
    t.op(
        "quantized_matmul",
        &["x", "w", "scales", "biases", "transpose", "group_size", "bits", "mode"],
        |core, args| {
            let (x, w, scales) = (args.array(core, "x")?, args.array(core, "w")?, args.array(core, "scales")?);
            let biases = args.opt_array(core, "biases")?;
            let transpose = args.bool_or("transpose", true)?;
            let q = quant_params(args, QuantMode::Affine)?;
            let s = args.stream(core)?;
            one(core, |e| linalg::quantized_matmul(e, &x, &w, &scales, biases.as_ref(), transpose, q, &s))
        },
    );
    t.op(
        "gather_qmm",
        &[
            "x",
            "w",
            "scales",
            "biases",
            "lhs_indices",
            "rhs_indices",
            "transpose",
            "group_size",
            "bits",
            "mode",
            "sorted_indices",
        ],
        |core, args| {
            let (x, w, scales) = (args.array(core, "x")?, args.array(core, "w")?, args.array(core, "scales")?);
            let biases = args.opt_array(core, "biases")?;
            let lhs = args.opt_array(core, "lhs_indices")?;
            let rhs = args.opt_array(core, "rhs_indices")?;
            let transpose = args.bool_or("transpose", true)?;
            let q = quant_params(args, QuantMode::Affine)?;
            let _sorted = args.bool_or("sorted_indices", false)?;
            let s = args.stream(core)?;
            one(core, |e| {
                linalg::gather_qmm(
                    e,
                    &x,
                    &w,
                    &scales,
                    biases.as_ref(),
                    lhs.as_ref(),
                    rhs.as_ref(),
                    transpose,
                    q,
                    &s,
                )
            })
        },
    );
    t.op("qqmm", &["x", "w", "scales", "group_size", "bits", "mode"], |core, args| {
        let (x, w, scales) = (args.array(core, "x")?, args.array(core, "w")?, args.array(core, "scales")?);
        let q = quant_params(args, QuantMode::Nvfp4)?;
        let s = args.stream(core)?;
        one(core, |e| linalg::qqmm(e, &x, &w, &scales, q, &s))
    });

    // Norms and products of vectors
    t.op("norm", &["a", "ord", "axis", "keepdims"], |core, args| {
        let a = args.array(core, "a")?;
        let ord = args.opt("ord", norm_ord)?;
        let axes = args.axes("axis")?;
        let keepdims = args.bool_or("keepdims", false)?;
        let s = args.stream(core)?;
        one(core, |e| linalg::norm(e, &a, ord, axes.as_deref(), keepdims, &s))
    });
    t.op("cross", &["a", "b", "axis"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let axis = args.int_or("axis", -1)?;
        let s = args.stream(core)?;
        one(core, |e| linalg::cross(e, &a, &b, axis, &s))
    });

    // Decompositions
    for &(name, op) in SINGLE {
        t.op(name, &["a"], move |core, args| factor_one(core, args, op));
    }
    for &(name, op) in MULTI {
        t.op(name, &["a"], move |core, args| {
            let a = args.array(core, "a")?;
            let s = args.stream(core)?;
            many(core, |e| e.linalg(op, &[a], &s))
        });
    }
    t.op("tri_inv", &["a", "upper"], |core, args| {
        let upper = args.bool_or("upper", false)?;
        factor_one(core, args, LinalgOp::TriInv { upper })
    });
    t.op("cholesky", &["a", "upper"], |core, args| {
        let upper = args.bool_or("upper", false)?;
        factor_one(core, args, LinalgOp::Cholesky { upper })
    });
    t.op("cholesky_inv", &["a", "upper"], |core, args| {
        let upper = args.bool_or("upper", false)?;
        factor_one(core, args, LinalgOp::CholeskyInv { upper })
    });
    t.op("svd", &["a", "compute_uv"], |core, args| {
        let a = args.array(core, "a")?;
        let compute_uv = args.bool_or("compute_uv", true)?;
        let s = args.stream(core)?;
        let outputs = core.run_engine(|e| e.linalg(LinalgOp::Svd { compute_uv }, &[a], &s))?;
        Ok(if compute_uv {
            crate::convert::array_list(outputs)
        } else {
            crate::convert::project(outputs)
        })
    });
    t.op("eigh", &["a", "uplo"], |core, args| {
        let a = args.array(core, "a")?;
        let upper = uplo(args)?;
        let s = args.stream(core)?;
        many(core, |e| e.linalg(LinalgOp::Eigh { upper }, &[a], &s))
    });
    t.op("eigvalsh", &["a", "uplo"], |core, args| {
        let upper = uplo(args)?;
        factor_one(core, args, LinalgOp::EigvalsH { upper })
    });

    // Solves
    t.op("solve", &["a", "b"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let s = args.stream(core)?;
        first(core, LinalgOp::Solve, vec![a, b], &s)
    });
    t.op("solve_triangular", &["a", "b", "upper"], |core, args| {
        let (a, b) = (args.array(core, "a")?, args.array(core, "b")?);
        let upper = args.bool_or("upper", false)?;
        let s = args.stream(core)?;
        first(core, LinalgOp::SolveTriangular { upper }, vec![a, b], &s)
    });
}

fn factor_one(core: &Core, args: &Args, op: LinalgOp) -> BridgeResult<Value> {
    let a = args.array(core, "a")?;
    let s = args.stream(core)?;
    first(core, op, vec![a], &s)
}

fn first(core: &Core, op: LinalgOp, inputs: Vec<mlx_engine::Array>, s: &mlx_engine::Stream) -> BridgeResult<Value> {
    let outputs = core.run_engine(|e| e.linalg(op, &inputs, s))?;
    outputs
        .into_iter()
        .next()
        .map(Value::from)
        .ok_or_else(|| BridgeError::engine(format!("{}: engine returned no outputs", op.name())))
}

/// `group_size`, `bits` and `mode` with per-mode defaults
fn quant_params(args: &Args, default_mode: QuantMode) -> BridgeResult<QuantParams> {
    let mode = match args.get("mode") {
        None | Some(Value::Nil) => default_mode,
        Some(v) => {
            let name = crate::convert::to_text(v)?;
            QuantMode::from_name(&name)
                .ok_or_else(|| BridgeError::argument(format!("{}: unknown quantization mode '{}'", args.op(), name)))?
        }
    };
    let group_size = args.opt_usize("group_size")?;
    let bits = args
        .opt_usize("bits")?
        .map(|b| u32::try_from(b).map_err(|_| BridgeError::argument(format!("{}: bits out of range", args.op()))))
        .transpose()?;
    Ok(QuantParams::new(group_size, bits, mode))
}

/// A number (including infinities), `"fro"`, `"nuc"`, or `"inf"`/`"-inf"`
fn norm_ord(value: &Value) -> BridgeResult<NormOrd> {
    match value {
        Value::Int(n) => Ok(NormOrd::P(*n as f64)),
        Value::Float(x) => Ok(NormOrd::P(*x)),
        Value::Str(_) | Value::Symbol(_) => match crate::convert::to_text(value)?.as_str() {
            "fro" => Ok(NormOrd::Fro),
            "nuc" => Ok(NormOrd::Nuc),
            "inf" => Ok(NormOrd::P(f64::INFINITY)),
            "-inf" => Ok(NormOrd::P(f64::NEG_INFINITY)),
            other => Err(BridgeError::argument(format!("norm: unknown ord '{}'", other))),
        },
        other => Err(BridgeError::type_mismatch("Numeric or String", other.type_name())),
    }
}

fn uplo(args: &Args) -> BridgeResult<bool> {
    match args.text_or("uplo", "L")?.as_str() {
        "L" => Ok(false),
        "U" => Ok(true),
        other => Err(BridgeError::argument(format!("{}: uplo must be 'L' or 'U', got '{}'", args.op(), other))),
    }
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

    fn matrix(rows: &[[f64; 2]]) -> Value {
        Value::list(
            rows.iter()
                .map(|r| Value::list(vec![Value::Float(r[0]), Value::Float(r[1])]))
                .collect(),
        )
    }

    #[test]
    fn test_svd_projection() {
        let core = core();
        let a = matrix(&[[3.0, 0.0], [0.0, 4.0]]);
        let full = core.call("svd", vec![a.clone()]).unwrap();
        assert_eq!(full.as_list().unwrap().len(), 3);
        let values = core.call("svd", vec![a, Value::Bool(false)]).unwrap();
        assert_eq!(values.as_array().unwrap().shape(), vec![2]);
    }

    #[test]
    fn test_segmented_mm_stacks_segments() {
        let core = core();
        let a = matrix(&[[1.0, 2.0], [3.0, 4.0]]);
        let b = matrix(&[[1.0, 0.0], [0.0, 1.0]]);
        let segments = Value::list(vec![
            Value::list(vec![Value::Int(0), Value::Int(1)]),
            Value::list(vec![Value::Int(1), Value::Int(2)]),
        ]);
        let out = core.call("segmented_mm", vec![a, b, segments]).unwrap();
        let expected = Value::list(vec![matrix(&[[1.0, 0.0], [3.0, 0.0]]), matrix(&[[0.0, 2.0], [0.0, 4.0]])]);
        assert_eq!(out.as_array().unwrap().to_a(&core).unwrap(), expected);
    }

    #[test]
    fn test_gather_mm_accepts_sorted_indices() {
        let core = core();
        let a = matrix(&[[1.0, 2.0], [3.0, 4.0]]);
        let b = matrix(&[[1.0, 0.0], [0.0, 1.0]]);
        let plain = core.call("gather_mm", vec![a.clone(), b.clone()]).unwrap();
        let kwargs = Value::hash([("sorted_indices", Value::Bool(true))]);
        let sorted = core.call("gather_mm", vec![a, b, kwargs]).unwrap();
        assert_eq!(
            plain.as_array().unwrap().to_a(&core).unwrap(),
            sorted.as_array().unwrap().to_a(&core).unwrap()
        );
    }

    #[test]
    fn test_hadamard_transform_default_scale() {
        let core = core();
        let x = Value::list(vec![Value::Float(1.0), Value::Float(1.0), Value::Float(1.0), Value::Float(1.0)]);
        let out = core.call("hadamard_transform", vec![x.clone()]).unwrap();
        let expected = Value::list(vec![Value::Float(2.0), Value::Float(0.0), Value::Float(0.0), Value::Float(0.0)]);
        assert_eq!(out.as_array().unwrap().to_a(&core).unwrap(), expected);
        let three = Value::list(vec![Value::Float(1.0); 3]);
        assert!(core.call("hadamard_transform", vec![three]).is_err());
    }

    #[test]
    fn test_qr_returns_pair() {
        let core = core();
        let out = core.call("qr", vec![matrix(&[[1.0, 2.0], [3.0, 4.0]])]).unwrap();
        assert_eq!(out.as_list().unwrap().len(), 2);
    }

    #[test]
    fn test_norm_ord_forms() {
        assert_eq!(norm_ord(&Value::str("fro")).unwrap(), NormOrd::Fro);
        assert_eq!(norm_ord(&Value::Float(f64::INFINITY)).unwrap(), NormOrd::P(f64::INFINITY));
        assert_eq!(norm_ord(&Value::Int(1)).unwrap(), NormOrd::P(1.0));
        assert!(norm_ord(&Value::str("max")).unwrap_err().is_argument_error());
    }

    #[test]
    fn test_eigh_rejects_bad_uplo() {
        let core = core();
        let a = matrix(&[[2.0, 0.0], [0.0, 1.0]]);
        let err = core.call("eigh", vec![a, Value::str("X")]).unwrap_err();
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_quantize_output_count_follows_mode() {
        let core = core();
        let w = core.call("ones", vec![Value::list(vec![Value::Int(4), Value::Int(64)])]).unwrap();
        let affine = core.call("quantize", vec![w.clone()]).unwrap();
        assert_eq!(affine.as_list().unwrap().len(), 3);
        let kwargs = Value::hash([("mode", Value::str("mxfp4"))]);
        let fp4 = core.call("quantize", vec![w, kwargs]).unwrap();
        assert_eq!(fp4.as_list().unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_quant_mode() {
        let core = core();
        let w = core.call("ones", vec![Value::list(vec![Value::Int(2), Value::Int(64)])]).unwrap();
        let err = core.call("quantize", vec![w, Value::Int(64), Value::Int(4), Value::str("int8")]).unwrap_err();
        assert!(err.is_argument_error());
    }
}
