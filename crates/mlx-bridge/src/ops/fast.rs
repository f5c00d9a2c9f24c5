//! Fused layers and custom kernels.

use mlx_engine::ops::fast::{self, AttentionMask};
use mlx_engine::KernelSpec;

use super::one;
use crate::args::Args;
use crate::convert;
use crate::core::Core;
use crate::dispatch::TableBuilder;
use crate::error::{BridgeError, BridgeResult};
use crate::handles::KernelHandle;
use crate::value::Value;

pub(crate) fn register(t: &mut TableBuilder) {
    t.op("rms_norm", &["x", "weight", "eps"], |core, args| {
        let x = args.array(core, "x")?;
        let weight = args.opt_array(core, "weight")?;
        let eps = args.float_or("eps", 1e-5)?;
        let s = args.stream(core)?;
        one(core, |e| fast::rms_norm(e, &x, weight.as_ref(), eps, &s))
    });
    t.op("layer_norm", &["x", "weight", "bias", "eps"], |core, args| {
        let x = args.array(core, "x")?;
        let (weight, bias) = (args.opt_array(core, "weight")?, args.opt_array(core, "bias")?);
        let eps = args.float_or("eps", 1e-5)?;
        let s = args.stream(core)?;
        one(core, |e| fast::layer_norm(e, &x, weight.as_ref(), bias.as_ref(), eps, &s))
    });
    t.op(
        "rope",
        &["a", "dims", "traditional", "base", "scale", "offset", "freqs"],
        |core, args| {
            let a = args.array(core, "a")?;
            let dims = args.usize("dims")?;
            let traditional = args.bool_or("traditional", false)?;
            let base = args.opt_float("base")?;
            let scale = args.float_or("scale", 1.0)?;
            let offset = args.int_or("offset", 0)?;
            let freqs = args.opt_array(core, "freqs")?;
            if base.is_some() && freqs.is_some() {
                return Err(BridgeError::argument("rope: base and freqs cannot both be given"));
            }
            let s = args.stream(core)?;
            one(core, |e| fast::rope(e, &a, dims, traditional, base, scale, offset, freqs.as_ref(), &s))
        },
    );
    t.op(
        "scaled_dot_product_attention",
        &["q", "k", "v", "scale", "mask", "sinks"],
        op_attention,
    );
    t.admin(
        "metal_kernel",
        &[
            "name",
            "input_names",
            "output_names",
            "source",
            "header",
            "ensure_row_contiguous",
            "atomic_outputs",
        ],
        op_metal_kernel,
    );
}

fn op_attention(core: &Core, args: &Args) -> BridgeResult<Value> {
    let (q, k, v) = (args.array(core, "q")?, args.array(core, "k")?, args.array(core, "v")?);
    let scale = args.float("scale")?;
    let mask = match args.get("mask") {
        None | Some(Value::Nil) => None,
        Some(m @ (Value::Str(_) | Value::Symbol(_))) => match convert::to_text(m)?.as_str() {
            "causal" => Some(AttentionMask::Causal),
            other => {
                return Err(BridgeError::argument(format!(
                    "scaled_dot_product_attention: unknown mask mode '{}'",
                    other
                )))
            }
        },
        Some(m) => Some(AttentionMask::Array(convert::to_array(core, m, None)?)),
    };
    let sinks = args.opt_array(core, "sinks")?;
    let s = args.stream(core)?;
    one(core, |e| fast::scaled_dot_product_attention(e, &q, &k, &v, scale, mask.as_ref(), sinks.as_ref(), &s))
}

fn op_metal_kernel(core: &Core, args: &Args) -> BridgeResult<Value> {
    let names = |key: &str| -> BridgeResult<Vec<String>> {
        convert::list_items(args.required(key)?)?.iter().map(convert::to_text).collect()
    };
    let spec = KernelSpec {
        name: args.text("name")?,
        input_names: names("input_names")?,
        output_names: names("output_names")?,
        source: args.text("source")?,
        header: args.text_or("header", "")?,
        ensure_row_contiguous: args.bool_or("ensure_row_contiguous", true)?,
        atomic_outputs: args.bool_or("atomic_outputs", false)?,
    };
    let kernel = core.run_engine(|e| e.metal_kernel(spec))?;
    let refs = vec![args.required("input_names")?.clone(), args.required("output_names")?.clone()];
    Ok(Value::Kernel(KernelHandle::new(kernel, refs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn ones(core: &Core, shape: &[i64]) -> Value {
        let shape = Value::list(shape.iter().map(|&d| Value::Int(d)).collect());
        core.call("ones", vec![shape]).unwrap()
    }

    #[test]
    fn test_attention_causal_mask() {
        let core = Core::new(Arc::new(CpuEngine::new()));
        let q = ones(&core, &[1, 2, 3, 4]);
        let kwargs = Value::hash([("mask", Value::str("causal"))]);
        let out = core
            .call("scaled_dot_product_attention", vec![q.clone(), q.clone(), q, Value::Float(0.5), kwargs])
            .unwrap();
        assert_eq!(out.as_array().unwrap().shape(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_attention_unknown_mask_mode() {
        let core = Core::new(Arc::new(CpuEngine::new()));
        let q = ones(&core, &[1, 1, 2, 2]);
        let err = core
            .call(
                "scaled_dot_product_attention",
                vec![q.clone(), q.clone(), q, Value::Float(1.0), Value::str("sliding")],
            )
            .unwrap_err();
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_rms_norm_without_weight() {
        let core = Core::new(Arc::new(CpuEngine::new()));
        let x = ones(&core, &[2, 4]);
        let out = core.call("rms_norm", vec![x, Value::Nil, Value::Float(1e-6)]).unwrap();
        assert_eq!(out.as_array().unwrap().shape(), vec![2, 4]);
    }
}
