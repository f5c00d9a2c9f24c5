//! Convolutions.
//!
//! Spatial hyperparameters accept one integer for every axis or a list
//! with one entry per axis (a pair for 2-D, a triple for 3-D).

use mlx_engine::ops::conv::{self, per_axis, ConvSpec, ConvolveMode};
use mlx_engine::ConvParams;

use super::one;
use crate::args::Args;
use crate::convert;
use crate::core::Core;
use crate::dispatch::TableBuilder;
use crate::error::{BridgeError, BridgeResult};
use crate::value::Value;

const CONV_PARAMS: &[&str] = &["input", "weight", "stride", "padding", "dilation", "groups"];

const TRANSPOSE_PARAMS: &[&str] = &["input", "weight", "stride", "padding", "dilation", "output_padding", "groups"];

pub(crate) fn register(t: &mut TableBuilder) {
    for (name, spatial) in [("conv1d", 1), ("conv2d", 2), ("conv3d", 3)] {
        t.op(name, CONV_PARAMS, move |core, args| {
            let (input, weight) = (args.array(core, "input")?, args.array(core, "weight")?);
            let spec = conv_spec(args, spatial)?;
            let s = args.stream(core)?;
            one(core, |e| match spatial {
                1 => conv::conv1d(e, &input, &weight, &spec, &s),
                2 => conv::conv2d(e, &input, &weight, &spec, &s),
                _ => conv::conv3d(e, &input, &weight, &spec, &s),
            })
        });
    }
    for (name, spatial) in [("conv_transpose1d", 1), ("conv_transpose2d", 2), ("conv_transpose3d", 3)] {
        t.op(name, TRANSPOSE_PARAMS, move |core, args| {
            let (input, weight) = (args.array(core, "input")?, args.array(core, "weight")?);
            let spec = conv_spec(args, spatial)?;
            let output_padding = spatial_or(args, "output_padding", spatial, 0)?;
            let s = args.stream(core)?;
            one(core, |e| conv::conv_transpose(e, &input, &weight, &spec, &output_padding, &s))
        });
    }
    t.op(
        "conv_general",
        &[
            "input",
            "weight",
            "stride",
            "padding",
            "kernel_dilation",
            "input_dilation",
            "groups",
            "flip",
        ],
        op_conv_general,
    );
    t.op("convolve", &["a", "v", "mode"], |core, args| {
        let (a, v) = (args.array(core, "a")?, args.array(core, "v")?);
        let name = args.text_or("mode", "full")?;
        let mode = ConvolveMode::from_name(&name)
            .ok_or_else(|| BridgeError::argument(format!("convolve: unknown mode {:?}", name)))?;
        let s = args.stream(core)?;
        one(core, |e| conv::convolve(e, &a, &v, mode, &s))
    });
}

fn conv_spec(args: &Args, spatial: usize) -> BridgeResult<ConvSpec> {
    Ok(ConvSpec::new(spatial)
        .stride(spatial_or(args, "stride", spatial, 1)?)
        .padding(spatial_or(args, "padding", spatial, 0)?)
        .dilation(spatial_or(args, "dilation", spatial, 1)?)
        .groups(args.usize_or("groups", 1)?))
}

fn spatial_or(args: &Args, name: &str, spatial: usize, default: usize) -> BridgeResult<Vec<usize>> {
    match args.get(name) {
        None | Some(Value::Nil) => Ok(vec![default; spatial]),
        Some(v) => convert::to_spatial(v, spatial),
    }
}

fn op_conv_general(core: &Core, args: &Args) -> BridgeResult<Value> {
    let (input, weight) = (args.array(core, "input")?, args.array(core, "weight")?);
    let spatial = input.ndim().saturating_sub(2);
    let list = |name: &str, default: usize| -> BridgeResult<Vec<usize>> {
        match args.get(name) {
            None | Some(Value::Nil) => Ok(vec![default; spatial]),
            Some(v) => Ok(per_axis(&convert::to_spatial_list(v, spatial)?, spatial)),
        }
    };
    let (padding_lo, padding_hi) = match args.get("padding") {
        None | Some(Value::Nil) => (vec![0; spatial], vec![0; spatial]),
        Some(v) => padding_pair(v, spatial)?,
    };
    let params = ConvParams {
        stride: list("stride", 1)?,
        padding_lo,
        padding_hi,
        kernel_dilation: list("kernel_dilation", 1)?,
        input_dilation: list("input_dilation", 1)?,
        groups: args.usize_or("groups", 1)?,
        flip: args.bool_or("flip", false)?,
    };
    let s = args.stream(core)?;
    one(core, |e| conv::conv_general(e, &input, &weight, &params, &s))
}

/// Symmetric padding, or a `[low_list, high_list]` pair
fn padding_pair(value: &Value, spatial: usize) -> BridgeResult<(Vec<usize>, Vec<usize>)> {
    let items = match value {
        Value::List(_) => convert::list_items(value)?,
        _ => {
            let both = per_axis(&convert::to_spatial_list(value, spatial)?, spatial);
            return Ok((both.clone(), both));
        }
    };
    if let [lo @ Value::List(_), hi @ Value::List(_)] = items.as_slice() {
        let lo = per_axis(&convert::to_spatial_list(lo, spatial)?, spatial);
        let hi = per_axis(&convert::to_spatial_list(hi, spatial)?, spatial);
        return Ok((lo, hi));
    }
    if items.iter().any(|v| matches!(v, Value::List(_))) {
        return Err(BridgeError::argument("conv_general: padding must be an integer, a list, or a [low, high] pair of lists"));
    }
    let both = per_axis(&convert::to_spatial_list(value, spatial)?, spatial);
    Ok((both.clone(), both))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn ints(values: &[i64]) -> Value {
        Value::list(values.iter().map(|&v| Value::Int(v)).collect())
    }

    fn ones(core: &Core, shape: &[i64]) -> Value {
        core.call("ones", vec![ints(shape)]).unwrap()
    }

    #[test]
    fn test_padding_pair_forms() {
        assert_eq!(padding_pair(&Value::Int(1), 2).unwrap(), (vec![1, 1], vec![1, 1]));
        assert_eq!(padding_pair(&ints(&[1, 2]), 2).unwrap(), (vec![1, 2], vec![1, 2]));
        let pair = Value::list(vec![ints(&[0, 1]), ints(&[2, 3])]);
        assert_eq!(padding_pair(&pair, 2).unwrap(), (vec![0, 1], vec![2, 3]));
    }

    #[test]
    fn test_conv1d_output_length() {
        let core = Core::new(Arc::new(CpuEngine::new()));
        let input = ones(&core, &[1, 5, 1]);
        let weight = ones(&core, &[1, 3, 1]);
        let kwargs = Value::hash([("padding", Value::Int(1))]);
        let out = core.call("conv1d", vec![input, weight, kwargs]).unwrap();
        assert_eq!(out.as_array().unwrap().shape(), vec![1, 5, 1]);
    }

    #[test]
    fn test_convolve_mode_keyword() {
        let core = Core::new(Arc::new(CpuEngine::new()));
        let a = ints(&[1, 2, 3]);
        let v = ints(&[0, 1, 1]);
        let full = core.call("convolve", vec![a.clone(), v.clone()]).unwrap();
        assert_eq!(full.as_array().unwrap().shape(), vec![5]);
        let valid = core.call("convolve", vec![a.clone(), v.clone(), Value::str("valid")]).unwrap();
        assert_eq!(valid.as_array().unwrap().shape(), vec![1]);
        let err = core.call("convolve", vec![a, v, Value::str("wrap")]).unwrap_err();
        assert!(err.is_argument_error());
    }

    #[test]
    fn test_conv2d_rejects_wrong_arity() {
        let core = Core::new(Arc::new(CpuEngine::new()));
        let input = ones(&core, &[1, 4, 4, 1]);
        let weight = ones(&core, &[1, 2, 2, 1]);
        let err = core.call("conv2d", vec![input, weight, ints(&[1, 1, 1])]).unwrap_err();
        assert!(err.is_argument_error());
    }
}
