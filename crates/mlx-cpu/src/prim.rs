//! Primitives
//!
//! [`Prim`] names one engine primitive together with its static
//! parameters. It is the unit recorded in traces, replayed by graphs and
//! written to export files, and [`eval`] is the single place that maps a
//! primitive onto its kernel.

use std::sync::Arc;

use mlx_engine::{
    ArgReduceOp, BinaryOp, ConvParams, Dtype, EngineError, EngineResult, FftOp, LinalgOp, PadMode, QuantMode, ReduceOp,
    ScanOp, UnaryOp,
};
use serde::{Deserialize, Serialize};

use crate::graph::Graph;
use crate::tensor::Tensor;
use crate::{conv, elementwise, fft, layout, linalg, quant, random, reduce, transforms};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Prim {
    AsType(Dtype),
    View(Dtype),
    Unary(UnaryOp),
    Binary(BinaryOp),
    Select,
    Reduce {
        op: ReduceOp,
        axes: Vec<usize>,
        keepdims: bool,
    },
    ArgReduce {
        op: ArgReduceOp,
        axis: usize,
        keepdims: bool,
    },
    Scan {
        op: ScanOp,
        axis: usize,
        reverse: bool,
        inclusive: bool,
    },
    Sort {
        axis: usize,
        indices: bool,
    },
    Partition {
        kth: usize,
        axis: usize,
        indices: bool,
    },
    Reshape(Vec<usize>),
    Transpose(Vec<usize>),
    Broadcast(Vec<usize>),
    Concatenate {
        axis: usize,
    },
    Slice {
        start: Vec<i64>,
        stop: Vec<i64>,
        strides: Vec<i64>,
    },
    SliceUpdate {
        start: Vec<i64>,
        stop: Vec<i64>,
        strides: Vec<i64>,
    },
    Take {
        axis: usize,
    },
    TakeAlongAxis {
        axis: usize,
    },
    PutAlongAxis {
        axis: usize,
    },
    /// Inputs are the array and the scalar fill value
    Pad {
        low: Vec<usize>,
        high: Vec<usize>,
        mode: PadMode,
    },
    AsStrided {
        shape: Vec<usize>,
        strides: Vec<i64>,
        offset: usize,
    },
    Matmul,
    Linalg(LinalgOp),
    Fft {
        n: Vec<usize>,
        axes: Vec<usize>,
        op: FftOp,
    },
    Conv(ConvParams),
    Quantize {
        group_size: usize,
        bits: u32,
        mode: QuantMode,
    },
    /// Inputs are the packed weights, scales and optional biases
    Dequantize {
        group_size: usize,
        bits: u32,
        mode: QuantMode,
        dtype: Option<Dtype>,
    },
    /// Input is the key
    RandomUniform {
        shape: Vec<usize>,
        dtype: Dtype,
    },
    RandomNormal {
        shape: Vec<usize>,
        dtype: Dtype,
    },
    SplitKey {
        num: usize,
    },
    /// Replay a traced graph
    Call(Arc<Graph>),
    /// Inputs are the primals followed by one cotangent per output
    Vjp(Arc<Graph>),
    /// Inputs are the primals followed by one tangent per primal
    Jvp(Arc<Graph>),
    Vmap {
        graph: Arc<Graph>,
        in_axes: Vec<Option<usize>>,
        out_axes: Vec<Option<usize>>,
    },
}

impl Prim {
    /// Short label for diagnostics and graph rendering
    pub fn name(&self) -> String {
        match self {
            Prim::AsType(d) => format!("astype {}", d),
            Prim::View(d) => format!("view {}", d),
            Prim::Unary(op) => op.name().to_string(),
            Prim::Binary(op) => op.name().to_string(),
            Prim::Select => "where".into(),
            Prim::Reduce { op, .. } => op.name().to_string(),
            Prim::ArgReduce { op, .. } => match op {
                ArgReduceOp::ArgMin => "argmin".into(),
                ArgReduceOp::ArgMax => "argmax".into(),
            },
            Prim::Scan { op, .. } => format!("scan {:?}", op).to_lowercase(),
            Prim::Sort { indices, .. } => if *indices { "argsort" } else { "sort" }.into(),
            Prim::Partition { indices, .. } => if *indices { "argpartition" } else { "partition" }.into(),
            Prim::Reshape(_) => "reshape".into(),
            Prim::Transpose(_) => "transpose".into(),
            Prim::Broadcast(_) => "broadcast_to".into(),
            Prim::Concatenate { .. } => "concatenate".into(),
            Prim::Slice { .. } => "slice".into(),
            Prim::SliceUpdate { .. } => "slice_update".into(),
            Prim::Take { .. } => "take".into(),
            Prim::TakeAlongAxis { .. } => "take_along_axis".into(),
            Prim::PutAlongAxis { .. } => "put_along_axis".into(),
            Prim::Pad { .. } => "pad".into(),
            Prim::AsStrided { .. } => "as_strided".into(),
            Prim::Matmul => "matmul".into(),
            Prim::Linalg(op) => op.name().to_string(),
            Prim::Fft { .. } => "fft".into(),
            Prim::Conv(_) => "conv".into(),
            Prim::Quantize { .. } => "quantize".into(),
            Prim::Dequantize { .. } => "dequantize".into(),
            Prim::RandomUniform { .. } => "uniform".into(),
            Prim::RandomNormal { .. } => "normal".into(),
            Prim::SplitKey { .. } => "split".into(),
            Prim::Call(_) => "call".into(),
            Prim::Vjp(_) => "vjp".into(),
            Prim::Jvp(_) => "jvp".into(),
            Prim::Vmap { .. } => "vmap".into(),
        }
    }

    /// Copy with every floating dtype parameter promoted to float64
    pub fn widened(&self) -> Prim {
        let wide = |d: Dtype| if d.is_floating() { Dtype::Float64 } else { d };
        match self {
            Prim::AsType(d) => Prim::AsType(wide(*d)),
            Prim::RandomUniform { shape, dtype } => Prim::RandomUniform {
                shape: shape.clone(),
                dtype: wide(*dtype),
            },
            Prim::RandomNormal { shape, dtype } => Prim::RandomNormal {
                shape: shape.clone(),
                dtype: wide(*dtype),
            },
            Prim::Dequantize {
                group_size,
                bits,
                mode,
                dtype,
            } => Prim::Dequantize {
                group_size: *group_size,
                bits: *bits,
                mode: *mode,
                dtype: dtype.map(wide),
            },
            Prim::Call(g) => Prim::Call(Arc::new(g.widened())),
            Prim::Vjp(g) => Prim::Vjp(Arc::new(g.widened())),
            Prim::Jvp(g) => Prim::Jvp(Arc::new(g.widened())),
            Prim::Vmap {
                graph,
                in_axes,
                out_axes,
            } => Prim::Vmap {
                graph: Arc::new(graph.widened()),
                in_axes: in_axes.clone(),
                out_axes: out_axes.clone(),
            },
            other => other.clone(),
        }
    }
}

/// Exactly `N` inputs
fn args<'a, const N: usize>(prim: &Prim, inputs: &[&'a Tensor]) -> EngineResult<[&'a Tensor; N]> {
    <[&'a Tensor; N]>::try_from(inputs).map_err(|_| {
        EngineError::invalid(prim.name(), format!("expected {} inputs, got {}", N, inputs.len()))
    })
}

/// Evaluate one primitive
pub fn eval(prim: &Prim, inputs: &[&Tensor]) -> EngineResult<Vec<Tensor>> {
    let out = match prim {
        Prim::Concatenate { axis } => layout::concatenate(inputs, *axis)?,
        Prim::Linalg(op) => return linalg::linalg(*op, inputs),
        Prim::Quantize { group_size, bits, mode } => {
            let [w] = args(prim, inputs)?;
            return quant::quantize(w, *group_size, *bits, *mode);
        }
        Prim::Dequantize {
            group_size,
            bits,
            mode,
            dtype,
        } => match inputs {
            [w, scales] => quant::dequantize(w, scales, None, *group_size, *bits, *mode, *dtype)?,
            [w, scales, biases] => quant::dequantize(w, scales, Some(*biases), *group_size, *bits, *mode, *dtype)?,
            _ => return Err(EngineError::invalid("dequantize", "expected weights, scales and optional biases")),
        },
        Prim::Call(graph) => return owned(graph.eval(&shared(inputs))?),
        Prim::Vjp(graph) => return transforms::vjp(graph, inputs),
        Prim::Jvp(graph) => return transforms::jvp(graph, inputs),
        Prim::Vmap {
            graph,
            in_axes,
            out_axes,
        } => return transforms::vmap(graph, inputs, in_axes, out_axes),
        Prim::Select => {
            let [cond, x, y] = args(prim, inputs)?;
            elementwise::select(cond, x, y)?
        }
        Prim::SliceUpdate { start, stop, strides } => {
            let [a, update] = args(prim, inputs)?;
            layout::slice_update(a, update, start, stop, strides)?
        }
        Prim::PutAlongAxis { axis } => {
            let [a, indices, values] = args(prim, inputs)?;
            layout::put_along_axis(a, indices, values, *axis)?
        }
        Prim::Binary(op) => {
            let [a, b] = args(prim, inputs)?;
            elementwise::binary(*op, a, b)?
        }
        Prim::Take { axis } => {
            let [a, indices] = args(prim, inputs)?;
            layout::take(a, indices, *axis)?
        }
        Prim::TakeAlongAxis { axis } => {
            let [a, indices] = args(prim, inputs)?;
            layout::take_along_axis(a, indices, *axis)?
        }
        Prim::Pad { low, high, mode } => {
            let [a, value] = args(prim, inputs)?;
            layout::pad(a, low, high, value, *mode)?
        }
        Prim::Matmul => {
            let [a, b] = args(prim, inputs)?;
            layout::matmul(a, b)?
        }
        Prim::Conv(params) => {
            let [input, weight] = args(prim, inputs)?;
            conv::conv_general(input, weight, params)?
        }
        _ => {
            let [a] = args(prim, inputs)?;
            unary_input(prim, a)?
        }
    };
    Ok(vec![out])
}

fn unary_input(prim: &Prim, a: &Tensor) -> EngineResult<Tensor> {
    match prim {
        Prim::AsType(dtype) => Ok(a.astype(*dtype)),
        Prim::View(dtype) => layout::view(a, *dtype),
        Prim::Unary(op) => elementwise::unary(*op, a),
        Prim::Reduce { op, axes, keepdims } => reduce::reduce(*op, a, axes, *keepdims),
        Prim::ArgReduce { op, axis, keepdims } => reduce::arg_reduce(*op, a, *axis, *keepdims),
        Prim::Scan {
            op,
            axis,
            reverse,
            inclusive,
        } => reduce::scan(*op, a, *axis, *reverse, *inclusive),
        Prim::Sort { axis, indices } => reduce::sort(a, *axis, *indices),
        Prim::Partition { kth, axis, indices } => reduce::partition(a, *kth, *axis, *indices),
        Prim::Reshape(shape) => layout::reshape(a, shape),
        Prim::Transpose(perm) => layout::transpose(a, perm),
        Prim::Broadcast(shape) => layout::broadcast_to(a, shape),
        Prim::Slice { start, stop, strides } => layout::slice(a, start, stop, strides),
        Prim::AsStrided { shape, strides, offset } => layout::as_strided(a, shape, strides, *offset),
        Prim::Fft { n, axes, op } => fft::fft(a, n, axes, *op),
        Prim::RandomUniform { shape, dtype } => random::uniform(a, shape, *dtype),
        Prim::RandomNormal { shape, dtype } => random::normal(a, shape, *dtype),
        Prim::SplitKey { num } => random::split(a, *num),
        other => Err(EngineError::runtime(format!("{} is not a single-input primitive", other.name()))),
    }
}

fn shared(inputs: &[&Tensor]) -> Vec<Arc<Tensor>> {
    inputs.iter().map(|&t| Arc::new(t.clone())).collect()
}

fn owned(outputs: Vec<Arc<Tensor>>) -> EngineResult<Vec<Tensor>> {
    Ok(outputs
        .into_iter()
        .map(|t| Arc::try_unwrap(t).unwrap_or_else(|t| (*t).clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_eval_dispatch() {
        let a = Tensor::real(vec![2], Dtype::Float32, vec![1.0, 2.0]);
        let b = Tensor::real(vec![2], Dtype::Float32, vec![3.0, 4.0]);
        let out = eval(&Prim::Binary(BinaryOp::Add), &[&a, &b]).unwrap();
        assert_eq!(out[0].values().to_vec(), vec![4.0, 6.0]);
        let out = eval(&Prim::Reduce { op: ReduceOp::Sum, axes: vec![0], keepdims: false }, &[&a]).unwrap();
        assert_eq!(out[0].values().to_vec(), vec![3.0]);
    }

    #[test]
    fn test_arity_checked() {
        let a = Tensor::scalar(1.0, Dtype::Float32);
        let err = eval(&Prim::Matmul, &[&a]).unwrap_err();
        assert_eq!(err.to_string(), "[matmul] expected 2 inputs, got 1");
    }

    #[test]
    fn test_widened_promotes_float_parameters() {
        match Prim::AsType(Dtype::Float16).widened() {
            Prim::AsType(d) => assert_eq!(d, Dtype::Float64),
            other => panic!("unexpected {:?}", other),
        }
        match Prim::AsType(Dtype::Int32).widened() {
            Prim::AsType(d) => assert_eq!(d, Dtype::Int32),
            other => panic!("unexpected {:?}", other),
        }
    }
}
