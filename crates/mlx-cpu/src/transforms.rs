//! Function transforms over traced graphs.
//!
//! Derivatives are central finite differences evaluated on a double
//! precision copy of the graph. Step sizes are relative to the magnitude of
//! the point, so results agree with analytic derivatives to roughly eight
//! significant digits for smooth functions. Integer inputs have zero
//! gradient; complex inputs are rejected. Results of `stop_gradient` are
//! held at their value at the primal point.

use std::sync::Arc;

use mlx_engine::{Dtype, EngineError, EngineResult, UnaryOp};

use crate::graph::{Graph, GraphRef};
use crate::layout;
use crate::prim::Prim;
use crate::tensor::Tensor;

const REL_STEP: f64 = 1e-4;

fn widen(t: &Tensor) -> Arc<Tensor> {
    if t.dtype.is_floating() {
        Arc::new(t.astype(Dtype::Float64))
    } else {
        Arc::new(t.clone())
    }
}

/// Replace every `stop_gradient` result by its value at `args`
fn freeze(graph: &Graph, args: &[Arc<Tensor>]) -> EngineResult<Graph> {
    let stops: Vec<usize> = graph
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| matches!(n.prim, Prim::Unary(UnaryOp::StopGradient)))
        .map(|(i, _)| i)
        .collect();
    if stops.is_empty() {
        return Ok(graph.clone());
    }
    let scratch = Graph {
        outputs: stops.iter().map(|&i| GraphRef::Node(i, 0)).collect(),
        ..graph.clone()
    };
    let values = scratch.eval(args)?;
    let mut frozen = graph.clone();
    let base = frozen.constants.len();
    frozen.constants.extend(values);
    let redirect = |r: &mut GraphRef| {
        if let GraphRef::Node(n, 0) = *r {
            if let Some(k) = stops.iter().position(|&s| s == n) {
                *r = GraphRef::Constant(base + k);
            }
        }
    };
    for node in &mut frozen.nodes {
        node.inputs.iter_mut().for_each(redirect);
    }
    frozen.outputs.iter_mut().for_each(redirect);
    Ok(frozen)
}

fn reject_complex(op: &str, inputs: &[&Tensor]) -> EngineResult<()> {
    match inputs.iter().find(|t| t.dtype.is_complex()) {
        Some(t) => Err(EngineError::dtype(op, t.dtype)),
        None => Ok(()),
    }
}

fn split_inputs<'a>(op: &str, graph: &Graph, inputs: &'a [&'a Tensor], extra: usize) -> EngineResult<(&'a [&'a Tensor], &'a [&'a Tensor])> {
    let n = graph.inputs.len();
    if inputs.len() != n + extra {
        return Err(EngineError::invalid(op, format!("expected {} inputs, got {}", n + extra, inputs.len())));
    }
    Ok(inputs.split_at(n))
}

/// Vector-Jacobian products; inputs are the primals then one cotangent per output
pub fn vjp(graph: &Graph, inputs: &[&Tensor]) -> EngineResult<Vec<Tensor>> {
    let (primals, cotangents) = split_inputs("vjp", graph, inputs, graph.outputs.len())?;
    reject_complex("vjp", primals)?;
    let base: Vec<Arc<Tensor>> = primals.iter().map(|t| widen(t)).collect();
    let wide = freeze(&graph.widened(), &base)?;
    let cots: Vec<Vec<f64>> = cotangents.iter().map(|c| c.values().into_owned()).collect();

    let mut grads = Vec::with_capacity(primals.len());
    for (i, primal) in primals.iter().enumerate() {
        if !primal.dtype.is_floating() {
            grads.push(Tensor::zeros(primal.shape.clone(), primal.dtype));
            continue;
        }
        let x = base[i].values().into_owned();
        let mut grad = Vec::with_capacity(x.len());
        for j in 0..x.len() {
            let h = REL_STEP * x[j].abs().max(1.0);
            let eval_at = |delta: f64| {
                let mut args = base.clone();
                let mut moved = x.clone();
                moved[j] += delta;
                args[i] = Arc::new(Tensor::real(primal.shape.clone(), Dtype::Float64, moved));
                wide.eval(&args)
            };
            let (plus, minus) = (eval_at(h)?, eval_at(-h)?);
            let mut g = 0.0;
            for ((p, m), cot) in plus.iter().zip(&minus).zip(&cots) {
                if !p.dtype.is_floating() {
                    continue;
                }
                if p.size() != cot.len() {
                    return Err(EngineError::invalid(
                        "vjp",
                        format!("cotangent of size {} does not match output {:?}", cot.len(), p.shape),
                    ));
                }
                g += p
                    .values()
                    .iter()
                    .zip(m.values().iter())
                    .zip(cot)
                    .map(|((a, b), c)| c * (a - b) / (2.0 * h))
                    .sum::<f64>();
            }
            grad.push(g);
        }
        grads.push(Tensor::real(primal.shape.clone(), primal.dtype, grad));
    }
    Ok(grads)
}

/// Jacobian-vector products; inputs are the primals then one tangent per primal
pub fn jvp(graph: &Graph, inputs: &[&Tensor]) -> EngineResult<Vec<Tensor>> {
    let (primals, tangents) = split_inputs("jvp", graph, inputs, graph.inputs.len())?;
    reject_complex("jvp", primals)?;
    for (p, t) in primals.iter().zip(tangents) {
        if p.size() != t.size() {
            return Err(EngineError::invalid(
                "jvp",
                format!("tangent {:?} does not match primal {:?}", t.shape, p.shape),
            ));
        }
    }
    let outputs = graph.eval(&primals.iter().map(|&t| Arc::new(t.clone())).collect::<Vec<_>>())?;
    let base: Vec<Arc<Tensor>> = primals.iter().map(|t| widen(t)).collect();
    let wide = freeze(&graph.widened(), &base)?;
    let scale = primals
        .iter()
        .filter(|p| p.dtype.is_floating())
        .flat_map(|p| p.values().into_owned())
        .fold(1.0f64, |m, x| m.max(x.abs()));
    let h = REL_STEP * scale;
    let eval_at = |delta: f64| {
        let args: Vec<Arc<Tensor>> = primals
            .iter()
            .zip(tangents)
            .map(|(p, t)| {
                if !p.dtype.is_floating() {
                    return widen(p);
                }
                let moved = p.values().iter().zip(t.values().iter()).map(|(x, d)| x + delta * d).collect();
                Arc::new(Tensor::real(p.shape.clone(), Dtype::Float64, moved))
            })
            .collect();
        wide.eval(&args)
    };
    let (plus, minus) = (eval_at(h)?, eval_at(-h)?);
    Ok(outputs
        .iter()
        .zip(plus.iter().zip(&minus))
        .map(|(out, (p, m))| {
            if !out.dtype.is_floating() {
                return Tensor::zeros(out.shape.clone(), out.dtype);
            }
            let d = p.values().iter().zip(m.values().iter()).map(|(a, b)| (a - b) / (2.0 * h)).collect();
            Tensor::real(out.shape.clone(), out.dtype, d)
        })
        .collect())
}

/// Map `graph` over the given input axes and stack the results
pub fn vmap(graph: &Graph, inputs: &[&Tensor], in_axes: &[Option<usize>], out_axes: &[Option<usize>]) -> EngineResult<Vec<Tensor>> {
    if in_axes.len() != inputs.len() {
        return Err(EngineError::invalid(
            "vmap",
            format!("in_axes has {} entries for {} inputs", in_axes.len(), inputs.len()),
        ));
    }
    let mut size = None;
    for (t, axis) in inputs.iter().zip(in_axes) {
        let Some(axis) = *axis else { continue };
        let len = *t.shape.get(axis).ok_or_else(|| {
            EngineError::invalid("vmap", format!("axis {} is out of bounds for input of shape {:?}", axis, t.shape))
        })?;
        match size {
            Some(n) if n != len => {
                return Err(EngineError::invalid(
                    "vmap",
                    format!("mapped axes have different sizes {} and {}", n, len),
                ))
            }
            _ => size = Some(len),
        }
    }
    let size = size.ok_or_else(|| EngineError::invalid("vmap", "at least one input must be mapped"))?;

    let mut per_item: Vec<Vec<Arc<Tensor>>> = Vec::with_capacity(size);
    for b in 0..size {
        let index = Tensor::scalar(b as f64, Dtype::Int32);
        let args = inputs
            .iter()
            .zip(in_axes)
            .map(|(t, axis)| match axis {
                Some(axis) => layout::take(t, &index, *axis).map(Arc::new),
                None => Ok(Arc::new((*t).clone())),
            })
            .collect::<EngineResult<Vec<_>>>()?;
        per_item.push(graph.eval(&args)?);
    }

    let count = graph.outputs.len();
    if out_axes.len() != 1 && out_axes.len() != count {
        return Err(EngineError::invalid(
            "vmap",
            format!("out_axes has {} entries for {} outputs", out_axes.len(), count),
        ));
    }
    let mut results = Vec::with_capacity(count);
    for k in 0..count {
        let axis = if out_axes.len() == 1 { out_axes[0] } else { out_axes[k] };
        let Some(axis) = axis else {
            let first = per_item.first().map(|outs| outs[k].as_ref().clone());
            results.push(first.ok_or_else(|| EngineError::invalid("vmap", "cannot map over an empty axis"))?);
            continue;
        };
        let expanded = per_item
            .iter()
            .map(|outs| {
                let t = &outs[k];
                if axis > t.ndim() {
                    return Err(EngineError::invalid(
                        "vmap",
                        format!("out axis {} is out of bounds for output of rank {}", axis, t.ndim()),
                    ));
                }
                let mut shape = t.shape.clone();
                shape.insert(axis, 1);
                layout::reshape(t, &shape)
            })
            .collect::<EngineResult<Vec<_>>>()?;
        let refs: Vec<&Tensor> = expanded.iter().collect();
        results.push(layout::concatenate(&refs, axis)?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphNode, TensorSpec};
    use mlx_engine::{BinaryOp, ReduceOp};
    use pretty_assertions::assert_eq;

    /// sum(x * x)
    fn sum_of_squares(n: usize) -> Graph {
        Graph {
            inputs: vec![TensorSpec {
                shape: vec![n],
                dtype: Dtype::Float32,
            }],
            constants: Vec::new(),
            nodes: vec![
                GraphNode {
                    prim: Prim::Binary(BinaryOp::Multiply),
                    inputs: vec![GraphRef::Input(0), GraphRef::Input(0)],
                },
                GraphNode {
                    prim: Prim::Reduce {
                        op: ReduceOp::Sum,
                        axes: vec![0],
                        keepdims: false,
                    },
                    inputs: vec![GraphRef::Node(0, 0)],
                },
            ],
            outputs: vec![GraphRef::Node(1, 0)],
        }
    }

    fn vector(values: &[f64]) -> Tensor {
        Tensor::real(vec![values.len()], Dtype::Float32, values.to_vec())
    }

    #[test]
    fn test_vjp_of_sum_of_squares() {
        let x = vector(&[1.0, -2.0, 3.0]);
        let cot = Tensor::scalar(1.0, Dtype::Float32);
        let grads = vjp(&sum_of_squares(3), &[&x, &cot]).unwrap();
        assert_eq!(grads[0].dtype, Dtype::Float32);
        for (g, e) in grads[0].values().iter().zip([2.0, -4.0, 6.0]) {
            assert!((g - e).abs() < 1e-4, "{} vs {}", g, e);
        }
    }

    #[test]
    fn test_jvp_direction() {
        let x = vector(&[1.0, 2.0]);
        let t = vector(&[1.0, 0.0]);
        let out = jvp(&sum_of_squares(2), &[&x, &t]).unwrap();
        assert!((out[0].values()[0] - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_vjp_integer_input_is_zero() {
        let mut g = sum_of_squares(2);
        g.inputs[0].dtype = Dtype::Int32;
        let x = Tensor::real(vec![2], Dtype::Int32, vec![1.0, 2.0]);
        let cot = Tensor::scalar(1.0, Dtype::Int32);
        let grads = vjp(&g, &[&x, &cot]).unwrap();
        assert_eq!(grads[0].values().to_vec(), vec![0.0, 0.0]);
        assert_eq!(grads[0].dtype, Dtype::Int32);
    }

    #[test]
    fn test_stop_gradient_blocks_vjp() {
        // sum(x * stop_gradient(x)) has gradient x, not 2x
        let mut g = sum_of_squares(2);
        g.nodes.insert(
            0,
            GraphNode {
                prim: Prim::Unary(UnaryOp::StopGradient),
                inputs: vec![GraphRef::Input(0)],
            },
        );
        g.nodes[1].inputs = vec![GraphRef::Input(0), GraphRef::Node(0, 0)];
        g.nodes[2].inputs = vec![GraphRef::Node(1, 0)];
        g.outputs = vec![GraphRef::Node(2, 0)];
        let x = vector(&[3.0, -1.0]);
        let cot = Tensor::scalar(1.0, Dtype::Float32);
        let grads = vjp(&g, &[&x, &cot]).unwrap();
        for (g, e) in grads[0].values().iter().zip([3.0, -1.0]) {
            assert!((g - e).abs() < 1e-4, "{} vs {}", g, e);
        }
    }

    #[test]
    fn test_vmap_rows() {
        let x = Tensor::real(vec![2, 2], Dtype::Float32, vec![1.0, 2.0, 3.0, 4.0]);
        let out = vmap(&sum_of_squares(2), &[&x], &[Some(0)], &[Some(0)]).unwrap();
        assert_eq!(out[0].shape, vec![2]);
        assert_eq!(out[0].values().to_vec(), vec![5.0, 25.0]);
        let cols = vmap(&sum_of_squares(2), &[&x], &[Some(1)], &[Some(0)]).unwrap();
        assert_eq!(cols[0].values().to_vec(), vec![10.0, 20.0]);
        assert!(vmap(&sum_of_squares(2), &[&x], &[None], &[Some(0)]).is_err());
    }
}
