//! Traces and Graphs
//!
//! While a function is being traced, every array derived from a traced
//! input carries a [`TraceNode`] recording the primitive that produced it.
//! [`capture`] walks those nodes back from the outputs and flattens them
//! into a [`Graph`]: a serializable, replayable list of primitives in
//! evaluation order.
//!
//! ## Trace identity
//!
//! Each trace gets a fresh id. A node belongs to the newest trace among its
//! inputs, so when traces nest, values from an enclosing trace are seen as
//! constants by the inner one.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlx_engine::{Dtype, EngineError, EngineResult};
use serde::{Deserialize, Serialize};

use crate::prim::{self, Prim};
use crate::tensor::Tensor;

static NEXT_TRACE: AtomicU64 = AtomicU64::new(1);

pub fn next_trace_id() -> u64 {
    NEXT_TRACE.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// Trace nodes
// ============================================================================

#[derive(Debug)]
pub enum NodeKind {
    /// Positional input of the trace
    Input(usize),
    Apply { prim: Prim, inputs: Vec<Operand> },
}

/// Where an input of a recorded primitive came from
#[derive(Debug, Clone)]
pub enum Operand {
    Node(Arc<TraceNode>, usize),
    Constant(Arc<Tensor>),
}

#[derive(Debug)]
pub struct TraceNode {
    pub trace: u64,
    pub kind: NodeKind,
    /// Output values, kept so the node can stand in as a constant
    pub values: Vec<Arc<Tensor>>,
}

fn node_key(node: &Arc<TraceNode>) -> usize {
    Arc::as_ptr(node) as usize
}

// ============================================================================
// Graph
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GraphRef {
    Input(usize),
    Constant(usize),
    /// Output `.1` of node `.0`
    Node(usize, usize),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub prim: Prim,
    pub inputs: Vec<GraphRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub shape: Vec<usize>,
    pub dtype: Dtype,
}

impl TensorSpec {
    pub fn of(t: &Tensor) -> Self {
        TensorSpec {
            shape: t.shape.clone(),
            dtype: t.dtype,
        }
    }
}

/// A replayable function of its inputs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub inputs: Vec<TensorSpec>,
    pub constants: Vec<Arc<Tensor>>,
    pub nodes: Vec<GraphNode>,
    pub outputs: Vec<GraphRef>,
}

impl Graph {
    pub fn eval(&self, args: &[Arc<Tensor>]) -> EngineResult<Vec<Arc<Tensor>>> {
        if args.len() != self.inputs.len() {
            return Err(EngineError::invalid(
                "call",
                format!("function expects {} inputs, got {}", self.inputs.len(), args.len()),
            ));
        }
        let mut values: Vec<Vec<Arc<Tensor>>> = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let inputs = node
                .inputs
                .iter()
                .map(|r| self.resolve(*r, args, &values))
                .collect::<EngineResult<Vec<_>>>()?;
            let refs: Vec<&Tensor> = inputs.iter().map(|t| t.as_ref()).collect();
            let outputs = prim::eval(&node.prim, &refs)?;
            values.push(outputs.into_iter().map(Arc::new).collect());
        }
        self.outputs.iter().map(|r| self.resolve(*r, args, &values)).collect()
    }

    fn resolve(&self, r: GraphRef, args: &[Arc<Tensor>], values: &[Vec<Arc<Tensor>>]) -> EngineResult<Arc<Tensor>> {
        let found = match r {
            GraphRef::Input(i) => args.get(i),
            GraphRef::Constant(i) => self.constants.get(i),
            GraphRef::Node(n, k) => values.get(n).and_then(|v| v.get(k)),
        };
        found
            .cloned()
            .ok_or_else(|| EngineError::runtime(format!("dangling graph reference {:?}", r)))
    }

    /// Check call arguments against the traced inputs. Shapeless graphs
    /// only require the dtype and rank to match.
    pub fn check_inputs(&self, args: &[&Tensor], shapeless: bool) -> EngineResult<()> {
        if args.len() != self.inputs.len() {
            return Err(EngineError::invalid(
                "call",
                format!("function expects {} inputs, got {}", self.inputs.len(), args.len()),
            ));
        }
        for (i, (spec, arg)) in self.inputs.iter().zip(args).enumerate() {
            let shape_ok = if shapeless { spec.shape.len() == arg.ndim() } else { spec.shape == arg.shape };
            if spec.dtype != arg.dtype || !shape_ok {
                return Err(EngineError::invalid(
                    "call",
                    format!(
                        "input {} has {} {:?} but the function was traced with {} {:?}",
                        i, arg.dtype, arg.shape, spec.dtype, spec.shape
                    ),
                ));
            }
        }
        Ok(())
    }

    /// The same computation with every floating value in double precision
    pub fn widened(&self) -> Graph {
        let wide = |d: Dtype| if d.is_floating() { Dtype::Float64 } else { d };
        Graph {
            inputs: self
                .inputs
                .iter()
                .map(|s| TensorSpec {
                    shape: s.shape.clone(),
                    dtype: wide(s.dtype),
                })
                .collect(),
            constants: self.constants.iter().map(|c| Arc::new(c.astype(wide(c.dtype)))).collect(),
            nodes: self
                .nodes
                .iter()
                .map(|n| GraphNode {
                    prim: n.prim.widened(),
                    inputs: n.inputs.clone(),
                })
                .collect(),
            outputs: self.outputs.clone(),
        }
    }
}

// ============================================================================
// Capture
// ============================================================================

struct Builder {
    trace: u64,
    graph: Graph,
    nodes: HashMap<usize, usize>,
    constants: HashMap<usize, usize>,
}

impl Builder {
    fn constant(&mut self, t: &Arc<Tensor>) -> GraphRef {
        let key = Arc::as_ptr(t) as usize;
        if let Some(&i) = self.constants.get(&key) {
            return GraphRef::Constant(i);
        }
        let i = self.graph.constants.len();
        self.graph.constants.push(t.clone());
        self.constants.insert(key, i);
        GraphRef::Constant(i)
    }

    /// Reference to an operand whose producer, if any, is already emitted
    fn reference(&mut self, op: &Operand) -> EngineResult<GraphRef> {
        match op {
            Operand::Constant(t) => Ok(self.constant(t)),
            Operand::Node(node, k) if node.trace != self.trace => {
                let value = node
                    .values
                    .get(*k)
                    .ok_or_else(|| EngineError::runtime("trace node output out of range"))?;
                Ok(self.constant(value))
            }
            Operand::Node(node, k) => match &node.kind {
                NodeKind::Input(i) => Ok(GraphRef::Input(*i)),
                NodeKind::Apply { .. } => self
                    .nodes
                    .get(&node_key(node))
                    .map(|&idx| GraphRef::Node(idx, *k))
                    .ok_or_else(|| EngineError::runtime("trace node referenced before it was emitted")),
            },
        }
    }

    fn pending(&self, op: &Operand) -> Option<Arc<TraceNode>> {
        match op {
            Operand::Node(node, _)
                if node.trace == self.trace
                    && matches!(node.kind, NodeKind::Apply { .. })
                    && !self.nodes.contains_key(&node_key(node)) =>
            {
                Some(node.clone())
            }
            _ => None,
        }
    }

    /// Emit `root` and everything it depends on, producers first
    fn emit(&mut self, root: &Operand) -> EngineResult<()> {
        let mut stack: Vec<(Arc<TraceNode>, bool)> = self.pending(root).map(|n| (n, false)).into_iter().collect();
        while let Some((node, expanded)) = stack.pop() {
            if self.nodes.contains_key(&node_key(&node)) {
                continue;
            }
            let NodeKind::Apply { prim, inputs } = &node.kind else {
                continue;
            };
            if !expanded {
                stack.push((node.clone(), true));
                for op in inputs {
                    if let Some(child) = self.pending(op) {
                        stack.push((child, false));
                    }
                }
                continue;
            }
            let refs = inputs.iter().map(|op| self.reference(op)).collect::<EngineResult<Vec<_>>>()?;
            self.nodes.insert(node_key(&node), self.graph.nodes.len());
            self.graph.nodes.push(GraphNode {
                prim: prim.clone(),
                inputs: refs,
            });
        }
        Ok(())
    }
}

/// Flatten the part of trace `trace` that produces `outputs`
pub fn capture(trace: u64, inputs: Vec<TensorSpec>, outputs: &[Operand]) -> EngineResult<Graph> {
    let mut builder = Builder {
        trace,
        graph: Graph {
            inputs,
            constants: Vec::new(),
            nodes: Vec::new(),
            outputs: Vec::new(),
        },
        nodes: HashMap::new(),
        constants: HashMap::new(),
    };
    for out in outputs {
        builder.emit(out)?;
        let r = builder.reference(out)?;
        builder.graph.outputs.push(r);
    }
    Ok(builder.graph)
}

// ============================================================================
// Graphviz
// ============================================================================

fn spec_label(t: &Tensor) -> String {
    format!("{} {:?}", t.dtype, t.shape)
}

fn operand_key(op: &Operand) -> usize {
    match op {
        Operand::Constant(t) => Arc::as_ptr(t) as usize,
        Operand::Node(node, _) => node_key(node),
    }
}

/// Render the recorded history of `outputs` in Graphviz format.
/// Values without history appear as constant leaves.
pub fn to_dot(outputs: &[Operand]) -> String {
    let mut ids: HashMap<usize, String> = HashMap::new();
    let mut edges: Vec<(usize, String)> = Vec::new();
    let mut out = String::from("digraph {\n");
    let mut stack: Vec<Operand> = outputs.to_vec();
    while let Some(op) = stack.pop() {
        let key = operand_key(&op);
        if ids.contains_key(&key) {
            continue;
        }
        let prefix = if matches!(op, Operand::Constant(_)) { "c" } else { "n" };
        let id = format!("{}{}", prefix, ids.len());
        ids.insert(key, id.clone());
        match &op {
            Operand::Constant(t) => {
                let _ = writeln!(out, "  {} [label=\"constant {}\", shape=box];", id, spec_label(t));
            }
            Operand::Node(node, _) => match &node.kind {
                NodeKind::Input(i) => {
                    let value = node.values.first().map(|t| spec_label(t)).unwrap_or_default();
                    let _ = writeln!(out, "  {} [label=\"input {} {}\", shape=box];", id, i, value);
                }
                NodeKind::Apply { prim, inputs } => {
                    let _ = writeln!(out, "  {} [label=\"{}\"];", id, prim.name());
                    for input in inputs {
                        edges.push((operand_key(input), id.clone()));
                        stack.push(input.clone());
                    }
                }
            },
        }
    }
    for (child, parent) in edges {
        if let Some(source) = ids.get(&child) {
            let _ = writeln!(out, "  {} -> {};", source, parent);
        }
    }
    out.push_str("}\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_engine::BinaryOp;
    use pretty_assertions::assert_eq;

    fn input(trace: u64, i: usize, t: Tensor) -> Arc<TraceNode> {
        Arc::new(TraceNode {
            trace,
            kind: NodeKind::Input(i),
            values: vec![Arc::new(t)],
        })
    }

    fn apply(trace: u64, prim: Prim, inputs: Vec<Operand>) -> Arc<TraceNode> {
        let tensors: Vec<Arc<Tensor>> = inputs
            .iter()
            .map(|op| match op {
                Operand::Constant(t) => t.clone(),
                Operand::Node(n, k) => n.values[*k].clone(),
            })
            .collect();
        let refs: Vec<&Tensor> = tensors.iter().map(|t| t.as_ref()).collect();
        let values = prim::eval(&prim, &refs).unwrap().into_iter().map(Arc::new).collect();
        Arc::new(TraceNode {
            trace,
            kind: NodeKind::Apply { prim, inputs },
            values,
        })
    }

    fn vector(values: &[f64]) -> Tensor {
        Tensor::real(vec![values.len()], Dtype::Float32, values.to_vec())
    }

    #[test]
    fn test_capture_and_replay() {
        let x = input(7, 0, vector(&[1.0, 2.0]));
        let c = Arc::new(vector(&[10.0, 20.0]));
        let sum = apply(7, Prim::Binary(BinaryOp::Add), vec![Operand::Node(x.clone(), 0), Operand::Constant(c)]);
        let sq = apply(7, Prim::Binary(BinaryOp::Multiply), vec![Operand::Node(sum.clone(), 0), Operand::Node(sum, 0)]);
        let graph = capture(7, vec![TensorSpec::of(&vector(&[0.0, 0.0]))], &[Operand::Node(sq, 0)]).unwrap();
        assert_eq!(graph.nodes.len(), 2);
        assert_eq!(graph.constants.len(), 1);
        let out = graph.eval(&[Arc::new(vector(&[0.0, 1.0]))]).unwrap();
        assert_eq!(out[0].values().to_vec(), vec![100.0, 441.0]);
    }

    #[test]
    fn test_outer_trace_values_become_constants() {
        let outer = input(3, 0, vector(&[5.0]));
        let inner = input(4, 0, vector(&[1.0]));
        let sum = apply(4, Prim::Binary(BinaryOp::Add), vec![Operand::Node(inner, 0), Operand::Node(outer, 0)]);
        let graph = capture(4, vec![TensorSpec::of(&vector(&[0.0]))], &[Operand::Node(sum, 0)]).unwrap();
        assert_eq!(graph.constants.len(), 1);
        let out = graph.eval(&[Arc::new(vector(&[2.0]))]).unwrap();
        assert_eq!(out[0].values().to_vec(), vec![7.0]);
    }

    #[test]
    fn test_identity_output_refers_to_input() {
        let x = input(9, 0, vector(&[1.0]));
        let graph = capture(9, vec![TensorSpec::of(&vector(&[0.0]))], &[Operand::Node(x, 0)]).unwrap();
        assert_eq!(graph.outputs, vec![GraphRef::Input(0)]);
    }

    #[test]
    fn test_check_inputs() {
        let graph = Graph {
            inputs: vec![TensorSpec::of(&vector(&[0.0, 0.0]))],
            constants: Vec::new(),
            nodes: Vec::new(),
            outputs: vec![GraphRef::Input(0)],
        };
        assert!(graph.check_inputs(&[&vector(&[1.0, 2.0])], false).is_ok());
        assert!(graph.check_inputs(&[&vector(&[1.0, 2.0, 3.0])], false).is_err());
        assert!(graph.check_inputs(&[&vector(&[1.0, 2.0, 3.0])], true).is_ok());
    }

    #[test]
    fn test_dot_rendering() {
        let x = input(1, 0, vector(&[1.0]));
        let y = apply(1, Prim::Unary(mlx_engine::UnaryOp::Exp), vec![Operand::Node(x, 0)]);
        let dot = to_dot(&[Operand::Node(y, 0)]);
        assert!(dot.starts_with("digraph {"));
        assert!(dot.contains("[label=\"exp\"]"));
        assert!(dot.contains("n1 -> n0;"));
    }
}
