//! The CPU Engine
//!
//! [`CpuEngine`] evaluates every primitive eagerly through one path,
//! `Shared::apply`. Arrays computed from traced values carry the
//! [`TraceNode`] that produced them; everything else is plain storage.

use std::any::Any;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use mlx_engine::{
    ArgReduceOp, Array, ArrayImpl, BinaryOp, CollectiveOp, ConvParams, CustomKernel, Device, DeviceKind, Dtype, Engine,
    EngineError, EngineResult, ExportSession, FftOp, FileFormat, Group, HostBuffer, HostFn, InfoValue, KernelLaunch,
    KernelSpec, LinalgOp, Loaded, MemoryLimit, MemoryStat, MetaValue, NativeFn, NativeKwFn, PadMode, QuantMode,
    ReduceOp, ScanOp, Stream, UnaryOp,
};
use tracing::debug;

use crate::export::{self, CpuExporter};
use crate::graph::{self, capture, next_trace_id, Graph, NodeKind, Operand, TensorSpec, TraceNode};
use crate::io::{self, Meta};
use crate::layout;
use crate::memory::{Lease, Memory};
use crate::prim::{self, Prim};
use crate::random::{self, GlobalKey};
use crate::tensor::{Data, Tensor};

const BACKEND: &str = "cpu";

// ============================================================================
// Arrays
// ============================================================================

/// Storage of one CPU array
#[derive(Debug)]
pub struct CpuArray {
    tensor: Arc<Tensor>,
    node: Option<(Arc<TraceNode>, usize)>,
    _lease: Lease,
}

impl CpuArray {
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    /// True while the array is part of a function being traced
    pub fn is_traced(&self) -> bool {
        self.node.is_some()
    }

    fn operand(&self) -> Operand {
        match &self.node {
            Some((node, k)) => Operand::Node(node.clone(), *k),
            None => Operand::Constant(self.tensor.clone()),
        }
    }
}

impl ArrayImpl for CpuArray {
    fn shape(&self) -> &[usize] {
        &self.tensor.shape
    }

    fn dtype(&self) -> Dtype {
        self.tensor.dtype
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub(crate) fn cpu_array(a: &Array) -> EngineResult<&CpuArray> {
    a.downcast_ref::<CpuArray>()
        .ok_or_else(|| EngineError::invalid(BACKEND, "array was created by a different engine"))
}

pub(crate) fn tensor_of(a: &Array) -> EngineResult<&Tensor> {
    cpu_array(a).map(CpuArray::tensor)
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug)]
pub(crate) struct Shared {
    memory: Arc<Memory>,
    key: GlobalKey,
    streams: AtomicUsize,
    groups: AtomicU64,
}

impl Shared {
    fn wrap(&self, tensor: Arc<Tensor>, node: Option<(Arc<TraceNode>, usize)>) -> Array {
        let lease = self.memory.alloc(tensor.nbytes());
        Array::new(CpuArray {
            tensor,
            node,
            _lease: lease,
        })
    }

    pub(crate) fn constant(&self, tensor: Tensor) -> Array {
        self.wrap(Arc::new(tensor), None)
    }

    /// Evaluate `prim` and record it when any input is traced
    pub(crate) fn apply(&self, prim: Prim, inputs: &[&Array]) -> EngineResult<Vec<Array>> {
        let cpu = inputs.iter().map(|a| cpu_array(a)).collect::<EngineResult<Vec<_>>>()?;
        let tensors: Vec<&Tensor> = cpu.iter().map(|c| c.tensor()).collect();
        let outputs = prim::eval(&prim, &tensors)?;
        let trace = cpu.iter().filter_map(|c| c.node.as_ref().map(|(n, _)| n.trace)).max();
        let Some(trace) = trace else {
            return Ok(outputs.into_iter().map(|t| self.constant(t)).collect());
        };
        let values: Vec<Arc<Tensor>> = outputs.into_iter().map(Arc::new).collect();
        let node = Arc::new(TraceNode {
            trace,
            kind: NodeKind::Apply {
                prim,
                inputs: cpu.iter().map(|c| c.operand()).collect(),
            },
            values: values.clone(),
        });
        Ok(values
            .into_iter()
            .enumerate()
            .map(|(k, v)| self.wrap(v, Some((node.clone(), k))))
            .collect())
    }

    fn apply1(&self, prim: Prim, inputs: &[&Array]) -> EngineResult<Array> {
        let name = prim.name();
        self.apply(prim, inputs)?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::runtime(format!("{} produced no output", name)))
    }

    /// Vector-Jacobian products of a traced graph
    fn pull_back(
        &self,
        graph: Arc<Graph>,
        primals: &[Array],
        outputs: &[Array],
        cotangents: &[Array],
    ) -> EngineResult<Vec<Array>> {
        if cotangents.len() != outputs.len() {
            return Err(EngineError::invalid(
                "vjp",
                format!("expected {} cotangents, got {}", outputs.len(), cotangents.len()),
            ));
        }
        let inputs: Vec<&Array> = primals.iter().chain(cotangents).collect();
        self.apply(Prim::Vjp(graph), &inputs)
    }

    /// Run `f` on fresh traced copies of `inputs` and capture the result
    pub(crate) fn trace(&self, f: &mut HostFn<'_>, inputs: &[Array]) -> EngineResult<Graph> {
        let id = next_trace_id();
        let mut specs = Vec::with_capacity(inputs.len());
        let mut traced = Vec::with_capacity(inputs.len());
        for (i, a) in inputs.iter().enumerate() {
            let tensor = cpu_array(a)?.tensor.clone();
            specs.push(TensorSpec::of(&tensor));
            let node = Arc::new(TraceNode {
                trace: id,
                kind: NodeKind::Input(i),
                values: vec![tensor.clone()],
            });
            traced.push(self.wrap(tensor, Some((node, 0))));
        }
        let outputs = f(&traced)?;
        let operands = outputs
            .iter()
            .map(|o| cpu_array(o).map(CpuArray::operand))
            .collect::<EngineResult<Vec<_>>>()?;
        let graph = capture(id, specs, &operands)?;
        debug!(
            trace = id,
            inputs = graph.inputs.len(),
            nodes = graph.nodes.len(),
            outputs = graph.outputs.len(),
            "traced function"
        );
        Ok(graph)
    }

    /// Replay `graph` on `args` after checking them against its inputs
    pub(crate) fn call(&self, graph: &Arc<Graph>, args: &[Array], shapeless: bool) -> EngineResult<Vec<Array>> {
        let tensors = args.iter().map(tensor_of).collect::<EngineResult<Vec<_>>>()?;
        graph.check_inputs(&tensors, shapeless)?;
        let refs: Vec<&Array> = args.iter().collect();
        self.apply(Prim::Call(graph.clone()), &refs)
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Reference CPU engine. Clones share all state.
#[derive(Debug, Clone)]
pub struct CpuEngine {
    shared: Arc<Shared>,
}

impl Default for CpuEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuEngine {
    /// Engine whose global random key is seeded from the clock
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos() as u64);
        Self::with_seed(seed)
    }

    pub fn with_seed(seed: u64) -> Self {
        CpuEngine {
            shared: Arc::new(Shared {
                memory: Arc::new(Memory::default()),
                key: GlobalKey::new(seed),
                streams: AtomicUsize::new(2),
                groups: AtomicU64::new(1),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    fn unary_prim(&self, prim: Prim, a: &Array) -> EngineResult<Array> {
        self.shared.apply1(prim, &[a])
    }

    /// Explicit key, or a fresh subkey of the global key
    fn key_or_global(&self, key: Option<&Array>) -> EngineResult<Array> {
        match key {
            Some(k) => Ok(k.clone()),
            None => Ok(self.shared.constant(self.shared.key.next()?)),
        }
    }

    fn singleton_group(&self) -> Group {
        Group {
            id: self.shared.groups.fetch_add(1, Ordering::Relaxed),
            rank: 0,
            size: 1,
            backend: "singleton".into(),
        }
    }
}

fn buffer_data(data: HostBuffer) -> Data {
    match data {
        HostBuffer::Bool(v) => Data::Real(v.into_iter().map(|b| if b { 1.0 } else { 0.0 }).collect()),
        HostBuffer::Int(v) => Data::Real(v.into_iter().map(|x| x as f64).collect()),
        HostBuffer::UInt(v) => Data::Real(v.into_iter().map(|x| x as f64).collect()),
        HostBuffer::Float32(v) => Data::Real(v.into_iter().map(f64::from).collect()),
        HostBuffer::Float64(v) => Data::Real(v),
        HostBuffer::Complex(v) => Data::Complex(v),
    }
}

fn meta_of(shared: &Shared, meta: Meta) -> MetaValue {
    match meta {
        Meta::Str(s) => MetaValue::Str(s),
        Meta::StrList(l) => MetaValue::StrList(l),
        Meta::Tensor(t) => MetaValue::Array(shared.constant(t)),
    }
}

fn io_error(op: &'static str) -> impl Fn(io::FormatError) -> EngineError {
    move |e| EngineError::io(op, e)
}

fn named<'a>(arrays: &'a IndexMap<String, Array>) -> EngineResult<Vec<(&'a str, &'a Tensor)>> {
    arrays
        .iter()
        .map(|(name, a)| tensor_of(a).map(|t| (name.as_str(), t)))
        .collect()
}

impl Engine for CpuEngine {
    fn name(&self) -> &str {
        BACKEND
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn from_buffer(&self, data: HostBuffer, shape: &[usize], dtype: Dtype) -> EngineResult<Array> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(EngineError::invalid(
                "array",
                format!("{} values cannot fill shape {:?}", data.len(), shape),
            ));
        }
        Ok(self.shared.constant(Tensor::new(shape.to_vec(), dtype, buffer_data(data))))
    }

    fn to_buffer(&self, a: &Array) -> EngineResult<HostBuffer> {
        let t = tensor_of(a)?;
        let v = t.values();
        Ok(match t.dtype {
            Dtype::Bool => HostBuffer::Bool(v.iter().map(|&x| x != 0.0).collect()),
            Dtype::Complex64 => HostBuffer::Complex(t.complex_values().into_owned()),
            Dtype::Float64 => HostBuffer::Float64(v.into_owned()),
            d if d.is_floating() => HostBuffer::Float32(v.iter().map(|&x| x as f32).collect()),
            d if d.is_unsigned() => HostBuffer::UInt(v.iter().map(|&x| x as u64).collect()),
            _ => HostBuffer::Int(v.iter().map(|&x| x as i64).collect()),
        })
    }

    fn astype(&self, a: &Array, dtype: Dtype, _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(Prim::AsType(dtype), a)
    }

    fn view(&self, a: &Array, dtype: Dtype, _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(Prim::View(dtype), a)
    }

    fn unary(&self, op: UnaryOp, a: &Array, _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(Prim::Unary(op), a)
    }

    fn binary(&self, op: BinaryOp, a: &Array, b: &Array, _s: &Stream) -> EngineResult<Array> {
        self.shared.apply1(Prim::Binary(op), &[a, b])
    }

    fn select(&self, cond: &Array, x: &Array, y: &Array, _s: &Stream) -> EngineResult<Array> {
        self.shared.apply1(Prim::Select, &[cond, x, y])
    }

    fn reduce(&self, op: ReduceOp, a: &Array, axes: &[usize], keepdims: bool, _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(
            Prim::Reduce {
                op,
                axes: axes.to_vec(),
                keepdims,
            },
            a,
        )
    }

    fn arg_reduce(&self, op: ArgReduceOp, a: &Array, axis: usize, keepdims: bool, _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(Prim::ArgReduce { op, axis, keepdims }, a)
    }

    fn scan(
        &self,
        op: ScanOp,
        a: &Array,
        axis: usize,
        reverse: bool,
        inclusive: bool,
        _s: &Stream,
    ) -> EngineResult<Array> {
        self.unary_prim(
            Prim::Scan {
                op,
                axis,
                reverse,
                inclusive,
            },
            a,
        )
    }

    fn sort(&self, a: &Array, axis: usize, _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(Prim::Sort { axis, indices: false }, a)
    }

    fn argsort(&self, a: &Array, axis: usize, _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(Prim::Sort { axis, indices: true }, a)
    }

    fn partition(&self, a: &Array, kth: usize, axis: usize, _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(
            Prim::Partition {
                kth,
                axis,
                indices: false,
            },
            a,
        )
    }

    fn argpartition(&self, a: &Array, kth: usize, axis: usize, _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(
            Prim::Partition {
                kth,
                axis,
                indices: true,
            },
            a,
        )
    }

    fn reshape(&self, a: &Array, shape: &[usize], _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(Prim::Reshape(shape.to_vec()), a)
    }

    fn transpose(&self, a: &Array, perm: &[usize], _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(Prim::Transpose(perm.to_vec()), a)
    }

    fn broadcast_to(&self, a: &Array, shape: &[usize], _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(Prim::Broadcast(shape.to_vec()), a)
    }

    fn concatenate(&self, arrays: &[Array], axis: usize, _s: &Stream) -> EngineResult<Array> {
        let refs: Vec<&Array> = arrays.iter().collect();
        self.shared.apply1(Prim::Concatenate { axis }, &refs)
    }

    fn slice(&self, a: &Array, start: &[i64], stop: &[i64], strides: &[i64], _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(
            Prim::Slice {
                start: start.to_vec(),
                stop: stop.to_vec(),
                strides: strides.to_vec(),
            },
            a,
        )
    }

    fn slice_update(
        &self,
        a: &Array,
        update: &Array,
        start: &[i64],
        stop: &[i64],
        strides: &[i64],
        _s: &Stream,
    ) -> EngineResult<Array> {
        let prim = Prim::SliceUpdate {
            start: start.to_vec(),
            stop: stop.to_vec(),
            strides: strides.to_vec(),
        };
        self.shared.apply1(prim, &[a, update])
    }

    fn take(&self, a: &Array, indices: &Array, axis: usize, _s: &Stream) -> EngineResult<Array> {
        self.shared.apply1(Prim::Take { axis }, &[a, indices])
    }

    fn take_along_axis(&self, a: &Array, indices: &Array, axis: usize, _s: &Stream) -> EngineResult<Array> {
        self.shared.apply1(Prim::TakeAlongAxis { axis }, &[a, indices])
    }

    fn put_along_axis(
        &self,
        a: &Array,
        indices: &Array,
        values: &Array,
        axis: usize,
        _s: &Stream,
    ) -> EngineResult<Array> {
        self.shared.apply1(Prim::PutAlongAxis { axis }, &[a, indices, values])
    }

    fn pad(
        &self,
        a: &Array,
        low: &[usize],
        high: &[usize],
        value: &Array,
        mode: PadMode,
        _s: &Stream,
    ) -> EngineResult<Array> {
        let prim = Prim::Pad {
            low: low.to_vec(),
            high: high.to_vec(),
            mode,
        };
        self.shared.apply1(prim, &[a, value])
    }

    fn as_strided(&self, a: &Array, shape: &[usize], strides: &[i64], offset: usize, _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(
            Prim::AsStrided {
                shape: shape.to_vec(),
                strides: strides.to_vec(),
                offset,
            },
            a,
        )
    }

    fn matmul(&self, a: &Array, b: &Array, _s: &Stream) -> EngineResult<Array> {
        self.shared.apply1(Prim::Matmul, &[a, b])
    }

    fn linalg(&self, op: LinalgOp, inputs: &[Array], _s: &Stream) -> EngineResult<Vec<Array>> {
        if inputs.len() != op.input_count() {
            return Err(EngineError::invalid(
                op.name(),
                format!("expected {} inputs, got {}", op.input_count(), inputs.len()),
            ));
        }
        let refs: Vec<&Array> = inputs.iter().collect();
        self.shared.apply(Prim::Linalg(op), &refs)
    }

    fn fft(&self, a: &Array, n: &[usize], axes: &[usize], op: FftOp, _s: &Stream) -> EngineResult<Array> {
        self.unary_prim(
            Prim::Fft {
                n: n.to_vec(),
                axes: axes.to_vec(),
                op,
            },
            a,
        )
    }

    fn conv_general(&self, input: &Array, weight: &Array, params: &ConvParams, _s: &Stream) -> EngineResult<Array> {
        self.shared.apply1(Prim::Conv(params.clone()), &[input, weight])
    }

    fn quantize(&self, w: &Array, group_size: usize, bits: u32, mode: QuantMode, _s: &Stream) -> EngineResult<Vec<Array>> {
        self.shared.apply(Prim::Quantize { group_size, bits, mode }, &[w])
    }

    fn dequantize(
        &self,
        w: &Array,
        scales: &Array,
        biases: Option<&Array>,
        group_size: usize,
        bits: u32,
        mode: QuantMode,
        dtype: Option<Dtype>,
        _s: &Stream,
    ) -> EngineResult<Array> {
        let prim = Prim::Dequantize {
            group_size,
            bits,
            mode,
            dtype,
        };
        match biases {
            Some(b) => self.shared.apply1(prim, &[w, scales, b]),
            None => self.shared.apply1(prim, &[w, scales]),
        }
    }

    fn seed(&self, seed: u64) {
        self.shared.key.seed(seed);
    }

    fn key(&self, seed: u64) -> EngineResult<Array> {
        Ok(self.shared.constant(random::key_tensor(random::key_words(seed))))
    }

    fn split_key(&self, key: Option<&Array>, num: usize, _s: &Stream) -> EngineResult<Array> {
        let key = self.key_or_global(key)?;
        self.unary_prim(Prim::SplitKey { num }, &key)
    }

    fn random_uniform(&self, shape: &[usize], dtype: Dtype, key: Option<&Array>, _s: &Stream) -> EngineResult<Array> {
        let key = self.key_or_global(key)?;
        self.unary_prim(
            Prim::RandomUniform {
                shape: shape.to_vec(),
                dtype,
            },
            &key,
        )
    }

    fn random_normal(&self, shape: &[usize], dtype: Dtype, key: Option<&Array>, _s: &Stream) -> EngineResult<Array> {
        let key = self.key_or_global(key)?;
        self.unary_prim(
            Prim::RandomNormal {
                shape: shape.to_vec(),
                dtype,
            },
            &key,
        )
    }

    fn compile(&self, f: &mut HostFn<'_>, inputs: &[Array], shapeless: bool) -> EngineResult<NativeFn> {
        let graph = Arc::new(self.shared.trace(f, inputs)?);
        let shared = Arc::clone(&self.shared);
        Ok(Arc::new(move |args: &[Array]| shared.call(&graph, args, shapeless)))
    }

    fn vjp(
        &self,
        f: &mut HostFn<'_>,
        primals: &[Array],
        cotangents: &[Array],
    ) -> EngineResult<(Vec<Array>, Vec<Array>)> {
        let graph = Arc::new(self.shared.trace(f, primals)?);
        let outputs = self.shared.call(&graph, primals, false)?;
        let grads = self.shared.pull_back(graph, primals, &outputs, cotangents)?;
        Ok((outputs, grads))
    }

    fn vjp_with(
        &self,
        f: &mut HostFn<'_>,
        primals: &[Array],
        seed: &mut HostFn<'_>,
    ) -> EngineResult<(Vec<Array>, Vec<Array>)> {
        let graph = Arc::new(self.shared.trace(f, primals)?);
        let outputs = self.shared.call(&graph, primals, false)?;
        let cotangents = seed(&outputs)?;
        let grads = self.shared.pull_back(graph, primals, &outputs, &cotangents)?;
        Ok((outputs, grads))
    }

    fn jvp(
        &self,
        f: &mut HostFn<'_>,
        primals: &[Array],
        tangents: &[Array],
    ) -> EngineResult<(Vec<Array>, Vec<Array>)> {
        if tangents.len() != primals.len() {
            return Err(EngineError::invalid(
                "jvp",
                format!("expected {} tangents, got {}", primals.len(), tangents.len()),
            ));
        }
        let graph = Arc::new(self.shared.trace(f, primals)?);
        let outputs = self.shared.call(&graph, primals, false)?;
        let inputs: Vec<&Array> = primals.iter().chain(tangents).collect();
        let derivatives = self.shared.apply(Prim::Jvp(graph), &inputs)?;
        Ok((outputs, derivatives))
    }

    fn vmap(
        &self,
        f: &mut HostFn<'_>,
        inputs: &[Array],
        in_axes: &[Option<usize>],
        out_axes: &[Option<usize>],
    ) -> EngineResult<Vec<Array>> {
        if in_axes.len() != inputs.len() {
            return Err(EngineError::invalid(
                "vmap",
                format!("in_axes has {} entries for {} inputs", in_axes.len(), inputs.len()),
            ));
        }
        let first = Tensor::scalar(0.0, Dtype::Int32);
        let mut samples = Vec::with_capacity(inputs.len());
        for (a, axis) in inputs.iter().zip(in_axes) {
            let t = tensor_of(a)?;
            match axis {
                Some(axis) if t.shape.get(*axis) == Some(&0) => {
                    return Err(EngineError::invalid("vmap", "cannot map over an empty axis"));
                }
                Some(axis) => samples.push(self.shared.constant(layout::take(t, &first, *axis)?)),
                None => samples.push(a.clone()),
            }
        }
        let graph = Arc::new(self.shared.trace(f, &samples)?);
        let prim = Prim::Vmap {
            graph,
            in_axes: in_axes.to_vec(),
            out_axes: out_axes.to_vec(),
        };
        let refs: Vec<&Array> = inputs.iter().collect();
        self.shared.apply(prim, &refs)
    }

    fn export_function(
        &self,
        path: &Path,
        f: &mut HostFn<'_>,
        args: &[Array],
        kwarg_names: &[String],
        shapeless: bool,
    ) -> EngineResult<()> {
        let mut session = CpuExporter::new(self.clone(), path, shapeless);
        session.record(f, args, kwarg_names)?;
        session.close()
    }

    fn exporter(&self, path: &Path, shapeless: bool) -> EngineResult<Box<dyn ExportSession>> {
        Ok(Box::new(CpuExporter::new(self.clone(), path, shapeless)))
    }

    fn import_function(&self, path: &Path) -> EngineResult<NativeKwFn> {
        export::import(Arc::clone(&self.shared), path)
    }

    fn export_to_dot(&self, path: &Path, outputs: &[Array]) -> EngineResult<()> {
        let operands = outputs
            .iter()
            .map(|a| cpu_array(a).map(CpuArray::operand))
            .collect::<EngineResult<Vec<_>>>()?;
        std::fs::write(path, graph::to_dot(&operands)).map_err(|e| EngineError::io("export_to_dot", e))
    }

    fn eval(&self, arrays: &[Array]) -> EngineResult<()> {
        arrays.iter().try_for_each(|a| cpu_array(a).map(|_| ()))
    }

    fn synchronize(&self, _s: Option<&Stream>) -> EngineResult<()> {
        Ok(())
    }

    fn load(&self, path: &Path, format: FileFormat, _s: &Stream) -> EngineResult<Loaded> {
        debug!(path = %path.display(), format = format.name(), "loading arrays");
        match format {
            FileFormat::Npy => {
                let t = io::load_npy(path).map_err(io_error("load"))?;
                Ok(Loaded::Single(self.shared.constant(t)))
            }
            FileFormat::Safetensors => {
                let (tensors, metadata) = io::load_safetensors(path).map_err(io_error("load"))?;
                Ok(Loaded::Arrays {
                    arrays: tensors.into_iter().map(|(k, t)| (k, self.shared.constant(t))).collect(),
                    metadata: metadata.into_iter().map(|(k, v)| (k, MetaValue::Str(v))).collect(),
                })
            }
            FileFormat::Gguf => {
                let (tensors, metadata) = io::load_gguf(path).map_err(io_error("load"))?;
                Ok(Loaded::Arrays {
                    arrays: tensors.into_iter().map(|(k, t)| (k, self.shared.constant(t))).collect(),
                    metadata: metadata.into_iter().map(|(k, m)| (k, meta_of(&self.shared, m))).collect(),
                })
            }
            FileFormat::Npz => Err(EngineError::unsupported("load npz", BACKEND)),
        }
    }

    fn save(&self, path: &Path, a: &Array) -> EngineResult<()> {
        io::save_npy(path, tensor_of(a)?).map_err(io_error("save"))
    }

    fn save_safetensors(
        &self,
        path: &Path,
        arrays: &IndexMap<String, Array>,
        metadata: &IndexMap<String, String>,
    ) -> EngineResult<()> {
        io::save_safetensors(path, &named(arrays)?, metadata).map_err(io_error("save_safetensors"))
    }

    fn save_gguf(
        &self,
        path: &Path,
        arrays: &IndexMap<String, Array>,
        metadata: &IndexMap<String, MetaValue>,
    ) -> EngineResult<()> {
        let meta = metadata
            .iter()
            .map(|(k, v)| {
                let m = match v {
                    MetaValue::Str(s) => Meta::Str(s.clone()),
                    MetaValue::StrList(l) => Meta::StrList(l.clone()),
                    MetaValue::Array(a) => Meta::Tensor(tensor_of(a)?.clone()),
                };
                Ok((k.clone(), m))
            })
            .collect::<EngineResult<IndexMap<_, _>>>()?;
        io::save_gguf(path, &named(arrays)?, &meta).map_err(io_error("save_gguf"))
    }

    fn default_stream(&self, device: Device) -> Stream {
        match device.kind {
            DeviceKind::Cpu => Stream::new(0, device),
            DeviceKind::Gpu => Stream::new(1, device),
        }
    }

    fn new_stream(&self, device: Device) -> EngineResult<Stream> {
        Ok(Stream::new(self.shared.streams.fetch_add(1, Ordering::Relaxed), device))
    }

    fn is_available(&self, device: Device) -> bool {
        device.kind == DeviceKind::Cpu
    }

    fn device_count(&self, kind: DeviceKind) -> usize {
        match kind {
            DeviceKind::Cpu => 1,
            DeviceKind::Gpu => 0,
        }
    }

    fn device_info(&self, device: Device) -> EngineResult<IndexMap<String, InfoValue>> {
        if device.kind != DeviceKind::Cpu {
            return Err(EngineError::unsupported("device_info", format!("{} ({})", BACKEND, device.kind.name())));
        }
        let threads = std::thread::available_parallelism().map_or(1, |n| n.get());
        let mut info = IndexMap::new();
        info.insert("device_name".to_string(), InfoValue::Str("cpu".to_string()));
        info.insert("architecture".to_string(), InfoValue::Str(std::env::consts::ARCH.to_string()));
        info.insert("thread_count".to_string(), InfoValue::Int(threads as u64));
        Ok(info)
    }

    fn memory_stat(&self, stat: MemoryStat) -> usize {
        self.shared.memory.stat(stat)
    }

    fn reset_peak_memory(&self) {
        self.shared.memory.reset_peak();
    }

    fn set_limit(&self, limit: MemoryLimit, bytes: usize) -> EngineResult<usize> {
        Ok(self.shared.memory.set_limit(limit, bytes))
    }

    fn clear_cache(&self) {
        self.shared.memory.clear_cache();
    }

    fn metal_is_available(&self) -> bool {
        false
    }

    fn metal_device_info(&self) -> EngineResult<IndexMap<String, InfoValue>> {
        Err(EngineError::unsupported("metal_device_info", BACKEND))
    }

    fn metal_start_capture(&self, _path: &Path) -> EngineResult<()> {
        Err(EngineError::unsupported("metal_start_capture", BACKEND))
    }

    fn metal_stop_capture(&self) -> EngineResult<()> {
        Err(EngineError::unsupported("metal_stop_capture", BACKEND))
    }

    fn metal_kernel(&self, spec: KernelSpec) -> EngineResult<Arc<dyn CustomKernel>> {
        debug!(name = %spec.name, "building custom kernel");
        Ok(Arc::new(CpuKernel { spec }))
    }

    fn distributed_is_available(&self, backend: &str) -> bool {
        matches!(backend, "any" | "singleton")
    }

    fn init_distributed(&self, strict: bool, backend: &str) -> EngineResult<Option<Group>> {
        if self.distributed_is_available(backend) {
            return Ok(Some(self.singleton_group()));
        }
        if strict {
            return Err(EngineError::invalid(
                "init",
                format!("distributed backend '{}' is not available", backend),
            ));
        }
        Ok(None)
    }

    fn split_group(&self, _group: &Group, _color: i64, _key: i64) -> EngineResult<Group> {
        Ok(self.singleton_group())
    }

    fn collective(&self, _op: CollectiveOp, a: &Array, _group: Option<&Group>, _s: &Stream) -> EngineResult<Array> {
        cpu_array(a)?;
        Ok(a.clone())
    }

    fn send(&self, _a: &Array, _dst: usize, _group: Option<&Group>, _s: &Stream) -> EngineResult<Array> {
        Err(EngineError::unsupported("send", BACKEND))
    }

    fn recv(
        &self,
        _shape: &[usize],
        _dtype: Dtype,
        _src: usize,
        _group: Option<&Group>,
        _s: &Stream,
    ) -> EngineResult<Array> {
        Err(EngineError::unsupported("recv", BACKEND))
    }
}

/// A custom kernel that can be described but not launched
#[derive(Debug)]
pub struct CpuKernel {
    spec: KernelSpec,
}

impl CustomKernel for CpuKernel {
    fn name(&self) -> &str {
        &self.spec.name
    }

    fn launch(&self, _launch: &KernelLaunch, _stream: &Stream) -> EngineResult<Vec<Array>> {
        Err(EngineError::unsupported(format!("metal kernel {}", self.spec.name), BACKEND))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn engine() -> CpuEngine {
        CpuEngine::with_seed(0)
    }

    fn vector(e: &CpuEngine, values: &[f32]) -> Array {
        e.from_buffer(HostBuffer::Float32(values.to_vec()), &[values.len()], Dtype::Float32)
            .unwrap()
    }

    #[test]
    fn test_buffer_round_trip() {
        let e = engine();
        let a = e.from_buffer(HostBuffer::Int(vec![1, -2, 3]), &[3], Dtype::Int32).unwrap();
        assert_eq!(e.to_buffer(&a).unwrap(), HostBuffer::Int(vec![1, -2, 3]));
        let b = e.from_buffer(HostBuffer::Float64(vec![1.5]), &[], Dtype::Float16).unwrap();
        assert_eq!(e.to_buffer(&b).unwrap(), HostBuffer::Float32(vec![1.5]));
        assert!(e.from_buffer(HostBuffer::Int(vec![1, 2]), &[3], Dtype::Int32).is_err());
    }

    #[test]
    fn test_untraced_results_have_no_history() {
        let e = engine();
        let s = e.default_stream(Device::cpu());
        let a = vector(&e, &[1.0, 2.0]);
        let b = e.binary(BinaryOp::Add, &a, &a, &s).unwrap();
        assert!(!cpu_array(&b).unwrap().is_traced());
        assert_eq!(e.to_buffer(&b).unwrap(), HostBuffer::Float32(vec![2.0, 4.0]));
    }

    #[test]
    fn test_compile_replays_on_new_inputs() {
        let e = engine();
        let s = e.default_stream(Device::cpu());
        let engine = e.clone();
        let mut f = move |args: &[Array]| -> EngineResult<Vec<Array>> {
            let sq = engine.binary(BinaryOp::Multiply, &args[0], &args[0], &s)?;
            Ok(vec![sq])
        };
        let compiled = e.compile(&mut f, &[vector(&e, &[1.0, 2.0])], false).unwrap();
        let out = compiled(&[vector(&e, &[3.0, 4.0])]).unwrap();
        assert_eq!(e.to_buffer(&out[0]).unwrap(), HostBuffer::Float32(vec![9.0, 16.0]));
        assert!(compiled(&[vector(&e, &[1.0])]).is_err());
    }

    #[test]
    fn test_memory_tracks_live_arrays() {
        let e = engine();
        let before = e.memory_stat(MemoryStat::Active);
        let a = vector(&e, &[0.0; 8]);
        assert_eq!(e.memory_stat(MemoryStat::Active), before + 32);
        drop(a);
        assert_eq!(e.memory_stat(MemoryStat::Active), before);
    }

    #[test]
    fn test_streams_and_distributed() {
        let e = engine();
        assert_eq!(e.default_stream(Device::gpu()).index, 1);
        assert_eq!(e.new_stream(Device::cpu()).unwrap().index, 2);
        assert_eq!(e.new_stream(Device::cpu()).unwrap().index, 3);
        let g = e.init_distributed(false, "any").unwrap().unwrap();
        assert_eq!((g.rank, g.size), (0, 1));
        assert!(e.init_distributed(false, "mpi").unwrap().is_none());
        assert!(e.init_distributed(true, "mpi").is_err());
        assert!(e.metal_device_info().unwrap_err().is_unsupported());
    }
}
