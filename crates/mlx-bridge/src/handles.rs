//! Handle Registry
//!
//! Host-visible wrappers around engine resources. Every handle is a
//! reference-counted cell: cloning a handle shares it, dropping the last
//! clone releases the engine value and nothing else.
//!
//! Handles that close over host values (functions, exporters, kernels)
//! keep those values in a `refs` list for as long as they live.

use std::cell::RefCell;
use std::fmt;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use mlx_engine::{Array, CustomKernel, Dtype, ExportSession, Group, KernelLaunch, NativeFn, NativeKwFn, Stream, TemplateArg};
use smol_str::SmolStr;
use tracing::debug;

use crate::context::SavedDefaults;
use crate::convert;
use crate::core::Core;
use crate::error::{BridgeError, BridgeResult};
use crate::value::{Hash, Value};

// ============================================================================
// ArrayHandle
// ============================================================================

/// Host reference to one engine array.
///
/// Index assignment rebinds the handle to the updated array, so every
/// clone of the handle observes the update.
#[derive(Debug, Clone)]
pub struct ArrayHandle(Rc<RefCell<Array>>);

impl ArrayHandle {
    pub fn new(array: Array) -> Self {
        ArrayHandle(Rc::new(RefCell::new(array)))
    }

    /// The wrapped array
    pub fn get(&self) -> Array {
        self.0.borrow().clone()
    }

    pub fn set(&self, array: Array) {
        *self.0.borrow_mut() = array;
    }

    pub fn ptr_eq(&self, other: &ArrayHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

// ============================================================================
// FunctionHandle
// ============================================================================

/// Calling convention of a function handle, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    /// Arrays in, arrays out
    Vector,
    /// Positional and keyword arrays in, arrays out
    ArgsKwargs,
    /// Arrays in, `[values, gradients]` out
    ValueAndGrad,
}

type HostBody = dyn Fn(&Core, &[Value], &Hash) -> BridgeResult<Value>;

/// What a function handle runs
pub enum FunctionBody {
    /// Engine-native function; replays release the host lock
    Native(NativeFn),
    /// Engine-native function taking keyword arrays
    NativeKw(NativeKwFn),
    /// Host callable compiled per input signature
    Compiled(CompiledFunction),
    /// Closure over host callables; never releases the lock
    Host(Rc<HostBody>),
}

impl fmt::Debug for FunctionBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionBody::Native(_) => write!(f, "Native"),
            FunctionBody::NativeKw(_) => write!(f, "NativeKw"),
            FunctionBody::Compiled(c) => write!(f, "Compiled({} signatures)", c.cached()),
            FunctionBody::Host(_) => write!(f, "Host"),
        }
    }
}

#[derive(Debug)]
struct FunctionInner {
    name: SmolStr,
    kind: FunctionKind,
    body: FunctionBody,
    refs: Vec<Value>,
}

/// Host handle to a callable transformation
#[derive(Debug, Clone)]
pub struct FunctionHandle(Rc<FunctionInner>);

impl FunctionHandle {
    pub fn new(name: &str, kind: FunctionKind, body: FunctionBody, refs: Vec<Value>) -> Self {
        FunctionHandle(Rc::new(FunctionInner {
            name: SmolStr::new(name),
            kind,
            body,
            refs,
        }))
    }

    /// Host closure body
    pub fn host(
        name: &str,
        kind: FunctionKind,
        refs: Vec<Value>,
        body: impl Fn(&Core, &[Value], &Hash) -> BridgeResult<Value> + 'static,
    ) -> Self {
        Self::new(name, kind, FunctionBody::Host(Rc::new(body)), refs)
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> FunctionKind {
        self.0.kind
    }

    /// Host values kept alive by this handle
    pub fn refs(&self) -> &[Value] {
        &self.0.refs
    }

    /// Whether calls run inside a release window
    pub fn releases_gvl(&self) -> bool {
        matches!(
            self.0.body,
            FunctionBody::Native(_) | FunctionBody::NativeKw(_) | FunctionBody::Compiled(_)
        )
    }

    pub fn ptr_eq(&self, other: &FunctionHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Call with positional `args` and keyword `kwargs`
    pub fn call(&self, core: &Core, args: &[Value], kwargs: &Hash) -> BridgeResult<Value> {
        match &self.0.body {
            FunctionBody::Native(f) => {
                if !kwargs.is_empty() {
                    return Err(BridgeError::argument(format!(
                        "{} takes no keyword arguments",
                        self.name()
                    )));
                }
                let inputs = convert::to_arrays(core, args)?;
                let f = Arc::clone(f);
                let outputs = core.release(move |_| f(&inputs))?;
                Ok(convert::project(outputs))
            }
            FunctionBody::NativeKw(f) => {
                let inputs = convert::to_arrays(core, args)?;
                let named = kwargs
                    .entries()
                    .into_iter()
                    .map(|(k, v)| Ok((k.to_string(), convert::to_array(core, &v, None)?)))
                    .collect::<BridgeResult<Vec<_>>>()?;
                let f = Arc::clone(f);
                let outputs = core.release(move |_| f(&inputs, &named))?;
                Ok(convert::project(outputs))
            }
            FunctionBody::Compiled(compiled) => compiled.call(core, args, kwargs),
            FunctionBody::Host(body) => body(core, args, kwargs),
        }
    }
}

// ============================================================================
// CompiledFunction
// ============================================================================

/// Input signature a compiled trace is valid for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Signature {
    shapes: Vec<Vec<usize>>,
    dtypes: Vec<Dtype>,
}

impl Signature {
    /// Shapeless traces only depend on rank and dtype
    fn of(inputs: &[Array], shapeless: bool) -> Self {
        Signature {
            shapes: inputs
                .iter()
                .map(|a| if shapeless { vec![0; a.ndim()] } else { a.shape().to_vec() })
                .collect(),
            dtypes: inputs.iter().map(Array::dtype).collect(),
        }
    }
}

/// Host callable traced once per input signature, replayed natively afterwards
pub struct CompiledFunction {
    fun: Value,
    shapeless: bool,
    max_cached: usize,
    cache: RefCell<IndexMap<Signature, NativeFn>>,
}

impl CompiledFunction {
    pub fn new(fun: Value, shapeless: bool, max_cached: usize) -> Self {
        Self {
            fun,
            shapeless,
            max_cached: max_cached.max(1),
            cache: RefCell::new(IndexMap::new()),
        }
    }

    /// Number of traced signatures currently cached
    pub fn cached(&self) -> usize {
        self.cache.borrow().len()
    }

    fn call(&self, core: &Core, args: &[Value], kwargs: &Hash) -> BridgeResult<Value> {
        if !core.compile_enabled() {
            return core.call_value(&self.fun, args, kwargs);
        }
        if !kwargs.is_empty() {
            return Err(BridgeError::argument("compiled functions take positional arrays only"));
        }
        let inputs = convert::to_arrays(core, args)?;
        let signature = Signature::of(&inputs, self.shapeless);

        let cached = self.cache.borrow().get(&signature).cloned();
        let native = match cached {
            Some(native) => {
                debug!(inputs = inputs.len(), "compile cache hit");
                native
            }
            None => {
                debug!(inputs = inputs.len(), shapeless = self.shapeless, "compile cache miss");
                let fun = self.fun.clone();
                let mut host = core.host_fn(|arrays| {
                    let values: Vec<Value> = arrays.iter().cloned().map(Value::from).collect();
                    core.call_value(&fun, &values, &Hash::new())
                });
                let native = core.run_engine(|e| e.compile(&mut host, &inputs, self.shapeless))?;
                let mut cache = self.cache.borrow_mut();
                cache.insert(signature, Arc::clone(&native));
                while cache.len() > self.max_cached {
                    cache.shift_remove_index(0);
                }
                native
            }
        };
        let outputs = core.release(move |_| native(&inputs))?;
        Ok(convert::project(outputs))
    }
}

// ============================================================================
// ExporterHandle
// ============================================================================

#[derive(Debug)]
struct ExporterInner {
    /// Taken out while a call is recording
    session: Option<Box<dyn ExportSession>>,
    path: PathBuf,
    fun: Value,
    refs: Vec<Value>,
}

/// Open export session recording one trace per call
#[derive(Debug, Clone)]
pub struct ExporterHandle(Rc<RefCell<ExporterInner>>);

impl ExporterHandle {
    pub fn new(session: Box<dyn ExportSession>, path: PathBuf, fun: Value) -> Self {
        debug!(path = %path.display(), "opened exporter");
        let refs = vec![fun.clone()];
        ExporterHandle(Rc::new(RefCell::new(ExporterInner {
            session: Some(session),
            path,
            fun,
            refs,
        })))
    }

    /// Trace the exported function on `args` and `kwargs` and record it
    pub fn call(&self, core: &Core, args: &[Value], kwargs: &Hash) -> BridgeResult<()> {
        if self.is_closed() {
            return Err(BridgeError::argument("exporter is closed"));
        }
        let (inputs, names) = export_inputs(core, args, kwargs)?;
        let fun = self.0.borrow().fun.clone();
        let positional = args.len();
        let mut host = core.host_fn(|arrays| call_split(core, &fun, arrays, positional, &names));
        let mut session = self.take_session()?;
        let result = core.run_engine(|_| session.record(&mut host, &inputs, &names));
        self.0.borrow_mut().session = Some(session);
        result
    }

    pub fn close(&self) -> BridgeResult<()> {
        let mut inner = self.0.borrow_mut();
        let path = inner.path.clone();
        let session = inner
            .session
            .as_mut()
            .ok_or_else(|| BridgeError::argument("cannot close an exporter while it is recording"))?;
        if !session.is_closed() {
            debug!(path = %path.display(), "closing exporter");
        }
        session.close().map_err(BridgeError::from)
    }

    pub fn is_closed(&self) -> bool {
        self.0.borrow().session.as_ref().map_or(false, |s| s.is_closed())
    }

    fn take_session(&self) -> BridgeResult<Box<dyn ExportSession>> {
        self.0
            .borrow_mut()
            .session
            .take()
            .ok_or_else(|| BridgeError::argument("exporter is already recording"))
    }

    pub fn refs_len(&self) -> usize {
        self.0.borrow().refs.len()
    }

    pub fn ptr_eq(&self, other: &ExporterHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Positional arrays followed by keyword arrays, plus the keyword names
pub(crate) fn export_inputs(core: &Core, args: &[Value], kwargs: &Hash) -> BridgeResult<(Vec<Array>, Vec<String>)> {
    let mut inputs = convert::to_arrays(core, args)?;
    let mut names = Vec::with_capacity(kwargs.len());
    for (name, value) in kwargs.entries() {
        inputs.push(convert::to_array(core, &value, None)?);
        names.push(name.to_string());
    }
    Ok((inputs, names))
}

/// Call `fun` with the first `positional` arrays as arguments and the rest named by `names`
pub(crate) fn call_split(
    core: &Core,
    fun: &Value,
    arrays: &[Array],
    positional: usize,
    names: &[String],
) -> BridgeResult<Value> {
    let (head, tail) = arrays.split_at(positional.min(arrays.len()));
    let args: Vec<Value> = head.iter().cloned().map(Value::from).collect();
    let kwargs = Hash::from_pairs(
        names
            .iter()
            .zip(tail)
            .map(|(n, a)| (n.as_str(), Value::from(a.clone()))),
    );
    core.call_value(fun, &args, &kwargs)
}

// ============================================================================
// KernelHandle
// ============================================================================

#[derive(Debug)]
struct KernelInner {
    kernel: Arc<dyn CustomKernel>,
    refs: Vec<Value>,
}

/// A compiled custom kernel
#[derive(Debug, Clone)]
pub struct KernelHandle(Rc<KernelInner>);

impl KernelHandle {
    pub fn new(kernel: Arc<dyn CustomKernel>, refs: Vec<Value>) -> Self {
        KernelHandle(Rc::new(KernelInner { kernel, refs }))
    }

    pub fn name(&self) -> &str {
        self.0.kernel.name()
    }

    pub fn refs(&self) -> &[Value] {
        &self.0.refs
    }

    pub fn ptr_eq(&self, other: &KernelHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    /// Launch with keyword arguments; returns the list of outputs
    pub fn call(&self, core: &Core, kwargs: &Hash) -> BridgeResult<Value> {
        let required = |name: &str| {
            kwargs
                .get(name)
                .filter(|v| !v.is_nil())
                .ok_or_else(|| BridgeError::argument(format!("kernel launch requires '{}'", name)))
        };
        let inputs = convert::list_items(&required("inputs")?)?;
        let grid = grid3(&required("grid")?)?;
        let threadgroup = grid3(&required("threadgroup")?)?;
        let output_shapes = convert::list_items(&required("output_shapes")?)?
            .iter()
            .map(convert::to_shape)
            .collect::<BridgeResult<Vec<_>>>()?;
        let output_dtypes = convert::list_items(&required("output_dtypes")?)?
            .iter()
            .map(convert::to_dtype)
            .collect::<BridgeResult<Vec<_>>>()?;
        if output_shapes.len() != output_dtypes.len() {
            return Err(BridgeError::argument("output_shapes and output_dtypes must have the same length"));
        }

        let template = match kwargs.get("template") {
            Some(Value::Hash(h)) => h
                .entries()
                .into_iter()
                .map(|(k, v)| Ok((k.to_string(), template_arg(&v)?)))
                .collect::<BridgeResult<Vec<_>>>()?,
            Some(Value::Nil) | None => Vec::new(),
            Some(other) => return Err(BridgeError::type_mismatch("Hash", other.type_name())),
        };
        let init_value = match kwargs.get("init_value") {
            Some(Value::Nil) | None => None,
            Some(v) => Some(convert::to_float(&v)?),
        };
        let verbose = match kwargs.get("verbose") {
            Some(v) => convert::to_bool(&v)?,
            None => false,
        };
        let stream = match kwargs.get("stream") {
            Some(v) => convert::to_stream(core, &v)?,
            None => core.current_stream(),
        };

        let launch = KernelLaunch {
            inputs: convert::to_arrays(core, &inputs)?,
            template,
            grid,
            threadgroup,
            output_shapes,
            output_dtypes,
            init_value,
            verbose,
        };
        let kernel = Arc::clone(&self.0.kernel);
        let outputs = core.release(move |_| kernel.launch(&launch, &stream))?;
        Ok(convert::array_list(outputs))
    }
}

fn grid3(v: &Value) -> BridgeResult<[usize; 3]> {
    let dims = convert::to_shape(v)?;
    match dims.as_slice() {
        [x, y, z] => Ok([*x, *y, *z]),
        _ => Err(BridgeError::argument(format!(
            "grid and threadgroup take 3 dimensions, got {}",
            dims.len()
        ))),
    }
}

fn template_arg(v: &Value) -> BridgeResult<TemplateArg> {
    match v {
        Value::Bool(b) => Ok(TemplateArg::Bool(*b)),
        Value::Int(n) => Ok(TemplateArg::Int(*n)),
        other if convert::looks_like_dtype(other) => Ok(TemplateArg::Dtype(convert::to_dtype(other)?)),
        other => Err(BridgeError::type_mismatch("Integer, Boolean or Dtype", other.type_name())),
    }
}

// ============================================================================
// GroupHandle
// ============================================================================

/// Distributed process group; `None` stands for the global group
#[derive(Debug, Clone)]
pub struct GroupHandle(Rc<Option<Group>>);

impl GroupHandle {
    pub fn new(group: Option<Group>) -> Self {
        GroupHandle(Rc::new(group))
    }

    pub fn group(&self) -> Option<&Group> {
        self.0.as_ref().as_ref()
    }

    /// The wrapped group, or the global group when none is wrapped
    fn resolve(&self, core: &Core) -> BridgeResult<Option<Group>> {
        match self.group() {
            Some(g) => Ok(Some(g.clone())),
            None => core.run_engine(|e| e.init_distributed(false, "any")),
        }
    }

    pub fn rank(&self, core: &Core) -> BridgeResult<usize> {
        Ok(self.resolve(core)?.map_or(0, |g| g.rank))
    }

    pub fn size(&self, core: &Core) -> BridgeResult<usize> {
        Ok(self.resolve(core)?.map_or(1, |g| g.size))
    }

    pub fn split(&self, core: &Core, color: i64, key: i64) -> BridgeResult<GroupHandle> {
        let group = self
            .resolve(core)?
            .ok_or_else(|| BridgeError::engine("no distributed group to split"))?;
        let child = core.run_engine(|e| e.split_group(&group, color, key))?;
        Ok(GroupHandle::new(Some(child)))
    }

    pub fn ptr_eq(&self, other: &GroupHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

// ============================================================================
// StreamContext
// ============================================================================

#[derive(Debug)]
struct StreamContextInner {
    stream: Stream,
    saved: Option<SavedDefaults>,
}

/// Scoped stream override driven by explicit `enter`/`exit` calls
#[derive(Debug, Clone)]
pub struct StreamContext(Rc<RefCell<StreamContextInner>>);

impl StreamContext {
    pub fn new(stream: Stream) -> Self {
        StreamContext(Rc::new(RefCell::new(StreamContextInner { stream, saved: None })))
    }

    pub fn stream(&self) -> Stream {
        self.0.borrow().stream
    }

    pub fn is_entered(&self) -> bool {
        self.0.borrow().saved.is_some()
    }

    /// Install the stream and its device as defaults
    pub fn enter(&self, core: &Core) -> BridgeResult<()> {
        let mut inner = self.0.borrow_mut();
        if inner.saved.is_some() {
            return Err(BridgeError::argument("stream context is already entered"));
        }
        inner.saved = Some(core.push_stream(inner.stream));
        Ok(())
    }

    /// Restore the defaults saved by `enter`; exiting twice is a no-op
    pub fn exit(&self, core: &Core) {
        if let Some(saved) = self.0.borrow_mut().saved.take() {
            core.pop_stream(saved);
        }
    }

    pub fn ptr_eq(&self, other: &StreamContext) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_cpu::CpuEngine;
    use mlx_engine::Device;
    use pretty_assertions::assert_eq;

    fn core() -> Core {
        Core::new(Arc::new(CpuEngine::with_seed(1)))
    }

    #[test]
    fn test_array_handle_rebinding_is_shared() {
        let core = core();
        let a = convert::to_array(&core, &Value::Int(1), None).unwrap();
        let b = convert::to_array(&core, &Value::Int(2), None).unwrap();
        let handle = ArrayHandle::new(a);
        let alias = handle.clone();
        handle.set(b.clone());
        assert!(alias.get().ptr_eq(&b));
        assert!(handle.ptr_eq(&alias));
    }

    #[test]
    fn test_host_function_does_not_release() {
        let f = FunctionHandle::host("id", FunctionKind::Vector, vec![], |_, args, _| {
            Ok(args.first().cloned().unwrap_or_default())
        });
        assert!(!f.releases_gvl());
        assert_eq!(f.kind(), FunctionKind::Vector);
        assert_eq!(f.call(&core(), &[Value::Int(3)], &Hash::new()).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_stream_context_reentry_is_rejected() {
        let core = core();
        let ctx = StreamContext::new(Stream::new(5, Device::gpu()));
        ctx.enter(&core).unwrap();
        assert_eq!(core.default_device(), Device::gpu());
        assert!(ctx.enter(&core).unwrap_err().is_argument_error());
        ctx.exit(&core);
        assert_eq!(core.default_device(), Device::cpu());
        ctx.exit(&core);
    }

    #[test]
    fn test_global_group_reports_singleton() {
        let core = core();
        let group = GroupHandle::new(None);
        assert_eq!(group.rank(&core).unwrap(), 0);
        assert_eq!(group.size(&core).unwrap(), 1);
        let child = group.split(&core, 0, -1).unwrap();
        assert_eq!(child.size(&core).unwrap(), 1);
    }
}
