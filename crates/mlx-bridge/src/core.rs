//! The bridge entry point.
//!
//! A [`Core`] owns an engine, a configuration and a runtime context. Every
//! host call enters through [`Core::call`], which locates the operation in
//! the dispatch table, binds its arguments and runs it.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use mlx_engine::{Array, Device, Engine, EngineError, EngineResult, Stream};
use tracing::trace;

use crate::config::BridgeConfig;
use crate::context::{RuntimeContext, SavedDefaults};
use crate::convert;
use crate::dispatch::{DispatchTable, OpEntry};
use crate::error::{BridgeError, BridgeResult};
use crate::gvl::{self, GvlGuard};
use crate::value::{Hash, Value};

struct CoreInner {
    engine: Arc<dyn Engine>,
    config: BridgeConfig,
    context: RefCell<RuntimeContext>,
    /// Error raised by a host callback while the engine was running it
    deferred: RefCell<Option<BridgeError>>,
}

/// Binding layer over one engine. Clones share state.
#[derive(Clone)]
pub struct Core {
    inner: Rc<CoreInner>,
}

impl std::fmt::Debug for Core {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Core")
            .field("engine", &self.inner.engine.name())
            .field("config", &self.inner.config)
            .finish()
    }
}

impl Core {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self::with_config(engine, BridgeConfig::default())
    }

    pub fn with_config(engine: Arc<dyn Engine>, config: BridgeConfig) -> Self {
        let context = RuntimeContext::new(engine.as_ref(), config.default_device, config.compile_enabled);
        Core {
            inner: Rc::new(CoreInner {
                engine,
                config,
                context: RefCell::new(context),
                deferred: RefCell::new(None),
            }),
        }
    }

    /// Core configured from the process environment
    pub fn from_env(engine: Arc<dyn Engine>) -> Self {
        let config = BridgeConfig::from_env(engine.as_ref());
        Self::with_config(engine, config)
    }

    pub fn engine(&self) -> &dyn Engine {
        self.inner.engine.as_ref()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    // ========================================================================
    // Runtime defaults
    // ========================================================================

    pub fn default_device(&self) -> Device {
        self.inner.context.borrow().default_device()
    }

    pub fn set_default_device(&self, device: Device) {
        self.inner.context.borrow_mut().set_default_device(device);
    }

    pub fn default_stream(&self, device: Device) -> Stream {
        self.inner.context.borrow().default_stream(device)
    }

    pub fn set_default_stream(&self, stream: Stream) {
        self.inner.context.borrow_mut().set_default_stream(stream);
    }

    /// Stream used by calls that name none
    pub fn current_stream(&self) -> Stream {
        self.inner.context.borrow().current_stream()
    }

    pub fn compile_enabled(&self) -> bool {
        self.inner.context.borrow().compile_enabled()
    }

    pub fn set_compile_enabled(&self, enabled: bool) {
        self.inner.context.borrow_mut().set_compile_enabled(enabled);
    }

    pub(crate) fn push_stream(&self, stream: Stream) -> SavedDefaults {
        let mut ctx = self.inner.context.borrow_mut();
        let saved = SavedDefaults::capture(&ctx, stream);
        ctx.set_default_stream(stream);
        saved
    }

    pub(crate) fn pop_stream(&self, saved: SavedDefaults) {
        saved.restore(&mut self.inner.context.borrow_mut());
    }

    /// Run `f` with `stream` as the default; the previous defaults are
    /// restored however `f` exits
    pub fn with_stream<T>(&self, stream: Stream, f: impl FnOnce() -> BridgeResult<T>) -> BridgeResult<T> {
        let _scope = StreamScope {
            core: self,
            saved: Some(self.push_stream(stream)),
        };
        f()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Call an operation by name.
    ///
    /// A trailing `Hash` whose keys are all keywords of the operation is
    /// taken as the keyword arguments; any other hash stays positional.
    pub fn call(&self, name: &str, mut args: Vec<Value>) -> BridgeResult<Value> {
        let _gvl = GvlGuard::acquire();
        let entry = lookup(name)?;
        let kwargs = match args.last() {
            Some(Value::Hash(h)) if entry.accepts_keywords(h) => {
                let h = h.clone();
                args.pop();
                h
            }
            _ => Hash::new(),
        };
        entry.invoke(self, args, &kwargs)
    }

    /// Call an operation with explicit positional and keyword arguments
    pub fn call_with(&self, name: &str, args: Vec<Value>, kwargs: &Hash) -> BridgeResult<Value> {
        let _gvl = GvlGuard::acquire();
        lookup(name)?.invoke(self, args, kwargs)
    }

    pub fn respond_to(&self, name: &str) -> bool {
        DispatchTable::global().contains(name)
    }

    pub fn operation_names(&self) -> Vec<&'static str> {
        DispatchTable::global().names().collect()
    }

    /// Invoke a host `Proc` or a `Function` handle
    pub fn call_value(&self, callee: &Value, args: &[Value], kwargs: &Hash) -> BridgeResult<Value> {
        match callee {
            Value::Proc(p) => {
                if kwargs.is_empty() {
                    p.call(args)
                } else {
                    let mut all = args.to_vec();
                    all.push(Value::Hash(kwargs.clone()));
                    p.call(&all)
                }
            }
            Value::Function(f) => f.call(self, args, kwargs),
            other => Err(BridgeError::type_mismatch("Proc or Function", other.type_name())),
        }
    }

    // ========================================================================
    // Engine boundary
    // ========================================================================

    /// Adapt a host body into a closure the engine can trace.
    ///
    /// Host failures are stashed with their original type and surface
    /// unchanged from the enclosing [`Core::run_engine`].
    pub(crate) fn host_fn<'a>(
        &'a self,
        mut body: impl FnMut(&[Array]) -> BridgeResult<Value> + 'a,
    ) -> impl FnMut(&[Array]) -> EngineResult<Vec<Array>> + 'a {
        move |arrays: &[Array]| {
            let result = body(arrays).and_then(|v| convert::result_arrays(self, &v));
            result.map_err(|err| {
                let message = err.to_string();
                trace!(error = %message, "host callback failed");
                self.inner.deferred.borrow_mut().get_or_insert(err);
                EngineError::Callback(message)
            })
        }
    }

    /// Run engine work on the calling thread, holding the host lock
    pub fn run_engine<T>(&self, f: impl FnOnce(&dyn Engine) -> EngineResult<T>) -> BridgeResult<T> {
        let result = f(self.engine());
        let deferred = self.inner.deferred.borrow_mut().take();
        match (result, deferred) {
            (Ok(value), _) => Ok(value),
            (Err(_), Some(err)) => Err(err),
            (Err(err), None) => Err(err.into()),
        }
    }

    /// Run pure engine work inside a release window when configured to
    pub fn release<T: Send>(&self, f: impl FnOnce(&dyn Engine) -> EngineResult<T> + Send) -> BridgeResult<T> {
        if !self.inner.config.release_gvl {
            return f(self.engine()).map_err(BridgeError::from);
        }
        let engine = Arc::clone(&self.inner.engine);
        gvl::without_gvl(self.inner.config.release_strategy, move || f(engine.as_ref()))
    }
}

fn lookup(name: &str) -> BridgeResult<&'static OpEntry> {
    DispatchTable::global()
        .get(name)
        .ok_or_else(|| BridgeError::argument(format!("undefined operation '{}'", name)))
}

/// Restores the defaults saved when a scoped stream was installed
struct StreamScope<'a> {
    core: &'a Core,
    saved: Option<SavedDefaults>,
}

impl Drop for StreamScope<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.core.pop_stream(saved);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Proc;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;

    fn core() -> Core {
        Core::new(Arc::new(CpuEngine::with_seed(3)))
    }

    #[test]
    fn test_with_stream_restores_on_error() {
        let core = core();
        let before = (core.default_device(), core.current_stream());
        let target = Stream::new(9, Device::gpu());
        let result: BridgeResult<()> = core.with_stream(target, || {
            assert_eq!(core.current_stream(), target);
            Err(BridgeError::argument("inside"))
        });
        assert!(result.is_err());
        assert_eq!((core.default_device(), core.current_stream()), before);
    }

    #[test]
    fn test_host_error_keeps_its_type() {
        let core = core();
        let mut host = core.host_fn(|_| Err(BridgeError::ragged(1, 2, 3)));
        let err = core.run_engine(|e| e.checkpoint(&mut host, &[])).unwrap_err();
        assert!(err.is_ragged());
    }

    #[test]
    fn test_engine_error_is_retyped() {
        let core = core();
        let a = convert::to_array(&core, &Value::Int(1), None).unwrap();
        let err = core.run_engine(|e| e.reshape(&a, &[2], &core.current_stream())).unwrap_err();
        assert!(err.is_engine_error());
    }

    #[test]
    fn test_call_value_passes_kwargs_as_trailing_hash() {
        let core = core();
        let proc = Value::Proc(Proc::new("count", |args| Ok(Value::from(args.len()))));
        let kwargs = Hash::from_pairs([("k", Value::Int(1))]);
        assert_eq!(core.call_value(&proc, &[Value::Nil], &kwargs).unwrap(), Value::Int(2));
        assert!(core.call_value(&Value::Int(1), &[], &Hash::new()).unwrap_err().is_type_error());
    }
}
