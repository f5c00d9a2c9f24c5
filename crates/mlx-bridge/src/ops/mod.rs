//! Operation families.
//!
//! Every family exposes `register`, which adds its entries to the
//! dispatch table. Handlers bind arguments through [`Args`](crate::args::Args),
//! call the engine once and project the result back to a host value.
//!
//! ## Module Structure
//!
//! - [`creation`]: constructors, ranges, identity matrices
//! - [`elementwise`]: unary, binary and ternary math
//! - [`reduction`]: reductions, scans, sorting
//! - [`shape`]: reshaping, joining, slicing, gathering
//! - [`linalg`]: products, quantization, decompositions
//! - [`fft`]: discrete Fourier transforms
//! - [`random`]: keys and distributions
//! - [`conv`]: convolutions
//! - [`fast`]: fused layers and custom kernels
//! - [`transforms`]: autodiff, vmap, compile, export
//! - [`distributed`]: groups and collectives
//! - [`device`]: devices, streams, memory, Metal
//! - [`dtype`]: dtype constants and queries
//! - [`io`]: array files

pub mod conv;
pub mod creation;
pub mod device;
pub mod distributed;
pub mod dtype;
pub mod elementwise;
pub mod fast;
pub mod fft;
pub mod io;
pub mod linalg;
pub mod random;
pub mod reduction;
pub mod shape;
pub mod transforms;

use mlx_engine::{Array, Engine, EngineResult};

use crate::convert;
use crate::core::Core;
use crate::dispatch::TableBuilder;
use crate::error::BridgeResult;
use crate::value::Value;

/// Register every family, in catalog order
pub(crate) fn register_all(t: &mut TableBuilder) {
    creation::register(t);
    elementwise::register(t);
    reduction::register(t);
    shape::register(t);
    linalg::register(t);
    fft::register(t);
    random::register(t);
    conv::register(t);
    fast::register(t);
    transforms::register(t);
    distributed::register(t);
    device::register(t);
    dtype::register(t);
    io::register(t);
}

/// Run `f` on the engine and wrap the one array it returns
pub(crate) fn one(core: &Core, f: impl FnOnce(&dyn Engine) -> EngineResult<Array>) -> BridgeResult<Value> {
    core.run_engine(f).map(Value::from)
}

/// Run `f` on the engine and return its arrays as a list
pub(crate) fn many(core: &Core, f: impl FnOnce(&dyn Engine) -> EngineResult<Vec<Array>>) -> BridgeResult<Value> {
    core.run_engine(f).map(convert::array_list)
}

/// Like [`one`], inside a release window
pub(crate) fn released(
    core: &Core,
    f: impl FnOnce(&dyn Engine) -> EngineResult<Array> + Send,
) -> BridgeResult<Value> {
    core.release(f).map(Value::from)
}
