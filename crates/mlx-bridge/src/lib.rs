//! # MLX Bridge
//!
//! Value marshaling and operation dispatch between a dynamic host runtime
//! and an MLX engine.
//!
//! The host hands over loosely typed values (numbers, nested lists,
//! hashes, symbols) and an operation name. The bridge binds them to the
//! operation's parameter list, coerces them to engine arrays and options,
//! runs the engine, and projects the results back into host values.
//!
//! ## Overview
//!
//! - One flat namespace of named operations in a [`DispatchTable`]
//! - Argument binding with positional, keyword, variadic and trailing-hash
//!   keyword conventions ([`Args`])
//! - A single promotion policy for host scalars and nested sequences
//!   ([`convert`])
//! - Handles for arrays, functions, exporters, kernels, groups and stream
//!   contexts, with keep-alive lists for captured host values
//! - Optional host-lock release around pure engine work ([`gvl`])
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use mlx_bridge::{Core, Value};
//!
//! let core = Core::new(Arc::new(mlx_cpu::CpuEngine::new()));
//! let a = core.call("arange", vec![Value::Int(4)])?;
//! let total = core.call("sum", vec![a])?;
//! ```
//!
//! ## Module Structure
//!
//! - [`value`]: the host value model
//! - [`convert`]: host values to engine values and back
//! - [`args`]: parameter binding and typed accessors
//! - [`dispatch`]: the operation table
//! - [`ops`]: operation families
//! - [`core`]: the entry point and engine boundary
//! - [`handles`]: host-visible engine resources
//! - [`array`]: array handle methods
//! - [`context`]: per-core defaults
//! - [`config`]: startup configuration
//! - [`gvl`]: host lock release windows
//! - [`error`]: error classes

pub mod args;
pub mod array;
pub mod config;
pub mod context;
pub mod convert;
pub mod core;
pub mod dispatch;
pub mod error;
pub mod gvl;
pub mod handles;
pub mod ops;
pub mod value;

// Re-export main types for convenience
pub use crate::core::Core;
pub use args::Args;
pub use config::BridgeConfig;
pub use dispatch::{DispatchTable, OpEntry};
pub use error::{BridgeError, BridgeResult};
pub use gvl::{without_gvl, GvlGuard, ReleaseStrategy};
pub use handles::{
    ArrayHandle, CompiledFunction, ExporterHandle, FunctionBody, FunctionHandle, FunctionKind, GroupHandle,
    KernelHandle, StreamContext,
};
pub use value::{Hash, List, Proc, RangeValue, Value};
