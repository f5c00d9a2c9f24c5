//! # MLX Engine
//!
//! The engine interface consumed by the MLX binding layer.
//!
//! This crate names everything the binding layer needs from a numerical
//! array engine, without committing to how arrays are stored or where they
//! are computed.
//!
//! ## Overview
//!
//! - Element types and their category lattice (`Dtype`, `DtypeCategory`)
//! - Devices, streams and distributed groups
//! - The opaque [`Array`] handle and flat host buffers for marshaling
//! - The [`Engine`] trait: primitives, transforms, IO, memory, devices
//! - Composite operations built from primitives (`ops`)
//!
//! ## Module Structure
//!
//! - [`dtype`]: element types, categories, promotion, limits
//! - [`device`]: devices, streams, groups
//! - [`array`]: array handle, host buffers, scalars
//! - [`engine`]: the engine trait and its operation enums
//! - [`ops`]: composite operations over any engine
//! - [`error`]: engine error type

pub mod array;
pub mod device;
pub mod dtype;
pub mod engine;
pub mod error;
pub mod ops;

// Re-export main types for convenience
pub use array::{Array, ArrayImpl, HostBuffer, Scalar};
pub use device::{Device, DeviceKind, Group, Stream};
pub use dtype::{finfo, iinfo, issubdtype, promote_types, Dtype, DtypeCategory, DtypeLike, FloatInfo, IntInfo};
pub use engine::{
    ArgReduceOp, BinaryOp, CollectiveOp, ConvParams, CustomKernel, Engine, ExportSession, FftOp,
    FileFormat, HostFn, InfoValue, KernelLaunch, KernelSpec, LinalgOp, Loaded, MemoryLimit,
    MemoryStat, MetaValue, NativeFn, NativeKwFn, PadMode, QuantMode, ReduceOp, ScanOp, TemplateArg,
    UnaryOp,
};
pub use error::{EngineError, EngineResult};
