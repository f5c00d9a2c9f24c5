//! # MLX CPU
//!
//! Reference eager CPU engine for the MLX binding layer.
//!
//! This crate implements [`mlx_engine::Engine`] in plain Rust so that the
//! binding layer can be exercised end to end without a device runtime. It
//! favors simplicity over speed.
//!
//! ## Overview
//!
//! - Dense tensors stored widened to `f64` (or `Complex<f64>`), normalized
//!   to their dtype after every primitive
//! - One evaluation path for every primitive, recording provenance while a
//!   function is being traced
//! - Traced graphs back `compile`, the function transforms and export
//! - Derivatives by central finite differences in double precision
//! - `.npy`, `.safetensors` and `.gguf` files
//! - Byte accounting for live arrays and a keyed random generator
//!
//! ## Limitations
//!
//! - Values captured by an inner trace from an enclosing trace are
//!   constants of the inner graph, so gradients do not flow through them
//! - Random draws without an explicit key are fixed inside compiled graphs
//! - 64-bit integers beyond 2^53 lose precision
//! - Metal, point-to-point communication and general `eig` are unavailable
//!
//! ## Module Structure
//!
//! - [`engine`]: the engine, its arrays and shared state
//! - [`tensor`]: dense storage, normalization and the byte codec
//! - [`prim`]: primitives and their evaluation
//! - [`graph`]: traces, capture and replayable graphs
//! - [`transforms`]: vjp, jvp and vmap over graphs
//! - [`elementwise`], [`reduce`], [`layout`], [`linalg`], [`fft`],
//!   [`conv`], [`quant`], [`random`], [`special`]: kernels
//! - [`io`]: file formats
//! - [`export`]: exported function files
//! - [`memory`]: memory accounting

pub mod conv;
pub mod elementwise;
pub mod engine;
pub mod export;
pub mod fft;
pub mod graph;
pub mod io;
pub mod layout;
pub mod linalg;
pub mod memory;
pub mod prim;
pub mod quant;
pub mod random;
pub mod reduce;
pub mod special;
pub mod tensor;
pub mod transforms;

// Re-export main types for convenience
pub use engine::{CpuArray, CpuEngine, CpuKernel};
pub use tensor::Tensor;
