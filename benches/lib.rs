//! MLX Bridge Benchmarks
//!
//! Performance benchmarks for host value conversion and operation dispatch.
//! Run with: cargo bench -p mlx-benchmarks

// This file exists only to satisfy Cargo's requirement for a lib target.
// The actual benchmarks are in conversion_benchmarks.rs and dispatch_benchmarks.rs
