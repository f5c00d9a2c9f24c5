//! Conversion Performance Benchmarks
//!
//! Host to array and array to host conversion for nested lists of
//! different sizes, with and without an explicit dtype.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mlx_bridge::{convert, Core, Value};
use mlx_cpu::CpuEngine;
use mlx_engine::Dtype;

fn core() -> Core {
    Core::new(Arc::new(CpuEngine::with_seed(0)))
}

/// A `rows` x `cols` nested list of floats
fn grid(rows: usize, cols: usize) -> Value {
    Value::list(
        (0..rows)
            .map(|r| Value::list((0..cols).map(|c| Value::Float((r * cols + c) as f64 * 0.5)).collect()))
            .collect(),
    )
}

const SIZES: [(usize, usize); 3] = [(8, 8), (64, 64), (256, 256)];

// ============================================================================
// Host -> Array
// ============================================================================

fn bench_host_to_array(c: &mut Criterion) {
    let mut group = c.benchmark_group("host_to_array");
    let core = core();

    for (rows, cols) in SIZES {
        let value = grid(rows, cols);
        group.throughput(Throughput::Elements((rows * cols) as u64));

        group.bench_with_input(BenchmarkId::new("float32", rows), &value, |b, value| {
            b.iter(|| black_box(convert::to_array(&core, black_box(value), None)))
        });

        group.bench_with_input(BenchmarkId::new("float64", rows), &value, |b, value| {
            b.iter(|| black_box(convert::to_array(&core, black_box(value), Some(Dtype::Float64))))
        });

        group.bench_with_input(BenchmarkId::new("int32_cast", rows), &value, |b, value| {
            b.iter(|| black_box(convert::to_array(&core, black_box(value), Some(Dtype::Int32))))
        });
    }

    group.finish();
}

// ============================================================================
// Array -> Host
// ============================================================================

fn bench_array_to_host(c: &mut Criterion) {
    let mut group = c.benchmark_group("array_to_host");
    let core = core();

    for (rows, cols) in SIZES {
        let array = match convert::to_array(&core, &grid(rows, cols), None) {
            Ok(a) => a,
            Err(_) => continue,
        };
        group.throughput(Throughput::Elements((rows * cols) as u64));

        group.bench_with_input(BenchmarkId::from_parameter(rows), &array, |b, array| {
            b.iter(|| black_box(convert::array_to_value(&core, black_box(array))))
        });
    }

    group.finish();
}

// ============================================================================
// Criterion Main
// ============================================================================

criterion_group!(benches, bench_host_to_array, bench_array_to_host);

criterion_main!(benches);
