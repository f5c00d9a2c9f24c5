//! Dispatch Performance Benchmarks
//!
//! Per-call overhead of name lookup, argument binding and result
//! projection, measured on operations whose engine work is trivial.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use mlx_bridge::{Core, Hash, Value};
use mlx_cpu::CpuEngine;

fn core() -> Core {
    Core::new(Arc::new(CpuEngine::with_seed(0)))
}

fn scalar(core: &Core, x: f64) -> Value {
    core.call("array", vec![Value::Float(x)]).unwrap_or_default()
}

// ============================================================================
// Binding
// ============================================================================

fn bench_binding(c: &mut Criterion) {
    let mut group = c.benchmark_group("binding");
    let core = core();
    let a = scalar(&core, 1.5);
    let b = scalar(&core, 2.5);

    group.bench_function("positional", |bench| {
        bench.iter(|| black_box(core.call("add", vec![a.clone(), b.clone()])))
    });

    group.bench_function("trailing_hash", |bench| {
        bench.iter(|| {
            let kwargs = Value::hash([("axis", Value::Int(0)), ("keepdims", Value::Bool(true))]);
            black_box(core.call("sum", vec![a.clone(), kwargs]))
        })
    });

    group.bench_function("explicit_kwargs", |bench| {
        let kwargs = Hash::from_pairs([("stream", Value::sym("cpu"))]);
        bench.iter(|| black_box(core.call_with("multiply", vec![a.clone(), b.clone()], &kwargs)))
    });

    group.bench_function("host_scalars", |bench| {
        bench.iter(|| black_box(core.call("maximum", vec![Value::Int(3), Value::Float(0.5)])))
    });

    group.finish();
}

// ============================================================================
// Lookup
// ============================================================================

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");
    let core = core();

    for name in ["add", "scaled_dot_product_attention", "random_split", "missing_op"] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &name, |b, name| {
            b.iter(|| black_box(core.respond_to(black_box(name))))
        });
    }

    group.finish();
}

// ============================================================================
// Multi-output
// ============================================================================

fn bench_projection(c: &mut Criterion) {
    let mut group = c.benchmark_group("projection");
    let core = core();
    let a = core.call("arange", vec![Value::Int(12)]).unwrap_or_default();

    for sections in [2i64, 4, 6] {
        group.bench_with_input(BenchmarkId::new("split", sections), &sections, |b, &sections| {
            b.iter(|| black_box(core.call("split", vec![a.clone(), Value::Int(sections)])))
        });
    }

    group.finish();
}

// ============================================================================
// Criterion Main
// ============================================================================

criterion_group!(benches, bench_binding, bench_lookup, bench_projection);

criterion_main!(benches);
