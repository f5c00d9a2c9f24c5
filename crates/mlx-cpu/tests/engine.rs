//! Integration tests for the CPU engine.
//!
//! These drive the engine only through the `Engine` trait and the
//! composite operations, the way the binding layer does.

use indexmap::IndexMap;
use mlx_cpu::CpuEngine;
use mlx_engine::ops;
use mlx_engine::{
    Array, BinaryOp, Device, Dtype, Engine, EngineResult, FileFormat, HostBuffer, Loaded, MetaValue, Stream, UnaryOp,
};
use pretty_assertions::assert_eq;

fn engine() -> CpuEngine {
    CpuEngine::with_seed(7)
}

fn stream() -> Stream {
    Stream::new(0, Device::cpu())
}

fn array(e: &CpuEngine, values: &[f32], shape: &[usize]) -> Array {
    e.from_buffer(HostBuffer::Float32(values.to_vec()), shape, Dtype::Float32)
        .unwrap()
}

fn values(e: &CpuEngine, a: &Array) -> Vec<f64> {
    let buf = e.to_buffer(a).unwrap();
    (0..buf.len()).filter_map(|i| buf.get_f64(i)).collect()
}

fn assert_close(actual: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(actual.len(), expected.len());
    for (a, b) in actual.iter().zip(expected) {
        assert!((a - b).abs() <= tol, "{:?} vs {:?}", actual, expected);
    }
}

// ============================================================================
// Composite operations
// ============================================================================

mod composites {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_mean_and_var() {
        let e = engine();
        let s = stream();
        let a = array(&e, &[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let m = ops::math::mean(&e, &a, Some(&[1][..]), false, &s).unwrap();
        assert_eq!(values(&e, &m), vec![1.5, 3.5]);
        let v = ops::math::var(&e, &a, None, false, 0, &s).unwrap();
        assert_close(&values(&e, &v), &[1.25], 1e-6);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let e = engine();
        let s = stream();
        let a = array(&e, &[1.0, 2.0, 3.0], &[3]);
        let p = ops::math::softmax(&e, &a, None, false, &s).unwrap();
        let total: f64 = values(&e, &p).iter().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_sort_without_axis_flattens() {
        let e = engine();
        let s = stream();
        let a = array(&e, &[4.0, 1.0, 3.0, 2.0], &[2, 2]);
        let sorted = ops::math::sort(&e, &a, None, &s).unwrap();
        assert_eq!(sorted.shape(), &[4]);
        assert_eq!(values(&e, &sorted), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_reshape_infers_dimension() {
        let e = engine();
        let s = stream();
        let a = ops::creation::arange(&e, 0.0, 6.0, 1.0, Dtype::Int32).unwrap();
        let r = ops::shape::reshape(&e, &a, &[-1, 2], &s).unwrap();
        assert_eq!(r.shape(), &[3, 2]);
        assert_eq!(r.dtype(), Dtype::Int32);
    }

    #[test]
    fn test_segmented_mm_splits_the_inner_axis() {
        let e = engine();
        let s = stream();
        let a = array(&e, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = array(&e, &[7.0, 8.0, 9.0, 10.0, 11.0, 12.0], &[3, 2]);
        let segments = e.from_buffer(HostBuffer::Int(vec![0, 1, 1, 3]), &[2, 2], Dtype::Uint32).unwrap();
        let out = ops::linalg::segmented_mm(&e, &a, &b, &segments, &s).unwrap();
        assert_eq!(out.shape(), &[2, 2, 2]);
        assert_close(&values(&e, &out), &[7.0, 8.0, 28.0, 32.0, 51.0, 56.0, 111.0, 122.0], 1e-4);

        let bad = array(&e, &[0.0, 1.0, 2.0], &[1, 3]);
        assert!(ops::linalg::segmented_mm(&e, &a, &b, &bad, &s).is_err());
    }

    #[test]
    fn test_hadamard_transform_scales() {
        let e = engine();
        let s = stream();
        let x = array(&e, &[1.0, 2.0, 3.0, 4.0], &[4]);
        let unit = ops::linalg::hadamard_transform(&e, &x, Some(1.0), &s).unwrap();
        assert_close(&values(&e, &unit), &[10.0, -2.0, -4.0, 0.0], 1e-5);
        let pair = array(&e, &[1.0, 1.0], &[2]);
        let orthonormal = ops::linalg::hadamard_transform(&e, &pair, None, &s).unwrap();
        assert_close(&values(&e, &orthonormal), &[std::f64::consts::SQRT_2, 0.0], 1e-5);
        assert!(ops::linalg::hadamard_transform(&e, &array(&e, &[1.0; 3], &[3]), None, &s).is_err());
    }

    #[test]
    fn test_convolve_modes() {
        use ops::conv::ConvolveMode;
        let e = engine();
        let s = stream();
        let a = array(&e, &[1.0, 2.0, 3.0], &[3]);
        let v = array(&e, &[0.0, 1.0, 0.5], &[3]);
        let full = ops::conv::convolve(&e, &a, &v, ConvolveMode::Full, &s).unwrap();
        assert_close(&values(&e, &full), &[0.0, 1.0, 2.5, 4.0, 1.5], 1e-6);
        let same = ops::conv::convolve(&e, &a, &v, ConvolveMode::Same, &s).unwrap();
        assert_close(&values(&e, &same), &[1.0, 2.5, 4.0], 1e-6);
        let valid = ops::conv::convolve(&e, &v, &a, ConvolveMode::Valid, &s).unwrap();
        assert_close(&values(&e, &valid), &[2.5], 1e-6);
    }

    #[test]
    fn test_einsum_path_contracts_cheapest_pair_first() {
        let e = engine();
        let a = array(&e, &[0.0; 6], &[2, 3]);
        let b = array(&e, &[0.0; 12], &[3, 4]);
        let c = array(&e, &[0.0; 20], &[4, 5]);
        let (path, summary) = ops::shape::einsum_path("ij,jk,kl->il", &[a.clone(), b, c]).unwrap();
        assert_eq!(path, vec![vec![0, 1], vec![0, 1]]);
        assert!(summary.contains("ij,jk,kl->il"), "{}", summary);
        assert!(summary.contains("ij,jk->ik"), "{}", summary);
        assert!(ops::shape::einsum_path("ij,jk->ik", &[a]).is_err());
    }

    #[test]
    fn test_fp8_round_trip_into_target_dtype() {
        let e = engine();
        let s = stream();
        let x = array(&e, &[448.0, 24.0, -0.015625], &[3]);
        let bytes = e.unary(UnaryOp::ToFp8, &x, &s).unwrap();
        assert_eq!(bytes.dtype(), Dtype::Uint8);
        let back = ops::math::from_fp8(&e, &bytes, Dtype::Float16, &s).unwrap();
        assert_eq!(back.dtype(), Dtype::Float16);
        assert_eq!(values(&e, &back), vec![448.0, 24.0, -0.015625]);
        assert!(ops::math::from_fp8(&e, &bytes, Dtype::Int32, &s).is_err());
    }

    #[test]
    fn test_device_queries() {
        let e = engine();
        assert!(e.is_available(Device::cpu()));
        assert!(!e.is_available(Device::gpu()));
        assert_eq!(e.device_count(mlx_engine::DeviceKind::Cpu), 1);
        let info = e.device_info(Device::cpu()).unwrap();
        assert!(info.contains_key("architecture"));
        assert!(e.device_info(Device::gpu()).is_err());
        assert!(!e.version().is_empty());
    }
}

// ============================================================================
// Transforms
// ============================================================================

mod transforms {
    use super::*;
    use pretty_assertions::assert_eq;

    /// x * sin(x), elementwise
    fn x_sin_x(e: CpuEngine) -> impl FnMut(&[Array]) -> EngineResult<Vec<Array>> {
        move |args: &[Array]| {
            let s = stream();
            let sin = e.unary(UnaryOp::Sin, &args[0], &s)?;
            Ok(vec![e.binary(BinaryOp::Multiply, &args[0], &sin, &s)?])
        }
    }

    #[test]
    fn test_vjp_matches_analytic_gradient() {
        let e = engine();
        let x = array(&e, &[0.5, 1.0, 2.0], &[3]);
        let ones = array(&e, &[1.0, 1.0, 1.0], &[3]);
        let mut f = x_sin_x(e.clone());
        let (outputs, grads) = e.vjp(&mut f, &[x], &[ones]).unwrap();
        let expected: Vec<f64> = [0.5f64, 1.0, 2.0].iter().map(|x| x.sin() + x * x.cos()).collect();
        assert_close(&values(&e, &grads[0]), &expected, 1e-4);
        let out: Vec<f64> = [0.5f64, 1.0, 2.0].iter().map(|x| x * x.sin()).collect();
        assert_close(&values(&e, &outputs[0]), &out, 1e-6);
    }

    #[test]
    fn test_jvp_along_tangent() {
        let e = engine();
        let x = array(&e, &[1.0, 2.0], &[2]);
        let t = array(&e, &[1.0, 0.0], &[2]);
        let mut f = x_sin_x(e.clone());
        let (_, jvps) = e.jvp(&mut f, &[x], &[t]).unwrap();
        let d = 1f64.sin() + 1f64.cos();
        assert_close(&values(&e, &jvps[0]), &[d, 0.0], 1e-4);
    }

    #[test]
    fn test_vmap_over_rows() {
        let e = engine();
        let inner = e.clone();
        let mut f = move |args: &[Array]| -> EngineResult<Vec<Array>> {
            let s = stream();
            Ok(vec![ops::math::reduce(&inner, mlx_engine::ReduceOp::Sum, &args[0], None, false, &s)?])
        };
        let x = array(&e, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let out = e.vmap(&mut f, &[x], &[Some(0)], &[Some(0)]).unwrap();
        assert_eq!(values(&e, &out[0]), vec![6.0, 15.0]);
    }

    #[test]
    fn test_compiled_gradient_replays() {
        let e = engine();
        let outer = e.clone();
        let mut grad_fn = move |args: &[Array]| -> EngineResult<Vec<Array>> {
            let ones = ops::creation::ones_like(&outer, &args[0], None, &stream())?;
            let mut f = x_sin_x(outer.clone());
            let (_, grads) = outer.vjp(&mut f, args, &[ones])?;
            Ok(grads)
        };
        let compiled = e.compile(&mut grad_fn, &[array(&e, &[0.0, 0.0], &[2])], false).unwrap();
        let g = compiled(&[array(&e, &[1.0, 2.0], &[2])]).unwrap();
        let expected: Vec<f64> = [1.0f64, 2.0].iter().map(|x| x.sin() + x * x.cos()).collect();
        assert_close(&values(&e, &g[0]), &expected, 1e-4);
    }

    #[test]
    fn test_callback_error_propagates() {
        let e = engine();
        let mut f = |_: &[Array]| -> EngineResult<Vec<Array>> { Err(mlx_engine::EngineError::Callback("boom".into())) };
        let err = e.compile(&mut f, &[array(&e, &[1.0], &[1])], false).err().unwrap();
        assert!(err.is_callback());
    }
}

// ============================================================================
// Export
// ============================================================================

mod export {
    use super::*;
    use pretty_assertions::assert_eq;

    fn add_scaled(e: CpuEngine) -> impl FnMut(&[Array]) -> EngineResult<Vec<Array>> {
        move |args: &[Array]| {
            let s = stream();
            let scaled = e.binary(BinaryOp::Multiply, &args[1], &ops::scalar(&e, 2.0, Dtype::Float32)?, &s)?;
            Ok(vec![e.binary(BinaryOp::Add, &args[0], &scaled, &s)?])
        }
    }

    #[test]
    fn test_export_and_import_with_keywords() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.mlxfn");
        let e = engine();
        let x = array(&e, &[1.0, 2.0], &[2]);
        let y = array(&e, &[10.0, 20.0], &[2]);
        let mut f = add_scaled(e.clone());
        e.export_function(&path, &mut f, &[x.clone(), y.clone()], &["y".to_string()], false)
            .unwrap();

        let imported = e.import_function(&path).unwrap();
        let out = imported(&[x.clone()], &[("y".to_string(), y.clone())]).unwrap();
        assert_eq!(values(&e, &out[0]), vec![21.0, 42.0]);

        let err = imported(&[x.clone(), y], &[]).unwrap_err();
        assert!(err.to_string().contains("no traced function matches"));
    }

    #[test]
    fn test_exporter_records_several_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("multi.mlxfn");
        let e = engine();
        let mut session = e.exporter(&path, false).unwrap();
        let mut f = add_scaled(e.clone());
        session
            .record(&mut f, &[array(&e, &[1.0], &[1]), array(&e, &[1.0], &[1])], &[])
            .unwrap();
        session
            .record(&mut f, &[array(&e, &[1.0, 2.0], &[2]), array(&e, &[1.0, 1.0], &[2])], &[])
            .unwrap();
        session.close().unwrap();
        assert!(session.is_closed());
        let err = session.record(&mut f, &[], &[]).unwrap_err();
        assert!(err.to_string().contains("exporter is closed"));

        let imported = e.import_function(&path).unwrap();
        let out = imported(&[array(&e, &[0.0, 1.0], &[2]), array(&e, &[3.0, 4.0], &[2])], &[]).unwrap();
        assert_eq!(values(&e, &out[0]), vec![6.0, 9.0]);
    }

    #[test]
    fn test_dot_output_names_primitives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.dot");
        let e = engine();
        let s = stream();
        let a = array(&e, &[1.0], &[1]);
        let b = e.binary(BinaryOp::Add, &a, &a, &s).unwrap();
        e.export_to_dot(&path, &[b]).unwrap();
        let dot = std::fs::read_to_string(&path).unwrap();
        assert!(dot.starts_with("digraph {"));
        assert!(dot.contains("constant float32 [1]"));
    }
}

// ============================================================================
// Files
// ============================================================================

mod files {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_npy_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.npy");
        let e = engine();
        let a = array(&e, &[1.0, 2.0, 3.0, 4.0], &[2, 2]);
        e.save(&path, &a).unwrap();
        match e.load(&path, FileFormat::Npy, &stream()).unwrap() {
            Loaded::Single(b) => {
                assert_eq!(b.shape(), &[2, 2]);
                assert_eq!(values(&e, &b), values(&e, &a));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_gguf_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        let e = engine();
        let mut arrays = IndexMap::new();
        arrays.insert("test".to_string(), ops::creation::ones(&e, &[2, 2], Dtype::Int32, &stream()).unwrap());
        let mut metadata = IndexMap::new();
        metadata.insert("meta".to_string(), MetaValue::Str("data".into()));
        e.save_gguf(&path, &arrays, &metadata).unwrap();

        let Loaded::Arrays { arrays, metadata } = e.load(&path, FileFormat::Gguf, &stream()).unwrap() else {
            panic!("expected named arrays");
        };
        assert_eq!(values(&e, &arrays["test"]), vec![1.0; 4]);
        assert!(matches!(&metadata["meta"], MetaValue::Str(s) if s == "data"));
    }

    #[test]
    fn test_npz_is_unsupported() {
        let e = engine();
        let err = e.load(std::path::Path::new("x.npz"), FileFormat::Npz, &stream()).unwrap_err();
        assert!(err.is_unsupported());
    }
}

// ============================================================================
// Random
// ============================================================================

mod random {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_explicit_key_is_deterministic() {
        let e = engine();
        let s = stream();
        let key = e.key(3).unwrap();
        let a = e.random_uniform(&[4], Dtype::Float32, Some(&key), &s).unwrap();
        let b = e.random_uniform(&[4], Dtype::Float32, Some(&key), &s).unwrap();
        assert_eq!(values(&e, &a), values(&e, &b));
    }

    #[test]
    fn test_seed_resets_global_key() {
        let e = engine();
        let s = stream();
        e.seed(11);
        let a = e.random_normal(&[3], Dtype::Float32, None, &s).unwrap();
        let b = e.random_normal(&[3], Dtype::Float32, None, &s).unwrap();
        assert_ne!(values(&e, &a), values(&e, &b));
        e.seed(11);
        let c = e.random_normal(&[3], Dtype::Float32, None, &s).unwrap();
        assert_eq!(values(&e, &a), values(&e, &c));
    }

    #[test]
    fn test_split_key_shape() {
        let e = engine();
        let keys = e.split_key(None, 3, &stream()).unwrap();
        assert_eq!(keys.shape(), &[3, 2]);
        assert_eq!(keys.dtype(), Dtype::Uint32);
    }
}
