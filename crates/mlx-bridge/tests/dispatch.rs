//! Integration tests for operation dispatch and engine handles.
//!
//! Host callables are plain `Proc`s calling back into the same `Core`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use mlx_bridge::{BridgeError, Core, FunctionKind, Hash, Proc, Value};
use mlx_cpu::CpuEngine;
use mlx_engine::{Device, Stream};

fn core() -> Core {
    Core::new(Arc::new(CpuEngine::with_seed(11)))
}

fn ints(values: &[i64]) -> Value {
    Value::list(values.iter().map(|&n| Value::Int(n)).collect())
}

fn floats(values: &[f64]) -> Value {
    Value::list(values.iter().map(|&x| Value::Float(x)).collect())
}

fn matrix(core: &Core, rows: &[&[f64]]) -> Value {
    let value = Value::list(rows.iter().map(|r| floats(r)).collect());
    core.call("array", vec![value]).unwrap()
}

fn host(core: &Core, value: &Value) -> Value {
    value.as_array().unwrap().to_a(core).unwrap()
}

/// `x * x` evaluated through the dispatch table
fn square(core: &Core) -> Value {
    let core = core.clone();
    Value::from(Proc::new("square", move |args| core.call("multiply", vec![args[0].clone(), args[0].clone()])))
}

// ============================================================================
// Reductions
// ============================================================================

mod reductions {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_axis_list_matches_repeated_reduction() {
        let core = core();
        let a = matrix(&core, &[&[1.0, 5.0, 3.0], &[4.0, 2.0, 6.0]]);
        for name in ["sum", "max", "min", "all", "any"] {
            let both = core.call(name, vec![a.clone(), ints(&[0, 1])]).unwrap();
            let inner = core.call(name, vec![a.clone(), Value::Int(1)]).unwrap();
            let nested = core.call(name, vec![inner, Value::Int(0)]).unwrap();
            assert_eq!(host(&core, &both), host(&core, &nested), "{}", name);
        }
    }

    #[test]
    fn test_keepdims_keyword() {
        let core = core();
        let a = matrix(&core, &[&[1.0, 2.0], &[3.0, 4.0]]);
        let kwargs = Value::hash([("axis", Value::Int(1)), ("keepdims", Value::Bool(true))]);
        let out = core.call("mean", vec![a, kwargs]).unwrap();
        assert_eq!(out.as_array().unwrap().shape(), vec![2, 1]);
    }
}

// ============================================================================
// Multi-output operations
// ============================================================================

mod arity {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_split_keeps_empty_parts() {
        let core = core();
        let a = core.call("arange", vec![Value::Int(4)]).unwrap();
        let parts = core.call("split", vec![a, ints(&[2, 2])]).unwrap();
        let parts = parts.as_list().unwrap().to_vec();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].as_array().unwrap().size(), 0);
    }

    #[test]
    fn test_qr_is_a_pair() {
        let core = core();
        let a = matrix(&core, &[&[2.0, 1.0], &[1.0, 3.0]]);
        let out = core.call("qr", vec![a]).unwrap();
        assert_eq!(out.as_list().unwrap().len(), 2);
    }

    #[test]
    fn test_quantize_output_count_follows_mode() {
        let core = core();
        let w = core.call("ones", vec![ints(&[2, 64])]).unwrap();
        let affine = core.call("quantize", vec![w.clone()]).unwrap();
        assert_eq!(affine.as_list().unwrap().len(), 3);
        let kwargs = Value::hash([("mode", Value::str("mxfp4"))]);
        let mx = core.call("quantize", vec![w, kwargs]).unwrap();
        assert_eq!(mx.as_list().unwrap().len(), 2);
    }

    #[test]
    fn test_divmod_pair() {
        let core = core();
        let out = core.call("divmod", vec![ints(&[7, 9]), Value::Int(4)]).unwrap();
        let pair = out.as_list().unwrap().to_vec();
        assert_eq!(host(&core, &pair[0]), ints(&[1, 2]));
        assert_eq!(host(&core, &pair[1]), ints(&[3, 1]));
    }
}

// ============================================================================
// Streams
// ============================================================================

mod streams {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_scoped_stream_restored_after_error() {
        let core = core();
        let before_device = core.default_device();
        let before_stream = core.current_stream();
        let fresh = core.call("new_stream", vec![Value::Device(Device::cpu())]).unwrap();
        let Value::Stream(fresh_stream) = fresh.clone() else { panic!("expected a stream") };

        let seen: Rc<RefCell<Option<Stream>>> = Rc::new(RefCell::new(None));
        let (inner, slot) = (core.clone(), Rc::clone(&seen));
        let block = Value::from(Proc::new("failing", move |_| {
            *slot.borrow_mut() = Some(inner.current_stream());
            Err(BridgeError::argument("boom"))
        }));

        let err = core.call("stream", vec![fresh, block]).unwrap_err();
        assert!(err.is_argument_error());
        assert_eq!(*seen.borrow(), Some(fresh_stream));
        assert_eq!(core.current_stream(), before_stream);
        assert_eq!(core.default_device(), before_device);
    }

    #[test]
    fn test_stream_keyword_on_compute_ops() {
        let core = core();
        let kwargs = Value::hash([("stream", Value::sym("cpu"))]);
        let out = core.call("add", vec![Value::Int(1), Value::Int(2), kwargs]).unwrap();
        assert_eq!(out.as_array().unwrap().item(&core).unwrap(), Value::Int(3));
    }
}

// ============================================================================
// Handles
// ============================================================================

mod handles {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_function_handles_keep_their_callable() {
        let core = core();
        let fun = square(&core);
        let grad = core.call("grad", vec![fun.clone()]).unwrap();
        let Value::Function(grad) = grad else { panic!("expected a function") };
        assert_eq!(grad.kind(), FunctionKind::Vector);
        assert!(!grad.releases_gvl());
        assert!(grad.refs().iter().any(|r| r == &fun));
    }

    #[test]
    fn test_compiled_function_replays() {
        let core = core();
        let compiled = core.call("compile", vec![square(&core)]).unwrap();
        let Value::Function(f) = &compiled else { panic!("expected a function") };
        assert!(f.releases_gvl());
        for _ in 0..2 {
            let x = core.call("array", vec![floats(&[1.0, 2.0, 3.0])]).unwrap();
            let out = f.call(&core, &[x], &Hash::new()).unwrap();
            assert_eq!(host(&core, &out), floats(&[1.0, 4.0, 9.0]));
        }
    }

    #[test]
    fn test_exporter_rejects_calls_after_close() {
        let core = core();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("square.mlxfn");
        let exporter = core.call("exporter", vec![Value::str(file.to_str().unwrap()), square(&core)]).unwrap();
        let Value::Exporter(exporter) = exporter else { panic!("expected an exporter") };
        assert_eq!(exporter.refs_len(), 1);

        let x = core.call("array", vec![floats(&[2.0])]).unwrap();
        exporter.call(&core, &[x.clone()], &Hash::new()).unwrap();
        exporter.close().unwrap();
        assert!(exporter.is_closed());
        let err = exporter.call(&core, &[x], &Hash::new()).unwrap_err();
        assert!(err.is_argument_error());
        assert!(err.to_string().contains("exporter is closed"));
    }

    #[test]
    fn test_exporter_callback_can_query_its_exporter() {
        let core = core();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("square.mlxfn");

        let slot: Rc<RefCell<Option<mlx_bridge::ExporterHandle>>> = Rc::new(RefCell::new(None));
        let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
        let fun = {
            let (inner, slot, seen) = (core.clone(), Rc::clone(&slot), Rc::clone(&seen));
            Value::from(Proc::new("square", move |args| {
                if let Some(exporter) = slot.borrow().as_ref() {
                    assert!(!exporter.is_closed());
                    let again = exporter.call(&inner, &[args[0].clone()], &Hash::new()).unwrap_err();
                    seen.borrow_mut().push(again.to_string());
                }
                inner.call("multiply", vec![args[0].clone(), args[0].clone()])
            }))
        };
        let exporter = core.call("exporter", vec![Value::str(file.to_str().unwrap()), fun]).unwrap();
        let Value::Exporter(exporter) = exporter else { panic!("expected an exporter") };
        *slot.borrow_mut() = Some(exporter.clone());

        let x = core.call("array", vec![floats(&[2.0])]).unwrap();
        exporter.call(&core, &[x], &Hash::new()).unwrap();
        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].contains("already recording"), "{:?}", seen.borrow());
        exporter.close().unwrap();
        assert!(exporter.is_closed());
        slot.borrow_mut().take();
    }

    #[test]
    fn test_export_and_import_round_trip() {
        let core = core();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("square.mlxfn");
        let file = file.to_str().unwrap();
        let x = core.call("array", vec![floats(&[3.0])]).unwrap();
        core.call("export_function", vec![Value::str(file), square(&core), x.clone()]).unwrap();

        let imported = core.call("import_function", vec![Value::str(file)]).unwrap();
        let Value::Function(f) = imported else { panic!("expected a function") };
        assert_eq!(f.kind(), FunctionKind::ArgsKwargs);
        assert_eq!(f.name(), "square");
        let out = f.call(&core, &[x], &Hash::new()).unwrap();
        assert_eq!(host(&core, &out), floats(&[9.0]));
    }

    #[test]
    fn test_kernel_launch_requires_arguments() {
        let core = core();
        let kernel = core
            .call(
                "metal_kernel",
                vec![
                    Value::str("scale"),
                    Value::list(vec![Value::str("inp")]),
                    Value::list(vec![Value::str("out")]),
                    Value::str("out[0] = inp[0];"),
                ],
            )
            .unwrap();
        let Value::Kernel(kernel) = kernel else { panic!("expected a kernel") };
        assert_eq!(kernel.refs().len(), 2);

        let kwargs = Hash::from_pairs([
            ("inputs", Value::list(vec![floats(&[1.0])])),
            ("grid", ints(&[1, 1, 1])),
            ("threadgroup", ints(&[1, 1, 1])),
            ("output_shapes", Value::list(vec![ints(&[1])])),
        ]);
        let err = kernel.call(&core, &kwargs).unwrap_err();
        assert!(err.is_argument_error());
        assert!(err.to_string().contains("output_dtypes"), "{}", err);
    }

    #[test]
    fn test_group_reports_singleton() {
        let core = core();
        let group = core.call("init", vec![]).unwrap();
        let Value::Group(group) = group else { panic!("expected a group") };
        assert_eq!(group.rank(&core).unwrap(), 0);
        assert_eq!(group.size(&core).unwrap(), 1);
    }
}

// ============================================================================
// Files
// ============================================================================

mod files {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_npz_not_implemented() {
        let core = core();
        assert!(core.call("load", vec![Value::str("arrays.npz")]).unwrap_err().is_not_implemented());
        let a = core.call("zeros", vec![ints(&[2])]).unwrap();
        let err = core.call("savez_compressed", vec![Value::str("arrays.npz"), a]).unwrap_err();
        assert!(err.is_not_implemented());
    }

    #[test]
    fn test_gguf_round_trip() {
        let core = core();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("model.gguf");
        let file = file.to_str().unwrap();
        let arrays = Value::hash([("bias", floats(&[0.25, 0.5]))]);
        core.call("save_gguf", vec![Value::str(file), arrays]).unwrap();

        let loaded = core.call("load", vec![Value::str(file)]).unwrap();
        let bias = loaded.as_hash().unwrap().get("bias").unwrap();
        assert_eq!(host(&core, &bias), floats(&[0.25, 0.5]));
    }
}

// ============================================================================
// Introspection
// ============================================================================

mod introspection {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_catalog_names() {
        let core = core();
        for name in ["array", "asarray", "conj", "concat", "random_split", "distributed_init", "fft2"] {
            assert!(core.respond_to(name), "{}", name);
        }
        let names = core.operation_names();
        assert!(names.contains(&"scaled_dot_product_attention"));
        for name in ["cuda_kernel", "precompiled_cuda_kernel"] {
            assert!(!core.respond_to(name), "{}", name);
        }
        assert_eq!(names.iter().filter(|n| **n == "scaled_dot_product_attention").count(), 1);
    }

    #[test]
    fn test_late_additions_are_registered() {
        let core = core();
        let names = [
            "broadcast_shapes",
            "permute_dims",
            "segmented_mm",
            "hadamard_transform",
            "to_fp8",
            "from_fp8",
            "einsum_path",
            "convolve",
            "depends",
            "device_count",
            "device_info",
            "is_available",
            "version",
        ];
        for name in names {
            assert!(core.respond_to(name), "{}", name);
        }
    }
}
