//! Integration tests for host value conversion.
//!
//! Everything goes through `Core::call` and the array handle methods, the
//! same surface the host runtime sees.

use std::sync::Arc;

use mlx_bridge::{Core, Value};
use mlx_cpu::CpuEngine;
use mlx_engine::Dtype;

fn core() -> Core {
    Core::new(Arc::new(CpuEngine::with_seed(3)))
}

fn ints(values: &[i64]) -> Value {
    Value::list(values.iter().map(|&n| Value::Int(n)).collect())
}

fn floats(values: &[f64]) -> Value {
    Value::list(values.iter().map(|&x| Value::Float(x)).collect())
}

fn nested(rows: &[&[i64]]) -> Value {
    Value::list(rows.iter().map(|r| ints(r)).collect())
}

// ============================================================================
// Nested sequences
// ============================================================================

mod sequences {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_nested_round_trip() {
        let core = core();
        let value = nested(&[&[1, 2], &[3, 4]]);
        let a = core.call("array", vec![value.clone()]).unwrap();
        let handle = a.as_array().unwrap();
        assert_eq!(handle.shape(), vec![2, 2]);
        assert_eq!(handle.to_a(&core).unwrap(), value);
    }

    #[test]
    fn test_sequences_default_to_float32() {
        let core = core();
        let a = core.call("array", vec![ints(&[1, 2])]).unwrap();
        assert_eq!(a.as_array().unwrap().dtype(), Dtype::Float32);
        let b = core.call("array", vec![Value::Bool(true)]).unwrap();
        assert_eq!(b.as_array().unwrap().dtype(), Dtype::Bool);
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let core = core();
        let err = core.call("array", vec![nested(&[&[1, 2], &[3]])]).unwrap_err();
        assert!(err.is_ragged(), "{}", err);
    }

    #[test]
    fn test_ragged_depth_rejected() {
        let core = core();
        let value = Value::list(vec![ints(&[1]), Value::Int(2)]);
        assert!(core.call("array", vec![value]).unwrap_err().is_ragged());
    }

    #[test]
    fn test_float64_target_is_exact() {
        let core = core();
        let a = core.call("array", vec![ints(&[1, 2, 3]), Value::Dtype(Dtype::Float64)]).unwrap();
        let handle = a.as_array().unwrap();
        assert_eq!(handle.dtype(), Dtype::Float64);
        assert_eq!(handle.to_a(&core).unwrap(), floats(&[1.0, 2.0, 3.0]));

        let third = core.call("array", vec![floats(&[0.1]), Value::sym("float64")]).unwrap();
        assert_eq!(third.as_array().unwrap().to_a(&core).unwrap(), floats(&[0.1]));
    }

    #[test]
    fn test_mixed_ints_and_floats_promote() {
        let core = core();
        let value = Value::list(vec![Value::Int(1), Value::Float(2.5)]);
        let a = core.call("array", vec![value]).unwrap();
        assert_eq!(a.as_array().unwrap().dtype(), Dtype::Float32);
    }
}

// ============================================================================
// Scalars
// ============================================================================

mod scalars {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_int_scalar_is_rank_zero() {
        let core = core();
        let a = core.call("array", vec![Value::Int(5)]).unwrap();
        let handle = a.as_array().unwrap();
        assert_eq!(handle.ndim(), 0);
        assert_eq!(handle.item(&core).unwrap(), Value::Int(5));
        assert_eq!(handle.to_a(&core).unwrap(), Value::Int(5));
    }

    #[test]
    fn test_size_one_extracts_like_rank_zero() {
        let core = core();
        let a = core.call("array", vec![nested(&[&[5]])]).unwrap();
        assert_eq!(a.as_array().unwrap().item(&core).unwrap(), Value::Int(5));

        let f = core.call("array", vec![Value::Int(5), Value::sym("float32")]).unwrap();
        assert_eq!(f.as_array().unwrap().item(&core).unwrap(), Value::Float(5.0));
    }

    #[test]
    fn test_item_of_many_elements_fails() {
        let core = core();
        let a = core.call("array", vec![ints(&[1, 2])]).unwrap();
        assert!(a.as_array().unwrap().item(&core).unwrap_err().is_argument_error());
    }
}

// ============================================================================
// Indexing
// ============================================================================

mod indexing {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_negative_index_wraps() {
        let core = core();
        let a = core.call("array", vec![ints(&[10, 11, 12, 13, 14])]).unwrap();
        let handle = a.as_array().unwrap();
        let last = handle.index(&core, &[Value::Int(-1)]).unwrap();
        let fourth = handle.index(&core, &[Value::Int(4)]).unwrap();
        assert_eq!(last.as_array().unwrap().item(&core).unwrap(), Value::Int(14));
        assert_eq!(fourth.as_array().unwrap().item(&core).unwrap(), Value::Int(14));
    }

    #[test]
    fn test_index_past_start_fails() {
        let core = core();
        let a = core.call("array", vec![ints(&[10, 11, 12, 13, 14])]).unwrap();
        let err = a.as_array().unwrap().index(&core, &[Value::Int(-6)]).unwrap_err();
        assert!(err.is_index_error(), "{}", err);
    }

    #[test]
    fn test_set_index_rebinds_handle() {
        let core = core();
        let a = core.call("array", vec![ints(&[1, 2, 3])]).unwrap();
        let handle = a.as_array().unwrap();
        handle.set_index(&core, &[Value::Int(-1)], &Value::Int(9)).unwrap();
        assert_eq!(handle.to_a(&core).unwrap(), ints(&[1, 2, 9]));
    }
}

// ============================================================================
// Keyword binding
// ============================================================================

mod keywords {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_trailing_hash_of_keywords_binds() {
        let core = core();
        let a = core.call("array", vec![nested(&[&[1, 2], &[3, 4]])]).unwrap();
        let out = core.call("sum", vec![a, Value::hash([("axis", Value::Int(0))])]).unwrap();
        assert_eq!(out.as_array().unwrap().to_a(&core).unwrap(), ints(&[4, 6]));
    }

    #[test]
    fn test_trailing_hash_with_foreign_key_stays_positional() {
        let core = core();
        let a = core.call("array", vec![ints(&[1, 2])]).unwrap();
        let err = core.call("sum", vec![a, Value::hash([("colour", Value::Int(0))])]).unwrap_err();
        assert!(err.is_type_error(), "{}", err);
    }

    #[test]
    fn test_unknown_operation() {
        let core = core();
        assert!(!core.respond_to("frobnicate"));
        assert!(core.call("frobnicate", vec![]).unwrap_err().is_argument_error());
    }
}
