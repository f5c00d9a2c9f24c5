//! Reductions, scans and sorting.
//!
//! Every `axis` parameter takes one integer or a list of integers; an
//! absent axis reduces over the whole array.

use mlx_engine::ops::math;
use mlx_engine::{ArgReduceOp, ReduceOp, ScanOp};

use super::one;
use crate::dispatch::TableBuilder;
use crate::error::BridgeError;

const REDUCE: &[(&str, ReduceOp)] = &[
    ("sum", ReduceOp::Sum),
    ("prod", ReduceOp::Prod),
    ("max", ReduceOp::Max),
    ("min", ReduceOp::Min),
    ("all", ReduceOp::All),
    ("any", ReduceOp::Any),
];

const SCAN: &[(&str, ScanOp)] = &[
    ("cumsum", ScanOp::Sum),
    ("cumprod", ScanOp::Prod),
    ("cummax", ScanOp::Max),
    ("cummin", ScanOp::Min),
    ("logcumsumexp", ScanOp::LogAddExp),
];

const REDUCE_PARAMS: &[&str] = &["a", "axis", "keepdims"];

pub(crate) fn register(t: &mut TableBuilder) {
    for &(name, op) in REDUCE {
        t.op(name, REDUCE_PARAMS, move |core, args| {
            let a = args.array(core, "a")?;
            let axes = args.axes("axis")?;
            let keepdims = args.bool_or("keepdims", false)?;
            let s = args.stream(core)?;
            one(core, |e| math::reduce(e, op, &a, axes.as_deref(), keepdims, &s))
        });
    }
    t.op("mean", REDUCE_PARAMS, |core, args| {
        let (a, axes) = (args.array(core, "a")?, args.axes("axis")?);
        let keepdims = args.bool_or("keepdims", false)?;
        let s = args.stream(core)?;
        one(core, |e| math::mean(e, &a, axes.as_deref(), keepdims, &s))
    });
    t.op("logsumexp", REDUCE_PARAMS, |core, args| {
        let (a, axes) = (args.array(core, "a")?, args.axes("axis")?);
        let keepdims = args.bool_or("keepdims", false)?;
        let s = args.stream(core)?;
        one(core, |e| math::logsumexp(e, &a, axes.as_deref(), keepdims, &s))
    });
    t.op("median", REDUCE_PARAMS, |core, args| {
        let (a, axes) = (args.array(core, "a")?, args.axes("axis")?);
        let keepdims = args.bool_or("keepdims", false)?;
        let s = args.stream(core)?;
        one(core, |e| math::median(e, &a, axes.as_deref(), keepdims, &s))
    });
    t.op("var", &["a", "axis", "keepdims", "ddof"], |core, args| {
        let (a, axes) = (args.array(core, "a")?, args.axes("axis")?);
        let keepdims = args.bool_or("keepdims", false)?;
        let ddof = args.usize_or("ddof", 0)?;
        let s = args.stream(core)?;
        one(core, |e| math::var(e, &a, axes.as_deref(), keepdims, ddof, &s))
    });
    t.op("std", &["a", "axis", "keepdims", "ddof"], |core, args| {
        let (a, axes) = (args.array(core, "a")?, args.axes("axis")?);
        let keepdims = args.bool_or("keepdims", false)?;
        let ddof = args.usize_or("ddof", 0)?;
        let s = args.stream(core)?;
        one(core, |e| math::std(e, &a, axes.as_deref(), keepdims, ddof, &s))
    });

    for (name, op) in [("argmin", ArgReduceOp::ArgMin), ("argmax", ArgReduceOp::ArgMax)] {
        t.op(name, REDUCE_PARAMS, move |core, args| {
            let (a, axis) = (args.array(core, "a")?, args.axis("axis")?);
            let keepdims = args.bool_or("keepdims", false)?;
            let s = args.stream(core)?;
            one(core, |e| math::arg_reduce(e, op, &a, axis, keepdims, &s))
        });
    }

    // Scans
    for &(name, op) in SCAN {
        t.op(name, &["a", "axis", "reverse", "inclusive"], move |core, args| {
            let (a, axis) = (args.array(core, "a")?, args.axis("axis")?);
            let reverse = args.bool_or("reverse", false)?;
            let inclusive = args.bool_or("inclusive", true)?;
            let s = args.stream(core)?;
            one(core, |e| math::scan(e, op, &a, axis, reverse, inclusive, &s))
        });
    }
    t.op("softmax", &["a", "axis", "precise"], |core, args| {
        let (a, axes) = (args.array(core, "a")?, args.axes("axis")?);
        let precise = args.bool_or("precise", false)?;
        let s = args.stream(core)?;
        one(core, |e| math::softmax(e, &a, axes.as_deref(), precise, &s))
    });

    // Sorting
    t.op("sort", &["a", "axis"], |core, args| {
        let (a, axis) = (args.array(core, "a")?, args.axis("axis")?);
        let s = args.stream(core)?;
        one(core, |e| math::sort(e, &a, axis, &s))
    });
    t.op("argsort", &["a", "axis"], |core, args| {
        let (a, axis) = (args.array(core, "a")?, args.axis("axis")?);
        let s = args.stream(core)?;
        one(core, |e| math::argsort(e, &a, axis, &s))
    });
    for (name, arg) in [("partition", false), ("argpartition", true)] {
        t.op(name, &["a", "kth", "axis"], move |core, args| {
            let (a, kth) = (args.array(core, "a")?, args.int("kth")?);
            let axis = args.int_or("axis", -1)?;
            let s = args.stream(core)?;
            one(core, |e| math::partition(e, &a, kth, Some(axis), arg, &s))
        });
    }
    t.op("topk", &["a", "k", "axis"], |core, args| {
        let a = args.array(core, "a")?;
        let k = args.usize("k")?;
        if k == 0 {
            return Err(BridgeError::argument("topk: k must be positive"));
        }
        let axis = args.int_or("axis", -1)?;
        let s = args.stream(core)?;
        one(core, |e| math::topk(e, &a, k, Some(axis), &s))
    });
}
