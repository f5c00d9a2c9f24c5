//! Process groups and collectives.
//!
//! `group` is optional everywhere; nil runs on the global group.

use mlx_engine::{CollectiveOp, Group};

use super::one;
use crate::args::Args;
use crate::dispatch::TableBuilder;
use crate::error::{BridgeError, BridgeResult};
use crate::handles::GroupHandle;
use crate::value::Value;

const COLLECTIVES: &[(&str, CollectiveOp)] = &[
    ("all_sum", CollectiveOp::Sum),
    ("all_max", CollectiveOp::Max),
    ("all_min", CollectiveOp::Min),
    ("all_gather", CollectiveOp::Gather),
    ("sum_scatter", CollectiveOp::SumScatter),
];

pub(crate) fn register(t: &mut TableBuilder) {
    t.admin("distributed_is_available", &["backend"], |core, args| {
        let backend = args.text_or("backend", "any")?;
        Ok(Value::Bool(core.engine().distributed_is_available(&backend)))
    });
    t.admin("init", &["strict", "backend"], |core, args| {
        let strict = args.bool_or("strict", false)?;
        let backend = args.text_or("backend", "any")?;
        let group = core.run_engine(|e| e.init_distributed(strict, &backend))?;
        Ok(Value::Group(GroupHandle::new(group)))
    });
    t.alias("distributed_init", "init");

    for &(name, op) in COLLECTIVES {
        t.op(name, &["a", "group"], move |core, args| {
            let a = args.array(core, "a")?;
            let group = group_arg(args)?;
            let s = args.stream(core)?;
            one(core, |e| e.collective(op, &a, group.as_ref(), &s))
        });
    }
    t.op("send", &["a", "dst", "group"], |core, args| {
        let (a, dst) = (args.array(core, "a")?, args.usize("dst")?);
        let group = group_arg(args)?;
        let s = args.stream(core)?;
        one(core, |e| e.send(&a, dst, group.as_ref(), &s))
    });
    t.op("recv", &["shape", "dtype", "src", "group"], |core, args| {
        let (shape, dtype) = (args.shape("shape")?, args.dtype("dtype")?);
        let src = args.usize("src")?;
        let group = group_arg(args)?;
        let s = args.stream(core)?;
        one(core, |e| e.recv(&shape, dtype, src, group.as_ref(), &s))
    });
    t.op("recv_like", &["a", "src", "group"], |core, args| {
        let (a, src) = (args.array(core, "a")?, args.usize("src")?);
        let group = group_arg(args)?;
        let s = args.stream(core)?;
        one(core, |e| e.recv(a.shape(), a.dtype(), src, group.as_ref(), &s))
    });
}

fn group_arg(args: &Args) -> BridgeResult<Option<Group>> {
    match args.get("group") {
        None | Some(Value::Nil) => Ok(None),
        Some(Value::Group(g)) => Ok(g.group().cloned()),
        Some(other) => Err(BridgeError::type_mismatch("Group", other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use crate::core::Core;
    use crate::value::Value;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn core() -> Core {
        Core::new(Arc::new(CpuEngine::new()))
    }

    #[test]
    fn test_single_process_group() {
        let core = core();
        let group = core.call("init", vec![]).unwrap();
        let Value::Group(handle) = &group else { panic!("expected a group") };
        assert_eq!(handle.rank(&core).unwrap(), 0);
        assert_eq!(handle.size(&core).unwrap(), 1);
    }

    #[test]
    fn test_all_sum_identity_on_one_process() {
        let core = core();
        let a = Value::list(vec![Value::Float(1.0), Value::Float(2.0)]);
        let out = core.call("all_sum", vec![a.clone()]).unwrap();
        assert_eq!(out.as_array().unwrap().to_a(&core).unwrap(), a);
    }

    #[test]
    fn test_group_type_checked() {
        let core = core();
        let err = core.call("all_max", vec![Value::Float(1.0), Value::Int(3)]).unwrap_err();
        assert!(err.is_type_error());
    }
}
