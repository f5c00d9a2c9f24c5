//! Version, devices, streams, memory counters and Metal queries.
//!
//! None of these entries take a `stream:` keyword.

use std::path::PathBuf;

use indexmap::IndexMap;

use mlx_engine::{Device, InfoValue, MemoryLimit, MemoryStat};

use crate::args::Args;
use crate::convert;
use crate::core::Core;
use crate::dispatch::TableBuilder;
use crate::error::{BridgeError, BridgeResult};
use crate::handles::StreamContext;
use crate::value::{Hash, Value};

const STATS: &[(&str, MemoryStat)] = &[
    ("get_active_memory", MemoryStat::Active),
    ("get_peak_memory", MemoryStat::Peak),
    ("get_cache_memory", MemoryStat::Cache),
];

const LIMITS: &[(&str, MemoryLimit)] = &[
    ("set_memory_limit", MemoryLimit::Memory),
    ("set_cache_limit", MemoryLimit::Cache),
    ("set_wired_limit", MemoryLimit::Wired),
];

pub(crate) fn register(t: &mut TableBuilder) {
    t.admin("version", &[], |core, _| Ok(Value::str(core.engine().version())));
    t.admin("cpu", &[], |_, _| Ok(Value::Device(Device::cpu())));
    t.admin("gpu", &[], |_, _| Ok(Value::Device(Device::gpu())));
    t.admin("default_device", &[], |core, _| Ok(Value::Device(core.default_device())));
    t.admin("set_default_device", &["device"], |core, args| {
        let device = convert::to_device(args.required("device")?)?;
        core.set_default_device(device);
        Ok(Value::Nil)
    });
    t.admin("default_stream", &["device"], |core, args| {
        let device = match args.get("device") {
            None | Some(Value::Nil) => core.default_device(),
            Some(v) => convert::to_device(v)?,
        };
        Ok(Value::Stream(core.default_stream(device)))
    });
    t.admin("set_default_stream", &["stream"], |core, args| {
        let stream = convert::to_stream(core, args.required("stream")?)?;
        core.set_default_stream(stream);
        Ok(Value::Nil)
    });
    t.admin("new_stream", &["device"], |core, args| {
        let device = convert::to_device(args.required("device")?)?;
        core.run_engine(|e| e.new_stream(device)).map(Value::Stream)
    });
    t.admin("is_available", &["device"], |core, args| {
        let device = convert::to_device(args.required("device")?)?;
        Ok(Value::Bool(core.engine().is_available(device)))
    });
    t.admin("device_count", &["device_type"], |core, args| {
        let device = convert::to_device(args.required("device_type")?)?;
        Ok(Value::from(core.engine().device_count(device.kind)))
    });
    t.admin("device_info", &["device"], |core, args| {
        let device = match args.get("device") {
            None | Some(Value::Nil) => core.default_device(),
            Some(v) => convert::to_device(v)?,
        };
        core.run_engine(|e| e.device_info(device)).map(info_hash)
    });
    t.admin("stream", &["s", "block"], op_stream);
    t.admin("synchronize", &["stream"], |core, args| {
        let stream = match args.get("stream") {
            None | Some(Value::Nil) => None,
            Some(v) => Some(convert::to_stream(core, v)?),
        };
        core.release(move |e| e.synchronize(stream.as_ref()))?;
        Ok(Value::Nil)
    });

    // Memory
    for &(name, stat) in STATS {
        t.admin(name, &[], move |core, _| Ok(Value::from(core.engine().memory_stat(stat))));
    }
    t.admin("reset_peak_memory", &[], |core, _| {
        core.engine().reset_peak_memory();
        Ok(Value::Nil)
    });
    for &(name, limit) in LIMITS {
        t.admin(name, &["limit"], move |core, args| {
            let bytes = args.usize("limit")?;
            core.run_engine(|e| e.set_limit(limit, bytes)).map(Value::from)
        });
    }
    t.admin("clear_cache", &[], |core, _| {
        core.engine().clear_cache();
        Ok(Value::Nil)
    });

    // Metal
    t.admin("metal_is_available", &[], |core, _| Ok(Value::Bool(core.engine().metal_is_available())));
    t.admin("metal_device_info", &[], |core, _| core.run_engine(|e| e.metal_device_info()).map(info_hash));
    t.admin("metal_start_capture", &["path"], |core, args| {
        let path = PathBuf::from(args.text("path")?);
        core.run_engine(|e| e.metal_start_capture(&path))?;
        Ok(Value::Nil)
    });
    t.admin("metal_stop_capture", &[], |core, _| {
        core.run_engine(|e| e.metal_stop_capture())?;
        Ok(Value::Nil)
    });
}

fn info_hash(info: IndexMap<String, InfoValue>) -> Value {
    let hash = Hash::new();
    for (key, value) in info {
        let value = match value {
            InfoValue::Str(s) => Value::str(&s),
            InfoValue::Int(n) => Value::Int(i64::try_from(n).unwrap_or(i64::MAX)),
        };
        hash.insert(key, value);
    }
    Value::Hash(hash)
}

/// With a block, run it with the stream installed and return its value;
/// without one, return a context the host enters and exits itself
fn op_stream(core: &Core, args: &Args) -> BridgeResult<Value> {
    let stream = convert::to_stream(core, args.required("s")?)?;
    match args.get("block") {
        None | Some(Value::Nil) => Ok(Value::StreamContext(StreamContext::new(stream))),
        Some(Value::Proc(block)) => core.with_stream(stream, || block.call(&[])),
        Some(other) => Err(BridgeError::type_mismatch("Proc", other.type_name())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Proc;
    use mlx_cpu::CpuEngine;
    use mlx_engine::DeviceKind;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn core() -> Core {
        Core::new(Arc::new(CpuEngine::new()))
    }

    #[test]
    fn test_stream_block_restores_default() {
        let core = core();
        let before = core.current_stream();
        let inner = core.clone();
        let block = Value::from(Proc::new("block", move |_| Ok(Value::Stream(inner.current_stream()))));
        let seen = core.call("stream", vec![Value::sym("cpu"), block]).unwrap();
        assert_eq!(seen, Value::Stream(core.default_stream(Device::cpu())));
        assert_eq!(core.current_stream(), before);
    }

    #[test]
    fn test_stream_without_block_returns_context() {
        let core = core();
        let ctx = core.call("stream", vec![Value::Device(Device::cpu())]).unwrap();
        let Value::StreamContext(ctx) = ctx else { panic!("expected a stream context") };
        ctx.enter(&core).unwrap();
        assert!(ctx.enter(&core).unwrap_err().is_argument_error());
        ctx.exit(&core);
        assert!(!ctx.is_entered());
    }

    #[test]
    fn test_admin_entries_reject_stream_keyword() {
        let core = core();
        let kwargs = Value::hash([("stream", Value::sym("cpu"))]);
        assert!(core.call("get_active_memory", vec![kwargs]).is_err());
    }

    #[test]
    fn test_default_device_round_trip() {
        let core = core();
        let device = core.call("default_device", vec![]).unwrap();
        assert_eq!(device, Value::Device(Device::new(DeviceKind::Cpu, 0)));
        core.call("set_default_device", vec![Value::sym("cpu")]).unwrap();
        assert_eq!(core.default_device(), Device::cpu());
    }

    #[test]
    fn test_device_queries() {
        let core = core();
        assert_eq!(core.call("is_available", vec![Value::sym("cpu")]).unwrap(), Value::Bool(true));
        assert_eq!(core.call("is_available", vec![Value::sym("gpu")]).unwrap(), Value::Bool(false));
        assert_eq!(core.call("device_count", vec![Value::sym("cpu")]).unwrap(), Value::Int(1));
        assert_eq!(core.call("device_count", vec![Value::sym("gpu")]).unwrap(), Value::Int(0));
        let Value::Hash(info) = core.call("device_info", vec![]).unwrap() else { panic!("expected a hash") };
        assert_eq!(info.get("device_name"), Some(Value::str("cpu")));
        assert!(core.call("device_info", vec![Value::sym("gpu")]).is_err());
    }

    #[test]
    fn test_version_is_engine_version() {
        let core = core();
        let version = core.call("version", vec![]).unwrap();
        assert_eq!(version, Value::str(core.engine().version()));
    }

    #[test]
    fn test_metal_unavailable_on_cpu() {
        let core = core();
        assert_eq!(core.call("metal_is_available", vec![]).unwrap(), Value::Bool(false));
    }
}
