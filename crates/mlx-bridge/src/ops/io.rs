//! Array files: npy, safetensors and gguf.
//!
//! The format is taken from the `format` argument or the file extension.
//! Unknown extensions are an argument error; npz archives are recognized
//! but not implemented.

use std::path::PathBuf;

use indexmap::IndexMap;
use mlx_engine::{Array, FileFormat, Loaded, MetaValue};

use crate::args::Args;
use crate::convert;
use crate::core::Core;
use crate::dispatch::TableBuilder;
use crate::error::{BridgeError, BridgeResult};
use crate::value::{Hash, Value};

pub(crate) fn register(t: &mut TableBuilder) {
    t.op("load", &["file", "format", "return_metadata"], op_load);
    t.admin("save", &["file", "arr"], |core, args| {
        let path = with_extension(args.text("file")?, "npy");
        let a = args.array(core, "arr")?;
        core.release(move |e| e.save(&path, &a))?;
        Ok(Value::Nil)
    });
    for name in ["savez", "savez_compressed"] {
        t.admin(name, &["file", "*args", "**kwargs"], move |_, _| Err(BridgeError::not_implemented(name)));
    }
    t.admin("save_safetensors", &["file", "arrays", "metadata"], |core, args| {
        let path = with_extension(args.text("file")?, "safetensors");
        let arrays = named_arrays(core, args)?;
        let metadata = match args.get("metadata") {
            None | Some(Value::Nil) => IndexMap::new(),
            Some(v) => entries(v)?
                .into_iter()
                .map(|(k, v)| Ok((k, convert::to_text(&v)?)))
                .collect::<BridgeResult<_>>()?,
        };
        core.run_engine(|e| e.save_safetensors(&path, &arrays, &metadata))?;
        Ok(Value::Nil)
    });
    t.admin("save_gguf", &["file", "arrays", "metadata"], |core, args| {
        let path = with_extension(args.text("file")?, "gguf");
        let arrays = named_arrays(core, args)?;
        let metadata = match args.get("metadata") {
            None | Some(Value::Nil) => IndexMap::new(),
            Some(v) => entries(v)?
                .into_iter()
                .map(|(k, v)| Ok((k, meta_value(core, &v)?)))
                .collect::<BridgeResult<_>>()?,
        };
        core.run_engine(|e| e.save_gguf(&path, &arrays, &metadata))?;
        Ok(Value::Nil)
    });
}

fn op_load(core: &Core, args: &Args) -> BridgeResult<Value> {
    let path = PathBuf::from(args.text("file")?);
    let format = match args.get("format") {
        None | Some(Value::Nil) => FileFormat::from_path(&path).ok_or_else(|| {
            BridgeError::argument(format!("load: cannot infer the format of '{}'", path.display()))
        })?,
        Some(v) => {
            let name = convert::to_text(v)?;
            FileFormat::from_name(&name).ok_or_else(|| BridgeError::argument(format!("load: unknown format '{}'", name)))?
        }
    };
    if format == FileFormat::Npz {
        return Err(BridgeError::not_implemented("load npz"));
    }
    let return_metadata = args.bool_or("return_metadata", false)?;
    if return_metadata && !matches!(format, FileFormat::Safetensors | FileFormat::Gguf) {
        return Err(BridgeError::argument(format!(
            "load: metadata is only available for safetensors and gguf, not {}",
            format.name()
        )));
    }
    let s = args.stream(core)?;

    let loaded = if format == FileFormat::Npy {
        core.release(move |e| e.load(&path, format, &s))?
    } else {
        core.run_engine(|e| e.load(&path, format, &s))?
    };
    match loaded {
        Loaded::Single(a) => Ok(Value::from(a)),
        Loaded::Arrays { arrays, metadata } => {
            let arrays = Value::Hash(Hash::from_pairs(arrays.into_iter().map(|(k, a)| (k, Value::from(a)))));
            if !return_metadata {
                return Ok(arrays);
            }
            let metadata = Hash::from_pairs(metadata.into_iter().map(|(k, m)| (k, meta_to_value(m))));
            Ok(Value::list(vec![arrays, Value::Hash(metadata)]))
        }
    }
}

/// Append `ext` when the path has no extension of that name
fn with_extension(file: String, ext: &str) -> PathBuf {
    let path = PathBuf::from(file);
    if path.extension().and_then(|e| e.to_str()) == Some(ext) {
        path
    } else {
        let mut name = path.into_os_string();
        name.push(".");
        name.push(ext);
        PathBuf::from(name)
    }
}

fn entries(value: &Value) -> BridgeResult<Vec<(String, Value)>> {
    match value {
        Value::Hash(h) => Ok(h.entries().into_iter().map(|(k, v)| (k.to_string(), v)).collect()),
        other => Err(BridgeError::type_mismatch("Hash", other.type_name())),
    }
}

fn named_arrays(core: &Core, args: &Args) -> BridgeResult<IndexMap<String, Array>> {
    entries(args.required("arrays")?)?
        .into_iter()
        .map(|(k, v)| Ok((k, convert::to_array(core, &v, None)?)))
        .collect()
}

fn meta_value(core: &Core, value: &Value) -> BridgeResult<MetaValue> {
    match value {
        Value::Str(_) | Value::Symbol(_) => Ok(MetaValue::Str(convert::to_text(value)?)),
        Value::List(list) if list.to_vec().iter().all(|v| matches!(v, Value::Str(_) | Value::Symbol(_))) => {
            list.to_vec().iter().map(convert::to_text).collect::<BridgeResult<_>>().map(MetaValue::StrList)
        }
        other => convert::to_array(core, other, None).map(MetaValue::Array),
    }
}

fn meta_to_value(meta: MetaValue) -> Value {
    match meta {
        MetaValue::Str(s) => Value::str(&s),
        MetaValue::StrList(items) => Value::list(items.iter().map(|s| Value::str(s)).collect()),
        MetaValue::Array(a) => Value::from(a),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn core() -> Core {
        Core::new(Arc::new(CpuEngine::new()))
    }

    fn floats(values: &[f64]) -> Value {
        Value::list(values.iter().map(|&x| Value::Float(x)).collect())
    }

    #[test]
    fn test_npy_round_trip() {
        let core = core();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("weights");
        let file = file.to_str().unwrap();
        core.call("save", vec![Value::str(file), floats(&[1.0, 2.0])]).unwrap();
        let loaded = core.call("load", vec![Value::str(&format!("{}.npy", file))]).unwrap();
        assert_eq!(loaded.as_array().unwrap().to_a(&core).unwrap(), floats(&[1.0, 2.0]));
    }

    #[test]
    fn test_safetensors_with_metadata() {
        let core = core();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("model.safetensors");
        let file = file.to_str().unwrap();
        let arrays = Value::hash([("w", floats(&[0.5]))]);
        let metadata = Value::hash([("format", Value::str("mlx"))]);
        core.call("save_safetensors", vec![Value::str(file), arrays, metadata]).unwrap();

        let out = core.call("load", vec![Value::str(file), Value::Nil, Value::Bool(true)]).unwrap();
        let pair = out.as_list().unwrap();
        let arrays = pair.get(0).unwrap();
        assert!(arrays.as_hash().unwrap().contains_key("w"));
        assert_eq!(pair.get(1).unwrap().as_hash().unwrap().get("format"), Some(Value::str("mlx")));
    }

    #[test]
    fn test_unknown_extension_and_npz() {
        let core = core();
        let err = core.call("load", vec![Value::str("weights.bin")]).unwrap_err();
        assert!(err.is_argument_error());
        let err = core.call("load", vec![Value::str("weights.npz")]).unwrap_err();
        assert!(err.is_not_implemented());
        let err = core.call("savez", vec![Value::str("weights.npz")]).unwrap_err();
        assert!(err.is_not_implemented());
    }

    #[test]
    fn test_with_extension() {
        assert_eq!(with_extension("a.npy".into(), "npy"), PathBuf::from("a.npy"));
        assert_eq!(with_extension("a".into(), "npy"), PathBuf::from("a.npy"));
    }
}
