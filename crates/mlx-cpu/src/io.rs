//! Array file formats
//!
//! - `.npy` version 1.0 for single arrays (version 2 and 3 headers load too)
//! - `.safetensors` for named arrays with string metadata
//! - `.gguf` version 3 for named arrays with typed metadata
//!
//! Everything is little-endian. Readers take the whole file into memory.

use std::path::Path;

use indexmap::IndexMap;
use mlx_engine::{Dtype, EngineError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layout;
use crate::tensor::{from_bytes, to_bytes, Tensor};

#[derive(Error, Debug)]
pub enum FormatError {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Malformed(String),

    #[error("{0}")]
    Engine(#[from] EngineError),

    #[error("unsupported dtype {0}")]
    Dtype(String),
}

pub type FormatResult<T> = Result<T, FormatError>;

fn malformed(message: impl Into<String>) -> FormatError {
    FormatError::Malformed(message.into())
}

/// Cursor over a byte slice
struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> FormatResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.bytes.len());
        let end = end.ok_or_else(|| malformed("unexpected end of file"))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> FormatResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> FormatResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> FormatResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> FormatResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn len(&mut self) -> FormatResult<usize> {
        usize::try_from(self.u64()?).map_err(|_| malformed("length does not fit in memory"))
    }

    fn string(&mut self) -> FormatResult<String> {
        let n = self.len()?;
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec()).map_err(|_| malformed("string is not valid UTF-8"))
    }
}

// ============================================================================
// npy
// ============================================================================

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

fn npy_descr(dtype: Dtype) -> FormatResult<&'static str> {
    Ok(match dtype {
        Dtype::Bool => "|b1",
        Dtype::Uint8 => "|u1",
        Dtype::Uint16 => "<u2",
        Dtype::Uint32 => "<u4",
        Dtype::Uint64 => "<u8",
        Dtype::Int8 => "|i1",
        Dtype::Int16 => "<i2",
        Dtype::Int32 => "<i4",
        Dtype::Int64 => "<i8",
        Dtype::Float16 => "<f2",
        Dtype::Float32 => "<f4",
        Dtype::Float64 => "<f8",
        Dtype::Complex64 => "<c8",
        Dtype::Bfloat16 => return Err(FormatError::Dtype("bfloat16 cannot be saved as npy".into())),
    })
}

fn npy_dtype(descr: &str) -> FormatResult<Dtype> {
    let (order, code) = descr.split_at(descr.len().min(1));
    if order == ">" && !matches!(code, "b1" | "u1" | "i1") {
        return Err(malformed("big-endian npy files are not supported"));
    }
    Ok(match code {
        "b1" => Dtype::Bool,
        "u1" => Dtype::Uint8,
        "u2" => Dtype::Uint16,
        "u4" => Dtype::Uint32,
        "u8" => Dtype::Uint64,
        "i1" => Dtype::Int8,
        "i2" => Dtype::Int16,
        "i4" => Dtype::Int32,
        "i8" => Dtype::Int64,
        "f2" => Dtype::Float16,
        "f4" => Dtype::Float32,
        "f8" => Dtype::Float64,
        "c8" => Dtype::Complex64,
        _ => return Err(malformed(format!("unsupported array protocol type-string '{}'", descr))),
    })
}

/// Value of `key` in the header dict, up to the next top-level comma
fn header_field<'h>(header: &'h str, key: &str) -> FormatResult<&'h str> {
    let quoted = format!("'{}':", key);
    let start = header
        .find(&quoted)
        .map(|i| i + quoted.len())
        .ok_or_else(|| malformed(format!("npy header has no '{}' field", key)))?;
    let rest = header[start..].trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')').map(|i| i + 1)
    } else {
        rest.find([',', '}'])
    };
    Ok(rest[..end.unwrap_or(rest.len())].trim())
}

pub fn load_npy(path: &Path) -> FormatResult<Tensor> {
    let bytes = std::fs::read(path)?;
    let mut r = Reader::new(&bytes);
    if r.take(NPY_MAGIC.len())? != NPY_MAGIC {
        return Err(malformed("not an npy file"));
    }
    let [major, _minor] = r.array::<2>()?;
    let header_len = match major {
        1 => r.u16()? as usize,
        2 | 3 => r.u32()? as usize,
        v => return Err(malformed(format!("unsupported npy version {}", v))),
    };
    let header = std::str::from_utf8(r.take(header_len)?).map_err(|_| malformed("npy header is not text"))?;

    let descr = header_field(header, "descr")?.trim_matches('\'');
    let dtype = npy_dtype(descr)?;
    let fortran = header_field(header, "fortran_order")? == "True";
    let shape = header_field(header, "shape")?
        .trim_matches(|c| c == '(' || c == ')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<usize>().map_err(|_| malformed(format!("bad npy dimension '{}'", s))))
        .collect::<FormatResult<Vec<_>>>()?;

    let data = &bytes[r.pos..];
    if !fortran {
        return Ok(from_bytes("load", data, shape, dtype)?);
    }
    let reversed: Vec<usize> = shape.iter().rev().copied().collect();
    let t = from_bytes("load", data, reversed, dtype)?;
    let perm: Vec<usize> = (0..shape.len()).rev().collect();
    Ok(layout::transpose(&t, &perm)?)
}

pub fn save_npy(path: &Path, t: &Tensor) -> FormatResult<()> {
    let shape = match t.shape.as_slice() {
        [n] => format!("({},)", n),
        dims => format!("({})", dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")),
    };
    let mut header = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        npy_descr(t.dtype)?,
        shape
    );
    // magic, version and length take 10 bytes; the header ends in a newline
    let total = 10 + header.len() + 1;
    header.push_str(&" ".repeat((64 - total % 64) % 64));
    header.push('\n');

    let mut out = Vec::with_capacity(10 + header.len() + t.nbytes());
    out.extend_from_slice(NPY_MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&to_bytes(t));
    std::fs::write(path, out)?;
    Ok(())
}

// ============================================================================
// safetensors
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct SafetensorsEntry {
    dtype: String,
    shape: Vec<usize>,
    data_offsets: [usize; 2],
}

fn safetensors_code(dtype: Dtype) -> &'static str {
    match dtype {
        Dtype::Bool => "BOOL",
        Dtype::Uint8 => "U8",
        Dtype::Uint16 => "U16",
        Dtype::Uint32 => "U32",
        Dtype::Uint64 => "U64",
        Dtype::Int8 => "I8",
        Dtype::Int16 => "I16",
        Dtype::Int32 => "I32",
        Dtype::Int64 => "I64",
        Dtype::Float16 => "F16",
        Dtype::Bfloat16 => "BF16",
        Dtype::Float32 => "F32",
        Dtype::Float64 => "F64",
        Dtype::Complex64 => "C64",
    }
}

fn safetensors_dtype(code: &str) -> FormatResult<Dtype> {
    Ok(match code {
        "BOOL" => Dtype::Bool,
        // fp8 payloads load as raw bytes
        "U8" | "F8_E4M3" | "F8_E5M2" => Dtype::Uint8,
        "U16" => Dtype::Uint16,
        "U32" => Dtype::Uint32,
        "U64" => Dtype::Uint64,
        "I8" => Dtype::Int8,
        "I16" => Dtype::Int16,
        "I32" => Dtype::Int32,
        "I64" => Dtype::Int64,
        "F16" => Dtype::Float16,
        "BF16" => Dtype::Bfloat16,
        "F32" => Dtype::Float32,
        "F64" => Dtype::Float64,
        "C64" => Dtype::Complex64,
        other => return Err(FormatError::Dtype(format!("safetensors dtype {}", other))),
    })
}

pub type NamedTensors = IndexMap<String, Tensor>;

pub fn load_safetensors(path: &Path) -> FormatResult<(NamedTensors, IndexMap<String, String>)> {
    let bytes = std::fs::read(path)?;
    let mut r = Reader::new(&bytes);
    let header_len = r.len()?;
    let mut header: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(r.take(header_len)?).map_err(|e| malformed(format!("bad safetensors header: {}", e)))?;
    let data = &bytes[r.pos..];

    let metadata = match header.remove("__metadata__") {
        Some(value) => serde_json::from_value::<IndexMap<String, String>>(value)
            .map_err(|e| malformed(format!("bad safetensors metadata: {}", e)))?,
        None => IndexMap::new(),
    };
    let mut entries = header
        .into_iter()
        .map(|(name, value)| {
            serde_json::from_value::<SafetensorsEntry>(value)
                .map(|entry| (name.clone(), entry))
                .map_err(|e| malformed(format!("bad safetensors entry '{}': {}", name, e)))
        })
        .collect::<FormatResult<Vec<_>>>()?;
    entries.sort_by_key(|(_, entry)| entry.data_offsets[0]);

    let mut tensors = IndexMap::with_capacity(entries.len());
    for (name, entry) in entries {
        let [start, end] = entry.data_offsets;
        let raw = data
            .get(start..end)
            .ok_or_else(|| malformed(format!("tensor '{}' lies outside the file", name)))?;
        let dtype = safetensors_dtype(&entry.dtype)?;
        tensors.insert(name, from_bytes("load", raw, entry.shape, dtype)?);
    }
    Ok((tensors, metadata))
}

pub fn save_safetensors(path: &Path, tensors: &[(&str, &Tensor)], metadata: &IndexMap<String, String>) -> FormatResult<()> {
    let mut header = serde_json::Map::new();
    if !metadata.is_empty() {
        header.insert("__metadata__".into(), serde_json::to_value(metadata).map_err(|e| malformed(e.to_string()))?);
    }
    let mut data = Vec::new();
    for (name, t) in tensors {
        let start = data.len();
        data.extend_from_slice(&to_bytes(t));
        let entry = SafetensorsEntry {
            dtype: safetensors_code(t.dtype).into(),
            shape: t.shape.clone(),
            data_offsets: [start, data.len()],
        };
        header.insert((*name).to_string(), serde_json::to_value(entry).map_err(|e| malformed(e.to_string()))?);
    }
    let mut header = serde_json::to_vec(&header).map_err(|e| malformed(e.to_string()))?;
    header.resize(header.len().next_multiple_of(8), b' ');

    let mut out = Vec::with_capacity(8 + header.len() + data.len());
    out.extend_from_slice(&(header.len() as u64).to_le_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&data);
    std::fs::write(path, out)?;
    Ok(())
}

// ============================================================================
// gguf
// ============================================================================

const GGUF_MAGIC: &[u8] = b"GGUF";
const GGUF_VERSION: u32 = 3;
const GGUF_ALIGNMENT: usize = 32;

/// Typed gguf metadata
#[derive(Debug, Clone, PartialEq)]
pub enum Meta {
    Str(String),
    StrList(Vec<String>),
    /// Numeric scalar (rank 0) or list (rank 1)
    Tensor(Tensor),
}

mod kv {
    pub const U8: u32 = 0;
    pub const I8: u32 = 1;
    pub const U16: u32 = 2;
    pub const I16: u32 = 3;
    pub const U32: u32 = 4;
    pub const I32: u32 = 5;
    pub const F32: u32 = 6;
    pub const BOOL: u32 = 7;
    pub const STRING: u32 = 8;
    pub const ARRAY: u32 = 9;
    pub const U64: u32 = 10;
    pub const I64: u32 = 11;
    pub const F64: u32 = 12;
}

fn kv_dtype(ty: u32) -> Option<Dtype> {
    Some(match ty {
        kv::U8 => Dtype::Uint8,
        kv::I8 => Dtype::Int8,
        kv::U16 => Dtype::Uint16,
        kv::I16 => Dtype::Int16,
        kv::U32 => Dtype::Uint32,
        kv::I32 => Dtype::Int32,
        kv::F32 => Dtype::Float32,
        kv::BOOL => Dtype::Bool,
        kv::U64 => Dtype::Uint64,
        kv::I64 => Dtype::Int64,
        kv::F64 => Dtype::Float64,
        _ => return None,
    })
}

fn kv_type(dtype: Dtype) -> FormatResult<u32> {
    Ok(match dtype {
        Dtype::Uint8 => kv::U8,
        Dtype::Int8 => kv::I8,
        Dtype::Uint16 => kv::U16,
        Dtype::Int16 => kv::I16,
        Dtype::Uint32 => kv::U32,
        Dtype::Int32 => kv::I32,
        Dtype::Float32 => kv::F32,
        Dtype::Bool => kv::BOOL,
        Dtype::Uint64 => kv::U64,
        Dtype::Int64 => kv::I64,
        Dtype::Float64 => kv::F64,
        other => return Err(FormatError::Dtype(format!("{} in gguf metadata", other))),
    })
}

fn tensor_dtype(ty: u32) -> FormatResult<Dtype> {
    Ok(match ty {
        0 => Dtype::Float32,
        1 => Dtype::Float16,
        24 => Dtype::Int8,
        25 => Dtype::Int16,
        26 => Dtype::Int32,
        27 => Dtype::Int64,
        28 => Dtype::Float64,
        30 => Dtype::Bfloat16,
        other => return Err(FormatError::Dtype(format!("gguf tensor type {}", other))),
    })
}

fn tensor_type(dtype: Dtype) -> FormatResult<u32> {
    Ok(match dtype {
        Dtype::Float32 => 0,
        Dtype::Float16 => 1,
        Dtype::Int8 => 24,
        Dtype::Int16 => 25,
        Dtype::Int32 => 26,
        Dtype::Int64 => 27,
        Dtype::Float64 => 28,
        Dtype::Bfloat16 => 30,
        other => return Err(FormatError::Dtype(format!("{} in a gguf tensor", other))),
    })
}

fn read_meta(r: &mut Reader<'_>, ty: u32) -> FormatResult<Meta> {
    if ty == kv::STRING {
        return Ok(Meta::Str(r.string()?));
    }
    if ty == kv::ARRAY {
        let item = r.u32()?;
        let count = r.len()?;
        if item == kv::STRING {
            return (0..count).map(|_| r.string()).collect::<FormatResult<_>>().map(Meta::StrList);
        }
        let dtype = kv_dtype(item).ok_or_else(|| malformed(format!("unsupported gguf array item type {}", item)))?;
        let raw = r.take(count * dtype.size())?;
        return Ok(Meta::Tensor(from_bytes("load", raw, vec![count], dtype)?));
    }
    let dtype = kv_dtype(ty).ok_or_else(|| malformed(format!("unsupported gguf value type {}", ty)))?;
    Ok(Meta::Tensor(from_bytes("load", r.take(dtype.size())?, Vec::new(), dtype)?))
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u64).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_meta(out: &mut Vec<u8>, value: &Meta) -> FormatResult<()> {
    match value {
        Meta::Str(s) => {
            out.extend_from_slice(&kv::STRING.to_le_bytes());
            write_string(out, s);
        }
        Meta::StrList(items) => {
            out.extend_from_slice(&kv::ARRAY.to_le_bytes());
            out.extend_from_slice(&kv::STRING.to_le_bytes());
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for s in items {
                write_string(out, s);
            }
        }
        Meta::Tensor(t) if t.ndim() == 0 => {
            out.extend_from_slice(&kv_type(t.dtype)?.to_le_bytes());
            out.extend_from_slice(&to_bytes(t));
        }
        Meta::Tensor(t) if t.ndim() == 1 => {
            out.extend_from_slice(&kv::ARRAY.to_le_bytes());
            out.extend_from_slice(&kv_type(t.dtype)?.to_le_bytes());
            out.extend_from_slice(&(t.size() as u64).to_le_bytes());
            out.extend_from_slice(&to_bytes(t));
        }
        Meta::Tensor(t) => {
            return Err(malformed(format!("gguf metadata arrays must have rank 0 or 1, got {}", t.ndim())));
        }
    }
    Ok(())
}

pub fn load_gguf(path: &Path) -> FormatResult<(NamedTensors, IndexMap<String, Meta>)> {
    let bytes = std::fs::read(path)?;
    let mut r = Reader::new(&bytes);
    if r.take(4)? != GGUF_MAGIC {
        return Err(malformed("not a gguf file"));
    }
    let version = r.u32()?;
    if !(2..=GGUF_VERSION).contains(&version) {
        return Err(malformed(format!("unsupported gguf version {}", version)));
    }
    let tensor_count = r.len()?;
    let kv_count = r.len()?;

    let mut metadata = IndexMap::with_capacity(kv_count);
    let mut alignment = GGUF_ALIGNMENT;
    for _ in 0..kv_count {
        let key = r.string()?;
        let ty = r.u32()?;
        let value = read_meta(&mut r, ty)?;
        if key == "general.alignment" {
            if let Meta::Tensor(t) = &value {
                alignment = t.values().first().map_or(GGUF_ALIGNMENT, |&a| a as usize).max(1);
            }
            continue;
        }
        metadata.insert(key, value);
    }

    let mut infos = Vec::with_capacity(tensor_count);
    for _ in 0..tensor_count {
        let name = r.string()?;
        let ndim = r.u32()? as usize;
        let mut shape = (0..ndim).map(|_| r.len()).collect::<FormatResult<Vec<_>>>()?;
        shape.reverse();
        let dtype = tensor_dtype(r.u32()?)?;
        let offset = r.len()?;
        infos.push((name, shape, dtype, offset));
    }
    let data_start = r.pos.next_multiple_of(alignment);

    let mut tensors = IndexMap::with_capacity(infos.len());
    for (name, shape, dtype, offset) in infos {
        let size: usize = shape.iter().product::<usize>() * dtype.size();
        let start = data_start + offset;
        let raw = bytes
            .get(start..start + size)
            .ok_or_else(|| malformed(format!("tensor '{}' lies outside the file", name)))?;
        tensors.insert(name, from_bytes("load", raw, shape, dtype)?);
    }
    Ok((tensors, metadata))
}

pub fn save_gguf(path: &Path, tensors: &[(&str, &Tensor)], metadata: &IndexMap<String, Meta>) -> FormatResult<()> {
    let mut out = Vec::new();
    out.extend_from_slice(GGUF_MAGIC);
    out.extend_from_slice(&GGUF_VERSION.to_le_bytes());
    out.extend_from_slice(&(tensors.len() as u64).to_le_bytes());
    out.extend_from_slice(&(metadata.len() as u64).to_le_bytes());
    for (key, value) in metadata {
        write_string(&mut out, key);
        write_meta(&mut out, value)?;
    }

    let mut data = Vec::new();
    for (name, t) in tensors {
        let ty = tensor_type(t.dtype)?;
        write_string(&mut out, name);
        out.extend_from_slice(&(t.ndim() as u32).to_le_bytes());
        for d in t.shape.iter().rev() {
            out.extend_from_slice(&(*d as u64).to_le_bytes());
        }
        out.extend_from_slice(&ty.to_le_bytes());
        out.extend_from_slice(&(data.len() as u64).to_le_bytes());
        data.extend_from_slice(&to_bytes(t));
        data.resize(data.len().next_multiple_of(GGUF_ALIGNMENT), 0);
    }
    out.resize(out.len().next_multiple_of(GGUF_ALIGNMENT), 0);
    out.extend_from_slice(&data);
    std::fs::write(path, out)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn matrix(dtype: Dtype) -> Tensor {
        Tensor::real(vec![2, 3], dtype, vec![1.0, -2.0, 3.5, 0.0, 5.0, -6.25])
    }

    #[test]
    fn test_npy_header_is_aligned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.npy");
        save_npy(&path, &matrix(Dtype::Float32)).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..6], NPY_MAGIC);
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes.len(), 10 + header_len + 24);
        assert_eq!(load_npy(&path).unwrap(), matrix(Dtype::Float32));
    }

    #[test]
    fn test_npy_fortran_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.npy");
        let header = "{'descr': '<i4', 'fortran_order': True, 'shape': (2, 2), }";
        let mut out = NPY_MAGIC.to_vec();
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        for v in [1i32, 3, 2, 4] {
            out.extend_from_slice(&v.to_le_bytes());
        }
        std::fs::write(&path, out).unwrap();
        let t = load_npy(&path).unwrap();
        assert_eq!(t.values().to_vec(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_npy_rejects_complex128() {
        let err = npy_dtype("<c16").unwrap_err();
        assert!(err.to_string().contains("unsupported array protocol type-string"));
        assert!(npy_descr(Dtype::Bfloat16).is_err());
    }

    #[test]
    fn test_safetensors_keeps_order_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("w.safetensors");
        let a = matrix(Dtype::Bfloat16);
        let b = Tensor::real(vec![3], Dtype::Int64, vec![7.0, 8.0, 9.0]);
        let mut meta = IndexMap::new();
        meta.insert("note".to_string(), "ok".to_string());
        save_safetensors(&path, &[("z", &a), ("a", &b)], &meta).unwrap();

        let (tensors, metadata) = load_safetensors(&path).unwrap();
        assert_eq!(tensors.keys().collect::<Vec<_>>(), vec!["z", "a"]);
        assert_eq!(tensors["z"], a);
        assert_eq!(tensors["a"], b);
        assert_eq!(metadata["note"], "ok");
    }

    #[test]
    fn test_safetensors_fp8_loads_as_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f8.safetensors");
        let header = br#"{"t":{"dtype":"F8_E4M3","shape":[2],"data_offsets":[0,2]}}"#;
        let mut out = (header.len() as u64).to_le_bytes().to_vec();
        out.extend_from_slice(header);
        out.extend_from_slice(&[0x00, 0x7e]);
        std::fs::write(&path, out).unwrap();
        let (tensors, _) = load_safetensors(&path).unwrap();
        assert_eq!(tensors["t"].dtype, Dtype::Uint8);
        assert_eq!(tensors["t"].values().to_vec(), vec![0.0, 126.0]);
    }

    #[test]
    fn test_gguf_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.gguf");
        let a = matrix(Dtype::Float32);
        let b = Tensor::real(vec![2, 2], Dtype::Int32, vec![1.0, 1.0, 1.0, 1.0]);
        let mut meta = IndexMap::new();
        meta.insert("author".to_string(), Meta::Str("ruby".into()));
        meta.insert("tags".to_string(), Meta::StrList(vec!["a".into(), "b".into()]));
        meta.insert("layers".to_string(), Meta::Tensor(Tensor::scalar(12.0, Dtype::Uint32)));
        meta.insert("dims".to_string(), Meta::Tensor(Tensor::real(vec![2], Dtype::Float32, vec![0.5, 1.5])));
        save_gguf(&path, &[("a", &a), ("b", &b)], &meta).unwrap();

        let (tensors, metadata) = load_gguf(&path).unwrap();
        assert_eq!(tensors["a"], a);
        assert_eq!(tensors["b"], b);
        assert_eq!(metadata, meta);
    }

    #[test]
    fn test_gguf_rejects_unsigned_tensors() {
        let dir = tempfile::tempdir().unwrap();
        let t = Tensor::zeros(vec![2], Dtype::Uint32);
        let err = save_gguf(&dir.path().join("u.gguf"), &[("t", &t)], &IndexMap::new()).unwrap_err();
        assert!(matches!(err, FormatError::Dtype(_)));
    }
}
